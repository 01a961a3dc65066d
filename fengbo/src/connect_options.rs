// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use codec::utils::random_string;
use codec::v5::Properties;
use codec::{ProtocolLevel, QoS};
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use crate::reconnect::ReconnectOptions;
use crate::session_store::SessionStore;
use crate::stream::TlsType;

/// Will message registered at connect time.
#[derive(Debug, Clone)]
pub struct WillOptions {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,

    /// Will properties, MQTT 5.0 only.
    pub properties: Option<Properties>,
}

/// Immutable client configuration.
///
/// Every `with_*` derivation consumes the value and returns the derived
/// one; callers keep a clone when they need the original.
#[derive(Clone)]
pub struct ConnectOptions {
    host: String,
    port: u16,
    protocol_level: ProtocolLevel,
    client_id: String,
    keep_alive: Duration,
    clean_session: bool,
    username: Option<String>,
    password: Option<Vec<u8>>,
    tls: Option<TlsType>,
    will: Option<WillOptions>,
    session_expiry: Option<u32>,
    reconnect: Option<ReconnectOptions>,
    topic_alias_maximum: u16,
    receive_maximum: u16,
    message_filters: Vec<String>,
    connect_timeout: Duration,
    session_store: Option<Rc<dyn SessionStore>>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            protocol_level: ProtocolLevel::V311,
            client_id: random_string(8),
            keep_alive: Duration::from_secs(60),
            clean_session: true,
            username: None,
            password: None,
            tls: None,
            will: None,
            session_expiry: None,
            reconnect: None,
            topic_alias_maximum: 0,
            receive_maximum: u16::MAX,
            message_filters: Vec::new(),
            connect_timeout: Duration::from_secs(10),
            session_store: None,
        }
    }
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("protocol_level", &self.protocol_level)
            .field("client_id", &self.client_id)
            .field("keep_alive", &self.keep_alive)
            .field("clean_session", &self.clean_session)
            .field("tls", &self.tls)
            .field("session_expiry", &self.session_expiry)
            .field("reconnect", &self.reconnect)
            .field("topic_alias_maximum", &self.topic_alias_maximum)
            .field("receive_maximum", &self.receive_maximum)
            .field("message_filters", &self.message_filters)
            .field("has_session_store", &self.session_store.is_some())
            .finish()
    }
}

impl ConnectOptions {
    /// Create options targeting `host:port` with defaults everywhere
    /// else.
    #[must_use]
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            ..Self::default()
        }
    }

    /// Derive options targeting another host.
    #[must_use]
    pub fn with_host(mut self, host: &str) -> Self {
        self.host = host.to_string();
        self
    }

    /// Derive options targeting another port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Derive options speaking `protocol_level` on the wire.
    #[must_use]
    pub fn with_protocol_level(mut self, protocol_level: ProtocolLevel) -> Self {
        self.protocol_level = protocol_level;
        self
    }

    /// Derive options with a fixed client id; an empty id asks an MQTT
    /// 5.0 server to assign one.
    #[must_use]
    pub fn with_client_id(mut self, client_id: &str) -> Self {
        self.client_id = client_id.to_string();
        self
    }

    /// Derive options with another keep-alive interval; zero disables
    /// keep-alive probing.
    #[must_use]
    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Derive options with the clean-session (clean-start) flag set to
    /// `clean_session`.
    #[must_use]
    pub fn with_clean_session(mut self, clean_session: bool) -> Self {
        self.clean_session = clean_session;
        self
    }

    /// Derive options authenticating with `username` and an optional
    /// password.
    #[must_use]
    pub fn with_credentials(mut self, username: &str, password: Option<&[u8]>) -> Self {
        self.username = Some(username.to_string());
        self.password = password.map(<[u8]>::to_vec);
        self
    }

    /// Derive options wrapping the connection in TLS.
    #[must_use]
    pub fn with_tls(mut self, tls: TlsType) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Derive options registering a will message.
    #[must_use]
    pub fn with_will(mut self, will: WillOptions) -> Self {
        self.will = Some(will);
        self
    }

    /// Derive options requesting `seconds` of session expiry (MQTT 5.0
    /// only); when absent the property is omitted from the connect
    /// packet.
    #[must_use]
    pub fn with_session_expiry(mut self, seconds: u32) -> Self {
        self.session_expiry = Some(seconds);
        self
    }

    /// Derive options turning the automatic reconnect loop on.
    #[must_use]
    pub fn with_auto_reconnect(mut self, reconnect: ReconnectOptions) -> Self {
        self.reconnect = Some(reconnect);
        self
    }

    /// Derive options allowing up to `maximum` outbound topic aliases;
    /// zero disables aliasing.
    #[must_use]
    pub fn with_topic_alias_maximum(mut self, maximum: u16) -> Self {
        self.topic_alias_maximum = maximum;
        self
    }

    /// Derive options bounding concurrent QoS 1/2 exchanges to
    /// `receive_maximum`; zero is coerced to 1.
    #[must_use]
    pub fn with_receive_maximum(mut self, receive_maximum: u16) -> Self {
        self.receive_maximum = receive_maximum.max(1);
        self
    }

    /// Derive options delivering only messages whose topic matches at
    /// least one of `filters`; an empty list delivers everything.
    #[must_use]
    pub fn with_message_filters(mut self, filters: Vec<String>) -> Self {
        self.message_filters = filters;
        self
    }

    /// Derive options with another connect handshake deadline.
    #[must_use]
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Derive options persisting session state through `store`.
    #[must_use]
    pub fn with_session_store(mut self, store: Rc<dyn SessionStore>) -> Self {
        self.session_store = Some(store);
        self
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub const fn protocol_level(&self) -> ProtocolLevel {
        self.protocol_level
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[must_use]
    pub const fn keep_alive(&self) -> Duration {
        self.keep_alive
    }

    #[must_use]
    pub const fn clean_session(&self) -> bool {
        self.clean_session
    }

    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    #[must_use]
    pub fn password(&self) -> Option<&[u8]> {
        self.password.as_deref()
    }

    #[must_use]
    pub const fn tls(&self) -> Option<&TlsType> {
        self.tls.as_ref()
    }

    #[must_use]
    pub const fn will(&self) -> Option<&WillOptions> {
        self.will.as_ref()
    }

    #[must_use]
    pub const fn session_expiry(&self) -> Option<u32> {
        self.session_expiry
    }

    #[must_use]
    pub const fn reconnect(&self) -> Option<&ReconnectOptions> {
        self.reconnect.as_ref()
    }

    #[must_use]
    pub const fn topic_alias_maximum(&self) -> u16 {
        self.topic_alias_maximum
    }

    #[must_use]
    pub const fn receive_maximum(&self) -> u16 {
        self.receive_maximum
    }

    #[must_use]
    pub fn message_filters(&self) -> &[String] {
        &self.message_filters
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    #[must_use]
    pub fn session_store(&self) -> Option<Rc<dyn SessionStore>> {
        self.session_store.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_client_id_is_random() {
        let a = ConnectOptions::default();
        let b = ConnectOptions::default();
        assert_eq!(a.client_id().len(), 8);
        assert_ne!(a.client_id(), b.client_id());
    }

    #[test]
    fn test_with_derivations_leave_original_unchanged() {
        let base = ConnectOptions::new("broker.example", 1883);
        let derived = base
            .clone()
            .with_port(8883)
            .with_clean_session(false)
            .with_receive_maximum(16);
        assert_eq!(base.port(), 1883);
        assert!(base.clean_session());
        assert_eq!(derived.port(), 8883);
        assert!(!derived.clean_session());
        assert_eq!(derived.receive_maximum(), 16);
    }

    #[test]
    fn test_receive_maximum_never_zero() {
        let options = ConnectOptions::default().with_receive_maximum(0);
        assert_eq!(options.receive_maximum(), 1);
    }
}
