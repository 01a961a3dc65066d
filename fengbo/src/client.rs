// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use codec::v5::{Properties, ReasonCode, SubscribeOptions};
use std::fmt;
use std::time::Duration;

use crate::client_inner::ClientInner;
pub use crate::client_inner::ConnectResult;
use crate::connect_options::ConnectOptions;
use crate::error::Error;
use crate::events::ClientEvent;
use crate::message::{PublishMessage, PublishOptions};
use crate::status::ClientStatus;
use crate::stream::Transport;

/// Synchronous MQTT client for protocol 3.1, 3.1.1 and 5.0.
///
/// All calls run on the caller's execution context; the client owns
/// its connection state exclusively and is not meant to be shared
/// between threads.
pub struct Client {
    inner: ClientInner,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Client")
            .field("options", self.inner.options())
            .field("status", &self.inner.status())
            .finish()
    }
}

impl Client {
    /// Create a new mqtt client.
    ///
    /// No packet is sent to the server before calling [`Self::connect`].
    #[must_use]
    pub fn new(options: ConnectOptions) -> Self {
        Self {
            inner: ClientInner::new(options),
        }
    }

    /// Get mqtt connection options.
    #[must_use]
    pub fn options(&self) -> &ConnectOptions {
        self.inner.options()
    }

    /// Get current status.
    #[must_use]
    pub fn status(&self) -> ClientStatus {
        self.inner.status()
    }

    /// Get the effective client id; on MQTT 5.0 connections the server
    /// may have assigned it.
    #[must_use]
    pub fn client_id(&self) -> &str {
        self.inner.client_id()
    }

    /// Get number of QoS 1/2 publishes currently in flight.
    #[must_use]
    pub fn inflight(&self) -> usize {
        self.inner.inflight()
    }

    /// Connect to the server configured in the options.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionRefused` with the server's reason code when
    /// the handshake is rejected, `Io`/`Timeout` on transport trouble.
    pub fn connect(&mut self) -> Result<ConnectResult, Error> {
        self.inner.connect()
    }

    /// Run the handshake over a caller-supplied byte-stream transport
    /// instead of the built-in TCP/TLS stream.
    ///
    /// # Errors
    ///
    /// Same as [`Self::connect`].
    pub fn connect_with_transport(
        &mut self,
        transport: Box<dyn Transport>,
    ) -> Result<ConnectResult, Error> {
        self.inner.connect_with_transport(transport)
    }

    /// Publish `payload` on `topic`.
    ///
    /// Returns the packet id of the QoS 1/2 exchange, or 0 for QoS 0.
    /// The call blocks cooperatively while flow control is saturated,
    /// up to the admission timeout.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected`, `FlowControlTimeout`,
    /// `NoPacketIdAvailable` or a transport error.
    pub fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        options: &PublishOptions,
    ) -> Result<u16, Error> {
        self.inner.publish(topic, payload, options)
    }

    /// Subscribe to one topic filter; shorthand over
    /// [`Self::subscribe_many`].
    ///
    /// # Errors
    ///
    /// Returns `NotConnected`, `Timeout` or a transport error.
    pub fn subscribe(
        &mut self,
        filter: &str,
        options: SubscribeOptions,
    ) -> Result<Vec<u8>, Error> {
        self.subscribe_many(&[(filter.to_string(), options)])
    }

    /// Subscribe to several topic filters at once and wait for the
    /// acknowledgement; returns one reason code per filter in request
    /// order.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected`, `Timeout` or a transport error.
    pub fn subscribe_many(
        &mut self,
        entries: &[(String, SubscribeOptions)],
    ) -> Result<Vec<u8>, Error> {
        self.inner.subscribe(entries)
    }

    /// Unsubscribe from `filters`; returns one reason code per filter
    /// (all zero on 3.1.1 connections).
    ///
    /// # Errors
    ///
    /// Returns `NotConnected`, `Timeout` or a transport error.
    pub fn unsubscribe(&mut self, filters: &[String]) -> Result<Vec<u8>, Error> {
        self.inner.unsubscribe(filters)
    }

    /// Send the disconnect packet, persist session state and close the
    /// transport.
    ///
    /// # Errors
    ///
    /// Returns `Io` when the final write fails; the transport is
    /// released either way.
    pub fn disconnect(&mut self) -> Result<(), Error> {
        self.inner.disconnect(None)
    }

    /// Disconnect with an explicit reason code and properties,
    /// MQTT 5.0 only.
    ///
    /// # Errors
    ///
    /// Same as [`Self::disconnect`].
    pub fn disconnect_with_reason(
        &mut self,
        reason_code: ReasonCode,
        properties: Properties,
    ) -> Result<(), Error> {
        self.inner.disconnect(Some((reason_code, properties)))
    }

    /// Register the handler inbound messages are dispatched to.
    ///
    /// Without a handler, messages queue up for [`Self::await_message`].
    pub fn on_message<F>(&mut self, callback: F)
    where
        F: FnMut(&PublishMessage) + 'static,
    {
        self.inner.set_message_callback(Box::new(callback));
    }

    /// Register the observer of connection events such as a server
    /// initiated disconnect.
    pub fn on_event<F>(&mut self, callback: F)
    where
        F: FnMut(&ClientEvent) + 'static,
    {
        self.inner.set_event_callback(Box::new(callback));
    }

    /// Wait up to `timeout` for the next inbound message; `None` means
    /// the deadline passed quietly.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` when the connection ends while waiting.
    pub fn await_message(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<PublishMessage>, Error> {
        self.inner.await_message(timeout)
    }

    /// Process inbound traffic until the connection ends, feeding
    /// `handler` with every delivered message and sleeping `idle_sleep`
    /// between polls of an idle connection.
    ///
    /// # Errors
    ///
    /// Propagates connection errors that the reconnect policy could
    /// not absorb.
    pub fn run<F>(&mut self, handler: F, idle_sleep: Duration) -> Result<(), Error>
    where
        F: FnMut(&PublishMessage) + 'static,
    {
        self.inner.set_message_callback(Box::new(handler));
        self.inner.run(idle_sleep)
    }
}
