// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use codec::v5::Properties;
use codec::QoS;
use std::time::Duration;

/// Application message delivered to the message handler.
#[derive(Debug, Clone)]
pub struct PublishMessage {
    /// Topic the message was published on, after topic-alias
    /// resolution.
    pub topic: String,

    /// Delivery QoS of this transmission.
    pub qos: QoS,

    /// Retain flag as forwarded by the server.
    pub retain: bool,

    /// Set when this transmission might be a redelivery.
    pub dup: bool,

    /// Raw message payload.
    pub payload: Vec<u8>,

    /// Publish properties, MQTT 5.0 connections only.
    pub properties: Option<Properties>,
}

/// Per-publish parameters.
#[derive(Debug, Default, Clone)]
pub struct PublishOptions {
    qos: QoS,
    retain: bool,
    properties: Option<Properties>,
    admission_timeout: Option<Duration>,
}

impl PublishOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive options with `qos`.
    #[must_use]
    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    /// Derive options with the retain flag set to `retain`.
    #[must_use]
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    /// Derive options carrying publish `properties` (MQTT 5.0 only).
    #[must_use]
    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = Some(properties);
        self
    }

    /// Derive options with a flow-control admission deadline other than
    /// the 5 second default.
    #[must_use]
    pub fn with_admission_timeout(mut self, timeout: Duration) -> Self {
        self.admission_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub const fn qos(&self) -> QoS {
        self.qos
    }

    #[must_use]
    pub const fn retain(&self) -> bool {
        self.retain
    }

    #[must_use]
    pub const fn properties(&self) -> Option<&Properties> {
        self.properties.as_ref()
    }

    #[must_use]
    pub const fn admission_timeout(&self) -> Option<Duration> {
        self.admission_timeout
    }
}
