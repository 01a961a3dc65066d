// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::fmt::{self, Display};
use std::io;

/// Represent the types of errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A packet could not be decoded from the byte stream.
    MalformedPacket,

    /// A packet decoded but is illegal in the current state, or a field
    /// value cannot be put on the wire.
    ProtocolError,

    /// The server rejected the connect handshake with this reason code.
    ConnectionRefused(u8),

    /// The server closed the session with a disconnect packet carrying
    /// this reason code.
    ServerDisconnected(u8),

    /// Transport read or write failed.
    IoError,

    /// A caller or internal deadline elapsed.
    Timeout,

    /// Flow-control admission wait exceeded its deadline.
    FlowControlTimeout,

    /// No packet was received for 1.5 times the keep-alive interval.
    KeepAliveTimeout,

    /// Operation requires an established connection.
    NotConnected,

    /// All 65535 packet ids are outstanding.
    NoPacketIdAvailable,

    /// Session persistence failed.
    SessionStoreError,
}

/// Error type of the client.
#[derive(Debug, Clone)]
pub struct Error {
    /// Type of current error.
    kind: ErrorKind,

    /// Detail message about this error.
    message: String,
}

impl Error {
    #[must_use]
    pub fn new(kind: ErrorKind, message: &str) -> Self {
        Self {
            kind,
            message: message.to_owned(),
        }
    }

    #[must_use]
    pub fn from_string(kind: ErrorKind, message: String) -> Self {
        Self { kind, message }
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::from_string(ErrorKind::IoError, format!("IoError {err}"))
    }
}

impl From<codec::DecodeError> for Error {
    fn from(err: codec::DecodeError) -> Self {
        Self::from_string(
            ErrorKind::MalformedPacket,
            format!("Failed to decode packet: {err:?}"),
        )
    }
}

impl From<codec::EncodeError> for Error {
    fn from(err: codec::EncodeError) -> Self {
        Self::from_string(
            ErrorKind::ProtocolError,
            format!("Failed to encode packet: {err:?}"),
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::from_string(
            ErrorKind::SessionStoreError,
            format!("Session document error: {err}"),
        )
    }
}

impl From<codec::TopicError> for Error {
    fn from(err: codec::TopicError) -> Self {
        Self::from_string(
            ErrorKind::ProtocolError,
            format!("Invalid topic: {err:?}"),
        )
    }
}
