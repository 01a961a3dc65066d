// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! MQTT client library speaking protocol 3.1, 3.1.1 and 5.0 over TCP
//! or TLS, with QoS 0/1/2 delivery, receive-maximum flow control,
//! topic aliases, automatic reconnect and file-backed session
//! persistence.

mod client;
mod client_inner;
mod connect_options;
mod error;
mod events;
mod flow_control;
mod message;
mod packet_id;
mod reconnect;
mod session;
mod session_store;
mod status;
mod stream;
mod topic_alias;

pub use client::{Client, ConnectResult};
pub use connect_options::{ConnectOptions, WillOptions};
pub use error::{Error, ErrorKind};
pub use events::{ClientEvent, EventCallback};
pub use flow_control::FlowControl;
pub use message::{PublishMessage, PublishOptions};
pub use packet_id::PacketIdAllocator;
pub use reconnect::ReconnectOptions;
pub use session::{SessionState, SubscriptionEntry};
pub use session_store::{file_name, FileSessionStore, SessionStore};
pub use status::ClientStatus;
pub use stream::{SelfSignedTls, Stream, TlsType, Transport, TransportError};
pub use topic_alias::{AliasState, TopicAliasMap};
