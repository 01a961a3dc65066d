// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use codec::v5::DisconnectPacket;

/// Out-of-band events the connection reports to an observer.
///
/// Delivery is synchronous inside the client's execution context and
/// ordered with packet arrival.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The server sent a disconnect packet.
    ServerDisconnect {
        /// The packet as received, reason code and properties included.
        packet: DisconnectPacket,

        /// True when the client will try to reconnect on its own.
        will_reconnect: bool,
    },
}

/// Observer callback registered through `Client::on_event`.
pub type EventCallback = Box<dyn FnMut(&ClientEvent)>;
