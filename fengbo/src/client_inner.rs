// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use codec::v5::{Properties, Property, ReasonCode, SubscribeOptions};
use codec::{
    v3, v5, ByteArray, DecodePacket, EncodePacket, PacketId, ProtocolLevel, QoS, TopicFilter,
    U16Data, U32Data,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread;
use std::time::{Duration, Instant};

use crate::connect_options::ConnectOptions;
use crate::error::{Error, ErrorKind};
use crate::events::{ClientEvent, EventCallback};
use crate::flow_control::FlowControl;
use crate::message::{PublishMessage, PublishOptions};
use crate::packet_id::PacketIdAllocator;
use crate::session::{SessionState, SubscriptionEntry};
use crate::status::ClientStatus;
use crate::stream::{Stream, Transport, TransportError};
use crate::topic_alias::TopicAliasMap;

/// Poll granularity of cooperative waits.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Default deadline of flow-control admission.
const DEFAULT_ADMISSION_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline of the remainder of a packet once its first byte arrived,
/// and of outbound writes.
const IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline of a subscribe or unsubscribe acknowledgement.
const ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of the connect handshake.
#[derive(Debug, Clone)]
pub struct ConnectResult {
    /// Server kept a previous session for this client id.
    pub session_present: bool,

    /// Raw connect reason code (v5) or return code (3.1.1); zero is
    /// success.
    pub reason_code: u8,

    /// Connect acknowledgement properties, MQTT 5.0 only.
    pub properties: Option<Properties>,
}

/// Outbound publish kept for a possible DUP retransmission.
#[derive(Debug, Clone)]
struct PublishRequest {
    topic: String,
    payload: Vec<u8>,
    retain: bool,
    properties: Option<Properties>,
}

/// Outbound QoS 2 delivery state.
#[derive(Debug, Clone)]
enum Qos2State {
    /// Publish sent, waiting for the receive acknowledgement. The
    /// request is kept for retransmission.
    AwaitingReceived(PublishRequest),

    /// Release sent, waiting for the completion; only the release can
    /// be replayed from here on.
    AwaitingComplete,
}

type MessageCallback = Box<dyn FnMut(&PublishMessage)>;

/// Connection manager shared by both protocol revisions.
///
/// All state lives in one place and is driven from the caller's
/// execution context; version differences are confined to the
/// encode/decode shims at the bottom of this file.
pub(crate) struct ClientInner {
    options: ConnectOptions,
    status: ClientStatus,
    transport: Option<Box<dyn Transport>>,

    /// Effective client id; a v5 server may assign one.
    client_id: String,

    /// Effective keep alive; a v5 server may override it.
    keep_alive: Duration,
    last_write: Instant,
    last_read: Instant,

    packet_ids: PacketIdAllocator,
    flow: FlowControl,
    alias_out: TopicAliasMap,
    alias_in: TopicAliasMap,
    maximum_packet_size: Option<u32>,

    session: SessionState,
    pending_qos1: HashMap<u16, PublishRequest>,
    pending_qos2: HashMap<u16, Qos2State>,
    inbound_qos2: HashSet<u16>,

    pending_suback: HashMap<u16, Vec<(String, SubscribeOptions)>>,
    suback_results: HashMap<u16, Vec<u8>>,
    pending_unsuback: HashMap<u16, Vec<String>>,
    unsuback_results: HashMap<u16, Vec<u8>>,

    filters: Vec<TopicFilter>,
    inbox: VecDeque<PublishMessage>,
    on_message: Option<MessageCallback>,
    on_event: Option<EventCallback>,

    reconnect_attempts: u32,
}

impl ClientInner {
    pub fn new(options: ConnectOptions) -> Self {
        let mut filters = Vec::new();
        for pattern in options.message_filters() {
            match TopicFilter::parse(pattern) {
                Ok(filter) => filters.push(filter),
                Err(err) => {
                    log::error!("client: dropping invalid message filter `{pattern}`: {err:?}");
                }
            }
        }
        Self {
            client_id: options.client_id().to_string(),
            keep_alive: options.keep_alive(),
            status: ClientStatus::Disconnected,
            transport: None,
            last_write: Instant::now(),
            last_read: Instant::now(),
            packet_ids: PacketIdAllocator::new(),
            flow: FlowControl::new(options.receive_maximum()),
            alias_out: TopicAliasMap::new(options.topic_alias_maximum()),
            alias_in: TopicAliasMap::new(options.topic_alias_maximum()),
            maximum_packet_size: None,
            session: SessionState::new(),
            pending_qos1: HashMap::new(),
            pending_qos2: HashMap::new(),
            inbound_qos2: HashSet::new(),
            pending_suback: HashMap::new(),
            suback_results: HashMap::new(),
            pending_unsuback: HashMap::new(),
            unsuback_results: HashMap::new(),
            filters,
            inbox: VecDeque::new(),
            on_message: None,
            on_event: None,
            reconnect_attempts: 0,
            options,
        }
    }

    pub const fn status(&self) -> ClientStatus {
        self.status
    }

    pub const fn options(&self) -> &ConnectOptions {
        &self.options
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn inflight(&self) -> usize {
        self.flow.len()
    }

    pub fn set_message_callback(&mut self, callback: MessageCallback) {
        self.on_message = Some(callback);
    }

    pub fn set_event_callback(&mut self, callback: EventCallback) {
        self.on_event = Some(callback);
    }

    // ---- connection lifecycle -------------------------------------

    /// Open a TCP/TLS stream per the options and run the handshake.
    pub fn connect(&mut self) -> Result<ConnectResult, Error> {
        let stream = Stream::connect(
            self.options.host(),
            self.options.port(),
            self.options.tls(),
            self.options.connect_timeout(),
        )?;
        self.connect_with_transport(Box::new(stream))
    }

    /// Run the handshake over a caller-supplied transport.
    pub fn connect_with_transport(
        &mut self,
        transport: Box<dyn Transport>,
    ) -> Result<ConnectResult, Error> {
        if self.status == ClientStatus::Connected || self.status == ClientStatus::Connecting {
            return Err(Error::new(
                ErrorKind::ProtocolError,
                "connect called on an active connection",
            ));
        }
        self.status = ClientStatus::Connecting;
        self.transport = Some(transport);
        self.client_id = self.options.client_id().to_string();
        self.keep_alive = self.options.keep_alive();
        self.maximum_packet_size = None;
        self.alias_out = TopicAliasMap::new(self.options.topic_alias_maximum());
        self.alias_in = TopicAliasMap::new(self.options.topic_alias_maximum());
        self.flow.set_maximum(self.options.receive_maximum());

        match self.handshake() {
            Ok(result) => Ok(result),
            Err(err) => {
                self.close_transport();
                self.status = ClientStatus::Disconnected;
                Err(err)
            }
        }
    }

    fn handshake(&mut self) -> Result<ConnectResult, Error> {
        let connect_bytes = self.encode_connect()?;
        self.send_bytes(&connect_bytes)?;

        let Some(ack_bytes) = self.read_packet(self.options.connect_timeout())? else {
            return Err(Error::new(
                ErrorKind::Timeout,
                "No connect acknowledgement within the connect timeout",
            ));
        };
        let result = self.process_connect_ack(&ack_bytes)?;

        self.restore_session(result.session_present)?;

        self.status = ClientStatus::Connected;
        self.reconnect_attempts = 0;
        self.last_read = Instant::now();
        self.last_write = Instant::now();

        self.replay_pending()?;
        log::info!(
            "client: connected to {}:{} as `{}`",
            self.options.host(),
            self.options.port(),
            self.client_id
        );
        Ok(result)
    }

    fn process_connect_ack(&mut self, bytes: &[u8]) -> Result<ConnectResult, Error> {
        match self.options.protocol_level() {
            ProtocolLevel::V31 | ProtocolLevel::V311 => {
                let mut ba = ByteArray::new(bytes);
                let ack = v3::ConnectAckPacket::decode(&mut ba).map_err(|err| {
                    Error::from_string(
                        ErrorKind::ProtocolError,
                        format!("Expected connect acknowledgement, got {err:?}"),
                    )
                })?;
                let code = ack.return_code() as u8;
                if !ack.return_code().is_accepted() {
                    return Err(Error::from_string(
                        ErrorKind::ConnectionRefused(code),
                        format!("Server refused connection: {:?}", ack.return_code()),
                    ));
                }
                Ok(ConnectResult {
                    session_present: ack.session_present(),
                    reason_code: code,
                    properties: None,
                })
            }
            ProtocolLevel::V5 => {
                let mut ba = ByteArray::new(bytes);
                let ack = v5::ConnectAckPacket::decode(&mut ba).map_err(|err| {
                    Error::from_string(
                        ErrorKind::ProtocolError,
                        format!("Expected connect acknowledgement, got {err:?}"),
                    )
                })?;
                let code = u8::from(ack.reason_code());
                if ack.reason_code().is_error() {
                    return Err(Error::from_string(
                        ErrorKind::ConnectionRefused(code),
                        format!("Server refused connection: {:?}", ack.reason_code()),
                    ));
                }
                self.apply_connect_ack_properties(ack.properties());
                Ok(ConnectResult {
                    session_present: ack.session_present(),
                    reason_code: code,
                    properties: Some(ack.properties().clone()),
                })
            }
        }
    }

    /// Several connect acknowledgement properties override local
    /// configuration.
    fn apply_connect_ack_properties(&mut self, properties: &Properties) {
        if let Some(assigned) = properties.assigned_client_identifier() {
            if self.client_id.is_empty() {
                log::info!("client: server assigned client id `{assigned}`");
                self.client_id = assigned.to_string();
            }
        }
        if let Some(server_keep_alive) = properties.server_keep_alive() {
            self.keep_alive = Duration::from_secs(u64::from(server_keep_alive));
        }
        // Absent means the server accepts the protocol maximum.
        let receive_maximum = properties.receive_maximum().unwrap_or(u16::MAX);
        self.flow.set_maximum(receive_maximum);
        // Absent means the server accepts no aliases at all.
        let alias_maximum = properties.topic_alias_maximum().unwrap_or(0);
        self.alias_out.shrink_maximum(alias_maximum);
        self.maximum_packet_size = properties.maximum_packet_size();
    }

    fn restore_session(&mut self, session_present: bool) -> Result<(), Error> {
        let store = self.options.session_store();
        if self.options.clean_session() {
            if let Some(store) = store {
                // A clean start discards any stored session.
                store.delete(&self.client_id)?;
            }
            return Ok(());
        }

        if session_present {
            if let Some(store) = store {
                if let Some(state) = store.load(&self.client_id)? {
                    log::info!(
                        "client: restoring session of `{}`: {} subscriptions, {} pending QoS 2",
                        self.client_id,
                        state.subscriptions().len(),
                        state.pending_qos2().len()
                    );
                    for packet_id in state.pending_qos2() {
                        let packet_id = PacketId::new(*packet_id);
                        self.packet_ids.reserve(packet_id);
                        self.flow.acquire(packet_id);
                        self.pending_qos2
                            .entry(packet_id.value())
                            .or_insert(Qos2State::AwaitingComplete);
                    }
                    self.session = state;
                }
            }
        } else {
            // The server lost the session; stale local state is
            // useless now.
            if !self.session.is_empty() || self.has_pending() {
                log::warn!(
                    "client: server holds no session for `{}`, discarding local state",
                    self.client_id
                );
            }
            self.drop_pending();
            self.session = SessionState::new();
            if let Some(store) = store {
                store.delete(&self.client_id)?;
            }
        }
        Ok(())
    }

    fn has_pending(&self) -> bool {
        !self.pending_qos1.is_empty() || !self.pending_qos2.is_empty()
    }

    fn drop_pending(&mut self) {
        for packet_id in self
            .pending_qos1
            .keys()
            .chain(self.pending_qos2.keys())
            .copied()
            .collect::<Vec<u16>>()
        {
            let packet_id = PacketId::new(packet_id);
            self.flow.release(packet_id);
            self.packet_ids.release(packet_id);
        }
        self.pending_qos1.clear();
        self.pending_qos2.clear();
        self.inbound_qos2.clear();
    }

    /// Retransmit whatever survived the last connection: QoS 1/2
    /// publishes with DUP set, and the release packets of exchanges
    /// that already passed the received stage.
    fn replay_pending(&mut self) -> Result<(), Error> {
        let qos1_ids: Vec<u16> = self.pending_qos1.keys().copied().collect();
        for packet_id in qos1_ids {
            let request = self.pending_qos1[&packet_id].clone();
            let bytes = self.encode_publish(
                &request,
                QoS::AtLeastOnce,
                PacketId::new(packet_id),
                true,
            )?;
            self.send_bytes(&bytes)?;
        }

        let qos2: Vec<(u16, Qos2State)> = self
            .pending_qos2
            .iter()
            .map(|(id, state)| (*id, state.clone()))
            .collect();
        for (packet_id, state) in qos2 {
            match state {
                Qos2State::AwaitingReceived(request) => {
                    let bytes = self.encode_publish(
                        &request,
                        QoS::ExactOnce,
                        PacketId::new(packet_id),
                        true,
                    )?;
                    self.send_bytes(&bytes)?;
                }
                Qos2State::AwaitingComplete => {
                    self.send_pub_rel(PacketId::new(packet_id))?;
                }
            }
        }
        Ok(())
    }

    /// Send the disconnect packet and release the transport.
    pub fn disconnect(
        &mut self,
        reason: Option<(ReasonCode, Properties)>,
    ) -> Result<(), Error> {
        if self.status != ClientStatus::Connected {
            return Ok(());
        }
        self.status = ClientStatus::Disconnecting;
        self.save_session();

        let result = match self.encode_disconnect(reason) {
            Ok(bytes) => self.send_bytes(&bytes),
            Err(err) => Err(err),
        };
        self.close_transport();
        self.status = ClientStatus::Disconnected;
        self.alias_out.reset();
        self.alias_in.reset();
        result
    }

    fn close_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(err) = transport.close() {
                log::warn!("client: failed to close transport: {err:?}");
            }
        }
    }

    fn teardown(&mut self) {
        self.save_session();
        self.close_transport();
        self.status = ClientStatus::Disconnected;
        self.alias_out.reset();
        self.alias_in.reset();
    }

    /// Persist session state through the configured store; hook errors
    /// are logged, they never tear the connection down.
    fn save_session(&mut self) {
        if self.options.clean_session() {
            return;
        }
        let Some(store) = self.options.session_store() else {
            return;
        };
        self.session.touch();
        if let Err(err) = store.save(&self.client_id, &self.session) {
            log::error!("client: failed to save session of `{}`: {err}", self.client_id);
        }
    }

    // ---- error and reconnect handling -----------------------------

    /// Route a poll error: abnormal terminations feed the reconnect
    /// loop when it is enabled, everything else surfaces to the
    /// caller.
    fn handle_connection_error(&mut self, err: Error) -> Result<(), Error> {
        let recoverable = matches!(
            err.kind(),
            ErrorKind::IoError | ErrorKind::KeepAliveTimeout | ErrorKind::Timeout
        ) || matches!(err.kind(), ErrorKind::ServerDisconnected(code) if code >= 0x80);
        if !recoverable {
            return Err(err);
        }

        log::warn!("client: connection lost: {err}");
        if self.status != ClientStatus::Disconnected {
            self.teardown();
        }
        if self.options.reconnect().is_some() {
            self.reconnect_loop().map_err(|reconnect_err| {
                log::error!("client: reconnect failed: {reconnect_err}");
                err.clone()
            })
        } else {
            Err(err)
        }
    }

    fn reconnect_loop(&mut self) -> Result<(), Error> {
        let reconnect = *self
            .options
            .reconnect()
            .ok_or_else(|| Error::new(ErrorKind::IoError, "Auto-reconnect is disabled"))?;
        while self.reconnect_attempts < reconnect.max_attempts() {
            self.reconnect_attempts += 1;
            self.status = ClientStatus::Reconnecting;
            let delay = reconnect.delay_with_jitter(self.reconnect_attempts);
            log::info!(
                "client: reconnect attempt {} of {} in {:?}",
                self.reconnect_attempts,
                reconnect.max_attempts(),
                delay
            );
            sleep_cooperatively(delay);

            self.status = ClientStatus::Disconnected;
            match self.connect() {
                Ok(_result) => return Ok(()),
                Err(err) => {
                    log::warn!(
                        "client: reconnect attempt {} failed: {err}",
                        self.reconnect_attempts
                    );
                }
            }
        }
        self.status = ClientStatus::Disconnected;
        Err(Error::new(
            ErrorKind::IoError,
            "Reconnect attempts exhausted",
        ))
    }

    /// One cooperative step: keep-alive bookkeeping plus at most one
    /// inbound packet, with connection errors routed through the
    /// reconnect policy.
    pub fn pump(&mut self, read_timeout: Duration) -> Result<(), Error> {
        match self.poll_once(read_timeout) {
            Ok(()) => Ok(()),
            Err(err) => self.handle_connection_error(err),
        }
    }

    fn poll_once(&mut self, read_timeout: Duration) -> Result<(), Error> {
        self.check_keep_alive()?;
        match self.read_packet(read_timeout)? {
            None => Ok(()),
            Some(bytes) => self.dispatch(&bytes),
        }
    }

    fn check_keep_alive(&mut self) -> Result<(), Error> {
        if self.status != ClientStatus::Connected || self.keep_alive.is_zero() {
            return Ok(());
        }
        if self.last_read.elapsed() > self.keep_alive * 3 / 2 {
            return Err(Error::new(
                ErrorKind::KeepAliveTimeout,
                "No packet received within 1.5 keep-alive intervals",
            ));
        }
        if self.last_write.elapsed() >= self.keep_alive / 2 {
            log::debug!("client: sending ping request");
            let bytes = self.encode_ping_request()?;
            self.send_bytes(&bytes)?;
        }
        Ok(())
    }

    // ---- transport framing ----------------------------------------

    fn send_bytes(&mut self, bytes: &[u8]) -> Result<(), Error> {
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| Error::new(ErrorKind::NotConnected, "No transport"))?;
        transport.write_all(bytes, IO_TIMEOUT)?;
        self.last_write = Instant::now();
        Ok(())
    }

    /// Read one complete packet. `Ok(None)` means nothing arrived
    /// before `first_byte_timeout`; a timeout mid-packet is an error.
    fn read_packet(&mut self, first_byte_timeout: Duration) -> Result<Option<Vec<u8>>, Error> {
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| Error::new(ErrorKind::NotConnected, "No transport"))?;

        let mut byte = [0_u8; 1];
        match transport.read_exact(&mut byte, first_byte_timeout) {
            Ok(()) => (),
            Err(TransportError::Timeout) => return Ok(None),
            Err(err) => return Err(err.into()),
        }
        let mut packet = vec![byte[0]];

        // Remaining Length, one byte at a time, at most four bytes.
        let mut remaining: usize = 0;
        let mut multiplier: usize = 1;
        loop {
            transport
                .read_exact(&mut byte, IO_TIMEOUT)
                .map_err(Error::from)?;
            packet.push(byte[0]);
            remaining += usize::from(byte[0] & 0x7f) * multiplier;
            if byte[0] & 0x80 == 0 {
                break;
            }
            if packet.len() >= 5 {
                return Err(Error::new(
                    ErrorKind::MalformedPacket,
                    "Remaining length uses more than four bytes",
                ));
            }
            multiplier *= 128;
        }

        let offset = packet.len();
        packet.resize(offset + remaining, 0);
        transport
            .read_exact(&mut packet[offset..], IO_TIMEOUT)
            .map_err(Error::from)?;
        Ok(Some(packet))
    }

    // ---- inbound dispatch -----------------------------------------

    fn dispatch(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.last_read = Instant::now();
        match self.options.protocol_level() {
            ProtocolLevel::V31 | ProtocolLevel::V311 => {
                let mut ba = ByteArray::new(bytes);
                let packet = v3::Packet::decode(&mut ba)?;
                self.on_v3_packet(packet)
            }
            ProtocolLevel::V5 => {
                let mut ba = ByteArray::new(bytes);
                let packet = v5::Packet::decode(&mut ba)?;
                self.on_v5_packet(packet)
            }
        }
    }

    fn on_v3_packet(&mut self, packet: v3::Packet) -> Result<(), Error> {
        match packet {
            v3::Packet::Publish(publish) => {
                let message = PublishMessage {
                    topic: publish.topic().to_string(),
                    qos: publish.qos(),
                    retain: publish.retain(),
                    dup: publish.dup(),
                    payload: publish.message().to_vec(),
                    properties: None,
                };
                self.on_inbound_publish(message, publish.packet_id())
            }
            v3::Packet::PublishAck(ack) => self.on_pub_ack(ack.packet_id(), 0),
            v3::Packet::PublishReceived(ack) => self.on_pub_rec(ack.packet_id(), 0),
            v3::Packet::PublishRelease(release) => self.on_pub_rel(release.packet_id()),
            v3::Packet::PublishComplete(complete) => self.on_pub_comp(complete.packet_id()),
            v3::Packet::SubscribeAck(ack) => {
                let codes: Vec<u8> = ack.acks().iter().map(|a| a.byte()).collect();
                self.on_sub_ack(ack.packet_id(), codes);
                Ok(())
            }
            v3::Packet::UnsubscribeAck(ack) => {
                self.on_unsub_ack(ack.packet_id(), Vec::new());
                Ok(())
            }
            v3::Packet::PingResponse(_) => {
                log::debug!("client: ping response");
                Ok(())
            }
            other => Err(Error::from_string(
                ErrorKind::ProtocolError,
                format!("Unexpected packet from server: {other:?}"),
            )),
        }
    }

    fn on_v5_packet(&mut self, packet: v5::Packet) -> Result<(), Error> {
        match packet {
            v5::Packet::Publish(publish) => self.on_v5_publish(publish),
            v5::Packet::PublishAck(ack) => {
                self.on_pub_ack(ack.packet_id(), u8::from(ack.reason_code()))
            }
            v5::Packet::PublishReceived(ack) => {
                self.on_pub_rec(ack.packet_id(), u8::from(ack.reason_code()))
            }
            v5::Packet::PublishRelease(release) => self.on_pub_rel(release.packet_id()),
            v5::Packet::PublishComplete(complete) => self.on_pub_comp(complete.packet_id()),
            v5::Packet::SubscribeAck(ack) => {
                let codes: Vec<u8> = ack.reasons().iter().copied().map(u8::from).collect();
                self.on_sub_ack(ack.packet_id(), codes);
                Ok(())
            }
            v5::Packet::UnsubscribeAck(ack) => {
                let codes: Vec<u8> = ack.reasons().iter().copied().map(u8::from).collect();
                self.on_unsub_ack(ack.packet_id(), codes);
                Ok(())
            }
            v5::Packet::PingResponse(_) => {
                log::debug!("client: ping response");
                Ok(())
            }
            v5::Packet::Disconnect(disconnect) => self.on_server_disconnect(disconnect),
            v5::Packet::Auth(auth) => {
                log::warn!(
                    "client: ignoring auth packet with reason {:?}",
                    auth.reason_code()
                );
                Ok(())
            }
            other => Err(Error::from_string(
                ErrorKind::ProtocolError,
                format!("Unexpected packet from server: {other:?}"),
            )),
        }
    }

    fn on_v5_publish(&mut self, publish: v5::PublishPacket) -> Result<(), Error> {
        let topic = match publish.properties().topic_alias() {
            None => publish.topic().to_string(),
            Some(alias) => {
                if !self.alias_in.is_valid(alias) {
                    return self.alias_protocol_error(alias);
                }
                if publish.topic().is_empty() {
                    match self.alias_in.resolve(alias) {
                        Some(topic) => topic.to_string(),
                        None => return self.alias_protocol_error(alias),
                    }
                } else {
                    self.alias_in.register(alias, publish.topic());
                    publish.topic().to_string()
                }
            }
        };

        let message = PublishMessage {
            topic,
            qos: publish.qos(),
            retain: publish.retain(),
            dup: publish.dup(),
            payload: publish.message().to_vec(),
            properties: Some(publish.properties().clone()),
        };
        self.on_inbound_publish(message, publish.packet_id())
    }

    /// An illegal inbound alias disconnects with reason 0x94 (Topic
    /// Alias invalid).
    fn alias_protocol_error(&mut self, alias: u16) -> Result<(), Error> {
        log::error!("client: server sent invalid topic alias {alias}");
        let bytes = self.encode_disconnect(Some((
            ReasonCode::TopicAliasInvalid,
            Properties::new(),
        )))?;
        let _ = self.send_bytes(&bytes);
        self.teardown();
        Err(Error::from_string(
            ErrorKind::ProtocolError,
            format!("Invalid inbound topic alias {alias}"),
        ))
    }

    fn on_inbound_publish(
        &mut self,
        message: PublishMessage,
        packet_id: PacketId,
    ) -> Result<(), Error> {
        let qos = message.qos;
        let duplicate =
            qos == QoS::ExactOnce && self.inbound_qos2.contains(&packet_id.value());
        if !duplicate {
            if qos == QoS::ExactOnce {
                self.inbound_qos2.insert(packet_id.value());
            }
            if self.admits(&message.topic) {
                self.deliver(message);
            } else {
                log::debug!(
                    "client: message on `{}` dropped by client-side filters",
                    message.topic
                );
            }
        }

        // Acknowledgements flow regardless of delivery filters or
        // duplicate suppression.
        match qos {
            QoS::AtMostOnce => Ok(()),
            QoS::AtLeastOnce => self.send_pub_ack(packet_id),
            QoS::ExactOnce => self.send_pub_rec(packet_id),
        }
    }

    fn admits(&self, topic: &str) -> bool {
        self.filters.is_empty() || self.filters.iter().any(|filter| filter.is_match(topic))
    }

    fn deliver(&mut self, message: PublishMessage) {
        if let Some(callback) = self.on_message.as_mut() {
            // A panicking handler must not take the connection down.
            let result = catch_unwind(AssertUnwindSafe(|| callback(&message)));
            if result.is_err() {
                log::error!(
                    "client: message handler panicked on topic `{}`",
                    message.topic
                );
            }
        } else {
            self.inbox.push_back(message);
        }
    }

    fn on_pub_ack(&mut self, packet_id: PacketId, reason: u8) -> Result<(), Error> {
        if self.pending_qos1.remove(&packet_id.value()).is_none() {
            log::warn!("client: publish acknowledgement for unknown id {packet_id}");
            return Ok(());
        }
        if reason >= 0x80 {
            log::warn!(
                "client: QoS 1 publish {packet_id} rejected with reason {reason:#04x}"
            );
        }
        self.flow.release(packet_id);
        self.packet_ids.release(packet_id);
        Ok(())
    }

    fn on_pub_rec(&mut self, packet_id: PacketId, reason: u8) -> Result<(), Error> {
        let Some(state) = self.pending_qos2.get(&packet_id.value()) else {
            log::warn!("client: publish-received for unknown id {packet_id}");
            return Ok(());
        };
        let already_released = matches!(state, Qos2State::AwaitingComplete);
        if reason >= 0x80 {
            // The rejected exchange ends here; the id is not retried.
            log::warn!(
                "client: QoS 2 publish {packet_id} rejected with reason {reason:#04x}"
            );
            self.pending_qos2.remove(&packet_id.value());
            self.flow.release(packet_id);
            self.packet_ids.release(packet_id);
            return Ok(());
        }
        if already_released {
            // Duplicate PUBREC; the release is repeated below anyway.
            log::debug!("client: duplicate publish-received for id {packet_id}");
        }
        self.pending_qos2
            .insert(packet_id.value(), Qos2State::AwaitingComplete);
        self.session.add_pending_qos2(packet_id.value());
        self.save_session();
        self.send_pub_rel(packet_id)
    }

    fn on_pub_comp(&mut self, packet_id: PacketId) -> Result<(), Error> {
        if self.pending_qos2.remove(&packet_id.value()).is_none() {
            log::warn!("client: publish-complete for unknown id {packet_id}");
            return Ok(());
        }
        self.flow.release(packet_id);
        self.packet_ids.release(packet_id);
        self.session.remove_pending_qos2(packet_id.value());
        self.save_session();
        Ok(())
    }

    /// Inbound QoS 2 release: answered with a completion even when the
    /// id is unknown, so a replayed release converges.
    fn on_pub_rel(&mut self, packet_id: PacketId) -> Result<(), Error> {
        self.inbound_qos2.remove(&packet_id.value());
        self.send_pub_comp(packet_id)
    }

    fn on_sub_ack(&mut self, packet_id: PacketId, codes: Vec<u8>) {
        let Some(requested) = self.pending_suback.remove(&packet_id.value()) else {
            log::warn!("client: subscribe acknowledgement for unknown id {packet_id}");
            return;
        };
        let is_v5 = self.options.protocol_level() == ProtocolLevel::V5;
        for (index, (filter, options)) in requested.iter().enumerate() {
            let Some(code) = codes.get(index).copied() else {
                log::error!("client: subscribe acknowledgement too short for {filter}");
                break;
            };
            if code >= 0x80 {
                log::warn!(
                    "client: subscription to `{filter}` refused with reason {code:#04x}"
                );
                continue;
            }
            let granted = QoS::try_from(code).unwrap_or(options.qos());
            self.session.insert_subscription(
                filter,
                SubscriptionEntry {
                    qos: granted,
                    options: is_v5.then_some(*options),
                },
            );
        }
        self.save_session();
        self.suback_results.insert(packet_id.value(), codes);
    }

    fn on_unsub_ack(&mut self, packet_id: PacketId, codes: Vec<u8>) {
        let Some(filters) = self.pending_unsuback.remove(&packet_id.value()) else {
            log::warn!("client: unsubscribe acknowledgement for unknown id {packet_id}");
            return;
        };
        // 3.1.1 carries no per-filter codes; everything succeeded.
        let codes = if codes.is_empty() {
            vec![0; filters.len()]
        } else {
            codes
        };
        for (index, filter) in filters.iter().enumerate() {
            let code = codes.get(index).copied().unwrap_or(0);
            // 0x00 success, 0x11 no subscription existed: gone either way.
            if code < 0x80 {
                self.session.remove_subscription(filter);
            }
        }
        self.save_session();
        self.unsuback_results.insert(packet_id.value(), codes);
    }

    fn on_server_disconnect(&mut self, packet: v5::DisconnectPacket) -> Result<(), Error> {
        let reason = u8::from(packet.reason_code());
        let reconnect = self.options.reconnect();
        let will_reconnect = reason >= 0x80
            && reconnect.is_some_and(|r| self.reconnect_attempts < r.max_attempts());
        log::warn!(
            "client: server disconnect, reason {reason:#04x}, will_reconnect {will_reconnect}"
        );

        if let Some(callback) = self.on_event.as_mut() {
            let event = ClientEvent::ServerDisconnect {
                packet: packet.clone(),
                will_reconnect,
            };
            callback(&event);
        }
        self.teardown();

        if reason == 0 {
            // A normal disconnect is not an error and never reconnects.
            Ok(())
        } else {
            Err(Error::from_string(
                ErrorKind::ServerDisconnected(reason),
                format!("Server closed the session with reason {reason:#04x}"),
            ))
        }
    }

    // ---- public operations ----------------------------------------

    fn ensure_connected(&self) -> Result<(), Error> {
        if self.status == ClientStatus::Connected {
            Ok(())
        } else {
            Err(Error::from_string(
                ErrorKind::NotConnected,
                format!("Operation requires a connection, status is {:?}", self.status),
            ))
        }
    }

    /// Publish `payload` on `topic`. Returns the packet id for QoS 1/2
    /// and 0 for QoS 0.
    pub fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        options: &PublishOptions,
    ) -> Result<u16, Error> {
        self.ensure_connected()?;
        let request = PublishRequest {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            retain: options.retain(),
            properties: options.properties().cloned(),
        };

        if options.qos() == QoS::AtMostOnce {
            let bytes = self.encode_publish(&request, QoS::AtMostOnce, PacketId::new(0), false)?;
            self.check_packet_size(bytes.len())?;
            self.send_bytes(&bytes)?;
            return Ok(0);
        }

        let packet_id = self.packet_ids.allocate()?;
        let deadline =
            Instant::now() + options.admission_timeout().unwrap_or(DEFAULT_ADMISSION_TIMEOUT);
        while !self.flow.acquire(packet_id) {
            if Instant::now() >= deadline {
                self.packet_ids.release(packet_id);
                return Err(Error::new(
                    ErrorKind::FlowControlTimeout,
                    "No flow-control slot within the admission timeout",
                ));
            }
            // Keep draining acknowledgements while we wait for a slot.
            if let Err(err) = self.pump(POLL_INTERVAL) {
                self.packet_ids.release(packet_id);
                return Err(err);
            }
            if self.status != ClientStatus::Connected {
                self.packet_ids.release(packet_id);
                return Err(Error::new(
                    ErrorKind::NotConnected,
                    "Connection lost while waiting for flow-control admission",
                ));
            }
        }

        let bytes = match self
            .encode_publish(&request, options.qos(), packet_id, false)
            .and_then(|bytes| self.check_packet_size(bytes.len()).map(|()| bytes))
        {
            Ok(bytes) => bytes,
            Err(err) => {
                self.flow.release(packet_id);
                self.packet_ids.release(packet_id);
                return Err(err);
            }
        };

        // Record the exchange before the write so that a broken write
        // replays it through the reconnect path.
        match options.qos() {
            QoS::AtLeastOnce => {
                self.pending_qos1.insert(packet_id.value(), request);
            }
            QoS::ExactOnce => {
                self.pending_qos2
                    .insert(packet_id.value(), Qos2State::AwaitingReceived(request));
            }
            QoS::AtMostOnce => unreachable!("QoS 0 returned above"),
        }

        if let Err(err) = self.send_bytes(&bytes) {
            self.handle_connection_error(err)?;
        }
        Ok(packet_id.value())
    }

    /// Subscribe to `entries` and wait for the acknowledgement; one
    /// reason code per filter is returned in request order.
    pub fn subscribe(
        &mut self,
        entries: &[(String, SubscribeOptions)],
    ) -> Result<Vec<u8>, Error> {
        self.ensure_connected()?;
        if entries.is_empty() {
            return Err(Error::new(
                ErrorKind::ProtocolError,
                "Subscribe needs at least one topic filter",
            ));
        }

        let packet_id = self.packet_ids.allocate()?;
        let bytes = match self.encode_subscribe(packet_id, entries) {
            Ok(bytes) => bytes,
            Err(err) => {
                self.packet_ids.release(packet_id);
                return Err(err);
            }
        };
        self.pending_suback
            .insert(packet_id.value(), entries.to_vec());
        if let Err(err) = self.send_bytes(&bytes) {
            self.pending_suback.remove(&packet_id.value());
            self.packet_ids.release(packet_id);
            return Err(err);
        }

        let result = self.wait_for_ack(packet_id, ACK_TIMEOUT, |inner| {
            inner.suback_results.remove(&packet_id.value())
        });
        self.pending_suback.remove(&packet_id.value());
        self.packet_ids.release(packet_id);
        result
    }

    /// Unsubscribe from `filters`; returns one reason code per filter
    /// (all zero on 3.1.1 connections).
    pub fn unsubscribe(&mut self, filters: &[String]) -> Result<Vec<u8>, Error> {
        self.ensure_connected()?;
        if filters.is_empty() {
            return Err(Error::new(
                ErrorKind::ProtocolError,
                "Unsubscribe needs at least one topic filter",
            ));
        }

        let packet_id = self.packet_ids.allocate()?;
        let bytes = match self.encode_unsubscribe(packet_id, filters) {
            Ok(bytes) => bytes,
            Err(err) => {
                self.packet_ids.release(packet_id);
                return Err(err);
            }
        };
        self.pending_unsuback
            .insert(packet_id.value(), filters.to_vec());
        if let Err(err) = self.send_bytes(&bytes) {
            self.pending_unsuback.remove(&packet_id.value());
            self.packet_ids.release(packet_id);
            return Err(err);
        }

        let result = self.wait_for_ack(packet_id, ACK_TIMEOUT, |inner| {
            inner.unsuback_results.remove(&packet_id.value())
        });
        self.pending_unsuback.remove(&packet_id.value());
        self.packet_ids.release(packet_id);
        result
    }

    fn wait_for_ack<F>(
        &mut self,
        packet_id: PacketId,
        timeout: Duration,
        mut take: F,
    ) -> Result<Vec<u8>, Error>
    where
        F: FnMut(&mut Self) -> Option<Vec<u8>>,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(codes) = take(self) {
                return Ok(codes);
            }
            if Instant::now() >= deadline {
                return Err(Error::from_string(
                    ErrorKind::Timeout,
                    format!("No acknowledgement for packet id {packet_id}"),
                ));
            }
            self.pump(POLL_INTERVAL)?;
            if self.status != ClientStatus::Connected {
                return Err(Error::new(
                    ErrorKind::NotConnected,
                    "Connection lost while waiting for an acknowledgement",
                ));
            }
        }
    }

    /// Wait up to `timeout` for the next inbound message.
    pub fn await_message(&mut self, timeout: Duration) -> Result<Option<PublishMessage>, Error> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(message) = self.inbox.pop_front() {
                return Ok(Some(message));
            }
            // Disconnect aborts the wait immediately.
            if self.status != ClientStatus::Connected {
                return Err(Error::new(
                    ErrorKind::NotConnected,
                    "Not connected while waiting for a message",
                ));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let step = POLL_INTERVAL.min(deadline - now);
            self.pump(step)?;
        }
    }

    /// Run the read loop until the connection ends, feeding every
    /// delivered message to the registered handler.
    pub fn run(&mut self, idle_sleep: Duration) -> Result<(), Error> {
        self.ensure_connected()?;
        let read_timeout = if idle_sleep.is_zero() {
            POLL_INTERVAL
        } else {
            idle_sleep
        };
        while self.status == ClientStatus::Connected {
            self.pump(read_timeout)?;
            // Messages queued before a handler was registered.
            if self.on_message.is_some() {
                while let Some(message) = self.inbox.pop_front() {
                    self.deliver(message);
                }
            }
        }
        Ok(())
    }

    // ---- wire shims -----------------------------------------------

    fn check_packet_size(&self, encoded_len: usize) -> Result<(), Error> {
        if let Some(maximum) = self.maximum_packet_size {
            if encoded_len > maximum as usize {
                return Err(Error::from_string(
                    ErrorKind::ProtocolError,
                    format!(
                        "Encoded packet of {encoded_len} bytes exceeds the server maximum of {maximum}"
                    ),
                ));
            }
        }
        Ok(())
    }

    fn encode_connect(&mut self) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::new();
        match self.options.protocol_level() {
            level @ (ProtocolLevel::V31 | ProtocolLevel::V311) => {
                let mut packet = v3::ConnectPacket::new(&self.client_id)?;
                packet.set_protocol_level(level);
                packet.set_clean_session(self.options.clean_session());
                packet.set_keep_alive(keep_alive_seconds(self.keep_alive));
                if let Some(username) = self.options.username() {
                    packet.set_credentials(username, self.options.password())?;
                }
                if let Some(will) = self.options.will() {
                    packet.set_will(&will.topic, &will.payload, will.qos, will.retain)?;
                }
                packet.encode(&mut buf)?;
            }
            ProtocolLevel::V5 => {
                let mut packet = v5::ConnectPacket::new(&self.client_id)?;
                packet.set_clean_start(self.options.clean_session());
                packet.set_keep_alive(keep_alive_seconds(self.keep_alive));
                if self.options.username().is_some() || self.options.password().is_some() {
                    packet.set_credentials(self.options.username(), self.options.password())?;
                }
                if let Some(seconds) = self.options.session_expiry() {
                    packet
                        .properties_mut()
                        .push(Property::SessionExpiryInterval(U32Data::new(seconds)));
                }
                if self.options.receive_maximum() != u16::MAX {
                    packet.properties_mut().push(Property::ReceiveMaximum(
                        U16Data::new(self.options.receive_maximum()),
                    ));
                }
                if self.options.topic_alias_maximum() > 0 {
                    packet.properties_mut().push(Property::TopicAliasMaximum(
                        U16Data::new(self.options.topic_alias_maximum()),
                    ));
                }
                if let Some(will) = self.options.will() {
                    packet.set_will(&will.topic, &will.payload, will.qos, will.retain)?;
                    if let Some(properties) = &will.properties {
                        packet.set_will_properties(properties.clone());
                    }
                }
                packet.encode(&mut buf)?;
            }
        }
        Ok(buf)
    }

    fn encode_publish(
        &mut self,
        request: &PublishRequest,
        qos: QoS,
        packet_id: PacketId,
        dup: bool,
    ) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::new();
        match self.options.protocol_level() {
            ProtocolLevel::V31 | ProtocolLevel::V311 => {
                let mut packet = v3::PublishPacket::new(&request.topic, qos, &request.payload)?;
                packet.set_retain(request.retain);
                packet.set_packet_id(packet_id);
                if dup {
                    packet.set_dup(true)?;
                }
                packet.encode(&mut buf)?;
            }
            ProtocolLevel::V5 => {
                let mut packet = v5::PublishPacket::new(&request.topic, qos, &request.payload)?;
                packet.set_retain(request.retain);
                packet.set_packet_id(packet_id);
                if dup {
                    packet.set_dup(true)?;
                }
                if let Some(properties) = &request.properties {
                    for property in properties.props() {
                        packet.properties_mut().push(property.clone());
                    }
                }
                // The topic string rides along even on reuse; peers
                // that lost the mapping stay in sync that way. Callers
                // wanting the byte saving pass an empty topic with
                // their own alias property.
                if let Some((alias, _state)) = self.alias_out.assign(&request.topic) {
                    packet
                        .properties_mut()
                        .push(Property::TopicAlias(U16Data::new(alias)));
                }
                packet.encode(&mut buf)?;
            }
        }
        Ok(buf)
    }

    fn encode_subscribe(
        &self,
        packet_id: PacketId,
        entries: &[(String, SubscribeOptions)],
    ) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::new();
        match self.options.protocol_level() {
            ProtocolLevel::V31 | ProtocolLevel::V311 => {
                let mut topics = Vec::with_capacity(entries.len());
                for (filter, options) in entries {
                    topics.push(v3::SubscribeTopic::new(filter, options.qos())?);
                }
                v3::SubscribePacket::with_topics(packet_id, topics).encode(&mut buf)?;
            }
            ProtocolLevel::V5 => {
                let mut topics = Vec::with_capacity(entries.len());
                for (filter, options) in entries {
                    topics.push(v5::SubscribeTopic::new(filter, *options)?);
                }
                v5::SubscribePacket::with_topics(packet_id, topics).encode(&mut buf)?;
            }
        }
        Ok(buf)
    }

    fn encode_unsubscribe(
        &self,
        packet_id: PacketId,
        filters: &[String],
    ) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::new();
        let mut topics = Vec::with_capacity(filters.len());
        for filter in filters {
            topics.push(codec::SubTopic::new(filter)?);
        }
        match self.options.protocol_level() {
            ProtocolLevel::V31 | ProtocolLevel::V311 => {
                v3::UnsubscribePacket::with_topics(packet_id, topics).encode(&mut buf)?;
            }
            ProtocolLevel::V5 => {
                v5::UnsubscribePacket::with_topics(packet_id, topics).encode(&mut buf)?;
            }
        }
        Ok(buf)
    }

    fn encode_disconnect(
        &self,
        reason: Option<(ReasonCode, Properties)>,
    ) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::new();
        match self.options.protocol_level() {
            ProtocolLevel::V31 | ProtocolLevel::V311 => {
                v3::DisconnectPacket::new().encode(&mut buf)?;
            }
            ProtocolLevel::V5 => {
                let packet = match reason {
                    None => v5::DisconnectPacket::new(),
                    Some((reason_code, properties)) => {
                        let mut packet = v5::DisconnectPacket::with_reason(reason_code);
                        for property in properties.props() {
                            packet.properties_mut().push(property.clone());
                        }
                        packet
                    }
                };
                packet.encode(&mut buf)?;
            }
        }
        Ok(buf)
    }

    fn encode_ping_request(&self) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::new();
        match self.options.protocol_level() {
            ProtocolLevel::V31 | ProtocolLevel::V311 => {
                v3::PingRequestPacket::new().encode(&mut buf)?;
            }
            ProtocolLevel::V5 => {
                v5::PingRequestPacket::new().encode(&mut buf)?;
            }
        }
        Ok(buf)
    }

    fn send_pub_ack(&mut self, packet_id: PacketId) -> Result<(), Error> {
        let mut buf = Vec::new();
        match self.options.protocol_level() {
            ProtocolLevel::V31 | ProtocolLevel::V311 => {
                v3::PublishAckPacket::new(packet_id).encode(&mut buf)?;
            }
            ProtocolLevel::V5 => {
                v5::PublishAckPacket::new(packet_id).encode(&mut buf)?;
            }
        }
        self.send_bytes(&buf)
    }

    fn send_pub_rec(&mut self, packet_id: PacketId) -> Result<(), Error> {
        let mut buf = Vec::new();
        match self.options.protocol_level() {
            ProtocolLevel::V31 | ProtocolLevel::V311 => {
                v3::PublishReceivedPacket::new(packet_id).encode(&mut buf)?;
            }
            ProtocolLevel::V5 => {
                v5::PublishReceivedPacket::new(packet_id).encode(&mut buf)?;
            }
        }
        self.send_bytes(&buf)
    }

    fn send_pub_rel(&mut self, packet_id: PacketId) -> Result<(), Error> {
        let mut buf = Vec::new();
        match self.options.protocol_level() {
            ProtocolLevel::V31 | ProtocolLevel::V311 => {
                v3::PublishReleasePacket::new(packet_id).encode(&mut buf)?;
            }
            ProtocolLevel::V5 => {
                v5::PublishReleasePacket::new(packet_id).encode(&mut buf)?;
            }
        }
        self.send_bytes(&buf)
    }

    fn send_pub_comp(&mut self, packet_id: PacketId) -> Result<(), Error> {
        let mut buf = Vec::new();
        match self.options.protocol_level() {
            ProtocolLevel::V31 | ProtocolLevel::V311 => {
                v3::PublishCompletePacket::new(packet_id).encode(&mut buf)?;
            }
            ProtocolLevel::V5 => {
                v5::PublishCompletePacket::new(packet_id).encode(&mut buf)?;
            }
        }
        self.send_bytes(&buf)
    }
}

#[allow(clippy::cast_possible_truncation)]
fn keep_alive_seconds(keep_alive: Duration) -> u16 {
    keep_alive.as_secs().min(u64::from(u16::MAX)) as u16
}

/// Sleep in poll-interval slices so the wait stays interruptible at
/// 10 ms granularity.
fn sleep_cooperatively(total: Duration) {
    let deadline = Instant::now() + total;
    loop {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep(POLL_INTERVAL.min(deadline - now));
    }
}
