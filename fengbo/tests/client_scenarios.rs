// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Connection scenarios driven over an in-memory transport.

use codec::v5::SubscribeOptions;
use codec::{ProtocolLevel, QoS};
use fengbo::{
    Client, ClientEvent, ClientStatus, ConnectOptions, ErrorKind, FileSessionStore,
    PublishOptions, SessionState, SessionStore, SubscriptionEntry, Transport, TransportError,
};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

#[derive(Default)]
struct PeerState {
    inbound: VecDeque<u8>,
    outbound: Vec<u8>,
    closed: bool,
}

/// Scripted peer: tests queue the server's bytes up front and inspect
/// everything the client wrote.
#[derive(Clone, Default)]
struct MockPeer(Rc<RefCell<PeerState>>);

impl MockPeer {
    fn new() -> Self {
        Self::default()
    }

    fn queue(&self, bytes: &[u8]) {
        self.0.borrow_mut().inbound.extend(bytes.iter().copied());
    }

    fn written(&self) -> Vec<u8> {
        self.0.borrow().outbound.clone()
    }

    fn clear_written(&self) {
        self.0.borrow_mut().outbound.clear();
    }

    fn transport(&self) -> Box<dyn Transport> {
        Box::new(Self(Rc::clone(&self.0)))
    }
}

impl Transport for MockPeer {
    fn read_exact(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<(), TransportError> {
        let mut state = self.0.borrow_mut();
        if state.inbound.len() < buf.len() {
            return if state.closed {
                Err(TransportError::Closed)
            } else {
                Err(TransportError::Timeout)
            };
        }
        for byte in buf.iter_mut() {
            *byte = state.inbound.pop_front().unwrap();
        }
        Ok(())
    }

    fn write_all(&mut self, buf: &[u8], _timeout: Duration) -> Result<(), TransportError> {
        let mut state = self.0.borrow_mut();
        if state.closed {
            return Err(TransportError::Closed);
        }
        state.outbound.extend_from_slice(buf);
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.0.borrow_mut().closed = true;
        Ok(())
    }
}

/// 0x20 0x02 <flags> <code>
const V3_CONNACK_OK: &[u8] = &[0x20, 0x02, 0x00, 0x00];
/// 0x20 0x03 <flags> <reason> <prop len>
const V5_CONNACK_OK: &[u8] = &[0x20, 0x03, 0x00, 0x00, 0x00];

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn v311_connect_handshake() {
    init_logger();
    let peer = MockPeer::new();
    peer.queue(V3_CONNACK_OK);

    let options = ConnectOptions::new("127.0.0.1", 1883)
        .with_protocol_level(ProtocolLevel::V311)
        .with_client_id("test-A")
        .with_clean_session(true);
    let mut client = Client::new(options);
    let result = client.connect_with_transport(peer.transport()).unwrap();

    assert_eq!(result.reason_code, 0);
    assert!(!result.session_present);
    assert_eq!(client.status(), ClientStatus::Connected);

    let written = peer.written();
    // CONNECT with protocol name MQTT level 4 and the client id.
    assert_eq!(written[0], 0x10);
    assert!(contains(&written, b"MQTT"));
    assert!(contains(&written, b"test-A"));
}

#[test]
fn v311_connect_refused() {
    let peer = MockPeer::new();
    peer.queue(&[0x20, 0x02, 0x00, 0x05]);

    let mut client = Client::new(
        ConnectOptions::default().with_protocol_level(ProtocolLevel::V311),
    );
    let err = client.connect_with_transport(peer.transport()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionRefused(5));
    assert_eq!(client.status(), ClientStatus::Disconnected);
}

#[test]
fn v5_qos1_publish_flow() {
    let peer = MockPeer::new();
    peer.queue(V5_CONNACK_OK);

    let mut client = Client::new(
        ConnectOptions::default()
            .with_protocol_level(ProtocolLevel::V5)
            .with_client_id("pub-1"),
    );
    client.connect_with_transport(peer.transport()).unwrap();
    peer.clear_written();

    let packet_id = client
        .publish(
            "sensors/t",
            b"22.5",
            &PublishOptions::new().with_qos(QoS::AtLeastOnce),
        )
        .unwrap();
    assert_eq!(packet_id, 1);
    assert_eq!(client.inflight(), 1);

    let written = peer.written();
    assert_eq!(written[0], 0x32);
    assert_eq!(written[1], 0x12);
    assert!(contains(&written, b"sensors/t"));
    assert!(contains(&written, b"22.5"));

    // PUBACK id 1, reason success.
    peer.queue(&[0x40, 0x03, 0x00, 0x01, 0x00]);
    let none = client.await_message(Duration::from_millis(20)).unwrap();
    assert!(none.is_none());
    assert_eq!(client.inflight(), 0);
}

#[test]
fn v5_qos2_exchange() {
    let peer = MockPeer::new();
    peer.queue(V5_CONNACK_OK);

    let mut client = Client::new(
        ConnectOptions::default()
            .with_protocol_level(ProtocolLevel::V5)
            .with_client_id("pub-2"),
    );
    client.connect_with_transport(peer.transport()).unwrap();
    peer.clear_written();

    let packet_id = client
        .publish(
            "jobs/done",
            b"ok",
            &PublishOptions::new().with_qos(QoS::ExactOnce),
        )
        .unwrap();
    assert_eq!(packet_id, 1);
    assert_eq!(client.inflight(), 1);

    // PUBREC triggers PUBREL.
    peer.clear_written();
    peer.queue(&[0x50, 0x02, 0x00, 0x01]);
    client.await_message(Duration::from_millis(20)).unwrap();
    assert!(contains(&peer.written(), &[0x62, 0x02, 0x00, 0x01]));
    assert_eq!(client.inflight(), 1);

    // PUBCOMP releases the slot and the id.
    peer.queue(&[0x70, 0x02, 0x00, 0x01]);
    client.await_message(Duration::from_millis(20)).unwrap();
    assert_eq!(client.inflight(), 0);
}

#[test]
fn v5_flow_control_blocks_at_receive_maximum() {
    let peer = MockPeer::new();
    // CONNACK advertising receive-maximum 1.
    peer.queue(&[0x20, 0x06, 0x00, 0x00, 0x03, 0x21, 0x00, 0x01]);

    let mut client = Client::new(
        ConnectOptions::default()
            .with_protocol_level(ProtocolLevel::V5)
            .with_client_id("pub-3"),
    );
    client.connect_with_transport(peer.transport()).unwrap();

    let first = client
        .publish(
            "q/a",
            b"1",
            &PublishOptions::new().with_qos(QoS::AtLeastOnce),
        )
        .unwrap();
    assert_eq!(first, 1);

    // The window is full and nothing acknowledges: admission times out.
    let err = client
        .publish(
            "q/b",
            b"2",
            &PublishOptions::new()
                .with_qos(QoS::AtLeastOnce)
                .with_admission_timeout(Duration::from_millis(30)),
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FlowControlTimeout);
    assert_eq!(client.inflight(), 1);

    // Acknowledge the first exchange; the next publish is admitted.
    peer.queue(&[0x40, 0x03, 0x00, 0x01, 0x00]);
    let third = client
        .publish(
            "q/c",
            b"3",
            &PublishOptions::new().with_qos(QoS::AtLeastOnce),
        )
        .unwrap();
    assert_eq!(third, 3);
    assert_eq!(client.inflight(), 1);
}

#[test]
fn v5_topic_alias_resends_topic_on_reuse() {
    let peer = MockPeer::new();
    // CONNACK advertising topic-alias-maximum 8.
    peer.queue(&[0x20, 0x06, 0x00, 0x00, 0x03, 0x22, 0x00, 0x08]);

    let mut client = Client::new(
        ConnectOptions::default()
            .with_protocol_level(ProtocolLevel::V5)
            .with_client_id("alias-1")
            .with_topic_alias_maximum(2),
    );
    client.connect_with_transport(peer.transport()).unwrap();

    let options = PublishOptions::new();
    peer.clear_written();
    client.publish("a/b", b"x", &options).unwrap();
    let first = peer.written();
    // Topic string plus alias property 1.
    assert!(contains(&first, b"a/b"));
    assert!(contains(&first, &[0x23, 0x00, 0x01]));

    peer.clear_written();
    client.publish("a/b", b"x", &options).unwrap();
    let second = peer.written();
    // Reuse keeps sending the topic string alongside the alias.
    assert!(contains(&second, b"a/b"));
    assert!(contains(&second, &[0x23, 0x00, 0x01]));

    peer.clear_written();
    client.publish("c/d", b"x", &options).unwrap();
    assert!(contains(&peer.written(), &[0x23, 0x00, 0x02]));

    peer.clear_written();
    client.publish("e/f", b"x", &options).unwrap();
    // Slots exhausted: no alias property for this topic.
    assert!(!contains(&peer.written(), &[0x23, 0x00]));
}

#[test]
fn v5_server_disconnect_without_reconnect() {
    let peer = MockPeer::new();
    peer.queue(V5_CONNACK_OK);

    let mut client = Client::new(
        ConnectOptions::default()
            .with_protocol_level(ProtocolLevel::V5)
            .with_client_id("dc-1"),
    );
    let events: Rc<RefCell<Vec<ClientEvent>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&events);
    client.on_event(move |event| sink.borrow_mut().push(event.clone()));

    client.connect_with_transport(peer.transport()).unwrap();

    // DISCONNECT, reason 0x8E (session taken over).
    peer.queue(&[0xe0, 0x02, 0x8e, 0x00]);
    let err = client
        .await_message(Duration::from_millis(20))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ServerDisconnected(0x8e));
    assert_eq!(client.status(), ClientStatus::Disconnected);

    let events = events.borrow();
    assert_eq!(events.len(), 1);
    let ClientEvent::ServerDisconnect {
        packet,
        will_reconnect,
    } = &events[0];
    assert_eq!(u8::from(packet.reason_code()), 0x8e);
    assert!(!will_reconnect);
}

#[test]
fn v5_session_restore_replays_pubrel() {
    let dir = std::env::temp_dir().join(format!("fengbo-restore-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    let store = Rc::new(FileSessionStore::new(&dir).unwrap());

    let mut state = SessionState::new();
    state.insert_subscription(
        "sensors/#",
        SubscriptionEntry {
            qos: QoS::AtLeastOnce,
            options: None,
        },
    );
    state.add_pending_qos2(42);
    state.touch();
    store.save("restore-1", &state).unwrap();

    let peer = MockPeer::new();
    // CONNACK with session-present set.
    peer.queue(&[0x20, 0x03, 0x01, 0x00, 0x00]);

    let mut client = Client::new(
        ConnectOptions::default()
            .with_protocol_level(ProtocolLevel::V5)
            .with_client_id("restore-1")
            .with_clean_session(false)
            .with_session_store(store),
    );
    client.connect_with_transport(peer.transport()).unwrap();

    // The pending QoS 2 exchange resumes at the release stage.
    assert!(contains(&peer.written(), &[0x62, 0x02, 0x00, 0x2a]));
    assert_eq!(client.inflight(), 1);
}

#[test]
fn v5_session_lost_on_server_clears_local_state() {
    let dir = std::env::temp_dir().join(format!("fengbo-lost-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    let store = Rc::new(FileSessionStore::new(&dir).unwrap());

    let mut state = SessionState::new();
    state.add_pending_qos2(42);
    state.touch();
    store.save("lost-1", &state).unwrap();

    let peer = MockPeer::new();
    // CONNACK without session-present: the server lost the session.
    peer.queue(V5_CONNACK_OK);

    let mut client = Client::new(
        ConnectOptions::default()
            .with_protocol_level(ProtocolLevel::V5)
            .with_client_id("lost-1")
            .with_clean_session(false)
            .with_session_store(Rc::clone(&store) as Rc<dyn SessionStore>),
    );
    client.connect_with_transport(peer.transport()).unwrap();

    // No release replay, and the stale document is gone.
    assert!(!contains(&peer.written(), &[0x62, 0x02, 0x00, 0x2a]));
    assert_eq!(client.inflight(), 0);
}

#[test]
fn v5_subscribe_updates_registry_and_returns_codes() {
    let peer = MockPeer::new();
    peer.queue(V5_CONNACK_OK);
    // SUBACK id 1: granted QoS 1, second filter refused (0x87).
    peer.queue(&[0x90, 0x05, 0x00, 0x01, 0x00, 0x01, 0x87]);

    let mut client = Client::new(
        ConnectOptions::default()
            .with_protocol_level(ProtocolLevel::V5)
            .with_client_id("sub-1"),
    );
    client.connect_with_transport(peer.transport()).unwrap();

    let codes = client
        .subscribe_many(&[
            ("sensors/#".to_string(), SubscribeOptions::new(QoS::ExactOnce)),
            ("secret/#".to_string(), SubscribeOptions::new(QoS::AtLeastOnce)),
        ])
        .unwrap();
    assert_eq!(codes, vec![0x01, 0x87]);
}

#[test]
fn v5_inbound_qos2_is_idempotent() {
    let peer = MockPeer::new();
    peer.queue(V5_CONNACK_OK);

    let mut client = Client::new(
        ConnectOptions::default()
            .with_protocol_level(ProtocolLevel::V5)
            .with_client_id("in-q2"),
    );
    let deliveries = Rc::new(RefCell::new(0_usize));
    let counter = Rc::clone(&deliveries);
    client.connect_with_transport(peer.transport()).unwrap();

    // PUBLISH qos2 id 9 on t/x, payload "p".
    let publish = [
        0x34, 0x09, 0x00, 0x03, b't', b'/', b'x', 0x00, 0x09, 0x00, b'p',
    ];
    // The same transmission replayed with DUP set.
    let mut dup_publish = publish;
    dup_publish[0] = 0x3c;
    peer.queue(&publish);
    peer.queue(&dup_publish);
    // PUBREL id 9, twice.
    peer.queue(&[0x62, 0x02, 0x00, 0x09]);
    peer.queue(&[0x62, 0x02, 0x00, 0x09]);
    // Normal server disconnect ends the run loop.
    peer.queue(&[0xe0, 0x00]);

    peer.clear_written();
    client
        .run(
            move |_message| {
                *counter.borrow_mut() += 1;
            },
            Duration::from_millis(1),
        )
        .unwrap();

    // One delivery despite the duplicate transmission.
    assert_eq!(*deliveries.borrow(), 1);
    let written = peer.written();
    // Two PUBREC answers, and every PUBREL got its PUBCOMP.
    let pubrec = [0x50, 0x02, 0x00, 0x09];
    let pubcomp = [0x70, 0x02, 0x00, 0x09];
    assert_eq!(written.windows(4).filter(|w| *w == pubrec).count(), 2);
    assert_eq!(written.windows(4).filter(|w| *w == pubcomp).count(), 2);
}

#[test]
fn message_filters_drop_unmatched_topics() {
    let peer = MockPeer::new();
    peer.queue(V5_CONNACK_OK);

    let mut client = Client::new(
        ConnectOptions::default()
            .with_protocol_level(ProtocolLevel::V5)
            .with_client_id("filter-1")
            .with_message_filters(vec!["sensors/#".to_string()]),
    );
    client.connect_with_transport(peer.transport()).unwrap();

    // QoS 0 publishes on a matching and a non-matching topic.
    peer.queue(&[
        0x30, 0x0d, 0x00, 0x09, b's', b'e', b'n', b's', b'o', b'r', b's', b'/', b't', 0x00,
        b'1',
    ]);
    peer.queue(&[
        0x30, 0x0b, 0x00, 0x07, b'a', b'l', b'e', b'r', b't', b'/', b'x', 0x00, b'2',
    ]);

    let first = client
        .await_message(Duration::from_millis(30))
        .unwrap()
        .expect("matching message");
    assert_eq!(first.topic, "sensors/t");
    assert_eq!(first.payload, b"1");

    let second = client.await_message(Duration::from_millis(30)).unwrap();
    assert!(second.is_none());
}

#[test]
fn v5_invalid_inbound_alias_disconnects_with_0x94() {
    let peer = MockPeer::new();
    peer.queue(V5_CONNACK_OK);

    let mut client = Client::new(
        ConnectOptions::default()
            .with_protocol_level(ProtocolLevel::V5)
            .with_client_id("alias-err")
            .with_topic_alias_maximum(2),
    );
    client.connect_with_transport(peer.transport()).unwrap();
    peer.clear_written();

    // QoS 0 publish with alias 9, above the advertised maximum of 2.
    peer.queue(&[
        0x30, 0x0a, 0x00, 0x03, b'a', b'/', b'b', 0x03, 0x23, 0x00, 0x09, b'x',
    ]);
    let err = client
        .await_message(Duration::from_millis(20))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProtocolError);
    assert_eq!(client.status(), ClientStatus::Disconnected);
    // Outgoing DISCONNECT with reason 0x94 (topic alias invalid).
    assert!(contains(&peer.written(), &[0xe0, 0x02, 0x94]));
}

#[test]
fn keep_alive_sends_ping_after_half_interval() {
    let peer = MockPeer::new();
    peer.queue(V5_CONNACK_OK);

    let mut client = Client::new(
        ConnectOptions::default()
            .with_protocol_level(ProtocolLevel::V5)
            .with_client_id("ka-1")
            .with_keep_alive(Duration::from_secs(1)),
    );
    client.connect_with_transport(peer.transport()).unwrap();
    peer.clear_written();

    let started = std::time::Instant::now();
    while !contains(&peer.written(), &[0xc0, 0x00]) {
        assert!(
            started.elapsed() < Duration::from_secs(1),
            "no ping request within the keep-alive interval"
        );
        let _ = client.await_message(Duration::from_millis(5)).unwrap();
    }
    // The ping went out at half the keep-alive, not before.
    assert!(started.elapsed() >= Duration::from_millis(400));
}
