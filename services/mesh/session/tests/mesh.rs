//! Multi-node tests: several registries in one process talking over
//! localhost TCP.

mod common;

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::Duration;

use common::{converged, wait_until, TestNode, SETTLE};
use mesh_session::{
    LinkDirection, RegistryEvent, SessionError, DISCONNECT_NOTICE, HANDSHAKE_MARKER,
};
use mesh_storage::MessageLog;
use mesh_wire::{encode, Direction, Message};

fn drain_messages(node: &mut TestNode) -> Vec<Message> {
    let mut messages = Vec::new();
    while let Ok(event) = node.events.try_recv() {
        if let RegistryEvent::MessageReceived { message } = event {
            messages.push(message);
        }
    }
    messages
}

#[test]
fn two_nodes_converge_and_exchange_messages() {
    let mut a = TestNode::start();
    let mut b = TestNode::start();

    a.registry.connect(&b.address).unwrap();
    assert!(converged(&a, &b), "a={:?} b={:?}", a.registry.peer_ids(), b.registry.peer_ids());

    assert!(a.registry.send_to(&b.address, a.message("greeting", "hello | from a")));
    let event = b
        .wait_for_event(|e| matches!(e, RegistryEvent::MessageReceived { .. }))
        .expect("b received nothing");
    let RegistryEvent::MessageReceived { message } = event else {
        unreachable!()
    };
    assert_eq!(message.peer_id, a.address);
    assert_eq!(message.topic, "greeting");
    assert_eq!(message.content, "hello | from a");
    assert_eq!(message.direction, Direction::Received);

    assert!(b.registry.send_to(&a.address, b.message("reply", "hi a")));
    let event = a
        .wait_for_event(|e| matches!(e, RegistryEvent::MessageReceived { .. }))
        .expect("a received nothing");
    let RegistryEvent::MessageReceived { message } = event else {
        unreachable!()
    };
    assert_eq!(message.peer_id, b.address);
    assert_eq!(message.content, "hi a");

    // Incoming messages land in the received log only.
    assert_eq!(a.log.list(Direction::Received).len(), 1);
    assert!(a.log.list(Direction::Sent).is_empty());
    assert_eq!(b.log.list(Direction::Received)[0].content, "hello | from a");

    // Both sides are still keyed by listening address after the exchange.
    assert_eq!(a.registry.peer_ids(), vec![b.address.clone()]);
    assert_eq!(b.registry.peer_ids(), vec![a.address.clone()]);
    assert!(a.registry.list_peers()[0].starts_with(&format!("Address: {} | Last active:", b.address)));
}

#[test]
fn connect_twice_creates_one_entry() {
    let a = TestNode::start();
    let b = TestNode::start();

    a.registry.connect(&b.address).unwrap();
    a.registry.connect(&b.address).unwrap();

    assert!(converged(&a, &b));
    assert_eq!(a.registry.list_peers().len(), 1);

    // Once connected, a further connect is ignored too.
    a.registry.connect(&b.address).unwrap();
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(a.registry.peer_ids(), vec![b.address.clone()]);
}

#[test]
fn accepting_node_dials_back_announced_address() {
    let mut x = TestNode::start();
    let y = TestNode::start();

    y.registry.connect(&x.address).unwrap();

    let announced = x
        .wait_for_event(|e| matches!(e, RegistryEvent::HandshakeReceived { .. }))
        .expect("no handshake");
    assert!(matches!(
        announced,
        RegistryEvent::HandshakeReceived { ref announced, .. } if *announced == y.address
    ));

    let dialed = x.wait_for_event(|e| {
        matches!(
            e,
            RegistryEvent::PeerConnected { peer_id, direction: LinkDirection::Outbound } if *peer_id == y.address
        )
    });
    assert!(dialed.is_some(), "x never dialed y back");

    // The accepted link's ephemeral key is gone.
    assert!(converged(&x, &y));
}

#[test]
fn broadcast_reaches_every_peer() {
    let mut hub = TestNode::start();
    let mut s1 = TestNode::start();
    let mut s2 = TestNode::start();

    s1.registry.connect(&hub.address).unwrap();
    s2.registry.connect(&hub.address).unwrap();

    let mut expected = vec![s1.address.clone(), s2.address.clone()];
    expected.sort();
    let settled = || {
        hub.registry.peer_ids() == expected
            && s1.registry.peer_ids() == vec![hub.address.clone()]
            && s2.registry.peer_ids() == vec![hub.address.clone()]
    };
    assert!(wait_until(settled));
    std::thread::sleep(Duration::from_millis(200));
    assert!(wait_until(settled));

    let payload = hub.message("news", "to all peers");
    assert_eq!(hub.registry.broadcast(payload.clone()), 2);

    for spoke in [&mut s1, &mut s2] {
        let event = spoke
            .wait_for_event(|e| matches!(e, RegistryEvent::MessageReceived { .. }))
            .expect("spoke received nothing");
        let RegistryEvent::MessageReceived { message } = event else {
            unreachable!()
        };
        assert_eq!(message.peer_id, hub.address);
        assert_eq!(message.content, "to all peers");
        assert_eq!(message.topic, "news");
    }
    assert!(drain_messages(&mut hub).is_empty());
}

#[test]
fn remote_close_removes_peer_exactly_once() {
    let a = TestNode::unbound();
    let remote = TcpListener::bind("127.0.0.1:0").unwrap();
    let remote_addr = remote.local_addr().unwrap().to_string();

    a.registry.connect(&remote_addr).unwrap();
    let (accepted, _) = remote.accept().unwrap();
    assert!(wait_until(|| a.registry.has_peer(&remote_addr)));

    drop(accepted);
    assert!(wait_until(|| a.disconnects() == vec![remote_addr.clone()]));
    assert!(a.registry.peer_ids().is_empty());

    // A later removal attempt finds nothing and stays silent.
    assert!(!a.registry.disconnect_peer(&remote_addr));
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(a.disconnects().len(), 1);
}

#[test]
fn disconnect_peer_notifies_observer_once() {
    let a = TestNode::start();
    let b = TestNode::start();
    a.registry.connect(&b.address).unwrap();
    assert!(converged(&a, &b));

    assert!(a.registry.disconnect_peer(&b.address));
    assert!(!a.registry.disconnect_peer(&b.address));

    assert!(a.registry.peer_ids().is_empty());
    assert!(!a.registry.send_to(&b.address, a.message("t", "after removal")));

    // The observer runs on the event loop, so it lands shortly after.
    assert!(wait_until(|| a.disconnects() == vec![b.address.clone()]));
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(a.disconnects().len(), 1);
}

#[test]
fn disconnect_peer_tears_down_both_directions() {
    let a = TestNode::start();
    let b = TestNode::start();
    a.registry.connect(&b.address).unwrap();
    assert!(converged(&a, &b));

    assert!(a.registry.disconnect_peer(&b.address));

    // b loses its entry for a and reports it once.
    assert!(wait_until(|| b.registry.peer_ids().is_empty()));
    assert!(wait_until(|| b.disconnects() == vec![a.address.clone()]));

    // Nothing b sends can reach a any more.
    assert!(!b.registry.send_to(&a.address, b.message("t", "after removal")));
    assert_eq!(b.registry.broadcast(b.message("t", "after removal")), 0);
    std::thread::sleep(Duration::from_millis(300));
    assert!(a.log.list(Direction::Received).is_empty());
    assert!(a.registry.peer_ids().is_empty());
    assert_eq!(a.disconnects(), vec![b.address.clone()]);
    assert_eq!(b.disconnects().len(), 1);
}

#[test]
fn first_message_rekeys_temporary_entry() {
    let mut a = TestNode::start();
    let mut client = TcpStream::connect(&a.address).unwrap();
    let temp_key = client.local_addr().unwrap().to_string();
    assert!(wait_until(|| a.registry.peer_ids() == vec![temp_key.clone()]));

    let line = encode(&Message::new("10.9.9.9:7000", "intro", "hello", Direction::Sent));
    client.write_all(line.as_bytes()).unwrap();

    let rekeyed = a.wait_for_event(|e| matches!(e, RegistryEvent::PeerRekeyed { .. }));
    assert_eq!(
        rekeyed,
        Some(RegistryEvent::PeerRekeyed {
            old_id: temp_key,
            new_id: "10.9.9.9:7000".to_string(),
        })
    );
    assert_eq!(a.registry.peer_ids(), vec!["10.9.9.9:7000".to_string()]);

    assert!(wait_until(|| a.log.list(Direction::Received).len() == 1));
    let received = a.log.list(Direction::Received);
    assert_eq!(received[0].peer_id, "10.9.9.9:7000");
    assert_eq!(received[0].direction, Direction::Received);
}

#[test]
fn rekey_onto_served_identity_replaces_entry() {
    let mut a = TestNode::start();
    let identity = "10.9.9.9:7000".to_string();
    let line = encode(&Message::new(identity.clone(), "intro", "hello", Direction::Sent));

    let mut first = TcpStream::connect(&a.address).unwrap();
    assert!(wait_until(|| a.registry.peer_ids().len() == 1));
    first.write_all(line.as_bytes()).unwrap();
    assert!(wait_until(|| a.registry.peer_ids() == vec![identity.clone()]));

    let mut second = TcpStream::connect(&a.address).unwrap();
    let second_key = second.local_addr().unwrap().to_string();
    assert!(wait_until(|| a.registry.has_peer(&second_key)));
    second.write_all(line.as_bytes()).unwrap();

    let rekeyed = a.wait_for_event(|e| {
        matches!(e, RegistryEvent::PeerRekeyed { old_id, .. } if *old_id == second_key)
    });
    assert_eq!(
        rekeyed,
        Some(RegistryEvent::PeerRekeyed {
            old_id: second_key,
            new_id: identity.clone(),
        })
    );
    assert_eq!(a.registry.peer_ids(), vec![identity.clone()]);
    assert!(wait_until(|| a.log.list(Direction::Received).len() == 2));

    // Removing the identity closes the displaced link as well, reported once.
    assert!(a.registry.disconnect_peer(&identity));
    for client in [&mut first, &mut second] {
        client.set_read_timeout(Some(SETTLE)).unwrap();
        let mut received = Vec::new();
        client.read_to_end(&mut received).unwrap();
        assert!(received.ends_with(DISCONNECT_NOTICE));
    }
    assert!(wait_until(|| a.disconnects() == vec![identity.clone()]));
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(a.disconnects().len(), 1);
}

#[test]
fn malformed_payload_is_discarded() {
    let mut a = TestNode::start();
    let mut client = TcpStream::connect(&a.address).unwrap();
    assert!(wait_until(|| a.registry.peer_ids().len() == 1));

    client.write_all(b"not a mesh message").unwrap();
    std::thread::sleep(Duration::from_millis(300));

    assert!(drain_messages(&mut a).is_empty());
    assert!(a.log.read_all().is_empty());
    // The link itself survives.
    assert_eq!(a.registry.peer_ids().len(), 1);
}

#[test]
fn marker_prefixed_payload_is_taken_as_handshake() {
    let a = TestNode::start();
    let b = TestNode::start();
    let mut client = TcpStream::connect(&a.address).unwrap();
    assert!(wait_until(|| a.registry.peer_ids().len() == 1));

    // Content that happens to start with the marker triggers a dial.
    let payload = format!("{}{}", HANDSHAKE_MARKER, b.address);
    client.write_all(payload.as_bytes()).unwrap();

    assert!(wait_until(|| a.registry.has_peer(&b.address)));
    assert!(wait_until(|| a.registry.peer_ids() == vec![b.address.clone()]));
    assert!(a.log.read_all().is_empty());
}

#[test]
fn shutdown_disconnects_remote_side() {
    let a = TestNode::start();
    let b = TestNode::start();
    a.registry.connect(&b.address).unwrap();
    assert!(converged(&a, &b));

    a.registry.shutdown();

    assert!(a.registry.peer_ids().is_empty());
    assert!(wait_until(|| b.registry.peer_ids().is_empty()));
    assert!(wait_until(|| b.disconnects() == vec![a.address.clone()]));
    // Shutdown itself does not report peers as disconnected.
    assert!(a.disconnects().is_empty());
}

#[test]
fn bind_failure_keeps_outbound_working() {
    let occupied = TcpListener::bind("0.0.0.0:0").unwrap();
    let port = occupied.local_addr().unwrap().port();

    let a = TestNode::unbound();
    let b = TestNode::start();

    assert!(matches!(
        a.registry.start_listening(port),
        Err(SessionError::Io(_))
    ));
    assert_eq!(a.registry.own_address(), format!("unknown:{}", port));

    a.registry.connect(&b.address).unwrap();
    assert!(wait_until(|| a.registry.peer_ids() == vec![b.address.clone()]));
    // Without a handshake from a, b only knows the ephemeral address.
    assert!(wait_until(|| b.registry.peer_ids().len() == 1));
    assert_ne!(b.registry.peer_ids()[0], a.registry.own_address());
}
