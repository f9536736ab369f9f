//! Shared helpers for mesh-session integration tests.

#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mesh_session::{ConnectionRegistry, RegistryConfig, RegistryEvent, RegistryEvents};
use mesh_storage::{MemoryLog, MessageLog};
use mesh_wire::{encode, Direction, Message};

/// Upper bound for anything the mesh should do "soon".
pub const SETTLE: Duration = Duration::from_secs(5);

static NODE_SEQ: AtomicUsize = AtomicUsize::new(0);

/// A registry listening on an ephemeral localhost port.
pub struct TestNode {
    pub registry: ConnectionRegistry,
    pub events: RegistryEvents,
    pub log: Arc<MemoryLog>,
    pub address: String,
    pub disconnects: Arc<Mutex<Vec<String>>>,
}

impl TestNode {
    pub fn start() -> Self {
        let mut node = Self::unbound();
        node.address = node.registry.start_listening(0).expect("listen");
        node
    }

    /// Registry with no listener.
    pub fn unbound() -> Self {
        let config = RegistryConfig {
            advertise_ip: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            thread_name: format!("mesh-test-{}", NODE_SEQ.fetch_add(1, Ordering::SeqCst)),
            shutdown_grace: Duration::from_millis(200),
            ..RegistryConfig::default()
        };
        let log = Arc::new(MemoryLog::new());
        let (registry, events) =
            ConnectionRegistry::new(config, log.clone() as Arc<dyn MessageLog>).expect("registry");

        let disconnects = Arc::new(Mutex::new(Vec::new()));
        let seen = disconnects.clone();
        registry.register_disconnect_observer(move |peer| seen.lock().unwrap().push(peer.to_string()));

        Self {
            registry,
            events,
            log,
            address: String::new(),
            disconnects,
        }
    }

    pub fn disconnects(&self) -> Vec<String> {
        self.disconnects.lock().unwrap().clone()
    }

    /// Encoded message written by this node.
    pub fn message(&self, topic: &str, content: &str) -> String {
        encode(&Message::new(self.address.clone(), topic, content, Direction::Sent))
    }

    /// Next event matching `pred`, skipping others.
    pub fn wait_for_event(
        &mut self,
        pred: impl Fn(&RegistryEvent) -> bool,
    ) -> Option<RegistryEvent> {
        let deadline = Instant::now() + SETTLE;
        while Instant::now() < deadline {
            match self.events.try_recv() {
                Ok(event) if pred(&event) => return Some(event),
                Ok(_) => continue,
                Err(_) => std::thread::sleep(Duration::from_millis(10)),
            }
        }
        None
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.registry.shutdown();
    }
}

/// Poll `cond` until it holds or `SETTLE` elapses.
pub fn wait_until(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + SETTLE;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    cond()
}

/// Wait until `a` and `b` each hold exactly one entry, keyed by the other,
/// and still do after the reciprocal link had time to land.
pub fn converged(a: &TestNode, b: &TestNode) -> bool {
    let settled = || {
        a.registry.peer_ids() == vec![b.address.clone()]
            && b.registry.peer_ids() == vec![a.address.clone()]
    };
    if !wait_until(settled) {
        return false;
    }
    std::thread::sleep(Duration::from_millis(200));
    wait_until(settled)
}
