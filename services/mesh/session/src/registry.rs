//! Connection registry.
//!
//! Owns the listener, the accept loop, outbound dialing, the address handshake
//! and the table mapping peer identity to session. The table (including
//! pending dials) sits behind one mutex; every read, write and iteration goes
//! through it. Socket work runs on the registry's own event loop thread, so
//! the public API is synchronous and safe to call from a foreground thread.
//!
//! Per peer relationship the registry moves through
//! `Unknown -> Connecting -> Connected (temporary key) -> Connected (identified) -> Removed`,
//! with accepted connections entering directly at the temporary key.

use async_trait::async_trait;
use bytes::Bytes;
use mesh_storage::MessageLog;
use mesh_wire::Message;
use once_cell::sync::OnceCell;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::SessionError;
use crate::event_loop::EventLoop;
use crate::handshake::{build_handshake, parse_handshake};
use crate::session::{LinkDirection, PeerSession, SessionHandler, DISCONNECT_NOTICE};
use crate::transport::{self, UNKNOWN_HOST};

/// Callback invoked with a peer's identity when it is removed
pub type DisconnectObserver = Arc<dyn Fn(&str) + Send + Sync>;

/// Receiving side of the registry's event channel
pub type RegistryEvents = mpsc::UnboundedReceiver<RegistryEvent>;

/// Registry configuration
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// IP the listener binds to
    pub bind_ip: IpAddr,
    /// Advertise this IP instead of probing for one
    pub advertise_ip: Option<IpAddr>,
    /// Host dialed to learn the outbound local IP
    pub probe_addr: SocketAddr,
    /// Timeout for the address probe
    pub probe_timeout: Duration,
    /// How long shutdown waits for queued writes to flush
    pub shutdown_grace: Duration,
    /// Name of the event loop thread
    pub thread_name: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            advertise_ip: None,
            probe_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 53),
            probe_timeout: Duration::from_secs(3),
            shutdown_grace: Duration::from_millis(500),
            thread_name: "mesh-event-loop".to_string(),
        }
    }
}

/// Notifications published by the registry, from the event loop thread
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    /// Listener is up and the node advertises `address`
    Listening {
        /// Advertised address
        address: String,
    },
    /// A session was registered
    PeerConnected {
        /// Key the session was registered under
        peer_id: String,
        /// Accepted or dialed
        direction: LinkDirection,
    },
    /// An outbound dial failed; no entry was created
    ConnectFailed {
        /// Dialed address
        address: String,
        /// Error text
        reason: String,
    },
    /// A peer announced its listening address
    HandshakeReceived {
        /// Session key at the time of receipt
        peer_id: String,
        /// Announced address
        announced: String,
    },
    /// A session moved to a new identity key
    PeerRekeyed {
        /// Previous key
        old_id: String,
        /// New key
        new_id: String,
    },
    /// An application message arrived and was logged
    MessageReceived {
        /// Decoded message, marked as received
        message: Message,
    },
    /// A registered peer was removed
    PeerDisconnected {
        /// Identity of the removed peer
        peer_id: String,
    },
}

#[derive(Default)]
struct PeerTable {
    sessions: HashMap<String, Arc<PeerSession>>,
    connecting: HashSet<String>,
    /// Open links that lost their entry to another session, filed under the
    /// identity they also serve. They close when that identity is removed.
    retired: HashMap<String, Vec<Arc<PeerSession>>>,
}

impl PeerTable {
    fn is_registered(&self, key: &str, session: &Arc<PeerSession>) -> bool {
        self.sessions
            .get(key)
            .is_some_and(|existing| Arc::ptr_eq(existing, session))
    }

    /// Register `session` as `key`. Returns true if another session was
    /// displaced; it is retired under `key`.
    fn insert(&mut self, key: &str, session: &Arc<PeerSession>) -> bool {
        match self.sessions.insert(key.to_string(), session.clone()) {
            Some(previous) if !Arc::ptr_eq(&previous, session) => {
                self.retire(key, previous);
                true
            }
            _ => false,
        }
    }

    fn retire(&mut self, identity: &str, link: Arc<PeerSession>) {
        self.retired.entry(identity.to_string()).or_default().push(link);
    }

    /// Retire entries other than `keep` whose remote announced `address`
    fn retire_duplicates(&mut self, address: &str, keep: &Arc<PeerSession>) -> Vec<String> {
        let stale: Vec<String> = self
            .sessions
            .iter()
            .filter(|(key, session)| {
                key.as_str() != address
                    && !Arc::ptr_eq(session, keep)
                    && session.announced_address().as_deref() == Some(address)
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            if let Some(link) = self.sessions.remove(key) {
                self.retire(address, link);
            }
        }
        stale
    }

    /// Remove the entry for `identity` along with every link retired under it
    fn take_identity(&mut self, identity: &str) -> (Option<Arc<PeerSession>>, Vec<Arc<PeerSession>>) {
        let links = self.retired.remove(identity).unwrap_or_default();
        (self.sessions.remove(identity), links)
    }

    fn forget_retired(&mut self, session: &Arc<PeerSession>) {
        self.retired.retain(|_, links| {
            links.retain(|link| !Arc::ptr_eq(link, session));
            !links.is_empty()
        });
    }
}

struct RegistryInner {
    config: RegistryConfig,
    event_loop: EventLoop,
    table: Mutex<PeerTable>,
    own_address: OnceCell<String>,
    unbound_port: Mutex<Option<u16>>,
    listener_task: Mutex<Option<JoinHandle<()>>>,
    log: Arc<dyn MessageLog>,
    events: mpsc::UnboundedSender<RegistryEvent>,
    disconnect_observer: RwLock<Option<DisconnectObserver>>,
    shut_down: AtomicBool,
}

/// Cloneable handle to a peer registry and its event loop
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl ConnectionRegistry {
    /// Create a registry and start its event loop. Received messages are
    /// appended to `log`.
    pub fn new(
        config: RegistryConfig,
        log: Arc<dyn MessageLog>,
    ) -> Result<(Self, RegistryEvents), SessionError> {
        let event_loop = EventLoop::start(&config.thread_name)?;
        let (events, events_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(RegistryInner {
            config,
            event_loop,
            table: Mutex::new(PeerTable::default()),
            own_address: OnceCell::new(),
            unbound_port: Mutex::new(None),
            listener_task: Mutex::new(None),
            log,
            events,
            disconnect_observer: RwLock::new(None),
            shut_down: AtomicBool::new(false),
        });

        Ok((Self { inner }, events_rx))
    }

    /// Bind the listener, resolve the advertised address and start accepting.
    ///
    /// Returns the advertised address. Port 0 binds an ephemeral port.
    pub fn start_listening(&self, port: u16) -> Result<String, SessionError> {
        let inner = &self.inner;
        if let Some(own) = inner.own_address.get() {
            return Err(SessionError::AlreadyListening(own.clone()));
        }

        let bind_addr = SocketAddr::new(inner.config.bind_ip, port);
        let listener = {
            let _runtime = inner.event_loop.enter()?;
            match transport::listen_tcp(bind_addr) {
                Ok(listener) => listener,
                Err(e) => {
                    *lock(&inner.unbound_port) = Some(port);
                    return Err(e.into());
                }
            }
        };
        let local_port = listener.local_addr()?.port();

        let own = transport::advertised_address(
            inner.config.advertise_ip,
            inner.config.probe_addr,
            inner.config.probe_timeout,
            local_port,
        );
        if inner.own_address.set(own.clone()).is_err() {
            return Err(SessionError::AlreadyListening(own));
        }

        let task = inner
            .event_loop
            .spawn(accept_loop(Arc::downgrade(inner), listener))?;
        *lock(&inner.listener_task) = Some(task);

        info!("Listening on port {} as {}", local_port, own);
        inner.emit(RegistryEvent::Listening {
            address: own.clone(),
        });
        Ok(own)
    }

    /// Dial `address` (`host:port`) in the background.
    ///
    /// No-op if an entry or a pending dial for that exact string exists.
    pub fn connect(&self, address: &str) -> Result<(), SessionError> {
        let address = address.trim().to_string();
        {
            let mut table = self.inner.table();
            if table.sessions.contains_key(&address) || table.connecting.contains(&address) {
                debug!("Already connected or connecting to {}", address);
                return Ok(());
            }
            table.connecting.insert(address.clone());
        }
        self.inner.dial(address)
    }

    /// Write `payload` to the session registered as `identity`.
    ///
    /// Returns false, doing nothing, if there is no such peer.
    pub fn send_to(&self, identity: &str, payload: impl Into<Bytes>) -> bool {
        let table = self.inner.table();
        match table.sessions.get(identity) {
            Some(session) => {
                session.send(payload);
                true
            }
            None => {
                debug!("No peer registered as {}", identity);
                false
            }
        }
    }

    /// Write `payload` to every registered session; returns how many
    pub fn broadcast(&self, payload: impl Into<Bytes>) -> usize {
        let payload = payload.into();
        let table = self.inner.table();
        for session in table.sessions.values() {
            session.send(payload.clone());
        }
        table.sessions.len()
    }

    /// Summary line of every registered session, ordered by identity
    pub fn list_peers(&self) -> Vec<String> {
        let table = self.inner.table();
        let mut entries: Vec<(&String, &Arc<PeerSession>)> = table.sessions.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        let summaries = entries.into_iter().map(|(_, session)| session.summary()).collect();
        summaries
    }

    /// Registered identities, sorted
    pub fn peer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.table().sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Whether a session is registered as `identity`
    pub fn has_peer(&self, identity: &str) -> bool {
        self.inner.table().sessions.contains_key(identity)
    }

    /// Advertised `ip:port`. After a failed `start_listening(port)` this is
    /// `unknown:<port>`, and plain `unknown` before any attempt.
    pub fn own_address(&self) -> String {
        if let Some(own) = self.inner.own_address.get() {
            return own.clone();
        }
        match *lock(&self.inner.unbound_port) {
            Some(port) => format!("{}:{}", UNKNOWN_HOST, port),
            None => UNKNOWN_HOST.to_string(),
        }
    }

    /// Install the callback run with a peer's identity whenever it is
    /// removed. Replaces any previous observer.
    ///
    /// The callback always runs on the event loop thread, including for
    /// removals requested through `disconnect_peer`.
    pub fn register_disconnect_observer<F>(&self, observer: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let observer: DisconnectObserver = Arc::new(observer);
        *self
            .inner
            .disconnect_observer
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(observer);
    }

    /// Notify and drop the peer registered as `identity`, closing every link
    /// to it.
    ///
    /// Returns false if no such peer exists.
    pub fn disconnect_peer(&self, identity: &str) -> bool {
        let (removed, retired) = self.inner.table().take_identity(identity);
        close_links(&retired);
        match removed {
            Some(session) => {
                self.inner.finish_removal(identity, &session);
                true
            }
            None => false,
        }
    }

    /// Close the listener, notify and drop every peer, then stop the event
    /// loop. Later calls do nothing.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(task) = lock(&inner.listener_task).take() {
            task.abort();
        }

        let (registered, links) = {
            let mut table = inner.table();
            table.connecting.clear();
            let mut links: Vec<Arc<PeerSession>> =
                table.sessions.drain().map(|(_, session)| session).collect();
            let registered = links.len();
            links.extend(table.retired.drain().flat_map(|(_, retired)| retired));
            (registered, links)
        };

        close_links(&links);
        let writers: Vec<JoinHandle<()>> = links
            .iter()
            .filter_map(|link| link.take_writer_task())
            .collect();

        info!(
            "Shutting down registry, {} peer(s) notified over {} link(s)",
            registered,
            links.len()
        );
        inner.event_loop.stop(writers, inner.config.shutdown_grace);
    }
}

impl RegistryInner {
    fn table(&self) -> MutexGuard<'_, PeerTable> {
        lock(&self.table)
    }

    fn emit(&self, event: RegistryEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    fn is_own_address(&self, address: &str) -> bool {
        self.own_address.get().is_some_and(|own| own == address)
    }

    fn dial(self: &Arc<Self>, address: String) -> Result<(), SessionError> {
        let registry = Arc::downgrade(self);
        let target = address.clone();
        let spawned = self.event_loop.spawn(async move {
            let result = transport::connect_tcp(&target).await;
            let Some(inner) = registry.upgrade() else {
                return;
            };
            match result {
                Ok(stream) => {
                    info!("Connected to peer {}", target);
                    inner.register_session(stream, target, LinkDirection::Outbound);
                }
                Err(e) => {
                    error!("Failed to connect to {}: {}", target, e);
                    inner.table().connecting.remove(&target);
                    inner.emit(RegistryEvent::ConnectFailed {
                        address: target,
                        reason: e.to_string(),
                    });
                }
            }
        });

        if let Err(e) = spawned {
            self.table().connecting.remove(&address);
            return Err(e);
        }
        Ok(())
    }

    /// Must run on the event loop.
    fn register_session(self: &Arc<Self>, stream: TcpStream, key: String, direction: LinkDirection) {
        let handler: Arc<dyn SessionHandler> = Arc::new(RegistryHandler {
            registry: Arc::downgrade(self),
        });
        let session = PeerSession::new(stream, key.clone(), direction, handler);

        let retired = {
            let mut table = self.table();
            table.connecting.remove(&key);
            if table.insert(&key, &session) {
                debug!(peer = %key, "Replaced existing entry");
            }
            if direction == LinkDirection::Outbound {
                table.retire_duplicates(&key, &session)
            } else {
                Vec::new()
            }
        };
        for stale in retired {
            debug!(peer = %key, "Retired temporary entry {}", stale);
        }

        session.start_receiving();
        if let Some(own) = self.own_address.get() {
            session.send(build_handshake(own));
        }

        info!(peer = %key, "Peer connected ({})", direction);
        self.emit(RegistryEvent::PeerConnected {
            peer_id: key,
            direction,
        });
    }

    fn handle_payload(self: &Arc<Self>, session: &Arc<PeerSession>, payload: Bytes) {
        if let Some(announced) = parse_handshake(&payload) {
            self.handle_handshake(session, announced);
            return;
        }

        let Ok(message) = mesh_wire::decode_bytes(&payload) else {
            return;
        };
        let message = message.into_received();

        self.rekey(session, &message.peer_id);

        if let Err(e) = self.log.append(message.clone()) {
            warn!("Failed to log message from {}: {}", message.peer_id, e);
        }
        info!(peer = %message.peer_id, "Received message, topic: {}", message.topic);
        self.emit(RegistryEvent::MessageReceived { message });
    }

    fn handle_handshake(self: &Arc<Self>, session: &Arc<PeerSession>, announced: String) {
        session.set_announced_address(announced.clone());
        let key = session.peer_id();
        debug!(peer = %key, "Handshake announces {}", announced);
        self.emit(RegistryEvent::HandshakeReceived {
            peer_id: key.clone(),
            announced: announced.clone(),
        });

        if key == announced || self.is_own_address(&announced) {
            return;
        }

        let should_dial = {
            let mut table = self.table();
            let served_by_self = table
                .sessions
                .get(&announced)
                .map(|existing| Arc::ptr_eq(existing, session));
            match served_by_self {
                Some(false) => {
                    // Another link already serves this peer; keep this one
                    // open for reading but out of the table.
                    if table.is_registered(&key, session) {
                        if let Some(link) = table.sessions.remove(&key) {
                            table.retire(&announced, link);
                        }
                        debug!(peer = %announced, "Retired temporary entry {}", key);
                    }
                    false
                }
                Some(true) => false,
                None if table.connecting.contains(&announced) => false,
                None => {
                    table.connecting.insert(announced.clone());
                    true
                }
            }
        };

        if should_dial {
            info!("Dialing back {} announced by {}", announced, key);
            if let Err(e) = self.dial(announced.clone()) {
                warn!("Cannot dial {}: {}", announced, e);
            }
        }
    }

    fn rekey(&self, session: &Arc<PeerSession>, new_id: &str) {
        let old_id = session.peer_id();
        if new_id.is_empty() || old_id == new_id {
            return;
        }

        {
            let mut table = self.table();
            if !table.is_registered(&old_id, session) {
                return;
            }
            table.sessions.remove(&old_id);
            if table.insert(new_id, session) {
                debug!(peer = %new_id, "Previous session for {} retired", new_id);
            }
            session.set_peer_id(new_id);
        }

        info!("Re-keyed peer {} as {}", old_id, new_id);
        self.emit(RegistryEvent::PeerRekeyed {
            old_id,
            new_id: new_id.to_string(),
        });
    }

    fn handle_disconnect(self: &Arc<Self>, session: &Arc<PeerSession>) {
        let peer_id = session.peer_id();
        let retired = {
            let mut table = self.table();
            if table.is_registered(&peer_id, session) {
                Some(table.take_identity(&peer_id).1)
            } else {
                table.forget_retired(session);
                None
            }
        };

        match retired {
            Some(links) => {
                close_links(&links);
                self.finish_removal(&peer_id, session);
            }
            None => {
                session.close();
                debug!(peer = %peer_id, "Unregistered link closed");
            }
        }
    }

    /// Runs after `session` left the table, outside the lock.
    fn finish_removal(self: &Arc<Self>, peer_id: &str, session: &Arc<PeerSession>) {
        session.send(Bytes::from_static(DISCONNECT_NOTICE));
        session.close();
        info!(peer = %peer_id, "Peer removed");

        if self.event_loop.on_loop_thread() {
            self.report_removal(peer_id);
            return;
        }
        let inner = Arc::clone(self);
        let peer_id = peer_id.to_string();
        if let Err(e) = self
            .event_loop
            .spawn(async move { inner.report_removal(&peer_id) })
        {
            warn!("Removal not reported: {}", e);
        }
    }

    fn report_removal(&self, peer_id: &str) {
        let observer = self
            .disconnect_observer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(observer) = observer {
            observer(peer_id);
        }
        self.emit(RegistryEvent::PeerDisconnected {
            peer_id: peer_id.to_string(),
        });
    }
}

struct RegistryHandler {
    registry: Weak<RegistryInner>,
}

#[async_trait]
impl SessionHandler for RegistryHandler {
    async fn on_message(&self, session: &Arc<PeerSession>, payload: Bytes) {
        if let Some(inner) = self.registry.upgrade() {
            inner.handle_payload(session, payload);
        }
    }

    async fn on_disconnect(&self, session: &Arc<PeerSession>) {
        if let Some(inner) = self.registry.upgrade() {
            inner.handle_disconnect(session);
        }
    }
}

async fn accept_loop(registry: Weak<RegistryInner>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                let Some(inner) = registry.upgrade() else {
                    break;
                };
                debug!("Accepted connection from {}", remote);
                inner.register_session(stream, remote.to_string(), LinkDirection::Inbound);
            }
            Err(e) => {
                warn!("Accept failed: {}", e);
            }
        }
    }
}

/// Send the goodbye notice on links without an entry of their own and close them
fn close_links(links: &[Arc<PeerSession>]) {
    for link in links {
        link.send(Bytes::from_static(DISCONNECT_NOTICE));
        link.close();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
