//! TCP sessions, address handshake and peer registry for mesh.
//!
//! This crate connects mesh nodes to each other: it accepts and dials TCP
//! connections, wraps each one in a [`PeerSession`], exchanges listening
//! addresses through a one-line handshake and keeps a [`ConnectionRegistry`]
//! mapping peer identity to session. Over time every pair of nodes that knows
//! of each other converges to one registered link per direction.
//!
//! ## Features
//!
//! - **TCP Transport**: listener with address reuse, async dialing, local IP probe
//! - **Handshake**: `HANDSHAKE:<ip:port>` announcement on every new link
//! - **Peer Sessions**: read loop with inline handler, queued writes
//! - **Registry**: identity re-keying, reciprocal dial-back, removal on failure
//! - **Event Loop**: one background thread running a current-thread runtime
//!
//! ## Example
//!
//! ```rust,no_run
//! use mesh_session::{ConnectionRegistry, RegistryConfig, RegistryEvent};
//! use mesh_storage::MemoryLog;
//! use std::sync::Arc;
//!
//! # fn example() -> Result<(), mesh_session::SessionError> {
//! let (registry, mut events) =
//!     ConnectionRegistry::new(RegistryConfig::default(), Arc::new(MemoryLog::new()))?;
//!
//! let own = registry.start_listening(5555)?;
//! println!("Listening as {}", own);
//!
//! registry.register_disconnect_observer(|peer| println!("Peer {} left", peer));
//! registry.connect("192.168.1.20:5555")?;
//!
//! while let Some(event) = events.blocking_recv() {
//!     if let RegistryEvent::MessageReceived { message } = event {
//!         println!("{}: {}", message.peer_id, message.content);
//!         break;
//!     }
//! }
//!
//! registry.shutdown();
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod event_loop;
pub mod handshake;
pub mod registry;
pub mod session;
pub mod transport;

// Re-export main types
pub use error::SessionError;
pub use event_loop::EventLoop;
pub use handshake::{build_handshake, parse_handshake, HANDSHAKE_MARKER};
pub use registry::{
    ConnectionRegistry, DisconnectObserver, RegistryConfig, RegistryEvent, RegistryEvents,
};
pub use session::{
    LinkDirection, PeerSession, SessionHandler, DISCONNECT_NOTICE, RECV_BUFFER_SIZE,
};
pub use transport::{advertised_address, connect_tcp, listen_tcp, probe_local_ip, UNKNOWN_HOST};
