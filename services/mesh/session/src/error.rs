//! Session and registry error types.

use thiserror::Error;

/// Errors surfaced by the session layer
#[derive(Error, Debug)]
pub enum SessionError {
    /// Socket or runtime I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// `start_listening` called on a registry that already listens
    #[error("already listening as {0}")]
    AlreadyListening(String),

    /// The registry's event loop has been stopped
    #[error("event loop is not running")]
    EventLoopStopped,
}
