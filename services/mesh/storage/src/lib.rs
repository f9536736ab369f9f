//! Message log for mesh: sent and received history with pluggable backends.
//!
//! The log keeps two ordered lists, one for messages this node sent and one
//! for messages it received. Indices are positions within one list and shift
//! down when an earlier entry is deleted.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;

use mesh_wire::{Direction, Message};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Append-only message history with delete-by-index
pub trait MessageLog: Send + Sync {
    /// Append a message to the list matching its direction
    fn append(&self, msg: Message) -> Result<(), StorageError>;

    /// Delete the entry at `index` of the sent (`sent = true`) or received list.
    ///
    /// Out-of-range indices are ignored.
    fn delete_at(&self, index: usize, sent: bool) -> Result<(), StorageError>;

    /// Messages of one direction, oldest first
    fn list(&self, direction: Direction) -> Vec<Message>;

    /// All messages: the sent list followed by the received list
    fn read_all(&self) -> Vec<Message> {
        let mut all = self.list(Direction::Sent);
        all.extend(self.list(Direction::Received));
        all
    }

    /// One-line summaries of one direction, in list order
    fn summaries(&self, direction: Direction) -> Vec<String> {
        self.list(direction).iter().map(Message::summary).collect()
    }
}

/// The two in-memory lists shared by every backend
#[derive(Debug, Default, Clone)]
pub struct LogBook {
    /// Messages written by this node
    pub sent: Vec<Message>,
    /// Messages received from peers
    pub received: Vec<Message>,
}

impl LogBook {
    /// List for a direction
    pub fn list(&self, direction: Direction) -> &Vec<Message> {
        match direction {
            Direction::Sent => &self.sent,
            Direction::Received => &self.received,
        }
    }

    /// Mutable list for a direction
    pub fn list_mut(&mut self, direction: Direction) -> &mut Vec<Message> {
        match direction {
            Direction::Sent => &mut self.sent,
            Direction::Received => &mut self.received,
        }
    }

    /// Remove an entry; returns false when the index is out of range
    pub fn remove(&mut self, index: usize, direction: Direction) -> bool {
        let list = self.list_mut(direction);
        if index >= list.len() {
            return false;
        }
        list.remove(index);
        true
    }
}

/// Storage backend configuration
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum StorageMode {
    /// In-memory log (tests, throwaway nodes)
    #[default]
    InMemory,
    /// Line files `sent.log` and `received.log` under a data directory
    File {
        /// Data directory path
        data_dir: PathBuf,
    },
}

pub use backend::file::FileLog;
pub use backend::mem::MemoryLog;

/// Open a message log from configuration
pub fn open_log(mode: StorageMode) -> Result<Arc<dyn MessageLog>, StorageError> {
    match mode {
        StorageMode::InMemory => Ok(Arc::new(MemoryLog::new())),
        StorageMode::File { data_dir } => Ok(Arc::new(FileLog::open(data_dir)?)),
    }
}

/// Map a delete request's `sent` flag to a direction
pub(crate) fn direction_of(sent: bool) -> Direction {
    if sent {
        Direction::Sent
    } else {
        Direction::Received
    }
}
