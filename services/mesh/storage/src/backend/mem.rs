//! In-memory message log for development and testing

use crate::{direction_of, LogBook, MessageLog, StorageError};
use mesh_wire::{Direction, Message};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// In-memory message log
#[derive(Debug, Default)]
pub struct MemoryLog {
    book: Mutex<LogBook>,
}

impl MemoryLog {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    fn book(&self) -> MutexGuard<'_, LogBook> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MessageLog for MemoryLog {
    fn append(&self, msg: Message) -> Result<(), StorageError> {
        debug!("log append direction={} peer={}", msg.direction, msg.peer_id);
        self.book().list_mut(msg.direction).push(msg);
        Ok(())
    }

    fn delete_at(&self, index: usize, sent: bool) -> Result<(), StorageError> {
        let removed = self.book().remove(index, direction_of(sent));
        debug!("log delete index={} sent={} removed={}", index, sent, removed);
        Ok(())
    }

    fn list(&self, direction: Direction) -> Vec<Message> {
        self.book().list(direction).clone()
    }
}
