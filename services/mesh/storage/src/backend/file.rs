//! File-backed message log: one line file per direction

use crate::{direction_of, LogBook, MessageLog, StorageError};
use mesh_wire::{decode, encode, Direction, Message};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// File holding the sent list
pub const SENT_LOG_FILE: &str = "sent.log";
/// File holding the received list
pub const RECEIVED_LOG_FILE: &str = "received.log";

/// Message log persisted as encoded lines.
///
/// Both lists are loaded at open time. Every change rewrites the whole file of
/// the affected list.
#[derive(Debug)]
pub struct FileLog {
    data_dir: PathBuf,
    book: Mutex<LogBook>,
}

impl FileLog {
    /// Open (or create) the log under `data_dir`
    pub fn open(data_dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)?;

        let book = LogBook {
            sent: load_lines(&data_dir.join(SENT_LOG_FILE))?,
            received: load_lines(&data_dir.join(RECEIVED_LOG_FILE))?,
        };
        info!(
            "Opened message log at {:?} ({} sent, {} received)",
            data_dir,
            book.sent.len(),
            book.received.len()
        );

        Ok(Self {
            data_dir,
            book: Mutex::new(book),
        })
    }

    /// Directory holding the log files
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn path_for(&self, direction: Direction) -> PathBuf {
        match direction {
            Direction::Sent => self.data_dir.join(SENT_LOG_FILE),
            Direction::Received => self.data_dir.join(RECEIVED_LOG_FILE),
        }
    }

    fn book(&self) -> MutexGuard<'_, LogBook> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn save(&self, book: &LogBook, direction: Direction) -> Result<(), StorageError> {
        let mut content = String::new();
        for msg in book.list(direction) {
            content.push_str(&encode(msg));
            content.push('\n');
        }
        fs::write(self.path_for(direction), content)?;
        Ok(())
    }
}

impl MessageLog for FileLog {
    fn append(&self, msg: Message) -> Result<(), StorageError> {
        let direction = msg.direction;
        debug!("log append direction={} peer={}", direction, msg.peer_id);

        let mut book = self.book();
        book.list_mut(direction).push(msg);
        self.save(&book, direction)
    }

    fn delete_at(&self, index: usize, sent: bool) -> Result<(), StorageError> {
        let direction = direction_of(sent);
        let mut book = self.book();
        if !book.remove(index, direction) {
            debug!("log delete index={} sent={} out of range", index, sent);
            return Ok(());
        }
        self.save(&book, direction)
    }

    fn list(&self, direction: Direction) -> Vec<Message> {
        self.book().list(direction).clone()
    }
}

fn load_lines(path: &Path) -> Result<Vec<Message>, StorageError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut messages = Vec::new();
    let mut skipped = 0usize;
    for line in content.lines().filter(|line| !line.is_empty()) {
        match decode(line) {
            Ok(msg) => messages.push(msg),
            Err(_) => skipped += 1,
        }
    }
    if skipped > 0 {
        warn!("Skipped {} malformed lines in {:?}", skipped, path);
    }
    Ok(messages)
}
