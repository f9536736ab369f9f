//! The application message record exchanged between peers.

use chrono::{DateTime, Local};
use std::fmt;

use crate::codec::TIMESTAMP_FORMAT;
use crate::error::WireError;

/// Topic used when the user leaves the topic blank
pub const EMPTY_TOPIC: &str = "(empty)";

/// Whether a message was written by this node or arrived from a peer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Written locally and sent to one or more peers
    Sent,
    /// Received from a peer
    Received,
}

impl Direction {
    /// Numeric tag used on the wire
    pub fn tag(self) -> u8 {
        match self {
            Direction::Sent => 0,
            Direction::Received => 1,
        }
    }

    /// Parse the numeric wire tag
    pub fn from_tag(tag: &str) -> Result<Self, WireError> {
        match tag.trim() {
            "0" => Ok(Direction::Sent),
            "1" => Ok(Direction::Received),
            other => Err(WireError::Direction(other.to_string())),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Sent => write!(f, "sent"),
            Direction::Received => write!(f, "received"),
        }
    }
}

/// One application message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// Listening address of the node that wrote the message
    pub peer_id: String,
    /// Short subject line
    pub topic: String,
    /// Message body
    pub content: String,
    /// Sent or received, from this node's point of view
    pub direction: Direction,
    /// Whether the user has opened the message
    pub read: bool,
    /// Local creation time
    pub timestamp: DateTime<Local>,
}

impl Message {
    /// Create an unread message stamped with the current local time
    pub fn new(
        peer_id: impl Into<String>,
        topic: impl Into<String>,
        content: impl Into<String>,
        direction: Direction,
    ) -> Self {
        Self {
            peer_id: peer_id.into(),
            topic: topic.into(),
            content: content.into(),
            direction,
            read: false,
            timestamp: Local::now(),
        }
    }

    /// Copy of this message re-tagged as received.
    ///
    /// The sender encodes its own copy as `Sent`; whatever arrives over a
    /// socket is stored as `Received` regardless of the tag it carried.
    pub fn into_received(mut self) -> Self {
        self.direction = Direction::Received;
        self
    }

    /// Mark the message as read
    pub fn mark_read(&mut self) {
        self.read = true;
    }

    /// One-line listing used by the inbox
    pub fn summary(&self) -> String {
        format!(
            "[{}] Topic: {} | PeerID: {}",
            self.timestamp.format(TIMESTAMP_FORMAT),
            self.topic,
            self.peer_id
        )
    }
}
