//! Line encoding and decoding for application messages.
//!
//! A message is one line of six `|`-separated fields. Decoding is strict about
//! the first five fields; the sixth (content) takes the rest of the line.

use chrono::{Local, NaiveDateTime, TimeZone};

use crate::error::WireError;
use crate::message::{Direction, Message};

/// Separator between record fields
pub const FIELD_SEPARATOR: char = '|';

/// Timestamp layout, second precision, local time
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const FIELD_COUNT: usize = 6;

/// Encode a message into a single line (no trailing newline)
pub fn encode(msg: &Message) -> String {
    format!(
        "{peer}{sep}{dir}{sep}{read}{sep}{ts}{sep}{topic}{sep}{content}",
        peer = msg.peer_id,
        dir = msg.direction.tag(),
        read = u8::from(msg.read),
        ts = msg.timestamp.format(TIMESTAMP_FORMAT),
        topic = msg.topic,
        content = msg.content,
        sep = FIELD_SEPARATOR,
    )
}

/// Decode a line produced by [`encode`]
pub fn decode(line: &str) -> Result<Message, WireError> {
    let line = line.trim_end_matches(['\r', '\n']);
    let fields: Vec<&str> = line.splitn(FIELD_COUNT, FIELD_SEPARATOR).collect();
    if fields.len() < FIELD_COUNT {
        return Err(WireError::FieldCount {
            expected: FIELD_COUNT,
            found: fields.len(),
        });
    }

    let direction = Direction::from_tag(fields[1])?;
    let read = parse_read_flag(fields[2])?;

    let naive = NaiveDateTime::parse_from_str(fields[3], TIMESTAMP_FORMAT)
        .map_err(|_| WireError::Timestamp(fields[3].to_string()))?;
    let timestamp = Local
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| WireError::Timestamp(fields[3].to_string()))?;

    Ok(Message {
        peer_id: fields[0].to_string(),
        topic: fields[4].to_string(),
        content: fields[5].to_string(),
        direction,
        read,
        timestamp,
    })
}

/// Decode raw bytes read from a socket
pub fn decode_bytes(payload: &[u8]) -> Result<Message, WireError> {
    let line = std::str::from_utf8(payload).map_err(|_| WireError::Utf8)?;
    decode(line)
}

fn parse_read_flag(raw: &str) -> Result<bool, WireError> {
    match raw.trim() {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        other => Err(WireError::ReadFlag(other.to_string())),
    }
}
