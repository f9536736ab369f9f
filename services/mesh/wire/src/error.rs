//! Wire codec error types.

use thiserror::Error;

/// Errors raised while decoding a message line
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Fewer fields than a message record carries
    #[error("malformed message line: expected {expected} fields, found {found}")]
    FieldCount {
        /// Number of fields a record must have
        expected: usize,
        /// Number of fields present in the line
        found: usize,
    },

    /// Direction tag is not a known value
    #[error("unknown direction tag {0:?}")]
    Direction(String),

    /// Read flag is neither a boolean nor 0/1
    #[error("invalid read flag {0:?}")]
    ReadFlag(String),

    /// Timestamp does not match the record format
    #[error("invalid timestamp {0:?}")]
    Timestamp(String),

    /// Payload is not valid UTF-8
    #[error("payload is not valid utf-8")]
    Utf8,
}
