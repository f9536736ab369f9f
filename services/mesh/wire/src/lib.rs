//! Application message record and line codec for mesh.
//!
//! Every application message travels as one flat, pipe-delimited line and is
//! stored in the message log in exactly the same form.
//!
//! ## Line Format
//!
//! ```text
//! sender | direction | read | YYYY-MM-DD HH:MM:SS | topic | content
//! ```
//!
//! - `sender`: the sender's self-reported listening address (`ip:port`)
//! - `direction`: `0` for sent, `1` for received
//! - `read`: `0` / `1`
//! - `content` is the last field and may itself contain `|`

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod message;

pub use codec::{decode, decode_bytes, encode, FIELD_SEPARATOR, TIMESTAMP_FORMAT};
pub use error::WireError;
pub use message::{Direction, Message, EMPTY_TOPIC};
