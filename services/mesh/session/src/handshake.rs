//! Address handshake for mesh sessions.
//!
//! Right after a session starts receiving, each side announces the address it
//! listens on as `HANDSHAKE:<ip:port>` in one raw write. The marker is a plain
//! prefix on the same channel as application payloads: any payload starting
//! with it is treated as a handshake.

use bytes::Bytes;

/// Prefix identifying a handshake payload
pub const HANDSHAKE_MARKER: &str = "HANDSHAKE:";

/// Build the handshake announcing `own_address`
pub fn build_handshake(own_address: &str) -> Bytes {
    Bytes::from(format!("{}{}", HANDSHAKE_MARKER, own_address))
}

/// Extract the announced address if `payload` is a handshake
pub fn parse_handshake(payload: &[u8]) -> Option<String> {
    let rest = payload.strip_prefix(HANDSHAKE_MARKER.as_bytes())?;
    let announced = std::str::from_utf8(rest).ok()?.trim();
    if announced.is_empty() {
        return None;
    }
    Some(announced.to_string())
}
