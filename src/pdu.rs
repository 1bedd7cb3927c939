//! Wire format encoding and decoding.
//!
//! Every protocol message (PDU) is a 4-byte big-endian length prefix
//! followed by a MessagePack-encoded value:
//!
//! ```text
//! ┌────────────┬──────────────────┐
//! │ Body length│ MessagePack body │
//! │ 4 bytes BE │ N bytes          │
//! └────────────┴──────────────────┘
//! ```
//!
//! The body is a dynamic [`Value`] (nil/bool/int/double/string/binary/
//! array/map). Commands are arrays, responses and unilateral events are
//! maps.

use bytes::Bytes;

use crate::error::{Error, Result};

/// Dynamic protocol value exchanged with the daemon.
pub use rmpv::Value;

/// Size of the length prefix in bytes.
pub const LEN_PREFIX_SIZE: usize = 4;

/// Default maximum PDU body size (512 MiB). A longer length prefix is
/// treated as a protocol violation rather than an allocation request.
pub const DEFAULT_MAX_PDU_SIZE: usize = 512 * 1024 * 1024;

/// Total framed length of the PDU whose prefix starts at `buf[0]`.
///
/// Returns `None` when fewer than [`LEN_PREFIX_SIZE`] bytes are present.
pub fn total_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < LEN_PREFIX_SIZE {
        return None;
    }
    let body = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    Some(LEN_PREFIX_SIZE + body)
}

/// Encode a value as one framed PDU (prefix + body).
pub fn encode(value: &Value) -> Result<Bytes> {
    let mut buf = Vec::with_capacity(64);
    buf.extend_from_slice(&[0u8; LEN_PREFIX_SIZE]);
    rmpv::encode::write_value(&mut buf, value)
        .map_err(|e| Error::Protocol(format!("failed to encode value: {e}")))?;
    let body_len = (buf.len() - LEN_PREFIX_SIZE) as u32;
    buf[..LEN_PREFIX_SIZE].copy_from_slice(&body_len.to_be_bytes());
    Ok(Bytes::from(buf))
}

/// Decode a complete PDU body (the bytes after the length prefix).
pub fn decode_body(mut body: &[u8]) -> Result<Value> {
    let value = rmpv::decode::read_value(&mut body)
        .map_err(|e| Error::Protocol(format!("failed to decode value: {e}")))?;
    if !body.is_empty() {
        return Err(Error::Protocol(format!(
            "{} trailing bytes after value",
            body.len()
        )));
    }
    Ok(value)
}

/// Decode exactly one framed PDU from `buf`, which must contain the whole
/// message and nothing else. Used for the sockname helper output.
pub fn decode_framed(buf: &[u8]) -> Result<Value> {
    let total = total_len(buf)
        .ok_or_else(|| Error::Protocol("truncated length prefix".to_owned()))?;
    if buf.len() != total {
        return Err(Error::Protocol(format!(
            "framed message is {} bytes but prefix declares {}",
            buf.len(),
            total
        )));
    }
    decode_body(&buf[LEN_PREFIX_SIZE..])
}

/// Look up `key` in a map-valued `value`.
///
/// Returns `None` when the value is not a map or the key is absent.
pub fn map_get<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    value
        .as_map()?
        .iter()
        .find(|(k, _)| k.as_str() == Some(key))
        .map(|(_, v)| v)
}
