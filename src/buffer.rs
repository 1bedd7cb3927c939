//! Receive buffer that reassembles PDUs from an arbitrarily fragmented
//! byte stream.
//!
//! Socket reads deliver bytes with no regard for message boundaries: a
//! length prefix may be split across two reads, or one read may carry
//! several complete messages. [`PduBuffer`] accumulates everything in a
//! single `BytesMut` and peels off one complete PDU at a time.

use bytes::{Buf, BytesMut};

use crate::error::{Error, Result};
use crate::pdu::{self, DEFAULT_MAX_PDU_SIZE, LEN_PREFIX_SIZE};

/// Accumulates incoming bytes and extracts complete PDU bodies.
pub struct PduBuffer {
    buf: BytesMut,
    max_pdu_size: usize,
}

impl PduBuffer {
    pub fn new() -> Self {
        Self::with_max_pdu_size(DEFAULT_MAX_PDU_SIZE)
    }

    pub fn with_max_pdu_size(max_pdu_size: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(64 * 1024),
            max_pdu_size,
        }
    }

    /// Append bytes received from the socket.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Try to split one complete PDU off the front of the buffer.
    ///
    /// The length prefix is peeked without consuming it; nothing is removed
    /// until the whole message is present. Returns `Ok(None)` when more
    /// bytes are needed (not an error), or the PDU's body bytes once the
    /// message is complete.
    pub fn split_next(&mut self) -> Result<Option<bytes::Bytes>> {
        let total = match pdu::total_len(&self.buf) {
            Some(n) => n,
            None => return Ok(None),
        };
        if total - LEN_PREFIX_SIZE > self.max_pdu_size {
            return Err(Error::Protocol(format!(
                "message body of {} bytes exceeds maximum {}",
                total - LEN_PREFIX_SIZE,
                self.max_pdu_size
            )));
        }
        if self.buf.len() < total {
            return Ok(None);
        }
        let mut message = self.buf.split_to(total);
        message.advance(LEN_PREFIX_SIZE);
        Ok(Some(message.freeze()))
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

impl Default for PduBuffer {
    fn default() -> Self {
        Self::new()
    }
}
