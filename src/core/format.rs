//! # Packet Formats
//!
//! A packet format recognizes its framing at the head of a connection's receive
//! buffer and extracts complete packets from it. Formats are stateless; all
//! per-connection state lives in the buffer.
//!
//! Status mapping for every method:
//! - `Ok(..)`: the operation succeeded
//! - `Err(ProtocolError::DataNotMatch)`: the stream is not this format
//! - `Err(ProtocolError::DataNotReady)`: more bytes are needed
//! - any other error: fatal for the connection

use crate::config::MAX_PAYLOAD_SIZE;
use crate::core::buffer::Buffer;
use crate::core::packet::{Packet, PacketHeader, HEADER_LEN, MAGIC_BYTES};
use crate::error::{ProtocolError, Result};
use bytes::Bytes;

pub trait PacketFormat: Send + Sync + 'static {
    /// Stable name used in logs.
    fn name(&self) -> &str;

    /// Decide whether the buffered stream uses this format.
    fn detect(&self, buf: &Buffer) -> Result<()>;

    /// One-time preparation right after the format is bound. Returned bytes are
    /// written to the peer immediately.
    fn prepare(&self, _buf: &Buffer) -> Result<Option<Bytes>> {
        Ok(None)
    }

    /// Extract the next complete packet. `Ok(None)` means nothing is buffered.
    fn pop(&self, buf: &Buffer) -> Result<Option<Packet>>;
}

/// Compare the buffered head against an expected prefix.
fn match_prefix(buf: &Buffer, expected: &[u8]) -> Result<()> {
    let head = buf.peek(expected.len());
    if head[..] != expected[..head.len()] {
        return Err(ProtocolError::DataNotMatch);
    }
    if head.len() < expected.len() {
        return Err(ProtocolError::DataNotReady);
    }
    Ok(())
}

/// Canonical binary framing, see [`crate::core::packet`] for the layout.
#[derive(Debug, Clone)]
pub struct BinaryFormat {
    max_payload: usize,
}

impl BinaryFormat {
    pub const NAME: &'static str = "npro";

    pub fn new(max_payload: usize) -> Self {
        Self { max_payload }
    }
}

impl Default for BinaryFormat {
    fn default() -> Self {
        Self::new(MAX_PAYLOAD_SIZE)
    }
}

impl PacketFormat for BinaryFormat {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn detect(&self, buf: &Buffer) -> Result<()> {
        match_prefix(buf, &MAGIC_BYTES)
    }

    fn pop(&self, buf: &Buffer) -> Result<Option<Packet>> {
        let head = buf.peek(HEADER_LEN);
        if head.is_empty() {
            return Ok(None);
        }

        let header = match PacketHeader::parse(&head, self.max_payload) {
            Ok(header) => header,
            // Once bound, a foreign head means the stream is corrupt.
            Err(ProtocolError::DataNotMatch) => return Err(ProtocolError::InvalidHeader),
            Err(e) => return Err(e),
        };

        if buf.len() < HEADER_LEN + header.length {
            return Err(ProtocolError::DataNotReady);
        }

        buf.advance(HEADER_LEN);
        let payload = buf.read(header.length);

        Ok(Some(Packet {
            protocol_type: header.protocol.protocol_type,
            version: header.protocol.version,
            flags: header.flags,
            payload,
        }))
    }
}

/// Binary framing preceded by a text greeting. The peer opens with
/// [`HelloFormat::GREETING`]; `prepare` consumes it and answers with
/// [`HelloFormat::READY`].
#[derive(Debug, Clone, Default)]
pub struct HelloFormat {
    inner: BinaryFormat,
}

impl HelloFormat {
    pub const NAME: &'static str = "npro-hello";
    pub const GREETING: &'static [u8] = b"HELLO NPRO/1\n";
    pub const READY: &'static [u8] = b"READY NPRO/1\n";

    pub fn new(max_payload: usize) -> Self {
        Self {
            inner: BinaryFormat::new(max_payload),
        }
    }
}

impl PacketFormat for HelloFormat {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn detect(&self, buf: &Buffer) -> Result<()> {
        match_prefix(buf, Self::GREETING)
    }

    fn prepare(&self, buf: &Buffer) -> Result<Option<Bytes>> {
        match_prefix(buf, Self::GREETING).map_err(|_| ProtocolError::InvalidHeader)?;
        buf.advance(Self::GREETING.len());
        Ok(Some(Bytes::from_static(Self::READY)))
    }

    fn pop(&self, buf: &Buffer) -> Result<Option<Packet>> {
        self.inner.pop(buf)
    }
}
