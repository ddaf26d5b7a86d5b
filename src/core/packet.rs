//! # Packet
//!
//! Transient unit produced by a packet format and consumed immediately by the
//! pipeline, plus the canonical binary wire layout used for outbound sends.
//!
//! ## Wire Format
//! ```text
//! [Magic "NPRO"(4)] [Flags(1)] [Protocol Type(2)] [Version(2)] [Length(4)] [Payload(N)]
//! ```
//! All integers are big-endian.

use crate::config::MAX_PAYLOAD_SIZE;
use crate::error::{ProtocolError, Result};
use bytes::{BufMut, Bytes, BytesMut};

/// Magic bytes identifying binary-framed packets
pub const MAGIC_BYTES: [u8; 4] = *b"NPRO";

/// Fixed header length of the binary layout
pub const HEADER_LEN: usize = 13;

/// Well-known protocol type identifiers
pub mod protocol {
    /// Payload is delivered to the receive callback uninterpreted
    pub const RAW: u16 = 1;
    pub const BINCODE: u16 = 2;
    pub const JSON: u16 = 3;
    pub const MSGPACK: u16 = 4;
}

/// A (protocol type, version) pair naming a codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtocolId {
    pub protocol_type: u16,
    pub version: u16,
}

impl ProtocolId {
    pub const fn new(protocol_type: u16, version: u16) -> Self {
        Self {
            protocol_type,
            version,
        }
    }

    /// Packed `type << 16 | version` form stored on a connection.
    pub fn tag(self) -> u32 {
        (self.protocol_type as u32) << 16 | self.version as u32
    }
}

impl std::fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}(v{})", self.protocol_type, self.version)
    }
}

/// Packet flag bits. The core only carries them; acting on them is left to
/// pluggable encryption/compression layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketFlags(u8);

impl PacketFlags {
    pub const ENCRYPTED: PacketFlags = PacketFlags(0x01);
    pub const COMPRESSED: PacketFlags = PacketFlags(0x02);
    pub const COMPRESS_SUPPORTED: PacketFlags = PacketFlags(0x04);

    pub const fn empty() -> Self {
        PacketFlags(0)
    }

    pub const fn from_bits(bits: u8) -> Self {
        PacketFlags(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: PacketFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: PacketFlags) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for PacketFlags {
    type Output = PacketFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        PacketFlags(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub protocol_type: u16,
    pub version: u16,
    pub flags: PacketFlags,
    pub payload: Bytes,
}

/// Decoded fixed header of the binary layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub flags: PacketFlags,
    pub protocol: ProtocolId,
    pub length: usize,
}

impl PacketHeader {
    /// Parse a header from the first [`HEADER_LEN`] bytes of `src`.
    ///
    /// Returns `DataNotReady` on a short slice and `DataNotMatch` on a magic mismatch.
    pub fn parse(src: &[u8], max_payload: usize) -> Result<Self> {
        let magic_len = src.len().min(MAGIC_BYTES.len());
        if src[..magic_len] != MAGIC_BYTES[..magic_len] {
            return Err(ProtocolError::DataNotMatch);
        }
        if src.len() < HEADER_LEN {
            return Err(ProtocolError::DataNotReady);
        }

        let flags = PacketFlags::from_bits(src[4]);
        let protocol_type = u16::from_be_bytes([src[5], src[6]]);
        let version = u16::from_be_bytes([src[7], src[8]]);
        let length = u32::from_be_bytes([src[9], src[10], src[11], src[12]]) as usize;

        if length > max_payload {
            return Err(ProtocolError::OversizedPacket(length));
        }

        Ok(Self {
            flags,
            protocol: ProtocolId::new(protocol_type, version),
            length,
        })
    }
}

impl Packet {
    pub fn new(protocol: ProtocolId, payload: impl Into<Bytes>) -> Self {
        Self {
            protocol_type: protocol.protocol_type,
            version: protocol.version,
            flags: PacketFlags::empty(),
            payload: payload.into(),
        }
    }

    /// Build a packet whose payload bypasses codecs.
    pub fn raw(payload: impl Into<Bytes>) -> Self {
        Self::new(ProtocolId::new(protocol::RAW, 1), payload)
    }

    pub fn protocol(&self) -> ProtocolId {
        ProtocolId::new(self.protocol_type, self.version)
    }

    pub fn is_raw(&self) -> bool {
        self.protocol_type == protocol::RAW
    }

    /// Append the binary encoding of this packet to `dst`.
    pub fn encode_into(&self, dst: &mut BytesMut) -> Result<()> {
        if self.payload.len() > u32::MAX as usize {
            return Err(ProtocolError::OversizedPacket(self.payload.len()));
        }
        dst.reserve(HEADER_LEN + self.payload.len());
        dst.put_slice(&MAGIC_BYTES);
        dst.put_u8(self.flags.bits());
        dst.put_u16(self.protocol_type);
        dst.put_u16(self.version);
        dst.put_u32(self.payload.len() as u32);
        dst.put_slice(&self.payload);
        Ok(())
    }

    /// Serialize into a standalone buffer.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Parse exactly one packet from a complete byte slice.
    pub fn from_bytes(src: &[u8]) -> Result<Self> {
        if src.len() < HEADER_LEN {
            return Err(ProtocolError::InvalidHeader);
        }
        let header = PacketHeader::parse(src, MAX_PAYLOAD_SIZE).map_err(|e| match e {
            ProtocolError::DataNotMatch | ProtocolError::DataNotReady => {
                ProtocolError::InvalidHeader
            }
            other => other,
        })?;

        let end = HEADER_LEN + header.length;
        if src.len() < end {
            return Err(ProtocolError::InvalidPacket(format!(
                "truncated payload: expected {} bytes, found {}",
                header.length,
                src.len() - HEADER_LEN
            )));
        }

        Ok(Self {
            protocol_type: header.protocol.protocol_type,
            version: header.protocol.version,
            flags: header.flags,
            payload: Bytes::copy_from_slice(&src[HEADER_LEN..end]),
        })
    }
}
