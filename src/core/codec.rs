//! Tokio framing codec for the binary packet layout.
//!
//! Servers frame through [`crate::core::format::BinaryFormat`] inside the
//! connection pipeline; `PacketCodec` is the client-side counterpart for use with
//! `tokio_util::codec::Framed`.

use crate::config::MAX_PAYLOAD_SIZE;
use crate::core::packet::{Packet, PacketHeader, HEADER_LEN};
use crate::error::{ProtocolError, Result};
use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

#[derive(Debug, Default, Clone, Copy)]
pub struct PacketCodec;

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.is_empty() {
            return Ok(None);
        }

        let header = match PacketHeader::parse(src, MAX_PAYLOAD_SIZE) {
            Ok(header) => header,
            Err(ProtocolError::DataNotReady) => return Ok(None),
            Err(ProtocolError::DataNotMatch) => return Err(ProtocolError::InvalidHeader),
            Err(e) => return Err(e),
        };

        let total = HEADER_LEN + header.length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(header.length).freeze();

        Ok(Some(Packet {
            protocol_type: header.protocol.protocol_type,
            version: header.protocol.version,
            flags: header.flags,
            payload,
        }))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<()> {
        item.encode_into(dst)
    }
}
