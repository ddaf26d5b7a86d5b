//! # Serialization Codecs
//!
//! Message codecs keyed by protocol id. A codec converts between a packet
//! payload and [`Message`] envelopes; one payload may carry several envelopes
//! back to back, so `decode` consumes exactly one and hands back the rest.
//!
//! ## Provided codecs
//! - **Bincode** (protocol type 2): compact binary, fastest
//! - **JSON** (protocol type 3): human-readable, for debugging and interop
//! - **MessagePack** (protocol type 4): compact binary, self-describing
//!
//! ## Usage
//! ```rust
//! use netcore::core::serialization::{Codec, SerdeCodec, SerializationFormat};
//! use netcore::protocol::message::Message;
//!
//! let codec = SerdeCodec::new(SerializationFormat::Json);
//! let msg = Message::new(1, 2, &b"ping"[..]).with_tag(7);
//! let bytes = codec.encode(&msg).unwrap();
//! let (decoded, rest) = codec.decode(bytes).unwrap();
//! assert_eq!(decoded, Some(msg));
//! assert!(rest.is_empty());
//! ```

use crate::core::packet::{protocol, ProtocolId};
use crate::error::{ProtocolError, Result};
use crate::protocol::message::Message;
use bincode::Options;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Payload codec contract.
pub trait Codec: Send + Sync + 'static {
    /// Protocol id this codec is registered under.
    fn protocol(&self) -> ProtocolId;

    /// Decode one message from the head of `data`, returning it with the
    /// unconsumed remainder. `Ok((None, _))` means no further message is present.
    fn decode(&self, data: Bytes) -> Result<(Option<Message>, Bytes)>;

    fn encode(&self, msg: &Message) -> Result<Bytes>;
}

/// Supported serialization formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SerializationFormat {
    /// Binary compact format (default, fastest)
    #[default]
    Bincode,
    /// Human-readable JSON format (debugging, interop)
    Json,
    /// Compact binary format (MessagePack, efficient)
    MessagePack,
}

impl SerializationFormat {
    /// Protocol type identifier on the wire
    pub fn protocol_type(self) -> u16 {
        match self {
            SerializationFormat::Bincode => protocol::BINCODE,
            SerializationFormat::Json => protocol::JSON,
            SerializationFormat::MessagePack => protocol::MSGPACK,
        }
    }

    /// Detect format from a protocol type
    pub fn from_protocol_type(protocol_type: u16) -> Option<Self> {
        match protocol_type {
            protocol::BINCODE => Some(SerializationFormat::Bincode),
            protocol::JSON => Some(SerializationFormat::Json),
            protocol::MSGPACK => Some(SerializationFormat::MessagePack),
            _ => None,
        }
    }

    /// Get human-readable name
    pub fn name(self) -> &'static str {
        match self {
            SerializationFormat::Bincode => "Bincode",
            SerializationFormat::Json => "JSON",
            SerializationFormat::MessagePack => "MessagePack",
        }
    }
}

/// Trait for types that support multiple serialization formats
pub trait MultiFormat: Serialize + for<'de> Deserialize<'de> + Sized {
    /// Serialize to bytes using the specified format
    fn serialize_format(&self, format: SerializationFormat) -> Result<Vec<u8>> {
        match format {
            SerializationFormat::Bincode => bincode::serialize(self)
                .map_err(|e| ProtocolError::SerializeError(e.to_string())),
            SerializationFormat::Json => {
                serde_json::to_vec(self).map_err(|e| ProtocolError::SerializeError(e.to_string()))
            }
            SerializationFormat::MessagePack => {
                rmp_serde::to_vec(self).map_err(|e| ProtocolError::SerializeError(e.to_string()))
            }
        }
    }

    /// Deserialize the first value at the head of `data`, returning it and the
    /// number of bytes it occupied.
    fn deserialize_prefix(data: &[u8], format: SerializationFormat) -> Result<(Self, usize)> {
        match format {
            SerializationFormat::Bincode => {
                // Same layout as `bincode::serialize`, but a length prefix can
                // never claim more bytes than the input holds.
                let mut rest = data;
                let value = bincode::DefaultOptions::new()
                    .with_fixint_encoding()
                    .allow_trailing_bytes()
                    .with_limit(data.len() as u64)
                    .deserialize_from(&mut rest)
                    .map_err(|e| ProtocolError::DeserializeError(e.to_string()))?;
                Ok((value, data.len() - rest.len()))
            }
            SerializationFormat::Json => {
                let mut stream = serde_json::Deserializer::from_slice(data).into_iter::<Self>();
                match stream.next() {
                    Some(Ok(value)) => Ok((value, stream.byte_offset())),
                    Some(Err(e)) => Err(ProtocolError::DeserializeError(e.to_string())),
                    None => Err(ProtocolError::DeserializeError(
                        "no JSON value present".to_string(),
                    )),
                }
            }
            SerializationFormat::MessagePack => {
                let mut rest = data;
                let value = rmp_serde::from_read(&mut rest)
                    .map_err(|e| ProtocolError::DeserializeError(e.to_string()))?;
                Ok((value, data.len() - rest.len()))
            }
        }
    }
}

impl MultiFormat for Message {}

/// [`Codec`] serializing the message envelope with serde.
#[derive(Debug, Clone, Copy)]
pub struct SerdeCodec {
    format: SerializationFormat,
    version: u16,
}

impl SerdeCodec {
    pub fn new(format: SerializationFormat) -> Self {
        Self { format, version: 1 }
    }

    pub fn format(&self) -> SerializationFormat {
        self.format
    }
}

impl Codec for SerdeCodec {
    fn protocol(&self) -> ProtocolId {
        ProtocolId::new(self.format.protocol_type(), self.version)
    }

    fn decode(&self, data: Bytes) -> Result<(Option<Message>, Bytes)> {
        if data.is_empty() {
            return Ok((None, data));
        }
        // Trailing whitespace between JSON documents is padding, not a message.
        if self.format == SerializationFormat::Json && data.iter().all(u8::is_ascii_whitespace) {
            return Ok((None, Bytes::new()));
        }

        let (msg, consumed) = Message::deserialize_prefix(&data, self.format)?;
        Ok((Some(msg), data.slice(consumed..)))
    }

    fn encode(&self, msg: &Message) -> Result<Bytes> {
        msg.serialize_format(self.format).map(Bytes::from)
    }
}
