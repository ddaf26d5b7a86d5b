//! # Format and Codec Registry
//!
//! Packet formats and codecs are registered once at startup through
//! [`RegistryBuilder`] and frozen into an immutable [`Registry`] shared by every
//! connection. There is no way to mutate a registry after `build()`.

use crate::config::MAX_PAYLOAD_SIZE;
use crate::core::buffer::Buffer;
use crate::core::format::{BinaryFormat, HelloFormat, PacketFormat};
use crate::core::packet::ProtocolId;
use crate::core::serialization::{Codec, SerdeCodec, SerializationFormat};
use crate::error::{ProtocolError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

pub struct Registry {
    formats: Vec<Arc<dyn PacketFormat>>,
    codecs: HashMap<ProtocolId, Arc<dyn Codec>>,
    default_codec: Option<Arc<dyn Codec>>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Both reference formats and every serde codec, with Bincode as the
    /// default outbound codec.
    pub fn standard() -> Arc<Self> {
        Self::standard_with_payload_limit(MAX_PAYLOAD_SIZE)
    }

    pub fn standard_with_payload_limit(max_payload: usize) -> Arc<Self> {
        Self::builder()
            .format(BinaryFormat::new(max_payload))
            .format(HelloFormat::new(max_payload))
            .codec(SerdeCodec::new(SerializationFormat::Bincode))
            .codec(SerdeCodec::new(SerializationFormat::Json))
            .codec(SerdeCodec::new(SerializationFormat::MessagePack))
            .default_codec(ProtocolId::new(SerializationFormat::Bincode.protocol_type(), 1))
            .build()
    }

    /// Offer the buffered bytes to every format in registration order.
    ///
    /// Returns the first match. If nothing matched, `DataNotReady` when at least
    /// one format wants more bytes, otherwise `DataNotMatch`.
    pub fn match_format(&self, buf: &Buffer) -> Result<Arc<dyn PacketFormat>> {
        let mut waiting = false;
        for format in &self.formats {
            match format.detect(buf) {
                Ok(()) => return Ok(Arc::clone(format)),
                Err(e) if e.is_retryable() => waiting = true,
                Err(ProtocolError::DataNotMatch) => {}
                Err(e) => {
                    debug!(format = format.name(), error = %e, "Format detection failed");
                }
            }
        }
        if waiting {
            Err(ProtocolError::DataNotReady)
        } else {
            Err(ProtocolError::DataNotMatch)
        }
    }

    pub fn find_codec(&self, protocol: ProtocolId) -> Option<Arc<dyn Codec>> {
        self.codecs.get(&protocol).cloned()
    }

    pub fn default_codec(&self) -> Option<Arc<dyn Codec>> {
        self.default_codec.clone()
    }

    pub fn formats(&self) -> impl Iterator<Item = &Arc<dyn PacketFormat>> {
        self.formats.iter()
    }
}

#[derive(Default)]
pub struct RegistryBuilder {
    formats: Vec<Arc<dyn PacketFormat>>,
    codecs: HashMap<ProtocolId, Arc<dyn Codec>>,
    default_protocol: Option<ProtocolId>,
}

impl RegistryBuilder {
    /// Formats are tried in the order they are registered.
    pub fn format<F: PacketFormat>(mut self, format: F) -> Self {
        self.formats.push(Arc::new(format));
        self
    }

    /// Later registrations under the same protocol id replace earlier ones.
    pub fn codec<C: Codec>(mut self, codec: C) -> Self {
        self.codecs.insert(codec.protocol(), Arc::new(codec));
        self
    }

    /// Codec used for outbound sends on connections with no resolved protocol.
    pub fn default_codec(mut self, protocol: ProtocolId) -> Self {
        self.default_protocol = Some(protocol);
        self
    }

    pub fn build(self) -> Arc<Registry> {
        let default_codec = self
            .default_protocol
            .and_then(|id| self.codecs.get(&id).cloned());
        Arc::new(Registry {
            formats: self.formats,
            codecs: self.codecs,
            default_codec,
        })
    }
}
