//! # Core Protocol Components
//!
//! Byte buffers, packet framing and payload codecs.
//!
//! ## Components
//! - **Buffer**: Shared FIFO byte buffer used for the receive and send sides
//! - **Packet**: Binary packet layout carrying a protocol type and version
//! - **Format**: Pluggable framings that detect, prepare and pop packets
//! - **Codec**: Tokio codec for framing the binary layout over byte streams
//! - **Serialization**: Serde codecs turning payloads into messages
//!
//! ## Wire Format
//! ```text
//! [Magic "NPRO"(4)] [Flags(1)] [Type u16 BE] [Version u16 BE] [Length u32 BE] [Payload(N)]
//! ```
//!
//! ## Limits
//! - Maximum payload size: 16MB unless configured otherwise
//! - Length validation happens before any payload is buffered into a packet

pub mod buffer;
pub mod codec;
pub mod format;
pub mod packet;
pub mod serialization;
