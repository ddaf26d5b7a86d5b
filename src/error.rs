//! # Error Types
//!
//! Error handling for the connection pipeline, framing layer and dispatcher.
//!
//! ## Error Categories
//! - **I/O Errors**: transport read/write failures
//! - **Framing Statuses**: `DataNotMatch` and `DataNotReady` are the two
//!   non-fatal outcomes a packet format can report; every other variant
//!   returned from a format is fatal for the connection
//! - **Codec Errors**: payload encode/decode failures
//! - **Lifecycle Errors**: closed connections, closed queues, write timeouts
//! - **Configuration Errors**: invalid settings or missing callbacks
//!
//! ## Example Usage
//! ```rust
//! use netcore::error::{ProtocolError, Result};
//! use tracing::error;
//!
//! fn require_payload(payload: &[u8]) -> Result<()> {
//!     if payload.is_empty() {
//!         return Err(ProtocolError::InvalidPacket("empty payload".into()));
//!     }
//!     Ok(())
//! }
//!
//! if let Err(e) = require_payload(&[]) {
//!     error!(error = %e, "Rejected packet");
//! }
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Dispatcher-related error messages
    pub const ERR_DISPATCHER_WRITE_LOCK: &str = "Failed to acquire write lock on dispatcher";
    pub const ERR_DISPATCHER_READ_LOCK: &str = "Failed to acquire read lock on dispatcher";

    /// Framing errors
    pub const ERR_NO_FORMAT_MATCH: &str = "No registered packet format matches the stream";
    pub const ERR_CODEC_NOT_READY: &str = "No codec bound for the connection protocol";
    pub const ERR_MISSING_RECEIVER: &str = "Connection has no receive callback";

    /// Connection errors
    pub const ERR_WRITE_TIMEOUT: &str = "Write deadline exceeded, closing connection";
}

/// Primary error type for all pipeline, framing and dispatch operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Deserialize error: {0}")]
    DeserializeError(String),

    /// The buffered bytes do not belong to this packet format
    #[error("Data does not match packet format")]
    DataNotMatch,

    /// More bytes are required before a decision can be made
    #[error("Data not ready")]
    DataNotReady,

    #[error("Invalid protocol header")]
    InvalidHeader,

    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    #[error("Packet too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("No codec registered for protocol {protocol_type}(v{version})")]
    CodecNotFound { protocol_type: u16, version: u16 },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Message queue closed")]
    QueueClosed,

    #[error("Timeout occurred")]
    Timeout,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// Whether a framing step may be retried once more bytes arrive.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProtocolError::DataNotReady)
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
