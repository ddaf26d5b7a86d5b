//! # Transports
//!
//! Any bidirectional byte stream can carry a connection pipeline. The listener
//! or dialer that produces the stream lives outside this crate; it hands the
//! accepted stream to [`crate::connection::Connection::builder`].
//!
//! Implementations are provided for TCP, Unix domain sockets and the in-memory
//! `tokio::io::DuplexStream` used by tests.

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::TcpStream;

pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Human-readable peer descriptor used for logging and message origins.
    fn remote_addr(&self) -> String;
}

impl Transport for TcpStream {
    fn remote_addr(&self) -> String {
        self.peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| String::from("tcp:unknown"))
    }
}

#[cfg(unix)]
impl Transport for tokio::net::UnixStream {
    fn remote_addr(&self) -> String {
        self.peer_addr()
            .ok()
            .and_then(|addr| addr.as_pathname().map(|p| p.display().to_string()))
            .unwrap_or_else(|| String::from("unix:unnamed"))
    }
}

impl Transport for DuplexStream {
    fn remote_addr(&self) -> String {
        String::from("memory:duplex")
    }
}
