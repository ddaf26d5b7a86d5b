//! # netcore
//!
//! Connection-oriented network core: a per-connection I/O pipeline that frames
//! incoming bytes into packets, negotiates a payload codec from the first packet,
//! and feeds decoded messages to a dispatcher that runs handlers under a
//! concurrency budget.
//!
//! ## Layout
//! - [`connection`]: the four-task pipeline behind every accepted transport
//! - [`core`]: buffers, packet layout, packet formats and payload codecs
//! - [`registry`]: the frozen set of formats and codecs shared by connections
//! - [`protocol`]: messages, the ingress queue and the dispatcher
//! - [`config`], [`error`], [`utils`]: configuration, errors, logging and metrics
//!
//! ## Example
//! ```rust,no_run
//! use netcore::connection::Connection;
//! use netcore::protocol::dispatcher::{handler, Dispatcher};
//! use netcore::protocol::queue::MessageQueue;
//! use netcore::registry::Registry;
//! use tokio::net::TcpListener;
//!
//! # async fn run() -> netcore::error::Result<()> {
//! let registry = Registry::standard();
//! let (queue, ingress) = MessageQueue::with_default_capacity();
//!
//! let dispatcher = Dispatcher::new();
//! dispatcher.register(1, 1, 1, handler(|msg| async move {
//!     if let Some(conn) = msg.connection() {
//!         conn.send(&[(*msg).clone()])?;
//!     }
//!     Ok(())
//! }))?;
//! dispatcher.dispatch(ingress);
//!
//! let listener = TcpListener::bind("127.0.0.1:7000").await?;
//! loop {
//!     let (stream, _) = listener.accept().await?;
//!     Connection::builder(stream, registry.clone())
//!         .on_receive_shared(queue.receiver())
//!         .on_stop(|conn| tracing::info!(session = %conn.session_id(), "bye"))
//!         .start()?;
//! }
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod core;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod transport;
pub mod utils;

pub use connection::{Connection, ConnectionBuilder, SessionId};
pub use error::{ProtocolError, Result};
pub use protocol::message::Message;
pub use registry::{Registry, RegistryBuilder};
