//! # Connections
//!
//! A [`Connection`] wraps one accepted transport and runs four cooperating tasks
//! over it:
//!
//! ```text
//!  transport ──read──► [reader] ──recv buffer + notify──► [processor] ──► on_receive
//!                                                            │
//!  transport ◄─write── [writer] ◄──send buffer + signal── write()/send()
//!                         ▲
//!                   [scheduler] (periodic flush signal)
//! ```
//!
//! When all four tasks have exited the owner's `on_stop` callback runs exactly
//! once. Teardown is cooperative: [`Connection::close`] cancels a shared token
//! that every task observes.
//!
//! The processor drives the framing state machine in [`framing`]: it picks a
//! packet format for the stream, binds a codec from the first packet and hands
//! decoded messages to the receive callback.

mod framing;
mod pipeline;

use crate::config::ConnectionConfig;
use crate::core::buffer::Buffer;
use crate::core::format::PacketFormat;
use crate::core::packet::{Packet, ProtocolId};
use crate::core::serialization::Codec;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::message::Message;
use crate::registry::Registry;
use crate::transport::Transport;
use crate::utils::metrics::global_metrics;
use bytes::BytesMut;
use once_cell::sync::OnceCell;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Callback receiving every message the pipeline delivers.
pub type OnReceive = Arc<dyn Fn(&Connection, Message) -> Result<()> + Send + Sync>;

/// Callback run once after all pipeline tasks have exited.
pub type OnStop = Arc<dyn Fn(&Connection) + Send + Sync>;

/// Opaque per-connection slot for application state.
pub type AssociatedObject = Arc<dyn Any + Send + Sync>;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        SessionId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:X}", self.0)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Inner {
    id: SessionId,
    source: String,
    config: ConnectionConfig,
    registry: Arc<Registry>,
    recv: Buffer,
    send: Buffer,
    protocol: OnceCell<ProtocolId>,
    codec: OnceCell<Arc<dyn Codec>>,
    format: OnceCell<Arc<dyn PacketFormat>>,
    associated: Mutex<Option<AssociatedObject>>,
    close_requested: AtomicBool,
    close_after_flush: AtomicBool,
    closed: AtomicBool,
    shutdown: CancellationToken,
    send_signal: Mutex<Option<mpsc::Sender<()>>>,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
}

/// Cheaply clonable handle to a running connection pipeline.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    pub fn builder<T: Transport>(transport: T, registry: Arc<Registry>) -> ConnectionBuilder<T> {
        ConnectionBuilder {
            transport,
            registry,
            config: ConnectionConfig::default(),
            on_receive: None,
            on_stop: None,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.inner.id
    }

    /// Peer descriptor reported by the transport.
    pub fn source(&self) -> &str {
        &self.inner.source
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Resolved protocol, `None` until the first decodable packet arrives.
    pub fn protocol(&self) -> Option<ProtocolId> {
        self.inner.protocol.get().copied()
    }

    /// Packed `type << 16 | version` form of [`Connection::protocol`]; `0` while unresolved.
    pub fn protocol_tag(&self) -> u32 {
        self.protocol().map(ProtocolId::tag).unwrap_or(0)
    }

    pub fn codec(&self) -> Option<Arc<dyn Codec>> {
        self.inner.codec.get().cloned()
    }

    pub fn packet_format(&self) -> Option<Arc<dyn PacketFormat>> {
        self.inner.format.get().cloned()
    }

    pub fn set_associated_object(&self, object: AssociatedObject) {
        *lock(&self.inner.associated) = Some(object);
    }

    pub fn associated_object(&self) -> Option<AssociatedObject> {
        lock(&self.inner.associated).clone()
    }

    /// Typed view of the associated object.
    pub fn associated<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.associated_object()
            .and_then(|object| object.downcast::<T>().ok())
    }

    /// Consume up to `len` unprocessed bytes from the receive buffer.
    pub fn read(&self, len: usize) -> bytes::Bytes {
        self.inner.recv.read(len)
    }

    /// Copy up to `len` unprocessed bytes from the receive buffer.
    pub fn peek(&self, len: usize) -> bytes::Bytes {
        self.inner.recv.peek(len)
    }

    /// Drop every unprocessed received byte.
    pub fn discard(&self) {
        self.inner.recv.reset();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Whether the send side has stopped accepting data.
    pub fn close_requested(&self) -> bool {
        self.inner.close_requested.load(Ordering::Acquire)
    }

    /// Close the connection once the send buffer has been flushed.
    pub fn close_after_flush(&self) {
        self.inner.close_after_flush.store(true, Ordering::Release);
        self.signal_send();
    }

    /// Queue bytes for the writer. Silently ignored once the send side is closing.
    pub fn write(&self, data: &[u8]) {
        if self.close_requested() {
            return;
        }
        self.inner.send.write(data);
        self.signal_send();
    }

    /// Encode `msgs` with the connection codec (or the registry default) into a
    /// single binary packet and queue it. Messages that fail to encode are skipped.
    pub fn send(&self, msgs: &[Message]) -> Result<()> {
        if self.close_requested() {
            return Err(ProtocolError::ConnectionClosed);
        }

        let codec = self
            .codec()
            .or_else(|| self.inner.registry.default_codec())
            .ok_or_else(|| {
                let protocol = self.protocol().unwrap_or(ProtocolId::new(0, 0));
                ProtocolError::CodecNotFound {
                    protocol_type: protocol.protocol_type,
                    version: protocol.version,
                }
            })?;

        let start = Instant::now();
        let mut payload = BytesMut::new();
        for msg in msgs {
            match codec.encode(msg) {
                Ok(bytes) => {
                    payload.extend_from_slice(&bytes);
                    global_metrics().message_encoded();
                }
                Err(e) => {
                    warn!(session = %self.inner.id, error = %e, kind = msg.kind, "Skipping message that failed to encode");
                }
            }
        }
        global_metrics().encode_time(start.elapsed());

        self.send_packet(&Packet::new(codec.protocol(), payload.freeze()))
    }

    /// Frame an already-built packet with the binary layout and queue it.
    pub fn send_packet(&self, packet: &Packet) -> Result<()> {
        if self.close_requested() {
            return Err(ProtocolError::ConnectionClosed);
        }
        let bytes = packet.to_bytes()?;
        self.write(&bytes);
        Ok(())
    }

    /// Close the transport and stop the pipeline. Safe to call any number of times.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let teardown = std::panic::catch_unwind(AssertUnwindSafe(|| {
            self.inner.close_requested.store(true, Ordering::Release);
            self.inner.shutdown.cancel();
            lock(&self.inner.send_signal).take();
        }));

        match teardown {
            Ok(()) => debug!(session = %self.inner.id, peer = %self.inner.source, "Connection closed"),
            Err(panic) => error!(
                session = %self.inner.id,
                panic = panic_message(panic.as_ref()),
                "Panic during connection teardown"
            ),
        }
    }

    /// Wake the writer, or drop the signal source if the send side is closing.
    fn signal_send(&self) {
        let mut signal = lock(&self.inner.send_signal);
        if self.close_requested() {
            signal.take();
            return;
        }
        if let Some(tx) = signal.as_ref() {
            // A full channel already holds a pending wake-up.
            let _ = tx.try_send(());
        }
    }

    fn close_send_signal(&self) {
        lock(&self.inner.send_signal).take();
    }

    fn mark_close_requested(&self) {
        self.inner.close_requested.store(true, Ordering::Release);
    }

    /// Bind the packet format. Returns the format actually bound.
    fn bind_format(&self, format: Arc<dyn PacketFormat>) -> Arc<dyn PacketFormat> {
        let bound = self.inner.format.get_or_init(|| format);
        info!(session = %self.inner.id, format = bound.name(), "Packet format matched");
        Arc::clone(bound)
    }

    /// Resolve protocol and codec from a packet, once. Returns whether a codec is bound.
    fn bind_protocol(&self, protocol: ProtocolId) -> bool {
        if self.inner.protocol.get().is_some() {
            return true;
        }
        match self.inner.registry.find_codec(protocol) {
            Some(codec) => {
                let _ = self.inner.codec.set(codec);
                let _ = self.inner.protocol.set(protocol);
                debug!(session = %self.inner.id, %protocol, "Protocol resolved");
                true
            }
            None => {
                debug!(session = %self.inner.id, %protocol, "No codec for packet protocol");
                false
            }
        }
    }

    /// Write straight to the transport under the per-chunk deadline.
    async fn write_transport(&self, data: &[u8]) -> Result<()> {
        let mut guard = self.inner.writer.lock().await;
        let writer = guard.as_mut().ok_or(ProtocolError::ConnectionClosed)?;

        let deadline = self.config().write_timeout;
        let write = crate::utils::timeout::with_timeout(deadline, async {
            writer.write_all(data).await?;
            writer.flush().await?;
            Ok::<(), ProtocolError>(())
        });

        tokio::select! {
            _ = self.inner.shutdown.cancelled() => Err(ProtocolError::ConnectionClosed),
            result = write => {
                result?;
                global_metrics().bytes_sent(data.len());
                Ok(())
            }
        }
    }

    /// Drain the send buffer in chunks.
    async fn flush(&self) -> Result<()> {
        let chunk_size = self.config().send_chunk_size;
        loop {
            let chunk = self.inner.send.read(chunk_size);
            if chunk.is_empty() {
                return Ok(());
            }
            self.write_transport(&chunk).await?;
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("session", &self.inner.id)
            .field("source", &self.inner.source)
            .field("protocol", &self.protocol())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("unknown panic")
    }
}

/// Configures and starts a [`Connection`].
pub struct ConnectionBuilder<T> {
    transport: T,
    registry: Arc<Registry>,
    config: ConnectionConfig,
    on_receive: Option<OnReceive>,
    on_stop: Option<OnStop>,
}

impl<T: Transport> ConnectionBuilder<T> {
    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn on_receive<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Connection, Message) -> Result<()> + Send + Sync + 'static,
    {
        self.on_receive = Some(Arc::new(callback));
        self
    }

    /// Use a shared receive callback, such as [`crate::protocol::queue::MessageQueue::receiver`].
    pub fn on_receive_shared(mut self, callback: OnReceive) -> Self {
        self.on_receive = Some(callback);
        self
    }

    pub fn on_stop<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        self.on_stop = Some(Arc::new(callback));
        self
    }

    /// Spawn the pipeline tasks on the current Tokio runtime.
    ///
    /// Fails with a configuration error when no receive callback was supplied.
    pub fn start(self) -> Result<Connection> {
        let source = self.transport.remote_addr();
        let Some(on_receive) = self.on_receive else {
            warn!(peer = %source, "Connection has no receive callback, refusing to start");
            return Err(ProtocolError::ConfigError(
                constants::ERR_MISSING_RECEIVER.to_string(),
            ));
        };

        let (reader, writer) = tokio::io::split(self.transport);
        let (data_tx, data_rx) = mpsc::channel(self.config.notify_capacity.max(1));
        let (send_tx, send_rx) = mpsc::channel(1);

        let connection = Connection {
            inner: Arc::new(Inner {
                id: SessionId::next(),
                source,
                config: self.config,
                registry: self.registry,
                recv: Buffer::new(),
                send: Buffer::new(),
                protocol: OnceCell::new(),
                codec: OnceCell::new(),
                format: OnceCell::new(),
                associated: Mutex::new(None),
                close_requested: AtomicBool::new(false),
                close_after_flush: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                send_signal: Mutex::new(Some(send_tx)),
                writer: tokio::sync::Mutex::new(Some(Box::new(writer))),
            }),
        };

        info!(session = %connection.session_id(), peer = %connection.source(), "Connection established");
        global_metrics().connection_started();

        pipeline::spawn(
            connection.clone(),
            pipeline::Channels {
                reader,
                data_tx,
                data_rx,
                send_rx,
            },
            on_receive,
            self.on_stop,
        );

        Ok(connection)
    }
}
