//! Process-wide ingress queue between connection pipelines and the dispatcher.

use crate::config::QUEUE_CAPACITY;
use crate::connection::{Connection, OnReceive};
use crate::error::{ProtocolError, Result};
use crate::protocol::message::{Message, Origin};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Producer side of the ingress queue. Clones share the same queue.
#[derive(Clone)]
pub struct MessageQueue {
    tx: mpsc::Sender<Message>,
    closed: CancellationToken,
    spill: Arc<Mutex<Spill>>,
}

/// Messages pushed while the queue was full, waiting on a single forwarder.
/// While `pending > 0` every push goes through the spill so none overtakes another.
#[derive(Default)]
struct Spill {
    pending: usize,
    tx: Option<mpsc::UnboundedSender<Message>>,
}

/// Consumer side of the ingress queue, owned by the dispatcher.
pub struct QueueReceiver {
    rx: mpsc::Receiver<Message>,
    closed: CancellationToken,
}

impl MessageQueue {
    pub fn new(capacity: usize) -> (Self, QueueReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let closed = CancellationToken::new();
        (
            Self {
                tx,
                closed: closed.clone(),
                spill: Arc::new(Mutex::new(Spill::default())),
            },
            QueueReceiver { rx, closed },
        )
    }

    pub fn with_default_capacity() -> (Self, QueueReceiver) {
        Self::new(QUEUE_CAPACITY)
    }

    /// Enqueue without waiting. When the queue is full the message is handed to
    /// a background forwarder; it is never dropped and later pushes queue
    /// behind it.
    pub fn push(&self, msg: Message) -> Result<()> {
        if self.is_closed() {
            return Err(ProtocolError::QueueClosed);
        }

        let mut spill = lock(&self.spill);
        let msg = if spill.pending == 0 {
            match self.tx.try_send(msg) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Closed(_)) => return Err(ProtocolError::QueueClosed),
                Err(TrySendError::Full(msg)) => msg,
            }
        } else {
            msg
        };

        let spill_tx = match spill.tx.as_ref() {
            Some(tx) => tx.clone(),
            None => {
                let tx = self.spawn_forwarder();
                spill.tx = Some(tx.clone());
                tx
            }
        };
        spill_tx
            .send(msg)
            .map_err(|_| ProtocolError::QueueClosed)?;
        spill.pending += 1;
        Ok(())
    }

    /// Start the task that moves spilled messages into the queue in order. It
    /// exits, releasing the spill channel, once nothing is pending.
    fn spawn_forwarder(&self) -> mpsc::UnboundedSender<Message> {
        let (spill_tx, mut spill_rx) = mpsc::unbounded_channel();
        let tx = self.tx.clone();
        let spill = Arc::clone(&self.spill);

        tokio::spawn(async move {
            while let Some(msg) = spill_rx.recv().await {
                if tx.send(msg).await.is_err() {
                    debug!("Queue closed before a deferred push completed");
                }
                let mut state = lock(&spill);
                state.pending = state.pending.saturating_sub(1);
                if state.pending == 0 {
                    state.tx = None;
                    break;
                }
            }
        });
        spill_tx
    }

    /// Enqueue, waiting for room. Preserves the caller's order.
    pub async fn send(&self, msg: Message) -> Result<()> {
        if self.is_closed() {
            return Err(ProtocolError::QueueClosed);
        }
        self.tx
            .send(msg)
            .await
            .map_err(|_| ProtocolError::QueueClosed)
    }

    /// Stamp the message with the connection it arrived on, then push it.
    pub fn push_from(&self, connection: &Connection, msg: Message) -> Result<()> {
        self.push(msg.with_origin(Origin::from_connection(connection)))
    }

    /// Receive callback that forwards every delivered message into this queue.
    pub fn receiver(&self) -> OnReceive {
        let queue = self.clone();
        Arc::new(move |connection: &Connection, msg: Message| {
            queue.push_from(connection, msg).map_err(|e| {
                warn!(session = %connection.session_id(), error = %e, "Dropping message, queue closed");
                e
            })
        })
    }

    /// Stop accepting messages. Queued messages are still handed out before
    /// the receiver reports the end of the queue.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Messages currently waiting, including those held back while the queue was full.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity() + lock(&self.spill).pending
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock(spill: &Mutex<Spill>) -> MutexGuard<'_, Spill> {
    spill.lock().unwrap_or_else(PoisonError::into_inner)
}

impl QueueReceiver {
    /// Next message in FIFO order, or `None` once the queue is closed and drained.
    pub async fn pop(&mut self) -> Option<Message> {
        if !self.closed.is_cancelled() {
            tokio::select! {
                biased;
                msg = self.rx.recv() => return msg,
                _ = self.closed.cancelled() => {}
            }
        }
        self.rx.close();
        self.rx.recv().await
    }
}
