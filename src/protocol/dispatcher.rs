use crate::config::{DispatchConfig, ASYNC_BUDGET, SYNC_CAPACITY};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::message::Message;
use crate::protocol::queue::QueueReceiver;
use crate::utils::metrics::global_metrics;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

/// Shared message handler. Handlers receive the message behind an `Arc`
/// because a multi-tag message is handed to several of them.
pub type Handler = Arc<dyn Fn(Arc<Message>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Wrap an async closure as a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Arc<Message>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |msg| f(msg).boxed())
}

/// An object that serves several message types under one `(scheme, tag)`.
pub trait MessageObject {
    fn mapped_types(&self) -> HashMap<u32, Handler>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct RouteKey {
    scheme: u32,
    tag: u32,
    kind: u32,
}

impl std::fmt::Display for RouteKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}-{}", self.scheme, self.tag, self.kind)
    }
}

/// Durations of completed async handler invocations, one sample per handler run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AsyncStats {
    pub count: u64,
    pub average: Duration,
    pub max: Duration,
    pub min: Duration,
}

#[derive(Default)]
struct Timing {
    count: u64,
    total: Duration,
    max: Duration,
    min: Option<Duration>,
}

impl Timing {
    fn record(&mut self, elapsed: Duration) {
        self.count += 1;
        self.total += elapsed;
        self.max = self.max.max(elapsed);
        self.min = Some(self.min.map_or(elapsed, |min| min.min(elapsed)));
    }

    fn stats(&self) -> AsyncStats {
        let average = if self.count == 0 {
            Duration::ZERO
        } else {
            let nanos = self.total.as_nanos() / u128::from(self.count);
            Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
        };
        AsyncStats {
            count: self.count,
            average,
            max: self.max,
            min: self.min.unwrap_or_default(),
        }
    }
}

/// Routes queued messages to handlers registered under `(scheme, tag, type)`.
///
/// Sync messages run one at a time on a dedicated consumer in arrival order.
/// Async messages run concurrently, never more than the configured budget at once.
/// Cloning yields another handle to the same table and budget.
#[derive(Clone)]
pub struct Dispatcher {
    handlers: Arc<RwLock<HashMap<RouteKey, Handler>>>,
    budget: Arc<Semaphore>,
    budget_size: usize,
    sync_capacity: usize,
    timing: Arc<Mutex<Timing>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::with_limits(ASYNC_BUDGET, SYNC_CAPACITY)
    }

    pub fn from_config(config: &DispatchConfig) -> Self {
        Self::with_limits(config.async_budget, config.sync_capacity)
    }

    pub fn with_limits(async_budget: usize, sync_capacity: usize) -> Self {
        let budget_size = async_budget.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
            budget: Arc::new(Semaphore::new(budget_size)),
            budget_size,
            sync_capacity: sync_capacity.max(1),
            timing: Arc::new(Mutex::new(Timing::default())),
        }
    }

    /// Register `handler` for `(scheme, tag, kind)`, replacing any previous one.
    pub fn register(&self, scheme: u32, tag: u32, kind: u32, handler: Handler) -> Result<()> {
        let mut handlers = self.handlers.write().map_err(|_| {
            ProtocolError::Custom(constants::ERR_DISPATCHER_WRITE_LOCK.to_string())
        })?;

        handlers.insert(RouteKey { scheme, tag, kind }, handler);
        Ok(())
    }

    /// Register every type the object serves under `(scheme, tag)`.
    pub fn register_object<O: MessageObject + ?Sized>(
        &self,
        scheme: u32,
        tag: u32,
        object: &O,
    ) -> Result<()> {
        let mapped = object.mapped_types();
        let mut handlers = self.handlers.write().map_err(|_| {
            ProtocolError::Custom(constants::ERR_DISPATCHER_WRITE_LOCK.to_string())
        })?;

        for (kind, handler) in mapped {
            handlers.insert(RouteKey { scheme, tag, kind }, handler);
        }
        Ok(())
    }

    /// Async invocations currently holding a budget slot.
    pub fn in_flight(&self) -> usize {
        self.budget_size - self.budget.available_permits()
    }

    pub fn async_budget(&self) -> usize {
        self.budget_size
    }

    pub fn async_stats(&self) -> AsyncStats {
        self.timing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stats()
    }

    /// Consume `queue` until it is closed and drained.
    ///
    /// The returned handle completes after the sync consumer has finished its
    /// backlog. Async invocations still running at that point are not awaited.
    pub fn dispatch(&self, mut queue: QueueReceiver) -> JoinHandle<()> {
        let dispatcher = self.clone();

        tokio::spawn(async move {
            let (sync_tx, sync_rx) = mpsc::channel(dispatcher.sync_capacity);
            let consumer = tokio::spawn(dispatcher.clone().consume_sync(sync_rx));

            while let Some(msg) = queue.pop().await {
                let msg = Arc::new(msg);

                if msg.sync {
                    global_metrics().dispatched_sync();
                    if sync_tx.send(msg).await.is_err() {
                        error!("Sync consumer stopped, ending dispatch");
                        break;
                    }
                    continue;
                }

                // Holding the loop here while saturated keeps the queue from draining.
                let Ok(permit) = Arc::clone(&dispatcher.budget).acquire_owned().await else {
                    break;
                };
                global_metrics().dispatched_async();

                let worker = dispatcher.clone();
                tokio::spawn(async move {
                    worker.invoke(&msg).await;
                    drop(permit);
                });
            }

            drop(sync_tx);
            if let Err(e) = consumer.await {
                error!(error = %e, "Sync consumer ended abnormally");
            }
            debug!("Dispatch loop stopped");
        })
    }

    async fn consume_sync(self, mut rx: mpsc::Receiver<Arc<Message>>) {
        while let Some(msg) = rx.recv().await {
            self.invoke(&msg).await;
        }
    }

    /// Run the handler for each of the message's tags in order. Async
    /// invocations are timed individually.
    async fn invoke(&self, msg: &Arc<Message>) {
        for &tag in &msg.tags {
            let key = RouteKey {
                scheme: msg.scheme,
                tag,
                kind: msg.kind,
            };
            let Some(handler) = self.lookup(&key) else {
                trace!(route = %key, "No handler registered, skipping");
                continue;
            };

            let start = Instant::now();
            let result = handler(Arc::clone(msg)).await;
            if !msg.sync {
                self.timing
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .record(start.elapsed());
            }
            if let Err(e) = result {
                warn!(route = %key, sync = msg.sync, error = %e, "Handler failed");
            }
        }
    }

    fn lookup(&self, key: &RouteKey) -> Option<Handler> {
        match self.handlers.read() {
            Ok(handlers) => handlers.get(key).cloned(),
            Err(_) => {
                error!(route = %key, "{}", constants::ERR_DISPATCHER_READ_LOCK);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::queue::MessageQueue;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(counter: &Arc<AtomicUsize>) -> Handler {
        let counter = Arc::clone(counter);
        handler(move |_msg| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    #[test]
    fn test_timing_keeps_first_and_zero_minimum() {
        let mut timing = Timing::default();
        assert_eq!(timing.stats(), AsyncStats::default());

        timing.record(Duration::from_millis(5));
        assert_eq!(timing.stats().min, Duration::from_millis(5));

        timing.record(Duration::ZERO);
        timing.record(Duration::from_millis(7));
        let stats = timing.stats();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.min, Duration::ZERO);
        assert_eq!(stats.max, Duration::from_millis(7));
        assert_eq!(stats.average, Duration::from_millis(4));
    }

    #[test]
    fn test_budget_is_clamped() {
        assert_eq!(Dispatcher::with_limits(0, 0).async_budget(), 1);
        assert_eq!(Dispatcher::new().async_budget(), ASYNC_BUDGET);
        assert_eq!(Dispatcher::new().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_routes_each_tag_and_skips_missing() {
        let dispatcher = Dispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));
        dispatcher.register(1, 10, 5, counting(&hits)).unwrap();
        dispatcher.register(1, 11, 5, counting(&hits)).unwrap();

        let (queue, rx) = MessageQueue::new(16);
        let handle = dispatcher.dispatch(rx);

        let msg = Message::new(1, 5, Bytes::new())
            .with_tags([10, 11, 12])
            .with_sync(true);
        queue.send(msg).await.unwrap();
        queue.send(Message::new(2, 5, Bytes::new()).with_tag(10).with_sync(true)).await.unwrap();
        queue.close();
        handle.await.unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_handler_error_does_not_stop_dispatch() {
        let dispatcher = Dispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));
        dispatcher
            .register(
                1,
                1,
                1,
                handler(|_msg| async { Err(ProtocolError::Custom("boom".into())) }),
            )
            .unwrap();
        dispatcher.register(1, 1, 2, counting(&hits)).unwrap();

        let (queue, rx) = MessageQueue::new(16);
        let handle = dispatcher.dispatch(rx);
        queue.send(Message::new(1, 1, Bytes::new()).with_tag(1).with_sync(true)).await.unwrap();
        queue.send(Message::new(1, 2, Bytes::new()).with_tag(1).with_sync(true)).await.unwrap();
        queue.close();
        handle.await.unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_async_timing_samples_each_handler_run() {
        let dispatcher = Dispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));
        dispatcher.register(1, 10, 5, counting(&hits)).unwrap();
        dispatcher.register(1, 11, 5, counting(&hits)).unwrap();

        let (queue, rx) = MessageQueue::new(16);
        let handle = dispatcher.dispatch(rx);

        // Nothing is registered for tag 12, so no sample is taken.
        queue.send(Message::new(1, 5, Bytes::new()).with_tag(12)).await.unwrap();
        queue.send(Message::new(1, 5, Bytes::new()).with_tags([10, 11])).await.unwrap();
        queue.close();
        handle.await.unwrap();

        for _ in 0..200 {
            if dispatcher.in_flight() == 0 && hits.load(Ordering::SeqCst) == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(dispatcher.async_stats().count, 2);
    }

    struct Echo;

    impl MessageObject for Echo {
        fn mapped_types(&self) -> HashMap<u32, Handler> {
            let mut types = HashMap::new();
            types.insert(1, handler(|_msg| async { Ok(()) }));
            types.insert(2, handler(|_msg| async { Ok(()) }));
            types
        }
    }

    #[test]
    fn test_register_object() {
        let dispatcher = Dispatcher::new();
        dispatcher.register_object(3, 4, &Echo).unwrap();

        for kind in [1, 2] {
            assert!(dispatcher
                .lookup(&RouteKey { scheme: 3, tag: 4, kind })
                .is_some());
        }
        assert!(dispatcher
            .lookup(&RouteKey { scheme: 3, tag: 4, kind: 3 })
            .is_none());
    }
}
