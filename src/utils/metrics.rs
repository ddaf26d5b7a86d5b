//! Observability and Metrics
//!
//! Process-wide counters for the connection pipeline and the dispatcher.
//!
//! Uses atomic counters for thread-safe metrics collection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Global metrics collector for pipeline and dispatch operations
#[derive(Debug)]
pub struct Metrics {
    /// Total connections started
    pub connections_total: AtomicU64,
    /// Currently running connections
    pub connections_active: AtomicU64,
    /// Total bytes read from transports
    pub bytes_received: AtomicU64,
    /// Total bytes written to transports
    pub bytes_sent: AtomicU64,
    /// Packets extracted by packet formats
    pub packets_received: AtomicU64,
    /// Messages produced by codecs (or raw delivery)
    pub messages_decoded: AtomicU64,
    /// Messages encoded for outbound sends
    pub messages_encoded: AtomicU64,
    /// Cumulative time spent in framing/decoding passes (nanoseconds)
    pub decode_time_ns: AtomicU64,
    /// Cumulative time spent encoding outbound messages (nanoseconds)
    pub encode_time_ns: AtomicU64,
    /// Messages routed to the sync consumer
    pub dispatched_sync: AtomicU64,
    /// Messages run on async tasks
    pub dispatched_async: AtomicU64,
    /// Transport failures and write timeouts
    pub connection_errors: AtomicU64,
    /// Framing and decode failures
    pub protocol_errors: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            messages_decoded: AtomicU64::new(0),
            messages_encoded: AtomicU64::new(0),
            decode_time_ns: AtomicU64::new(0),
            encode_time_ns: AtomicU64::new(0),
            dispatched_sync: AtomicU64::new(0),
            dispatched_async: AtomicU64::new(0),
            connection_errors: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a started connection pipeline
    pub fn connection_started(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a fully stopped connection pipeline
    pub fn connection_stopped(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn bytes_received(&self, count: usize) {
        self.bytes_received.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_sent(&self, count: usize) {
        self.bytes_sent.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn packet_received(&self) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_decoded(&self) {
        self.messages_decoded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_encoded(&self) {
        self.messages_encoded.fetch_add(1, Ordering::Relaxed);
    }

    /// Add the duration of one processing pass
    pub fn decode_time(&self, elapsed: Duration) {
        self.decode_time_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Add the duration of one outbound encode
    pub fn encode_time(&self, elapsed: Duration) {
        self.encode_time_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn dispatched_sync(&self) {
        self.dispatched_sync.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dispatched_async(&self) {
        self.dispatched_async.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection error
    pub fn connection_error(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a protocol error
    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            messages_decoded: self.messages_decoded.load(Ordering::Relaxed),
            messages_encoded: self.messages_encoded.load(Ordering::Relaxed),
            decode_time_ns: self.decode_time_ns.load(Ordering::Relaxed),
            encode_time_ns: self.encode_time_ns.load(Ordering::Relaxed),
            dispatched_sync: self.dispatched_sync.load(Ordering::Relaxed),
            dispatched_async: self.dispatched_async.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            connections_total = snapshot.connections_total,
            connections_active = snapshot.connections_active,
            bytes_received = snapshot.bytes_received,
            bytes_sent = snapshot.bytes_sent,
            packets_received = snapshot.packets_received,
            messages_decoded = snapshot.messages_decoded,
            messages_encoded = snapshot.messages_encoded,
            decode_time_ns = snapshot.decode_time_ns,
            encode_time_ns = snapshot.encode_time_ns,
            dispatched_sync = snapshot.dispatched_sync,
            dispatched_async = snapshot.dispatched_async,
            connection_errors = snapshot.connection_errors,
            protocol_errors = snapshot.protocol_errors,
            uptime_seconds = snapshot.uptime_seconds,
            "Core metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub packets_received: u64,
    pub messages_decoded: u64,
    pub messages_encoded: u64,
    pub decode_time_ns: u64,
    pub encode_time_ns: u64,
    pub dispatched_sync: u64,
    pub dispatched_async: u64,
    pub connection_errors: u64,
    pub protocol_errors: u64,
    pub uptime_seconds: u64,
}

static METRICS: once_cell::sync::Lazy<Metrics> = once_cell::sync::Lazy::new(Metrics::new);

/// Get the global metrics instance
pub fn global_metrics() -> &'static Metrics {
    &METRICS
}

/// Timer for measuring operation duration
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    /// Start timing an operation
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        debug!(
            operation = self.operation,
            duration_us = duration.as_micros() as u64,
            "Operation completed"
        );
    }
}
