//! # Metrics and Monitoring
//!
//! Per-channel metrics for the ingest pipeline, plus the process-scoped
//! registry that owns them. The registry replaces any ambient global state:
//! it is created at process start and passed by reference to every pipeline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

/// Metrics collector for one channel pipeline
#[derive(Clone)]
pub struct IngestMetrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    // Stream metrics
    messages_consumed: AtomicU64,
    messages_discarded: AtomicU64,

    // Buffer metrics
    rows_buffered: AtomicU64,
    deletes_buffered: AtomicU64,
    bytes_buffered: AtomicU64,

    // Sync metrics
    syncs_submitted: AtomicU64,
    syncs_completed: AtomicU64,
    syncs_failed: AtomicU64,

    // Checkpoint gauge
    checkpoint_timestamp: AtomicU64,
}

impl IngestMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                messages_consumed: AtomicU64::new(0),
                messages_discarded: AtomicU64::new(0),
                rows_buffered: AtomicU64::new(0),
                deletes_buffered: AtomicU64::new(0),
                bytes_buffered: AtomicU64::new(0),
                syncs_submitted: AtomicU64::new(0),
                syncs_completed: AtomicU64::new(0),
                syncs_failed: AtomicU64::new(0),
                checkpoint_timestamp: AtomicU64::new(0),
            }),
        }
    }

    pub fn record_message(&self) {
        self.inner.messages_consumed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discarded(&self) {
        self.inner.messages_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_buffered(&self, rows: u64, bytes: u64) {
        self.inner.rows_buffered.fetch_add(rows, Ordering::Relaxed);
        self.inner.bytes_buffered.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_deletes_buffered(&self, count: u64) {
        self.inner.deletes_buffered.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_sync_submitted(&self) {
        self.inner.syncs_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sync_completed(&self) {
        self.inner.syncs_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sync_failed(&self) {
        self.inner.syncs_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_checkpoint(&self, timestamp: u64) {
        self.inner.checkpoint_timestamp.store(timestamp, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_consumed: self.inner.messages_consumed.load(Ordering::Relaxed),
            messages_discarded: self.inner.messages_discarded.load(Ordering::Relaxed),
            rows_buffered: self.inner.rows_buffered.load(Ordering::Relaxed),
            deletes_buffered: self.inner.deletes_buffered.load(Ordering::Relaxed),
            bytes_buffered: self.inner.bytes_buffered.load(Ordering::Relaxed),
            syncs_submitted: self.inner.syncs_submitted.load(Ordering::Relaxed),
            syncs_completed: self.inner.syncs_completed.load(Ordering::Relaxed),
            syncs_failed: self.inner.syncs_failed.load(Ordering::Relaxed),
            checkpoint_timestamp: self.inner.checkpoint_timestamp.load(Ordering::Relaxed),
        }
    }
}

impl Default for IngestMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Metrics snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub messages_consumed: u64,
    pub messages_discarded: u64,
    pub rows_buffered: u64,
    pub deletes_buffered: u64,
    pub bytes_buffered: u64,
    pub syncs_submitted: u64,
    pub syncs_completed: u64,
    pub syncs_failed: u64,
    pub checkpoint_timestamp: u64,
}

/// Process-scoped registry of per-channel metrics. Pipelines register on
/// start and release on close; the owning process reads snapshots for its
/// health surface.
pub struct ChannelMetricsRegistry {
    channels: RwLock<HashMap<String, IngestMetrics>>,
}

impl ChannelMetricsRegistry {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Register a channel, returning its metrics handle. Re-registering an
    /// existing channel returns the same handle.
    pub fn register(&self, channel: &str) -> IngestMetrics {
        self.channels
            .write()
            .entry(channel.to_string())
            .or_insert_with(IngestMetrics::new)
            .clone()
    }

    /// Release a channel's registration
    pub fn release(&self, channel: &str) {
        self.channels.write().remove(channel);
    }

    pub fn get(&self, channel: &str) -> Option<IngestMetrics> {
        self.channels.read().get(channel).cloned()
    }

    pub fn channels(&self) -> Vec<String> {
        self.channels.read().keys().cloned().collect()
    }
}

impl Default for ChannelMetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Timer for measuring operation duration
pub struct Timer {
    start: Instant,
    name: &'static str,
}

impl Timer {
    pub fn new(name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            name,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop the timer and log its duration
    pub fn stop(self) {
        let duration = self.elapsed();
        tracing::debug!(
            name = self.name,
            duration_ms = duration.as_millis() as u64,
            "operation completed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_register_release() {
        let registry = ChannelMetricsRegistry::new();
        let metrics = registry.register("ch-1");
        metrics.record_message();

        // Same handle on re-register
        let again = registry.register("ch-1");
        assert_eq!(again.snapshot().messages_consumed, 1);

        registry.release("ch-1");
        assert!(registry.get("ch-1").is_none());
    }
}
