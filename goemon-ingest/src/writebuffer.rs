//! Per-segment accumulation of uncommitted rows.
//!
//! Appends never block on durable storage; a drain hands the current batch
//! to a sync task and later appends start a fresh batch. A failed sync
//! batch is requeued in front of anything accumulated since, so the retry
//! covers the union of both.

use std::collections::HashMap;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;

use goemon_core::config::WriteBufferConfig;
use goemon_core::metrics::IngestMetrics;
use goemon_core::types::{PrimaryKey, SegmentId, Timestamp};

/// One drained batch, owned by a sync task until it resolves
#[derive(Debug, Clone)]
pub struct SyncBatch {
    pub segment_id: SegmentId,
    pub primary_keys: Vec<PrimaryKey>,
    pub rows: Vec<Bytes>,
    pub deletes: Vec<(PrimaryKey, Timestamp)>,
    pub size_bytes: usize,
    pub min_timestamp: Timestamp,
    pub max_timestamp: Timestamp,
}

impl SyncBatch {
    pub fn num_rows(&self) -> u64 {
        self.primary_keys.len() as u64
    }
}

struct SegmentBuffer {
    primary_keys: Vec<PrimaryKey>,
    rows: Vec<Bytes>,
    deletes: Vec<(PrimaryKey, Timestamp)>,
    size_bytes: usize,
    min_timestamp: Timestamp,
    max_timestamp: Timestamp,
    created_at: Instant,
    /// Set when a failed sync batch was merged back in; forces the next
    /// flush evaluation to pick this segment up again.
    retry: bool,
}

impl SegmentBuffer {
    fn new() -> Self {
        Self {
            primary_keys: Vec::new(),
            rows: Vec::new(),
            deletes: Vec::new(),
            size_bytes: 0,
            min_timestamp: Timestamp::MAX,
            max_timestamp: 0,
            created_at: Instant::now(),
            retry: false,
        }
    }

    fn observe(&mut self, timestamp: Timestamp) {
        self.min_timestamp = self.min_timestamp.min(timestamp);
        self.max_timestamp = self.max_timestamp.max(timestamp);
    }

    fn should_flush(&self, config: &WriteBufferConfig) -> bool {
        self.retry
            || self.size_bytes >= config.max_segment_bytes
            || self.created_at.elapsed() >= config.max_buffer_age
    }

    fn into_batch(self, segment_id: SegmentId) -> SyncBatch {
        SyncBatch {
            segment_id,
            primary_keys: self.primary_keys,
            rows: self.rows,
            deletes: self.deletes,
            size_bytes: self.size_bytes,
            min_timestamp: self.min_timestamp,
            max_timestamp: self.max_timestamp,
        }
    }
}

pub struct WriteBuffer {
    config: WriteBufferConfig,
    metrics: IngestMetrics,
    buffers: Mutex<HashMap<SegmentId, SegmentBuffer>>,
}

impl WriteBuffer {
    pub fn new(config: WriteBufferConfig, metrics: IngestMetrics) -> Self {
        Self {
            config,
            metrics,
            buffers: Mutex::new(HashMap::new()),
        }
    }

    /// Append insert rows for a segment, updating its high-water timestamp
    pub fn append_insert(
        &self,
        segment_id: SegmentId,
        primary_keys: Vec<PrimaryKey>,
        rows: Bytes,
        timestamp: Timestamp,
    ) {
        let num_rows = primary_keys.len() as u64;
        let bytes = rows.len();

        let mut buffers = self.buffers.lock();
        let buffer = buffers.entry(segment_id).or_insert_with(SegmentBuffer::new);
        buffer.primary_keys.extend(primary_keys);
        buffer.rows.push(rows);
        buffer.size_bytes += bytes;
        buffer.observe(timestamp);
        drop(buffers);

        self.metrics.record_buffered(num_rows, bytes as u64);
    }

    /// Append delete records routed to a segment
    pub fn append_deletes(
        &self,
        segment_id: SegmentId,
        primary_keys: Vec<PrimaryKey>,
        timestamp: Timestamp,
    ) {
        let count = primary_keys.len() as u64;

        let mut buffers = self.buffers.lock();
        let buffer = buffers.entry(segment_id).or_insert_with(SegmentBuffer::new);
        for pk in primary_keys {
            buffer.size_bytes += pk.canonical_bytes().len() + std::mem::size_of::<Timestamp>();
            buffer.deletes.push((pk, timestamp));
        }
        buffer.observe(timestamp);
        drop(buffers);

        self.metrics.record_deletes_buffered(count);
    }

    /// Atomically remove the segment's current batch, handing ownership to
    /// a sync task. Returns `None` when nothing is buffered.
    pub fn drain_for_sync(&self, segment_id: SegmentId) -> Option<SyncBatch> {
        let buffer = self.buffers.lock().remove(&segment_id)?;
        if buffer.primary_keys.is_empty() && buffer.deletes.is_empty() {
            return None;
        }
        Some(buffer.into_batch(segment_id))
    }

    /// Merge a failed sync batch back in front of rows accumulated since
    pub fn requeue(&self, batch: SyncBatch) {
        let mut buffers = self.buffers.lock();
        let newer = buffers.remove(&batch.segment_id);

        let mut merged = SegmentBuffer::new();
        merged.primary_keys = batch.primary_keys;
        merged.rows = batch.rows;
        merged.deletes = batch.deletes;
        merged.size_bytes = batch.size_bytes;
        merged.min_timestamp = batch.min_timestamp;
        merged.max_timestamp = batch.max_timestamp;
        merged.retry = true;

        if let Some(newer) = newer {
            merged.primary_keys.extend(newer.primary_keys);
            merged.rows.extend(newer.rows);
            merged.deletes.extend(newer.deletes);
            merged.size_bytes += newer.size_bytes;
            merged.min_timestamp = merged.min_timestamp.min(newer.min_timestamp);
            merged.max_timestamp = merged.max_timestamp.max(newer.max_timestamp);
        }

        buffers.insert(batch.segment_id, merged);
    }

    /// Segments whose buffered size, age or pending retry warrants a flush
    pub fn flush_due(&self) -> Vec<SegmentId> {
        self.buffers
            .lock()
            .iter()
            .filter(|(_, buffer)| buffer.should_flush(&self.config))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Minimum timestamp across all buffered (unsynced) data
    pub fn earliest_unsynced(&self) -> Option<Timestamp> {
        self.buffers
            .lock()
            .values()
            .filter(|b| !b.primary_keys.is_empty() || !b.deletes.is_empty())
            .map(|b| b.min_timestamp)
            .min()
    }

    /// Discard a segment's buffer (drop notification)
    pub fn discard(&self, segment_id: SegmentId) {
        self.buffers.lock().remove(&segment_id);
    }

    /// Drain every non-empty buffer (graceful close, final flush)
    pub fn drain_all(&self) -> Vec<SyncBatch> {
        let mut buffers = self.buffers.lock();
        buffers
            .drain()
            .filter(|(_, b)| !b.primary_keys.is_empty() || !b.deletes.is_empty())
            .map(|(id, b)| b.into_batch(id))
            .collect()
    }

    pub fn buffered_segments(&self) -> usize {
        self.buffers.lock().len()
    }

    pub fn has_data(&self, segment_id: SegmentId) -> bool {
        self.buffers
            .lock()
            .get(&segment_id)
            .map(|b| !b.primary_keys.is_empty() || !b.deletes.is_empty())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn buffer_with(max_bytes: usize, max_age: Duration) -> WriteBuffer {
        WriteBuffer::new(
            WriteBufferConfig {
                max_segment_bytes: max_bytes,
                max_buffer_age: max_age,
            },
            IngestMetrics::new(),
        )
    }

    fn insert(buffer: &WriteBuffer, segment_id: SegmentId, start: i64, n: i64, ts: Timestamp) {
        let pks: Vec<PrimaryKey> = (start..start + n).map(PrimaryKey::Int).collect();
        buffer.append_insert(segment_id, pks, Bytes::from(vec![0u8; 64]), ts);
    }

    #[test]
    fn drain_starts_a_fresh_batch() {
        let buffer = buffer_with(1 << 20, Duration::from_secs(60));
        insert(&buffer, 1, 0, 10, 5);

        let batch = buffer.drain_for_sync(1).unwrap();
        assert_eq!(batch.num_rows(), 10);
        assert_eq!(batch.min_timestamp, 5);

        assert!(buffer.drain_for_sync(1).is_none());

        insert(&buffer, 1, 10, 5, 6);
        let next = buffer.drain_for_sync(1).unwrap();
        assert_eq!(next.num_rows(), 5);
    }

    #[test]
    fn size_threshold_triggers_flush() {
        let buffer = buffer_with(100, Duration::from_secs(60));
        insert(&buffer, 1, 0, 1, 1); // 64 bytes
        assert!(buffer.flush_due().is_empty());
        insert(&buffer, 1, 1, 1, 2); // 128 bytes
        assert_eq!(buffer.flush_due(), vec![1]);
    }

    #[test]
    fn age_threshold_triggers_flush() {
        let buffer = buffer_with(1 << 20, Duration::from_millis(20));
        insert(&buffer, 1, 0, 1, 1);
        assert!(buffer.flush_due().is_empty());
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(buffer.flush_due(), vec![1]);
    }

    #[test]
    fn requeue_covers_the_union() {
        let buffer = buffer_with(1 << 20, Duration::from_secs(60));
        insert(&buffer, 1, 0, 3, 10);
        let failed = buffer.drain_for_sync(1).unwrap();

        // Rows arrive while the sync is in flight
        insert(&buffer, 1, 3, 2, 11);

        buffer.requeue(failed);
        // Retry flag makes the segment immediately due
        assert_eq!(buffer.flush_due(), vec![1]);

        let merged = buffer.drain_for_sync(1).unwrap();
        assert_eq!(merged.num_rows(), 5, "retry must cover both batches");
        assert_eq!(merged.min_timestamp, 10);
        assert_eq!(merged.max_timestamp, 11);
        // Original batch ordered before the newer rows
        assert_eq!(merged.primary_keys[0], PrimaryKey::Int(0));
        assert_eq!(merged.primary_keys[4], PrimaryKey::Int(4));
    }

    #[test]
    fn discard_drops_buffered_data() {
        let buffer = buffer_with(1 << 20, Duration::from_secs(60));
        insert(&buffer, 1, 0, 10, 5);
        buffer.discard(1);
        assert!(buffer.drain_for_sync(1).is_none());
        assert_eq!(buffer.earliest_unsynced(), None);
    }

    #[test]
    fn earliest_unsynced_is_min_across_segments() {
        let buffer = buffer_with(1 << 20, Duration::from_secs(60));
        insert(&buffer, 1, 0, 1, 20);
        insert(&buffer, 2, 0, 1, 7);
        assert_eq!(buffer.earliest_unsynced(), Some(7));
    }

    #[test]
    fn deletes_count_as_buffered_data() {
        let buffer = buffer_with(1 << 20, Duration::from_secs(60));
        buffer.append_deletes(3, vec![PrimaryKey::Int(1)], 9);
        assert!(buffer.has_data(3));
        let batch = buffer.drain_for_sync(3).unwrap();
        assert_eq!(batch.deletes.len(), 1);
        assert_eq!(batch.num_rows(), 0);
    }
}
