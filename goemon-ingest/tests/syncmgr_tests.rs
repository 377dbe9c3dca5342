//! Sync manager tests

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout, Duration};

use goemon_core::config::SyncConfig;
use goemon_core::traits::{BlobStore, WriteToken};
use goemon_core::types::{PrimaryKey, SegmentId, Timestamp};
use goemon_core::Result;
use goemon_ingest::writebuffer::SyncBatch;
use goemon_ingest::{SyncManager, SyncPayload, SyncState, SyncTask};

use common::{MockAllocator, MockBlobStore};

fn make_batch(segment_id: SegmentId, keys: &[i64], ts: Timestamp) -> SyncBatch {
    SyncBatch {
        segment_id,
        primary_keys: keys.iter().copied().map(PrimaryKey::Int).collect(),
        rows: vec![Bytes::from(vec![1u8; 32])],
        deletes: Vec::new(),
        size_bytes: 32,
        min_timestamp: ts,
        max_timestamp: ts,
    }
}

fn make_task(segment_id: SegmentId, keys: &[i64], ts: Timestamp) -> SyncTask {
    SyncTask {
        channel: "by-dev-dml_0_100v0".to_string(),
        pk_field_id: 100,
        batch: make_batch(segment_id, keys, ts),
    }
}

/// Blob store whose puts block until explicitly released, recording the
/// peak number of concurrent puts per segment.
struct GateBlobStore {
    gate: Semaphore,
    running: Mutex<HashMap<SegmentId, usize>>,
    peak: Mutex<HashMap<SegmentId, usize>>,
    started: Mutex<Vec<SegmentId>>,
}

impl GateBlobStore {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            gate: Semaphore::new(0),
            running: Mutex::new(HashMap::new()),
            peak: Mutex::new(HashMap::new()),
            started: Mutex::new(Vec::new()),
        })
    }

    fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    fn started_count(&self) -> usize {
        self.started.lock().len()
    }

    fn peak_for(&self, segment_id: SegmentId) -> usize {
        self.peak.lock().get(&segment_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl BlobStore for GateBlobStore {
    async fn multi_read(&self, _paths: &[String]) -> Result<Vec<Bytes>> {
        Ok(Vec::new())
    }

    async fn put(&self, token: &WriteToken, _path: &str, _data: Bytes) -> Result<()> {
        let segment_id = token.segment_id;
        {
            let mut running = self.running.lock();
            let count = running.entry(segment_id).or_insert(0);
            *count += 1;
            let mut peak = self.peak.lock();
            let p = peak.entry(segment_id).or_insert(0);
            *p = (*p).max(*count);
            self.started.lock().push(segment_id);
        }

        let permit = self.gate.acquire().await.expect("gate closed");
        permit.forget();

        *self.running.lock().get_mut(&segment_id).unwrap() -= 1;
        Ok(())
    }
}

#[tokio::test]
async fn successful_sync_resolves_with_durable_metadata() {
    let store = MockBlobStore::new();
    let manager = SyncManager::new(store.clone(), MockAllocator::new(), SyncConfig::default());

    let handle = manager.submit(make_task(11, &[1, 2, 3], 77)).await.unwrap();
    let synced = handle.resolve().await.unwrap().expect("sync should succeed");

    assert_eq!(synced.segment_id, 11);
    assert_eq!(synced.timestamp, 77);
    assert_eq!(synced.num_rows, 3);
    assert!(synced.path.starts_with("insert_log/by-dev-dml_0_100v0/11/"));

    // Stats built during serialization admit exactly the batch's keys
    let stats = synced.stats.expect("stats for a non-empty batch");
    assert!(stats.may_contain(&PrimaryKey::Int(2)));
    assert!(!stats.may_contain(&PrimaryKey::Int(999)));

    // The durable payload round-trips
    let stored = store.stored();
    let blob = stored.get(&synced.path).expect("blob written");
    let payload = SyncPayload::decode(blob).unwrap();
    assert_eq!(payload.segment_id, 11);
    assert_eq!(payload.primary_keys.len(), 3);
    assert_eq!(payload.max_timestamp, 77);

    assert_eq!(manager.task_state(11), Some(SyncState::Done));
}

#[tokio::test]
async fn failed_sync_hands_the_batch_back() {
    let store = MockBlobStore::new();
    store.fail_next_puts(1);
    let manager = SyncManager::new(store.clone(), MockAllocator::new(), SyncConfig::default());

    let handle = manager.submit(make_task(5, &[9, 10], 50)).await.unwrap();
    let failure = handle.resolve().await.unwrap().expect_err("sync should fail");

    assert_eq!(failure.batch.segment_id, 5);
    assert_eq!(failure.batch.primary_keys.len(), 2, "batch returned intact");
    assert_eq!(failure.error.error_code(), "SYNC_TASK_ERROR");
    assert!(failure.error.is_recoverable());
    assert_eq!(manager.task_state(5), Some(SyncState::Failed));
}

#[tokio::test]
async fn at_most_one_sync_runs_per_segment() {
    let store = GateBlobStore::new();
    let manager = SyncManager::new(store.clone(), MockAllocator::new(), SyncConfig::default());

    let h1 = manager.submit(make_task(1, &[1], 10)).await.unwrap();

    // Wait for the first put to start
    timeout(Duration::from_secs(5), async {
        while store.started_count() < 1 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    // Second submission for the same segment must queue, not run
    let h2 = manager.submit(make_task(1, &[2], 11)).await.unwrap();
    // A different segment is free to run concurrently
    let h3 = manager.submit(make_task(2, &[3], 12)).await.unwrap();

    timeout(Duration::from_secs(5), async {
        while store.started_count() < 2 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    sleep(Duration::from_millis(50)).await;
    assert_eq!(store.started_count(), 2, "queued task must not start early");
    assert_eq!(manager.task_state(1), Some(SyncState::Queued));

    // Release everything and let all three finish
    store.release(3);
    h1.resolve().await.unwrap().expect("first sync");
    h2.resolve().await.unwrap().expect("second sync");
    h3.resolve().await.unwrap().expect("third sync");

    assert_eq!(store.peak_for(1), 1, "two syncs overlapped on segment 1");
    assert_eq!(store.peak_for(2), 1);
}

#[tokio::test]
async fn queued_tasks_dispatch_in_submission_order() {
    let store = GateBlobStore::new();
    let manager = SyncManager::new(store.clone(), MockAllocator::new(), SyncConfig::default());

    let h1 = manager.submit(make_task(1, &[1], 10)).await.unwrap();
    timeout(Duration::from_secs(5), async {
        while store.started_count() < 1 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let h2 = manager.submit(make_task(1, &[2], 11)).await.unwrap();
    let h3 = manager.submit(make_task(1, &[3], 12)).await.unwrap();

    store.release(3);
    let s1 = h1.resolve().await.unwrap().unwrap();
    let s2 = h2.resolve().await.unwrap().unwrap();
    let s3 = h3.resolve().await.unwrap().unwrap();

    // Timestamps resolve in write order for the segment
    assert_eq!(s1.timestamp, 10);
    assert_eq!(s2.timestamp, 11);
    assert_eq!(s3.timestamp, 12);
    assert_eq!(store.peak_for(1), 1);
}
