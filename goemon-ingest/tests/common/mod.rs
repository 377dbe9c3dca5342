//! In-memory mock collaborators for pipeline tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use goemon_core::config::{IngestConfig, SyncConfig, WriteBufferConfig};
use goemon_core::metrics::ChannelMetricsRegistry;
use goemon_core::traits::{
    BlobStore, Broker, CheckpointUpdater, IdAllocator, LogClient, WriteToken,
};
use goemon_core::types::{
    Message, PrimaryKey, ResumePosition, SegmentDescriptor, SegmentId, StatLog, Timestamp,
};
use goemon_core::{ChannelInfo, Error, Result};

use goemon_ingest::pkindex::{encode_stats, PkStatistics};
use goemon_ingest::{BoundedExecutor, IngestServices, SyncManager};

pub fn channel_info(name: &str) -> ChannelInfo {
    ChannelInfo {
        channel_name: name.to_string(),
        collection_id: 100,
        node_id: 1,
        pk_field_id: 100,
    }
}

/// Log client backed by an in-memory channel the test feeds directly
pub struct MockLogClient {
    stream: Mutex<Option<mpsc::Receiver<Message>>>,
    deregistered: AtomicUsize,
}

impl MockLogClient {
    pub fn new() -> (Arc<Self>, mpsc::Sender<Message>) {
        let (tx, rx) = mpsc::channel(256);
        let client = Arc::new(Self {
            stream: Mutex::new(Some(rx)),
            deregistered: AtomicUsize::new(0),
        });
        (client, tx)
    }

    pub fn deregistered(&self) -> usize {
        self.deregistered.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LogClient for MockLogClient {
    async fn subscribe(
        &self,
        _channel: &str,
        _resume: ResumePosition,
    ) -> Result<mpsc::Receiver<Message>> {
        self.stream.lock().take().ok_or_else(|| Error::Internal {
            message: "stream already subscribed".to_string(),
        })
    }

    async fn deregister(&self, _channel: &str) -> Result<()> {
        self.deregistered.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Broker serving a fixed descriptor table
pub struct MockBroker {
    descriptors: HashMap<SegmentId, SegmentDescriptor>,
}

impl MockBroker {
    pub fn new(descriptors: Vec<SegmentDescriptor>) -> Arc<Self> {
        Arc::new(Self {
            descriptors: descriptors
                .into_iter()
                .map(|d| (d.segment_id, d))
                .collect(),
        })
    }

    pub fn empty() -> Arc<Self> {
        Arc::new(Self {
            descriptors: HashMap::new(),
        })
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn get_segment_info(&self, segment_ids: &[SegmentId]) -> Result<Vec<SegmentDescriptor>> {
        segment_ids
            .iter()
            .map(|id| {
                self.descriptors.get(id).cloned().ok_or_else(|| Error::Internal {
                    message: format!("unknown segment {}", id),
                })
            })
            .collect()
    }
}

/// Blob store with injectable put failures and read/write recording
pub struct MockBlobStore {
    blobs: Mutex<HashMap<String, Bytes>>,
    reads: Mutex<Vec<String>>,
    fail_next_puts: AtomicUsize,
    puts: AtomicUsize,
}

impl MockBlobStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            blobs: Mutex::new(HashMap::new()),
            reads: Mutex::new(Vec::new()),
            fail_next_puts: AtomicUsize::new(0),
            puts: AtomicUsize::new(0),
        })
    }

    pub fn insert_blob(&self, path: &str, data: Vec<u8>) {
        self.blobs.lock().insert(path.to_string(), Bytes::from(data));
    }

    /// Make the next `n` put calls fail
    pub fn fail_next_puts(&self, n: usize) {
        self.fail_next_puts.store(n, Ordering::SeqCst);
    }

    pub fn read_paths(&self) -> Vec<String> {
        self.reads.lock().clone()
    }

    pub fn stored(&self) -> HashMap<String, Bytes> {
        self.blobs.lock().clone()
    }

    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlobStore for MockBlobStore {
    async fn multi_read(&self, paths: &[String]) -> Result<Vec<Bytes>> {
        let blobs = self.blobs.lock();
        let mut reads = self.reads.lock();
        paths
            .iter()
            .map(|path| {
                reads.push(path.clone());
                blobs.get(path).cloned().ok_or_else(|| Error::Storage {
                    message: format!("blob not found: {}", path),
                    source: None,
                })
            })
            .collect()
    }

    async fn put(&self, _token: &WriteToken, path: &str, data: Bytes) -> Result<()> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.fail_next_puts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next_puts.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::Storage {
                message: "injected put failure".to_string(),
                source: None,
            });
        }
        self.blobs.lock().insert(path.to_string(), data);
        Ok(())
    }
}

pub struct MockAllocator {
    next: AtomicU64,
}

impl MockAllocator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next: AtomicU64::new(1),
        })
    }
}

#[async_trait]
impl IdAllocator for MockAllocator {
    async fn alloc(&self, count: u32) -> Result<u64> {
        Ok(self.next.fetch_add(count as u64, Ordering::SeqCst))
    }
}

/// Records every published checkpoint
pub struct RecordingCheckpointUpdater {
    updates: Mutex<Vec<(String, Timestamp)>>,
}

impl RecordingCheckpointUpdater {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            updates: Mutex::new(Vec::new()),
        })
    }

    pub fn updates(&self) -> Vec<(String, Timestamp)> {
        self.updates.lock().clone()
    }

    pub fn latest(&self) -> Option<Timestamp> {
        self.updates.lock().last().map(|(_, ts)| *ts)
    }
}

#[async_trait]
impl CheckpointUpdater for RecordingCheckpointUpdater {
    async fn update(&self, channel: &str, timestamp: Timestamp) {
        self.updates.lock().push((channel.to_string(), timestamp));
    }
}

/// Test harness bundling the mocks behind an [`IngestServices`]
pub struct TestHarness {
    pub services: IngestServices,
    pub log_client: Arc<MockLogClient>,
    pub log_tx: mpsc::Sender<Message>,
    pub blob_store: Arc<MockBlobStore>,
    pub checkpoints: Arc<RecordingCheckpointUpdater>,
}

pub fn harness(broker: Arc<MockBroker>, config: &IngestConfig) -> TestHarness {
    let (log_client, log_tx) = MockLogClient::new();
    let blob_store = MockBlobStore::new();
    let allocator = MockAllocator::new();
    let checkpoints = RecordingCheckpointUpdater::new();

    let sync_manager = Arc::new(SyncManager::new(
        blob_store.clone(),
        allocator.clone(),
        config.sync.clone(),
    ));

    let services = IngestServices {
        log_client: log_client.clone(),
        broker,
        blob_store: blob_store.clone(),
        allocator,
        checkpoint_updater: checkpoints.clone(),
        executor: Arc::new(BoundedExecutor::new(config.executor.workers)),
        sync_manager,
        metrics: Arc::new(ChannelMetricsRegistry::new()),
    };

    TestHarness {
        services,
        log_client,
        log_tx,
        blob_store,
        checkpoints,
    }
}

/// Config with thresholds small enough for tests to hit deliberately
pub fn test_config() -> IngestConfig {
    IngestConfig {
        write_buffer: WriteBufferConfig {
            max_segment_bytes: 512,
            max_buffer_age: std::time::Duration::from_secs(3600),
        },
        sync: SyncConfig {
            blob_root: "insert_log".to_string(),
            queue_capacity: 64,
            bloom_false_positive_rate: 0.01,
        },
        ..IngestConfig::default()
    }
}

pub fn descriptor(segment_id: SegmentId, stat_logs: Vec<StatLog>) -> SegmentDescriptor {
    SegmentDescriptor {
        segment_id,
        num_rows: 0,
        insert_channel: "by-dev-dml_0_100v0".to_string(),
        stat_logs,
    }
}

/// Persist a stats blob for the given integer keys and return its path
pub fn seed_stats_blob(
    store: &MockBlobStore,
    path: &str,
    field_id: i64,
    keys: &[i64],
) -> StatLog {
    let pks: Vec<PrimaryKey> = keys.iter().copied().map(PrimaryKey::Int).collect();
    let stats = PkStatistics::from_keys(field_id, &pks, 0.01).expect("keys must be non-empty");
    let blob = encode_stats(&[stats]).expect("encode stats");
    store.insert_blob(path, blob);
    StatLog {
        field_id,
        log_path: path.to_string(),
    }
}
