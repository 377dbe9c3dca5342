//! Sync manager: persists drained write-buffer batches as durable blobs.
//!
//! ┌──────────┐  submit   ┌──────────────┐  dispatch  ┌─────────────┐
//! │ caller   │──────────>│ manager loop │───────────>│ sync worker │
//! │ (future) │<──────────│ per-segment  │<───────────│ (blob put)  │
//! └──────────┘  oneshot  │ queue/state  │    done    └─────────────┘
//!                        └──────────────┘
//!
//! At most one task per segment is ever `Running`; a submission for a busy
//! segment queues behind the in-flight task and is dispatched when it
//! resolves, preserving write ordering. Blob writes are idempotent per
//! write token (segment id + attempt), so a retried attempt cannot
//! duplicate data.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use goemon_core::config::SyncConfig;
use goemon_core::traits::{BlobStore, IdAllocator, WriteToken};
use goemon_core::types::{FieldId, PrimaryKey, SegmentId, Timestamp};
use goemon_core::{Error, Result};

use crate::pkindex::PkStatistics;
use crate::writebuffer::SyncBatch;

/// Lifecycle of a submitted sync task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Queued,
    Running,
    Done,
    Failed,
}

/// Request to persist one segment's buffered rows as of a timestamp
#[derive(Debug)]
pub struct SyncTask {
    pub channel: String,
    pub pk_field_id: FieldId,
    pub batch: SyncBatch,
}

/// Durable location and metadata of a completed sync
#[derive(Debug, Clone)]
pub struct SyncedSegment {
    pub segment_id: SegmentId,
    pub path: String,
    pub timestamp: Timestamp,
    pub num_rows: u64,
    /// Statistics built from the batch during serialization; merged into
    /// the metadata cache by the caller.
    pub stats: Option<PkStatistics>,
}

/// A failed sync hands its batch back so the caller can requeue it
#[derive(Debug)]
pub struct SyncFailure {
    pub batch: SyncBatch,
    pub error: Error,
}

pub type SyncOutcome = std::result::Result<SyncedSegment, SyncFailure>;

/// Awaitable handle to one submitted task
pub struct SyncHandle {
    rx: oneshot::Receiver<SyncOutcome>,
}

impl SyncHandle {
    pub async fn resolve(self) -> Result<SyncOutcome> {
        self.rx.await.map_err(|_| Error::Internal {
            message: "sync manager dropped the task".to_string(),
        })
    }
}

/// Serialized payload of one sync blob
#[derive(Debug, Serialize, Deserialize)]
pub struct SyncPayload {
    pub segment_id: SegmentId,
    pub primary_keys: Vec<PrimaryKey>,
    pub rows: Vec<Vec<u8>>,
    pub deletes: Vec<(PrimaryKey, Timestamp)>,
    pub min_timestamp: Timestamp,
    pub max_timestamp: Timestamp,
}

impl SyncPayload {
    pub fn encode(&self) -> Result<Bytes> {
        let data = rmp_serde::to_vec(self).map_err(|e| Error::Storage {
            message: "failed to serialize sync payload".to_string(),
            source: Some(Box::new(e)),
        })?;
        Ok(Bytes::from(data))
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        rmp_serde::from_slice(data).map_err(|e| Error::Storage {
            message: "failed to deserialize sync payload".to_string(),
            source: Some(Box::new(e)),
        })
    }
}

struct Submission {
    task: SyncTask,
    resp: oneshot::Sender<SyncOutcome>,
}

/// Shared across channels; tasks carry their channel name.
pub struct SyncManager {
    submit_tx: mpsc::Sender<Submission>,
    states: Arc<Mutex<HashMap<SegmentId, SyncState>>>,
}

impl SyncManager {
    pub fn new(
        store: Arc<dyn BlobStore>,
        allocator: Arc<dyn IdAllocator>,
        config: SyncConfig,
    ) -> Self {
        let (submit_tx, submit_rx) = mpsc::channel(config.queue_capacity);
        let states = Arc::new(Mutex::new(HashMap::new()));

        let loop_states = Arc::clone(&states);
        tokio::spawn(async move {
            manager_loop(submit_rx, store, allocator, config, loop_states).await;
        });

        Self { submit_tx, states }
    }

    /// Submit a task; the returned handle resolves when the sync completes
    /// or fails.
    pub async fn submit(&self, task: SyncTask) -> Result<SyncHandle> {
        let (resp, rx) = oneshot::channel();
        self.submit_tx
            .send(Submission { task, resp })
            .await
            .map_err(|_| Error::Internal {
                message: "sync manager is shut down".to_string(),
            })?;
        Ok(SyncHandle { rx })
    }

    /// Observed lifecycle state of the segment's most recent task
    pub fn task_state(&self, segment_id: SegmentId) -> Option<SyncState> {
        self.states.lock().get(&segment_id).copied()
    }
}

async fn manager_loop(
    mut submit_rx: mpsc::Receiver<Submission>,
    store: Arc<dyn BlobStore>,
    allocator: Arc<dyn IdAllocator>,
    config: SyncConfig,
    states: Arc<Mutex<HashMap<SegmentId, SyncState>>>,
) {
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<SegmentId>();
    let mut queued: HashMap<SegmentId, VecDeque<Submission>> = HashMap::new();
    let mut running: HashMap<SegmentId, u64> = HashMap::new(); // segment -> attempt counter
    let mut attempts: HashMap<SegmentId, u64> = HashMap::new();
    let mut closed = false;

    loop {
        tokio::select! {
            submission = submit_rx.recv(), if !closed => {
                match submission {
                    Some(submission) => {
                        let segment_id = submission.task.batch.segment_id;
                        if running.contains_key(&segment_id) {
                            debug!(segment_id, "sync already running, queueing task");
                            states.lock().insert(segment_id, SyncState::Queued);
                            queued.entry(segment_id).or_default().push_back(submission);
                        } else {
                            dispatch(
                                submission,
                                &store,
                                &allocator,
                                &config,
                                &mut running,
                                &mut attempts,
                                &states,
                                &done_tx,
                            );
                        }
                    }
                    None => closed = true,
                }
            }
            Some(segment_id) = done_rx.recv() => {
                running.remove(&segment_id);
                if let Some(queue) = queued.get_mut(&segment_id) {
                    if let Some(next) = queue.pop_front() {
                        dispatch(
                            next,
                            &store,
                            &allocator,
                            &config,
                            &mut running,
                            &mut attempts,
                            &states,
                            &done_tx,
                        );
                    }
                    if queued.get(&segment_id).map(|q| q.is_empty()).unwrap_or(false) {
                        queued.remove(&segment_id);
                    }
                }
            }
        }

        if closed && running.is_empty() && queued.is_empty() {
            break;
        }
    }

    info!("sync manager loop exited");
}

#[allow(clippy::too_many_arguments)]
fn dispatch(
    submission: Submission,
    store: &Arc<dyn BlobStore>,
    allocator: &Arc<dyn IdAllocator>,
    config: &SyncConfig,
    running: &mut HashMap<SegmentId, u64>,
    attempts: &mut HashMap<SegmentId, u64>,
    states: &Arc<Mutex<HashMap<SegmentId, SyncState>>>,
    done_tx: &mpsc::UnboundedSender<SegmentId>,
) {
    let segment_id = submission.task.batch.segment_id;
    let attempt = {
        let counter = attempts.entry(segment_id).or_insert(0);
        *counter += 1;
        *counter
    };
    running.insert(segment_id, attempt);
    states.lock().insert(segment_id, SyncState::Running);

    let store = Arc::clone(store);
    let allocator = Arc::clone(allocator);
    let blob_root = config.blob_root.clone();
    let fp_rate = config.bloom_false_positive_rate;
    let done_tx = done_tx.clone();
    let states = Arc::clone(states);

    tokio::spawn(async move {
        let Submission { task, resp } = submission;
        let outcome = execute_sync(&store, &allocator, &blob_root, fp_rate, task, attempt).await;

        let state = match &outcome {
            Ok(synced) => {
                debug!(
                    segment_id,
                    path = %synced.path,
                    timestamp = synced.timestamp,
                    "sync task done"
                );
                SyncState::Done
            }
            Err(failure) => {
                warn!(segment_id, error = %failure.error, "sync task failed");
                SyncState::Failed
            }
        };
        states.lock().insert(segment_id, state);

        // The receiver may be gone on forced close; the result is discarded.
        let _ = resp.send(outcome);
        let _ = done_tx.send(segment_id);
    });
}

async fn execute_sync(
    store: &Arc<dyn BlobStore>,
    allocator: &Arc<dyn IdAllocator>,
    blob_root: &str,
    fp_rate: f64,
    task: SyncTask,
    attempt: u64,
) -> SyncOutcome {
    let SyncTask {
        channel,
        pk_field_id,
        batch,
    } = task;
    let segment_id = batch.segment_id;

    let result = async {
        let log_id = allocator.alloc(1).await.map_err(|e| sync_error(segment_id, e))?;

        let payload = SyncPayload {
            segment_id,
            primary_keys: batch.primary_keys.clone(),
            rows: batch.rows.iter().map(|r| r.to_vec()).collect(),
            deletes: batch.deletes.clone(),
            min_timestamp: batch.min_timestamp,
            max_timestamp: batch.max_timestamp,
        };
        let data = payload.encode().map_err(|e| sync_error(segment_id, e))?;

        let token = WriteToken { segment_id, attempt };
        let path = format!("{}/{}/{}/{}", blob_root, channel, segment_id, log_id);
        store
            .put(&token, &path, data)
            .await
            .map_err(|e| sync_error(segment_id, e))?;

        let stats = PkStatistics::from_keys(pk_field_id, &batch.primary_keys, fp_rate);
        Ok(SyncedSegment {
            segment_id,
            path,
            timestamp: batch.max_timestamp,
            num_rows: batch.num_rows(),
            stats,
        })
    }
    .await;

    match result {
        Ok(synced) => Ok(synced),
        Err(error) => Err(SyncFailure { batch, error }),
    }
}

fn sync_error(segment_id: SegmentId, e: Error) -> Error {
    Error::SyncTask {
        segment_id,
        message: e.to_string(),
        source: Some(Box::new(e)),
    }
}
