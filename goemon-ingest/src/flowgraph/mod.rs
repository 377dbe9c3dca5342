//! Staged processing graph for one channel.
//!
//! ┌────────┐   ┌────────┐   ┌────────┐   ┌────────────┐
//! │ intake │──>│ filter │──>│ buffer │──>│ checkpoint │
//! └────────┘   └────────┘   └────────┘   └────────────┘
//!
//! Each stage is a single tokio task consuming from a bounded queue and
//! producing to the next stage's queue, preserving per-channel message
//! order. A full downstream queue backpressures the sender, so a slow sync
//! manager throttles intake instead of dropping data.

mod buffer;
mod checkpoint;
mod filter;
mod intake;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, warn};

use goemon_core::metrics::IngestMetrics;
use goemon_core::traits::CheckpointUpdater;
use goemon_core::types::{Message, PrimaryKey, SegmentId, Timestamp};
use goemon_core::{ChannelInfo, InsertPayload, Result};

use crate::metacache::MetaCache;
use crate::syncmgr::SyncManager;
use crate::writebuffer::WriteBuffer;

use buffer::BufferStage;
use checkpoint::CheckpointStage;
use filter::FilterStage;
use intake::IntakeStage;

/// How the graph is being shut down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    /// Normal operation
    Open,
    /// Stop intake, let every stage drain its queue, flush remaining buffers
    Graceful,
    /// Stop every stage immediately, abandon unsynced buffers
    Forced,
}

/// Message flowing from the filter stage to the buffer stage
#[derive(Debug)]
pub(crate) enum FilteredMessage {
    Insert(InsertPayload),
    DeleteRoute {
        segment_id: SegmentId,
        primary_keys: Vec<PrimaryKey>,
        timestamp: Timestamp,
    },
    Seal {
        segment_id: SegmentId,
    },
    Drop {
        segment_id: SegmentId,
    },
    Tick {
        timestamp: Timestamp,
    },
}

/// Event flowing from the buffer stage to the checkpoint stage
#[derive(Debug)]
pub(crate) enum CheckpointEvent {
    Seal { segment_id: SegmentId },
    Drop { segment_id: SegmentId },
    Tick { timestamp: Timestamp },
}

pub(crate) struct FlowGraphParams {
    pub channel: ChannelInfo,
    pub stream: mpsc::Receiver<Message>,
    pub queue_capacity: usize,
    pub meta_cache: Arc<MetaCache>,
    pub write_buffer: Arc<WriteBuffer>,
    pub sync_manager: Arc<SyncManager>,
    pub checkpoint_updater: Arc<dyn CheckpointUpdater>,
    pub metrics: IngestMetrics,
    pub initial_checkpoint: Timestamp,
}

struct Stages {
    intake: IntakeStage,
    filter: FilterStage,
    buffer: BufferStage,
    checkpoint: CheckpointStage,
}

/// Assembled processing graph. Stages are spawned by [`FlowGraph::start`]
/// and torn down by [`FlowGraph::close`].
pub struct FlowGraph {
    shutdown_tx: watch::Sender<CloseKind>,
    healthy: Arc<AtomicBool>,
    stages: Option<Stages>,
    handles: Vec<JoinHandle<()>>,
}

impl FlowGraph {
    pub(crate) fn assemble(params: FlowGraphParams) -> Self {
        let (shutdown_tx, _) = watch::channel(CloseKind::Open);
        let healthy = Arc::new(AtomicBool::new(true));

        let (filter_tx, filter_rx) = mpsc::channel(params.queue_capacity);
        let (buffer_tx, buffer_rx) = mpsc::channel(params.queue_capacity);
        let (checkpoint_tx, checkpoint_rx) = mpsc::channel(params.queue_capacity);

        let stages = Stages {
            intake: IntakeStage::new(
                params.channel.channel_name.clone(),
                params.stream,
                filter_tx,
                shutdown_tx.subscribe(),
                params.metrics.clone(),
            ),
            filter: FilterStage::new(
                filter_rx,
                buffer_tx,
                Arc::clone(&params.meta_cache),
                shutdown_tx.subscribe(),
                params.metrics.clone(),
            ),
            buffer: BufferStage::new(
                buffer_rx,
                checkpoint_tx,
                Arc::clone(&params.write_buffer),
                shutdown_tx.subscribe(),
            ),
            checkpoint: CheckpointStage::new(
                checkpoint_rx,
                shutdown_tx.subscribe(),
                params.channel,
                params.meta_cache,
                params.write_buffer,
                params.sync_manager,
                params.checkpoint_updater,
                params.metrics,
                params.initial_checkpoint,
            ),
        };

        Self {
            shutdown_tx,
            healthy,
            stages: Some(stages),
            handles: Vec::new(),
        }
    }

    /// Spawn the stage workers. Idempotent: a second call is a no-op.
    pub fn start(&mut self) {
        let Some(stages) = self.stages.take() else {
            warn!("flowgraph already started");
            return;
        };

        self.handles = vec![
            spawn_stage("intake", &self.healthy, stages.intake.run()),
            spawn_stage("filter", &self.healthy, stages.filter.run()),
            spawn_stage("buffer", &self.healthy, stages.buffer.run()),
            spawn_stage("checkpoint", &self.healthy, stages.checkpoint.run()),
        ];
    }

    /// Signal shutdown and wait for every stage to exit
    pub async fn close(&mut self, kind: CloseKind) {
        let _ = self.shutdown_tx.send(kind);
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub(crate) fn health_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.healthy)
    }
}

fn spawn_stage<F>(name: &'static str, healthy: &Arc<AtomicBool>, fut: F) -> JoinHandle<()>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    let healthy = Arc::clone(healthy);
    tokio::spawn(async move {
        if let Err(e) = fut.await {
            error!(stage = name, code = e.error_code(), error = %e, "pipeline stage failed");
            healthy.store(false, Ordering::SeqCst);
        }
    })
}
