//! Pipeline controller: owns the lifecycle of one channel's metadata
//! cache, write buffer and processing graph.
//!
//! State machine:
//! Created -> Recovering -> Running -> ClosingGraceful|ClosingForced -> Closed
//!
//! Construction runs recovery; the graph is assembled but not started, so a
//! failed recovery never leaves a partially-initialized graph running.
//! Close collapses any number of graceful/forced requests into a single
//! teardown, ordered: deregister from the log dispatcher, stop the graph,
//! release per-channel metrics, cancel the background context.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use goemon_core::config::IngestConfig;
use goemon_core::metrics::{ChannelMetricsRegistry, IngestMetrics};
use goemon_core::traits::{BlobStore, Broker, CheckpointUpdater, IdAllocator, LogClient};
use goemon_core::types::{ResumePosition, SegmentId};
use goemon_core::{ChannelInfo, Error, Result};

use crate::executor::BoundedExecutor;
use crate::flowgraph::{CloseKind, FlowGraph, FlowGraphParams};
use crate::metacache::MetaCache;
use crate::recovery::recover_meta_cache;
use crate::syncmgr::SyncManager;
use crate::writebuffer::WriteBuffer;

/// Controller lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Created,
    Recovering,
    Running,
    ClosingGraceful,
    ClosingForced,
    Closed,
}

/// Process-scoped services shared by every channel pipeline. Created once
/// at node start and passed by reference; there is no ambient global state.
#[derive(Clone)]
pub struct IngestServices {
    pub log_client: Arc<dyn LogClient>,
    pub broker: Arc<dyn Broker>,
    pub blob_store: Arc<dyn BlobStore>,
    pub allocator: Arc<dyn IdAllocator>,
    pub checkpoint_updater: Arc<dyn CheckpointUpdater>,
    pub executor: Arc<BoundedExecutor>,
    pub sync_manager: Arc<SyncManager>,
    pub metrics: Arc<ChannelMetricsRegistry>,
}

pub struct Pipeline {
    channel: ChannelInfo,
    meta_cache: Arc<MetaCache>,
    write_buffer: Arc<WriteBuffer>,
    log_client: Arc<dyn LogClient>,
    metrics_registry: Arc<ChannelMetricsRegistry>,
    metrics: IngestMetrics,
    graph: AsyncMutex<FlowGraph>,
    healthy: Arc<AtomicBool>,
    state: RwLock<PipelineState>,
    close_started: AtomicBool,
}

impl Pipeline {
    /// Recover the channel's metadata and assemble (but not start) its
    /// processing graph. A recovery failure is reported upward and nothing
    /// is left running.
    pub async fn new(
        channel: ChannelInfo,
        config: IngestConfig,
        services: &IngestServices,
        unflushed_ids: &[SegmentId],
        flushed_ids: &[SegmentId],
        resume: ResumePosition,
    ) -> Result<Self> {
        info!(
            channel = %channel.channel_name,
            collection_id = channel.collection_id,
            "creating channel pipeline"
        );

        let metrics = services.metrics.register(&channel.channel_name);
        match Self::build(channel.clone(), config, services, metrics, unflushed_ids, flushed_ids, resume)
            .await
        {
            Ok(pipeline) => Ok(pipeline),
            Err(e) => {
                services.metrics.release(&channel.channel_name);
                Err(e)
            }
        }
    }

    async fn build(
        channel: ChannelInfo,
        config: IngestConfig,
        services: &IngestServices,
        metrics: IngestMetrics,
        unflushed_ids: &[SegmentId],
        flushed_ids: &[SegmentId],
        resume: ResumePosition,
    ) -> Result<Self> {
        let meta_cache = Arc::new(
            recover_meta_cache(
                &channel,
                &services.broker,
                &services.blob_store,
                &services.executor,
                unflushed_ids,
                flushed_ids,
            )
            .await?,
        );

        let stream = services
            .log_client
            .subscribe(&channel.channel_name, resume)
            .await
            .map_err(|e| Error::Recovery {
                message: format!("failed to subscribe to log: {}", e),
                source: Some(Box::new(e)),
            })?;

        let write_buffer = Arc::new(WriteBuffer::new(config.write_buffer.clone(), metrics.clone()));
        let initial_checkpoint = match resume {
            ResumePosition::Checkpoint(ts) => ts,
            ResumePosition::Earliest => 0,
        };

        let graph = FlowGraph::assemble(FlowGraphParams {
            channel: channel.clone(),
            stream,
            queue_capacity: config.flowgraph.queue_capacity,
            meta_cache: Arc::clone(&meta_cache),
            write_buffer: Arc::clone(&write_buffer),
            sync_manager: Arc::clone(&services.sync_manager),
            checkpoint_updater: Arc::clone(&services.checkpoint_updater),
            metrics: metrics.clone(),
            initial_checkpoint,
        });
        let healthy = graph.health_flag();

        Ok(Self {
            channel,
            meta_cache,
            write_buffer,
            log_client: Arc::clone(&services.log_client),
            metrics_registry: Arc::clone(&services.metrics),
            metrics,
            graph: AsyncMutex::new(graph),
            healthy,
            state: RwLock::new(PipelineState::Recovering),
            close_started: AtomicBool::new(false),
        })
    }

    /// Start the processing graph. Only valid once, after a successful
    /// recovery.
    pub async fn start(&self) {
        {
            let state = *self.state.read();
            if state != PipelineState::Recovering {
                warn!(
                    channel = %self.channel.channel_name,
                    ?state,
                    "start ignored in current state"
                );
                return;
            }
        }
        self.graph.lock().await.start();
        *self.state.write() = PipelineState::Running;
        info!(channel = %self.channel.channel_name, "pipeline running");
    }

    /// Drain in-flight work, flush remaining buffers, then tear down
    pub async fn close_graceful(&self) -> Result<()> {
        self.close(CloseKind::Graceful).await
    }

    /// Tear down immediately, abandoning unsynced buffers
    pub async fn close_forced(&self) -> Result<()> {
        self.close(CloseKind::Forced).await
    }

    async fn close(&self, kind: CloseKind) -> Result<()> {
        // Once-only guard: every later close request collapses into the
        // first teardown and returns immediately.
        if self.close_started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        *self.state.write() = match kind {
            CloseKind::Forced => PipelineState::ClosingForced,
            _ => PipelineState::ClosingGraceful,
        };
        info!(channel = %self.channel.channel_name, ?kind, "closing pipeline");

        // Deregister first so no message can arrive against a cache that is
        // being torn down.
        if let Err(e) = self.log_client.deregister(&self.channel.channel_name).await {
            let e = Error::Deregistration {
                channel: self.channel.channel_name.clone(),
                message: e.to_string(),
            };
            warn!(
                channel = %self.channel.channel_name,
                error = %e,
                "deregistration failed, close proceeds"
            );
        }

        self.graph.lock().await.close(kind).await;
        self.metrics_registry.release(&self.channel.channel_name);

        *self.state.write() = PipelineState::Closed;
        info!(channel = %self.channel.channel_name, "pipeline closed");
        Ok(())
    }

    /// Read-only view of the channel's segment metadata
    pub fn meta_cache(&self) -> Arc<MetaCache> {
        Arc::clone(&self.meta_cache)
    }

    pub fn write_buffer(&self) -> Arc<WriteBuffer> {
        Arc::clone(&self.write_buffer)
    }

    pub fn channel(&self) -> &ChannelInfo {
        &self.channel
    }

    pub fn state(&self) -> PipelineState {
        *self.state.read()
    }

    /// False once any stage has failed; the channel must be re-created
    /// from its last confirmed checkpoint.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub fn metrics(&self) -> IngestMetrics {
        self.metrics.clone()
    }
}
