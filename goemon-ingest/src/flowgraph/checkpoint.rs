//! Checkpoint stage: drives flush decisions off time-ticks and seal
//! events, awaits sync resolutions and publishes the channel checkpoint.
//!
//! Invariant: the checkpoint only advances while no sync is outstanding.
//! Every submitted task is settled before the timestamp is recomputed, so
//! the buffer's earliest unsynced timestamp is an exact lower bound.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use goemon_core::metrics::IngestMetrics;
use goemon_core::traits::CheckpointUpdater;
use goemon_core::types::{SegmentId, SegmentState, Timestamp};
use goemon_core::{ChannelInfo, Result};

use super::{CheckpointEvent, CloseKind};
use crate::metacache::MetaCache;
use crate::syncmgr::{SyncHandle, SyncManager, SyncTask};
use crate::writebuffer::WriteBuffer;

pub(crate) struct CheckpointStage {
    rx: mpsc::Receiver<CheckpointEvent>,
    shutdown: watch::Receiver<CloseKind>,
    channel: ChannelInfo,
    cache: Arc<MetaCache>,
    buffer: Arc<WriteBuffer>,
    sync_manager: Arc<SyncManager>,
    updater: Arc<dyn CheckpointUpdater>,
    metrics: IngestMetrics,
    checkpoint: Timestamp,
    last_tick: Timestamp,
}

impl CheckpointStage {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rx: mpsc::Receiver<CheckpointEvent>,
        shutdown: watch::Receiver<CloseKind>,
        channel: ChannelInfo,
        cache: Arc<MetaCache>,
        buffer: Arc<WriteBuffer>,
        sync_manager: Arc<SyncManager>,
        updater: Arc<dyn CheckpointUpdater>,
        metrics: IngestMetrics,
        initial_checkpoint: Timestamp,
    ) -> Self {
        Self {
            rx,
            shutdown,
            channel,
            cache,
            buffer,
            sync_manager,
            updater,
            metrics,
            checkpoint: initial_checkpoint,
            last_tick: initial_checkpoint,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let mut forced = false;
        loop {
            tokio::select! {
                maybe = self.rx.recv() => {
                    match maybe {
                        Some(event) => self.handle(event).await?,
                        None => break,
                    }
                }
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() == CloseKind::Forced {
                        forced = true;
                        break;
                    }
                }
            }
        }

        if !forced {
            self.final_flush().await?;
        }
        Ok(())
    }

    async fn handle(&mut self, event: CheckpointEvent) -> Result<()> {
        match event {
            CheckpointEvent::Tick { timestamp } => {
                self.last_tick = timestamp;
                let due = self.buffer.flush_due();
                let handles = self.submit_syncs(due).await?;
                self.settle(handles).await?;
                self.advance(timestamp).await;
            }
            CheckpointEvent::Seal { segment_id } => {
                // Explicit flush: the seal wins over size/age triggers.
                let handles = self.submit_syncs(vec![segment_id]).await?;
                self.settle(handles).await?;
            }
            CheckpointEvent::Drop { segment_id } => {
                debug!(segment_id, "segment dropped, buffer discarded");
            }
        }
        Ok(())
    }

    async fn submit_syncs(
        &mut self,
        segment_ids: Vec<SegmentId>,
    ) -> Result<Vec<(SegmentId, SyncHandle)>> {
        let mut handles = Vec::with_capacity(segment_ids.len());
        for segment_id in segment_ids {
            let Some(batch) = self.buffer.drain_for_sync(segment_id) else {
                continue;
            };
            debug!(
                segment_id,
                rows = batch.num_rows(),
                bytes = batch.size_bytes,
                "submitting sync task"
            );
            let handle = self
                .sync_manager
                .submit(SyncTask {
                    channel: self.channel.channel_name.clone(),
                    pk_field_id: self.channel.pk_field_id,
                    batch,
                })
                .await?;
            self.metrics.record_sync_submitted();
            handles.push((segment_id, handle));
        }
        Ok(handles)
    }

    async fn settle(&mut self, handles: Vec<(SegmentId, SyncHandle)>) -> Result<()> {
        for (segment_id, handle) in handles {
            match handle.resolve().await? {
                Ok(synced) => {
                    self.metrics.record_sync_completed();
                    if self.cache.is_dropped(segment_id) {
                        // Raced with a drop; the durable blob is orphaned
                        // and the coordinator will garbage-collect it.
                        continue;
                    }
                    if let Some(stats) = synced.stats {
                        self.cache.merge_stats(segment_id, stats);
                    }
                    self.cache.add_rows(segment_id, synced.num_rows);
                    if let Some(record) = self.cache.segment_record(segment_id) {
                        if record.state == SegmentState::Sealed {
                            let _ = self.cache.advance_state(segment_id, SegmentState::Flushed);
                        }
                    }
                    info!(
                        segment_id,
                        path = %synced.path,
                        timestamp = synced.timestamp,
                        "segment synced"
                    );
                }
                Err(failure) => {
                    self.metrics.record_sync_failed();
                    warn!(
                        segment_id,
                        error = %failure.error,
                        "sync failed, batch requeued for retry"
                    );
                    if !self.cache.is_dropped(segment_id) {
                        self.buffer.requeue(failure.batch);
                    }
                }
            }
        }
        Ok(())
    }

    /// Publish the new checkpoint if it moved forward. The candidate is the
    /// timestamp just below the earliest unsynced row, or the tick itself
    /// when every buffer is clean.
    async fn advance(&mut self, tick: Timestamp) {
        let candidate = self
            .buffer
            .earliest_unsynced()
            .map(|t| t.saturating_sub(1))
            .unwrap_or(tick);

        if candidate > self.checkpoint {
            self.checkpoint = candidate;
            self.metrics.set_checkpoint(candidate);
            self.updater
                .update(&self.channel.channel_name, candidate)
                .await;
            debug!(
                channel = %self.channel.channel_name,
                checkpoint = candidate,
                "checkpoint advanced"
            );
        }
    }

    /// Graceful shutdown: flush whatever is left and publish a final
    /// checkpoint.
    async fn final_flush(&mut self) -> Result<()> {
        let batches = self.buffer.drain_all();
        if !batches.is_empty() {
            info!(
                channel = %self.channel.channel_name,
                segments = batches.len(),
                "final flush on close"
            );
        }

        let mut handles = Vec::with_capacity(batches.len());
        for batch in batches {
            let segment_id = batch.segment_id;
            let handle = self
                .sync_manager
                .submit(SyncTask {
                    channel: self.channel.channel_name.clone(),
                    pk_field_id: self.channel.pk_field_id,
                    batch,
                })
                .await?;
            self.metrics.record_sync_submitted();
            handles.push((segment_id, handle));
        }
        self.settle(handles).await?;
        self.advance(self.last_tick).await;
        Ok(())
    }
}
