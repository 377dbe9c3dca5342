//! Drop/filter stage: discards messages for dropped segments, routes
//! deletes through the existence index and applies segment-lifecycle
//! control messages to the metadata cache.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::debug;

use goemon_core::metrics::IngestMetrics;
use goemon_core::types::{DeletePayload, Message, PrimaryKey, SegmentId, SegmentState};
use goemon_core::{Error, Result};

use super::{CloseKind, FilteredMessage};
use crate::metacache::MetaCache;

pub(crate) struct FilterStage {
    rx: mpsc::Receiver<Message>,
    out: mpsc::Sender<FilteredMessage>,
    cache: Arc<MetaCache>,
    shutdown: watch::Receiver<CloseKind>,
    metrics: IngestMetrics,
}

impl FilterStage {
    pub fn new(
        rx: mpsc::Receiver<Message>,
        out: mpsc::Sender<FilteredMessage>,
        cache: Arc<MetaCache>,
        shutdown: watch::Receiver<CloseKind>,
        metrics: IngestMetrics,
    ) -> Self {
        Self {
            rx,
            out,
            cache,
            shutdown,
            metrics,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        loop {
            tokio::select! {
                maybe = self.rx.recv() => {
                    match maybe {
                        Some(message) => {
                            if !self.handle(message).await? {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() == CloseKind::Forced {
                        break;
                    }
                    // Graceful: keep draining until the intake sender closes
                }
            }
        }
        Ok(())
    }

    /// Returns false when the downstream queue is gone
    async fn handle(&mut self, message: Message) -> Result<bool> {
        match message {
            Message::Insert(payload) => {
                if self.cache.is_dropped(payload.segment_id) {
                    self.metrics.record_discarded();
                    return Ok(true);
                }
                if !self.cache.contains(payload.segment_id) {
                    // The cache must know every segment before its data
                    // arrives; a miss means the stream and cache diverged.
                    return Err(Error::GraphStage {
                        stage: "filter",
                        message: format!(
                            "insert for unknown segment {}",
                            payload.segment_id
                        ),
                    });
                }
                Ok(self.out.send(FilteredMessage::Insert(payload)).await.is_ok())
            }
            Message::Delete(payload) => self.route_delete(payload).await,
            Message::CreateSegment { segment_id, .. } => {
                if self.cache.is_dropped(segment_id) {
                    self.metrics.record_discarded();
                    return Ok(true);
                }
                self.cache.add_segment(segment_id);
                Ok(true)
            }
            Message::SealSegment { segment_id, .. } => {
                if self.cache.is_dropped(segment_id) {
                    self.metrics.record_discarded();
                    return Ok(true);
                }
                self.cache
                    .advance_state(segment_id, SegmentState::Sealed)
                    .map_err(|e| Error::GraphStage {
                        stage: "filter",
                        message: e.to_string(),
                    })?;
                Ok(self
                    .out
                    .send(FilteredMessage::Seal { segment_id })
                    .await
                    .is_ok())
            }
            Message::DropSegment { segment_id, .. } => {
                self.cache.drop_segment(segment_id);
                Ok(self
                    .out
                    .send(FilteredMessage::Drop { segment_id })
                    .await
                    .is_ok())
            }
            Message::TimeTick { timestamp } => Ok(self
                .out
                .send(FilteredMessage::Tick { timestamp })
                .await
                .is_ok()),
        }
    }

    /// Route each key only to segments whose existence filter may contain
    /// it. False positives cost a wasted delete record; false negatives are
    /// never produced by the filter.
    async fn route_delete(&mut self, payload: DeletePayload) -> Result<bool> {
        let mut routes: HashMap<SegmentId, Vec<PrimaryKey>> = HashMap::new();
        for key in payload.primary_keys {
            for segment_id in self.cache.delete_candidates(&key) {
                routes.entry(segment_id).or_default().push(key.clone());
            }
        }

        if routes.is_empty() {
            debug!("delete matched no segment");
            self.metrics.record_discarded();
            return Ok(true);
        }

        for (segment_id, primary_keys) in routes {
            let sent = self
                .out
                .send(FilteredMessage::DeleteRoute {
                    segment_id,
                    primary_keys,
                    timestamp: payload.timestamp,
                })
                .await
                .is_ok();
            if !sent {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
