//! In-memory authoritative view of all segments owned by a channel.
//!
//! Single-writer per channel: only that channel's recovery routine and
//! filter stage mutate the cache. Reads are shared and go through short
//! lock sections so lookups never block mutation for long.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use tracing::{debug, warn};

use goemon_core::types::{PrimaryKey, SegmentId, SegmentState};
use goemon_core::{ChannelInfo, Error, Result};

use crate::pkindex::{PkIndex, PkStatistics};

/// One segment's cached metadata
#[derive(Debug, Clone)]
pub struct SegmentRecord {
    pub segment_id: SegmentId,
    pub state: SegmentState,
    pub num_rows: u64,
}

#[derive(Debug)]
struct SegmentEntry {
    record: SegmentRecord,
    /// `None` means no statistics were ever loaded for the segment: the
    /// index cannot rule out any key. An empty loaded index answers like
    /// any other filter.
    pk_index: Option<PkIndex>,
}

/// A segment recovered from persisted descriptors, ready for insertion
pub struct RecoveredSegment {
    pub record: SegmentRecord,
    pub pk_index: Option<PkIndex>,
}

#[derive(Debug)]
pub struct MetaCache {
    channel: ChannelInfo,
    segments: RwLock<HashMap<SegmentId, SegmentEntry>>,
    /// Ids of segments that received a drop notification. Retained so late
    /// messages referencing them are discarded rather than treated as
    /// unknown segments.
    dropped: RwLock<HashSet<SegmentId>>,
}

impl MetaCache {
    pub fn new(channel: ChannelInfo, recovered: Vec<RecoveredSegment>) -> Self {
        let segments = recovered
            .into_iter()
            .map(|seg| {
                (
                    seg.record.segment_id,
                    SegmentEntry {
                        record: seg.record,
                        pk_index: seg.pk_index,
                    },
                )
            })
            .collect();

        Self {
            channel,
            segments: RwLock::new(segments),
            dropped: RwLock::new(HashSet::new()),
        }
    }

    pub fn channel(&self) -> &ChannelInfo {
        &self.channel
    }

    pub fn contains(&self, segment_id: SegmentId) -> bool {
        self.segments.read().contains_key(&segment_id)
    }

    pub fn is_dropped(&self, segment_id: SegmentId) -> bool {
        self.dropped.read().contains(&segment_id)
    }

    pub fn len(&self) -> usize {
        self.segments.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.read().is_empty()
    }

    pub fn segment_ids(&self) -> Vec<SegmentId> {
        self.segments.read().keys().copied().collect()
    }

    pub fn segment_record(&self, segment_id: SegmentId) -> Option<SegmentRecord> {
        self.segments.read().get(&segment_id).map(|e| e.record.clone())
    }

    /// Register a newly assigned segment in `Growing` state. Re-creating a
    /// known segment is a no-op.
    pub fn add_segment(&self, segment_id: SegmentId) {
        let mut segments = self.segments.write();
        if segments.contains_key(&segment_id) {
            return;
        }
        debug!(segment_id, channel = %self.channel.channel_name, "segment added to cache");
        segments.insert(
            segment_id,
            SegmentEntry {
                record: SegmentRecord {
                    segment_id,
                    state: SegmentState::Growing,
                    num_rows: 0,
                },
                pk_index: None,
            },
        );
    }

    /// Advance a segment's lifecycle state. Backward transitions are
    /// rejected; same-state transitions are idempotent.
    pub fn advance_state(&self, segment_id: SegmentId, next: SegmentState) -> Result<()> {
        let mut segments = self.segments.write();
        let entry = segments.get_mut(&segment_id).ok_or_else(|| Error::Internal {
            message: format!("segment {} not in cache", segment_id),
        })?;

        if !entry.record.state.can_advance_to(next) {
            return Err(Error::Internal {
                message: format!(
                    "segment {} cannot go {:?} -> {:?}",
                    segment_id, entry.record.state, next
                ),
            });
        }
        entry.record.state = next;
        Ok(())
    }

    /// Apply a drop notification: remember the id and evict the entry.
    /// Buffered data for the segment is discarded by the caller.
    pub fn drop_segment(&self, segment_id: SegmentId) {
        self.dropped.write().insert(segment_id);
        if self.segments.write().remove(&segment_id).is_none() {
            warn!(segment_id, "drop notification for segment not in cache");
        }
    }

    /// Segments that may contain the key and should receive the delete.
    /// A segment without a loaded index is always a candidate: absence of
    /// statistics can rule nothing out.
    pub fn delete_candidates(&self, key: &PrimaryKey) -> Vec<SegmentId> {
        self.segments
            .read()
            .iter()
            .filter(|(_, entry)| match &entry.pk_index {
                Some(index) => index.may_contain(key),
                None => true,
            })
            .map(|(id, _)| *id)
            .collect()
    }

    /// Merge freshly produced statistics into a segment's index; this is
    /// the append-only growth path when a sync completes.
    pub fn merge_stats(&self, segment_id: SegmentId, stats: PkStatistics) {
        let mut segments = self.segments.write();
        match segments.get_mut(&segment_id) {
            Some(entry) => entry
                .pk_index
                .get_or_insert_with(PkIndex::default)
                .merge(stats),
            None => warn!(segment_id, "stats merge for segment not in cache"),
        }
    }

    /// Add synced rows to a segment's row count
    pub fn add_rows(&self, segment_id: SegmentId, rows: u64) {
        if let Some(entry) = self.segments.write().get_mut(&segment_id) {
            entry.record.num_rows += rows;
        }
    }
}
