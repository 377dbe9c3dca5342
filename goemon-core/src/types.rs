//! # Core Types
//!
//! Fundamental data structures shared by the ingest pipeline.
//!
//! A *channel* is one ordered partition of the distributed log, serving one
//! shard of a collection. Segments are the durable units the channel's rows
//! land in; every message on the stream is tagged with a logical timestamp
//! assigned by the log.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Logical timestamp assigned by the distributed log
pub type Timestamp = u64;

/// Segment identifier issued by the coordinator
pub type SegmentId = i64;

/// Collection identifier
pub type CollectionId = i64;

/// Owning node identifier
pub type NodeId = i64;

/// Field identifier within a collection schema
pub type FieldId = i64;

/// Primary key of a row. Collections are keyed either by an integer or a
/// string field; keys are compared and hashed through their canonical bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PrimaryKey {
    Int(i64),
    Str(String),
}

impl PrimaryKey {
    /// Canonical byte representation used for filter hashing
    pub fn canonical_bytes(&self) -> Vec<u8> {
        match self {
            PrimaryKey::Int(v) => v.to_le_bytes().to_vec(),
            PrimaryKey::Str(s) => s.as_bytes().to_vec(),
        }
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrimaryKey::Int(v) => write!(f, "{}", v),
            PrimaryKey::Str(s) => write!(f, "{}", s),
        }
    }
}

/// Segment lifecycle state. Transitions are monotonic: a segment never
/// revisits an earlier state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentState {
    Growing,
    Sealed,
    Flushed,
    Dropped,
}

impl SegmentState {
    pub fn rank(&self) -> u8 {
        match self {
            SegmentState::Growing => 0,
            SegmentState::Sealed => 1,
            SegmentState::Flushed => 2,
            SegmentState::Dropped => 3,
        }
    }

    /// Whether a transition to `next` respects monotonicity
    pub fn can_advance_to(&self, next: SegmentState) -> bool {
        next.rank() >= self.rank()
    }
}

/// Identity of one channel pipeline. Immutable for the lifetime of a
/// pipeline instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub channel_name: String,
    pub collection_id: CollectionId,
    pub node_id: NodeId,
    /// Field carrying the collection's primary key
    pub pk_field_id: FieldId,
}

/// Location of one persisted stat blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatLog {
    pub field_id: FieldId,
    pub log_path: String,
}

/// Segment metadata fetched from the coordinator during recovery
#[derive(Debug, Clone)]
pub struct SegmentDescriptor {
    pub segment_id: SegmentId,
    pub num_rows: u64,
    pub insert_channel: String,
    pub stat_logs: Vec<StatLog>,
}

/// Where the intake stage resumes consuming the log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumePosition {
    Earliest,
    /// Resume strictly after the given checkpoint timestamp
    Checkpoint(Timestamp),
}

/// Insert payload addressed to one growing segment
#[derive(Debug, Clone)]
pub struct InsertPayload {
    pub segment_id: SegmentId,
    pub primary_keys: Vec<PrimaryKey>,
    /// Serialized row data, opaque to the pipeline
    pub rows: Bytes,
    pub timestamp: Timestamp,
}

impl InsertPayload {
    pub fn num_rows(&self) -> u64 {
        self.primary_keys.len() as u64
    }
}

/// Delete payload; targets are resolved by the filter stage via the
/// per-segment existence index.
#[derive(Debug, Clone)]
pub struct DeletePayload {
    pub primary_keys: Vec<PrimaryKey>,
    pub timestamp: Timestamp,
}

/// One message on a channel's ordered stream
#[derive(Debug, Clone)]
pub enum Message {
    Insert(InsertPayload),
    Delete(DeletePayload),
    CreateSegment { segment_id: SegmentId, timestamp: Timestamp },
    SealSegment { segment_id: SegmentId, timestamp: Timestamp },
    DropSegment { segment_id: SegmentId, timestamp: Timestamp },
    TimeTick { timestamp: Timestamp },
}

impl Message {
    pub fn timestamp(&self) -> Timestamp {
        match self {
            Message::Insert(p) => p.timestamp,
            Message::Delete(p) => p.timestamp,
            Message::CreateSegment { timestamp, .. } => *timestamp,
            Message::SealSegment { timestamp, .. } => *timestamp,
            Message::DropSegment { timestamp, .. } => *timestamp,
            Message::TimeTick { timestamp } => *timestamp,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::Insert(_) => "insert",
            Message::Delete(_) => "delete",
            Message::CreateSegment { .. } => "create_segment",
            Message::SealSegment { .. } => "seal_segment",
            Message::DropSegment { .. } => "drop_segment",
            Message::TimeTick { .. } => "time_tick",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_key_canonical_bytes_roundtrip_order() {
        let a = PrimaryKey::Int(42);
        let b = PrimaryKey::Int(42);
        assert_eq!(a.canonical_bytes(), b.canonical_bytes());
        assert_ne!(
            PrimaryKey::Int(1).canonical_bytes(),
            PrimaryKey::Int(2).canonical_bytes()
        );
        assert_eq!(
            PrimaryKey::Str("k1".into()).canonical_bytes(),
            b"k1".to_vec()
        );
    }

    #[test]
    fn segment_state_is_monotonic() {
        assert!(SegmentState::Growing.can_advance_to(SegmentState::Sealed));
        assert!(SegmentState::Sealed.can_advance_to(SegmentState::Flushed));
        assert!(SegmentState::Growing.can_advance_to(SegmentState::Growing));
        assert!(!SegmentState::Flushed.can_advance_to(SegmentState::Growing));
        assert!(!SegmentState::Dropped.can_advance_to(SegmentState::Sealed));
    }
}
