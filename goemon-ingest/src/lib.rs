//! # Goemon Ingest
//!
//! Per-channel streaming ingestion pipeline for GoemonDB.
//!
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Channel Pipeline                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  Write Path:                                                │
//! │  ┌─────────┐   ┌───────────┐   ┌──────────────┐             │
//! │  │   log   │──>│ flowgraph │──>│ write buffer │             │
//! │  └─────────┘   └───────────┘   └──────┬───────┘             │
//! │                                       │ flush               │
//! │                                       ▼                     │
//! │                               ┌──────────────┐              │
//! │                               │ sync manager │──> blobs     │
//! │                               └──────┬───────┘              │
//! │                                      │ done                 │
//! │                                      ▼                      │
//! │                               checkpoint updater            │
//! │                                                             │
//! │  Recovery Path:                                             │
//! │  broker segments ──> stat blobs ──> metadata cache          │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘

pub mod executor;
pub mod flowgraph;
pub mod metacache;
pub mod pkindex;
pub mod pipeline;
pub mod recovery;
pub mod syncmgr;
pub mod writebuffer;

pub use executor::{await_all, BoundedExecutor, TaskHandle};
pub use flowgraph::{CloseKind, FlowGraph};
pub use metacache::{MetaCache, RecoveredSegment, SegmentRecord};
pub use pipeline::{IngestServices, Pipeline, PipelineState};
pub use pkindex::{BloomFilter, PkIndex, PkStatistics};
pub use recovery::recover_meta_cache;
pub use syncmgr::{SyncManager, SyncPayload, SyncState, SyncTask, SyncedSegment};
pub use writebuffer::{SyncBatch, WriteBuffer};
