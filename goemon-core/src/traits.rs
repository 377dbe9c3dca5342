//! # Collaborator Contracts
//!
//! Interfaces to the external systems the pipeline consumes: the distributed
//! log, the coordinator broker, durable blob storage, the id allocator and
//! the checkpoint updater.
//!
//! ## Design Philosophy
//!
//! 1. **Async-First**: All I/O operations are async
//! 2. **Narrow**: Only the operations the pipeline actually needs
//! 3. **Testability**: Every collaborator is mockable with an in-memory
//!    implementation

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::types::{Message, ResumePosition, SegmentDescriptor, SegmentId, Timestamp};
use crate::Result;

/// Client of the distributed log dispatcher
#[async_trait]
pub trait LogClient: Send + Sync {
    /// Subscribe to a channel's ordered message stream from the given resume
    /// position. Messages arrive strictly in log order.
    async fn subscribe(
        &self,
        channel: &str,
        resume: ResumePosition,
    ) -> Result<mpsc::Receiver<Message>>;

    /// Deregister the channel so no further messages are dispatched to it
    async fn deregister(&self, channel: &str) -> Result<()>;
}

/// Coordinator RPC surface used during recovery
#[async_trait]
pub trait Broker: Send + Sync {
    /// Fetch segment descriptors for the given ids
    async fn get_segment_info(&self, segment_ids: &[SegmentId]) -> Result<Vec<SegmentDescriptor>>;
}

/// Idempotence key for a blob write: one segment's sync attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WriteToken {
    pub segment_id: SegmentId,
    pub attempt: u64,
}

impl fmt::Display for WriteToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.segment_id, self.attempt)
    }
}

/// Durable object/blob storage
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Read several blobs, in the order their paths were given
    async fn multi_read(&self, paths: &[String]) -> Result<Vec<Bytes>>;

    /// Durably write one blob. Writes are idempotent per token: retrying a
    /// failed attempt with the same token must not duplicate data.
    async fn put(&self, token: &WriteToken, path: &str, data: Bytes) -> Result<()>;
}

/// Allocator of monotonic identifiers (binlog ids, sync attempt ids)
#[async_trait]
pub trait IdAllocator: Send + Sync {
    /// Allocate `count` consecutive ids, returning the first
    async fn alloc(&self, count: u32) -> Result<u64>;
}

/// External checkpoint persistence. Fire-and-forget: the pipeline never
/// assumes the call is synchronous or immediately durable, since recovery
/// re-derives state from segment descriptors.
#[async_trait]
pub trait CheckpointUpdater: Send + Sync {
    async fn update(&self, channel: &str, timestamp: Timestamp);
}
