//! # Goemon Core
//!
//! This crate provides the fundamental building blocks for the GoemonDB
//! ingest node:
//! - Core data structures (channels, segments, messages, primary keys)
//! - Collaborator traits (log client, broker, blob storage, allocator)
//! - Error types
//! - Configuration
//! - Metrics

pub mod config;
pub mod error;
pub mod metrics;
pub mod traits;
pub mod types;

// Re-export commonly used types
pub use error::{Error, Result};
pub use types::{
    ChannelInfo, CollectionId, DeletePayload, FieldId, InsertPayload, Message, NodeId,
    PrimaryKey, ResumePosition, SegmentDescriptor, SegmentId, SegmentState, StatLog, Timestamp,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
