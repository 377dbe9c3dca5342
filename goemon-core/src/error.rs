//! # Error Handling
//!
//! Error types for the GoemonDB ingest node.
//!
//! ## Design Principles
//!
//! 1. **Actionable**: Every error should guide the operator toward resolution
//! 2. **Contextual**: Errors include relevant context (channel, segment, paths)
//! 3. **Recoverable**: Distinguish between fatal and recoverable errors

use thiserror::Error;

use crate::types::SegmentId;

/// Result type alias for ingest-node operations
pub type Result<T> = std::result::Result<T, Error>;

/// Primary error type for the ingest node
#[derive(Error, Debug)]
pub enum Error {
    // Startup Errors
    #[error("recovery failed: {message}")]
    Recovery { message: String, source: Option<Box<dyn std::error::Error + Send + Sync>> },

    // Pipeline Errors
    #[error("stage {stage} failed: {message}")]
    GraphStage { stage: &'static str, message: String },

    #[error("sync failed for segment {segment_id}: {message}")]
    SyncTask { segment_id: SegmentId, message: String, source: Option<Box<dyn std::error::Error + Send + Sync>> },

    #[error("failed to deregister channel {channel}: {message}")]
    Deregistration { channel: String, message: String },

    // Storage Errors
    #[error("stats codec error: {message}")]
    StatsCodec { message: String, source: Option<Box<dyn std::error::Error + Send + Sync>> },

    #[error("storage error: {message}")]
    Storage { message: String, source: Option<Box<dyn std::error::Error + Send + Sync>> },

    // System Errors
    #[error("IO error: {message}")]
    Io { message: String, source: std::io::Error },

    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Check if the error is recoverable without restarting the channel pipeline
    pub fn is_recoverable(&self) -> bool {
        match self {
            // Sync failures are retried with the accumulated buffer
            Error::SyncTask { .. } => true,
            // Deregistration failures are logged and close proceeds
            Error::Deregistration { .. } => true,
            // A pipeline that never started or whose graph broke must be
            // re-created from the last confirmed checkpoint
            Error::Recovery { .. } => false,
            Error::GraphStage { .. } => false,
            Error::StatsCodec { .. } => false,
            Error::Io { .. } => false,
            _ => false,
        }
    }

    /// Get error code for monitoring
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Recovery { .. } => "RECOVERY_ERROR",
            Error::GraphStage { .. } => "GRAPH_STAGE_ERROR",
            Error::SyncTask { .. } => "SYNC_TASK_ERROR",
            Error::Deregistration { .. } => "DEREGISTRATION_ERROR",
            Error::StatsCodec { .. } => "STATS_CODEC_ERROR",
            Error::Storage { .. } => "STORAGE_ERROR",
            Error::Io { .. } => "IO_ERROR",
            Error::Configuration { .. } => "CONFIG_ERROR",
            Error::Internal { .. } => "INTERNAL_ERROR",
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io {
            message: err.to_string(),
            source: err,
        }
    }
}
