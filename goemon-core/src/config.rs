//! # Configuration Management
//!
//! Configuration for the ingest pipeline components.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    pub executor: ExecutorConfig,
    pub flowgraph: FlowGraphConfig,
    pub write_buffer: WriteBufferConfig,
    pub sync: SyncConfig,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            executor: ExecutorConfig::default(),
            flowgraph: FlowGraphConfig::default(),
            write_buffer: WriteBufferConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

/// Bounded executor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Maximum units of work executing concurrently; excess submissions
    /// queue and wait
    pub workers: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self { workers: 16 }
    }
}

/// Processing-graph configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowGraphConfig {
    /// Capacity of the queue between two stages; a full queue backpressures
    /// the upstream stage
    pub queue_capacity: usize,
}

impl Default for FlowGraphConfig {
    fn default() -> Self {
        Self { queue_capacity: 128 }
    }
}

/// Write-buffer flush thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteBufferConfig {
    /// Buffered bytes per segment before a flush is triggered
    pub max_segment_bytes: usize,
    /// Buffered age per segment before a flush is triggered
    pub max_buffer_age: Duration,
}

impl Default for WriteBufferConfig {
    fn default() -> Self {
        Self {
            max_segment_bytes: 16 * 1024 * 1024, // 16MB
            max_buffer_age: Duration::from_secs(10),
        }
    }
}

/// Sync-manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Root prefix under which binlog blobs are written
    pub blob_root: String,
    /// Capacity of the submission queue
    pub queue_capacity: usize,
    /// False-positive rate of the existence filter built at flush time
    pub bloom_false_positive_rate: f64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            blob_root: "insert_log".to_string(),
            queue_capacity: 256,
            bloom_false_positive_rate: 0.01, // 1%
        }
    }
}
