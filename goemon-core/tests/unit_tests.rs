//! Core unit tests

use std::time::Duration;

use goemon_core::config::IngestConfig;
use goemon_core::metrics::IngestMetrics;
use goemon_core::types::{PrimaryKey, SegmentState};
use goemon_core::Error;

#[test]
fn error_codes_and_recoverability() {
    let sync = Error::SyncTask {
        segment_id: 7,
        message: "disk full".to_string(),
        source: None,
    };
    assert_eq!(sync.error_code(), "SYNC_TASK_ERROR");
    assert!(sync.is_recoverable());

    let recovery = Error::Recovery {
        message: "broker unreachable".to_string(),
        source: None,
    };
    assert_eq!(recovery.error_code(), "RECOVERY_ERROR");
    assert!(!recovery.is_recoverable());

    let stage = Error::GraphStage {
        stage: "filter",
        message: "unknown segment".to_string(),
    };
    assert!(!stage.is_recoverable());

    let dereg = Error::Deregistration {
        channel: "ch".to_string(),
        message: "timeout".to_string(),
    };
    assert!(dereg.is_recoverable());
}

#[test]
fn error_display_carries_context() {
    let e = Error::SyncTask {
        segment_id: 42,
        message: "write rejected".to_string(),
        source: None,
    };
    let rendered = e.to_string();
    assert!(rendered.contains("42"));
    assert!(rendered.contains("write rejected"));
}

#[test]
fn config_defaults_are_sane() {
    let config = IngestConfig::default();
    assert!(config.executor.workers > 0);
    assert!(config.flowgraph.queue_capacity > 0);
    assert!(config.write_buffer.max_segment_bytes > 0);
    assert!(config.write_buffer.max_buffer_age > Duration::ZERO);
    assert!(config.sync.bloom_false_positive_rate > 0.0);
    assert!(config.sync.bloom_false_positive_rate < 1.0);
}

#[test]
fn config_roundtrips_through_json() {
    let config = IngestConfig::default();
    let json = serde_json::to_string(&config).unwrap();
    let back: IngestConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(back.write_buffer.max_segment_bytes, config.write_buffer.max_segment_bytes);
    assert_eq!(back.sync.blob_root, config.sync.blob_root);
}

#[test]
fn primary_key_roundtrips_through_msgpack() {
    for key in [PrimaryKey::Int(-17), PrimaryKey::Str("user-9".to_string())] {
        let bytes = rmp_serde::to_vec(&key).unwrap();
        let back: PrimaryKey = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(back, key);
    }
}

#[test]
fn primary_key_ordering_is_total_within_a_variant() {
    assert!(PrimaryKey::Int(1) < PrimaryKey::Int(2));
    assert!(PrimaryKey::Str("a".to_string()) < PrimaryKey::Str("b".to_string()));
}

#[test]
fn segment_state_ranks_are_strictly_increasing() {
    let order = [
        SegmentState::Growing,
        SegmentState::Sealed,
        SegmentState::Flushed,
        SegmentState::Dropped,
    ];
    for pair in order.windows(2) {
        assert!(pair[0].rank() < pair[1].rank());
    }
}

#[test]
fn metrics_snapshot_reflects_recorded_values() {
    let metrics = IngestMetrics::new();
    metrics.record_message();
    metrics.record_message();
    metrics.record_buffered(10, 640);
    metrics.record_sync_submitted();
    metrics.record_sync_completed();
    metrics.set_checkpoint(99);

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.messages_consumed, 2);
    assert_eq!(snapshot.rows_buffered, 10);
    assert_eq!(snapshot.bytes_buffered, 640);
    assert_eq!(snapshot.syncs_submitted, 1);
    assert_eq!(snapshot.syncs_completed, 1);
    assert_eq!(snapshot.checkpoint_timestamp, 99);
}
