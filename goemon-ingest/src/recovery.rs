//! Channel metadata cache construction at pipeline startup.
//!
//! Recovery Path:
//! ┌──────────┐    ┌──────────────┐    ┌───────────────┐
//! │  Broker  │───>│ stat blob    │───>│  MetaCache    │
//! │ segments │    │ load (pool)  │    │  published    │
//! └──────────┘    └──────────────┘    └───────────────┘
//!
//! Every listed segment becomes one unit of work on the shared bounded
//! executor; all units are awaited together and a single failure fails
//! recovery as a whole, so a partially-populated cache is never published.

use std::sync::Arc;

use tracing::{info, warn};

use goemon_core::metrics::Timer;
use goemon_core::traits::{BlobStore, Broker};
use goemon_core::types::{SegmentDescriptor, SegmentId, SegmentState};
use goemon_core::{ChannelInfo, Error, Result};

use crate::executor::{await_all, BoundedExecutor};
use crate::metacache::{MetaCache, RecoveredSegment, SegmentRecord};
use crate::pkindex::{decode_stats, select_stat_paths, PkIndex};

/// Fetch segment descriptors and build the fully-populated metadata cache.
/// The processing graph must not start before this returns.
pub async fn recover_meta_cache(
    channel: &ChannelInfo,
    broker: &Arc<dyn Broker>,
    store: &Arc<dyn BlobStore>,
    executor: &BoundedExecutor,
    unflushed_ids: &[SegmentId],
    flushed_ids: &[SegmentId],
) -> Result<MetaCache> {
    let timer = Timer::new("recover_meta_cache");

    let unflushed = broker
        .get_segment_info(unflushed_ids)
        .await
        .map_err(recovery_error("failed to fetch unflushed segment info"))?;
    let flushed = broker
        .get_segment_info(flushed_ids)
        .await
        .map_err(recovery_error("failed to fetch flushed segment info"))?;

    let mut handles = Vec::with_capacity(unflushed.len() + flushed.len());
    for (descriptors, state) in [(unflushed, SegmentState::Growing), (flushed, SegmentState::Flushed)] {
        for descriptor in descriptors {
            info!(
                channel = %descriptor.insert_channel,
                segment_id = descriptor.segment_id,
                num_rows = descriptor.num_rows,
                state = ?state,
                "recovering segment from checkpoint"
            );

            let store = Arc::clone(store);
            let pk_field_id = channel.pk_field_id;
            handles.push(executor.spawn(async move {
                load_segment(&store, descriptor, state, pk_field_id).await
            }));
        }
    }

    let recovered = await_all(handles)
        .await
        .map_err(recovery_error("failed to load segment statistics"))?;

    info!(
        channel = %channel.channel_name,
        segments = recovered.len(),
        "metadata cache recovered"
    );
    timer.stop();
    Ok(MetaCache::new(channel.clone(), recovered))
}

async fn load_segment(
    store: &Arc<dyn BlobStore>,
    descriptor: SegmentDescriptor,
    state: SegmentState,
    pk_field_id: i64,
) -> Result<RecoveredSegment> {
    let record = SegmentRecord {
        segment_id: descriptor.segment_id,
        state,
        num_rows: descriptor.num_rows,
    };

    let paths = select_stat_paths(&descriptor.stat_logs, pk_field_id);
    if paths.is_empty() {
        // Not an error: the segment simply contributes no filter entries
        // until its next seal produces statistics.
        warn!(segment_id = descriptor.segment_id, "no stat files to load");
        return Ok(RecoveredSegment {
            record,
            pk_index: None,
        });
    }

    let blobs = store.multi_read(&paths).await?;
    let mut entries = Vec::new();
    for blob in &blobs {
        entries.extend(decode_stats(blob)?);
    }

    Ok(RecoveredSegment {
        record,
        pk_index: Some(PkIndex::new(entries)),
    })
}

fn recovery_error(context: &'static str) -> impl FnOnce(Error) -> Error {
    move |e| Error::Recovery {
        message: format!("{}: {}", context, e),
        source: Some(Box::new(e)),
    }
}
