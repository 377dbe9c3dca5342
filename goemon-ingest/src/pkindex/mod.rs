//! Primary-key existence index: a probabilistic membership filter plus
//! min/max key bounds per segment, built from persisted statistics.

mod bloom;
mod stats;

pub use bloom::BloomFilter;
pub use stats::{
    compound_log_name, decode_stats, encode_stats, select_stat_paths, PkIndex, PkStatistics,
    COMPOUND_STATS_LOG_IDX, STATS_MAGIC, STATS_VERSION,
};
