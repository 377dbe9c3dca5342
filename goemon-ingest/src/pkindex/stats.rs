//! Primary-key statistics and their persisted blob encoding.
//!
//! Blob Format
//! ┌────────────────────────────────────────────────┐
//! │ Magic (8 bytes): "GMPKSTAT"                    │
//! │ Version (4 bytes)                              │
//! │ Payload length (4 bytes)                       │
//! │ Payload: rmp-serde list of stat records        │
//! │ CRC32 of payload (4 bytes)                     │
//! └────────────────────────────────────────────────┘
//!
//! A segment's statistics are persisted either as one *compound* blob
//! holding every record, or as one blob per flush batch under the pk field.
//! The compound file name marker always wins during recovery, even when
//! per-field blobs are also listed, so records are never counted twice.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

use goemon_core::types::{FieldId, PrimaryKey, StatLog};
use goemon_core::{Error, Result};

use super::bloom::BloomFilter;

pub const STATS_MAGIC: &[u8; 8] = b"GMPKSTAT";
pub const STATS_VERSION: u32 = 1;

/// File-name marker of a compound stats blob
pub const COMPOUND_STATS_LOG_IDX: i64 = i64::MAX;

/// Last path segment identifying a compound stats blob
pub fn compound_log_name() -> String {
    COMPOUND_STATS_LOG_IDX.to_string()
}

/// Statistics of one flushed batch of a segment: existence filter plus key
/// bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PkStatistics {
    pub field_id: FieldId,
    pub min_key: PrimaryKey,
    pub max_key: PrimaryKey,
    pub filter: BloomFilter,
}

impl PkStatistics {
    /// Build statistics from the keys of one sync batch. Returns `None` for
    /// an empty batch.
    pub fn from_keys(
        field_id: FieldId,
        keys: &[PrimaryKey],
        false_positive_rate: f64,
    ) -> Option<Self> {
        let first = keys.first()?;
        let mut min_key = first.clone();
        let mut max_key = first.clone();
        let mut filter = BloomFilter::with_rate(false_positive_rate, keys.len());

        for key in keys {
            if key < &min_key {
                min_key = key.clone();
            }
            if key > &max_key {
                max_key = key.clone();
            }
            filter.insert(&key.canonical_bytes());
        }

        Some(Self {
            field_id,
            min_key,
            max_key,
            filter,
        })
    }

    /// Whether the key could exist in the batch this record covers
    pub fn may_contain(&self, key: &PrimaryKey) -> bool {
        if key < &self.min_key || key > &self.max_key {
            return false;
        }
        self.filter.contains(&key.canonical_bytes())
    }
}

/// Existence index of one segment: every stat record loaded for it. A key
/// may exist if any record admits it.
#[derive(Debug, Clone, Default)]
pub struct PkIndex {
    entries: Vec<PkStatistics>,
}

impl PkIndex {
    pub fn new(entries: Vec<PkStatistics>) -> Self {
        Self { entries }
    }

    pub fn may_contain(&self, key: &PrimaryKey) -> bool {
        self.entries.iter().any(|s| s.may_contain(key))
    }

    pub fn merge(&mut self, stats: PkStatistics) {
        self.entries.push(stats);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Encode stat records into a framed blob
pub fn encode_stats(records: &[PkStatistics]) -> Result<Vec<u8>> {
    let payload = rmp_serde::to_vec(records).map_err(|e| Error::StatsCodec {
        message: "failed to serialize stat records".to_string(),
        source: Some(Box::new(e)),
    })?;

    let mut buf = Vec::with_capacity(payload.len() + 20);
    buf.extend_from_slice(STATS_MAGIC);
    buf.write_u32::<LittleEndian>(STATS_VERSION)?;
    buf.write_u32::<LittleEndian>(payload.len() as u32)?;
    buf.extend_from_slice(&payload);
    buf.write_u32::<LittleEndian>(crc32fast::hash(&payload))?;
    Ok(buf)
}

/// Decode a framed stats blob, verifying magic, version and checksum
pub fn decode_stats(data: &[u8]) -> Result<Vec<PkStatistics>> {
    let mut cursor = std::io::Cursor::new(data);

    let mut magic = [0u8; 8];
    std::io::Read::read_exact(&mut cursor, &mut magic)?;
    if &magic != STATS_MAGIC {
        return Err(Error::StatsCodec {
            message: "bad stats blob magic".to_string(),
            source: None,
        });
    }

    let version = cursor.read_u32::<LittleEndian>()?;
    if version != STATS_VERSION {
        return Err(Error::StatsCodec {
            message: format!("unsupported stats blob version: {}", version),
            source: None,
        });
    }

    let payload_len = cursor.read_u32::<LittleEndian>()? as usize;
    let start = cursor.position() as usize;
    let end = start + payload_len;
    if end + 4 > data.len() {
        return Err(Error::StatsCodec {
            message: "truncated stats blob".to_string(),
            source: None,
        });
    }
    let payload = &data[start..end];

    cursor.set_position(end as u64);
    let expected_crc = cursor.read_u32::<LittleEndian>()?;
    if crc32fast::hash(payload) != expected_crc {
        return Err(Error::StatsCodec {
            message: "stats blob checksum mismatch".to_string(),
            source: None,
        });
    }

    rmp_serde::from_slice(payload).map_err(|e| Error::StatsCodec {
        message: "failed to deserialize stat records".to_string(),
        source: Some(Box::new(e)),
    })
}

/// Pick the stat blob paths to read for one segment. A compound blob
/// short-circuits: when present, only it is read and every per-field blob
/// is ignored.
pub fn select_stat_paths(stat_logs: &[StatLog], pk_field_id: FieldId) -> Vec<String> {
    let marker = compound_log_name();
    let mut paths = Vec::new();

    for log in stat_logs {
        if log.field_id != pk_field_id {
            continue;
        }
        let name = log
            .log_path
            .rsplit('/')
            .next()
            .unwrap_or(log.log_path.as_str());
        if name == marker {
            return vec![log.log_path.clone()];
        }
        paths.push(log.log_path.clone());
    }

    paths
}
