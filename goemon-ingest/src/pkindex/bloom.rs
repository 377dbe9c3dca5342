//! Bloom filter over primary-key bytes, using xxh3 for speed.

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64_with_seed;

/// Probabilistic membership filter: no false negatives, tunable false
/// positives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BloomFilter {
    words: Vec<u64>,
    num_bits: usize,
    num_hashes: usize,
}

impl BloomFilter {
    pub fn new(bits_per_key: usize, num_keys: usize) -> Self {
        let num_bits = std::cmp::max(64, bits_per_key * num_keys);
        let num_words = (num_bits + 63) / 64;
        let num_hashes = std::cmp::max(1, (bits_per_key as f64 * 0.69) as usize);

        Self {
            words: vec![0; num_words],
            num_bits,
            num_hashes,
        }
    }

    pub fn with_rate(false_positive_rate: f64, expected_keys: usize) -> Self {
        let bits_per_key = (-false_positive_rate.ln() / (2.0_f64.ln().powi(2))) * 1.44;
        Self::new(bits_per_key.ceil() as usize, std::cmp::max(1, expected_keys))
    }

    #[inline]
    fn bit_positions(&self, key: &[u8]) -> impl Iterator<Item = usize> + '_ {
        let h = xxh3_64_with_seed(key, 0);
        let h1 = h as usize;
        let h2 = (h >> 32) as usize;
        let num_bits = self.num_bits;
        (0..self.num_hashes).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % num_bits)
    }

    #[inline]
    pub fn insert(&mut self, key: &[u8]) {
        let positions: Vec<usize> = self.bit_positions(key).collect();
        for pos in positions {
            self.words[pos / 64] |= 1 << (pos % 64);
        }
    }

    #[inline]
    pub fn contains(&self, key: &[u8]) -> bool {
        self.bit_positions(key)
            .all(|pos| self.words[pos / 64] & (1 << (pos % 64)) != 0)
    }

    pub fn num_bits(&self) -> usize {
        self.num_bits
    }

    pub fn num_hashes(&self) -> usize {
        self.num_hashes
    }
}
