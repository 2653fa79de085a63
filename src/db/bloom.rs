//! # Block Bloom Filters
//!
//! Every sealed block carries a bloom filter over its fine-grained
//! membership keys — (record, key) for the primary family, (key, value)
//! for the secondary, (key, token) for search — so read paths skip blocks
//! that cannot contain the probe.
//!
//! Double hashing with two independent xxh3 seeds derives the k probe
//! positions; at 10 bits per key and k = 7 the false-positive rate sits
//! near 1%. The bit array is persisted verbatim in the block's index
//! sidecar and loaded back without rehashing.

use xxhash_rust::xxh3::xxh3_64_with_seed;

use crate::config::{BLOOM_BITS_PER_KEY, BLOOM_HASH_COUNT};

const SEED_LOW: u64 = 0x51ed_270b;
const SEED_HIGH: u64 = 0xc3a5_c85c_97cb_3127;

#[derive(Debug, Clone)]
pub struct BloomFilter {
    words: Vec<u64>,
    bits: u64,
}

impl BloomFilter {
    /// Sizes the filter for `expected_keys` insertions.
    pub fn with_capacity(expected_keys: usize) -> Self {
        let bits = (expected_keys.max(1) * BLOOM_BITS_PER_KEY)
            .next_power_of_two()
            .max(64) as u64;
        Self {
            words: vec![0u64; (bits as usize) / 64],
            bits,
        }
    }

    /// Rehydrates a filter from its persisted words.
    pub fn from_words(words: Vec<u64>) -> Self {
        let bits = (words.len() as u64) * 64;
        Self { words, bits }
    }

    pub fn words(&self) -> &[u64] {
        &self.words
    }

    pub fn insert(&mut self, key: &[u8]) {
        for position in self.positions(key) {
            self.words[(position / 64) as usize] |= 1u64 << (position % 64);
        }
    }

    pub fn maybe_contains(&self, key: &[u8]) -> bool {
        if self.bits == 0 {
            return false;
        }
        self.positions(key)
            .all(|position| self.words[(position / 64) as usize] & (1u64 << (position % 64)) != 0)
    }

    fn positions(&self, key: &[u8]) -> impl Iterator<Item = u64> {
        let h1 = xxh3_64_with_seed(key, SEED_LOW);
        let h2 = xxh3_64_with_seed(key, SEED_HIGH) | 1;
        let bits = self.bits;
        (0..BLOOM_HASH_COUNT as u64).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) & (bits - 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inserted_keys_are_always_found() {
        let mut bloom = BloomFilter::with_capacity(1000);
        for i in 0..1000u32 {
            bloom.insert(&i.to_be_bytes());
        }
        for i in 0..1000u32 {
            assert!(bloom.maybe_contains(&i.to_be_bytes()));
        }
    }

    #[test]
    fn false_positive_rate_stays_low() {
        let mut bloom = BloomFilter::with_capacity(1000);
        for i in 0..1000u32 {
            bloom.insert(&i.to_be_bytes());
        }
        let false_positives = (1000..11000u32)
            .filter(|i| bloom.maybe_contains(&i.to_be_bytes()))
            .count();
        assert!(
            false_positives < 500,
            "false positive rate SHOULD stay near 1%, got {}/10000",
            false_positives
        );
    }

    #[test]
    fn persisted_words_round_trip() {
        let mut bloom = BloomFilter::with_capacity(16);
        bloom.insert(b"alpha");
        bloom.insert(b"beta");
        let restored = BloomFilter::from_words(bloom.words().to_vec());
        assert!(restored.maybe_contains(b"alpha"));
        assert!(restored.maybe_contains(b"beta"));
    }

    #[test]
    fn empty_filter_contains_nothing() {
        let bloom = BloomFilter::with_capacity(8);
        assert!(!bloom.maybe_contains(b"anything"));
    }
}
