//! Bloom filter for fast negative lookups
//!
//! ## Sizing
//! For `n` keys and a target false positive rate `p`:
//! - bits: m = -n·ln(p) / ln(2)²
//! - hash functions: k = (m/n)·ln(2)
//!
//! At p = 5% this is ~6.2 bits and 4-5 probes per key.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Smallest bit array handed out, keeps `% num_bits` well defined for empty files
const MIN_BITS: usize = 64;

/// Probabilistic "definitely absent" test over keys
///
/// No false negatives: `may_contain` returns true for every inserted key.
pub trait KeyFilter: Send + Sync {
    fn insert(&mut self, key: &[u8]);

    fn may_contain(&self, key: &[u8]) -> bool;

    /// In-memory size in bytes
    fn byte_size(&self) -> usize;
}

/// Builds one filter per file
pub trait FilterFactory: Send + Sync {
    fn create(&self, expected_keys: u64, false_positive_rate: f64) -> Box<dyn KeyFilter>;
}

/// Bloom filter over byte keys
pub struct BloomFilter {
    /// Bit array
    bits: Vec<u8>,

    /// Number of hash functions
    num_hashes: u32,

    /// Number of bits
    num_bits: usize,
}

impl BloomFilter {
    /// Create a new Bloom filter
    ///
    /// # Parameters
    /// - `num_keys`: Expected number of keys
    /// - `bits_per_key`: Bits allocated per key (typically 10 for 1% FPR)
    pub fn new(num_keys: usize, bits_per_key: usize) -> Self {
        let num_bits = (num_keys * bits_per_key).max(MIN_BITS);

        // Optimal number of hash functions: k = (m/n) * ln(2)
        let num_hashes = ((bits_per_key as f64) * std::f64::consts::LN_2).ceil() as u32;

        Self::with_bits(num_bits, num_hashes)
    }

    /// Create a filter sized for `num_keys` at false positive rate `fpp`
    pub fn with_false_positive_rate(num_keys: usize, fpp: f64) -> Self {
        let fpp = fpp.clamp(1e-9, 0.999);
        let ln2_sq = std::f64::consts::LN_2 * std::f64::consts::LN_2;
        let num_bits = (-(num_keys as f64) * fpp.ln() / ln2_sq).ceil() as usize;
        let num_bits = num_bits.max(MIN_BITS);

        let num_hashes = if num_keys == 0 {
            1
        } else {
            ((num_bits as f64 / num_keys as f64) * std::f64::consts::LN_2).round() as u32
        };

        Self::with_bits(num_bits, num_hashes)
    }

    fn with_bits(num_bits: usize, num_hashes: u32) -> Self {
        let num_bytes = num_bits.div_ceil(8);
        Self {
            bits: vec![0u8; num_bytes],
            num_hashes: num_hashes.clamp(1, 30),
            num_bits,
        }
    }

    /// Insert a key
    pub fn insert(&mut self, key: &[u8]) {
        let (h1, h2) = Self::hash_pair(key);
        for i in 0..self.num_hashes {
            let bit_pos = self.bit_position(h1, h2, i);
            self.set_bit(bit_pos);
        }
    }

    /// Check if key might exist (may have false positives)
    pub fn may_contain(&self, key: &[u8]) -> bool {
        let (h1, h2) = Self::hash_pair(key);
        for i in 0..self.num_hashes {
            let bit_pos = self.bit_position(h1, h2, i);
            if !self.get_bit(bit_pos) {
                return false; // Definitely not in set
            }
        }
        true // Might be in set (or false positive)
    }

    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    /// Get byte size
    pub fn byte_size(&self) -> usize {
        self.bits.len()
    }

    // Internal helpers

    /// Two independent hashes; probe i uses h1 + i·h2 (Kirsch-Mitzenmacher)
    fn hash_pair(key: &[u8]) -> (u64, u64) {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let h1 = hasher.finish();

        let mut hasher = DefaultHasher::new();
        0x9E37_79B9_7F4A_7C15u64.hash(&mut hasher);
        key.hash(&mut hasher);
        let h2 = hasher.finish() | 1;

        (h1, h2)
    }

    fn bit_position(&self, h1: u64, h2: u64, i: u32) -> usize {
        (h1.wrapping_add((i as u64).wrapping_mul(h2)) % self.num_bits as u64) as usize
    }

    fn set_bit(&mut self, pos: usize) {
        let byte_idx = pos / 8;
        let bit_idx = pos % 8;
        self.bits[byte_idx] |= 1 << bit_idx;
    }

    fn get_bit(&self, pos: usize) -> bool {
        let byte_idx = pos / 8;
        let bit_idx = pos % 8;
        (self.bits[byte_idx] & (1 << bit_idx)) != 0
    }
}

impl KeyFilter for BloomFilter {
    fn insert(&mut self, key: &[u8]) {
        BloomFilter::insert(self, key)
    }

    fn may_contain(&self, key: &[u8]) -> bool {
        BloomFilter::may_contain(self, key)
    }

    fn byte_size(&self) -> usize {
        BloomFilter::byte_size(self)
    }
}

/// Default factory: one `BloomFilter` per file
#[derive(Clone, Copy, Debug, Default)]
pub struct BloomFilterFactory;

impl FilterFactory for BloomFilterFactory {
    fn create(&self, expected_keys: u64, false_positive_rate: f64) -> Box<dyn KeyFilter> {
        Box::new(BloomFilter::with_false_positive_rate(
            expected_keys as usize,
            false_positive_rate,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_operations() {
        let mut bloom = BloomFilter::new(100, 10);

        bloom.insert(b"key1");
        bloom.insert(b"key2");
        bloom.insert(b"key3");

        assert!(bloom.may_contain(b"key1"));
        assert!(bloom.may_contain(b"key2"));
        assert!(bloom.may_contain(b"key3"));
    }

    #[test]
    fn test_false_positive_rate() {
        let num_keys = 1000;
        let mut bloom = BloomFilter::with_false_positive_rate(num_keys, 0.05);

        for i in 0..num_keys {
            let key = format!("key_{}", i);
            bloom.insert(key.as_bytes());
        }

        // No false negatives
        for i in 0..num_keys {
            let key = format!("key_{}", i);
            assert!(bloom.may_contain(key.as_bytes()));
        }

        let mut false_positives = 0;
        let test_count = 10000;
        for i in num_keys..(num_keys + test_count) {
            let key = format!("key_{}", i);
            if bloom.may_contain(key.as_bytes()) {
                false_positives += 1;
            }
        }

        let fpr = false_positives as f64 / test_count as f64;
        // Should be around 5% (allow up to 10% for small sample)
        assert!(fpr < 0.10, "FPR too high: {:.2}%", fpr * 100.0);
    }

    #[test]
    fn test_sizing_follows_target_rate() {
        let loose = BloomFilter::with_false_positive_rate(10_000, 0.05);
        let tight = BloomFilter::with_false_positive_rate(10_000, 0.001);
        assert!(tight.byte_size() > loose.byte_size());
        assert!(tight.num_hashes() > loose.num_hashes());
    }

    #[test]
    fn test_empty_filter() {
        let bloom = BloomFilter::with_false_positive_rate(0, 0.05);
        assert!(!bloom.may_contain(b"any_key"));
    }

    #[test]
    fn test_factory_builds_working_filter() {
        let mut filter = BloomFilterFactory.create(10, 0.05);
        filter.insert(b"present");
        assert!(filter.may_contain(b"present"));
        assert!(filter.byte_size() >= MIN_BITS / 8);
    }
}
