//! Per-bin membership filter.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::item::Felt;

/// First 8 bytes (little-endian) of `SHA-256(index as u64 LE || data)`.
pub(crate) fn indexed_hash(index: usize, data: &[u8]) -> u64 {
    let mut h = Sha256::new();
    h.update((index as u64).to_le_bytes());
    h.update(data);
    let digest = h.finalize();
    let mut word = [0u8; 8];
    word.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(word)
}

/// Bloom filter over field elements.
///
/// Never returns `false` for an inserted value; returns `true` for a value
/// that was never inserted with roughly the configured probability. Bits
/// cannot be cleared, so removal rebuilds the filter from the remaining
/// values.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BloomFilter {
    words: Vec<u64>,
    size: usize,
    nhashes: usize,
}

impl BloomFilter {
    /// Creates an empty filter.
    ///
    /// # Arguments
    ///
    /// * `size` - Number of bits (at least 1)
    /// * `nhashes` - Bit positions set per value (at least 1)
    pub fn new(size: usize, nhashes: usize) -> Self {
        let size = size.max(1);
        Self {
            words: vec![0; size.div_ceil(64)],
            size,
            nhashes: nhashes.max(1),
        }
    }

    /// Sized for `n` insertions at false-positive probability `p`.
    pub fn with_false_positive_prob(p: f64, n: usize) -> Self {
        let expansion = -1.44 * p.log2();
        let nhashes = (-p.log2()).ceil() as usize;
        Self::new((expansion * n as f64).ceil() as usize, nhashes)
    }

    /// Number of bits in the filter.
    pub fn len(&self) -> usize {
        self.size
    }

    /// True if no bit is set.
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// Bit positions set per value.
    pub fn nhashes(&self) -> usize {
        self.nhashes
    }

    fn positions(&self, value: Felt) -> impl Iterator<Item = usize> + '_ {
        let bytes = value.to_le_bytes();
        (0..self.nhashes).map(move |i| (indexed_hash(i, &bytes) % self.size as u64) as usize)
    }

    /// Adds `value` to the filter.
    pub fn insert(&mut self, value: Felt) {
        let positions: Vec<usize> = self.positions(value).collect();
        for i in positions {
            self.words[i / 64] |= 1 << (i % 64);
        }
    }

    /// True if `value` may be present. Never false for an inserted value.
    pub fn contains(&self, value: Felt) -> bool {
        self.positions(value)
            .all(|i| self.words[i / 64] & (1 << (i % 64)) != 0)
    }

    /// Resets every bit.
    pub fn clear(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
    }

    /// Clears the filter and re-inserts `values`.
    pub fn rebuild(&mut self, values: &[Felt]) {
        self.clear();
        for &v in values {
            self.insert(v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha20Rng;

    #[test]
    fn test_membership() {
        let mut rng = ChaCha20Rng::seed_from_u64(3);
        let mut filter = BloomFilter::with_false_positive_prob(0.01, 64);
        let values: Vec<Felt> = (0..64).map(|_| rng.gen_range(0..65537)).collect();
        for &v in &values {
            filter.insert(v);
        }
        assert!(values.iter().all(|&v| filter.contains(v)));
    }

    #[test]
    fn test_false_positive_rate_is_small() {
        let mut filter = BloomFilter::with_false_positive_prob(0.01, 100);
        for v in 0..100 {
            filter.insert(v);
        }
        let false_positives = (1000..11000).filter(|&v| filter.contains(v)).count();
        assert!(false_positives < 500, "{false_positives} false positives");
    }

    #[test]
    fn test_rebuild_forgets_removed_values() {
        let mut filter = BloomFilter::with_false_positive_prob(0.001, 4);
        filter.insert(11);
        filter.insert(22);
        filter.rebuild(&[22]);
        assert!(filter.contains(22));
        filter.rebuild(&[]);
        assert!(filter.is_empty());
        assert!(!filter.contains(22));
    }
}
