//! Parameter sets for labeled PSI.
//!
//! Every numeric choice of the protocol is a configuration input: field
//! characteristic, ring dimension, table geometry and query windowing.
//! Sender and receiver must agree on the full parameter set.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::math::primes;

/// How items are decomposed into field elements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemParams {
    /// Field elements per item; an item occupies this many adjacent bins.
    pub felts_per_item: u32,
}

/// Cuckoo table and bin geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableParams {
    /// Receiver cuckoo table size (number of item slots).
    pub table_size: u32,
    /// Capacity of a single bin inside one bundle.
    pub max_items_per_bin: u32,
    /// Number of cuckoo hash functions.
    pub hash_func_count: u32,
    /// Eviction bound before a receiver insert is declared failed.
    pub max_probes: u32,
    /// Per-bin membership filter false-positive rate.
    pub bloom_false_positive_rate: f64,
}

/// Query-side power computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryParams {
    /// Radix of the windowing decomposition (base powers are `d·B^k`).
    pub window_base: u32,
    /// Paterson–Stockmeyer low degree, 0 to disable.
    pub ps_low_degree: u32,
}

/// BFV scheme parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeParams {
    /// Ring dimension n (power of two).
    pub poly_modulus_degree: usize,
    /// Plaintext modulus t: prime, t ≡ 1 (mod 2n) so that batching works.
    pub plain_modulus: u64,
    /// Bit size of each ciphertext prime, top of the modulus chain first.
    pub coeff_modulus_bits: Vec<u32>,
    /// Relinearization digit width in bits.
    pub decomposition_bits: u32,
    /// Standard deviation of the encryption noise.
    pub sigma: f64,
}

/// Full protocol parameters. Sender and Receiver must agree on all of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PsiParams {
    pub item: ItemParams,
    pub table: TableParams,
    pub query: QueryParams,
    pub he: HeParams,
}

impl PsiParams {
    /// Small ring, small table. Fast enough for end-to-end tests.
    pub fn small_test() -> Self {
        Self {
            item: ItemParams { felts_per_item: 8 },
            table: TableParams {
                table_size: 8,
                max_items_per_bin: 4,
                hash_func_count: 3,
                max_probes: 100,
                bloom_false_positive_rate: 0.01,
            },
            query: QueryParams {
                window_base: 2,
                ps_low_degree: 0,
            },
            he: HeParams {
                poly_modulus_degree: 64,
                plain_modulus: 65537,
                coeff_modulus_bits: vec![56, 56, 56],
                decomposition_bits: 20,
                sigma: 3.2,
            },
        }
    }

    /// Parses and validates parameters from JSON.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let params: Self = serde_json::from_str(json)?;
        params.validate()?;
        Ok(params)
    }

    /// Reads and validates parameters from a JSON file.
    ///
    /// # Arguments
    ///
    /// * `path` - File written by [`PsiParams::to_json_string`] or by hand
    ///
    /// # Returns
    ///
    /// The parameters, or `InvalidParams` if they fail validation.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Pretty-printed JSON form.
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Bits carried by one field element: `floor(log2 t)`.
    pub fn felt_bits(&self) -> usize {
        (63 - self.he.plain_modulus.leading_zeros()) as usize
    }

    /// Field elements (and bins) per item.
    pub fn felts_per_item(&self) -> usize {
        self.item.felts_per_item as usize
    }

    /// Bits of the item actually encoded into field elements.
    pub fn item_bit_count(&self) -> usize {
        self.felts_per_item() * self.felt_bits()
    }

    /// Table locations covered by one bundle.
    pub fn items_per_bundle(&self) -> usize {
        self.he.poly_modulus_degree / self.felts_per_item()
    }

    /// Bins in one bundle: one per plaintext slot.
    pub fn bins_per_bundle(&self) -> usize {
        self.items_per_bundle() * self.felts_per_item()
    }

    /// Number of bundle indices, i.e. query batches.
    pub fn bundle_idx_count(&self) -> usize {
        self.table.table_size as usize / self.items_per_bundle()
    }

    /// Capacity of each bin.
    pub fn max_bin_size(&self) -> usize {
        self.table.max_items_per_bin as usize
    }

    /// Label parts needed to carry `label_byte_count` bytes.
    pub fn label_size(&self, label_byte_count: usize) -> usize {
        (label_byte_count * 8).div_ceil(self.item_bit_count())
    }

    /// Maps a cuckoo table location to `(bundle_idx, first_bin)`.
    pub fn bundle_location(&self, table_loc: usize) -> (usize, usize) {
        let per_bundle = self.items_per_bundle();
        (
            table_loc / per_bundle,
            (table_loc % per_bundle) * self.felts_per_item(),
        )
    }

    /// Checks every cross-parameter constraint.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(Error::InvalidParams(msg.to_string()));
        let n = self.he.poly_modulus_degree;
        let t = self.he.plain_modulus;

        if n < 2 || !n.is_power_of_two() {
            return fail("poly_modulus_degree must be a power of two");
        }
        if !primes::is_prime(t) || t % (2 * n as u64) != 1 {
            return fail("plain_modulus must be a prime ≡ 1 (mod 2n)");
        }
        if self.he.coeff_modulus_bits.is_empty() {
            return fail("coeff_modulus_bits must not be empty");
        }
        let plain_bits = 64 - t.leading_zeros();
        for &bits in &self.he.coeff_modulus_bits {
            if !(20..=60).contains(&bits) {
                return fail("coefficient primes must be 20 to 60 bits");
            }
            if bits <= plain_bits + 1 {
                return fail("coefficient primes must be larger than the plain modulus");
            }
        }
        if !(1..=60).contains(&self.he.decomposition_bits) {
            return fail("decomposition_bits must be between 1 and 60");
        }
        if !(self.he.sigma > 0.0) {
            return fail("sigma must be positive");
        }

        let fpi = self.felts_per_item();
        if fpi == 0 || n % fpi != 0 {
            return fail("felts_per_item must divide poly_modulus_degree");
        }
        if self.item_bit_count() > 128 {
            return fail("felts_per_item * felt_bits exceeds the 128-bit item width");
        }
        if self.item_bit_count() < 40 {
            return fail("items would be encoded with fewer than 40 bits");
        }

        let table_size = self.table.table_size as usize;
        if table_size == 0 || table_size % self.items_per_bundle() != 0 {
            return fail("table_size must be a positive multiple of items per bundle");
        }
        if self.table.max_items_per_bin == 0 {
            return fail("max_items_per_bin must be positive");
        }
        if !(1..=8).contains(&self.table.hash_func_count) {
            return fail("hash_func_count must be between 1 and 8");
        }
        if self.table.max_probes == 0 {
            return fail("max_probes must be positive");
        }
        let fpr = self.table.bloom_false_positive_rate;
        if !(fpr > 0.0 && fpr < 1.0) {
            return fail("bloom_false_positive_rate must lie in (0, 1)");
        }

        if self.query.window_base < 2 {
            return fail("window_base must be at least 2");
        }
        let ps = self.query.ps_low_degree;
        if ps != 0 && ps >= self.table.max_items_per_bin {
            return fail("ps_low_degree must be below max_items_per_bin");
        }

        if primes::coeff_modulus(n, &self.he.coeff_modulus_bits).is_none() {
            return fail("not enough NTT-friendly primes for coeff_modulus_bits");
        }
        Ok(())
    }
}

impl Default for PsiParams {
    fn default() -> Self {
        Self {
            item: ItemParams { felts_per_item: 8 },
            table: TableParams {
                table_size: 4096,
                max_items_per_bin: 16,
                hash_func_count: 3,
                max_probes: 500,
                bloom_false_positive_rate: 0.001,
            },
            query: QueryParams {
                window_base: 4,
                ps_low_degree: 0,
            },
            he: HeParams {
                poly_modulus_degree: 8192,
                plain_modulus: 65537,
                coeff_modulus_bits: vec![56, 56, 56, 50],
                decomposition_bits: 20,
                sigma: 3.2,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_valid() {
        assert!(PsiParams::default().validate().is_ok());
        assert!(PsiParams::small_test().validate().is_ok());
    }

    #[test]
    fn test_derived_geometry() {
        let params = PsiParams::small_test();
        assert_eq!(params.felt_bits(), 16);
        assert_eq!(params.item_bit_count(), 128);
        assert_eq!(params.items_per_bundle(), 8);
        assert_eq!(params.bins_per_bundle(), 64);
        assert_eq!(params.bundle_idx_count(), 1);
        assert_eq!(params.bundle_location(3), (0, 24));
        assert_eq!(params.label_size(1), 1);
        assert_eq!(params.label_size(16), 1);
        assert_eq!(params.label_size(17), 2);
    }

    #[test]
    fn test_rejects_non_batching_plain_modulus() {
        let mut params = PsiParams::small_test();
        params.he.plain_modulus = 65539;
        assert!(matches!(params.validate(), Err(Error::InvalidParams(_))));
    }

    #[test]
    fn test_rejects_misaligned_table() {
        let mut params = PsiParams::small_test();
        params.table.table_size = 12;
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_rejects_ps_degree_too_large() {
        let mut params = PsiParams::small_test();
        params.query.ps_low_degree = 4;
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_json_roundtrip() {
        let params = PsiParams::small_test();
        let json = params.to_json_string().unwrap();
        let back = PsiParams::from_json_str(&json).unwrap();
        assert_eq!(back, params);
    }
}
