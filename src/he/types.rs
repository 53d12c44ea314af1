//! BFV plaintext, ciphertext and key types.

use rand::SeedableRng;
use rand::Rng;
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};

use crate::math::RnsPoly;

use super::context::HeContext;

/// Plaintext polynomial with coefficients in `[0, t)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plaintext {
    pub coeffs: Vec<u64>,
}

impl Plaintext {
    /// All-zero plaintext of dimension `n`.
    pub fn zero(n: usize) -> Self {
        Self { coeffs: vec![0; n] }
    }

    /// True if every coefficient is zero.
    pub fn is_zero(&self) -> bool {
        self.coeffs.iter().all(|&c| c == 0)
    }
}

/// Plaintext pre-lifted to every top-level prime and NTT-transformed,
/// ready for repeated plaintext-ciphertext products.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NttPlaintext {
    pub(crate) poly: RnsPoly,
}

/// BFV ciphertext `(c_0, c_1[, c_2])`.
///
/// Decryption computes `c_0 + c_1·s (+ c_2·s²) = Δ·m + e (mod Q_l)` and
/// rounds `t/Q_l` times the result. Three-component ciphertexts only exist
/// between a multiplication and the following relinearization.
///
/// # Fields
///
/// * `polys` - Components, all at the same level and in the same form
/// * `is_ntt` - Whether the components are in NTT (evaluation) form
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ciphertext {
    pub(crate) polys: Vec<RnsPoly>,
    pub(crate) is_ntt: bool,
}

impl Ciphertext {
    pub(crate) fn from_parts(polys: Vec<RnsPoly>, is_ntt: bool) -> Self {
        debug_assert!(polys.len() >= 2);
        Self { polys, is_ntt }
    }

    /// Index of the last prime in use.
    pub fn level(&self) -> usize {
        self.polys[0].prime_count() - 1
    }

    /// Number of components (2 after relinearization).
    pub fn size(&self) -> usize {
        self.polys.len()
    }

    /// True if the polynomials are in NTT form.
    pub fn is_ntt(&self) -> bool {
        self.is_ntt
    }

    /// Ring dimension `n`.
    pub fn ring_dim(&self) -> usize {
        self.polys[0].dimension()
    }

    /// Shape check for ciphertexts received from the other party.
    pub fn is_well_formed(&self, ctx: &HeContext) -> bool {
        let Some(first) = self.polys.first() else {
            return false;
        };
        let Some(level) = first.prime_count().checked_sub(1) else {
            return false;
        };
        (2..=3).contains(&self.polys.len()) && self.polys.iter().all(|p| ctx.poly_fits(p, level))
    }
}

/// Seeded ciphertext: stores a 32-byte seed instead of `c_1`.
///
/// `c_1` is uniform, so it can be regenerated from the seed on the
/// receiving side, halving the size of each query ciphertext.
///
/// # Fields
///
/// * `seed` - ChaCha20 seed for `c_1`
/// * `c0` - First component at the top level, coefficient form
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeededCiphertext {
    pub seed: [u8; 32],
    pub c0: RnsPoly,
}

impl SeededCiphertext {
    /// Regenerates `c_1` and returns the full ciphertext.
    ///
    /// # Arguments
    ///
    /// * `ctx` - Context the ciphertext was produced under
    ///
    /// # Returns
    ///
    /// A two-component coefficient-form ciphertext at the top level.
    pub fn expand(&self, ctx: &HeContext) -> Ciphertext {
        let c1 = uniform_from_seed(&self.seed, ctx.n(), ctx.moduli());
        Ciphertext::from_parts(vec![self.c0.clone(), c1], false)
    }

    /// Shape check for seeded ciphertexts received from the Receiver.
    pub fn is_well_formed(&self, ctx: &HeContext) -> bool {
        ctx.poly_fits(&self.c0, ctx.top_level())
    }
}

/// Secret key `s`, ternary, stored in NTT form at the top level.
#[derive(Clone, Debug)]
pub struct SecretKey {
    pub(crate) ntt: RnsPoly,
}

/// Relinearization keys for `s²`, one pair per base-`2^w` digit.
///
/// Pair `j` is `(b_j, a_j)` with `b_j = -a_j·s + e_j + 2^(w·j)·s²`, both in
/// NTT form at the top level.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelinKeys {
    pub(crate) keys: Vec<(RnsPoly, RnsPoly)>,
    pub(crate) decomposition_bits: u32,
}

impl RelinKeys {
    /// Number of gadget digits the keys cover.
    pub fn digit_count(&self) -> usize {
        self.keys.len()
    }

    /// True if the keys match `ctx` and cover every digit of the top level.
    pub fn is_well_formed(&self, ctx: &HeContext) -> bool {
        let top = ctx.top_level();
        self.decomposition_bits == ctx.decomposition_bits()
            && self.keys.len() >= ctx.decomposition_count()
            && self
                .keys
                .iter()
                .all(|(b, a)| ctx.poly_fits(b, top) && ctx.poly_fits(a, top))
    }
}

/// Expands a seed into a uniform polynomial modulo each prime.
pub(crate) fn uniform_from_seed(seed: &[u8; 32], n: usize, moduli: &[u64]) -> RnsPoly {
    let mut rng = ChaCha20Rng::from_seed(*seed);
    let residues = moduli
        .iter()
        .map(|&q| (0..n).map(|_| rng.gen_range(0..q)).collect())
        .collect();
    RnsPoly::from_residues(residues)
}
