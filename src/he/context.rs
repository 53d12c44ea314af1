//! Precomputed state for one BFV parameter set.

use num_bigint::BigUint;
use num_traits::ToPrimitive;
use tracing::debug;

use crate::error::{Error, Result};
use crate::math::crt::{reduce_unsigned, CrtBasis};
use crate::math::{primes, GaussianSampler, NttContext, RnsPoly};
use crate::params::HeParams;

/// Bit size of the auxiliary primes used for exact tensoring.
const AUX_PRIME_BITS: u32 = 60;

/// Per-level precomputation. Level `l` uses primes `q_0..=q_l`.
#[derive(Clone, Debug)]
pub(crate) struct LevelData {
    /// CRT basis over `Q_l`.
    pub(crate) basis: CrtBasis,
    /// CRT basis over `Q_l` followed by every auxiliary prime.
    pub(crate) extended: CrtBasis,
    /// `floor(Q_l / t) mod q_i` for each prime of the level.
    pub(crate) delta: Vec<u64>,
}

/// Shared BFV context: modulus chain, NTT tables and CRT data.
///
/// Built once from [`HeParams`] and shared (behind an `Arc`) by every
/// encryptor, evaluator and encoder using the same parameters.
///
/// # Modulus chain
///
/// The ciphertext modulus is `Q = q_0 · … · q_k` with one NTT-friendly prime
/// per entry of `coeff_modulus_bits`. Modulus switching drops the last prime;
/// level `l` is the chain truncated to `q_0..=q_l`.
///
/// Ciphertext multiplication extends the residues to a set of auxiliary
/// 60-bit primes `P` with `P > 16·n·Q`, large enough to hold the exact
/// integer tensor product before scaling by `t/Q`.
#[derive(Clone, Debug)]
pub struct HeContext {
    n: usize,
    t: u64,
    moduli: Vec<u64>,
    ntt: Vec<NttContext>,
    plain_ntt: NttContext,
    aux_moduli: Vec<u64>,
    aux_ntt: Vec<NttContext>,
    levels: Vec<LevelData>,
    decomposition_bits: u32,
    sampler: GaussianSampler,
}

impl HeContext {
    /// Builds the context, generating the modulus chain deterministically.
    ///
    /// # Arguments
    ///
    /// * `params` - BFV parameters; the caller is expected to have validated
    ///   them as part of [`crate::params::PsiParams::validate`]
    ///
    /// # Errors
    ///
    /// `InvalidParams` when no suitable primes exist or a modulus is not
    /// NTT-friendly for the ring dimension.
    pub fn new(params: &HeParams) -> Result<Self> {
        let n = params.poly_modulus_degree;
        let t = params.plain_modulus;
        let invalid = |msg: &str| Error::InvalidParams(msg.to_string());

        let moduli = primes::coeff_modulus(n, &params.coeff_modulus_bits)
            .ok_or_else(|| invalid("could not generate coefficient primes"))?;
        let ntt = moduli
            .iter()
            .map(|&q| NttContext::new(n, q))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| invalid("coefficient prime is not NTT-friendly"))?;
        let plain_ntt =
            NttContext::new(n, t).ok_or_else(|| invalid("plain modulus does not support batching"))?;

        let q_bits: u32 = params.coeff_modulus_bits.iter().sum();
        let log_n = n.trailing_zeros();
        let aux_count = (q_bits + log_n + 4).div_ceil(AUX_PRIME_BITS - 1) as usize;
        let aux_moduli = primes::ntt_primes(AUX_PRIME_BITS, n, aux_count, &moduli)
            .ok_or_else(|| invalid("could not generate auxiliary primes"))?;
        let aux_ntt = aux_moduli
            .iter()
            .map(|&p| NttContext::new(n, p))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| invalid("auxiliary prime is not NTT-friendly"))?;

        let mut levels = Vec::with_capacity(moduli.len());
        for level in 0..moduli.len() {
            let chain = &moduli[..=level];
            let basis = CrtBasis::new(chain).ok_or_else(|| invalid("coefficient primes collide"))?;
            let mut extended_moduli = chain.to_vec();
            extended_moduli.extend_from_slice(&aux_moduli);
            let extended = CrtBasis::new(&extended_moduli)
                .ok_or_else(|| invalid("auxiliary primes collide with coefficient primes"))?;
            let delta_big: BigUint = basis.product() / BigUint::from(t);
            let delta = chain.iter().map(|&q| reduce_unsigned(&delta_big, q)).collect();
            levels.push(LevelData {
                basis,
                extended,
                delta,
            });
        }

        debug!(
            n,
            t,
            primes = moduli.len(),
            aux_primes = aux_moduli.len(),
            "built BFV context"
        );

        Ok(Self {
            n,
            t,
            moduli,
            ntt,
            plain_ntt,
            aux_moduli,
            aux_ntt,
            levels,
            decomposition_bits: params.decomposition_bits,
            sampler: GaussianSampler::new(params.sigma),
        })
    }

    /// Ring dimension, also the number of batching slots.
    pub fn n(&self) -> usize {
        self.n
    }

    /// Plaintext modulus `t`.
    pub fn plain_modulus(&self) -> u64 {
        self.t
    }

    /// Full coefficient modulus chain.
    pub fn moduli(&self) -> &[u64] {
        &self.moduli
    }

    /// Highest level; fresh ciphertexts live here.
    pub fn top_level(&self) -> usize {
        self.moduli.len() - 1
    }

    /// Primes still present at `level`.
    pub fn moduli_at(&self, level: usize) -> &[u64] {
        &self.moduli[..=level]
    }

    /// NTT tables for the primes at `level`.
    pub fn ntt_at(&self, level: usize) -> &[NttContext] {
        &self.ntt[..=level]
    }

    pub(crate) fn plain_ntt(&self) -> &NttContext {
        &self.plain_ntt
    }

    pub(crate) fn aux_moduli(&self) -> &[u64] {
        &self.aux_moduli
    }

    pub(crate) fn aux_ntt(&self) -> &[NttContext] {
        &self.aux_ntt
    }

    pub(crate) fn level_data(&self, level: usize) -> &LevelData {
        &self.levels[level]
    }

    pub(crate) fn sampler(&self) -> &GaussianSampler {
        &self.sampler
    }

    /// Digit width `w` of the relinearization gadget.
    pub fn decomposition_bits(&self) -> u32 {
        self.decomposition_bits
    }

    /// Number of base-`2^w` digits needed to cover the top-level modulus.
    pub fn decomposition_count(&self) -> usize {
        let q_bits = self.levels[self.top_level()].basis.product().bits();
        q_bits.div_ceil(self.decomposition_bits as u64) as usize
    }

    /// `log2(Q_l)` rounded down, for diagnostics.
    pub fn modulus_bits_at(&self, level: usize) -> usize {
        self.levels[level].basis.product().bits().to_usize().unwrap_or(0)
    }

    /// True if `poly` has `level + 1` reduced residues of length `n`.
    pub(crate) fn poly_fits(&self, poly: &RnsPoly, level: usize) -> bool {
        level <= self.top_level()
            && poly.prime_count() == level + 1
            && poly
                .residues()
                .iter()
                .zip(self.moduli_at(level))
                .all(|(r, &q)| r.len() == self.n && r.iter().all(|&c| c < q))
    }
}
