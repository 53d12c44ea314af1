//! CRT (Chinese Remainder Theorem) helpers over an RNS basis.
//!
//! Reconstruction goes through `num-bigint` since products of several
//! 60-bit primes do not fit any machine word.

use num_bigint::{BigInt, BigUint, Sign};
use num_traits::{One, ToPrimitive, Zero};

/// Compute a modular inverse using the extended Euclidean algorithm.
///
/// Returns `x` such that `(a * x) % modulus == 1`, or `None` when `a` is
/// not invertible.
pub fn mod_inverse(a: u64, modulus: u64) -> Option<u64> {
    let mut t: i128 = 0;
    let mut new_t: i128 = 1;
    let mut r: i128 = modulus as i128;
    let mut new_r: i128 = a as i128;

    while new_r != 0 {
        let quotient = r / new_r;
        (t, new_t) = (new_t, t - quotient * new_t);
        (r, new_r) = (new_r, r - quotient * new_r);
    }

    if r != 1 {
        return None;
    }
    if t < 0 {
        t += modulus as i128;
    }
    Some(t as u64)
}

/// Precomputed reconstruction data for a set of pairwise coprime moduli.
#[derive(Clone, Debug)]
pub struct CrtBasis {
    moduli: Vec<u64>,
    product: BigUint,
    half: BigUint,
    /// `(M / m_i) * ((M / m_i)^-1 mod m_i)` for every modulus.
    lagrange: Vec<BigUint>,
}

impl CrtBasis {
    /// Builds the basis. Returns `None` if the moduli are not coprime.
    pub fn new(moduli: &[u64]) -> Option<Self> {
        let product = moduli
            .iter()
            .fold(BigUint::one(), |acc, &m| acc * BigUint::from(m));
        let mut lagrange = Vec::with_capacity(moduli.len());
        for &m in moduli {
            let cofactor = &product / BigUint::from(m);
            let residue = (&cofactor % BigUint::from(m)).to_u64()?;
            let inv = mod_inverse(residue, m)?;
            lagrange.push(cofactor * BigUint::from(inv));
        }
        let half = &product >> 1usize;
        Some(Self {
            moduli: moduli.to_vec(),
            product,
            half,
            lagrange,
        })
    }

    /// Moduli of the basis, in order.
    pub fn moduli(&self) -> &[u64] {
        &self.moduli
    }

    /// Product of all moduli.
    pub fn product(&self) -> &BigUint {
        &self.product
    }

    /// Reconstructs the value in `[0, M)` from one residue per modulus.
    pub fn reconstruct(&self, residues: &[u64]) -> BigUint {
        debug_assert_eq!(residues.len(), self.moduli.len());
        let acc = residues
            .iter()
            .zip(&self.lagrange)
            .fold(BigUint::zero(), |acc, (&r, l)| acc + l * BigUint::from(r));
        acc % &self.product
    }

    /// Reconstructs the centered representative in `(-M/2, M/2]`.
    pub fn reconstruct_centered(&self, residues: &[u64]) -> BigInt {
        let value = self.reconstruct(residues);
        if value > self.half {
            BigInt::from_biguint(Sign::Minus, &self.product - value)
        } else {
            BigInt::from_biguint(Sign::Plus, value)
        }
    }
}

/// Reduces a signed big integer into `[0, m)`.
pub fn reduce_signed(value: &BigInt, m: u64) -> u64 {
    let modulus = BigUint::from(m);
    let magnitude = (value.magnitude() % &modulus).to_u64().unwrap_or(0);
    if value.sign() == Sign::Minus && magnitude != 0 {
        m - magnitude
    } else {
        magnitude
    }
}

/// Reduces an unsigned big integer into `[0, m)`.
pub fn reduce_unsigned(value: &BigUint, m: u64) -> u64 {
    (value % BigUint::from(m)).to_u64().unwrap_or(0)
}
