//! Polynomials in residue number system (RNS) form.
//!
//! A polynomial modulo `Q = q_0 · … · q_l` is held as one coefficient
//! vector per prime. Dropping the trailing residues gives the same
//! polynomial at a lower level of the modulus chain.

use serde::{Deserialize, Serialize};

use super::modular::ModArith;
use super::ntt::NttContext;

/// RNS polynomial: `residues[i]` is the polynomial modulo `moduli[i]`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RnsPoly {
    residues: Vec<Vec<u64>>,
}

impl RnsPoly {
    /// All-zero polynomial of dimension `n` over `prime_count` primes.
    pub fn zero(n: usize, prime_count: usize) -> Self {
        Self {
            residues: vec![vec![0u64; n]; prime_count],
        }
    }

    /// Builds a polynomial from one residue vector per prime.
    pub fn from_residues(residues: Vec<Vec<u64>>) -> Self {
        Self { residues }
    }

    /// Lifts signed small coefficients (noise, ternary secrets) into every prime.
    pub fn from_signed(values: &[i64], moduli: &[u64]) -> Self {
        let residues = moduli
            .iter()
            .map(|&q| values.iter().map(|&v| ModArith::from_signed(v, q)).collect())
            .collect();
        Self { residues }
    }

    /// Lifts unsigned coefficients `< t` into every prime through the
    /// centered representative modulo `t`.
    pub fn from_centered_mod(values: &[u64], t: u64, moduli: &[u64]) -> Self {
        let signed: Vec<i64> = values.iter().map(|&v| ModArith::to_centered(v, t)).collect();
        Self::from_signed(&signed, moduli)
    }

    /// Number of primes the polynomial is held over.
    pub fn prime_count(&self) -> usize {
        self.residues.len()
    }

    /// Ring dimension, 0 for a polynomial with no residues.
    pub fn dimension(&self) -> usize {
        self.residues.first().map_or(0, Vec::len)
    }

    /// Coefficients modulo prime `i`.
    pub fn residue(&self, i: usize) -> &[u64] {
        &self.residues[i]
    }

    /// Mutable coefficients modulo prime `i`.
    pub fn residue_mut(&mut self, i: usize) -> &mut [u64] {
        &mut self.residues[i]
    }

    /// All residue vectors, one per prime.
    pub fn residues(&self) -> &[Vec<u64>] {
        &self.residues
    }

    /// Residues of coefficient `j` across all primes.
    pub fn coefficient(&self, j: usize) -> Vec<u64> {
        self.residues.iter().map(|r| r[j]).collect()
    }

    /// Keeps only the first `count` primes.
    pub fn truncate(&mut self, count: usize) {
        self.residues.truncate(count);
    }

    /// Copy keeping only the first `count` primes.
    pub fn truncated(&self, count: usize) -> Self {
        Self {
            residues: self.residues[..count.min(self.residues.len())].to_vec(),
        }
    }

    /// Removes and returns the residues of the last prime.
    pub fn pop_residue(&mut self) -> Option<Vec<u64>> {
        self.residues.pop()
    }

    /// Adds `other` coefficient-wise, modulo each prime in `moduli`.
    pub fn add_assign(&mut self, other: &Self, moduli: &[u64]) {
        for ((a, b), &q) in self.residues.iter_mut().zip(&other.residues).zip(moduli) {
            for (x, &y) in a.iter_mut().zip(b) {
                *x = ModArith::add(*x, y, q);
            }
        }
    }

    /// Subtracts `other` coefficient-wise.
    pub fn sub_assign(&mut self, other: &Self, moduli: &[u64]) {
        for ((a, b), &q) in self.residues.iter_mut().zip(&other.residues).zip(moduli) {
            for (x, &y) in a.iter_mut().zip(b) {
                *x = ModArith::sub(*x, y, q);
            }
        }
    }

    /// Negates every coefficient in place.
    pub fn negate(&mut self, moduli: &[u64]) {
        for (a, &q) in self.residues.iter_mut().zip(moduli) {
            for x in a.iter_mut() {
                *x = ModArith::negate(*x, q);
            }
        }
    }

    /// Forward NTT of every residue, one context per prime.
    pub fn forward(&mut self, contexts: &[NttContext]) {
        for (r, ctx) in self.residues.iter_mut().zip(contexts) {
            ctx.forward(r);
        }
    }

    /// Inverse NTT of every residue.
    pub fn inverse(&mut self, contexts: &[NttContext]) {
        for (r, ctx) in self.residues.iter_mut().zip(contexts) {
            ctx.inverse(r);
        }
    }

    /// `self ⊙ other` for two NTT-form polynomials.
    pub fn pointwise_mul(&self, other: &Self, contexts: &[NttContext]) -> Self {
        let residues = self
            .residues
            .iter()
            .zip(&other.residues)
            .zip(contexts)
            .map(|((a, b), ctx)| {
                let mut out = vec![0u64; a.len()];
                ctx.pointwise_mul(a, b, &mut out);
                out
            })
            .collect();
        Self { residues }
    }

    /// `self += a ⊙ b` for NTT-form polynomials.
    pub fn pointwise_mul_acc(&mut self, a: &Self, b: &Self, contexts: &[NttContext]) {
        for (((acc, x), y), ctx) in self
            .residues
            .iter_mut()
            .zip(&a.residues)
            .zip(&b.residues)
            .zip(contexts)
        {
            ctx.pointwise_mul_acc(acc, x, y);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signed_lift_and_negate() {
        let moduli = [65537u64, 786433];
        let mut p = RnsPoly::from_signed(&[1, -1, 0, 5], &moduli);
        assert_eq!(p.residue(0), &[1, 65536, 0, 5]);
        assert_eq!(p.residue(1), &[1, 786432, 0, 5]);
        p.negate(&moduli);
        assert_eq!(p.residue(0), &[65536, 1, 0, 65532]);
    }

    #[test]
    fn test_centered_lift_from_plain_modulus() {
        let t = 17u64;
        let moduli = [65537u64];
        let p = RnsPoly::from_centered_mod(&[16, 1, 9], t, &moduli);
        assert_eq!(p.residue(0), &[65536, 1, 65537 - 8]);
    }

    #[test]
    fn test_truncate_keeps_low_primes() {
        let moduli = [65537u64, 786433, 7340033];
        let p = RnsPoly::from_signed(&[3, -2], &moduli);
        let low = p.truncated(2);
        assert_eq!(low.prime_count(), 2);
        assert_eq!(low.residue(1), p.residue(1));
    }
}
