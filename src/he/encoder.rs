//! SIMD batching: slot vectors over Z_t ↔ plaintext polynomials.
//!
//! With `t ≡ 1 (mod 2n)` the negacyclic NTT modulo `t` is a ring
//! isomorphism `Z_t[X]/(X^n + 1) → Z_t^n`, so slot `k` of a plaintext is its
//! `k`-th NTT evaluation and products of plaintexts multiply slot-wise.

use crate::error::{Error, Result};

use super::context::HeContext;
use super::types::Plaintext;

impl HeContext {
    /// Packs up to `n` slot values into a plaintext. Missing slots are zero.
    ///
    /// # Errors
    ///
    /// `EncodingOverflow` if more than `n` values are given or a value is
    /// not reduced modulo `t`.
    pub fn encode_slots(&self, slots: &[u64]) -> Result<Plaintext> {
        let n = self.n();
        let t = self.plain_modulus();
        if slots.len() > n {
            return Err(Error::EncodingOverflow {
                bit_length: slots.len(),
                capacity: n,
            });
        }
        if let Some(&bad) = slots.iter().find(|&&v| v >= t) {
            return Err(Error::EncodingOverflow {
                bit_length: (64 - bad.leading_zeros()) as usize,
                capacity: (63 - t.leading_zeros()) as usize,
            });
        }

        let ntt = self.plain_ntt();
        let mut coeffs: Vec<u64> = slots.iter().map(|&v| ntt.to_mont(v)).collect();
        coeffs.resize(n, 0);
        ntt.inverse(&mut coeffs);
        Ok(Plaintext { coeffs })
    }

    /// Unpacks the `n` slot values of a plaintext.
    pub fn decode_slots(&self, pt: &Plaintext) -> Vec<u64> {
        let ntt = self.plain_ntt();
        let mut values = pt.coeffs.clone();
        values.resize(self.n(), 0);
        ntt.forward(&mut values);
        values.into_iter().map(|v| ntt.from_mont(v)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::ModArith;
    use crate::params::PsiParams;

    fn context() -> HeContext {
        HeContext::new(&PsiParams::small_test().he).unwrap()
    }

    #[test]
    fn test_slot_roundtrip() {
        let ctx = context();
        let slots: Vec<u64> = (0..ctx.n() as u64).map(|i| (i * 977 + 5) % 65537).collect();
        let pt = ctx.encode_slots(&slots).unwrap();
        assert_eq!(ctx.decode_slots(&pt), slots);
    }

    #[test]
    fn test_short_input_is_zero_padded() {
        let ctx = context();
        let pt = ctx.encode_slots(&[7, 8]).unwrap();
        let decoded = ctx.decode_slots(&pt);
        assert_eq!(&decoded[..2], &[7, 8]);
        assert!(decoded[2..].iter().all(|&v| v == 0));
    }

    #[test]
    fn test_constant_slots_encode_to_constant_polynomial() {
        let ctx = context();
        let pt = ctx.encode_slots(&vec![42; ctx.n()]).unwrap();
        assert_eq!(pt.coeffs[0], 42);
        assert!(pt.coeffs[1..].iter().all(|&c| c == 0));
    }

    #[test]
    fn test_products_are_slotwise() {
        let ctx = context();
        let t = ctx.plain_modulus();
        let a: Vec<u64> = (0..ctx.n() as u64).map(|i| i + 1).collect();
        let b: Vec<u64> = (0..ctx.n() as u64).map(|i| 3 * i + 2).collect();
        let pa = ctx.encode_slots(&a).unwrap();
        let pb = ctx.encode_slots(&b).unwrap();

        let ntt = ctx.plain_ntt();
        let (mut fa, mut fb) = (pa.coeffs.clone(), pb.coeffs.clone());
        ntt.forward(&mut fa);
        ntt.forward(&mut fb);
        let mut prod = vec![0u64; ctx.n()];
        ntt.pointwise_mul(&fa, &fb, &mut prod);
        ntt.inverse(&mut prod);

        let expected: Vec<u64> = a.iter().zip(&b).map(|(&x, &y)| ModArith::mul(x, y, t)).collect();
        assert_eq!(ctx.decode_slots(&Plaintext { coeffs: prod }), expected);
    }

    #[test]
    fn test_rejects_unreduced_values() {
        let ctx = context();
        assert!(matches!(
            ctx.encode_slots(&[65537]),
            Err(Error::EncodingOverflow { .. })
        ));
        assert!(ctx.encode_slots(&vec![0; ctx.n() + 1]).is_err());
    }
}
