//! Number-Theoretic Transform (NTT) over Z_p[X]/(X^n + 1).
//!
//! Cooley-Tukey forward / Gentleman-Sande inverse transforms for negacyclic
//! convolution, with Montgomery multiplication in the butterflies.
//!
//! One context serves one prime. Ciphertext residues use one context per
//! RNS prime; the plaintext modulus gets its own context for batching, where
//! the transform doubles as the slot isomorphism `Z_t[X]/(X^n + 1) ≅ Z_t^n`.
//!
//! # Montgomery convention
//!
//! [`NttContext::forward`] takes standard-form coefficients and produces
//! evaluations in Montgomery form. [`NttContext::inverse`] takes Montgomery
//! form evaluations and returns standard-form coefficients. Pointwise
//! products of two forward outputs stay in Montgomery form, so
//! `inverse(forward(a) ⊙ forward(b)) = a·b mod (X^n + 1)`.

use super::modular::ModArith;

/// Precomputed twiddle factors and Montgomery constants for one prime.
#[derive(Clone, Debug)]
pub struct NttContext {
    n: usize,
    p: u64,
    /// `-p^-1 mod 2^64`
    p_inv_neg: u64,
    /// `2^128 mod p`
    r_squared: u64,
    /// Powers of ψ in bit-reversed order, Montgomery form.
    psi_powers: Vec<u64>,
    /// Powers of ψ^-1 in bit-reversed order, Montgomery form.
    psi_inv_powers: Vec<u64>,
    /// `n^-1 mod p`, standard form.
    n_inv: u64,
}

impl NttContext {
    /// Creates a context for dimension `n` and prime `p`.
    ///
    /// Returns `None` unless `n` is a power of two (at least 2) and
    /// `p ≡ 1 (mod 2n)` is a prime below `2^62`.
    pub fn new(n: usize, p: u64) -> Option<Self> {
        if n < 2 || !n.is_power_of_two() || p >= (1 << 62) || p % (2 * n as u64) != 1 {
            return None;
        }

        let p_inv_neg = Self::compute_p_inv_neg(p);
        let r_squared = Self::compute_r_squared(p);

        let psi = Self::find_primitive_root(2 * n as u64, p)?;
        let psi_inv = ModArith::inv(psi, p)?;
        let n_inv = ModArith::inv(n as u64, p)?;

        let mont = |a: u64| Self::montgomery_reduce((a as u128) * (r_squared as u128), p, p_inv_neg);
        let psi_powers = Self::bit_reversed_powers(n, psi, p).into_iter().map(mont).collect();
        let psi_inv_powers = Self::bit_reversed_powers(n, psi_inv, p)
            .into_iter()
            .map(mont)
            .collect();

        Some(Self {
            n,
            p,
            p_inv_neg,
            r_squared,
            psi_powers,
            psi_inv_powers,
            n_inv,
        })
    }

    /// Returns the ring dimension.
    ///
    /// # Returns
    ///
    /// The transform length n.
    pub fn dimension(&self) -> usize {
        self.n
    }

    /// Returns the prime p of this context.
    pub fn modulus(&self) -> u64 {
        self.p
    }

    /// Forward transform in-place. Input in standard form, output in
    /// Montgomery form.
    ///
    /// # Panics
    ///
    /// Panics if `coeffs.len() != n`.
    pub fn forward(&self, coeffs: &mut [u64]) {
        assert_eq!(coeffs.len(), self.n, "input length must match dimension");
        for c in coeffs.iter_mut() {
            *c = self.to_mont(*c);
        }
        self.forward_butterflies(coeffs);
    }

    fn forward_butterflies(&self, coeffs: &mut [u64]) {
        let n = self.n;
        let p = self.p;

        let mut t = n;
        let mut m = 1;
        while m < n {
            t >>= 1;
            for i in 0..m {
                let j1 = 2 * i * t;
                let w = self.psi_powers[m + i];
                for j in j1..j1 + t {
                    let u = coeffs[j];
                    let v = self.mont_mul(coeffs[j + t], w);
                    coeffs[j] = ModArith::add(u, v, p);
                    coeffs[j + t] = ModArith::sub(u, v, p);
                }
            }
            m <<= 1;
        }
    }

    /// Inverse transform in-place. Input in Montgomery form, output in
    /// standard form.
    ///
    /// # Panics
    ///
    /// Panics if `coeffs.len() != n`.
    pub fn inverse(&self, coeffs: &mut [u64]) {
        assert_eq!(coeffs.len(), self.n, "input length must match dimension");
        let n = self.n;
        let p = self.p;

        let mut t = 1;
        let mut m = n;
        while m > 1 {
            m >>= 1;
            for i in 0..m {
                let j1 = 2 * i * t;
                let w = self.psi_inv_powers[m + i];
                for j in j1..j1 + t {
                    let u = coeffs[j];
                    let v = coeffs[j + t];
                    coeffs[j] = ModArith::add(u, v, p);
                    coeffs[j + t] = self.mont_mul(ModArith::sub(u, v, p), w);
                }
            }
            t <<= 1;
        }

        // scale by n^-1 and leave Montgomery form in one multiplication
        for c in coeffs.iter_mut() {
            *c = self.mont_mul(*c, self.n_inv);
        }
    }

    /// Pointwise product of two Montgomery-form vectors.
    pub fn pointwise_mul(&self, a: &[u64], b: &[u64], out: &mut [u64]) {
        debug_assert!(a.len() == self.n && b.len() == self.n && out.len() == self.n);
        for ((o, &x), &y) in out.iter_mut().zip(a).zip(b) {
            *o = self.mont_mul(x, y);
        }
    }

    /// `acc += a ⊙ b`, all Montgomery form.
    pub fn pointwise_mul_acc(&self, acc: &mut [u64], a: &[u64], b: &[u64]) {
        debug_assert!(a.len() == self.n && b.len() == self.n && acc.len() == self.n);
        for ((o, &x), &y) in acc.iter_mut().zip(a).zip(b) {
            *o = ModArith::add(*o, self.mont_mul(x, y), self.p);
        }
    }

    /// Montgomery product `a·b·R^-1 mod p`.
    #[inline]
    pub fn mont_mul(&self, a: u64, b: u64) -> u64 {
        Self::montgomery_reduce((a as u128) * (b as u128), self.p, self.p_inv_neg)
    }

    /// Converts `a` to Montgomery form.
    #[inline]
    pub fn to_mont(&self, a: u64) -> u64 {
        self.mont_mul(a % self.p, self.r_squared)
    }

    /// Converts `a` out of Montgomery form.
    #[inline]
    pub fn from_mont(&self, a: u64) -> u64 {
        self.mont_mul(a, 1)
    }

    #[inline]
    fn montgomery_reduce(ab: u128, p: u64, p_inv_neg: u64) -> u64 {
        let m = ((ab as u64).wrapping_mul(p_inv_neg)) as u128;
        let t = ((ab + m * (p as u128)) >> 64) as u64;
        if t >= p {
            t - p
        } else {
            t
        }
    }

    fn compute_p_inv_neg(p: u64) -> u64 {
        // Newton iteration for p^-1 mod 2^64, doubling correct bits each round
        let mut inv: u64 = 1;
        for _ in 0..6 {
            inv = inv.wrapping_mul(2u64.wrapping_sub(p.wrapping_mul(inv)));
        }
        inv.wrapping_neg()
    }

    fn compute_r_squared(p: u64) -> u64 {
        let r_mod_p = (1u128 << 64) % (p as u128);
        ((r_mod_p * r_mod_p) % (p as u128)) as u64
    }

    /// Primitive `order`-th root of unity: ψ with ψ^order = 1, ψ^(order/2) ≠ 1.
    fn find_primitive_root(order: u64, p: u64) -> Option<u64> {
        let exp = (p - 1) / order;
        (2..p).map(|g| ModArith::pow(g, exp, p)).find(|&candidate| {
            ModArith::pow(candidate, order / 2, p) == p - 1
        })
    }

    /// `out[i] = base^bitrev(i)` over `log2(n)` bits.
    fn bit_reversed_powers(n: usize, base: u64, p: u64) -> Vec<u64> {
        let log_n = n.trailing_zeros();
        let mut out = vec![0u64; n];
        let mut pow = 1u64;
        let mut plain = vec![0u64; n];
        for slot in plain.iter_mut() {
            *slot = pow;
            pow = ModArith::mul(pow, base, p);
        }
        for (i, entry) in out.iter_mut().enumerate() {
            let rev = (i as u64).reverse_bits() >> (64 - log_n);
            *entry = plain[rev as usize];
        }
        out
    }
}
