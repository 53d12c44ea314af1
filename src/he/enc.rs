//! Key generation, encryption and decryption.
//!
//! Encryption is symmetric: `c_1 = a` is uniform (expanded from a seed) and
//! `c_0 = -a·s + e + Δ·m` with `Δ = floor(Q/t)`.

use num_bigint::BigUint;
use num_traits::ToPrimitive;
use rand::{CryptoRng, Rng};

use crate::error::{backend_err, Result};
use crate::math::gaussian::sample_ternary;
use crate::math::{ModArith, RnsPoly};

use super::context::HeContext;
use super::types::{uniform_from_seed, Ciphertext, Plaintext, RelinKeys, SecretKey, SeededCiphertext};

impl HeContext {
    /// Samples a ternary secret key.
    pub fn generate_secret_key<R: Rng + CryptoRng>(&self, rng: &mut R) -> SecretKey {
        let top = self.top_level();
        let s = sample_ternary(self.n(), rng);
        let mut ntt = RnsPoly::from_signed(&s, self.moduli());
        ntt.forward(self.ntt_at(top));
        SecretKey { ntt }
    }

    /// Generates relinearization keys for `s²`.
    ///
    /// # Arguments
    ///
    /// * `sk` - Secret key the keys are bound to
    /// * `rng` - Randomness for the uniform masks and noise
    ///
    /// # Returns
    ///
    /// One key pair per base-`2^w` digit of the top-level modulus.
    pub fn generate_relin_keys<R: Rng + CryptoRng>(&self, sk: &SecretKey, rng: &mut R) -> RelinKeys {
        let top = self.top_level();
        let moduli = self.moduli();
        let ntts = self.ntt_at(top);
        let w = self.decomposition_bits() as u64;
        let s_squared = sk.ntt.pointwise_mul(&sk.ntt, ntts);

        let keys = (0..self.decomposition_count())
            .map(|digit| {
                // uniform values are uniform in Montgomery form too
                let a = RnsPoly::from_residues(
                    moduli
                        .iter()
                        .map(|&q| (0..self.n()).map(|_| rng.gen_range(0..q)).collect())
                        .collect(),
                );
                let noise = self.sampler().sample_vec(self.n(), rng);
                let mut b = RnsPoly::from_signed(&noise, moduli);
                b.forward(ntts);
                b.sub_assign(&a.pointwise_mul(&sk.ntt, ntts), moduli);

                for (i, &q) in moduli.iter().enumerate() {
                    let factor = ModArith::pow(2, w * digit as u64, q);
                    for (x, &s2) in b.residue_mut(i).iter_mut().zip(s_squared.residue(i)) {
                        *x = ModArith::mul_add(*x, s2, factor, q);
                    }
                }
                (b, a)
            })
            .collect();

        RelinKeys {
            keys,
            decomposition_bits: self.decomposition_bits(),
        }
    }

    /// Encrypts a plaintext under the secret key, returning the seeded form.
    ///
    /// # Arguments
    ///
    /// * `pt` - Plaintext with coefficients in `[0, t)`
    /// * `sk` - Secret key
    /// * `rng` - Randomness for the seed and the noise
    pub fn encrypt_symmetric<R: Rng + CryptoRng>(
        &self,
        pt: &Plaintext,
        sk: &SecretKey,
        rng: &mut R,
    ) -> SeededCiphertext {
        let top = self.top_level();
        let moduli = self.moduli();
        let ntts = self.ntt_at(top);

        let seed: [u8; 32] = rng.gen();
        let mut a_s = uniform_from_seed(&seed, self.n(), moduli);
        a_s.forward(ntts);
        let mut a_s = a_s.pointwise_mul(&sk.ntt, ntts);
        a_s.inverse(ntts);

        let mut c0 = self.scaled_message(pt, top);
        let noise = self.sampler().sample_vec(self.n(), rng);
        c0.add_assign(&RnsPoly::from_signed(&noise, moduli), moduli);
        c0.sub_assign(&a_s, moduli);

        SeededCiphertext { seed, c0 }
    }

    /// `Δ_l · m` lifted into every prime of `level`.
    pub(crate) fn scaled_message(&self, pt: &Plaintext, level: usize) -> RnsPoly {
        let delta = &self.level_data(level).delta;
        let residues = self
            .moduli_at(level)
            .iter()
            .zip(delta)
            .map(|(&q, &d)| pt.coeffs.iter().map(|&m| ModArith::mul(m, d, q)).collect())
            .collect();
        RnsPoly::from_residues(residues)
    }

    /// `c_0 + c_1·s + c_2·s² (mod Q_l)` in coefficient form.
    fn decryption_phase(&self, ct: &Ciphertext, sk: &SecretKey) -> RnsPoly {
        let level = ct.level();
        let ntts = self.ntt_at(level);
        let moduli = self.moduli_at(level);
        let s = sk.ntt.truncated(level + 1);

        let to_ntt = |poly: &RnsPoly| {
            let mut p = poly.clone();
            if !ct.is_ntt() {
                p.forward(ntts);
            }
            p
        };

        let mut acc = to_ntt(&ct.polys[0]);
        let mut s_power = s.clone();
        for component in &ct.polys[1..] {
            acc.pointwise_mul_acc(&to_ntt(component), &s_power, ntts);
            s_power = s_power.pointwise_mul(&s, ntts);
        }
        acc.inverse(ntts);
        debug_assert_eq!(acc.prime_count(), moduli.len());
        acc
    }

    /// Decrypts to the plaintext polynomial.
    ///
    /// # Errors
    ///
    /// `Backend` if the ciphertext does not match the context's ring.
    pub fn decrypt(&self, ct: &Ciphertext, sk: &SecretKey) -> Result<Plaintext> {
        if ct.ring_dim() != self.n() || ct.level() > self.top_level() {
            return Err(backend_err!("ciphertext does not belong to this context"));
        }
        let level = ct.level();
        let phase = self.decryption_phase(ct, sk);
        let q = self.level_data(level).basis.product();
        let t = BigUint::from(self.plain_modulus());
        let two_q: BigUint = q << 1usize;

        let coeffs = (0..self.n())
            .map(|j| {
                let x = self.level_data(level).basis.reconstruct(&phase.coefficient(j));
                // round(t·x / Q) mod t
                let rounded = (((&x * &t) << 1usize) + q) / &two_q;
                (rounded % &t).to_u64().unwrap_or(0)
            })
            .collect();
        Ok(Plaintext { coeffs })
    }

    /// Remaining noise budget in bits; decryption is correct while positive.
    pub fn noise_budget(&self, ct: &Ciphertext, sk: &SecretKey) -> u64 {
        let level = ct.level();
        let basis = &self.level_data(level).basis;
        let phase = self.decryption_phase(ct, sk);
        let t = self.plain_modulus();

        let q = basis.product();
        let half_q: BigUint = q >> 1usize;
        let max_noise_bits = (0..self.n())
            .map(|j| {
                let v = (basis.reconstruct(&phase.coefficient(j)) * t) % q;
                if v > half_q {
                    (q - v).bits()
                } else {
                    v.bits()
                }
            })
            .max()
            .unwrap_or(0);

        basis.product().bits().saturating_sub(max_noise_bits + 1)
    }
}
