//! Homomorphic operations.
//!
//! None of these functions spawn parallel work: they run on whichever
//! thread calls them, so they are safe to call from workers that are
//! themselves spinning inside a thread pool.

use num_bigint::{BigInt, BigUint};
use num_traits::ToPrimitive;

use crate::error::{backend_err, Result};
use crate::math::crt::reduce_signed;
use crate::math::{mod_inverse, ModArith, NttContext, RnsPoly};

use super::context::HeContext;
use super::types::{Ciphertext, NttPlaintext, Plaintext, RelinKeys};

impl HeContext {
    /// Two-component zero ciphertext at `level`.
    pub fn zero_ciphertext(&self, level: usize, is_ntt: bool) -> Ciphertext {
        let poly = RnsPoly::zero(self.n(), level + 1);
        Ciphertext::from_parts(vec![poly.clone(), poly], is_ntt)
    }

    fn check_compatible(a: &Ciphertext, b: &Ciphertext) -> Result<()> {
        if a.level() != b.level() {
            return Err(backend_err!("level mismatch: {} vs {}", a.level(), b.level()));
        }
        if a.is_ntt() != b.is_ntt() {
            return Err(backend_err!("operands are in different forms"));
        }
        Ok(())
    }

    /// `a += b`. Operands may differ in size; the result takes the larger.
    pub fn add_assign(&self, a: &mut Ciphertext, b: &Ciphertext) -> Result<()> {
        Self::check_compatible(a, b)?;
        let moduli = self.moduli_at(a.level());
        while a.polys.len() < b.polys.len() {
            a.polys.push(RnsPoly::zero(self.n(), a.level() + 1));
        }
        for (x, y) in a.polys.iter_mut().zip(&b.polys) {
            x.add_assign(y, moduli);
        }
        Ok(())
    }

    /// Returns `a + b`.
    ///
    /// # Errors
    ///
    /// `Backend` if the operands differ in level or form.
    pub fn add(&self, a: &Ciphertext, b: &Ciphertext) -> Result<Ciphertext> {
        let mut out = a.clone();
        self.add_assign(&mut out, b)?;
        Ok(out)
    }

    /// `ct += Δ·m`. The ciphertext must be in coefficient form.
    pub fn add_plain_assign(&self, ct: &mut Ciphertext, pt: &Plaintext) -> Result<()> {
        if ct.is_ntt() {
            return Err(backend_err!("add_plain needs a coefficient-form ciphertext"));
        }
        let level = ct.level();
        let scaled = self.scaled_message(pt, level);
        ct.polys[0].add_assign(&scaled, self.moduli_at(level));
        Ok(())
    }

    /// Moves `ct` into NTT form. No-op if it already is.
    pub fn transform_to_ntt(&self, ct: &mut Ciphertext) {
        if ct.is_ntt {
            return;
        }
        let ntts = self.ntt_at(ct.level());
        for poly in &mut ct.polys {
            poly.forward(ntts);
        }
        ct.is_ntt = true;
    }

    /// Moves `ct` into coefficient form. No-op if it already is.
    pub fn transform_from_ntt(&self, ct: &mut Ciphertext) {
        if !ct.is_ntt {
            return;
        }
        let ntts = self.ntt_at(ct.level());
        for poly in &mut ct.polys {
            poly.inverse(ntts);
        }
        ct.is_ntt = false;
    }

    /// Lifts a plaintext (centered modulo `t`) into every top-level prime and
    /// transforms it for plaintext-ciphertext products.
    pub fn plaintext_to_ntt(&self, pt: &Plaintext) -> NttPlaintext {
        let mut poly = RnsPoly::from_centered_mod(&pt.coeffs, self.plain_modulus(), self.moduli());
        poly.forward(self.ntt_at(self.top_level()));
        NttPlaintext { poly }
    }

    /// `acc += ct ⊙ pt`, everything in NTT form.
    pub fn multiply_plain_acc(
        &self,
        acc: &mut Ciphertext,
        ct: &Ciphertext,
        pt: &NttPlaintext,
    ) -> Result<()> {
        Self::check_compatible(acc, ct)?;
        if !ct.is_ntt() {
            return Err(backend_err!("multiply_plain needs NTT-form ciphertexts"));
        }
        let ntts = self.ntt_at(ct.level());
        while acc.polys.len() < ct.polys.len() {
            acc.polys.push(RnsPoly::zero(self.n(), acc.level() + 1));
        }
        for (sum, poly) in acc.polys.iter_mut().zip(&ct.polys) {
            sum.pointwise_mul_acc(poly, &pt.poly, ntts);
        }
        Ok(())
    }

    /// `ct ⊙ pt`, NTT form in and out.
    pub fn multiply_plain(&self, ct: &Ciphertext, pt: &NttPlaintext) -> Result<Ciphertext> {
        let mut out = self.zero_ciphertext(ct.level(), true);
        self.multiply_plain_acc(&mut out, ct, pt)?;
        Ok(out)
    }

    /// Context for prime `idx` of the extended basis at `level`.
    fn extended_ntt(&self, level: usize, idx: usize) -> &NttContext {
        if idx <= level {
            &self.ntt_at(level)[idx]
        } else {
            &self.aux_ntt()[idx - level - 1]
        }
    }

    /// Residues of `poly` (mod `Q_l`) over `Q_l ∪ P`, through the centered
    /// representative.
    fn extend_basis(&self, poly: &RnsPoly, level: usize) -> Vec<Vec<u64>> {
        let basis = &self.level_data(level).basis;
        let mut residues: Vec<Vec<u64>> = poly.residues().to_vec();
        let mut aux: Vec<Vec<u64>> = vec![Vec::with_capacity(self.n()); self.aux_moduli().len()];
        for j in 0..self.n() {
            let centered = basis.reconstruct_centered(&poly.coefficient(j));
            for (dst, &p) in aux.iter_mut().zip(self.aux_moduli()) {
                dst.push(reduce_signed(&centered, p));
            }
        }
        residues.extend(aux);
        residues
    }

    /// Ciphertext-ciphertext product without relinearization.
    ///
    /// Computes the tensor `(a_0 b_0, a_0 b_1 + a_1 b_0, a_1 b_1)` exactly
    /// over `Q_l·P`, then scales by `t/Q_l` with rounding.
    ///
    /// # Arguments
    ///
    /// * `a`, `b` - Two-component coefficient-form ciphertexts, same level
    ///
    /// # Returns
    ///
    /// A three-component coefficient-form ciphertext at the same level.
    pub fn multiply(&self, a: &Ciphertext, b: &Ciphertext) -> Result<Ciphertext> {
        Self::check_compatible(a, b)?;
        if a.is_ntt() || a.size() != 2 || b.size() != 2 {
            return Err(backend_err!(
                "multiply needs two-component coefficient-form ciphertexts"
            ));
        }
        let level = a.level();
        let data = self.level_data(level);
        let extended_count = level + 1 + self.aux_moduli().len();

        let [a0, a1, b0, b1] = [&a.polys[0], &a.polys[1], &b.polys[0], &b.polys[1]]
            .map(|p| self.extend_basis(p, level));

        let mut tensor: [Vec<Vec<u64>>; 3] = Default::default();
        for idx in 0..extended_count {
            let ctx = self.extended_ntt(level, idx);
            let n = self.n();
            let mut fa0 = a0[idx].clone();
            let mut fa1 = a1[idx].clone();
            let mut fb0 = b0[idx].clone();
            let mut fb1 = b1[idx].clone();
            for v in [&mut fa0, &mut fa1, &mut fb0, &mut fb1] {
                ctx.forward(v);
            }

            let mut e0 = vec![0u64; n];
            let mut e1 = vec![0u64; n];
            let mut e2 = vec![0u64; n];
            ctx.pointwise_mul(&fa0, &fb0, &mut e0);
            ctx.pointwise_mul(&fa0, &fb1, &mut e1);
            ctx.pointwise_mul_acc(&mut e1, &fa1, &fb0);
            ctx.pointwise_mul(&fa1, &fb1, &mut e2);

            for (slot, mut e) in tensor.iter_mut().zip([e0, e1, e2]) {
                ctx.inverse(&mut e);
                slot.push(e);
            }
        }

        let q = data.basis.product();
        let t = BigUint::from(self.plain_modulus());
        let two_q: BigUint = q << 1usize;
        let chain = self.moduli_at(level);

        let polys = tensor
            .iter()
            .map(|residues| {
                let mut out = vec![Vec::with_capacity(self.n()); chain.len()];
                for j in 0..self.n() {
                    let column: Vec<u64> = residues.iter().map(|r| r[j]).collect();
                    let x = data.extended.reconstruct_centered(&column);
                    // round(t·x / Q), magnitude first, sign after
                    let magnitude = (((x.magnitude() * &t) << 1usize) + q) / &two_q;
                    let scaled = BigInt::from_biguint(x.sign(), magnitude);
                    for (dst, &qi) in out.iter_mut().zip(chain) {
                        dst.push(reduce_signed(&scaled, qi));
                    }
                }
                RnsPoly::from_residues(out)
            })
            .collect();

        Ok(Ciphertext::from_parts(polys, false))
    }

    /// Folds the `s²` component back into two components.
    ///
    /// # Arguments
    ///
    /// * `ct` - Coefficient-form ciphertext with two or three components
    /// * `rk` - Relinearization keys from the same secret key
    pub fn relinearize(&self, ct: &Ciphertext, rk: &RelinKeys) -> Result<Ciphertext> {
        match ct.size() {
            2 => return Ok(ct.clone()),
            3 => {}
            other => return Err(backend_err!("cannot relinearize {other} components")),
        }
        if ct.is_ntt() {
            return Err(backend_err!("relinearize needs a coefficient-form ciphertext"));
        }
        let level = ct.level();
        let basis = &self.level_data(level).basis;
        let moduli = self.moduli_at(level);
        let ntts = self.ntt_at(level);
        let w = rk.decomposition_bits as usize;
        let digit_count = (basis.product().bits() as usize).div_ceil(w);
        if digit_count > rk.keys.len() || rk.keys.is_empty() {
            return Err(backend_err!(
                "relinearization keys cover {} digits, {} needed",
                rk.keys.len(),
                digit_count
            ));
        }

        let mask = (BigUint::from(1u8) << w) - BigUint::from(1u8);
        let mut digits = vec![vec![0u64; self.n()]; digit_count];
        for j in 0..self.n() {
            let mut x = basis.reconstruct(&ct.polys[2].coefficient(j));
            for digit in digits.iter_mut() {
                digit[j] = (&x & &mask).to_u64().unwrap_or(0);
                x >>= w;
            }
        }

        let mut acc0 = RnsPoly::zero(self.n(), level + 1);
        let mut acc1 = RnsPoly::zero(self.n(), level + 1);
        for (digit, (b, a)) in digits.iter().zip(&rk.keys) {
            let mut d = RnsPoly::from_residues(
                moduli
                    .iter()
                    .map(|&q| digit.iter().map(|&v| v % q).collect())
                    .collect(),
            );
            d.forward(ntts);
            acc0.pointwise_mul_acc(&d, b, ntts);
            acc1.pointwise_mul_acc(&d, a, ntts);
        }
        acc0.inverse(ntts);
        acc1.inverse(ntts);

        let mut c0 = ct.polys[0].clone();
        let mut c1 = ct.polys[1].clone();
        c0.add_assign(&acc0, moduli);
        c1.add_assign(&acc1, moduli);
        Ok(Ciphertext::from_parts(vec![c0, c1], false))
    }

    /// `relinearize(multiply(a, b))`.
    pub fn multiply_relin(
        &self,
        a: &Ciphertext,
        b: &Ciphertext,
        rk: &RelinKeys,
    ) -> Result<Ciphertext> {
        let product = self.multiply(a, b)?;
        self.relinearize(&product, rk)
    }

    /// Drops the last prime of the chain, scaling the ciphertext by
    /// `1/q_l` with rounding.
    pub fn mod_switch_to_next(&self, ct: &mut Ciphertext) -> Result<()> {
        if ct.is_ntt() {
            return Err(backend_err!("mod switching needs a coefficient-form ciphertext"));
        }
        let level = ct.level();
        if level == 0 {
            return Err(backend_err!("ciphertext is already at the lowest level"));
        }
        let q_last = self.moduli()[level];
        let chain = self.moduli_at(level - 1);
        let inverses = chain
            .iter()
            .map(|&q| mod_inverse(q_last % q, q))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| backend_err!("coefficient primes are not coprime"))?;

        for poly in &mut ct.polys {
            let Some(last) = poly.pop_residue() else {
                return Err(backend_err!("empty ciphertext component"));
            };
            for (i, (&q, &inv)) in chain.iter().zip(&inverses).enumerate() {
                for (c, &r) in poly.residue_mut(i).iter_mut().zip(&last) {
                    // subtract the centered remainder modulo q_last
                    let shifted = if r > q_last / 2 {
                        ModArith::add(*c, (q_last - r) % q, q)
                    } else {
                        ModArith::sub(*c, r % q, q)
                    };
                    *c = ModArith::mul(shifted, inv, q);
                }
            }
        }
        Ok(())
    }

    /// Drops primes from `ct` until it sits at `level`.
    pub fn mod_switch_to_level(&self, ct: &mut Ciphertext, level: usize) -> Result<()> {
        while ct.level() > level {
            self.mod_switch_to_next(ct)?;
        }
        Ok(())
    }

    /// Drops to level 0, the smallest ciphertext that still decrypts.
    pub fn mod_switch_to_last(&self, ct: &mut Ciphertext) -> Result<()> {
        self.mod_switch_to_level(ct, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::he::SecretKey;
    use crate::params::PsiParams;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha20Rng;

    struct Fixture {
        ctx: HeContext,
        sk: SecretKey,
        rk: RelinKeys,
        rng: ChaCha20Rng,
    }

    fn fixture() -> Fixture {
        let params = PsiParams::small_test();
        let ctx = HeContext::new(&params.he).unwrap();
        let mut rng = ChaCha20Rng::seed_from_u64(99);
        let sk = ctx.generate_secret_key(&mut rng);
        let rk = ctx.generate_relin_keys(&sk, &mut rng);
        Fixture { ctx, sk, rk, rng }
    }

    fn random_slots(n: usize, t: u64, rng: &mut ChaCha20Rng) -> Vec<u64> {
        (0..n).map(|_| rng.gen_range(0..t)).collect()
    }

    fn encrypt_slots(f: &mut Fixture, slots: &[u64]) -> Ciphertext {
        let pt = f.ctx.encode_slots(slots).unwrap();
        f.ctx.encrypt_symmetric(&pt, &f.sk, &mut f.rng).expand(&f.ctx)
    }

    fn decrypt_slots(f: &Fixture, ct: &Ciphertext) -> Vec<u64> {
        f.ctx.decode_slots(&f.ctx.decrypt(ct, &f.sk).unwrap())
    }

    #[test]
    fn test_add_and_add_plain() {
        let mut f = fixture();
        let t = f.ctx.plain_modulus();
        let n = f.ctx.n();
        let x = random_slots(n, t, &mut f.rng);
        let y = random_slots(n, t, &mut f.rng);
        let cx = encrypt_slots(&mut f, &x);
        let cy = encrypt_slots(&mut f, &y);

        let mut sum = f.ctx.add(&cx, &cy).unwrap();
        let py = f.ctx.encode_slots(&y).unwrap();
        f.ctx.add_plain_assign(&mut sum, &py).unwrap();

        let expected: Vec<u64> = x
            .iter()
            .zip(&y)
            .map(|(&a, &b)| ModArith::add(a, ModArith::add(b, b, t), t))
            .collect();
        assert_eq!(decrypt_slots(&f, &sum), expected);
    }

    #[test]
    fn test_multiply_plain_in_ntt_form() {
        let mut f = fixture();
        let t = f.ctx.plain_modulus();
        let n = f.ctx.n();
        let x = random_slots(n, t, &mut f.rng);
        let y = random_slots(n, t, &mut f.rng);
        let mut cx = encrypt_slots(&mut f, &x);
        f.ctx.transform_to_ntt(&mut cx);
        let py = f.ctx.plaintext_to_ntt(&f.ctx.encode_slots(&y).unwrap());

        let mut prod = f.ctx.multiply_plain(&cx, &py).unwrap();
        f.ctx.transform_from_ntt(&mut prod);

        let expected: Vec<u64> = x.iter().zip(&y).map(|(&a, &b)| ModArith::mul(a, b, t)).collect();
        assert_eq!(decrypt_slots(&f, &prod), expected);
    }

    #[test]
    fn test_multiply_then_relinearize() {
        let mut f = fixture();
        let t = f.ctx.plain_modulus();
        let n = f.ctx.n();
        let x = random_slots(n, t, &mut f.rng);
        let y = random_slots(n, t, &mut f.rng);
        let cx = encrypt_slots(&mut f, &x);
        let cy = encrypt_slots(&mut f, &y);
        let expected: Vec<u64> = x.iter().zip(&y).map(|(&a, &b)| ModArith::mul(a, b, t)).collect();

        let product = f.ctx.multiply(&cx, &cy).unwrap();
        assert_eq!(product.size(), 3);
        assert_eq!(decrypt_slots(&f, &product), expected);

        let relin = f.ctx.relinearize(&product, &f.rk).unwrap();
        assert_eq!(relin.size(), 2);
        assert_eq!(decrypt_slots(&f, &relin), expected);
        assert!(f.ctx.noise_budget(&relin, &f.sk) > 40);
    }

    #[test]
    fn test_mod_switch_preserves_message() {
        let mut f = fixture();
        let t = f.ctx.plain_modulus();
        let n = f.ctx.n();
        let x = random_slots(n, t, &mut f.rng);
        let cx = encrypt_slots(&mut f, &x);
        let mut squared = f.ctx.multiply_relin(&cx, &cx, &f.rk).unwrap();

        f.ctx.mod_switch_to_last(&mut squared).unwrap();
        assert_eq!(squared.level(), 0);
        let expected: Vec<u64> = x.iter().map(|&a| ModArith::mul(a, a, t)).collect();
        assert_eq!(decrypt_slots(&f, &squared), expected);
        assert!(f.ctx.mod_switch_to_next(&mut squared).is_err());
    }

    #[test]
    fn test_rejects_mixed_forms() {
        let mut f = fixture();
        let zeros = vec![0u64; f.ctx.n()];
        let a = encrypt_slots(&mut f, &zeros);
        let mut b = a.clone();
        f.ctx.transform_to_ntt(&mut b);
        assert!(f.ctx.add(&a, &b).is_err());
        assert!(f.ctx.multiply(&b, &b).is_err());
    }
}
