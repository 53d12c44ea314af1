//! NTT-friendly prime generation.
//!
//! The ciphertext modulus is a product of primes `q ≡ 1 (mod 2n)`, generated
//! deterministically from bit sizes so that sender and receiver derive the
//! same modulus chain from the same parameters.

use super::modular::ModArith;

const WITNESSES: [u64; 12] = [2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37];

/// Deterministic Miller-Rabin test, exact for all 64-bit inputs.
pub fn is_prime(n: u64) -> bool {
    if n < 2 {
        return false;
    }
    for &p in &WITNESSES {
        if n % p == 0 {
            return n == p;
        }
    }

    let mut d = n - 1;
    let mut s = 0;
    while d % 2 == 0 {
        d /= 2;
        s += 1;
    }

    'witness: for &a in &WITNESSES {
        let mut x = ModArith::pow(a, d, n);
        if x == 1 || x == n - 1 {
            continue;
        }
        for _ in 1..s {
            x = ModArith::mul(x, x, n);
            if x == n - 1 {
                continue 'witness;
            }
        }
        return false;
    }
    true
}

/// Returns `count` distinct primes of exactly `bit_size` bits with
/// `p ≡ 1 (mod 2n)`, largest first, skipping anything in `exclude`.
///
/// Returns `None` if the bit range runs out of candidates.
pub fn ntt_primes(bit_size: u32, n: usize, count: usize, exclude: &[u64]) -> Option<Vec<u64>> {
    if !(2..=62).contains(&bit_size) {
        return None;
    }
    let step = 2 * n as u64;
    let upper = 1u64 << bit_size;
    let lower = 1u64 << (bit_size - 1);

    let mut found = Vec::with_capacity(count);
    let mut k = (upper - 2) / step;
    while found.len() < count {
        let candidate = k.checked_mul(step)?.checked_add(1)?;
        if candidate < lower {
            return None;
        }
        if is_prime(candidate) && !exclude.contains(&candidate) {
            found.push(candidate);
        }
        k = k.checked_sub(1)?;
    }
    Some(found)
}

/// Generates one prime per requested bit size, all distinct.
pub fn coeff_modulus(n: usize, bit_sizes: &[u32]) -> Option<Vec<u64>> {
    let mut moduli: Vec<u64> = Vec::with_capacity(bit_sizes.len());
    for &bits in bit_sizes {
        let prime = ntt_primes(bits, n, 1, &moduli)?;
        moduli.extend(prime);
    }
    Some(moduli)
}
