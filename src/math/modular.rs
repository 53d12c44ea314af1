//! Scalar arithmetic over Z_p for word-sized moduli.

/// Modular arithmetic helpers over Z_p.
///
/// All inputs are expected to be reduced (`< p`) unless stated otherwise.
pub struct ModArith;

impl ModArith {
    /// `(a + b) mod p`
    #[inline]
    pub fn add(a: u64, b: u64, p: u64) -> u64 {
        let sum = (a as u128) + (b as u128);
        if sum >= p as u128 {
            (sum - p as u128) as u64
        } else {
            sum as u64
        }
    }

    /// `(a - b) mod p`
    #[inline]
    pub fn sub(a: u64, b: u64, p: u64) -> u64 {
        if a >= b {
            a - b
        } else {
            p - (b - a)
        }
    }

    /// `(a * b) mod p`
    #[inline]
    pub fn mul(a: u64, b: u64, p: u64) -> u64 {
        ((a as u128 * b as u128) % p as u128) as u64
    }

    /// `(acc + a * b) mod p`
    #[inline]
    pub fn mul_add(acc: u64, a: u64, b: u64, p: u64) -> u64 {
        ((acc as u128 + a as u128 * b as u128) % p as u128) as u64
    }

    /// Computes `-a mod p` for `a < p`.
    #[inline]
    pub fn negate(a: u64, p: u64) -> u64 {
        if a == 0 {
            0
        } else {
            p - a
        }
    }

    /// Square-and-multiply exponentiation.
    pub fn pow(mut base: u64, mut exp: u64, p: u64) -> u64 {
        let mut result = 1u64 % p;
        base %= p;
        while exp > 0 {
            if exp & 1 == 1 {
                result = Self::mul(result, base, p);
            }
            base = Self::mul(base, base, p);
            exp >>= 1;
        }
        result
    }

    /// Multiplicative inverse, `None` when `a` shares a factor with `p`.
    pub fn inv(a: u64, p: u64) -> Option<u64> {
        super::crt::mod_inverse(a % p, p)
    }

    /// Maps a signed value into `[0, p)`.
    #[inline]
    pub fn from_signed(val: i64, p: u64) -> u64 {
        if val >= 0 {
            (val as u64) % p
        } else {
            Self::negate(val.unsigned_abs() % p, p)
        }
    }

    /// Centered representative in `(-p/2, p/2]`.
    #[inline]
    pub fn to_centered(val: u64, p: u64) -> i64 {
        if val <= p / 2 {
            val as i64
        } else {
            -((p - val) as i64)
        }
    }
}
