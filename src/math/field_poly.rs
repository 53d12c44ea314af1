//! Dense polynomials over the plaintext field Z_t.
//!
//! Coefficient vectors are little-endian: `coeffs[i]` multiplies `x^i`.

use super::modular::ModArith;

/// Monic polynomial `∏ (x - r)` over the given roots.
///
/// The empty product is the constant polynomial 1.
pub fn from_roots(roots: &[u64], t: u64) -> Vec<u64> {
    let mut coeffs = Vec::with_capacity(roots.len() + 1);
    coeffs.push(1u64);
    for &root in roots {
        let neg_root = ModArith::negate(root % t, t);
        // multiply by (x - root): shift up, then add -root * old
        coeffs.push(0);
        for i in (0..coeffs.len()).rev() {
            let shifted = if i > 0 { coeffs[i - 1] } else { 0 };
            coeffs[i] = ModArith::mul_add(shifted, coeffs[i], neg_root, t);
        }
    }
    coeffs
}

/// Newton interpolation through `(xs[i], ys[i])`.
///
/// Returns the unique polynomial of degree `< xs.len()` as coefficients, or
/// `None` if two `x` values coincide. Empty input yields the zero polynomial
/// with no coefficients.
pub fn newton_interpolate(xs: &[u64], ys: &[u64], t: u64) -> Option<Vec<u64>> {
    debug_assert_eq!(xs.len(), ys.len());
    let n = xs.len();
    if n == 0 {
        return Some(Vec::new());
    }

    // divided differences, in place
    let mut diffs: Vec<u64> = ys.iter().map(|&y| y % t).collect();
    for level in 1..n {
        for i in (level..n).rev() {
            let num = ModArith::sub(diffs[i], diffs[i - 1], t);
            let den = ModArith::sub(xs[i] % t, xs[i - level] % t, t);
            let den_inv = ModArith::inv(den, t)?;
            diffs[i] = ModArith::mul(num, den_inv, t);
        }
    }

    // Horner-style expansion of the Newton form:
    // p = d0 + (x - x0)(d1 + (x - x1)(d2 + ...))
    let mut coeffs = vec![0u64; n];
    coeffs[0] = diffs[n - 1];
    let mut len = 1;
    for k in (0..n - 1).rev() {
        let neg_xk = ModArith::negate(xs[k] % t, t);
        // coeffs = coeffs * (x - xk) + diffs[k]
        for i in (0..=len).rev() {
            let shifted = if i > 0 { coeffs[i - 1] } else { 0 };
            let cur = if i < len { coeffs[i] } else { 0 };
            coeffs[i] = ModArith::mul_add(shifted, cur, neg_xk, t);
        }
        len += 1;
        coeffs[0] = ModArith::add(coeffs[0], diffs[k], t);
    }
    Some(coeffs)
}

/// Horner evaluation at `x`.
pub fn eval(coeffs: &[u64], x: u64, t: u64) -> u64 {
    coeffs
        .iter()
        .rev()
        .fold(0u64, |acc, &c| ModArith::mul_add(c, acc, x % t, t))
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: u64 = 65537;

    #[test]
    fn test_from_roots_vanishes_exactly_on_roots() {
        let roots = [3u64, 17, 40000, 65536];
        let poly = from_roots(&roots, T);
        assert_eq!(poly.len(), roots.len() + 1);
        assert_eq!(*poly.last().unwrap(), 1);
        for &r in &roots {
            assert_eq!(eval(&poly, r, T), 0);
        }
        for x in [0u64, 1, 2, 4, 18, 39999] {
            assert_ne!(eval(&poly, x, T), 0);
        }
    }

    #[test]
    fn test_empty_roots_is_one() {
        assert_eq!(from_roots(&[], T), vec![1]);
    }

    #[test]
    fn test_interpolation_hits_points() {
        let xs = [5u64, 9, 1234, 60000, 2];
        let ys = [100u64, 0, 65536, 7, 7];
        let poly = newton_interpolate(&xs, &ys, T).unwrap();
        assert_eq!(poly.len(), xs.len());
        for (&x, &y) in xs.iter().zip(&ys) {
            assert_eq!(eval(&poly, x, T), y);
        }
    }

    #[test]
    fn test_interpolation_single_point_is_constant() {
        let poly = newton_interpolate(&[42], &[99], T).unwrap();
        assert_eq!(poly, vec![99]);
    }

    #[test]
    fn test_interpolation_rejects_repeated_x() {
        assert!(newton_interpolate(&[1, 1], &[2, 3], T).is_none());
    }
}
