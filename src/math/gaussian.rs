//! Discrete Gaussian and ternary sampling.
//!
//! Samplers carry no RNG of their own; the caller passes one per call so
//! that every source of randomness is explicit.

use rand::{CryptoRng, Rng};

/// Default Gaussian standard deviation.
pub const DEFAULT_SIGMA: f64 = 3.2;

/// Discrete Gaussian sampler over Z using rejection sampling.
#[derive(Clone, Copy, Debug)]
pub struct GaussianSampler {
    sigma: f64,
    /// Samples beyond this many units from zero are rejected.
    tailcut: i64,
}

impl GaussianSampler {
    /// Sampler for standard deviation `sigma`, tail-cut at 6σ.
    pub fn new(sigma: f64) -> Self {
        Self {
            sigma,
            tailcut: (sigma * 6.0).ceil() as i64,
        }
    }

    /// Standard deviation.
    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    /// Draws one value from D_σ, centered at zero.
    pub fn sample<R: Rng + CryptoRng>(&self, rng: &mut R) -> i64 {
        if self.tailcut == 0 {
            return 0;
        }
        let sigma_sq_2 = 2.0 * self.sigma * self.sigma;
        loop {
            let x = rng.gen_range(-self.tailcut..=self.tailcut);
            let prob = (-((x * x) as f64) / sigma_sq_2).exp();
            if rng.gen::<f64>() < prob {
                return x;
            }
        }
    }

    /// Draws `len` signed samples.
    pub fn sample_vec<R: Rng + CryptoRng>(&self, len: usize, rng: &mut R) -> Vec<i64> {
        (0..len).map(|_| self.sample(rng)).collect()
    }

    /// Largest absolute value the sampler returns.
    pub fn bound(&self) -> i64 {
        self.tailcut
    }
}

impl Default for GaussianSampler {
    fn default() -> Self {
        Self::new(DEFAULT_SIGMA)
    }
}

/// Uniform ternary vector over {-1, 0, 1}.
pub fn sample_ternary<R: Rng + CryptoRng>(len: usize, rng: &mut R) -> Vec<i64> {
    (0..len).map(|_| rng.gen_range(-1i64..=1)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    #[test]
    fn test_samples_within_tailcut() {
        let sampler = GaussianSampler::default();
        let mut rng = ChaCha20Rng::seed_from_u64(7);
        for _ in 0..1000 {
            assert!(sampler.sample(&mut rng).abs() <= sampler.bound());
        }
    }

    #[test]
    fn test_deterministic_under_same_seed() {
        let sampler = GaussianSampler::default();
        let mut a = ChaCha20Rng::seed_from_u64(12345);
        let mut b = ChaCha20Rng::seed_from_u64(12345);
        assert_eq!(sampler.sample_vec(100, &mut a), sampler.sample_vec(100, &mut b));
    }

    #[test]
    fn test_roughly_centered() {
        let sampler = GaussianSampler::default();
        let mut rng = ChaCha20Rng::seed_from_u64(42);
        let samples = sampler.sample_vec(20_000, &mut rng);
        let mean = samples.iter().sum::<i64>() as f64 / samples.len() as f64;
        assert!(mean.abs() < 0.2, "mean {mean} too far from zero");
    }

    #[test]
    fn test_ternary_range() {
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let s = sample_ternary(512, &mut rng);
        assert!(s.iter().all(|v| (-1..=1).contains(v)));
        assert!(s.iter().any(|&v| v == -1) && s.iter().any(|&v| v == 1));
    }
}
