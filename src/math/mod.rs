//! Arithmetic primitives.
//!
//! - **Modular arithmetic** over word-sized primes
//! - **Number-Theoretic Transform (NTT)** with Montgomery butterflies
//! - **RNS polynomials** and CRT reconstruction for the ciphertext modulus
//! - **Field polynomials** over the plaintext modulus (root expansion,
//!   Newton interpolation)
//! - **Sampling** of Gaussian noise and ternary secrets

pub mod crt;
pub mod field_poly;
pub mod gaussian;
pub mod modular;
pub mod ntt;
pub mod primes;
pub mod rns;

pub use crt::{mod_inverse, CrtBasis};
pub use gaussian::GaussianSampler;
pub use modular::ModArith;
pub use ntt::NttContext;
pub use rns::RnsPoly;
