//! BFV homomorphic encryption over R_Q = Z_Q[X]/(X^n + 1).
//!
//! A compact RNS implementation of the scheme operations the PSI protocol
//! consumes: symmetric encryption with seeded ciphertexts, batching,
//! plaintext and ciphertext products, relinearization and modulus switching.

mod context;
mod enc;
mod encoder;
mod evaluator;
mod types;

pub use context::HeContext;
pub use types::{Ciphertext, NttPlaintext, Plaintext, RelinKeys, SecretKey, SeededCiphertext};
