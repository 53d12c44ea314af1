//! Blinded-exponentiation OPRF over Ristretto255.
//!
//! `F_k(x) = SHA-256(k · H(x))[..16]`, where `H` hashes to the group with
//! SHA-512. The Receiver sends `r · H(x)` for a random `r`, the Sender
//! multiplies by `k`, and the Receiver removes `r`. The Sender never sees
//! `x`; the Receiver never sees `k`.

use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};

use crate::error::{Error, Result};
use crate::item::Item;

/// Compressed group element on the wire.
pub type OprfPoint = [u8; 32];

fn hash_to_group(item: &Item) -> RistrettoPoint {
    let mut h = Sha512::new();
    h.update(b"labeled-psi oprf");
    h.update(item.as_bytes());
    let mut wide = [0u8; 64];
    wide.copy_from_slice(&h.finalize());
    RistrettoPoint::from_uniform_bytes(&wide)
}

fn finalize(point: &RistrettoPoint) -> Item {
    let digest = Sha256::digest(point.compress().as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Item::from_bytes(bytes)
}

fn decompress(bytes: &OprfPoint) -> Result<RistrettoPoint> {
    CompressedRistretto(*bytes)
        .decompress()
        .ok_or_else(|| Error::Oprf("not a valid group element".into()))
}

/// Sender's OPRF key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OprfKey {
    scalar: [u8; 32],
}

impl std::fmt::Debug for OprfKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("OprfKey(..)")
    }
}

impl OprfKey {
    /// Draws a fresh key.
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self {
            scalar: Scalar::random(rng).to_bytes(),
        }
    }

    fn scalar(&self) -> Scalar {
        Scalar::from_bytes_mod_order(self.scalar)
    }

    /// `F_k(item)`, computed directly by the key holder.
    pub fn evaluate_item(&self, item: &Item) -> Item {
        finalize(&(hash_to_group(item) * self.scalar()))
    }

    /// Multiplies each blinded point by the key.
    pub fn process_queries(&self, blinded: &[OprfPoint]) -> Result<Vec<OprfPoint>> {
        let k = self.scalar();
        blinded
            .iter()
            .map(|b| Ok((decompress(b)? * k).compress().to_bytes()))
            .collect()
    }
}

/// Receiver-side blinding state for one OPRF round.
pub struct OprfReceiver {
    inverse_factors: Vec<Scalar>,
}

impl OprfReceiver {
    /// Blinds `items`, returning the state needed to unblind and the points
    /// to send.
    pub fn new<R: RngCore + CryptoRng>(items: &[Item], rng: &mut R) -> (Self, Vec<OprfPoint>) {
        let mut inverse_factors = Vec::with_capacity(items.len());
        let mut blinded = Vec::with_capacity(items.len());
        for item in items {
            let r = loop {
                let r = Scalar::random(rng);
                if r != Scalar::ZERO {
                    break r;
                }
            };
            blinded.push((hash_to_group(item) * r).compress().to_bytes());
            inverse_factors.push(r.invert());
        }
        (Self { inverse_factors }, blinded)
    }

    /// Number of items blinded.
    pub fn len(&self) -> usize {
        self.inverse_factors.len()
    }

    /// True if no item was blinded.
    pub fn is_empty(&self) -> bool {
        self.inverse_factors.is_empty()
    }

    /// Unblinds the Sender's answers into OPRF outputs, in query order.
    pub fn process_responses(&self, responses: &[OprfPoint]) -> Result<Vec<Item>> {
        if responses.len() != self.inverse_factors.len() {
            return Err(Error::MalformedMessage(format!(
                "expected {} OPRF responses, got {}",
                self.inverse_factors.len(),
                responses.len()
            )));
        }
        responses
            .iter()
            .zip(&self.inverse_factors)
            .map(|(resp, inv)| Ok(finalize(&(decompress(resp)? * inv))))
            .collect()
    }
}
