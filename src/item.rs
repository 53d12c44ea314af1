//! Items and labels.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Field element modulo the plaintext modulus.
pub type Felt = u64;

/// Label bytes attached to an item. Shorter labels are zero-padded to the
/// database-wide label length.
pub type Label = Vec<u8>;

/// 128-bit opaque item identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Item([u8; 16]);

impl Item {
    /// Item width in bytes.
    pub const BYTES: usize = 16;

    /// Wraps 16 raw bytes, e.g. an item hashed elsewhere.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Derives an item from arbitrary data: SHA-256 truncated to 128 bits.
    pub fn hash_bytes(data: impl AsRef<[u8]>) -> Self {
        let digest = Sha256::digest(data.as_ref());
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        Self(bytes)
    }

    /// The raw 16 bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl AsRef<[u8]> for Item {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<u128> for Item {
    fn from(value: u128) -> Self {
        Self(value.to_le_bytes())
    }
}

impl fmt::Debug for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Item(")?;
        for b in &self.0[..4] {
            write!(f, "{b:02x}")?;
        }
        write!(f, "..)")
    }
}
