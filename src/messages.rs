//! Protocol messages. Every message is serde-serializable; bincode is the
//! wire format.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::he::{Ciphertext, RelinKeys, SeededCiphertext};
use crate::oprf::OprfPoint;

/// Blinded items for the OPRF round.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OprfRequest {
    pub blinded: Vec<OprfPoint>,
}

/// The Sender's OPRF evaluations, in request order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OprfResponse {
    pub evaluated: Vec<OprfPoint>,
}

/// Encrypted source powers of every query batch.
///
/// `powers[p][b]` encrypts slot-wise `y^p` for bundle index `b`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub powers: BTreeMap<u32, Vec<SeededCiphertext>>,
    pub relin_keys: RelinKeys,
}

impl QueryRequest {
    /// Number of batches (bundle indices) the query covers.
    pub fn batch_count(&self) -> usize {
        self.powers.values().next().map_or(0, Vec::len)
    }
}

/// What a result package carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PackageKind {
    Matching,
    /// Label part index.
    Label(u32),
}

/// One evaluated polynomial of one bundle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultPackage {
    pub bundle_idx: u32,
    /// Position of the bundle among those sharing `bundle_idx`.
    pub bundle_instance: u32,
    pub kind: PackageKind,
    pub ciphertext: Ciphertext,
}

/// The Sender's answer to a query.
///
/// # Fields
///
/// * `label_byte_count` - Label length of the database; 0 if unlabeled
/// * `packages` - One matching package per bundle, followed by its label packages
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub label_byte_count: u32,
    pub packages: Vec<ResultPackage>,
}

/// Serializes a protocol message with bincode.
pub fn to_bytes<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(message)?)
}

/// Deserializes a protocol message written by [`to_bytes`].
pub fn from_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}
