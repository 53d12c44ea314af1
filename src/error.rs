//! Error types shared by every layer of the crate.
//!
//! Negative outcomes that are part of normal operation (item not found, no
//! match) are ordinary return values and never appear here.

use thiserror::Error;

/// Why a single bin-bundle mutation was refused.
///
/// Returned before any bin is touched, so a failed call leaves the bundle
/// unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BinInsertError {
    #[error("bin {bin} already holds this field element")]
    DuplicateFelt { bin: usize },

    #[error("bin {bin} is full ({max} entries)")]
    BinFull { bin: usize, max: usize },

    #[error("bin range {start}..{end} exceeds bundle width {width}")]
    OutOfRange { start: usize, end: usize, width: usize },

    #[error("expected {expected} label parts, got {got}")]
    LabelSizeMismatch { expected: usize, got: usize },

    #[error("bundle contents were stripped")]
    Stripped,
}

/// Errors returned by database, query and protocol operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error("cuckoo table full: item {item_index} not placed after {max_probes} probes")]
    CuckooTableFull { item_index: usize, max_probes: usize },

    #[error("item is already present in the database")]
    DuplicateItem,

    #[error("bin insert failed: {0}")]
    BinInsert(#[from] BinInsertError),

    #[error("power {power} was claimed twice during DAG execution")]
    DagDoubleClaim { power: u32 },

    #[error("query aborted by another worker")]
    QueryAborted,

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("cache of bundle at index {bundle_idx} is stale")]
    CacheInvalid { bundle_idx: usize },

    #[error("database contents were stripped")]
    Stripped,

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("encoding overflow: {bit_length} bits requested, capacity {capacity}")]
    EncodingOverflow { bit_length: usize, capacity: usize },

    #[error("homomorphic operation misuse: {0}")]
    Backend(String),

    #[error("oprf: {0}")]
    Oprf(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Bincode(#[from] bincode::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Result type for labeled PSI operations.
pub type Result<T> = std::result::Result<T, Error>;

/// `Error::MalformedMessage` with format string support.
macro_rules! malformed {
    ($($arg:tt)*) => {
        $crate::error::Error::MalformedMessage(format!($($arg)*))
    };
}

/// `Error::Backend` with format string support.
macro_rules! backend_err {
    ($($arg:tt)*) => {
        $crate::error::Error::Backend(format!($($arg)*))
    };
}

pub(crate) use backend_err;
pub(crate) use malformed;
