//! Errors raised by the pure cryptographic layer.
//!
//! "Does not verify" and "not mine" are ordinary `false` results, never
//! errors. These variants are reserved for malformed input and for the
//! accumulator's hard limits.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// Bytes do not decode to a point on secp256k1 (or decode to infinity).
    #[error("invalid curve point")]
    InvalidPoint,

    /// Bytes are not a canonical scalar below the group order.
    #[error("invalid scalar")]
    InvalidScalar,

    /// A hash-to-scalar or key input produced the zero scalar.
    #[error("zero scalar")]
    ZeroScalar,

    #[error("invalid length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    /// Amount does not fit below the secp256k1 group order.
    #[error("amount out of range")]
    AmountOutOfRange,

    /// Output amounts do not sum to the input amount.
    #[error("amounts do not balance: input {input}, outputs {outputs}")]
    AmountMismatch { input: String, outputs: String },

    /// The accumulator holds 2^depth leaves already.
    #[error("merkle tree is full ({capacity} leaves)")]
    TreeFull { capacity: u64 },

    #[error("unsupported tree depth {0} (expected 1..={max})", max = crate::merkle::MAX_TREE_DEPTH)]
    UnsupportedDepth(usize),

    #[error("leaf index {index} out of bounds (next leaf index {next})")]
    LeafIndexOutOfBounds { index: u64, next: u64 },

    /// A persisted tree snapshot is internally inconsistent.
    #[error("malformed tree snapshot: {0}")]
    MalformedTree(String),

    #[error("invalid hex: {0}")]
    InvalidHex(String),
}
