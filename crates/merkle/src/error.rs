//! Error types for the Merkle crate.

use orderproof_core::OrderId;
use thiserror::Error;

/// Merkle error type.
#[derive(Error, Debug)]
pub enum MerkleError {
    /// Tree is empty (no leaves).
    #[error("Tree is empty - cannot build a tree without leaves")]
    EmptyTree,

    /// The same order id was added twice with different digests.
    #[error("Conflicting digests for order {0}")]
    ConflictingLeaf(OrderId),

    /// Leaf digest is not a valid hex SHA-256 digest.
    #[error("Invalid leaf: {0}")]
    InvalidLeaf(#[from] orderproof_core::CoreError),
}

/// Result type alias for MerkleError.
pub type Result<T> = std::result::Result<T, MerkleError>;
