//! # OrderProof Core
//!
//! Core types and hashing for the OrderProof audit and anchoring system.
//!
//! This crate is deliberately free of I/O so that a third party can reproduce
//! every digest and every Merkle leaf from public order data alone.
//!
//! ## Features
//!
//! - **Facts**: [`TransactionFacts`], the immutable record of a paid order
//! - **Codec**: canonical string construction and SHA-256 order digests
//! - **Hashing**: Keccak256 leaf and pair hashing compatible with OpenZeppelin's
//!   `StandardMerkleTree` / `MerkleProof`

#![warn(missing_docs)]

pub mod codec;
pub mod error;
pub mod hashing;
pub mod types;

// Re-export commonly used items
pub use codec::{canonicalize, digest, CanonicalEncoding, ALGORITHM};
pub use error::{CoreError, Result};
pub use hashing::{compute_leaf_hash, hash_pair, keccak256};
pub use types::*;

// Re-export Alloy primitives for convenience
pub use alloy_primitives::{Address, B256};
