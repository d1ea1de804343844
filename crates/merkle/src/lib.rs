//! Merkle tree over audited orders.
//!
//! This crate provides:
//! - [`MerkleBuilder`]: collects leaves, sorts them by order id, builds the tree
//! - [`MerkleTree`]: root, leaf lookup and proof generation
//! - [`verify_standalone`]: proof verification with no tree and no I/O
//!
//! Trees are never persisted. They are rebuilt from the audit population, which is
//! why the same population must always yield the same root, proofs and indices.

#![warn(missing_docs)]

pub mod builder;
pub mod error;
pub mod proof;
pub mod tree;

pub use builder::MerkleBuilder;
pub use error::{MerkleError, Result};
pub use proof::{verify_standalone, MerkleProof};
pub use tree::MerkleTree;
