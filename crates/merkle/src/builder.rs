//! Builder for constructing Merkle trees.

use orderproof_core::{types::validate_digest, MerkleLeaf, OrderId};
use std::collections::BTreeMap;

use crate::error::{MerkleError, Result};
use crate::tree::MerkleTree;

/// Builder for constructing a Merkle tree over audited orders.
///
/// The builder collects `(orderId, digest)` pairs and then constructs
/// the complete tree when `build()` is called. Leaves are always ordered by
/// order id ascending, whatever order they were inserted in.
///
/// # Examples
///
/// ```
/// use orderproof_merkle::MerkleBuilder;
///
/// let digest = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
/// let mut builder = MerkleBuilder::new();
/// builder.insert(2, digest).unwrap();
/// builder.insert(1, digest).unwrap();
/// let tree = builder.build().unwrap();
/// assert_eq!(tree.order_ids(), vec![1, 2]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MerkleBuilder {
    /// Collected leaves: orderId -> digest
    leaves: BTreeMap<OrderId, String>,
}

impl MerkleBuilder {
    /// Create a new empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a leaf.
    ///
    /// Re-inserting an order with the same digest is a no-op.
    ///
    /// # Errors
    ///
    /// - `MerkleError::InvalidLeaf` if the digest is not 64 lowercase hex characters.
    /// - `MerkleError::ConflictingLeaf` if the order is already present with a different digest.
    pub fn insert(&mut self, order_id: OrderId, digest: impl Into<String>) -> Result<&mut Self> {
        let digest = digest.into();
        validate_digest(&digest)?;

        if let Some(existing) = self.leaves.get(&order_id) {
            if *existing != digest {
                return Err(MerkleError::ConflictingLeaf(order_id));
            }
            return Ok(self);
        }

        self.leaves.insert(order_id, digest);
        Ok(self)
    }

    /// Insert a [`MerkleLeaf`].
    pub fn insert_leaf(&mut self, leaf: MerkleLeaf) -> Result<&mut Self> {
        self.insert(leaf.order_id, leaf.digest)
    }

    /// Get the number of leaves in the builder.
    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    /// Check if the builder is empty (no leaves).
    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// Build the tree.
    ///
    /// # Errors
    ///
    /// Returns `MerkleError::EmptyTree` when no leaves were inserted.
    pub fn build(self) -> Result<MerkleTree> {
        if self.leaves.is_empty() {
            return Err(MerkleError::EmptyTree);
        }

        let leaves = self
            .leaves
            .into_iter()
            .map(|(order_id, digest)| MerkleLeaf { order_id, digest })
            .collect();

        Ok(MerkleTree::from_sorted_leaves(leaves))
    }
}

impl FromIterator<MerkleLeaf> for MerkleBuilder {
    /// Collect leaves, keeping the first digest seen for each order.
    fn from_iter<I: IntoIterator<Item = MerkleLeaf>>(iter: I) -> Self {
        let mut leaves = BTreeMap::new();
        for leaf in iter {
            leaves.entry(leaf.order_id).or_insert(leaf.digest);
        }
        Self { leaves }
    }
}
