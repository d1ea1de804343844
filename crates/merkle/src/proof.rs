//! Proof generation and verification for order Merkle trees.

use alloy_primitives::B256;
use orderproof_core::{compute_leaf_hash, hash_pair, OrderId};
use serde::{Deserialize, Serialize};

/// Inclusion proof for one audited order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MerkleProof {
    /// The order being proven.
    pub order_id: OrderId,

    /// The audit digest committed in the leaf.
    pub digest: String,

    /// Position of the leaf in ascending order-id order.
    pub leaf_index: usize,

    /// Sibling hashes from the leaf up to the root.
    pub siblings: Vec<B256>,
}

impl MerkleProof {
    /// Verify this proof against a root hash.
    pub fn verify(&self, root: &B256) -> bool {
        verify_standalone(root, self.order_id, &self.digest, &self.siblings)
    }

    /// Compute the root implied by this proof.
    pub fn compute_root(&self) -> B256 {
        compute_root(self.order_id, &self.digest, &self.siblings)
    }

    /// Siblings as `0x`-prefixed hex strings, the form published to verifiers.
    pub fn siblings_hex(&self) -> Vec<String> {
        self.siblings.iter().map(|s| s.to_string()).collect()
    }
}

/// Verify that `(order_id, digest)` is a leaf of the tree with `root`.
///
/// Needs no tree and performs no I/O: the leaf is re-hashed and folded with each
/// sibling in turn. This is the check any outside auditor runs independently.
pub fn verify_standalone(root: &B256, order_id: OrderId, digest: &str, proof: &[B256]) -> bool {
    compute_root(order_id, digest, proof) == *root
}

fn compute_root(order_id: OrderId, digest: &str, proof: &[B256]) -> B256 {
    proof
        .iter()
        .fold(compute_leaf_hash(order_id, digest), |acc, sibling| {
            hash_pair(&acc, sibling)
        })
}
