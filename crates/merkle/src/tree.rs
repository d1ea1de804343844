//! Merkle tree - the main tree structure.

use alloy_primitives::B256;
use orderproof_core::{compute_leaf_hash, hash_pair, MerkleLeaf, OrderId};

use crate::proof::MerkleProof;

/// An immutable Merkle tree over leaves sorted by order id.
///
/// Nodes are stored as a complete binary tree in an array of `2n - 1` hashes:
/// the root sits at index 0, the children of node `i` at `2i + 1` and `2i + 2`,
/// and leaf `k` at index `len - 1 - k`. This is the layout used by OpenZeppelin's
/// `StandardMerkleTree`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleTree {
    nodes: Vec<B256>,
    leaves: Vec<MerkleLeaf>,
}

impl MerkleTree {
    /// Build from leaves that are already sorted and de-duplicated.
    ///
    /// This is internal - users should use `MerkleBuilder` instead.
    pub(crate) fn from_sorted_leaves(leaves: Vec<MerkleLeaf>) -> Self {
        debug_assert!(!leaves.is_empty());
        debug_assert!(leaves.windows(2).all(|w| w[0].order_id < w[1].order_id));

        let n = leaves.len();
        let len = 2 * n - 1;
        let mut nodes = vec![B256::ZERO; len];

        for (k, leaf) in leaves.iter().enumerate() {
            nodes[len - 1 - k] = compute_leaf_hash(leaf.order_id, &leaf.digest);
        }
        for i in (0..len - n).rev() {
            nodes[i] = hash_pair(&nodes[2 * i + 1], &nodes[2 * i + 2]);
        }

        Self { nodes, leaves }
    }

    /// Get the root hash of the tree.
    ///
    /// This is the cryptographic commitment to every audited order in the batch.
    pub fn root(&self) -> B256 {
        self.nodes[0]
    }

    /// Number of leaves.
    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    /// Always false; empty trees cannot be built.
    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// Leaves in tree order (ascending order id).
    pub fn leaves(&self) -> &[MerkleLeaf] {
        &self.leaves
    }

    /// Order ids in tree order.
    pub fn order_ids(&self) -> Vec<OrderId> {
        self.leaves.iter().map(|l| l.order_id).collect()
    }

    /// Index of the leaf matching `(order_id, digest)`, if present.
    pub fn leaf_index(&self, order_id: OrderId, digest: &str) -> Option<usize> {
        let idx = self
            .leaves
            .binary_search_by_key(&order_id, |l| l.order_id)
            .ok()?;
        (self.leaves[idx].digest == digest).then_some(idx)
    }

    /// Generate a proof for the leaf matching `(order_id, digest)`.
    ///
    /// Returns `None` if the order is absent or recorded with a different digest.
    ///
    /// # Examples
    ///
    /// ```
    /// use orderproof_merkle::{verify_standalone, MerkleBuilder};
    ///
    /// let digest = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
    /// let mut builder = MerkleBuilder::new();
    /// builder.insert(1, digest).unwrap();
    /// builder.insert(2, digest).unwrap();
    /// let tree = builder.build().unwrap();
    ///
    /// let proof = tree.proof(2, digest).unwrap();
    /// assert!(verify_standalone(&tree.root(), 2, digest, &proof.siblings));
    /// ```
    pub fn proof(&self, order_id: OrderId, digest: &str) -> Option<MerkleProof> {
        let leaf_index = self.leaf_index(order_id, digest)?;
        Some(MerkleProof {
            order_id,
            digest: digest.to_string(),
            leaf_index,
            siblings: self.siblings(leaf_index),
        })
    }

    /// Collect sibling hashes from leaf `leaf_index` up to the root.
    fn siblings(&self, leaf_index: usize) -> Vec<B256> {
        let mut siblings = Vec::new();
        let mut i = self.nodes.len() - 1 - leaf_index;
        while i > 0 {
            let sibling = if i % 2 == 1 { i + 1 } else { i - 1 };
            siblings.push(self.nodes[sibling]);
            i = (i - 1) / 2;
        }
        siblings
    }
}

#[cfg(test)]
mod tests {
    use crate::{verify_standalone, MerkleBuilder};
    use alloy_primitives::{b256, B256};

    // sha256("a"), sha256("b"), sha256("c")
    const DA: &str = "ca978112ca1bbdcafac231b39a23dc4da786eff8147c4e72b9807785afee48bb";
    const DB: &str = "3e23e8160039594a33894f6564e1b1348bbd7a0088d42c4acb73eeaed59c009d";
    const DC: &str = "2e7d2c03a9507ae265ecf5b5356885a53393a2029d241394997265a1a25aefc6";

    fn three() -> super::MerkleTree {
        let mut builder = MerkleBuilder::new();
        builder.insert(1, DA).unwrap();
        builder.insert(2, DB).unwrap();
        builder.insert(3, DC).unwrap();
        builder.build().unwrap()
    }

    #[test]
    fn test_single_leaf_root_is_leaf_hash() {
        let mut builder = MerkleBuilder::new();
        builder.insert(1, DA).unwrap();
        let tree = builder.build().unwrap();

        assert_eq!(
            tree.root(),
            b256!("7988839e63c826be5e5ae1b7426804acd9ac11c8cd3a966360a2c675ce478360")
        );
        let proof = tree.proof(1, DA).unwrap();
        assert!(proof.siblings.is_empty());
        assert!(proof.verify(&tree.root()));
    }

    #[test]
    fn test_three_leaf_root_vector() {
        let tree = three();
        assert_eq!(
            tree.root(),
            b256!("3341b3e50a8d2d3e970741502c8d15578bfbc42465f607a001f7ab0348a384ed")
        );
    }

    #[test]
    fn test_three_leaf_proofs() {
        let tree = three();

        let p0 = tree.proof(1, DA).unwrap();
        assert_eq!(p0.leaf_index, 0);
        assert_eq!(
            p0.siblings,
            vec![
                b256!("918e4439db99c27c932e5617b17399a8c79e23736b2c01e0ba0cce8449baf961"),
                b256!("0b59aafa3186195177b413f0dc6bce83bf87103d39172c1f52a15d080b21f63f"),
            ]
        );

        let p2 = tree.proof(3, DC).unwrap();
        assert_eq!(p2.leaf_index, 2);
        assert_eq!(
            p2.siblings,
            vec![b256!(
                "17add083d2256a7d1f7016401654ddd8a564945f9afbf8b35cfd9be71c751c58"
            )]
        );
    }

    #[test]
    fn test_every_leaf_verifies() {
        for n in 1..=17u64 {
            let mut builder = MerkleBuilder::new();
            for id in 1..=n {
                let digest = format!("{:064x}", id * 7919);
                builder.insert(id, digest).unwrap();
            }
            let tree = builder.build().unwrap();
            for leaf in tree.leaves() {
                let proof = tree.proof(leaf.order_id, &leaf.digest).unwrap();
                assert!(
                    verify_standalone(&tree.root(), leaf.order_id, &leaf.digest, &proof.siblings),
                    "leaf {} of {} failed",
                    leaf.order_id,
                    n
                );
            }
        }
    }

    #[test]
    fn test_rebuild_is_reproducible() {
        let a = three();
        let b = three();
        assert_eq!(a.root(), b.root());
        for leaf in a.leaves() {
            assert_eq!(
                a.proof(leaf.order_id, &leaf.digest),
                b.proof(leaf.order_id, &leaf.digest)
            );
        }
    }

    #[test]
    fn test_proof_absent_or_wrong_digest() {
        let tree = three();
        assert!(tree.proof(4, DA).is_none());
        assert!(tree.proof(1, DB).is_none());
    }

    #[test]
    fn test_root_changes_when_population_grows() {
        let small = three();
        let mut builder = MerkleBuilder::new();
        builder.insert(1, DA).unwrap();
        builder.insert(2, DB).unwrap();
        builder.insert(3, DC).unwrap();
        builder.insert(4, DA).unwrap();
        let big = builder.build().unwrap();
        assert_ne!(small.root(), big.root());
        assert_ne!(big.root(), B256::ZERO);
    }
}
