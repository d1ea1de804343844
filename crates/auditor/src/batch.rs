//! Building Merkle trees over the audit population.

use alloy::primitives::B256;
use futures::TryStreamExt;
use orderproof_core::{validate_order_id, OrderId};
use orderproof_merkle::{MerkleBuilder, MerkleProof, MerkleTree};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::audit::{AuditError, AuditRecord, AuditService};

/// A tree built from the stored audits.
#[derive(Debug, Clone)]
pub struct BuiltTree {
    /// Root of `tree`
    pub root: B256,
    /// The tree
    pub tree: MerkleTree,
    /// Number of leaves
    pub leaf_count: usize,
    /// Orders covered, ascending
    pub order_ids: Vec<OrderId>,
}

impl BuiltTree {
    fn from_tree(tree: MerkleTree) -> Self {
        Self {
            root: tree.root(),
            leaf_count: tree.len(),
            order_ids: tree.order_ids(),
            tree,
        }
    }

    /// Proof for `(order_id, digest)`, if that exact leaf is in the tree.
    pub fn proof(&self, order_id: OrderId, digest: &str) -> Option<MerkleProof> {
        self.tree.proof(order_id, digest)
    }
}

/// Builds trees from the audit store.
///
/// Identical populations always give identical roots, proofs and leaf indices.
#[derive(Debug, Clone)]
pub struct BatchBuilder {
    audits: Arc<AuditService>,
}

impl BatchBuilder {
    /// Create a builder reading from `audits`.
    pub fn new(audits: Arc<AuditService>) -> Self {
        Self { audits }
    }

    /// Build a tree over every stored audit. `None` when there are none.
    pub async fn build(&self) -> Result<Option<BuiltTree>, AuditError> {
        self.build_filtered(|_| true).await
    }

    /// Build a tree over the stored audits of `order_ids` only.
    ///
    /// Used to reproduce an anchored batch after newer audits were added. Orders
    /// without an audit are left out, so the caller must compare the root.
    pub async fn build_for(&self, order_ids: &[OrderId]) -> Result<Option<BuiltTree>, AuditError> {
        let wanted: BTreeSet<OrderId> = order_ids.iter().copied().collect();
        self.build_filtered(|record| wanted.contains(&record.order_id))
            .await
    }

    async fn build_filtered<F>(&self, keep: F) -> Result<Option<BuiltTree>, AuditError>
    where
        F: Fn(&AuditRecord) -> bool,
    {
        let mut builder = MerkleBuilder::new();
        let mut records = self.audits.stream_all();

        while let Some(record) = records.try_next().await? {
            if !keep(&record) {
                continue;
            }
            if let Err(e) = validate_order_id(record.order_id) {
                warn!(order_id = record.order_id, "Leaving audit out of tree: {}", e);
                continue;
            }
            if let Err(e) = builder.insert_leaf(record.leaf()) {
                warn!(order_id = record.order_id, "Leaving audit out of tree: {}", e);
            }
        }

        // Leaves were validated on insert; the only build failure left is an empty tree
        let Ok(tree) = builder.build() else {
            return Ok(None);
        };
        let built = BuiltTree::from_tree(tree);
        debug!(
            root = %built.root,
            leaves = built.leaf_count,
            "Built audit tree"
        );

        Ok(Some(built))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditStore;
    use crate::kv::SqliteKvStore;
    use crate::retry::RetryPolicy;
    use crate::storage::Storage;
    use chrono::{TimeZone, Utc};
    use orderproof_core::{CanonicalEncoding, TransactionFacts};
    use orderproof_merkle::verify_standalone;
    use rust_decimal::Decimal;
    use tempfile::NamedTempFile;

    fn facts(order_id: OrderId) -> TransactionFacts {
        TransactionFacts {
            order_id,
            total_credits: order_id as i64,
            total_price: Decimal::new(1000 + order_id as i64, 2),
            paid_at: Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
            buyer: None,
            seller: None,
        }
    }

    async fn setup() -> (Arc<AuditService>, BatchBuilder, Storage, NamedTempFile) {
        let temp_db = NamedTempFile::new().unwrap();
        let storage = Storage::new_with_path(temp_db.path(), None, None)
            .await
            .unwrap();
        storage.run_migrations().await.unwrap();
        let kv = Arc::new(SqliteKvStore::new(&storage));
        let audits = Arc::new(AuditService::new(
            AuditStore::new(kv, RetryPolicy::none(), 4),
            CanonicalEncoding::Legacy,
        ));
        let builder = BatchBuilder::new(audits.clone());
        (audits, builder, storage, temp_db)
    }

    #[tokio::test]
    async fn test_empty_population() {
        let (_audits, builder, _storage, _temp_db) = setup().await;
        assert!(builder.build().await.unwrap().is_none());
        assert!(builder.build_for(&[1, 2]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_build_is_reproducible() {
        let (audits, builder, _storage, _temp_db) = setup().await;
        for id in [5, 1, 9, 3, 7, 11] {
            audits.record_order(&facts(id)).await.unwrap();
        }

        let a = builder.build().await.unwrap().unwrap();
        let b = builder.build().await.unwrap().unwrap();
        assert_eq!(a.root, b.root);
        assert_eq!(a.order_ids, vec![1, 3, 5, 7, 9, 11]);
        assert_eq!(a.leaf_count, 6);

        for leaf in a.tree.leaves() {
            let pa = a.proof(leaf.order_id, &leaf.digest).unwrap();
            let pb = b.proof(leaf.order_id, &leaf.digest).unwrap();
            assert_eq!(pa, pb);
            assert!(verify_standalone(&a.root, leaf.order_id, &leaf.digest, &pa.siblings));
        }
    }

    #[tokio::test]
    async fn test_build_for_reproduces_older_batch() {
        let (audits, builder, _storage, _temp_db) = setup().await;
        for id in 1..=3 {
            audits.record_order(&facts(id)).await.unwrap();
        }
        let old = builder.build().await.unwrap().unwrap();

        for id in 4..=6 {
            audits.record_order(&facts(id)).await.unwrap();
        }
        let current = builder.build().await.unwrap().unwrap();
        assert_ne!(current.root, old.root);

        let rebuilt = builder.build_for(&old.order_ids).await.unwrap().unwrap();
        assert_eq!(rebuilt.root, old.root);
        assert_eq!(rebuilt.order_ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_proof_for_absent_or_wrong_digest() {
        let (audits, builder, _storage, _temp_db) = setup().await;
        let digest = audits.record_order(&facts(1)).await.unwrap();
        audits.record_order(&facts(2)).await.unwrap();

        let built = builder.build().await.unwrap().unwrap();
        assert!(built.proof(1, &digest).is_some());
        assert!(built.proof(3, &digest).is_none());
        assert!(built
            .proof(
                1,
                "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
            )
            .is_none());
    }
}
