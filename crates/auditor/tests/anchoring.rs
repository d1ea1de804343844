//! Anchoring lifecycle against an in-memory ledger.

use alloy::primitives::{keccak256, Address, Bytes, B256};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use orderproof_auditor::anchor::{
    AnchorCoordinator, AnchorError, AnchorOutcome, CoordinatorOptions, Coverage, CANCELLED_REASON,
};
use orderproof_auditor::audit::{
    AuditError, AuditRecord, AuditService, AuditStore, IntegrityStatus,
};
use orderproof_auditor::batch::BatchBuilder;
use orderproof_auditor::kv::SqliteKvStore;
use orderproof_auditor::ledger::{AnchorLedger, AnchorReceipt, LedgerError, OnChainAnchor};
use orderproof_auditor::retry::RetryPolicy;
use orderproof_auditor::storage::{AnchorConfirmation, AnchorStatus, NewAnchor, Storage};
use orderproof_auditor::verification::{AnchorLayerStatus, VerificationAssembler};
use orderproof_core::{CanonicalEncoding, OrderId, TransactionFacts};
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;

const CHAIN_ID: u64 = 84532;

/// How a concurrent process settles PENDING rows while a submission is in flight.
#[derive(Clone, Copy)]
enum Interloper {
    Fail,
    Confirm,
}

/// Ledger that records submissions instead of sending them.
#[derive(Default)]
struct MockLedger {
    anchored: Mutex<Vec<(B256, u64, AnchorReceipt)>>,
    fail_next: AtomicBool,
    delay: Option<Duration>,
    interloper: Mutex<Option<(Storage, Interloper)>>,
}

impl MockLedger {
    fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    fn submissions(&self) -> usize {
        self.anchored.lock().unwrap().len()
    }

    /// Pretend `root` was anchored by a transaction we never saw confirm.
    fn preload(&self, root: B256, count: u64) -> AnchorReceipt {
        let mut anchored = self.anchored.lock().unwrap();
        let receipt = AnchorReceipt {
            tx_hash: keccak256(root),
            block_number: 100 + anchored.len() as u64,
        };
        anchored.push((root, count, receipt));
        receipt
    }
}

#[async_trait]
impl AnchorLedger for MockLedger {
    fn chain_id(&self) -> u64 {
        CHAIN_ID
    }

    async fn anchor(&self, root: B256, leaf_count: u64) -> Result<AnchorReceipt, LedgerError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(LedgerError::Unavailable("connection refused".into()));
        }
        let interloper = self.interloper.lock().unwrap().clone();
        if let Some((storage, action)) = interloper {
            for pending in storage.get_pending_anchors().await.unwrap() {
                match action {
                    Interloper::Fail => {
                        storage.mark_anchor_failed(pending.id, "stale").await.unwrap();
                    }
                    Interloper::Confirm => {
                        let confirmation = AnchorConfirmation {
                            tx_hash: keccak256(root),
                            block_number: 99,
                            confirmed_at: 1,
                        };
                        storage
                            .mark_anchor_confirmed(pending.id, &confirmation)
                            .await
                            .unwrap();
                    }
                }
            }
        }
        Ok(self.preload(root, leaf_count))
    }

    async fn latest_anchor(&self) -> Result<Option<OnChainAnchor>, LedgerError> {
        Ok(self
            .anchored
            .lock()
            .unwrap()
            .last()
            .map(|(root, count, _)| OnChainAnchor {
                root: *root,
                timestamp: 1_700_000_500,
                count: *count,
            }))
    }

    async fn find_anchor(&self, root: B256) -> Result<Option<AnchorReceipt>, LedgerError> {
        Ok(self
            .anchored
            .lock()
            .unwrap()
            .iter()
            .find(|(r, _, _)| *r == root)
            .map(|(_, _, receipt)| *receipt))
    }

    async fn deploy(&self, _bytecode: Bytes) -> Result<Address, LedgerError> {
        Ok(Address::repeat_byte(0xaa))
    }
}

struct Harness {
    storage: Storage,
    audits: Arc<AuditService>,
    ledger: Arc<MockLedger>,
    coordinator: Arc<AnchorCoordinator>,
    shutdown: CancellationToken,
    _temp_db: NamedTempFile,
}

impl Harness {
    async fn new() -> Self {
        Self::with_ledger(MockLedger::default(), CoordinatorOptions::default()).await
    }

    async fn with_ledger(ledger: MockLedger, options: CoordinatorOptions) -> Self {
        let temp_db = NamedTempFile::new().unwrap();
        let storage = Storage::new_with_path(temp_db.path(), None, None)
            .await
            .unwrap();
        storage.run_migrations().await.unwrap();

        let kv = Arc::new(SqliteKvStore::new(&storage));
        let audits = Arc::new(AuditService::new(
            AuditStore::new(kv, RetryPolicy::none(), 2),
            CanonicalEncoding::Legacy,
        ));
        let ledger = Arc::new(ledger);
        let shutdown = CancellationToken::new();
        let coordinator = Arc::new(AnchorCoordinator::new(
            storage.clone(),
            BatchBuilder::new(audits.clone()),
            ledger.clone(),
            options,
            shutdown.clone(),
        ));

        Self {
            storage,
            audits,
            ledger,
            coordinator,
            shutdown,
            _temp_db: temp_db,
        }
    }

    async fn record(&self, ids: impl IntoIterator<Item = OrderId>) {
        for id in ids {
            self.audits.record_order(&facts(id)).await.unwrap();
        }
    }

    fn assembler(&self) -> VerificationAssembler {
        VerificationAssembler::new(self.audits.clone(), Some(self.coordinator.clone()))
    }
}

fn facts(order_id: OrderId) -> TransactionFacts {
    TransactionFacts {
        order_id,
        total_credits: 10 * order_id as i64,
        total_price: Decimal::new(999 + order_id as i64, 2),
        paid_at: Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
        buyer: None,
        seller: None,
    }
}

fn order_42() -> TransactionFacts {
    TransactionFacts {
        order_id: 42,
        total_credits: 100,
        total_price: Decimal::new(25050, 2),
        paid_at: Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
        buyer: None,
        seller: None,
    }
}

#[tokio::test]
async fn test_empty_population_is_not_an_error() {
    let h = Harness::new().await;

    let outcome = h.coordinator.anchor_current_state().await.unwrap();
    assert_eq!(outcome, AnchorOutcome::NoAuditsToAnchor);
    assert_eq!(h.ledger.submissions(), 0);
    assert!(h.coordinator.list_anchors().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unchanged_population_is_anchored_once() {
    let h = Harness::new().await;
    h.record([3, 1, 2]).await;

    let AnchorOutcome::Anchored(first) = h.coordinator.anchor_current_state().await.unwrap() else {
        panic!("first attempt should anchor");
    };
    assert_eq!(first.status, AnchorStatus::Confirmed);
    assert_eq!(first.order_ids, vec![1, 2, 3]);
    assert_eq!(first.audit_count, 3);
    assert_eq!(first.chain_id, CHAIN_ID);
    assert!(first.tx_hash.is_some());

    let AnchorOutcome::AlreadyAnchored(second) =
        h.coordinator.anchor_current_state().await.unwrap()
    else {
        panic!("second attempt should be a no-op");
    };
    assert_eq!(second.id, first.id);
    assert_eq!(second.merkle_root, first.merkle_root);
    assert_eq!(second.tx_hash, first.tx_hash);

    assert_eq!(h.ledger.submissions(), 1);
    assert_eq!(h.storage.count_anchors(AnchorStatus::Confirmed).await.unwrap(), 1);
}

#[tokio::test]
async fn test_concurrent_attempts_submit_once() {
    let h = Harness::new().await;
    h.record(1..=5).await;

    let (a, b) = tokio::join!(
        h.coordinator.anchor_current_state(),
        h.coordinator.anchor_current_state()
    );
    let labels = [a.unwrap().label(), b.unwrap().label()];
    assert!(labels.contains(&"anchored"));
    assert!(labels.contains(&"already_anchored"));
    assert_eq!(h.ledger.submissions(), 1);
}

#[tokio::test]
async fn test_failed_submission_leaves_failed_row_and_retry_creates_new_row() {
    let h = Harness::new().await;
    h.record([1, 2]).await;
    h.ledger.fail_next.store(true, Ordering::SeqCst);

    let err = h.coordinator.anchor_current_state().await.unwrap_err();
    let AnchorError::AnchorSubmissionFailed { anchor_id, root, .. } = err else {
        panic!("expected AnchorSubmissionFailed");
    };

    let failed = h.storage.get_anchor(anchor_id).await.unwrap().unwrap();
    assert_eq!(failed.status, AnchorStatus::Failed);
    assert_eq!(failed.merkle_root, root);
    assert!(failed.error.unwrap().contains("connection refused"));

    let AnchorOutcome::Anchored(retried) = h.coordinator.anchor_current_state().await.unwrap()
    else {
        panic!("retry should anchor");
    };
    assert_ne!(retried.id, anchor_id);
    assert_eq!(retried.merkle_root, root);

    let all = h.coordinator.list_anchors().await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].id, retried.id);
    assert_eq!(all[1].status, AnchorStatus::Failed);
}

#[tokio::test]
async fn test_submission_timeout_fails_row() {
    let h = Harness::with_ledger(
        MockLedger::with_delay(Duration::from_secs(30)),
        CoordinatorOptions {
            submission_timeout: Duration::from_millis(50),
            ..Default::default()
        },
    )
    .await;
    h.record([1]).await;

    let err = h.coordinator.anchor_current_state().await.unwrap_err();
    let AnchorError::AnchorSubmissionFailed {
        anchor_id, source, ..
    } = err
    else {
        panic!("expected AnchorSubmissionFailed");
    };
    assert!(matches!(source, LedgerError::SubmissionTimeout(_)));
    assert_eq!(
        h.storage.get_anchor(anchor_id).await.unwrap().unwrap().status,
        AnchorStatus::Failed
    );
}

#[tokio::test]
async fn test_cancelled_attempt_never_submits() {
    let h = Harness::new().await;
    h.record([1, 2]).await;
    h.shutdown.cancel();

    let err = h.coordinator.anchor_current_state().await.unwrap_err();
    assert!(matches!(err, AnchorError::Cancelled));
    assert_eq!(h.ledger.submissions(), 0);

    let all = h.coordinator.list_anchors().await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].status, AnchorStatus::Failed);
    assert_eq!(all[0].error.as_deref(), Some(CANCELLED_REASON));
}

#[tokio::test]
async fn test_proof_for_older_batch_after_new_audits() {
    let h = Harness::new().await;
    h.record(1..=3).await;
    let AnchorOutcome::Anchored(first) = h.coordinator.anchor_current_state().await.unwrap() else {
        panic!("should anchor");
    };

    // Order 4 arrives after the first anchor and is not covered yet
    h.record([4]).await;
    let digest_4 = h.audits.get(4).await.unwrap().unwrap().digest;
    assert_eq!(
        h.coordinator.get_verification(4, &digest_4).await.unwrap(),
        Coverage::NotAnchored
    );

    let digest_2 = h.audits.get(2).await.unwrap().unwrap().digest;
    let Coverage::Anchored(bundle) = h.coordinator.get_verification(2, &digest_2).await.unwrap()
    else {
        panic!("order 2 should be covered");
    };
    assert_eq!(bundle.merkle_root, first.merkle_root);
    assert_eq!(bundle.leaf_index, 1);
    assert_eq!(bundle.anchor.anchor_id, first.id);
    assert_eq!(bundle.anchor.chain_id, CHAIN_ID);

    let siblings: Vec<B256> = bundle.proof.iter().map(|p| p.parse().unwrap()).collect();
    assert!(h
        .coordinator
        .verify_against_chain(&bundle.merkle_root, 2, &digest_2, &siblings));
    assert!(!h
        .coordinator
        .verify_against_chain(&bundle.merkle_root, 3, &digest_2, &siblings));

    // Second anchor now covers order 4, and order 2 moves to the newest anchor
    let AnchorOutcome::Anchored(second) = h.coordinator.anchor_current_state().await.unwrap()
    else {
        panic!("new population should anchor");
    };
    let Coverage::Anchored(bundle) = h.coordinator.get_verification(4, &digest_4).await.unwrap()
    else {
        panic!("order 4 should be covered");
    };
    assert_eq!(bundle.anchor.anchor_id, second.id);
}

#[tokio::test]
async fn test_diverged_batch_is_reported() {
    let h = Harness::new().await;
    h.record([1]).await;
    let digest = h.audits.get(1).await.unwrap().unwrap().digest;

    // A confirmed anchor whose root the audits cannot reproduce
    let bogus = h
        .storage
        .insert_pending_anchor(&NewAnchor {
            merkle_root: B256::repeat_byte(0x77),
            chain_id: CHAIN_ID,
            order_ids: vec![1],
            created_at: 0,
        })
        .await
        .unwrap()
        .unwrap();
    h.storage
        .mark_anchor_confirmed(
            bogus.id,
            &AnchorConfirmation {
                tx_hash: B256::repeat_byte(0x01),
                block_number: 1,
                confirmed_at: 1,
            },
        )
        .await
        .unwrap();

    assert!(matches!(
        h.coordinator.get_verification(1, &digest).await,
        Err(AnchorError::AnchorRootDiverged { .. })
    ));

    // The off-chain verdict still stands
    let response = h.assembler().assemble(1, &facts(1)).await.unwrap();
    assert_eq!(response.status, IntegrityStatus::Verified);
    assert_eq!(response.anchor.status, AnchorLayerStatus::Unavailable);
    assert!(response.anchor.error.is_some());
}

#[tokio::test]
async fn test_end_to_end_order_42() {
    let h = Harness::new().await;
    h.record([7, 99]).await;
    let digest = h.audits.record_order(&order_42()).await.unwrap();
    assert_eq!(
        digest,
        "550ce01c1939ada18e13c840090e2f3fbf9b0b3ec1f9db49d2dd914891bdff0b"
    );

    // Before anchoring
    let response = h.assembler().assemble(42, &order_42()).await.unwrap();
    assert_eq!(response.status, IntegrityStatus::Verified);
    assert_eq!(response.anchor.status, AnchorLayerStatus::NotAnchored);
    assert_eq!(response.canonical_input, "42100250.51700000000000");
    assert_eq!(response.algorithm, "SHA-256");

    h.coordinator.anchor_current_state().await.unwrap();

    let response = h.assembler().assemble(42, &order_42()).await.unwrap();
    assert_eq!(response.status, IntegrityStatus::Verified);
    assert!(!response.tampered);
    assert_eq!(response.stored_digest.as_deref(), Some(digest.as_str()));
    assert_eq!(response.computed_digest, digest);
    assert_eq!(response.anchor.status, AnchorLayerStatus::Anchored);
    assert_eq!(response.anchor.proof_valid, Some(true));
    assert_eq!(response.anchor.leaf_index, Some(1));

    // Price edited after payment
    let mut edited = order_42();
    edited.total_price = Decimal::new(25051, 2);
    let response = h.assembler().assemble(42, &edited).await.unwrap();
    assert_eq!(response.status, IntegrityStatus::Mismatch);
    assert!(response.tampered);
    assert!(response.message.starts_with("TAMPERING DETECTED"));
    assert_ne!(response.computed_digest, digest);
    assert_eq!(response.canonical_input, "42100250.511700000000000");
    // The recorded digest is still provably anchored
    assert_eq!(response.anchor.status, AnchorLayerStatus::Anchored);
    assert_eq!(response.anchor.proof_valid, Some(true));
}

#[tokio::test]
async fn test_unknown_order_is_not_found() {
    let h = Harness::new().await;
    let response = h.assembler().assemble(42, &order_42()).await.unwrap();
    assert_eq!(response.status, IntegrityStatus::NotFound);
    assert!(!response.tampered);
    assert!(response.stored_digest.is_none());
    assert_eq!(response.anchor.status, AnchorLayerStatus::NotAnchored);
}

#[tokio::test]
async fn test_recover_pending() {
    let h = Harness::with_ledger(
        MockLedger::default(),
        CoordinatorOptions {
            stale_pending_after: Duration::from_secs(60),
            ..Default::default()
        },
    )
    .await;
    let now = Utc::now().timestamp_millis();

    // Crashed after the ledger accepted the root
    let landed_root = B256::repeat_byte(0x11);
    let landed = h
        .storage
        .insert_pending_anchor(&NewAnchor {
            merkle_root: landed_root,
            chain_id: CHAIN_ID,
            order_ids: vec![1, 2],
            created_at: now,
        })
        .await
        .unwrap()
        .unwrap();
    let receipt = h.ledger.preload(landed_root, 2);

    // Crashed before submitting, long ago
    let stale = h
        .storage
        .insert_pending_anchor(&NewAnchor {
            merkle_root: B256::repeat_byte(0x22),
            chain_id: CHAIN_ID,
            order_ids: vec![1],
            created_at: now - 3_600_000,
        })
        .await
        .unwrap()
        .unwrap();

    // Possibly still in flight elsewhere
    let fresh = h
        .storage
        .insert_pending_anchor(&NewAnchor {
            merkle_root: B256::repeat_byte(0x33),
            chain_id: CHAIN_ID,
            order_ids: vec![3],
            created_at: now,
        })
        .await
        .unwrap()
        .unwrap();

    let report = h.coordinator.recover_pending().await.unwrap();
    assert_eq!(report.confirmed, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.still_pending, 1);
    assert_eq!(report.superseded, 0);

    let landed = h.storage.get_anchor(landed.id).await.unwrap().unwrap();
    assert_eq!(landed.status, AnchorStatus::Confirmed);
    assert_eq!(landed.tx_hash, Some(receipt.tx_hash));
    assert_eq!(landed.block_number, Some(receipt.block_number));
    assert_eq!(landed.confirmed_at, Some(1_700_000_500_000));

    assert_eq!(
        h.storage.get_anchor(stale.id).await.unwrap().unwrap().status,
        AnchorStatus::Failed
    );
    assert_eq!(
        h.storage.get_anchor(fresh.id).await.unwrap().unwrap().status,
        AnchorStatus::Pending
    );

    // Nothing left to do for the reconciled rows
    let again = h.coordinator.recover_pending().await.unwrap();
    assert_eq!(again.confirmed + again.failed + again.superseded, 0);
    assert_eq!(again.still_pending, 1);
}

#[tokio::test]
async fn test_recover_supersedes_duplicate_of_confirmed_root() {
    let h = Harness::new().await;
    h.record([1, 2]).await;
    let AnchorOutcome::Anchored(confirmed) = h.coordinator.anchor_current_state().await.unwrap()
    else {
        panic!("should anchor");
    };

    let duplicate = h
        .storage
        .insert_pending_anchor(&NewAnchor {
            merkle_root: confirmed.merkle_root,
            chain_id: CHAIN_ID,
            order_ids: confirmed.order_ids.clone(),
            created_at: Utc::now().timestamp_millis(),
        })
        .await
        .unwrap()
        .unwrap();

    let report = h.coordinator.recover_pending().await.unwrap();
    assert_eq!(report.superseded, 1);

    let duplicate = h.storage.get_anchor(duplicate.id).await.unwrap().unwrap();
    assert_eq!(duplicate.status, AnchorStatus::Failed);
    assert_eq!(
        duplicate.error,
        Some(format!("superseded by anchor {}", confirmed.id))
    );
}

#[tokio::test]
async fn test_deploy_delegates_to_ledger() {
    let h = Harness::new().await;
    let address = h
        .coordinator
        .deploy(Bytes::from_static(&[0x60, 0x80]))
        .await
        .unwrap();
    assert_eq!(address, Address::repeat_byte(0xaa));
}

#[tokio::test]
async fn test_row_failed_during_submission_is_not_reported_anchored() {
    let h = Harness::new().await;
    h.record([1, 2]).await;
    *h.ledger.interloper.lock().unwrap() = Some((h.storage.clone(), Interloper::Fail));

    let err = h.coordinator.anchor_current_state().await.unwrap_err();
    assert!(matches!(
        err,
        AnchorError::AnchorNotConfirmed {
            status: Some(AnchorStatus::Failed),
            ..
        }
    ));
    assert_eq!(h.ledger.submissions(), 1);

    let anchors = h.coordinator.list_anchors().await.unwrap();
    assert_eq!(anchors.len(), 1);
    assert_eq!(anchors[0].status, AnchorStatus::Failed);
}

#[tokio::test]
async fn test_row_confirmed_during_submission_is_reported_anchored() {
    let h = Harness::new().await;
    h.record([1, 2]).await;
    *h.ledger.interloper.lock().unwrap() = Some((h.storage.clone(), Interloper::Confirm));

    let AnchorOutcome::Anchored(anchor) = h.coordinator.anchor_current_state().await.unwrap()
    else {
        panic!("a row confirmed elsewhere is still anchored");
    };
    assert_eq!(anchor.status, AnchorStatus::Confirmed);
    assert_eq!(anchor.block_number, Some(99));
}

#[tokio::test]
async fn test_out_of_range_order_id_cannot_block_anchoring() {
    let h = Harness::new().await;
    h.record([7]).await;

    assert!(matches!(
        h.audits.record(&facts(u64::MAX)).await,
        Err(AuditError::InvalidFacts(_))
    ));

    // A record written before ids were bounded is left out of every tree
    let store = AuditStore::new(
        Arc::new(SqliteKvStore::new(&h.storage)),
        RetryPolicy::none(),
        2,
    );
    let stray = AuditRecord::new(facts(u64::MAX), CanonicalEncoding::Legacy, Utc::now());
    store.put(u64::MAX, &stray).await.unwrap();

    let AnchorOutcome::Anchored(anchor) = h.coordinator.anchor_current_state().await.unwrap()
    else {
        panic!("order 7 should anchor");
    };
    assert_eq!(anchor.order_ids, vec![7]);
    assert!(matches!(
        h.coordinator.anchor_current_state().await.unwrap(),
        AnchorOutcome::AlreadyAnchored(_)
    ));
    assert_eq!(h.ledger.submissions(), 1);
    assert_eq!(h.coordinator.list_anchors().await.unwrap().len(), 1);

    let response = h.assembler().assemble(7, &facts(7)).await.unwrap();
    assert_eq!(response.status, IntegrityStatus::Verified);
    assert_eq!(response.anchor.status, AnchorLayerStatus::Anchored);
}

#[tokio::test]
async fn test_coverage_rejects_order_ids_beyond_i64() {
    let h = Harness::new().await;

    let inserted = h
        .storage
        .insert_pending_anchor(&NewAnchor {
            merkle_root: B256::repeat_byte(0x55),
            chain_id: CHAIN_ID,
            order_ids: vec![1, u64::MAX],
            created_at: 0,
        })
        .await;
    assert!(inserted.is_err());
    assert!(h.storage.get_all_anchors().await.unwrap().is_empty());
    assert!(h
        .storage
        .get_latest_confirmed_anchor_for_order(u64::MAX)
        .await
        .unwrap()
        .is_none());
}
