//! Anchoring the audit tree root on a public ledger.
//!
//! Every attempt is a row in the `anchors` table that starts PENDING and ends
//! CONFIRMED or FAILED. A failed attempt is never retried in place; the next
//! call to [`AnchorCoordinator::anchor_current_state`] inserts a fresh row.

use alloy::primitives::{Address, Bytes, B256};
use chrono::Utc;
use orderproof_core::OrderId;
use orderproof_merkle::verify_standalone;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audit::AuditError;
use crate::batch::BatchBuilder;
use crate::ledger::{AnchorLedger, LedgerError};
use crate::storage::{AnchorConfirmation, AnchorRecord, AnchorStatus, NewAnchor, Storage};

pub mod scheduler;

pub use scheduler::AnchorScheduler;

/// Reason written on rows abandoned before reaching the ledger.
pub const CANCELLED_REASON: &str = "cancelled before submission";

/// Anchoring errors.
#[derive(Error, Debug)]
pub enum AnchorError {
    /// Submission or confirmation failed; the row was moved to FAILED.
    #[error("anchor {anchor_id} for root {root} failed: {source}")]
    AnchorSubmissionFailed {
        /// Row that was marked FAILED
        anchor_id: i64,
        /// Root that was being anchored
        root: B256,
        /// Ledger failure
        #[source]
        source: LedgerError,
    },

    /// Rebuilding an anchored batch gave a different root.
    #[error("anchor {anchor_id} committed to {anchored} but its audits now give {rebuilt}")]
    AnchorRootDiverged {
        /// Anchor row
        anchor_id: i64,
        /// Root on record
        anchored: B256,
        /// Root of the rebuilt batch
        rebuilt: B256,
    },

    /// Ledger call outside a submission.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Anchor table access failed.
    #[error("anchor storage error: {0:#}")]
    Storage(anyhow::Error),

    /// The ledger accepted the root but the row was settled elsewhere as not CONFIRMED.
    #[error("anchor {anchor_id} was submitted but its row is {status:?}, not CONFIRMED")]
    AnchorNotConfirmed {
        /// Anchor row
        anchor_id: i64,
        /// State found on re-read; `None` if the row is gone
        status: Option<AnchorStatus>,
    },

    /// Shutdown was requested before submission.
    #[error("anchoring cancelled before submission")]
    Cancelled,

    /// Reading audits failed.
    #[error(transparent)]
    Audit(#[from] AuditError),
}

/// Result of [`AnchorCoordinator::anchor_current_state`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnchorOutcome {
    /// There are no audits, so there is nothing to anchor.
    NoAuditsToAnchor,
    /// The current root already has a CONFIRMED anchor; nothing was submitted.
    AlreadyAnchored(AnchorRecord),
    /// Another process holds a PENDING row for the current root.
    InFlight(AnchorRecord),
    /// The root was submitted and confirmed.
    Anchored(AnchorRecord),
}

impl AnchorOutcome {
    /// The anchor row involved, if any.
    pub fn anchor(&self) -> Option<&AnchorRecord> {
        match self {
            Self::NoAuditsToAnchor => None,
            Self::AlreadyAnchored(a) | Self::InFlight(a) | Self::Anchored(a) => Some(a),
        }
    }

    /// Short label for logs and API responses.
    pub fn label(&self) -> &'static str {
        match self {
            Self::NoAuditsToAnchor => "no_audits_to_anchor",
            Self::AlreadyAnchored(_) => "already_anchored",
            Self::InFlight(_) => "in_flight",
            Self::Anchored(_) => "anchored",
        }
    }
}

/// Where an anchored proof was published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchorRef {
    /// Anchor row id
    pub anchor_id: i64,
    /// Anchoring transaction
    pub tx_hash: B256,
    /// Inclusion block
    pub block_number: u64,
    /// Chain id
    pub chain_id: u64,
    /// Confirmation time (Unix millis)
    pub confirmed_at: i64,
    /// Block explorer link for the transaction
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explorer_url: Option<String>,
}

/// Everything needed to check one order against an anchored root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofBundle {
    /// Order id
    pub order_id: OrderId,
    /// Digest the proof is for
    pub digest: String,
    /// Anchored root
    pub merkle_root: B256,
    /// Sibling hashes, leaf to root, as 0x-prefixed hex
    pub proof: Vec<String>,
    /// Position of the leaf in sorted order
    pub leaf_index: usize,
    /// Publication details
    pub anchor: AnchorRef,
}

/// Result of [`AnchorCoordinator::get_verification`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Coverage {
    /// A confirmed anchor covers the order.
    Anchored(ProofBundle),
    /// No confirmed anchor covers the order yet.
    NotAnchored,
}

/// Counts from one [`AnchorCoordinator::recover_pending`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
    /// PENDING rows found on chain and confirmed
    pub confirmed: usize,
    /// PENDING rows whose root already had a CONFIRMED row
    pub superseded: usize,
    /// Stale PENDING rows given up on
    pub failed: usize,
    /// PENDING rows left for a later pass
    pub still_pending: usize,
}

/// Coordinator tuning.
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// Upper bound on submission plus confirmation wait
    pub submission_timeout: Duration,
    /// PENDING rows older than this are failed by recovery
    pub stale_pending_after: Duration,
    /// Block explorer base URL, e.g. `https://sepolia.basescan.org`
    pub explorer_url: Option<String>,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            submission_timeout: Duration::from_secs(900),
            stale_pending_after: Duration::from_secs(3600),
            explorer_url: None,
        }
    }
}

/// Drives anchor attempts and answers coverage questions.
pub struct AnchorCoordinator {
    storage: Storage,
    batches: BatchBuilder,
    ledger: Arc<dyn AnchorLedger>,
    options: CoordinatorOptions,
    // Single-flight: one attempt (or recovery pass) at a time per process
    in_flight: Mutex<()>,
    shutdown: CancellationToken,
}

impl AnchorCoordinator {
    /// Create a coordinator.
    ///
    /// Cancelling `shutdown` stops any attempt that has not yet submitted.
    pub fn new(
        storage: Storage,
        batches: BatchBuilder,
        ledger: Arc<dyn AnchorLedger>,
        options: CoordinatorOptions,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            storage,
            batches,
            ledger,
            options,
            in_flight: Mutex::new(()),
            shutdown,
        }
    }

    /// Chain anchors are written to.
    pub fn chain_id(&self) -> u64 {
        self.ledger.chain_id()
    }

    /// Explorer link for a transaction, if an explorer is configured.
    pub fn explorer_tx_url(&self, tx_hash: &B256) -> Option<String> {
        self.options
            .explorer_url
            .as_deref()
            .map(|base| format!("{}/tx/{}", base.trim_end_matches('/'), tx_hash))
    }

    /// Anchor the current audit population.
    pub async fn anchor_current_state(&self) -> Result<AnchorOutcome, AnchorError> {
        let _guard = self.in_flight.lock().await;

        let Some(built) = self.batches.build().await? else {
            info!("No audits to anchor");
            return Ok(AnchorOutcome::NoAuditsToAnchor);
        };

        if let Some(existing) = self
            .storage
            .get_confirmed_anchor_by_root(&built.root)
            .await
            .map_err(AnchorError::Storage)?
        {
            debug!(
                anchor_id = existing.id,
                root = %built.root,
                "Root already anchored, skipping submission"
            );
            return Ok(AnchorOutcome::AlreadyAnchored(existing));
        }

        let new_anchor = NewAnchor {
            merkle_root: built.root,
            chain_id: self.ledger.chain_id(),
            order_ids: built.order_ids.clone(),
            created_at: Utc::now().timestamp_millis(),
        };

        let pending = match self
            .storage
            .insert_pending_anchor(&new_anchor)
            .await
            .map_err(AnchorError::Storage)?
        {
            Some(pending) => pending,
            None => return self.resolve_duplicate(&built.root).await,
        };

        info!(
            anchor_id = pending.id,
            root = %built.root,
            leaves = built.leaf_count,
            "Created PENDING anchor"
        );

        if self.shutdown.is_cancelled() {
            self.fail(pending.id, CANCELLED_REASON).await;
            return Err(AnchorError::Cancelled);
        }

        let timeout = self.options.submission_timeout;
        let submission = tokio::time::timeout(
            timeout,
            self.ledger.anchor(built.root, built.leaf_count as u64),
        )
        .await
        .unwrap_or(Err(LedgerError::SubmissionTimeout(timeout)));

        let receipt = match submission {
            Ok(receipt) => receipt,
            Err(e) => {
                warn!(anchor_id = pending.id, root = %built.root, "Anchor submission failed: {}", e);
                self.fail(pending.id, &e.to_string()).await;
                return Err(AnchorError::AnchorSubmissionFailed {
                    anchor_id: pending.id,
                    root: built.root,
                    source: e,
                });
            }
        };

        let confirmation = AnchorConfirmation {
            tx_hash: receipt.tx_hash,
            block_number: receipt.block_number,
            confirmed_at: Utc::now().timestamp_millis(),
        };
        let updated = self
            .storage
            .mark_anchor_confirmed(pending.id, &confirmation)
            .await
            .map_err(AnchorError::Storage)?;
        if !updated {
            // Recovery or another process settled the row while we were submitting
            let current = self
                .storage
                .get_anchor(pending.id)
                .await
                .map_err(AnchorError::Storage)?;
            return match current {
                Some(record) if record.status == AnchorStatus::Confirmed => {
                    info!(anchor_id = record.id, "Anchor was confirmed concurrently");
                    Ok(AnchorOutcome::Anchored(record))
                }
                other => {
                    let status = other.map(|r| r.status);
                    warn!(
                        anchor_id = pending.id,
                        tx_hash = %receipt.tx_hash,
                        ?status,
                        "Anchor row left PENDING state while submitting"
                    );
                    Err(AnchorError::AnchorNotConfirmed {
                        anchor_id: pending.id,
                        status,
                    })
                }
            };
        }

        info!(
            anchor_id = pending.id,
            root = %built.root,
            tx_hash = %receipt.tx_hash,
            block = receipt.block_number,
            "Anchor confirmed"
        );

        let record = self
            .storage
            .get_anchor(pending.id)
            .await
            .map_err(AnchorError::Storage)?
            .unwrap_or(AnchorRecord {
                status: AnchorStatus::Confirmed,
                tx_hash: Some(confirmation.tx_hash),
                block_number: Some(confirmation.block_number),
                confirmed_at: Some(confirmation.confirmed_at),
                ..pending
            });

        Ok(AnchorOutcome::Anchored(record))
    }

    /// The insert lost to an existing PENDING row for `root`.
    async fn resolve_duplicate(&self, root: &B256) -> Result<AnchorOutcome, AnchorError> {
        if let Some(pending) = self
            .storage
            .get_pending_anchor_by_root(root)
            .await
            .map_err(AnchorError::Storage)?
        {
            info!(
                anchor_id = pending.id,
                root = %root,
                "Another attempt for this root is in flight"
            );
            return Ok(AnchorOutcome::InFlight(pending));
        }

        // The other attempt finished between our insert and this lookup
        match self
            .storage
            .get_confirmed_anchor_by_root(root)
            .await
            .map_err(AnchorError::Storage)?
        {
            Some(confirmed) => Ok(AnchorOutcome::AlreadyAnchored(confirmed)),
            None => Err(AnchorError::Storage(anyhow::anyhow!(
                "PENDING insert for root {} was refused but no PENDING row exists",
                root
            ))),
        }
    }

    async fn fail(&self, anchor_id: i64, reason: &str) {
        match self.storage.mark_anchor_failed(anchor_id, reason).await {
            Ok(true) => {}
            Ok(false) => warn!(anchor_id, "Anchor row was no longer PENDING"),
            Err(e) => error!(anchor_id, "Failed to mark anchor as FAILED: {:#}", e),
        }
    }

    /// Proof that `(order_id, digest)` is covered by a confirmed anchor.
    ///
    /// Uses the most recent CONFIRMED anchor covering the order and rebuilds
    /// exactly that batch from the audit store.
    pub async fn get_verification(
        &self,
        order_id: OrderId,
        digest: &str,
    ) -> Result<Coverage, AnchorError> {
        let Some(anchor) = self
            .storage
            .get_latest_confirmed_anchor_for_order(order_id)
            .await
            .map_err(AnchorError::Storage)?
        else {
            return Ok(Coverage::NotAnchored);
        };

        let Some(built) = self.batches.build_for(&anchor.order_ids).await? else {
            return Err(AnchorError::AnchorRootDiverged {
                anchor_id: anchor.id,
                anchored: anchor.merkle_root,
                rebuilt: B256::ZERO,
            });
        };

        if built.root != anchor.merkle_root {
            warn!(
                anchor_id = anchor.id,
                anchored = %anchor.merkle_root,
                rebuilt = %built.root,
                "Anchored batch no longer rebuilds to its root"
            );
            return Err(AnchorError::AnchorRootDiverged {
                anchor_id: anchor.id,
                anchored: anchor.merkle_root,
                rebuilt: built.root,
            });
        }

        let Some(proof) = built.proof(order_id, digest) else {
            debug!(order_id, digest, "Digest not in anchored batch");
            return Ok(Coverage::NotAnchored);
        };

        let (Some(tx_hash), Some(block_number), Some(confirmed_at)) =
            (anchor.tx_hash, anchor.block_number, anchor.confirmed_at)
        else {
            return Err(AnchorError::Storage(anyhow::anyhow!(
                "CONFIRMED anchor {} is missing its transaction details",
                anchor.id
            )));
        };

        Ok(Coverage::Anchored(ProofBundle {
            order_id,
            digest: digest.to_string(),
            merkle_root: anchor.merkle_root,
            proof: proof.siblings_hex(),
            leaf_index: proof.leaf_index,
            anchor: AnchorRef {
                anchor_id: anchor.id,
                tx_hash,
                block_number,
                chain_id: anchor.chain_id,
                confirmed_at,
                explorer_url: self.explorer_tx_url(&tx_hash),
            },
        }))
    }

    /// Check a proof against a root. Offline; never touches the ledger.
    pub fn verify_against_chain(
        &self,
        root: &B256,
        order_id: OrderId,
        digest: &str,
        proof: &[B256],
    ) -> bool {
        verify_standalone(root, order_id, digest, proof)
    }

    /// Reconcile PENDING rows left behind by a crash or a lost response.
    ///
    /// A row whose root the contract reports (as its latest anchor, or through
    /// its anchor event) is confirmed. A row whose root already has a
    /// CONFIRMED row is superseded. Other rows older than the stale age fail.
    pub async fn recover_pending(&self) -> Result<RecoveryReport, AnchorError> {
        let _guard = self.in_flight.lock().await;
        let mut report = RecoveryReport::default();

        let pending = self
            .storage
            .get_pending_anchors()
            .await
            .map_err(AnchorError::Storage)?;
        if pending.is_empty() {
            return Ok(report);
        }

        info!("Reconciling {} PENDING anchor(s)", pending.len());

        let latest = self.ledger.latest_anchor().await?;
        let now = Utc::now().timestamp_millis();
        let stale_before = now - self.options.stale_pending_after.as_millis() as i64;

        for row in pending {
            if let Some(confirmed) = self
                .storage
                .get_confirmed_anchor_by_root(&row.merkle_root)
                .await
                .map_err(AnchorError::Storage)?
            {
                let reason = format!("superseded by anchor {}", confirmed.id);
                if self
                    .storage
                    .mark_anchor_failed(row.id, &reason)
                    .await
                    .map_err(AnchorError::Storage)?
                {
                    report.superseded += 1;
                }
                continue;
            }

            let on_chain_latest = latest.as_ref().filter(|l| l.root == row.merkle_root);
            let is_stale = row.created_at < stale_before;

            // Only go to the event log when there is a reason to expect a hit
            let receipt = if on_chain_latest.is_some() || is_stale {
                self.ledger.find_anchor(row.merkle_root).await?
            } else {
                None
            };

            match receipt {
                Some(receipt) => {
                    let confirmed_at = on_chain_latest
                        .map(|l| l.timestamp as i64 * 1000)
                        .unwrap_or(now);
                    let confirmation = AnchorConfirmation {
                        tx_hash: receipt.tx_hash,
                        block_number: receipt.block_number,
                        confirmed_at,
                    };
                    if self
                        .storage
                        .mark_anchor_confirmed(row.id, &confirmation)
                        .await
                        .map_err(AnchorError::Storage)?
                    {
                        info!(
                            anchor_id = row.id,
                            tx_hash = %receipt.tx_hash,
                            "Recovered PENDING anchor from chain"
                        );
                        report.confirmed += 1;
                    }
                }
                None if is_stale => {
                    let reason = format!(
                        "no on-chain anchor found after {}s",
                        self.options.stale_pending_after.as_secs()
                    );
                    if self
                        .storage
                        .mark_anchor_failed(row.id, &reason)
                        .await
                        .map_err(AnchorError::Storage)?
                    {
                        warn!(anchor_id = row.id, root = %row.merkle_root, "Failed stale PENDING anchor");
                        report.failed += 1;
                    }
                }
                None => {
                    if on_chain_latest.is_some() {
                        warn!(
                            anchor_id = row.id,
                            "Root is anchored on chain but its transaction was not found"
                        );
                    }
                    report.still_pending += 1;
                }
            }
        }

        Ok(report)
    }

    /// Deploy the anchor contract.
    pub async fn deploy(&self, bytecode: Bytes) -> Result<Address, AnchorError> {
        Ok(self.ledger.deploy(bytecode).await?)
    }

    /// All anchors, newest first.
    pub async fn list_anchors(&self) -> Result<Vec<AnchorRecord>, AnchorError> {
        self.storage
            .get_all_anchors()
            .await
            .map_err(AnchorError::Storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_labels() {
        assert_eq!(AnchorOutcome::NoAuditsToAnchor.label(), "no_audits_to_anchor");
        assert!(AnchorOutcome::NoAuditsToAnchor.anchor().is_none());
    }

    #[test]
    fn test_submission_failure_message() {
        let err = AnchorError::AnchorSubmissionFailed {
            anchor_id: 7,
            root: B256::ZERO,
            source: LedgerError::Unavailable("connection refused".into()),
        };
        let msg = err.to_string();
        assert!(msg.contains("anchor 7"));
        assert!(msg.contains("connection refused"));
    }
}
