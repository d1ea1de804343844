//! Public verification responses.
//!
//! Two independent layers: the off-chain check of live facts against the
//! recorded digest, and the on-chain proof that the recorded digest was
//! anchored. The off-chain verdict always decides the status; the anchor
//! layer only adds assurance.

use alloy::primitives::B256;
use chrono::{DateTime, Utc};
use orderproof_core::{CanonicalEncoding, OrderId, TransactionFacts, ALGORITHM};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

use crate::anchor::{AnchorCoordinator, Coverage, ProofBundle};
use crate::audit::{AuditError, AuditService, IntegrityStatus};

/// Anchor layer outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorLayerStatus {
    /// A confirmed anchor covers the digest
    Anchored,
    /// No confirmed anchor covers the digest yet
    NotAnchored,
    /// Anchoring could not be checked
    Unavailable,
}

/// On-chain layer of a verification response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchorLayer {
    /// Layer outcome
    pub status: AnchorLayerStatus,
    /// Anchored root
    #[serde(rename = "root", skip_serializing_if = "Option::is_none")]
    pub merkle_root: Option<B256>,
    /// Anchoring transaction
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<B256>,
    /// Inclusion block
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
    /// Chain id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<u64>,
    /// Explorer link for the transaction
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explorer_url: Option<String>,
    /// Sibling hashes, leaf to root
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proof: Option<Vec<String>>,
    /// Leaf position in the anchored tree
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leaf_index: Option<usize>,
    /// Whether the proof recomputes the anchored root
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proof_valid: Option<bool>,
    /// Why the layer is unavailable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AnchorLayer {
    fn empty(status: AnchorLayerStatus) -> Self {
        Self {
            status,
            merkle_root: None,
            tx_hash: None,
            block_number: None,
            chain_id: None,
            explorer_url: None,
            proof: None,
            leaf_index: None,
            proof_valid: None,
            error: None,
        }
    }

    fn unavailable(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::empty(AnchorLayerStatus::Unavailable)
        }
    }

    fn anchored(bundle: ProofBundle, proof_valid: bool) -> Self {
        Self {
            status: AnchorLayerStatus::Anchored,
            merkle_root: Some(bundle.merkle_root),
            tx_hash: Some(bundle.anchor.tx_hash),
            block_number: Some(bundle.anchor.block_number),
            chain_id: Some(bundle.anchor.chain_id),
            explorer_url: bundle.anchor.explorer_url,
            proof: Some(bundle.proof),
            leaf_index: Some(bundle.leaf_index),
            proof_valid: Some(proof_valid),
            error: None,
        }
    }
}

/// The live facts the verdict was computed from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderSummary {
    /// Total credits
    pub total_credits: i64,
    /// Total price
    pub total_price: Decimal,
    /// Payment time
    pub paid_at: DateTime<Utc>,
}

/// Everything a third party needs to check one order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResponse {
    /// Order checked
    pub order_id: OrderId,
    /// Off-chain verdict
    pub status: IntegrityStatus,
    /// Digest recorded at payment time
    pub stored_digest: Option<String>,
    /// Digest of the live facts
    pub computed_digest: String,
    /// Live facts differ from the recorded audit
    pub tampered: bool,
    /// Human-readable summary
    pub message: String,
    /// On-chain layer
    pub anchor: AnchorLayer,
    /// Hash algorithm, for reproducing `computedDigest`
    pub algorithm: &'static str,
    /// How `canonicalInput` is built
    pub hash_formula: &'static str,
    /// Encoding of `canonicalInput`
    pub encoding: CanonicalEncoding,
    /// Exact string that was hashed
    pub canonical_input: String,
    /// Live facts
    pub order_summary: OrderSummary,
    /// Response time
    pub verified_at: DateTime<Utc>,
}

/// Builds [`VerificationResponse`]s.
#[derive(Clone)]
pub struct VerificationAssembler {
    audits: Arc<AuditService>,
    coordinator: Option<Arc<AnchorCoordinator>>,
}

impl VerificationAssembler {
    /// Create an assembler. Without a coordinator the anchor layer reports
    /// `unavailable`.
    pub fn new(audits: Arc<AuditService>, coordinator: Option<Arc<AnchorCoordinator>>) -> Self {
        Self {
            audits,
            coordinator,
        }
    }

    /// Verify `live_facts` for `order_id`.
    ///
    /// Fails only when the audit store cannot be read: "could not determine"
    /// must never look like a verdict. Anchor layer failures are reported in
    /// the response instead.
    pub async fn assemble(
        &self,
        order_id: OrderId,
        live_facts: &TransactionFacts,
    ) -> Result<VerificationResponse, AuditError> {
        let check = self.audits.verify(order_id, live_facts).await?;

        // Prove what was recorded, not what the live row says now
        let proof_digest = check
            .stored_digest
            .clone()
            .unwrap_or_else(|| check.computed_digest.clone());
        let anchor = self.anchor_layer(order_id, &proof_digest).await;

        let message = match (check.status, anchor.status) {
            (IntegrityStatus::Mismatch, _) => {
                "TAMPERING DETECTED: order facts no longer match the recorded audit".to_string()
            }
            (IntegrityStatus::NotFound, _) => "No audit record exists for this order".to_string(),
            (IntegrityStatus::Verified, AnchorLayerStatus::Anchored) => {
                "Order facts match the recorded audit, which is anchored on chain".to_string()
            }
            (IntegrityStatus::Verified, AnchorLayerStatus::NotAnchored) => {
                "Order facts match the recorded audit; not yet anchored on chain".to_string()
            }
            (IntegrityStatus::Verified, AnchorLayerStatus::Unavailable) => {
                "Order facts match the recorded audit; on-chain anchoring could not be checked"
                    .to_string()
            }
        };

        Ok(VerificationResponse {
            order_id,
            status: check.status,
            tampered: check.tampered(),
            stored_digest: check.stored_digest,
            computed_digest: check.computed_digest,
            message,
            anchor,
            algorithm: ALGORITHM,
            hash_formula: check.encoding.hash_formula(),
            encoding: check.encoding,
            canonical_input: check.canonical_string,
            order_summary: OrderSummary {
                total_credits: live_facts.total_credits,
                total_price: live_facts.total_price,
                paid_at: live_facts.paid_at,
            },
            verified_at: Utc::now(),
        })
    }

    async fn anchor_layer(&self, order_id: OrderId, digest: &str) -> AnchorLayer {
        let Some(coordinator) = &self.coordinator else {
            return AnchorLayer::unavailable("anchoring is not configured");
        };

        match coordinator.get_verification(order_id, digest).await {
            Ok(Coverage::Anchored(bundle)) => {
                let proof_valid = match parse_proof(&bundle.proof) {
                    Some(siblings) => coordinator.verify_against_chain(
                        &bundle.merkle_root,
                        order_id,
                        digest,
                        &siblings,
                    ),
                    None => false,
                };
                AnchorLayer::anchored(bundle, proof_valid)
            }
            Ok(Coverage::NotAnchored) => AnchorLayer::empty(AnchorLayerStatus::NotAnchored),
            Err(e) => {
                warn!(order_id, "Anchor verification failed: {}", e);
                AnchorLayer::unavailable(e.to_string())
            }
        }
    }
}

fn parse_proof(proof: &[String]) -> Option<Vec<B256>> {
    proof.iter().map(|h| h.parse::<B256>().ok()).collect()
}
