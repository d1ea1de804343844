//! OrderProof offline verifier.
//!
//! Checks a published verification response without trusting the server:
//! - the published digest is SHA-256 of the published canonical input
//! - the canonical input matches the order facts, when the caller has them
//! - the Merkle proof folds to the anchored root

use anyhow::Context;
use chrono::{TimeZone, Utc};
use orderproof_core::{
    codec::{canonicalize_with, digest_canonical},
    compute_leaf_hash, CanonicalEncoding, OrderId, TransactionFacts, ALGORITHM, B256,
};
use orderproof_merkle::{verify_standalone, MerkleBuilder};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

fn parse_b256(s: &str) -> anyhow::Result<B256> {
    s.parse::<B256>()
        .with_context(|| format!("invalid bytes32 hex: {}", s))
}

fn parse_siblings(proof: &[String]) -> anyhow::Result<Vec<B256>> {
    proof.iter().map(|s| parse_b256(s)).collect()
}

/// `anchor` section of a `/v1/verify` response (subset used by verifier).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnchorLayerJson {
    pub status: String,
    #[serde(rename = "root")]
    pub merkle_root: Option<String>,
    pub tx_hash: Option<String>,
    pub block_number: Option<u64>,
    pub chain_id: Option<u64>,
    pub proof: Option<Vec<String>>,
    pub leaf_index: Option<usize>,
    pub proof_valid: Option<bool>,
}

/// `/v1/verify` response (subset used by verifier).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResponseJson {
    pub order_id: OrderId,
    pub status: String,
    pub stored_digest: Option<String>,
    pub computed_digest: String,
    #[serde(default)]
    pub tampered: bool,
    #[serde(default)]
    pub anchor: AnchorLayerJson,
    pub algorithm: String,
    #[serde(default)]
    pub encoding: CanonicalEncoding,
    pub canonical_input: String,
}

/// `/v1/proof` response (subset used by verifier).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofBundleJson {
    pub order_id: OrderId,
    pub digest: String,
    pub merkle_root: String,
    pub proof: Vec<String>,
    pub leaf_index: usize,
}

/// What an offline check established.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyOutcome {
    pub order_id: OrderId,
    /// The server's verdict, now independently confirmed
    pub status: String,
    /// Root the recorded digest was proven against, if anchored
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anchored_root: Option<B256>,
}

/// Verify a `/v1/verify` response.
///
/// `facts` are the order values the caller believes in (for example from a
/// receipt); when given, they must produce the published canonical input.
/// `expected_root` pins the anchored root, e.g. to one read from the contract.
pub fn verify_response(
    response: &VerificationResponseJson,
    facts: Option<&TransactionFacts>,
    expected_root: Option<B256>,
) -> anyhow::Result<VerifyOutcome> {
    anyhow::ensure!(
        response.algorithm == ALGORITHM,
        "unsupported algorithm {} (expected {})",
        response.algorithm,
        ALGORITHM
    );

    let recomputed = digest_canonical(&response.canonical_input);
    anyhow::ensure!(
        recomputed == response.computed_digest,
        "computedDigest {} is not SHA-256(canonicalInput) = {}",
        response.computed_digest,
        recomputed
    );

    if let Some(facts) = facts {
        anyhow::ensure!(
            facts.order_id == response.order_id,
            "facts are for order {}, response is for order {}",
            facts.order_id,
            response.order_id
        );
        let canonical = canonicalize_with(facts, response.encoding);
        anyhow::ensure!(
            canonical == response.canonical_input,
            "facts encode to {:?}, response hashed {:?}",
            canonical,
            response.canonical_input
        );
    }

    match (response.status.as_str(), response.stored_digest.as_deref()) {
        ("verified", Some(stored)) => anyhow::ensure!(
            stored == response.computed_digest && !response.tampered,
            "status is verified but storedDigest differs from computedDigest"
        ),
        ("mismatch", Some(stored)) => anyhow::ensure!(
            stored != response.computed_digest && response.tampered,
            "status is mismatch but the digests agree"
        ),
        ("not_found", None) => {}
        (status, stored) => anyhow::bail!(
            "inconsistent response: status {} with storedDigest {:?}",
            status,
            stored
        ),
    }

    let anchored_root = if response.anchor.status == "anchored" {
        let anchor = &response.anchor;
        let root = parse_b256(
            anchor
                .merkle_root
                .as_deref()
                .context("anchored response without root")?,
        )?;
        let siblings = parse_siblings(
            anchor
                .proof
                .as_deref()
                .context("anchored response without proof")?,
        )?;
        // The anchored leaf commits the recorded digest, not the live one
        let digest = response
            .stored_digest
            .as_deref()
            .context("anchored response without storedDigest")?;

        anyhow::ensure!(
            verify_standalone(&root, response.order_id, digest, &siblings),
            "Merkle proof for order {} does not fold to root {}",
            response.order_id,
            root
        );
        Some(root)
    } else {
        None
    };

    if let Some(expected) = expected_root {
        match anchored_root {
            Some(root) => anyhow::ensure!(
                root == expected,
                "anchored root {} differs from expected {}",
                root,
                expected
            ),
            None => anyhow::bail!(
                "expected anchoring under {} but the response is {}",
                expected,
                response.anchor.status
            ),
        }
    }

    Ok(VerifyOutcome {
        order_id: response.order_id,
        status: response.status.clone(),
        anchored_root,
    })
}

/// Verify a `/v1/proof` bundle; returns the root it proves against.
pub fn verify_proof_bundle(
    bundle: &ProofBundleJson,
    expected_root: Option<B256>,
) -> anyhow::Result<B256> {
    let root = parse_b256(&bundle.merkle_root)?;
    let siblings = parse_siblings(&bundle.proof)?;

    anyhow::ensure!(
        verify_standalone(&root, bundle.order_id, &bundle.digest, &siblings),
        "Merkle proof for order {} does not fold to root {}",
        bundle.order_id,
        root
    );
    if let Some(expected) = expected_root {
        anyhow::ensure!(
            root == expected,
            "proof root {} differs from expected {}",
            root,
            expected
        );
    }
    Ok(root)
}

fn vector_orders() -> Vec<TransactionFacts> {
    vec![
        TransactionFacts {
            order_id: 7,
            total_credits: 5,
            total_price: Decimal::new(1250, 2),
            paid_at: Utc
                .timestamp_millis_opt(1_700_000_000_000)
                .single()
                .unwrap_or_default(),
            buyer: None,
            seller: None,
        },
        TransactionFacts {
            order_id: 42,
            total_credits: 100,
            total_price: Decimal::new(25051, 2),
            paid_at: Utc
                .timestamp_millis_opt(1_700_000_000_000)
                .single()
                .unwrap_or_default(),
            buyer: Some("buyer-1".to_string()),
            seller: Some("seller-1".to_string()),
        },
        TransactionFacts {
            order_id: 1001,
            total_credits: 1,
            total_price: Decimal::new(99, 2),
            paid_at: Utc
                .timestamp_millis_opt(1_700_000_123_456)
                .single()
                .unwrap_or_default(),
            buyer: Some("buyer-2".to_string()),
            seller: None,
        },
    ]
}

/// Deterministic hashing vectors: canonical strings, digests, leaf hashes,
/// and a three-leaf tree with every proof.
pub fn generate_vectors() -> anyhow::Result<serde_json::Value> {
    let orders = vector_orders();

    let mut builder = MerkleBuilder::new();
    let mut order_vectors = Vec::with_capacity(orders.len());
    for facts in &orders {
        let legacy = canonicalize_with(facts, CanonicalEncoding::Legacy);
        let delimited = canonicalize_with(facts, CanonicalEncoding::Delimited);
        let digest = digest_canonical(&legacy);
        builder.insert(facts.order_id, digest.clone())?;

        order_vectors.push(serde_json::json!({
            "orderId": facts.order_id,
            "totalCredits": facts.total_credits,
            "totalPrice": facts.total_price.normalize().to_string(),
            "paidAtMillis": facts.paid_at_millis(),
            "buyer": facts.buyer,
            "seller": facts.seller,
            "legacy": {
                "canonical": legacy,
                "digest": digest,
            },
            "delimited": {
                "digest": digest_canonical(&delimited),
                "canonical": delimited,
            },
            "leafHash": compute_leaf_hash(facts.order_id, &digest).to_string(),
        }));
    }

    let tree = builder.build()?;
    let proofs: Vec<serde_json::Value> = tree
        .leaves()
        .iter()
        .filter_map(|leaf| tree.proof(leaf.order_id, &leaf.digest))
        .map(|proof| {
            serde_json::json!({
                "orderId": proof.order_id,
                "digest": proof.digest,
                "leafIndex": proof.leaf_index,
                "siblings": proof.siblings_hex(),
            })
        })
        .collect();

    Ok(serde_json::json!({
        "version": "orderproof-v1",
        "algorithm": ALGORITHM,
        "leafEncoding": "keccak256(keccak256(abi.encode(uint256 orderId, string digest)))",
        "orders": order_vectors,
        "tree": {
            "root": tree.root().to_string(),
            "proofs": proofs,
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST_42: &str = "9a4a39e229222182d1d9ffdec6fd02b004e0abd118781e4554b6cd2ecf57c310";

    fn order_42() -> TransactionFacts {
        vector_orders().remove(1)
    }

    fn verified_response() -> VerificationResponseJson {
        VerificationResponseJson {
            order_id: 42,
            status: "verified".to_string(),
            stored_digest: Some(DIGEST_42.to_string()),
            computed_digest: DIGEST_42.to_string(),
            tampered: false,
            anchor: AnchorLayerJson {
                status: "not_anchored".to_string(),
                ..Default::default()
            },
            algorithm: "SHA-256".to_string(),
            encoding: CanonicalEncoding::Legacy,
            canonical_input: "42100250.511700000000000".to_string(),
        }
    }

    fn anchored_response() -> (VerificationResponseJson, B256) {
        // Single-leaf batch: the root is the leaf hash and the proof is empty
        let root = compute_leaf_hash(42, DIGEST_42);
        let mut response = verified_response();
        response.anchor = AnchorLayerJson {
            status: "anchored".to_string(),
            merkle_root: Some(root.to_string()),
            proof: Some(vec![]),
            leaf_index: Some(0),
            proof_valid: Some(true),
            ..Default::default()
        };
        (response, root)
    }

    #[test]
    fn test_verified_response_checks_out() {
        let outcome = verify_response(&verified_response(), Some(&order_42()), None).unwrap();
        assert_eq!(outcome.status, "verified");
        assert!(outcome.anchored_root.is_none());
    }

    #[test]
    fn test_anchored_response_checks_out() {
        let (response, root) = anchored_response();
        let outcome = verify_response(&response, None, Some(root)).unwrap();
        assert_eq!(outcome.anchored_root, Some(root));
    }

    #[test]
    fn test_anchor_root_read_from_root_key() {
        let (response, root) = anchored_response();
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["anchor"]["root"], root.to_string());
        assert!(json["anchor"].get("merkleRoot").is_none());

        let parsed: VerificationResponseJson = serde_json::from_value(json).unwrap();
        let outcome = verify_response(&parsed, None, Some(root)).unwrap();
        assert_eq!(outcome.anchored_root, Some(root));
    }

    #[test]
    fn test_rejects_forged_digest() {
        let mut response = verified_response();
        response.canonical_input = "42100999.001700000000000".to_string();
        let err = verify_response(&response, None, None).unwrap_err();
        assert!(err.to_string().contains("SHA-256(canonicalInput)"));
    }

    #[test]
    fn test_rejects_facts_that_do_not_match() {
        let mut facts = order_42();
        facts.total_credits = 99;
        assert!(verify_response(&verified_response(), Some(&facts), None).is_err());
    }

    #[test]
    fn test_rejects_inconsistent_verdict() {
        let mut response = verified_response();
        response.stored_digest = Some("00".repeat(32));
        assert!(verify_response(&response, None, None).is_err());

        response.status = "mismatch".to_string();
        response.tampered = true;
        assert_eq!(
            verify_response(&response, None, None).unwrap().status,
            "mismatch"
        );
    }

    #[test]
    fn test_rejects_bad_proof_and_wrong_root() {
        let (mut response, _) = anchored_response();
        response.anchor.merkle_root = Some(B256::repeat_byte(0x11).to_string());
        assert!(verify_response(&response, None, None).is_err());

        let (response, _) = anchored_response();
        assert!(verify_response(&response, None, Some(B256::repeat_byte(0x22))).is_err());

        // Expecting an anchor that the response does not claim
        assert!(verify_response(&verified_response(), None, Some(B256::ZERO)).is_err());
    }

    #[test]
    fn test_proof_bundle() {
        let root = compute_leaf_hash(42, DIGEST_42);
        let bundle = ProofBundleJson {
            order_id: 42,
            digest: DIGEST_42.to_string(),
            merkle_root: root.to_string(),
            proof: vec![],
            leaf_index: 0,
        };
        assert_eq!(verify_proof_bundle(&bundle, Some(root)).unwrap(), root);

        let wrong_order = ProofBundleJson {
            order_id: 43,
            ..bundle
        };
        assert!(verify_proof_bundle(&wrong_order, None).is_err());
    }

    #[test]
    fn test_response_json_ignores_extra_fields() {
        let json = serde_json::json!({
            "orderId": 42,
            "status": "verified",
            "storedDigest": DIGEST_42,
            "computedDigest": DIGEST_42,
            "tampered": false,
            "message": "Order facts match the recorded audit; not yet anchored on chain",
            "anchor": { "status": "not_anchored" },
            "algorithm": "SHA-256",
            "hashFormula": "SHA256(orderId + totalCredits + totalPrice + paidAtTimestamp)",
            "encoding": "legacy",
            "canonicalInput": "42100250.511700000000000",
            "verifiedAt": "2026-01-01T00:00:00Z"
        });
        let response: VerificationResponseJson = serde_json::from_value(json).unwrap();
        verify_response(&response, None, None).unwrap();
    }
}
