//! Core types for OrderProof.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Marketplace order identifier.
///
/// Orders are keyed by their relational database id, which is always positive,
/// and are committed into Merkle leaves as a `uint256`.
pub type OrderId = u64;

/// Largest order id the relational id column can hold.
pub const MAX_ORDER_ID: OrderId = i64::MAX as OrderId;

/// Length of a hex-encoded SHA-256 digest.
pub const DIGEST_HEX_LEN: usize = 64;

/// The facts of a completed order, captured exactly once when payment is confirmed.
///
/// Any later change to these values is what verification must detect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionFacts {
    /// Order id.
    pub order_id: OrderId,

    /// Total quantity of credits across all order items.
    pub total_credits: i64,

    /// Total price paid.
    pub total_price: Decimal,

    /// Payment completion time.
    pub paid_at: DateTime<Utc>,

    /// Buyer identifier, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buyer: Option<String>,

    /// Seller identifier, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seller: Option<String>,
}

impl TransactionFacts {
    /// Payment time as Unix epoch milliseconds.
    pub fn paid_at_millis(&self) -> i64 {
        self.paid_at.timestamp_millis()
    }

    /// Store key for this order's audit record.
    pub fn audit_key(&self) -> String {
        audit_key(self.order_id)
    }

    /// Reject facts that could never belong to a stored order.
    pub fn validate(&self) -> Result<()> {
        validate_order_id(self.order_id)
    }
}

/// Check that an order id is in `1..=MAX_ORDER_ID`.
pub fn validate_order_id(order_id: OrderId) -> Result<()> {
    if order_id == 0 || order_id > MAX_ORDER_ID {
        return Err(CoreError::InvalidOrderId(order_id));
    }
    Ok(())
}

/// Store key for an order's audit record: `order_<orderId>`.
pub fn audit_key(order_id: OrderId) -> String {
    format!("{}{}", AUDIT_KEY_PREFIX, order_id)
}

/// Prefix shared by every audit record key.
pub const AUDIT_KEY_PREFIX: &str = "order_";

/// Parse an order id back out of an audit key.
pub fn order_id_from_key(key: &str) -> Option<OrderId> {
    key.strip_prefix(AUDIT_KEY_PREFIX)?.parse().ok()
}

/// A Merkle leaf: one audited order and its digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MerkleLeaf {
    /// Order id.
    pub order_id: OrderId,
    /// Lowercase hex SHA-256 digest of the order's canonical string.
    pub digest: String,
}

impl MerkleLeaf {
    /// Construct a leaf.
    pub fn new(order_id: OrderId, digest: impl Into<String>) -> Self {
        Self {
            order_id,
            digest: digest.into(),
        }
    }
}

/// Check that a digest is 64 lowercase hex characters.
pub fn validate_digest(digest: &str) -> Result<()> {
    let well_formed = digest.len() == DIGEST_HEX_LEN
        && digest
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
    if !well_formed {
        return Err(CoreError::InvalidDigest(digest.to_string()));
    }
    Ok(())
}
