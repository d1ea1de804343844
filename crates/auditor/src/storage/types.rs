//! Database types for the auditor storage layer.

use alloy::primitives::B256;
use orderproof_core::OrderId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of an anchoring attempt.
///
/// `Pending` moves to exactly one of the terminal states. Terminal rows are
/// never rewritten; retrying means inserting a new row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnchorStatus {
    /// Row written, transaction not yet confirmed
    Pending,
    /// Confirmed on-chain with the required number of confirmations
    Confirmed,
    /// Submission or confirmation failed
    Failed,
}

impl AnchorStatus {
    /// Database representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Confirmed => "CONFIRMED",
            Self::Failed => "FAILED",
        }
    }

    /// True for `Confirmed` and `Failed`.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for AnchorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnchorStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "CONFIRMED" => Ok(Self::Confirmed),
            "FAILED" => Ok(Self::Failed),
            other => Err(anyhow::anyhow!("Unknown anchor status: {}", other)),
        }
    }
}

/// An anchor row as stored in the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchorRecord {
    /// Row id
    pub id: i64,

    /// Merkle root committed by this anchor
    pub merkle_root: B256,

    /// Chain the root was (or is being) anchored on
    pub chain_id: u64,

    /// Number of leaves in the anchored tree
    pub audit_count: u64,

    /// Orders covered, in leaf order
    pub order_ids: Vec<OrderId>,

    /// Lifecycle state
    pub status: AnchorStatus,

    /// Anchoring transaction, once known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<B256>,

    /// Block the transaction was included in
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,

    /// Failure reason for `Failed` rows
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Creation time (Unix millis)
    pub created_at: i64,

    /// Confirmation time (Unix millis)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmed_at: Option<i64>,
}

impl AnchorRecord {
    /// Whether this anchor commits to `order_id`.
    pub fn covers(&self, order_id: OrderId) -> bool {
        self.order_ids.binary_search(&order_id).is_ok()
    }
}

/// Fields of an anchor row known before submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAnchor {
    /// Merkle root to anchor
    pub merkle_root: B256,

    /// Target chain
    pub chain_id: u64,

    /// Orders covered, ascending (leaf order)
    pub order_ids: Vec<OrderId>,

    /// Creation time (Unix millis)
    pub created_at: i64,
}

/// Confirmation details written when an anchor confirms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnchorConfirmation {
    /// Anchoring transaction
    pub tx_hash: B256,

    /// Inclusion block
    pub block_number: u64,

    /// Confirmation time (Unix millis)
    pub confirmed_at: i64,
}
