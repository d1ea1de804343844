//! Audit record types.

use chrono::{DateTime, Utc};
use orderproof_core::{
    codec::{canonicalize_with, digest_canonical},
    CanonicalEncoding, CoreError, MerkleLeaf, OrderId, TransactionFacts,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::kv::KvError;

/// Kind tag stored with every audit value, so scans can skip foreign entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditKind {
    /// A completed-order audit
    #[serde(rename = "order_audit")]
    OrderAudit,
}

/// The stored integrity record of one completed order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    /// Value kind, always `order_audit`
    pub kind: AuditKind,

    /// Order id (also encoded in the key)
    pub order_id: OrderId,

    /// Lowercase hex SHA-256 of `canonical_string`
    pub digest: String,

    /// When the audit was recorded
    pub recorded_at: DateTime<Utc>,

    /// The facts as they were when the order was paid
    pub facts: TransactionFacts,

    /// The exact string that was hashed
    pub canonical_string: String,

    /// Encoding used to build `canonical_string`
    #[serde(default)]
    pub encoding: CanonicalEncoding,
}

impl AuditRecord {
    /// Build a record for `facts`, hashing them with `encoding`.
    pub fn new(
        facts: TransactionFacts,
        encoding: CanonicalEncoding,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        let canonical_string = canonicalize_with(&facts, encoding);
        let digest = digest_canonical(&canonical_string);
        Self {
            kind: AuditKind::OrderAudit,
            order_id: facts.order_id,
            digest,
            recorded_at,
            facts,
            canonical_string,
            encoding,
        }
    }

    /// The Merkle leaf for this record.
    pub fn leaf(&self) -> MerkleLeaf {
        MerkleLeaf::new(self.order_id, self.digest.clone())
    }

    /// Whether the stored digest still matches the stored canonical string.
    pub fn is_self_consistent(&self) -> bool {
        digest_canonical(&self.canonical_string) == self.digest
            && canonicalize_with(&self.facts, self.encoding) == self.canonical_string
    }
}

/// Outcome of comparing live order data with the stored audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityStatus {
    /// Live facts hash to the stored digest
    Verified,
    /// Live facts hash to something else: the order was altered
    Mismatch,
    /// No audit was ever recorded for this order
    NotFound,
}

impl IntegrityStatus {
    /// Public string form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Verified => "verified",
            Self::Mismatch => "mismatch",
            Self::NotFound => "not_found",
        }
    }
}

/// Result of [`crate::audit::AuditService::verify`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityCheck {
    /// Order checked
    pub order_id: OrderId,
    /// Classification
    pub status: IntegrityStatus,
    /// Digest recorded when the order was paid
    pub stored_digest: Option<String>,
    /// Digest of the live facts
    pub computed_digest: String,
    /// Canonical string of the live facts
    pub canonical_string: String,
    /// Encoding used for the live digest (the stored record's, when one exists)
    pub encoding: CanonicalEncoding,
    /// When the stored audit was recorded
    pub recorded_at: Option<DateTime<Utc>>,
}

impl IntegrityCheck {
    /// True when the stored and live digests differ.
    pub fn tampered(&self) -> bool {
        self.status == IntegrityStatus::Mismatch
    }
}

/// One historical revision of an order's audit value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRevision {
    /// Store revision number
    pub revision: u64,
    /// Write time (Unix millis)
    pub written_at: i64,
    /// Entry hash recorded by the store
    pub entry_hash: String,
    /// Decoded record, absent when the value is not a valid audit
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<AuditRecord>,
}

/// Audit store and service errors.
#[derive(Error, Debug)]
pub enum AuditError {
    /// The backing store stayed unreachable through every retry.
    #[error("audit store unavailable after {attempts} attempt(s): {source}")]
    StoreUnavailable {
        /// Attempts made
        attempts: u32,
        /// Last error
        #[source]
        source: KvError,
    },

    /// The backing store rejected an operation.
    #[error("audit store error: {0}")]
    Store(#[source] KvError),

    /// A stored value could not be decoded as an audit record.
    #[error("corrupt audit record under {key}: {reason}")]
    Corrupt {
        /// Store key
        key: String,
        /// What was wrong
        reason: String,
    },

    /// An audit with a different digest already exists for this order.
    #[error("order {order_id} already audited with digest {recorded}, refusing {computed}")]
    Conflict {
        /// Order id
        order_id: OrderId,
        /// Digest already on record
        recorded: String,
        /// Digest of the facts just submitted
        computed: String,
    },

    /// The facts can never be recorded, e.g. an out-of-range order id.
    #[error("invalid order facts: {0}")]
    InvalidFacts(#[source] CoreError),

    /// A record could not be serialized.
    #[error("failed to serialize audit record: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AuditError {
    /// True when the failure is infrastructure rather than data.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. })
    }
}
