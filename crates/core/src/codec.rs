//! Canonical encoding and digests for transaction facts.
//!
//! The digest of an order is `SHA256(canonical string)` rendered as lowercase hex.
//! Two canonical encodings exist:
//!
//! - [`CanonicalEncoding::Legacy`]: `orderId ‖ totalCredits ‖ totalPrice ‖ paidAtMillis`
//!   with no separator. Every digest recorded so far uses this form.
//! - [`CanonicalEncoding::Delimited`]: `orderId|buyer|seller|totalCredits|totalPrice|paidAtMillis`.
//!   Unambiguous, and ties the digest to both counterparties.
//!
//! Legacy strings are ambiguous (`orderId=1, totalCredits=23` and `orderId=12,
//! totalCredits=3` concatenate identically). Records carry the encoding they were
//! hashed with so verification always recomputes with the same one.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;
use crate::types::TransactionFacts;

/// Name of the digest algorithm, as published to verifiers.
pub const ALGORITHM: &str = "SHA-256";

/// How transaction facts are turned into the string that gets hashed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalEncoding {
    /// Plain concatenation, no separator.
    #[default]
    Legacy,
    /// Pipe-delimited, includes buyer and seller.
    Delimited,
}

impl CanonicalEncoding {
    /// Human-readable formula for this encoding.
    pub fn hash_formula(self) -> &'static str {
        match self {
            Self::Legacy => "SHA256(orderId + totalCredits + totalPrice + paidAtTimestamp)",
            Self::Delimited => {
                "SHA256(orderId | buyer | seller | totalCredits | totalPrice | paidAtTimestamp)"
            }
        }
    }

    /// Stable name used in configuration and stored records.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Legacy => "legacy",
            Self::Delimited => "delimited",
        }
    }
}

impl fmt::Display for CanonicalEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CanonicalEncoding {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "legacy" => Ok(Self::Legacy),
            "delimited" => Ok(Self::Delimited),
            other => Err(CoreError::UnknownEncoding(other.to_string())),
        }
    }
}

/// Canonical string for `facts` using the legacy encoding.
///
/// # Example
///
/// ```
/// use chrono::{TimeZone, Utc};
/// use orderproof_core::{canonicalize, TransactionFacts};
/// use rust_decimal::Decimal;
///
/// let facts = TransactionFacts {
///     order_id: 42,
///     total_credits: 100,
///     total_price: Decimal::new(25050, 2),
///     paid_at: Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
///     buyer: None,
///     seller: None,
/// };
/// assert_eq!(canonicalize(&facts), "42100250.51700000000000");
/// ```
pub fn canonicalize(facts: &TransactionFacts) -> String {
    canonicalize_with(facts, CanonicalEncoding::Legacy)
}

/// Canonical string for `facts` using the given encoding.
pub fn canonicalize_with(facts: &TransactionFacts, encoding: CanonicalEncoding) -> String {
    let price = render_price(facts);
    match encoding {
        CanonicalEncoding::Legacy => format!(
            "{}{}{}{}",
            facts.order_id,
            facts.total_credits,
            price,
            facts.paid_at_millis()
        ),
        CanonicalEncoding::Delimited => format!(
            "{}|{}|{}|{}|{}|{}",
            facts.order_id,
            facts.buyer.as_deref().unwrap_or(""),
            facts.seller.as_deref().unwrap_or(""),
            facts.total_credits,
            price,
            facts.paid_at_millis()
        ),
    }
}

/// Lowercase hex SHA-256 digest of the legacy canonical string.
pub fn digest(facts: &TransactionFacts) -> String {
    digest_with(facts, CanonicalEncoding::Legacy)
}

/// Lowercase hex SHA-256 digest of the canonical string in the given encoding.
pub fn digest_with(facts: &TransactionFacts, encoding: CanonicalEncoding) -> String {
    digest_canonical(&canonicalize_with(facts, encoding))
}

/// Lowercase hex SHA-256 of an already-canonical string.
///
/// This is what `echo -n "$canonicalInput" | sha256sum` prints.
pub fn digest_canonical(canonical: &str) -> String {
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

// Prices render without trailing zeros: 250.50 -> "250.5", 250.00 -> "250".
fn render_price(facts: &TransactionFacts) -> String {
    facts.total_price.normalize().to_string()
}
