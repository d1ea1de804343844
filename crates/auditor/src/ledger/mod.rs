//! Public ledger collaborator.
//!
//! Anchoring needs a few things from a chain: submit a root and wait until it
//! is final, read back what was anchored, and deploy the anchor contract once. [`AnchorLedger`] names them; [`evm::EvmAnchorLedger`] is the
//! alloy implementation.

use alloy::primitives::{Address, Bytes, B256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::retry::Retryable;

pub mod evm;

pub use evm::EvmAnchorLedger;

/// Errors raised by an [`AnchorLedger`].
#[derive(Error, Debug)]
pub enum LedgerError {
    /// The node could not be reached.
    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    /// The node refused the request.
    #[error("ledger rejected request: {0}")]
    Rejected(String),

    /// The transaction was mined but reverted.
    #[error("transaction {tx_hash} reverted in block {block_number}")]
    Reverted {
        /// Reverted transaction
        tx_hash: B256,
        /// Block it was mined in
        block_number: u64,
    },

    /// Required confirmations did not arrive in time.
    #[error("timed out after {timeout:?} waiting for {confirmations} confirmations of {tx_hash}")]
    ConfirmationTimeout {
        /// Transaction being waited on
        tx_hash: B256,
        /// Required confirmations
        confirmations: u64,
        /// How long we waited
        timeout: Duration,
    },

    /// The whole submission exceeded its time budget.
    #[error("submission timed out after {0:?}")]
    SubmissionTimeout(Duration),

    /// No anchor contract address is configured.
    #[error("no AuditAnchor contract configured; deploy one and set contracts.audit_anchor")]
    NotDeployed,

    /// Anything else.
    #[error("ledger error: {0}")]
    Other(String),
}

impl Retryable for LedgerError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Inclusion details of a confirmed anchoring transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchorReceipt {
    /// Transaction hash
    pub tx_hash: B256,
    /// Inclusion block
    pub block_number: u64,
}

/// The most recent anchor as recorded by the contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnChainAnchor {
    /// Anchored root
    pub root: B256,
    /// Block timestamp of the anchor (Unix seconds)
    pub timestamp: u64,
    /// Leaf count submitted with the root
    pub count: u64,
}

/// A public ledger that can hold Merkle roots.
#[async_trait]
pub trait AnchorLedger: Send + Sync {
    /// Chain the ledger writes to.
    fn chain_id(&self) -> u64;

    /// Submit `root` with its leaf count and wait for finality.
    ///
    /// Returns only once the configured number of confirmations is reached.
    async fn anchor(&self, root: B256, leaf_count: u64) -> Result<AnchorReceipt, LedgerError>;

    /// Latest anchor stored by the contract, `None` if nothing was anchored yet.
    async fn latest_anchor(&self) -> Result<Option<OnChainAnchor>, LedgerError>;

    /// Transaction that anchored `root`, if the contract ever emitted it.
    async fn find_anchor(&self, root: B256) -> Result<Option<AnchorReceipt>, LedgerError>;

    /// Deploy the anchor contract from creation bytecode.
    async fn deploy(&self, bytecode: Bytes) -> Result<Address, LedgerError>;
}

/// Parse contract creation bytecode from a file's contents.
///
/// Accepts raw hex (with or without `0x`) or a compiler artifact JSON object
/// with a `bytecode` field (a string, or an object with an `object` string).
pub fn parse_bytecode(contents: &str) -> anyhow::Result<Bytes> {
    let trimmed = contents.trim();

    let hex_str = if trimmed.starts_with('{') {
        let artifact: serde_json::Value =
            serde_json::from_str(trimmed).map_err(|e| anyhow::anyhow!("Invalid artifact JSON: {}", e))?;
        match &artifact["bytecode"] {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Object(obj) => obj
                .get("object")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or_else(|| anyhow::anyhow!("Artifact bytecode object has no 'object' field"))?,
            _ => anyhow::bail!("Artifact has no 'bytecode' field"),
        }
    } else {
        trimmed.to_string()
    };

    let raw = hex::decode(hex_str.trim_start_matches("0x"))
        .map_err(|e| anyhow::anyhow!("Bytecode is not valid hex: {}", e))?;
    if raw.is_empty() {
        anyhow::bail!("Bytecode is empty");
    }

    Ok(Bytes::from(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bytecode_forms() {
        assert_eq!(parse_bytecode("0x6080").unwrap().as_ref(), &[0x60, 0x80]);
        assert_eq!(parse_bytecode(" 6080\n").unwrap().as_ref(), &[0x60, 0x80]);
        assert_eq!(
            parse_bytecode(r#"{"abi": [], "bytecode": "0x6080"}"#)
                .unwrap()
                .as_ref(),
            &[0x60, 0x80]
        );
        assert_eq!(
            parse_bytecode(r#"{"bytecode": {"object": "6080"}}"#)
                .unwrap()
                .as_ref(),
            &[0x60, 0x80]
        );
    }

    #[test]
    fn test_parse_bytecode_errors() {
        assert!(parse_bytecode("").is_err());
        assert!(parse_bytecode("0xzz").is_err());
        assert!(parse_bytecode(r#"{"abi": []}"#).is_err());
    }

    #[test]
    fn test_only_unavailable_is_retryable() {
        assert!(LedgerError::Unavailable("reset".into()).is_retryable());
        assert!(!LedgerError::Rejected("nonce too low".into()).is_retryable());
        assert!(!LedgerError::NotDeployed.is_retryable());
    }
}
