//! EVM anchor ledger over alloy.
//!
//! Submits roots to the `AuditAnchor` contract and waits for confirmations
//! before reporting success, so a caller never records an anchor that a reorg
//! could still drop.

use alloy::network::{EthereumWallet, TransactionBuilder};
use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;
use alloy::sol;
use alloy::transports::TransportError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use super::{AnchorLedger, AnchorReceipt, LedgerError, OnChainAnchor};
use crate::config::Config;
use crate::retry::{retry, RetryPolicy};

// Type alias for the Alloy provider with wallet support
// This complex type is necessary until Alloy provides a simpler abstraction
// See: https://github.com/alloy-rs/alloy/issues/1800
type WalletProvider = alloy::providers::fillers::FillProvider<
    alloy::providers::fillers::JoinFill<
        alloy::providers::fillers::JoinFill<
            alloy::providers::Identity,
            alloy::providers::fillers::JoinFill<
                alloy::providers::fillers::GasFiller,
                alloy::providers::fillers::JoinFill<
                    alloy::providers::fillers::BlobGasFiller,
                    alloy::providers::fillers::JoinFill<
                        alloy::providers::fillers::NonceFiller,
                        alloy::providers::fillers::ChainIdFiller,
                    >,
                >,
            >,
        >,
        alloy::providers::fillers::WalletFiller<EthereumWallet>,
    >,
    alloy::providers::RootProvider<alloy::transports::http::Http<alloy::transports::http::Client>>,
    alloy::transports::http::Http<alloy::transports::http::Client>,
    alloy::network::Ethereum,
>;

// Generate AuditAnchor contract bindings
sol! {
    #[allow(missing_docs)]
    #[sol(rpc)]
    contract AuditAnchor {
        function anchor(bytes32 root, uint256 count) external;
        function getLatestAnchor() external view returns (bytes32 root, uint256 timestamp, uint256 count);
        function anchorCount() external view returns (uint256);

        event AuditAnchored(
            bytes32 indexed root,
            uint256 count,
            uint256 timestamp,
            address indexed submitter
        );
    }
}

/// Anchoring account details.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletInfo {
    /// Signer address
    pub address: Address,
    /// Balance in wei
    pub balance_wei: U256,
}

/// Confirmation settings for [`EvmAnchorLedger`].
#[derive(Debug, Clone, Copy)]
pub struct ConfirmationPolicy {
    /// Blocks that must follow the inclusion block
    pub confirmations: u64,
    /// Give up after this long
    pub timeout: Duration,
    /// Delay between block-number polls
    pub poll_interval: Duration,
}

/// [`AnchorLedger`] backed by an `AuditAnchor` contract on an EVM chain.
pub struct EvmAnchorLedger {
    provider: WalletProvider,
    signer_address: Address,
    contract_address: Option<Address>,
    chain_id: u64,
    confirmation: ConfirmationPolicy,
    read_retry: RetryPolicy,
}

impl EvmAnchorLedger {
    /// Create a ledger client.
    ///
    /// `contract_address` may be `None` when the client is only used to deploy.
    pub fn new(
        rpc_url: &str,
        signer: PrivateKeySigner,
        contract_address: Option<Address>,
        chain_id: u64,
        confirmation: ConfirmationPolicy,
        read_retry: RetryPolicy,
    ) -> Result<Self> {
        let signer_address = signer.address();
        let wallet = EthereumWallet::from(signer);

        let provider = ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(wallet)
            .on_http(
                rpc_url
                    .parse()
                    .with_context(|| format!("Invalid RPC URL: {}", rpc_url))?,
            );

        Ok(Self {
            provider,
            signer_address,
            contract_address,
            chain_id,
            confirmation,
            read_retry,
        })
    }

    /// Create a ledger client from configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        let signer: PrivateKeySigner = config
            .anchor_private_key_with_prefix()
            .parse()
            .context("Failed to parse anchor private key")?;

        Self::new(
            &config.network.rpc_url,
            signer,
            config.contracts.audit_anchor,
            config.network.chain_id,
            ConfirmationPolicy {
                confirmations: config.anchor.confirmations,
                timeout: config.anchor.confirmation_timeout(),
                poll_interval: config.anchor.poll_interval(),
            },
            config.network.retry.policy(),
        )
    }

    /// Configured contract address, if any.
    pub fn contract_address(&self) -> Option<Address> {
        self.contract_address
    }

    /// Check that the node serves the configured chain.
    pub async fn check_chain_id(&self) -> Result<(), LedgerError> {
        let remote = retry(&self.read_retry, "eth_chainId", || async {
            self.provider.get_chain_id().await.map_err(transport_error)
        })
        .await?;

        if remote != self.chain_id {
            return Err(LedgerError::Other(format!(
                "RPC serves chain {} but chain {} is configured",
                remote, self.chain_id
            )));
        }
        Ok(())
    }

    /// Signer address and balance.
    pub async fn wallet_info(&self) -> Result<WalletInfo, LedgerError> {
        let address = self.signer_address;
        let balance_wei = retry(&self.read_retry, "eth_getBalance", || async {
            self.provider
                .get_balance(address)
                .await
                .map_err(transport_error)
        })
        .await?;

        Ok(WalletInfo {
            address,
            balance_wei,
        })
    }

    async fn block_number(&self) -> Result<u64, LedgerError> {
        retry(&self.read_retry, "eth_blockNumber", || async {
            self.provider.get_block_number().await.map_err(transport_error)
        })
        .await
    }

    /// Wait until `tx_block` has the configured number of confirmations.
    async fn wait_for_confirmations(&self, tx_hash: B256, tx_block: u64) -> Result<(), LedgerError> {
        let required = self.confirmation.confirmations;
        if required == 0 {
            warn!("Confirmations set to 0 - anchor will be recorded immediately (not recommended for production)");
            return Ok(());
        }

        info!("Waiting for {} confirmations of {}", required, tx_hash);
        let start_time = Instant::now();

        loop {
            if start_time.elapsed() > self.confirmation.timeout {
                return Err(LedgerError::ConfirmationTimeout {
                    tx_hash,
                    confirmations: required,
                    timeout: self.confirmation.timeout,
                });
            }

            let current_block = match self.block_number().await {
                Ok(block) => block,
                Err(e) => {
                    warn!("Failed to get block number: {}, retrying...", e);
                    tokio::time::sleep(self.confirmation.poll_interval).await;
                    continue;
                }
            };

            let confirmations = current_block.saturating_sub(tx_block);
            if confirmations >= required {
                info!(
                    "Transaction confirmed with {} blocks (required: {})",
                    confirmations, required
                );
                return Ok(());
            }

            info!(
                "Waiting for confirmations: {}/{} (current block: {}, tx block: {})",
                confirmations, required, current_block, tx_block
            );
            tokio::time::sleep(self.confirmation.poll_interval).await;
        }
    }
}

#[async_trait]
impl AnchorLedger for EvmAnchorLedger {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn anchor(&self, root: B256, leaf_count: u64) -> Result<AnchorReceipt, LedgerError> {
        let address = self.contract_address.ok_or(LedgerError::NotDeployed)?;
        let contract = AuditAnchor::new(address, self.provider.clone());

        info!("Submitting root {} ({} leaves) to {}", root, leaf_count, address);

        let pending = contract
            .anchor(root, U256::from(leaf_count))
            .send()
            .await
            .map_err(contract_error)?;
        let tx_hash = *pending.tx_hash();
        info!("Transaction sent: {}", tx_hash);

        let receipt = pending.get_receipt().await.map_err(|e| {
            LedgerError::Other(format!("Failed to get receipt for {}: {}", tx_hash, e))
        })?;

        let block_number = receipt
            .block_number
            .ok_or_else(|| LedgerError::Other("Transaction receipt missing block number".into()))?;

        // status = false means the transaction was mined but reverted
        if !receipt.status() {
            warn!(
                "Transaction reverted: {} in block {} (gas used: {})",
                tx_hash, block_number, receipt.gas_used
            );
            return Err(LedgerError::Reverted {
                tx_hash,
                block_number,
            });
        }

        info!(
            "Transaction successful in block {} with {} gas used",
            block_number, receipt.gas_used
        );

        self.wait_for_confirmations(tx_hash, block_number).await?;

        Ok(AnchorReceipt {
            tx_hash,
            block_number,
        })
    }

    async fn latest_anchor(&self) -> Result<Option<OnChainAnchor>, LedgerError> {
        let address = self.contract_address.ok_or(LedgerError::NotDeployed)?;
        let contract = AuditAnchor::new(address, self.provider.clone());
        let contract = &contract;

        let latest = retry(&self.read_retry, "getLatestAnchor", move || async move {
            contract
                .getLatestAnchor()
                .call()
                .await
                .map_err(contract_error)
        })
        .await?;

        if latest.root == B256::ZERO {
            return Ok(None);
        }

        Ok(Some(OnChainAnchor {
            root: latest.root,
            timestamp: latest.timestamp.saturating_to::<u64>(),
            count: latest.count.saturating_to::<u64>(),
        }))
    }

    async fn find_anchor(&self, root: B256) -> Result<Option<AnchorReceipt>, LedgerError> {
        let address = self.contract_address.ok_or(LedgerError::NotDeployed)?;
        let contract = AuditAnchor::new(address, self.provider.clone());
        let contract = &contract;

        let logs = retry(&self.read_retry, "AuditAnchored logs", move || async move {
            contract
                .AuditAnchored_filter()
                .topic1(root)
                .from_block(0u64)
                .query()
                .await
                .map_err(contract_error)
        })
        .await?;

        // Earliest emission wins; a root anchored twice is still the same commitment
        let receipt = logs.iter().find_map(|(_, log)| {
            Some(AnchorReceipt {
                tx_hash: log.transaction_hash?,
                block_number: log.block_number?,
            })
        });

        Ok(receipt)
    }

    async fn deploy(&self, bytecode: Bytes) -> Result<Address, LedgerError> {
        info!(
            "Deploying AuditAnchor from {} ({} bytes of bytecode)",
            self.signer_address,
            bytecode.len()
        );

        let tx = TransactionRequest::default()
            .with_from(self.signer_address)
            .with_deploy_code(bytecode);

        let pending = self
            .provider
            .send_transaction(tx)
            .await
            .map_err(transport_error)?;
        let tx_hash = *pending.tx_hash();
        info!("Deployment transaction sent: {}", tx_hash);

        let receipt = pending.get_receipt().await.map_err(|e| {
            LedgerError::Other(format!("Failed to get receipt for {}: {}", tx_hash, e))
        })?;
        let block_number = receipt.block_number.unwrap_or_default();

        if !receipt.status() {
            return Err(LedgerError::Reverted {
                tx_hash,
                block_number,
            });
        }

        let address = receipt
            .contract_address
            .ok_or_else(|| LedgerError::Other("Deployment receipt has no contract address".into()))?;

        self.wait_for_confirmations(tx_hash, block_number).await?;

        info!("AuditAnchor deployed at {} (block {})", address, block_number);
        Ok(address)
    }
}

fn transport_error(e: TransportError) -> LedgerError {
    if e.is_transport_error() {
        LedgerError::Unavailable(e.to_string())
    } else if e.is_error_resp() {
        LedgerError::Rejected(e.to_string())
    } else {
        LedgerError::Other(e.to_string())
    }
}

fn contract_error(e: alloy::contract::Error) -> LedgerError {
    match e {
        alloy::contract::Error::TransportError(e) => transport_error(e),
        other => LedgerError::Other(other.to_string()),
    }
}
