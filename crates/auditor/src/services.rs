//! Process wiring.
//!
//! Every collaborator is built once here and handed to its dependents, so the
//! binaries and the API server share one construction path.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::anchor::{AnchorCoordinator, AnchorScheduler, CoordinatorOptions};
use crate::audit::{AuditService, AuditStore};
use crate::batch::BatchBuilder;
use crate::config::Config;
use crate::kv::SqliteKvStore;
use crate::ledger::{AnchorLedger, EvmAnchorLedger};
use crate::orders::{OrderSource, SqliteOrderSource};
use crate::storage::Storage;
use crate::sweep::ReconcileSweep;
use crate::verification::VerificationAssembler;

/// Everything a running auditor needs.
pub struct Services {
    /// Loaded configuration
    pub config: Config,
    /// Anchor ledger database
    pub storage: Storage,
    /// Audit recording and verification
    pub audits: Arc<AuditService>,
    /// Chain client
    pub ledger: Arc<EvmAnchorLedger>,
    /// Anchor coordinator
    pub coordinator: Arc<AnchorCoordinator>,
    /// Public verification
    pub assembler: VerificationAssembler,
    /// Present when `orders.url` is configured
    pub orders: Option<Arc<dyn OrderSource>>,
    /// Cancelled on shutdown; background tasks hold child tokens
    pub shutdown: CancellationToken,
}

impl Services {
    /// Connect databases, run migrations and build the object graph.
    pub async fn from_config(config: Config) -> Result<Self> {
        let storage = Storage::new(
            &config.database.url,
            Some(config.database.max_connections),
            Some(config.database.min_connections),
        )
        .await
        .context("Failed to connect to anchor database")?;
        storage
            .run_migrations()
            .await
            .context("Failed to run migrations")?;

        let audit_storage = if config.audit_store.url == config.database.url {
            storage.clone()
        } else {
            let audit_storage = Storage::new(
                &config.audit_store.url,
                Some(config.database.max_connections),
                Some(config.database.min_connections),
            )
            .await
            .context("Failed to connect to audit store")?;
            audit_storage
                .run_migrations()
                .await
                .context("Failed to run audit store migrations")?;
            audit_storage
        };

        let kv = Arc::new(SqliteKvStore::new(&audit_storage));
        let audits = Arc::new(AuditService::new(
            AuditStore::new(
                kv,
                config.audit_store.retry.policy(),
                config.audit_store.scan_page_size,
            ),
            config.audit_store.encoding,
        ));
        info!("Audit store ready (encoding: {})", config.audit_store.encoding);

        let ledger = Arc::new(
            EvmAnchorLedger::from_config(&config).context("Failed to create ledger client")?,
        );
        if ledger.contract_address().is_none() {
            warn!("No AuditAnchor contract configured; run `deploy` before anchoring");
        }

        let shutdown = CancellationToken::new();
        let coordinator = Arc::new(AnchorCoordinator::new(
            storage.clone(),
            BatchBuilder::new(audits.clone()),
            ledger.clone() as Arc<dyn AnchorLedger>,
            CoordinatorOptions {
                submission_timeout: config.anchor.submission_timeout(),
                stale_pending_after: config.anchor.stale_pending_after(),
                explorer_url: config.network.explorer_url.clone(),
            },
            shutdown.child_token(),
        ));

        let assembler = VerificationAssembler::new(audits.clone(), Some(coordinator.clone()));

        let orders = match config.orders.url.as_deref() {
            Some(url) => {
                let source = SqliteOrderSource::connect(url).await?;
                Some(Arc::new(source) as Arc<dyn OrderSource>)
            }
            None => None,
        };

        Ok(Self {
            config,
            storage,
            audits,
            ledger,
            coordinator,
            assembler,
            orders,
            shutdown,
        })
    }

    /// Periodic anchoring task, if a contract is configured.
    pub fn anchor_scheduler(&self) -> Option<AnchorScheduler> {
        self.ledger.contract_address()?;

        let interval = self
            .config
            .anchor
            .auto_anchor
            .then(|| Duration::from_secs(self.config.anchor.anchor_interval_secs));

        Some(AnchorScheduler::new(
            self.coordinator.clone(),
            interval,
            self.shutdown.child_token(),
        ))
    }

    /// Reconciliation sweep, if enabled and an order database is configured.
    pub fn reconcile_sweep(&self) -> Option<ReconcileSweep> {
        if !self.config.sweep.enabled {
            return None;
        }
        let orders = self.orders.clone()?;

        let coordinator = self
            .ledger
            .contract_address()
            .map(|_| self.coordinator.clone());

        Some(ReconcileSweep::new(
            orders,
            self.audits.clone(),
            coordinator,
            Duration::from_secs(self.config.sweep.interval_secs),
            self.shutdown.child_token(),
        ))
    }
}
