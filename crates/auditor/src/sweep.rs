//! Reconciliation sweep.
//!
//! Audits are normally recorded on the payment path. The sweep catches orders
//! that path missed (store outage, crash) by re-checking every completed order,
//! and gives the anchor coordinator a chance to reconcile PENDING rows.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::anchor::AnchorCoordinator;
use crate::audit::AuditService;
use crate::orders::OrderSource;

/// Counts from one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    /// Completed orders examined
    pub processed: usize,
    /// Audits written by this pass
    pub created: usize,
    /// Orders that already had a matching audit
    pub existing: usize,
    /// Orders that could not be recorded
    pub errors: usize,
}

/// Periodic re-audit of completed orders.
pub struct ReconcileSweep {
    orders: Arc<dyn OrderSource>,
    audits: Arc<AuditService>,
    coordinator: Option<Arc<AnchorCoordinator>>,
    interval: Duration,
    shutdown: CancellationToken,
}

impl ReconcileSweep {
    /// Create a sweep. It stops when `shutdown` is cancelled.
    pub fn new(
        orders: Arc<dyn OrderSource>,
        audits: Arc<AuditService>,
        coordinator: Option<Arc<AnchorCoordinator>>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            orders,
            audits,
            coordinator,
            interval,
            shutdown,
        }
    }

    /// Record an audit for every completed order that lacks one.
    pub async fn run_once(&self) -> anyhow::Result<SweepReport> {
        let completed = self.orders.completed_orders().await?;
        let mut report = SweepReport::default();

        for entry in &completed {
            if self.shutdown.is_cancelled() {
                info!("Sweep interrupted by shutdown after {} orders", report.processed);
                break;
            }

            report.processed += 1;
            let facts = match entry {
                Ok(facts) => facts,
                Err(e) => {
                    warn!("Sweep skipped unreadable order: {:#}", e);
                    report.errors += 1;
                    continue;
                }
            };
            match self.audits.record(facts).await {
                Ok(recorded) if recorded.created => {
                    info!(order_id = facts.order_id, "Recorded missing audit");
                    report.created += 1;
                }
                Ok(_) => report.existing += 1,
                Err(e) => {
                    warn!(order_id = facts.order_id, "Sweep could not record audit: {}", e);
                    report.errors += 1;
                }
            }
        }

        Ok(report)
    }

    /// Run until the shutdown token is cancelled.
    pub async fn run(&self) {
        info!("Reconciliation sweep starting with interval: {}s", self.interval.as_secs());

        let mut periodic = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = periodic.tick() => self.pass().await,
            }
        }

        info!("Reconciliation sweep stopped");
    }

    async fn pass(&self) {
        match self.run_once().await {
            Ok(report) if report.created > 0 || report.errors > 0 => {
                info!(
                    processed = report.processed,
                    created = report.created,
                    errors = report.errors,
                    "Sweep completed"
                );
            }
            Ok(report) => debug!(processed = report.processed, "Sweep found nothing to do"),
            Err(e) => warn!("Sweep failed: {:#}", e),
        }

        if let Some(coordinator) = &self.coordinator {
            match coordinator.recover_pending().await {
                Ok(recovery) if recovery != Default::default() => {
                    info!(?recovery, "Reconciled PENDING anchors");
                }
                Ok(_) => {}
                Err(e) => warn!("Anchor recovery failed: {}", e),
            }
        }
    }
}
