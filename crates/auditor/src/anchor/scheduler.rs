//! Background anchoring loop.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{AnchorCoordinator, AnchorOutcome};

/// Runs [`AnchorCoordinator::anchor_current_state`] periodically and on demand.
pub struct AnchorScheduler {
    coordinator: Arc<AnchorCoordinator>,
    interval: Option<Duration>,
    trigger: Arc<Notify>,
    shutdown: CancellationToken,
}

impl AnchorScheduler {
    /// Create a scheduler. `interval = None` means manual triggers only.
    pub fn new(
        coordinator: Arc<AnchorCoordinator>,
        interval: Option<Duration>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            coordinator,
            interval,
            trigger: Arc::new(Notify::new()),
            shutdown,
        }
    }

    /// Handle for requesting an immediate attempt.
    pub fn trigger(&self) -> Arc<Notify> {
        self.trigger.clone()
    }

    /// Run until the shutdown token is cancelled.
    pub async fn run(&self) {
        let Some(period) = self.interval else {
            info!("Auto-anchoring disabled, waiting for manual triggers only");
            loop {
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => break,
                    _ = self.trigger.notified() => self.attempt("manual").await,
                }
            }
            info!("Anchor scheduler stopped");
            return;
        };

        info!("Anchor scheduler starting with interval: {}s", period.as_secs());

        let mut periodic = tokio::time::interval(period);
        periodic.tick().await; // First tick completes immediately

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = periodic.tick() => self.attempt("periodic").await,
                _ = self.trigger.notified() => self.attempt("manual").await,
            }
        }

        info!("Anchor scheduler stopped");
    }

    async fn attempt(&self, trigger: &str) {
        match self.coordinator.anchor_current_state().await {
            Ok(AnchorOutcome::Anchored(anchor)) => {
                info!(
                    "{} anchor successful: id={} root={}",
                    trigger, anchor.id, anchor.merkle_root
                );
            }
            Ok(outcome) => {
                debug!("{} anchor skipped: {}", trigger, outcome.label());
            }
            Err(e) => {
                warn!("{} anchor failed: {}", trigger, e);
            }
        }
    }
}
