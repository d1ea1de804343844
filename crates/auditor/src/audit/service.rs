//! Recording and verifying order audits.

use chrono::Utc;
use futures::stream::{BoxStream, TryStreamExt};
use orderproof_core::{
    codec::{canonicalize_with, digest_canonical},
    CanonicalEncoding, OrderId, TransactionFacts,
};
use tracing::{info, warn};

use super::store::AuditStore;
use super::types::{AuditError, AuditRecord, AuditRevision, IntegrityCheck, IntegrityStatus};

/// Whether [`AuditService::record`] wrote a new record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recorded {
    /// Digest on record for the order
    pub digest: String,
    /// False when an identical audit already existed
    pub created: bool,
}

/// Business operations over the audit store.
#[derive(Debug, Clone)]
pub struct AuditService {
    store: AuditStore,
    encoding: CanonicalEncoding,
}

impl AuditService {
    /// Create a service that hashes new audits with `encoding`.
    pub fn new(store: AuditStore, encoding: CanonicalEncoding) -> Self {
        Self { store, encoding }
    }

    /// Encoding used for newly recorded orders.
    pub fn encoding(&self) -> CanonicalEncoding {
        self.encoding
    }

    /// Record the audit of a paid order and return its digest.
    ///
    /// The caller guarantees payment is complete. See [`AuditService::record`].
    pub async fn record_order(&self, facts: &TransactionFacts) -> Result<String, AuditError> {
        Ok(self.record(facts).await?.digest)
    }

    /// Record the audit of a paid order.
    ///
    /// Recording is idempotent: if the order already has an audit and the facts
    /// hash to the same digest under that audit's encoding, nothing is written.
    /// Facts that hash differently are refused with [`AuditError::Conflict`];
    /// the first audit of an order is never replaced.
    pub async fn record(&self, facts: &TransactionFacts) -> Result<Recorded, AuditError> {
        facts.validate().map_err(AuditError::InvalidFacts)?;

        if let Some(existing) = self.store.get(facts.order_id).await? {
            return settle_existing(facts, existing);
        }

        let record = AuditRecord::new(facts.clone(), self.encoding, Utc::now());
        if self
            .store
            .put_if_absent(facts.order_id, &record)
            .await?
            .is_none()
        {
            // Another writer got there first
            let existing =
                self.store
                    .get(facts.order_id)
                    .await?
                    .ok_or_else(|| AuditError::Corrupt {
                        key: facts.audit_key(),
                        reason: "audit missing after a refused first write".to_string(),
                    })?;
            return settle_existing(facts, existing);
        }

        info!(
            order_id = facts.order_id,
            digest = %record.digest,
            encoding = %record.encoding,
            "Recorded order audit"
        );

        Ok(Recorded {
            digest: record.digest,
            created: true,
        })
    }

    /// Compare live order facts against the stored audit.
    ///
    /// Never writes. The live digest is computed with the stored record's
    /// encoding, so records made under an older encoding keep verifying.
    pub async fn verify(
        &self,
        order_id: OrderId,
        live_facts: &TransactionFacts,
    ) -> Result<IntegrityCheck, AuditError> {
        let stored = self.store.get(order_id).await?;

        let encoding = stored
            .as_ref()
            .map(|r| r.encoding)
            .unwrap_or(self.encoding);
        let canonical_string = canonicalize_with(live_facts, encoding);
        let computed_digest = digest_canonical(&canonical_string);

        let status = match &stored {
            None => IntegrityStatus::NotFound,
            Some(record) if record.digest == computed_digest => IntegrityStatus::Verified,
            Some(_) => IntegrityStatus::Mismatch,
        };

        if status == IntegrityStatus::Mismatch {
            warn!(order_id, "Order facts no longer match the recorded audit");
        }

        Ok(IntegrityCheck {
            order_id,
            status,
            stored_digest: stored.as_ref().map(|r| r.digest.clone()),
            computed_digest,
            canonical_string,
            encoding,
            recorded_at: stored.as_ref().map(|r| r.recorded_at),
        })
    }

    /// Fetch an order's audit.
    pub async fn get(&self, order_id: OrderId) -> Result<Option<AuditRecord>, AuditError> {
        self.store.get(order_id).await
    }

    /// Every stored revision of an order's audit.
    pub async fn history(&self, order_id: OrderId) -> Result<Vec<AuditRevision>, AuditError> {
        self.store.history(order_id).await
    }

    /// Fetch an order's audit through the store's entry-hash check.
    pub async fn verified_get(&self, order_id: OrderId) -> Result<Option<AuditRecord>, AuditError> {
        Ok(self.store.verified_get(order_id).await?.map(|(record, _)| record))
    }

    /// Lazily stream every audit record.
    pub fn stream_all(&self) -> BoxStream<'_, Result<AuditRecord, AuditError>> {
        self.store.scan_all()
    }

    /// Collect every audit record, sorted by order id.
    pub async fn list_all(&self) -> Result<Vec<AuditRecord>, AuditError> {
        let mut records: Vec<AuditRecord> = self.stream_all().try_collect().await?;
        records.sort_by_key(|r| r.order_id);
        Ok(records)
    }
}

/// Outcome of recording facts for an order that already has an audit.
fn settle_existing(facts: &TransactionFacts, existing: AuditRecord) -> Result<Recorded, AuditError> {
    let computed = digest_canonical(&canonicalize_with(facts, existing.encoding));
    if computed == existing.digest {
        return Ok(Recorded {
            digest: existing.digest,
            created: false,
        });
    }

    warn!(
        order_id = facts.order_id,
        recorded = %existing.digest,
        computed = %computed,
        "Refusing to overwrite audit with different facts"
    );
    Err(AuditError::Conflict {
        order_id: facts.order_id,
        recorded: existing.digest,
        computed,
    })
}
