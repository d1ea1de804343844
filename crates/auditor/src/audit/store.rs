//! Durable, append-only audit records keyed by order.

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use orderproof_core::{audit_key, order_id_from_key, OrderId, AUDIT_KEY_PREFIX};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use super::types::{AuditError, AuditKind, AuditRecord, AuditRevision};
use crate::kv::{KvError, KvRevision, KvStore};
use crate::retry::{retry, RetryPolicy, Retryable};

/// Audit records stored as JSON under `order_<orderId>` in a [`KvStore`].
///
/// Every store call goes through a bounded exponential-backoff retry. A
/// transient failure that outlives the retries surfaces as
/// [`AuditError::StoreUnavailable`].
#[derive(Clone)]
pub struct AuditStore {
    kv: Arc<dyn KvStore>,
    retry: RetryPolicy,
    page_size: usize,
}

impl AuditStore {
    /// Create a store over `kv`, scanning `page_size` keys at a time.
    pub fn new(kv: Arc<dyn KvStore>, retry: RetryPolicy, page_size: usize) -> Self {
        Self {
            kv,
            retry,
            page_size: page_size.max(1),
        }
    }

    /// Write `record` under its order's key.
    ///
    /// A second write for the same order appends a new revision; the newest
    /// revision is authoritative.
    pub async fn put(&self, order_id: OrderId, record: &AuditRecord) -> Result<u64, AuditError> {
        let key = audit_key(order_id);
        let value = serde_json::to_vec(record)?;

        let revision = self
            .call("audit put", || self.kv.put(&key, &value))
            .await?;
        debug!(order_id, revision, digest = %record.digest, "Stored audit record");

        Ok(revision)
    }

    /// Write `record` only if the order has no audit yet.
    ///
    /// Returns `None` when another record already exists; nothing is written.
    pub async fn put_if_absent(
        &self,
        order_id: OrderId,
        record: &AuditRecord,
    ) -> Result<Option<u64>, AuditError> {
        let key = audit_key(order_id);
        let value = serde_json::to_vec(record)?;

        let revision = self
            .call("audit put if absent", || self.kv.put_if_absent(&key, &value))
            .await?;
        if let Some(revision) = revision {
            debug!(order_id, revision, digest = %record.digest, "Stored audit record");
        }

        Ok(revision)
    }

    /// Fetch the audit record of an order.
    pub async fn get(&self, order_id: OrderId) -> Result<Option<AuditRecord>, AuditError> {
        let key = audit_key(order_id);
        let value = self.call("audit get", || self.kv.get(&key)).await?;

        value.map(|bytes| decode(&key, &bytes)).transpose()
    }

    /// Lazily stream every audit record in key order.
    ///
    /// The stream pages through the store with a key cursor, so it is finite
    /// and can be started again at any time. Values that do not decode as audit
    /// records are skipped with a warning.
    pub fn scan_all(&self) -> BoxStream<'_, Result<AuditRecord, AuditError>> {
        let pages = stream::try_unfold(Some(None::<String>), move |cursor| async move {
            let Some(after) = cursor else {
                return Ok(None);
            };

            let page = self
                .call("audit scan", || {
                    self.kv
                        .scan(AUDIT_KEY_PREFIX, after.as_deref(), self.page_size)
                })
                .await?;

            let next = match page.last() {
                Some((key, _)) if page.len() >= self.page_size => Some(Some(key.clone())),
                _ => None,
            };

            let records: Vec<AuditRecord> = page
                .into_iter()
                .filter_map(|(key, bytes)| match decode(&key, &bytes) {
                    Ok(record) => Some(record),
                    Err(e) => {
                        warn!("Skipping unreadable audit entry: {}", e);
                        None
                    }
                })
                .collect();

            Ok::<_, AuditError>(Some((records, next)))
        });

        pages
            .map_ok(|records| stream::iter(records.into_iter().map(Ok)))
            .try_flatten()
            .boxed()
    }

    /// Every stored revision of an order's audit, oldest first.
    pub async fn history(&self, order_id: OrderId) -> Result<Vec<AuditRevision>, AuditError> {
        let key = audit_key(order_id);
        let revisions = self.call("audit history", || self.kv.history(&key)).await?;

        Ok(revisions
            .into_iter()
            .map(|rev| AuditRevision {
                revision: rev.revision,
                written_at: rev.written_at,
                entry_hash: rev.entry_hash.clone(),
                record: decode(&key, &rev.value).ok(),
            })
            .collect())
    }

    /// Fetch an order's audit after the store re-checks the entry hash.
    pub async fn verified_get(
        &self,
        order_id: OrderId,
    ) -> Result<Option<(AuditRecord, KvRevision)>, AuditError> {
        let key = audit_key(order_id);
        let revision = self
            .call("audit verified get", || self.kv.verified_get(&key))
            .await?;

        match revision {
            Some(rev) => {
                let record = decode(&key, &rev.value)?;
                Ok(Some((record, rev)))
            }
            None => Ok(None),
        }
    }

    async fn call<T, F, Fut>(&self, what: &str, op: F) -> Result<T, AuditError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, KvError>>,
    {
        retry(&self.retry, what, op).await.map_err(|e| {
            if e.is_retryable() {
                AuditError::StoreUnavailable {
                    attempts: self.retry.max_attempts.max(1),
                    source: e,
                }
            } else {
                AuditError::Store(e)
            }
        })
    }
}

impl std::fmt::Debug for AuditStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditStore")
            .field("retry", &self.retry)
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

fn decode(key: &str, bytes: &[u8]) -> Result<AuditRecord, AuditError> {
    let corrupt = |reason: String| AuditError::Corrupt {
        key: key.to_string(),
        reason,
    };

    let record: AuditRecord = serde_json::from_slice(bytes).map_err(|e| corrupt(e.to_string()))?;

    if record.kind != AuditKind::OrderAudit {
        return Err(corrupt("unexpected kind".to_string()));
    }
    if order_id_from_key(key) != Some(record.order_id) {
        return Err(corrupt(format!(
            "record is for order {}",
            record.order_id
        )));
    }

    Ok(record)
}
