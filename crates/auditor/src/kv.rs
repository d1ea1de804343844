//! Append-only key-value store collaborator.
//!
//! The audit store only needs six operations from its backing store. The
//! [`KvStore`] trait names them; [`SqliteKvStore`] implements them over an
//! append-only revisions table where every write is a new row carrying a
//! SHA-256 entry hash, and rows can be neither updated nor deleted.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use thiserror::Error;

use crate::retry::Retryable;
use crate::storage::Storage;

/// Errors raised by a [`KvStore`].
#[derive(Error, Debug)]
pub enum KvError {
    /// The store could not be reached; another attempt may succeed.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store rejected the operation.
    #[error("store error: {0}")]
    Backend(String),

    /// A stored entry no longer matches its recorded hash.
    #[error("entry hash mismatch for key {key} at revision {revision}")]
    Tampered {
        /// Key of the entry
        key: String,
        /// Revision whose hash did not match
        revision: u64,
    },
}

impl Retryable for KvError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// One stored revision of a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvRevision {
    /// Monotonic revision number (store-wide)
    pub revision: u64,
    /// Stored bytes
    pub value: Vec<u8>,
    /// Lowercase hex SHA-256 over key and value
    pub entry_hash: String,
    /// Write time (Unix millis)
    pub written_at: i64,
}

/// The append-only key-value store the audit store is built on.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Append a new value for `key`; returns the new revision.
    async fn put(&self, key: &str, value: &[u8]) -> Result<u64, KvError>;

    /// Write the first value for `key` in one atomic step.
    ///
    /// Returns `None` without writing when `key` already has a value.
    async fn put_if_absent(&self, key: &str, value: &[u8]) -> Result<Option<u64>, KvError>;

    /// Newest value for `key`.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;

    /// Newest values of keys starting with `prefix` and sorting after `after`,
    /// in key order, at most `limit` of them.
    async fn scan(
        &self,
        prefix: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, Vec<u8>)>, KvError>;

    /// Newest revision of `key`, after re-checking its entry hash.
    async fn verified_get(&self, key: &str) -> Result<Option<KvRevision>, KvError>;

    /// Every revision of `key`, oldest first.
    async fn history(&self, key: &str) -> Result<Vec<KvRevision>, KvError>;
}

/// Hash binding a value to its key: `SHA256(key || 0x00 || value)`.
pub fn entry_hash(key: &str, value: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.update([0u8]);
    hasher.update(value);
    hex::encode(hasher.finalize())
}

/// [`KvStore`] over the `kv_entries` table.
#[derive(Debug, Clone)]
pub struct SqliteKvStore {
    pool: SqlitePool,
}

impl SqliteKvStore {
    /// Use the pool of an already migrated [`Storage`].
    pub fn new(storage: &Storage) -> Self {
        Self {
            pool: storage.pool().clone(),
        }
    }

    fn row_to_revision(row: sqlx::sqlite::SqliteRow) -> KvRevision {
        KvRevision {
            revision: row.get::<i64, _>("revision") as u64,
            value: row.get("value"),
            entry_hash: row.get("entry_hash"),
            written_at: row.get("written_at"),
        }
    }
}

fn map_sqlx_error(e: sqlx::Error) -> KvError {
    match &e {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => KvError::Unavailable(e.to_string()),
        // SQLITE_BUSY (5) and SQLITE_LOCKED (6) clear on their own
        sqlx::Error::Database(db) if matches!(db.code().as_deref(), Some("5") | Some("6")) => {
            KvError::Unavailable(e.to_string())
        }
        _ => KvError::Backend(e.to_string()),
    }
}

#[async_trait]
impl KvStore for SqliteKvStore {
    async fn put(&self, key: &str, value: &[u8]) -> Result<u64, KvError> {
        let hash = entry_hash(key, value);
        let written_at = chrono::Utc::now().timestamp_millis();

        let result = sqlx::query(
            "INSERT INTO kv_entries (key, value, entry_hash, written_at) VALUES (?, ?, ?, ?)",
        )
        .bind(key)
        .bind(value)
        .bind(&hash)
        .bind(written_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(result.last_insert_rowid() as u64)
    }

    async fn put_if_absent(&self, key: &str, value: &[u8]) -> Result<Option<u64>, KvError> {
        let hash = entry_hash(key, value);
        let written_at = chrono::Utc::now().timestamp_millis();

        // A single INSERT holds the write lock from the existence check to the append
        let result = sqlx::query(
            r#"
            INSERT INTO kv_entries (key, value, entry_hash, written_at)
            SELECT ?, ?, ?, ?
            WHERE NOT EXISTS (SELECT 1 FROM kv_entries WHERE key = ?)
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(&hash)
        .bind(written_at)
        .bind(key)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        Ok(Some(result.last_insert_rowid() as u64))
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        sqlx::query_scalar(
            "SELECT value FROM kv_entries WHERE key = ? ORDER BY revision DESC LIMIT 1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)
    }

    async fn scan(
        &self,
        prefix: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, Vec<u8>)>, KvError> {
        let rows = sqlx::query(
            r#"
            SELECT e.key, e.value
            FROM kv_entries e
            JOIN (
                SELECT key, MAX(revision) AS revision
                FROM kv_entries
                WHERE substr(key, 1, ?) = ? AND key > ?
                GROUP BY key
                ORDER BY key
                LIMIT ?
            ) latest ON latest.revision = e.revision
            ORDER BY e.key
            "#,
        )
        .bind(prefix.chars().count() as i64)
        .bind(prefix)
        .bind(after.unwrap_or(""))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(rows
            .into_iter()
            .map(|row| (row.get("key"), row.get("value")))
            .collect())
    }

    async fn verified_get(&self, key: &str) -> Result<Option<KvRevision>, KvError> {
        let row = sqlx::query(
            r#"
            SELECT revision, value, entry_hash, written_at
            FROM kv_entries
            WHERE key = ?
            ORDER BY revision DESC
            LIMIT 1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        let Some(revision) = row.map(Self::row_to_revision) else {
            return Ok(None);
        };

        if entry_hash(key, &revision.value) != revision.entry_hash {
            return Err(KvError::Tampered {
                key: key.to_string(),
                revision: revision.revision,
            });
        }

        Ok(Some(revision))
    }

    async fn history(&self, key: &str) -> Result<Vec<KvRevision>, KvError> {
        let rows = sqlx::query(
            r#"
            SELECT revision, value, entry_hash, written_at
            FROM kv_entries
            WHERE key = ?
            ORDER BY revision ASC
            "#,
        )
        .bind(key)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(rows.into_iter().map(Self::row_to_revision).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    async fn setup_store() -> (SqliteKvStore, Storage, NamedTempFile) {
        let temp_db = NamedTempFile::new().unwrap();
        let storage = Storage::new_with_path(temp_db.path(), None, None)
            .await
            .unwrap();
        storage.run_migrations().await.unwrap();
        (SqliteKvStore::new(&storage), storage, temp_db)
    }

    #[tokio::test]
    async fn test_put_get_latest_wins() {
        let (kv, _storage, _temp_db) = setup_store().await;

        assert!(kv.get("order_1").await.unwrap().is_none());

        let r1 = kv.put("order_1", b"first").await.unwrap();
        let r2 = kv.put("order_1", b"second").await.unwrap();
        assert!(r2 > r1);

        assert_eq!(kv.get("order_1").await.unwrap().unwrap(), b"second");
    }

    #[tokio::test]
    async fn test_put_if_absent_writes_only_first_value() {
        let (kv, _storage, _temp_db) = setup_store().await;

        let first = kv.put_if_absent("order_1", b"first").await.unwrap();
        assert!(first.is_some());
        assert_eq!(kv.put_if_absent("order_1", b"second").await.unwrap(), None);

        assert_eq!(kv.get("order_1").await.unwrap().unwrap(), b"first");
        assert_eq!(kv.history("order_1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_history_keeps_every_revision() {
        let (kv, _storage, _temp_db) = setup_store().await;

        kv.put("order_1", b"a").await.unwrap();
        kv.put("order_2", b"x").await.unwrap();
        kv.put("order_1", b"b").await.unwrap();

        let history = kv.history("order_1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].value, b"a");
        assert_eq!(history[1].value, b"b");
        assert_eq!(history[1].entry_hash, entry_hash("order_1", b"b"));
    }

    #[tokio::test]
    async fn test_scan_prefix_and_cursor() {
        let (kv, _storage, _temp_db) = setup_store().await;

        for key in ["order_1", "order_10", "order_2", "other_1", "orderX"] {
            kv.put(key, key.as_bytes()).await.unwrap();
        }
        kv.put("order_2", b"newer").await.unwrap();

        let page = kv.scan("order_", None, 2).await.unwrap();
        let keys: Vec<_> = page.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["order_1", "order_10"]);

        let page = kv.scan("order_", Some("order_10"), 2).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].0, "order_2");
        assert_eq!(page[0].1, b"newer");

        assert!(kv.scan("order_", Some("order_2"), 2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_underscore_in_prefix_is_literal() {
        let (kv, _storage, _temp_db) = setup_store().await;
        kv.put("orderA1", b"v").await.unwrap();
        assert!(kv.scan("order_", None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_verified_get_detects_tampering() {
        let (kv, storage, _temp_db) = setup_store().await;
        kv.put("order_1", b"honest").await.unwrap();

        let verified = kv.verified_get("order_1").await.unwrap().unwrap();
        assert_eq!(verified.value, b"honest");

        // Bypass the append-only guard the way an attacker with file access would
        sqlx::query("DROP TRIGGER kv_entries_no_update")
            .execute(storage.pool())
            .await
            .unwrap();
        sqlx::query("UPDATE kv_entries SET value = ? WHERE key = ?")
            .bind(b"forged".as_slice())
            .bind("order_1")
            .execute(storage.pool())
            .await
            .unwrap();

        assert!(matches!(
            kv.verified_get("order_1").await,
            Err(KvError::Tampered { .. })
        ));
        assert!(kv.verified_get("order_404").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_entries_are_append_only() {
        let (kv, storage, _temp_db) = setup_store().await;
        kv.put("order_1", b"v").await.unwrap();

        let update = sqlx::query("UPDATE kv_entries SET value = x'00'")
            .execute(storage.pool())
            .await;
        assert!(update.is_err());

        let delete = sqlx::query("DELETE FROM kv_entries")
            .execute(storage.pool())
            .await;
        assert!(delete.is_err());
    }

    #[test]
    fn test_error_classification() {
        assert!(KvError::Unavailable("down".into()).is_retryable());
        assert!(!KvError::Backend("bad".into()).is_retryable());
        assert!(matches!(
            map_sqlx_error(sqlx::Error::PoolTimedOut),
            KvError::Unavailable(_)
        ));
        assert!(matches!(
            map_sqlx_error(sqlx::Error::RowNotFound),
            KvError::Backend(_)
        ));
    }
}
