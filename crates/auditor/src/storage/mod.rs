//! Storage layer for the OrderProof auditor.
//!
//! This module provides database operations for:
//! - Anchors (Merkle roots submitted on-chain and their lifecycle)
//! - Anchor coverage (which orders each anchor committed to)
//!
//! The same migrations also create the append-only `kv_entries` table used by
//! [`crate::kv::SqliteKvStore`], so one file can back both when convenient.

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

pub mod anchor;
pub mod types;

pub use types::*;

/// Database storage for the auditor.
///
/// Provides async access to SQLite database with connection pooling.
#[derive(Debug, Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    /// Create a new storage instance with the given database URL.
    ///
    /// This will create the database file if it doesn't exist. Call
    /// [`Storage::run_migrations`] before first use.
    ///
    /// # Arguments
    /// * `database_url` - SQLite database URL (e.g., "sqlite://orderproof.db")
    /// * `max_connections` - Pool size (default 5)
    /// * `min_connections` - Idle connections kept open (default 1)
    ///
    /// # Example
    /// ```no_run
    /// # use orderproof_auditor::storage::Storage;
    /// # async fn example() -> anyhow::Result<()> {
    /// let storage = Storage::new("sqlite://orderproof.db", None, None).await?;
    /// storage.run_migrations().await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn new(
        database_url: &str,
        max_connections: Option<u32>,
        min_connections: Option<u32>,
    ) -> Result<Self> {
        info!("Connecting to database: {}", database_url);

        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("Invalid database URL: {}", database_url))?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.unwrap_or(5))
            .min_connections(min_connections.unwrap_or(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        info!("Database connection established");

        Ok(Self { pool })
    }

    /// Create a new storage instance with a specific file path.
    pub async fn new_with_path<P: AsRef<Path>>(
        path: P,
        max_connections: Option<u32>,
        min_connections: Option<u32>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let database_url = format!("sqlite://{}", path.display());
        Self::new(&database_url, max_connections, min_connections).await
    }

    /// Run database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Migrations completed successfully");

        Ok(())
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the database connection pool.
    pub async fn close(&self) {
        info!("Closing database connection");
        self.pool.close().await;
    }

    /// Get database statistics.
    pub async fn stats(&self) -> Result<DatabaseStats> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM anchors GROUP BY status")
                .fetch_all(&self.pool)
                .await
                .context("Failed to count anchors")?;

        let mut stats = DatabaseStats::default();
        for (status, count) in rows {
            match status.parse::<AnchorStatus>() {
                Ok(AnchorStatus::Pending) => stats.pending_anchors = count as u64,
                Ok(AnchorStatus::Confirmed) => stats.confirmed_anchors = count as u64,
                Ok(AnchorStatus::Failed) => stats.failed_anchors = count as u64,
                Err(_) => {}
            }
        }

        let kv_keys: i64 = sqlx::query_scalar("SELECT COUNT(DISTINCT key) FROM kv_entries")
            .fetch_one(&self.pool)
            .await?;
        stats.kv_keys = kv_keys as u64;

        Ok(stats)
    }

    /// Check database health.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("Database health check failed")?;

        Ok(())
    }
}

/// Database statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatabaseStats {
    /// Anchors still awaiting confirmation
    pub pending_anchors: u64,

    /// Confirmed anchors
    pub confirmed_anchors: u64,

    /// Failed anchoring attempts
    pub failed_anchors: u64,

    /// Distinct keys in the local key-value table
    pub kv_keys: u64,
}
