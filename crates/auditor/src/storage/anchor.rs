//! Anchor storage operations.
//!
//! Status transitions are single `UPDATE ... WHERE status = 'PENDING'`
//! statements, so a terminal row is never rewritten.

use super::{AnchorConfirmation, AnchorRecord, AnchorStatus, NewAnchor, Storage};
use alloy::primitives::B256;
use anyhow::{Context, Result};
use orderproof_core::OrderId;
use sqlx::Row;

const ANCHOR_COLUMNS: &str = r#"
    a.id, a.merkle_root, a.chain_id, a.audit_count, a.status,
    a.tx_hash, a.block_number, a.error, a.created_at, a.confirmed_at,
    (SELECT group_concat(o.order_id) FROM anchor_orders o WHERE o.anchor_id = a.id) AS order_ids
"#;

impl Storage {
    /// Insert a PENDING anchor together with its covered orders.
    ///
    /// Returns `None` without writing anything when another PENDING row for
    /// the same root already exists.
    pub async fn insert_pending_anchor(&self, anchor: &NewAnchor) -> Result<Option<AnchorRecord>> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO anchors (
                merkle_root, chain_id, audit_count, status, created_at
            )
            VALUES (?, ?, ?, 'PENDING', ?)
            "#,
        )
        .bind(anchor.merkle_root.to_string())
        .bind(anchor.chain_id as i64)
        .bind(anchor.order_ids.len() as i64)
        .bind(anchor.created_at)
        .execute(&mut *tx)
        .await
        .context("Failed to insert anchor")?;

        if result.rows_affected() == 0 {
            tx.rollback().await.ok();
            return Ok(None);
        }

        let id = result.last_insert_rowid();

        for (leaf_index, order_id) in anchor.order_ids.iter().enumerate() {
            let order_id = i64::try_from(*order_id)
                .with_context(|| format!("Order id {} does not fit the coverage table", order_id))?;
            sqlx::query(
                "INSERT INTO anchor_orders (anchor_id, order_id, leaf_index) VALUES (?, ?, ?)",
            )
            .bind(id)
            .bind(order_id)
            .bind(leaf_index as i64)
            .execute(&mut *tx)
            .await
            .context("Failed to insert anchor coverage")?;
        }

        tx.commit().await.context("Failed to commit anchor")?;

        Ok(Some(AnchorRecord {
            id,
            merkle_root: anchor.merkle_root,
            chain_id: anchor.chain_id,
            audit_count: anchor.order_ids.len() as u64,
            order_ids: anchor.order_ids.clone(),
            status: AnchorStatus::Pending,
            tx_hash: None,
            block_number: None,
            error: None,
            created_at: anchor.created_at,
            confirmed_at: None,
        }))
    }

    /// Move a PENDING anchor to CONFIRMED.
    ///
    /// Returns false if the row was not PENDING.
    pub async fn mark_anchor_confirmed(
        &self,
        id: i64,
        confirmation: &AnchorConfirmation,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE anchors
            SET status = 'CONFIRMED', tx_hash = ?, block_number = ?, confirmed_at = ?, error = NULL
            WHERE id = ? AND status = 'PENDING'
            "#,
        )
        .bind(confirmation.tx_hash.to_string())
        .bind(confirmation.block_number as i64)
        .bind(confirmation.confirmed_at)
        .bind(id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to confirm anchor {}", id))?;

        Ok(result.rows_affected() == 1)
    }

    /// Move a PENDING anchor to FAILED with a reason.
    ///
    /// Returns false if the row was not PENDING.
    pub async fn mark_anchor_failed(&self, id: i64, error: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE anchors
            SET status = 'FAILED', error = ?
            WHERE id = ? AND status = 'PENDING'
            "#,
        )
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to mark anchor {} as failed", id))?;

        Ok(result.rows_affected() == 1)
    }

    /// Get an anchor by id.
    pub async fn get_anchor(&self, id: i64) -> Result<Option<AnchorRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM anchors a WHERE a.id = ?",
            ANCHOR_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_anchor_record).transpose()
    }

    /// Get the CONFIRMED anchor for a root, if any.
    pub async fn get_confirmed_anchor_by_root(&self, root: &B256) -> Result<Option<AnchorRecord>> {
        self.get_anchor_by_root(root, AnchorStatus::Confirmed).await
    }

    /// Get the PENDING anchor for a root, if any.
    pub async fn get_pending_anchor_by_root(&self, root: &B256) -> Result<Option<AnchorRecord>> {
        self.get_anchor_by_root(root, AnchorStatus::Pending).await
    }

    async fn get_anchor_by_root(
        &self,
        root: &B256,
        status: AnchorStatus,
    ) -> Result<Option<AnchorRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM anchors a WHERE a.merkle_root = ? AND a.status = ? ORDER BY a.id DESC LIMIT 1",
            ANCHOR_COLUMNS
        ))
        .bind(root.to_string())
        .bind(status.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_anchor_record).transpose()
    }

    /// Most recent CONFIRMED anchor that covers `order_id`.
    pub async fn get_latest_confirmed_anchor_for_order(
        &self,
        order_id: OrderId,
    ) -> Result<Option<AnchorRecord>> {
        // Ids beyond the column range can never be covered
        let Ok(order_id) = i64::try_from(order_id) else {
            return Ok(None);
        };

        let row = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM anchors a
            JOIN anchor_orders c ON c.anchor_id = a.id
            WHERE c.order_id = ? AND a.status = 'CONFIRMED'
            ORDER BY a.id DESC
            LIMIT 1
            "#,
            ANCHOR_COLUMNS
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_anchor_record).transpose()
    }

    /// Most recent CONFIRMED anchor.
    pub async fn get_latest_confirmed_anchor(&self) -> Result<Option<AnchorRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM anchors a WHERE a.status = 'CONFIRMED' ORDER BY a.id DESC LIMIT 1",
            ANCHOR_COLUMNS
        ))
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_anchor_record).transpose()
    }

    /// All PENDING anchors, oldest first.
    pub async fn get_pending_anchors(&self) -> Result<Vec<AnchorRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM anchors a WHERE a.status = 'PENDING' ORDER BY a.id ASC",
            ANCHOR_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_anchor_record).collect()
    }

    /// All anchors, newest first.
    pub async fn get_all_anchors(&self) -> Result<Vec<AnchorRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM anchors a ORDER BY a.id DESC",
            ANCHOR_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_anchor_record).collect()
    }

    /// Count anchors in a given state.
    pub async fn count_anchors(&self, status: AnchorStatus) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM anchors WHERE status = ?")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await?;

        Ok(count as u64)
    }

    fn row_to_anchor_record(row: sqlx::sqlite::SqliteRow) -> Result<AnchorRecord> {
        let merkle_root: String = row.get("merkle_root");
        let tx_hash: Option<String> = row.get("tx_hash");
        let status: String = row.get("status");
        let order_ids: Option<String> = row.get("order_ids");

        let mut order_ids = order_ids
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<OrderId>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Corrupt anchor coverage")?;
        order_ids.sort_unstable();

        Ok(AnchorRecord {
            id: row.get("id"),
            merkle_root: merkle_root
                .parse()
                .with_context(|| format!("Corrupt anchor root: {}", merkle_root))?,
            chain_id: row.get::<i64, _>("chain_id") as u64,
            audit_count: row.get::<i64, _>("audit_count") as u64,
            order_ids,
            status: status.parse()?,
            tx_hash: tx_hash
                .map(|h| h.parse::<B256>())
                .transpose()
                .context("Corrupt anchor tx hash")?,
            block_number: row.get::<Option<i64>, _>("block_number").map(|b| b as u64),
            error: row.get("error"),
            created_at: row.get("created_at"),
            confirmed_at: row.get("confirmed_at"),
        })
    }
}
