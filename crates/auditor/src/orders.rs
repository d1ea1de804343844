//! Read access to the marketplace order database.
//!
//! The order database belongs to the marketplace; this module only reads the
//! facts that get audited. Expected table:
//!
//! ```sql
//! CREATE TABLE orders (
//!     id INTEGER PRIMARY KEY,
//!     status TEXT NOT NULL,          -- 'Completed' once paid
//!     total_credits INTEGER NOT NULL,
//!     total_price TEXT NOT NULL,     -- decimal string
//!     paid_at INTEGER,               -- Unix millis, NULL until paid
//!     buyer TEXT,
//!     seller TEXT
//! );
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use orderproof_core::{OrderId, TransactionFacts};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;

/// Status value of a paid order.
pub const COMPLETED_STATUS: &str = "Completed";

/// What the order database knows about one order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderLookup {
    /// No such order.
    Missing,
    /// The order exists but is not paid yet.
    NotCompleted {
        /// Current status
        status: String,
    },
    /// The order is paid; these are its facts.
    Completed(TransactionFacts),
}

/// One completed order read from the source, or why its row could not be read.
pub type CompletedOrder = Result<TransactionFacts>;

/// Source of completed order facts.
#[async_trait]
pub trait OrderSource: Send + Sync {
    /// Look up one order.
    async fn lookup(&self, order_id: OrderId) -> Result<OrderLookup>;

    /// Every completed order, ascending by id.
    ///
    /// A row that cannot be decoded is returned as an `Err` entry so the
    /// remaining orders can still be processed.
    async fn completed_orders(&self) -> Result<Vec<CompletedOrder>>;
}

/// [`OrderSource`] over a SQLite order database.
#[derive(Debug, Clone)]
pub struct SqliteOrderSource {
    pool: SqlitePool,
}

impl SqliteOrderSource {
    /// Open the order database read-only.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("Invalid order database URL: {}", url))?
            .read_only(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .context("Failed to connect to order database")?;

        Ok(Self { pool })
    }

    /// Use an existing pool.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrderSource for SqliteOrderSource {
    async fn lookup(&self, order_id: OrderId) -> Result<OrderLookup> {
        let Ok(id) = i64::try_from(order_id) else {
            return Ok(OrderLookup::Missing);
        };

        let row = sqlx::query(
            r#"
            SELECT id, status, total_credits, total_price, paid_at, buyer, seller
            FROM orders
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("Failed to load order {}", order_id))?;

        let Some(row) = row else {
            return Ok(OrderLookup::Missing);
        };

        let status: String = row.get("status");
        let paid_at: Option<i64> = row.get("paid_at");
        if status != COMPLETED_STATUS || paid_at.is_none() {
            return Ok(OrderLookup::NotCompleted { status });
        }

        Ok(OrderLookup::Completed(row_to_facts(&row)?))
    }

    async fn completed_orders(&self) -> Result<Vec<CompletedOrder>> {
        let rows = sqlx::query(
            r#"
            SELECT id, status, total_credits, total_price, paid_at, buyer, seller
            FROM orders
            WHERE status = ? AND paid_at IS NOT NULL
            ORDER BY id ASC
            "#,
        )
        .bind(COMPLETED_STATUS)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list completed orders")?;

        Ok(rows.iter().map(row_to_facts).collect())
    }
}

fn row_to_facts(row: &sqlx::sqlite::SqliteRow) -> Result<TransactionFacts> {
    let id: i64 = row.get("id");
    let order_id = OrderId::try_from(id).with_context(|| format!("Negative order id {}", id))?;

    let price: String = row.get("total_price");
    let total_price = Decimal::from_str(price.trim())
        .with_context(|| format!("Order {} has invalid total_price '{}'", id, price))?;

    let paid_at_millis: Option<i64> = row.get("paid_at");
    let paid_at_millis =
        paid_at_millis.with_context(|| format!("Order {} has no paid_at", id))?;
    let paid_at = Utc
        .timestamp_millis_opt(paid_at_millis)
        .single()
        .with_context(|| format!("Order {} has invalid paid_at {}", id, paid_at_millis))?;

    Ok(TransactionFacts {
        order_id,
        total_credits: row.get("total_credits"),
        total_price,
        paid_at,
        buyer: row.get("buyer"),
        seller: row.get("seller"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> SqliteOrderSource {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();

        sqlx::query(
            r#"
            CREATE TABLE orders (
                id INTEGER PRIMARY KEY,
                status TEXT NOT NULL,
                total_credits INTEGER NOT NULL,
                total_price TEXT NOT NULL,
                paid_at INTEGER,
                buyer TEXT,
                seller TEXT
            )
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();

        for (id, status, price, paid_at) in [
            (42_i64, "Completed", "250.50", Some(1_700_000_000_000_i64)),
            (7, "Completed", "10", Some(1_700_000_100_000)),
            (8, "Pending", "12.00", None),
            (9, "Completed", "5", None),
        ] {
            sqlx::query(
                "INSERT INTO orders (id, status, total_credits, total_price, paid_at, buyer) VALUES (?, ?, 100, ?, ?, 'buyer-7')",
            )
            .bind(id)
            .bind(status)
            .bind(price)
            .bind(paid_at)
            .execute(&pool)
            .await
            .unwrap();
        }

        SqliteOrderSource::from_pool(pool)
    }

    #[tokio::test]
    async fn test_lookup_completed() {
        let source = setup().await;
        let OrderLookup::Completed(facts) = source.lookup(42).await.unwrap() else {
            panic!("order 42 should be completed");
        };
        assert_eq!(facts.order_id, 42);
        assert_eq!(facts.total_credits, 100);
        assert_eq!(facts.total_price, Decimal::new(25050, 2));
        assert_eq!(facts.paid_at_millis(), 1_700_000_000_000);
        assert_eq!(facts.buyer.as_deref(), Some("buyer-7"));
        assert_eq!(facts.seller, None);
        assert_eq!(
            orderproof_core::canonicalize(&facts),
            "42100250.51700000000000"
        );
    }

    #[tokio::test]
    async fn test_lookup_missing_and_not_completed() {
        let source = setup().await;
        assert_eq!(source.lookup(1000).await.unwrap(), OrderLookup::Missing);
        assert_eq!(
            source.lookup(8).await.unwrap(),
            OrderLookup::NotCompleted {
                status: "Pending".to_string()
            }
        );
        // Completed without a payment time is not audited
        assert!(matches!(
            source.lookup(9).await.unwrap(),
            OrderLookup::NotCompleted { .. }
        ));
    }

    #[tokio::test]
    async fn test_completed_orders_ascending() {
        let source = setup().await;
        let ids: Vec<_> = source
            .completed_orders()
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.unwrap().order_id)
            .collect();
        assert_eq!(ids, vec![7, 42]);
    }

    #[tokio::test]
    async fn test_completed_orders_keeps_going_past_bad_rows() {
        let source = setup().await;
        sqlx::query(
            "INSERT INTO orders (id, status, total_credits, total_price, paid_at) VALUES (10, 'Completed', 1, 'twelve', 1700000000000)",
        )
        .execute(&source.pool)
        .await
        .unwrap();

        let completed = source.completed_orders().await.unwrap();
        assert_eq!(completed.len(), 3);
        assert_eq!(completed[0].as_ref().unwrap().order_id, 7);
        let err = completed[1].as_ref().unwrap_err();
        assert!(format!("{:#}", err).contains("invalid total_price"));
        assert_eq!(completed[2].as_ref().unwrap().order_id, 42);
        assert_eq!(source.lookup(u64::MAX).await.unwrap(), OrderLookup::Missing);
    }
}
