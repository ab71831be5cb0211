use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use tokio::sync::Mutex;

use chatcart_core::commerce::catalog::CouponUsageLedger;
use chatcart_core::domain::cart::CustomerKey;
use chatcart_core::domain::coupon::CouponId;
use chatcart_core::errors::CollaboratorError;

use super::cart::encode_timestamp;
use super::RepositoryError;
use crate::DbPool;

/// Phone-keyed coupon redemptions recorded by this platform, one row per order.
pub struct SqlCouponUsageRepository {
    pool: DbPool,
}

impl SqlCouponUsageRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Records a redemption inside the caller's transaction. Replaying the same order
    /// is a no-op; returns whether a row was written.
    pub async fn record_usage_in(
        conn: &mut SqliteConnection,
        coupon_id: &CouponId,
        customer_key: &CustomerKey,
        order_id: &str,
        used_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO coupon_usage (coupon_id, customer_key, order_id, used_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&coupon_id.0)
        .bind(customer_key.as_str())
        .bind(order_id)
        .bind(encode_timestamp(used_at))
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn count(
        &self,
        coupon_id: &CouponId,
        customer_key: &CustomerKey,
    ) -> Result<u32, RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        Self::count_in(&mut conn, coupon_id, customer_key).await
    }

    pub async fn count_in(
        conn: &mut SqliteConnection,
        coupon_id: &CouponId,
        customer_key: &CustomerKey,
    ) -> Result<u32, RepositoryError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM coupon_usage WHERE coupon_id = ? AND customer_key = ?",
        )
        .bind(&coupon_id.0)
        .bind(customer_key.as_str())
        .fetch_one(&mut *conn)
        .await?;

        u32::try_from(count)
            .map_err(|_| RepositoryError::Decode(format!("invalid coupon usage count: {count}")))
    }
}

/// Ledger view over an open transaction. Counts see the transaction's own writes and
/// never need a second pooled connection.
pub struct TransactionUsageLedger<'c> {
    conn: Mutex<&'c mut SqliteConnection>,
}

impl<'c> TransactionUsageLedger<'c> {
    pub fn new(conn: &'c mut SqliteConnection) -> Self {
        Self { conn: Mutex::new(conn) }
    }
}

#[async_trait]
impl<'c> CouponUsageLedger for TransactionUsageLedger<'c> {
    async fn count_for_customer(
        &self,
        coupon_id: &CouponId,
        customer_key: &CustomerKey,
    ) -> Result<u32, CollaboratorError> {
        let mut conn = self.conn.lock().await;
        SqlCouponUsageRepository::count_in(&mut conn, coupon_id, customer_key)
            .await
            .map_err(|error| CollaboratorError::new("coupon usage ledger", error.to_string()))
    }
}

#[async_trait]
impl CouponUsageLedger for SqlCouponUsageRepository {
    async fn count_for_customer(
        &self,
        coupon_id: &CouponId,
        customer_key: &CustomerKey,
    ) -> Result<u32, CollaboratorError> {
        self.count(coupon_id, customer_key)
            .await
            .map_err(|error| CollaboratorError::new("coupon usage ledger", error.to_string()))
    }
}
