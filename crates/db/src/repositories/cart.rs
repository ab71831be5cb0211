use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection};
use tracing::{debug, info};

use chatcart_core::domain::cart::{Cart, CartId, CartItem, CartStatus, CustomerKey};
use chatcart_core::lock::{LockKey, LockManager, DEFAULT_LOCK_TIMEOUT};

use super::RepositoryError;
use crate::DbPool;

/// Abandoned carts stop receiving reminders after this many have been sent.
pub const MAX_REMINDER_STAGE: u8 = 3;

pub type DbTransaction = sqlx::Transaction<'static, sqlx::Sqlite>;

const CART_COLUMNS: &str = "id, customer_key, status, items_json, coupon_code, total, expires_at,
    abandoned_at, reminder_stage, last_reminder_at, order_id, recovered, recovered_order_id,
    recovered_revenue, created_at, updated_at";

/// Unlocked and administrative cart queries. Results must not drive a financial mutation.
#[async_trait]
pub trait CartStore: Send + Sync {
    async fn find(&self, id: &CartId) -> Result<Option<Cart>, RepositoryError>;

    async fn find_active_by_customer(
        &self,
        customer_key: &CustomerKey,
    ) -> Result<Option<Cart>, RepositoryError>;

    /// Carts the reminder scheduler should look at: idle active carts with items, and
    /// abandoned carts whose reminder sequence has not finished.
    async fn find_abandoned(
        &self,
        inactive_since: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Cart>, RepositoryError>;

    /// Active carts whose expiry has passed, oldest expiry first.
    async fn find_expired(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Cart>, RepositoryError>;

    /// Returns `false` when `stage` would not advance the cart's reminder sequence.
    async fn mark_reminder_sent(
        &self,
        id: &CartId,
        stage: u8,
        sent_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;

    /// Flips up to `batch_size` expired active carts to EXPIRED.
    async fn expire_stale(
        &self,
        now: DateTime<Utc>,
        batch_size: u32,
    ) -> Result<u64, RepositoryError>;
}

pub struct SqlCartStore {
    pool: DbPool,
    locks: Arc<dyn LockManager>,
    lock_timeout: Duration,
}

impl SqlCartStore {
    pub fn new(pool: DbPool, locks: Arc<dyn LockManager>) -> Self {
        Self { pool, locks, lock_timeout: DEFAULT_LOCK_TIMEOUT }
    }

    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub async fn begin(&self) -> Result<DbTransaction, RepositoryError> {
        Ok(self.pool.begin().await?)
    }

    /// Locked read by id. Must run inside an open transaction.
    ///
    /// SQLite has no row locks, so the no-op update takes the database write lock for
    /// the rest of the transaction; concurrent writers wait on it until commit or rollback.
    pub async fn find_for_update(
        &self,
        conn: &mut SqliteConnection,
        id: &CartId,
    ) -> Result<Option<Cart>, RepositoryError> {
        sqlx::query("UPDATE cart SET id = id WHERE id = ?").bind(&id.0).execute(&mut *conn).await?;

        let row = sqlx::query(&format!("SELECT {CART_COLUMNS} FROM cart WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&mut *conn)
            .await?;
        row.map(cart_from_row).transpose()
    }

    pub async fn find_active_by_customer_for_update(
        &self,
        conn: &mut SqliteConnection,
        customer_key: &CustomerKey,
    ) -> Result<Option<Cart>, RepositoryError> {
        sqlx::query("UPDATE cart SET id = id WHERE customer_key = ? AND status = 'active'")
            .bind(customer_key.as_str())
            .execute(&mut *conn)
            .await?;

        let row = sqlx::query(&format!(
            "SELECT {CART_COLUMNS} FROM cart WHERE customer_key = ? AND status = 'active'"
        ))
        .bind(customer_key.as_str())
        .fetch_optional(&mut *conn)
        .await?;
        row.map(cart_from_row).transpose()
    }

    /// Most recently touched ACTIVE or ABANDONED cart, the candidates for checkout.
    pub async fn find_latest_open_for_update(
        &self,
        conn: &mut SqliteConnection,
        customer_key: &CustomerKey,
    ) -> Result<Option<Cart>, RepositoryError> {
        sqlx::query(
            "UPDATE cart SET id = id
             WHERE customer_key = ? AND status IN ('active', 'abandoned')",
        )
        .bind(customer_key.as_str())
        .execute(&mut *conn)
        .await?;

        let row = sqlx::query(&format!(
            "SELECT {CART_COLUMNS} FROM cart
             WHERE customer_key = ? AND status IN ('active', 'abandoned')
             ORDER BY updated_at DESC, created_at DESC
             LIMIT 1"
        ))
        .bind(customer_key.as_str())
        .fetch_optional(&mut *conn)
        .await?;
        row.map(cart_from_row).transpose()
    }

    /// Converted cart already booked for `order_id`, used to make checkout idempotent.
    pub async fn find_converted_for_order(
        &self,
        conn: &mut SqliteConnection,
        customer_key: &CustomerKey,
        order_id: &str,
    ) -> Result<Option<Cart>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {CART_COLUMNS} FROM cart
             WHERE customer_key = ? AND status = 'converted' AND order_id = ?
             LIMIT 1"
        ))
        .bind(customer_key.as_str())
        .bind(order_id)
        .fetch_optional(&mut *conn)
        .await?;
        row.map(cart_from_row).transpose()
    }

    /// Returns the customer's locked ACTIVE cart, creating it when none exists.
    ///
    /// The per-customer lock is held only while existence is decided; the write lock
    /// taken by the locked read protects the cart for the rest of the transaction. An
    /// ACTIVE cart found past its expiry is flipped to EXPIRED and replaced.
    pub async fn find_or_create_for_update(
        &self,
        conn: &mut SqliteConnection,
        customer_key: &CustomerKey,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Cart, RepositoryError> {
        let guard =
            self.locks.acquire(&LockKey::for_customer(customer_key), self.lock_timeout).await?;

        if let Some(mut existing) =
            self.find_active_by_customer_for_update(conn, customer_key).await?
        {
            if !existing.is_expired_at(now) {
                return Ok(existing);
            }

            existing.status = CartStatus::Expired;
            existing.updated_at = now;
            self.update_locked(conn, &existing).await?;
            info!(
                event_name = "cart.expired_on_access",
                cart_id = %existing.id,
                customer_key = %customer_key,
                "expired cart replaced on access"
            );
        }

        let created = Cart::new(customer_key.clone(), now, expires_at);
        self.insert(conn, &created).await?;
        let cart = self
            .find_for_update(conn, &created.id)
            .await?
            .ok_or_else(|| RepositoryError::CartNotFound(created.id.0.clone()))?;
        guard.release();

        debug!(
            event_name = "cart.created",
            cart_id = %cart.id,
            customer_key = %customer_key,
            expires_at = %cart.expires_at,
            "cart created"
        );
        Ok(cart)
    }

    pub async fn insert(
        &self,
        conn: &mut SqliteConnection,
        cart: &Cart,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO cart (
                id,
                customer_key,
                status,
                items_json,
                coupon_code,
                total,
                expires_at,
                abandoned_at,
                reminder_stage,
                last_reminder_at,
                order_id,
                recovered,
                recovered_order_id,
                recovered_revenue,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&cart.id.0)
        .bind(cart.customer_key.as_str())
        .bind(cart.status.as_str())
        .bind(encode_items(&cart.items)?)
        .bind(cart.coupon_code.as_deref())
        .bind(cart.total.to_string())
        .bind(encode_timestamp(cart.expires_at))
        .bind(cart.abandoned_at.map(encode_timestamp))
        .bind(i64::from(cart.reminder_stage))
        .bind(cart.last_reminder_at.map(encode_timestamp))
        .bind(cart.order_id.as_deref())
        .bind(cart.recovered)
        .bind(cart.recovered_order_id.as_deref())
        .bind(cart.recovered_revenue.map(|revenue| revenue.to_string()))
        .bind(encode_timestamp(cart.created_at))
        .bind(encode_timestamp(cart.updated_at))
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Writes the full mutable state of a cart the caller already holds locked.
    pub async fn update_locked(
        &self,
        conn: &mut SqliteConnection,
        cart: &Cart,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE cart SET
                status = ?,
                items_json = ?,
                coupon_code = ?,
                total = ?,
                expires_at = ?,
                abandoned_at = ?,
                reminder_stage = ?,
                last_reminder_at = ?,
                order_id = ?,
                recovered = ?,
                recovered_order_id = ?,
                recovered_revenue = ?,
                updated_at = ?
             WHERE id = ?",
        )
        .bind(cart.status.as_str())
        .bind(encode_items(&cart.items)?)
        .bind(cart.coupon_code.as_deref())
        .bind(cart.total.to_string())
        .bind(encode_timestamp(cart.expires_at))
        .bind(cart.abandoned_at.map(encode_timestamp))
        .bind(i64::from(cart.reminder_stage))
        .bind(cart.last_reminder_at.map(encode_timestamp))
        .bind(cart.order_id.as_deref())
        .bind(cart.recovered)
        .bind(cart.recovered_order_id.as_deref())
        .bind(cart.recovered_revenue.map(|revenue| revenue.to_string()))
        .bind(encode_timestamp(cart.updated_at))
        .bind(&cart.id.0)
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::CartNotFound(cart.id.0.clone()));
        }
        Ok(())
    }

    /// Converts an ABANDONED cart and books it as recovered. A cart that is already
    /// recovered, or was never abandoned, is left untouched and `None` is returned.
    pub async fn mark_recovered(
        &self,
        conn: &mut SqliteConnection,
        id: &CartId,
        order_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Cart>, RepositoryError> {
        let mut cart = self
            .find_for_update(conn, id)
            .await?
            .ok_or_else(|| RepositoryError::CartNotFound(id.0.clone()))?;

        if cart.recovered || cart.status != CartStatus::Abandoned {
            return Ok(None);
        }
        match cart.mark_converted(order_id, now) {
            Ok(true) => {}
            Ok(false) | Err(_) => return Ok(None),
        }

        self.update_locked(conn, &cart).await?;
        Ok(Some(cart))
    }
}

#[async_trait]
impl CartStore for SqlCartStore {
    async fn find(&self, id: &CartId) -> Result<Option<Cart>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {CART_COLUMNS} FROM cart WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.map(cart_from_row).transpose()
    }

    async fn find_active_by_customer(
        &self,
        customer_key: &CustomerKey,
    ) -> Result<Option<Cart>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {CART_COLUMNS} FROM cart WHERE customer_key = ? AND status = 'active'"
        ))
        .bind(customer_key.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(cart_from_row).transpose()
    }

    async fn find_abandoned(
        &self,
        inactive_since: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Cart>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {CART_COLUMNS} FROM cart
             WHERE (status = 'active' AND items_json <> '[]' AND updated_at < ?)
                OR (status = 'abandoned' AND recovered = 0 AND reminder_stage < ?)
             ORDER BY updated_at ASC
             LIMIT ?"
        ))
        .bind(encode_timestamp(inactive_since))
        .bind(i64::from(MAX_REMINDER_STAGE))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(cart_from_row).collect()
    }

    async fn find_expired(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Cart>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {CART_COLUMNS} FROM cart
             WHERE status = 'active' AND expires_at <= ?
             ORDER BY expires_at ASC
             LIMIT ?"
        ))
        .bind(encode_timestamp(now))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(cart_from_row).collect()
    }

    async fn mark_reminder_sent(
        &self,
        id: &CartId,
        stage: u8,
        sent_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE cart SET reminder_stage = ?, last_reminder_at = ?
             WHERE id = ? AND reminder_stage < ?",
        )
        .bind(i64::from(stage))
        .bind(encode_timestamp(sent_at))
        .bind(&id.0)
        .bind(i64::from(stage))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn expire_stale(
        &self,
        now: DateTime<Utc>,
        batch_size: u32,
    ) -> Result<u64, RepositoryError> {
        let now = encode_timestamp(now);
        let result = sqlx::query(
            "UPDATE cart SET status = 'expired', updated_at = ?
             WHERE id IN (
                SELECT id FROM cart
                WHERE status = 'active' AND expires_at <= ?
                ORDER BY expires_at ASC
                LIMIT ?
             )",
        )
        .bind(&now)
        .bind(&now)
        .bind(i64::from(batch_size.max(1)))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

fn cart_from_row(row: SqliteRow) -> Result<Cart, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = CartStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown cart status `{status_raw}`")))?;

    let items_json = row.try_get::<String, _>("items_json")?;
    let items: Vec<CartItem> = serde_json::from_str(&items_json)
        .map_err(|error| RepositoryError::Decode(format!("invalid items_json: {error}")))?;

    let reminder_stage = row.try_get::<i64, _>("reminder_stage")?;
    let reminder_stage = u8::try_from(reminder_stage).map_err(|_| {
        RepositoryError::Decode(format!("invalid reminder_stage: {reminder_stage}"))
    })?;

    Ok(Cart {
        id: CartId(row.try_get("id")?),
        customer_key: CustomerKey(row.try_get("customer_key")?),
        items,
        coupon_code: row.try_get("coupon_code")?,
        status,
        total: parse_decimal("total", row.try_get("total")?)?,
        expires_at: parse_timestamp("expires_at", row.try_get("expires_at")?)?,
        abandoned_at: parse_optional_timestamp("abandoned_at", row.try_get("abandoned_at")?)?,
        reminder_stage,
        last_reminder_at: parse_optional_timestamp(
            "last_reminder_at",
            row.try_get("last_reminder_at")?,
        )?,
        order_id: row.try_get("order_id")?,
        recovered: row.try_get::<i64, _>("recovered")? != 0,
        recovered_order_id: row.try_get("recovered_order_id")?,
        recovered_revenue: row
            .try_get::<Option<String>, _>("recovered_revenue")?
            .map(|value| parse_decimal("recovered_revenue", value))
            .transpose()?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

fn encode_items(items: &[CartItem]) -> Result<String, RepositoryError> {
    serde_json::to_string(items)
        .map_err(|error| RepositoryError::Decode(format!("could not encode items: {error}")))
}

// Fixed width keeps lexical order equal to chronological order in SQL comparisons.
pub(crate) fn encode_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_decimal(column: &str, value: String) -> Result<Decimal, RepositoryError> {
    Decimal::from_str(&value).map_err(|error| {
        RepositoryError::Decode(format!("invalid decimal in `{column}`: `{value}` ({error})"))
    })
}

fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

fn parse_optional_timestamp(
    column: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    value.map(|timestamp| parse_timestamp(column, timestamp)).transpose()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    use chrono::{DateTime, Duration, DurationRound, Utc};
    use rust_decimal::Decimal;

    use chatcart_core::domain::cart::{Cart, CartItem, CartStatus, CustomerKey};
    use chatcart_core::domain::product::ProductId;
    use chatcart_core::lock::{InProcessLockManager, LockKey, LockManager};

    use super::{CartStore, SqlCartStore, MAX_REMINDER_STAGE};
    use crate::repositories::RepositoryError;
    use crate::{connect_with_settings, migrations};

    async fn setup() -> (SqlCartStore, Arc<InProcessLockManager>) {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        let locks = Arc::new(InProcessLockManager::new());
        let store = SqlCartStore::new(pool, locks.clone())
            .with_lock_timeout(StdDuration::from_millis(50));
        (store, locks)
    }

    // Stored timestamps carry microseconds.
    fn now() -> DateTime<Utc> {
        Utc::now().duration_trunc(Duration::microseconds(1)).expect("truncate")
    }

    fn customer(raw: &str) -> CustomerKey {
        CustomerKey(raw.to_string())
    }

    fn item(product: &str, quantity: u32, cents: i64) -> CartItem {
        CartItem {
            product_id: ProductId(product.to_string()),
            variation_id: None,
            quantity,
            price_at_add: Decimal::new(cents, 2),
            product_name: format!("Product {product}"),
            variant_attributes: BTreeMap::from([("size".to_string(), "L".to_string())]),
        }
    }

    async fn seed(store: &SqlCartStore, cart: &Cart) {
        let mut tx = store.begin().await.expect("begin");
        store.insert(&mut tx, cart).await.expect("insert");
        tx.commit().await.expect("commit");
    }

    #[tokio::test]
    async fn insert_and_find_round_trip_all_fields() {
        let (store, _) = setup().await;
        let now = now();
        let mut cart = Cart::new(customer("+15550100001"), now, now + Duration::hours(72));
        cart.items.push(item("10", 2, 999));
        cart.coupon_code = Some("welcome10".to_string());
        cart.total = Decimal::new(1998, 2);
        seed(&store, &cart).await;

        assert_eq!(store.find(&cart.id).await.expect("find"), Some(cart.clone()));
        assert_eq!(
            store.find_active_by_customer(&cart.customer_key).await.expect("find active"),
            Some(cart)
        );
    }

    #[tokio::test]
    async fn find_or_create_reuses_the_active_cart() {
        let (store, _) = setup().await;
        let key = customer("+15550100001");
        let now = now();

        let mut tx = store.begin().await.expect("begin");
        let first = store
            .find_or_create_for_update(&mut tx, &key, now, now + Duration::hours(72))
            .await
            .expect("create");
        let second = store
            .find_or_create_for_update(&mut tx, &key, now, now + Duration::hours(72))
            .await
            .expect("reuse");
        tx.commit().await.expect("commit");

        assert_eq!(first.id, second.id);
        assert_eq!(first.status, CartStatus::Active);
    }

    #[tokio::test]
    async fn find_or_create_returns_the_stored_row() {
        let (store, _) = setup().await;
        let key = customer("+15550100002");
        // Sub-microsecond precision does not survive the write.
        let now = Utc::now();

        let mut tx = store.begin().await.expect("begin");
        let created = store
            .find_or_create_for_update(&mut tx, &key, now, now + Duration::hours(72))
            .await
            .expect("create");
        tx.commit().await.expect("commit");

        let stored = store.find(&created.id).await.expect("find").expect("exists");
        assert_eq!(created, stored);
    }

    #[tokio::test]
    async fn find_or_create_replaces_an_expired_cart() {
        let (store, _) = setup().await;
        let key = customer("+15550100001");
        let now = now();
        let stale = Cart::new(key.clone(), now - Duration::hours(80), now - Duration::hours(8));
        seed(&store, &stale).await;

        let mut tx = store.begin().await.expect("begin");
        let fresh = store
            .find_or_create_for_update(&mut tx, &key, now, now + Duration::hours(72))
            .await
            .expect("create");
        tx.commit().await.expect("commit");

        assert_ne!(fresh.id, stale.id);
        let old = store.find(&stale.id).await.expect("find").expect("exists");
        assert_eq!(old.status, CartStatus::Expired);
    }

    #[tokio::test]
    async fn find_or_create_times_out_while_customer_lock_is_held() {
        let (store, locks) = setup().await;
        let key = customer("+15550100001");
        let _held = locks
            .acquire(&LockKey::for_customer(&key), StdDuration::from_secs(1))
            .await
            .expect("hold lock");

        let now = now();
        let mut tx = store.begin().await.expect("begin");
        let error = store
            .find_or_create_for_update(&mut tx, &key, now, now + Duration::hours(72))
            .await
            .expect_err("lock is held elsewhere");

        assert!(matches!(error, RepositoryError::Lock(_)));
        assert!(error.is_contention());
    }

    #[tokio::test]
    async fn update_locked_persists_and_rejects_unknown_carts() {
        let (store, _) = setup().await;
        let now = now();
        let mut cart = Cart::new(customer("+15550100001"), now, now + Duration::hours(72));
        seed(&store, &cart).await;

        let mut tx = store.begin().await.expect("begin");
        let mut locked =
            store.find_for_update(&mut tx, &cart.id).await.expect("lock").expect("exists");
        locked.items.push(item("10", 1, 500));
        locked.total = Decimal::new(500, 2);
        store.update_locked(&mut tx, &locked).await.expect("update");
        tx.commit().await.expect("commit");

        let stored = store.find(&cart.id).await.expect("find").expect("exists");
        assert_eq!(stored.items.len(), 1);
        assert_eq!(stored.total.to_string(), "5.00");

        cart.id = chatcart_core::domain::cart::CartId::generate();
        let mut tx = store.begin().await.expect("begin");
        let error = store.update_locked(&mut tx, &cart).await.expect_err("missing cart");
        assert!(matches!(error, RepositoryError::CartNotFound(_)));
    }

    #[tokio::test]
    async fn mark_recovered_is_idempotent() {
        let (store, _) = setup().await;
        let now = now();
        let mut cart = Cart::new(customer("+15550100001"), now, now + Duration::hours(72));
        cart.total = Decimal::new(4250, 2);
        cart.mark_abandoned(now).expect("abandon");
        seed(&store, &cart).await;

        let mut tx = store.begin().await.expect("begin");
        let recovered = store
            .mark_recovered(&mut tx, &cart.id, "order-1", now)
            .await
            .expect("recover")
            .expect("first call recovers");
        let again = store.mark_recovered(&mut tx, &cart.id, "order-2", now).await.expect("again");
        tx.commit().await.expect("commit");

        assert!(again.is_none());
        assert_eq!(recovered.status, CartStatus::Converted);
        assert_eq!(recovered.recovered_revenue, Some(Decimal::new(4250, 2)));
        let stored = store.find(&cart.id).await.expect("find").expect("exists");
        assert_eq!(stored.recovered_order_id.as_deref(), Some("order-1"));
    }

    #[tokio::test]
    async fn scheduler_queries_and_reminder_stages() {
        let (store, _) = setup().await;
        let now = now();

        let created = now - Duration::hours(3);
        let mut idle = Cart::new(customer("+15550100001"), created, now + Duration::hours(69));
        idle.items.push(item("10", 1, 500));
        seed(&store, &idle).await;

        let empty = Cart::new(customer("+15550100002"), created, now + Duration::hours(69));
        seed(&store, &empty).await;

        let mut recent = Cart::new(customer("+15550100003"), now, now + Duration::hours(72));
        recent.items.push(item("10", 1, 500));
        seed(&store, &recent).await;

        let mut abandoned = Cart::new(
            customer("+15550100004"),
            now - Duration::hours(5),
            now + Duration::hours(67),
        );
        abandoned.items.push(item("10", 1, 500));
        abandoned.mark_abandoned(now - Duration::hours(4)).expect("abandon");
        seed(&store, &abandoned).await;

        let found = store.find_abandoned(now - Duration::hours(1), 10).await.expect("find");
        let ids: Vec<_> = found.iter().map(|cart| cart.id.clone()).collect();
        assert_eq!(ids, vec![abandoned.id.clone(), idle.id.clone()]);

        assert!(store.mark_reminder_sent(&abandoned.id, 2, now).await.expect("stage 2"));
        assert!(!store.mark_reminder_sent(&abandoned.id, 1, now).await.expect("stage 1 is older"));
        let last = store.mark_reminder_sent(&abandoned.id, MAX_REMINDER_STAGE, now).await;
        assert!(last.expect("last"));

        let stored = store.find(&abandoned.id).await.expect("find").expect("exists");
        assert_eq!(stored.reminder_stage, MAX_REMINDER_STAGE);
        assert_eq!(stored.last_reminder_at, Some(now));

        let found = store.find_abandoned(now - Duration::hours(1), 10).await.expect("find");
        assert_eq!(found.len(), 1, "finished reminder sequences drop out");
    }

    #[tokio::test]
    async fn expire_stale_flips_in_batches() {
        let (store, _) = setup().await;
        let now = now();
        for n in 0..3 {
            let cart = Cart::new(
                customer(&format!("+1555010000{n}")),
                now - Duration::hours(80),
                now - Duration::hours(8 - n),
            );
            seed(&store, &cart).await;
        }
        let live = Cart::new(customer("+15550100009"), now, now + Duration::hours(72));
        seed(&store, &live).await;

        assert_eq!(store.find_expired(now, 10).await.expect("find").len(), 3);
        assert_eq!(store.expire_stale(now, 2).await.expect("first batch"), 2);
        assert_eq!(store.expire_stale(now, 2).await.expect("second batch"), 1);
        assert_eq!(store.expire_stale(now, 2).await.expect("nothing left"), 0);

        let live = store.find(&live.id).await.expect("find").expect("exists");
        assert_eq!(live.status, CartStatus::Active);
    }
}
