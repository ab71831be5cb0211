//! Transactional cart operations.
//!
//! Each mutation runs in exactly one SQL transaction. The cart row is taken with a
//! locked read before it is changed, and the transaction is rolled back on every
//! error path before the error reaches the caller.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::SqliteConnection;
use tracing::{debug, info, warn};

use chatcart_core::commerce::catalog::{
    CouponCatalog, CouponUsageLedger, CustomerResolver, ProductCatalog, ReminderSink,
};
use chatcart_core::commerce::coupons::{CouponCartLine, CouponContext, CouponValidator};
use chatcart_core::commerce::pricing::{
    self, CartTotals, DeterministicPricingEngine, PricingEngine, PricingInput, PricingPolicy,
};
use chatcart_core::config::AppConfig;
use chatcart_core::domain::cart::{Cart, CartItem, CartStatus, CustomerKey};
use chatcart_core::domain::coupon::Coupon;
use chatcart_core::domain::product::{ProductId, ProductSnapshot, VariationId};
use chatcart_core::errors::{CartError, DomainError, ValidationError};
use chatcart_core::lock::{LockManager, DEFAULT_LOCK_TIMEOUT};

use crate::repositories::cart::{CartStore, DbTransaction, SqlCartStore};
use crate::repositories::{RepositoryError, SqlCouponUsageRepository, TransactionUsageLedger};
use crate::DbPool;

/// Largest quantity accepted for a single line.
pub const MAX_LINE_QUANTITY: u32 = 9_999;

#[derive(Clone, Debug)]
pub struct CartSettings {
    pub ttl: Duration,
    pub lock_timeout: std::time::Duration,
    pub cleanup_batch_size: u32,
    pub abandon_after: Duration,
    pub pricing: PricingPolicy,
}

impl Default for CartSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::hours(72),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            cleanup_batch_size: 500,
            abandon_after: Duration::minutes(60),
            pricing: PricingPolicy::default(),
        }
    }
}

impl From<&AppConfig> for CartSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            ttl: config.cart.ttl(),
            lock_timeout: config.cart.lock_timeout(),
            cleanup_batch_size: config.cart.cleanup_batch_size,
            abandon_after: config.cart.abandon_after(),
            pricing: config.pricing.policy(),
        }
    }
}

/// External systems the cart engine reads from or notifies.
#[derive(Clone)]
pub struct CartCollaborators {
    pub products: Arc<dyn ProductCatalog>,
    pub coupons: Arc<dyn CouponCatalog>,
    pub customers: Arc<dyn CustomerResolver>,
    pub reminders: Arc<dyn ReminderSink>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CartIssue {
    ProductUnavailable { index: usize, product_id: String },
    OutOfStock { index: usize, product_id: String },
    InsufficientStock { index: usize, product_id: String, requested: u32, available: u32 },
    PriceChanged {
        index: usize,
        product_id: String,
        price_at_add: Decimal,
        current_price: Decimal,
    },
}

impl CartIssue {
    /// Price drift is informational; the captured price still applies.
    pub fn is_blocking(&self) -> bool {
        !matches!(self, Self::PriceChanged { .. })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CartValidity {
    pub is_valid: bool,
    pub issues: Vec<CartIssue>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedCart {
    pub cart: Cart,
    /// The cart had been abandoned and is now booked as recovered revenue.
    pub recovered: bool,
    /// The order was already recorded by an earlier call.
    pub replayed: bool,
}

pub struct CartService {
    store: SqlCartStore,
    pricing: Arc<dyn PricingEngine>,
    validator: CouponValidator,
    ledger: SqlCouponUsageRepository,
    collaborators: CartCollaborators,
    settings: CartSettings,
}

impl CartService {
    pub fn new(
        pool: DbPool,
        locks: Arc<dyn LockManager>,
        collaborators: CartCollaborators,
        settings: CartSettings,
    ) -> Self {
        let store = SqlCartStore::new(pool.clone(), locks).with_lock_timeout(settings.lock_timeout);
        let ledger = SqlCouponUsageRepository::new(pool);
        let validator =
            CouponValidator::new(collaborators.coupons.clone(), collaborators.customers.clone());
        let pricing = Arc::new(DeterministicPricingEngine::new(settings.pricing.clone()));

        Self { store, pricing, validator, ledger, collaborators, settings }
    }

    pub fn with_pricing_engine(mut self, pricing: Arc<dyn PricingEngine>) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn store(&self) -> &SqlCartStore {
        &self.store
    }

    pub fn settings(&self) -> &CartSettings {
        &self.settings
    }

    /// Returns the customer's ACTIVE cart, creating an empty one when none exists.
    pub async fn get_cart(&self, customer_key: &str) -> Result<Cart, CartError> {
        let key = CustomerKey::parse(customer_key)?;
        let now = Utc::now();

        if let Some(cart) = self.store.find_active_by_customer(&key).await? {
            if !cart.is_expired_at(now) {
                return Ok(cart);
            }
        }

        let mut tx = self.store.begin().await?;
        let outcome = self
            .store
            .find_or_create_for_update(&mut tx, &key, now, now + self.settings.ttl)
            .await
            .map_err(CartError::from);
        self.finish(tx, "get_cart", &key, outcome).await
    }

    pub async fn add_item(
        &self,
        customer_key: &str,
        product_id: &ProductId,
        variation_id: Option<&VariationId>,
        quantity: i64,
    ) -> Result<Cart, CartError> {
        let key = CustomerKey::parse(customer_key)?;
        let quantity = validate_quantity(quantity)?;

        // Advisory only; stock is checked again under the lock.
        let product = self.require_product(product_id, variation_id).await?;
        product.ensure_available(quantity)?;

        let mut tx = self.store.begin().await?;
        let outcome = self.add_item_in(&mut tx, &key, product_id, variation_id, quantity).await;
        let cart = self.finish(tx, "add_item", &key, outcome).await?;

        info!(
            event_name = "cart.item.added",
            cart_id = %cart.id,
            customer_key = %key,
            product_id = %product_id,
            quantity,
            total = %cart.total,
            "item added to cart"
        );
        self.notify_activity(&key).await;
        Ok(cart)
    }

    async fn add_item_in(
        &self,
        conn: &mut SqliteConnection,
        key: &CustomerKey,
        product_id: &ProductId,
        variation_id: Option<&VariationId>,
        quantity: u32,
    ) -> Result<Cart, CartError> {
        let now = Utc::now();
        let mut cart =
            self.store.find_or_create_for_update(conn, key, now, now + self.settings.ttl).await?;

        let product = self.require_product(product_id, variation_id).await?;
        let requested = cart.quantity_of(product_id, variation_id).saturating_add(quantity);
        if requested > MAX_LINE_QUANTITY {
            return Err(ValidationError::QuantityTooLarge { quantity: i64::from(requested) }.into());
        }
        product.ensure_available(requested)?;

        cart.merge_item(CartItem::from_snapshot(&product, quantity));
        self.save_mutation(conn, &mut cart, now).await?;
        Ok(cart)
    }

    /// Sets the quantity of the line at `index`; zero or less removes the line.
    pub async fn update_quantity(
        &self,
        customer_key: &str,
        index: usize,
        quantity: i64,
    ) -> Result<Cart, CartError> {
        if quantity <= 0 {
            return self.remove_item(customer_key, index).await;
        }
        let key = CustomerKey::parse(customer_key)?;
        let quantity = validate_quantity(quantity)?;

        let mut tx = self.store.begin().await?;
        let outcome = self.update_quantity_in(&mut tx, &key, index, quantity).await;
        let cart = self.finish(tx, "update_quantity", &key, outcome).await?;

        info!(
            event_name = "cart.item.quantity_updated",
            cart_id = %cart.id,
            customer_key = %key,
            index,
            quantity,
            total = %cart.total,
            "cart line quantity updated"
        );
        self.notify_activity(&key).await;
        Ok(cart)
    }

    async fn update_quantity_in(
        &self,
        conn: &mut SqliteConnection,
        key: &CustomerKey,
        index: usize,
        quantity: u32,
    ) -> Result<Cart, CartError> {
        let now = Utc::now();
        let mut cart = self.locked_active_cart(conn, key, now).await?;
        let line = cart.item(index)?.clone();

        let product = self.require_product(&line.product_id, line.variation_id.as_ref()).await?;
        product.ensure_available(quantity)?;

        cart.set_quantity(index, quantity)?;
        self.save_mutation(conn, &mut cart, now).await?;
        Ok(cart)
    }

    pub async fn remove_item(&self, customer_key: &str, index: usize) -> Result<Cart, CartError> {
        let key = CustomerKey::parse(customer_key)?;

        let mut tx = self.store.begin().await?;
        let outcome = self.remove_item_in(&mut tx, &key, index).await;
        let (cart, removed) = self.finish(tx, "remove_item", &key, outcome).await?;

        info!(
            event_name = "cart.item.removed",
            cart_id = %cart.id,
            customer_key = %key,
            product_id = %removed.product_id,
            total = %cart.total,
            "item removed from cart"
        );
        self.notify_activity(&key).await;
        Ok(cart)
    }

    async fn remove_item_in(
        &self,
        conn: &mut SqliteConnection,
        key: &CustomerKey,
        index: usize,
    ) -> Result<(Cart, CartItem), CartError> {
        let now = Utc::now();
        let mut cart = self.locked_active_cart(conn, key, now).await?;
        let removed = cart.remove_item(index)?;
        self.save_mutation(conn, &mut cart, now).await?;
        Ok((cart, removed))
    }

    /// Empties the customer's cart. Returns `None` when there is no ACTIVE cart.
    ///
    /// A reset has no merge semantics, so the per-customer lock is not taken; the
    /// locked read still serializes it against in-flight mutations.
    pub async fn clear_cart(&self, customer_key: &str) -> Result<Option<Cart>, CartError> {
        let key = CustomerKey::parse(customer_key)?;

        let mut tx = self.store.begin().await?;
        let outcome = self.clear_cart_in(&mut tx, &key).await;
        let cart = self.finish(tx, "clear_cart", &key, outcome).await?;

        if let Some(cart) = &cart {
            info!(
                event_name = "cart.cleared",
                cart_id = %cart.id,
                customer_key = %key,
                "cart cleared"
            );
            self.notify_activity(&key).await;
        }
        Ok(cart)
    }

    async fn clear_cart_in(
        &self,
        conn: &mut SqliteConnection,
        key: &CustomerKey,
    ) -> Result<Option<Cart>, CartError> {
        let now = Utc::now();
        let Some(mut cart) = self.store.find_active_by_customer_for_update(conn, key).await? else {
            return Ok(None);
        };
        if cart.is_expired_at(now) {
            return Err(DomainError::CartExpired { cart_id: cart.id.0 }.into());
        }

        cart.clear();
        self.save_mutation(conn, &mut cart, now).await?;
        Ok(Some(cart))
    }

    /// Validates `code` against the current cart and stores it. The discount itself is
    /// not frozen; totals re-validate the coupon each time they are computed.
    pub async fn apply_coupon(&self, customer_key: &str, code: &str) -> Result<Cart, CartError> {
        let key = CustomerKey::parse(customer_key)?;
        if code.trim().is_empty() {
            return Err(ValidationError::EmptyCouponCode.into());
        }

        let mut tx = self.store.begin().await?;
        let outcome = self.apply_coupon_in(&mut tx, &key, code).await;
        let cart = self.finish(tx, "apply_coupon", &key, outcome).await?;

        info!(
            event_name = "cart.coupon.applied",
            cart_id = %cart.id,
            customer_key = %key,
            coupon_code = cart.coupon_code.as_deref().unwrap_or_default(),
            total = %cart.total,
            "coupon applied to cart"
        );
        self.notify_activity(&key).await;
        Ok(cart)
    }

    async fn apply_coupon_in(
        &self,
        conn: &mut SqliteConnection,
        key: &CustomerKey,
        code: &str,
    ) -> Result<Cart, CartError> {
        let now = Utc::now();
        let mut cart = self.locked_active_cart(conn, key, now).await?;

        let resolved = self.resolve_lines(&cart.items).await?;
        let unresolved = unresolved_lines(&resolved);
        let lines = coupon_lines(&cart.items, &resolved);
        let ledger = TransactionUsageLedger::new(&mut *conn);
        let context = CouponContext {
            customer_key: key,
            subtotal: pricing::subtotal(&cart.items, &unresolved),
            lines: &lines,
            ledger: &ledger,
        };
        let validated = self.validator.validate(code, context, now).await?;
        drop(ledger);

        cart.coupon_code = Some(Coupon::normalize_code(&validated.coupon.code));
        self.save_mutation(conn, &mut cart, now).await?;
        Ok(cart)
    }

    pub async fn remove_coupon(&self, customer_key: &str) -> Result<Cart, CartError> {
        let key = CustomerKey::parse(customer_key)?;

        let mut tx = self.store.begin().await?;
        let outcome = self.remove_coupon_in(&mut tx, &key).await;
        let cart = self.finish(tx, "remove_coupon", &key, outcome).await?;

        info!(
            event_name = "cart.coupon.removed",
            cart_id = %cart.id,
            customer_key = %key,
            total = %cart.total,
            "coupon removed from cart"
        );
        self.notify_activity(&key).await;
        Ok(cart)
    }

    async fn remove_coupon_in(
        &self,
        conn: &mut SqliteConnection,
        key: &CustomerKey,
    ) -> Result<Cart, CartError> {
        let now = Utc::now();
        let mut cart = self.locked_active_cart(conn, key, now).await?;
        cart.coupon_code = None;
        self.save_mutation(conn, &mut cart, now).await?;
        Ok(cart)
    }

    /// Prices `cart` from its captured item prices and its stored coupon, if that
    /// coupon still validates. Lines whose product no longer resolves are skipped.
    pub async fn calculate_totals(&self, cart: &Cart) -> Result<CartTotals, CartError> {
        self.price(cart, &self.ledger, Utc::now()).await
    }

    /// Reports lines that can no longer be fulfilled as stored. Never mutates the cart.
    pub async fn check_cart_validity(&self, customer_key: &str) -> Result<CartValidity, CartError> {
        let key = CustomerKey::parse(customer_key)?;
        let Some(cart) = self.store.find_active_by_customer(&key).await? else {
            return Ok(CartValidity { is_valid: true, issues: Vec::new() });
        };

        let resolved = self.resolve_lines(&cart.items).await?;
        let mut issues = Vec::new();
        for (index, (item, product)) in cart.items.iter().zip(&resolved).enumerate() {
            let product_id = match &item.variation_id {
                Some(variation) => format!("{}:{}", item.product_id, variation),
                None => item.product_id.0.clone(),
            };
            let Some(product) = product else {
                issues.push(CartIssue::ProductUnavailable { index, product_id });
                continue;
            };

            match product.ensure_available(item.quantity) {
                Err(DomainError::OutOfStock { .. }) => {
                    issues.push(CartIssue::OutOfStock { index, product_id: product_id.clone() });
                }
                Err(DomainError::InsufficientStock { requested, available, .. }) => {
                    issues.push(CartIssue::InsufficientStock {
                        index,
                        product_id: product_id.clone(),
                        requested,
                        available,
                    });
                }
                _ => {}
            }
            if product.price != item.price_at_add {
                issues.push(CartIssue::PriceChanged {
                    index,
                    product_id,
                    price_at_add: item.price_at_add,
                    current_price: product.price,
                });
            }
        }

        let is_valid = !issues.iter().any(CartIssue::is_blocking);
        debug!(
            event_name = "cart.validity.checked",
            cart_id = %cart.id,
            customer_key = %key,
            is_valid,
            issue_count = issues.len(),
            "cart validity checked"
        );
        Ok(CartValidity { is_valid, issues })
    }

    /// Converts the customer's open cart for `order_id`. Abandoned carts are booked as
    /// recovered. Calling again with the same order id returns the converted cart.
    pub async fn mark_completed(
        &self,
        customer_key: &str,
        order_id: &str,
    ) -> Result<CompletedCart, CartError> {
        let key = CustomerKey::parse(customer_key)?;
        let order_id = order_id.trim();
        if order_id.is_empty() {
            return Err(ValidationError::EmptyOrderId.into());
        }

        let mut tx = self.store.begin().await?;
        let outcome = self.mark_completed_in(&mut tx, &key, order_id).await;
        let completed = self.finish(tx, "mark_completed", &key, outcome).await?;

        if !completed.replayed {
            info!(
                event_name = "cart.converted",
                cart_id = %completed.cart.id,
                customer_key = %key,
                order_id,
                recovered = completed.recovered,
                total = %completed.cart.total,
                "cart converted"
            );
            self.notify_activity(&key).await;
        }
        Ok(completed)
    }

    async fn mark_completed_in(
        &self,
        conn: &mut SqliteConnection,
        key: &CustomerKey,
        order_id: &str,
    ) -> Result<CompletedCart, CartError> {
        let now = Utc::now();
        let Some(mut cart) = self.store.find_latest_open_for_update(conn, key).await? else {
            return match self.store.find_converted_for_order(conn, key, order_id).await? {
                Some(cart) => Ok(CompletedCart { recovered: cart.recovered, cart, replayed: true }),
                None => Err(ValidationError::NoActiveCart { customer_key: key.0.clone() }.into()),
            };
        };
        if cart.status == CartStatus::Active && cart.is_expired_at(now) {
            return Err(DomainError::CartExpired { cart_id: cart.id.0 }.into());
        }
        self.settle_coupon(conn, &mut cart, now).await?;

        let recovered = if cart.status == CartStatus::Abandoned {
            match self.store.mark_recovered(conn, &cart.id, order_id, now).await? {
                Some(recovered) => {
                    cart = recovered;
                    true
                }
                None => self.convert_in_place(conn, &mut cart, order_id, now).await?,
            }
        } else {
            self.convert_in_place(conn, &mut cart, order_id, now).await?
        };

        if let Some(code) = cart.coupon_code.clone() {
            self.record_coupon_usage(conn, key, &code, order_id, now).await?;
        }
        Ok(CompletedCart { cart, recovered, replayed: false })
    }

    /// Drops a stored coupon that no longer validates, so usage is only booked for
    /// redemptions that pass every limit at conversion time.
    async fn settle_coupon(
        &self,
        conn: &mut SqliteConnection,
        cart: &mut Cart,
        now: DateTime<Utc>,
    ) -> Result<(), CartError> {
        if cart.coupon_code.is_none() {
            return Ok(());
        }
        let totals = self.price(cart, &TransactionUsageLedger::new(&mut *conn), now).await?;
        let Some(rejection) = totals.coupon_issue else {
            return Ok(());
        };

        warn!(
            event_name = "cart.coupon.dropped_at_checkout",
            cart_id = %cart.id,
            customer_key = %cart.customer_key,
            coupon_code = cart.coupon_code.as_deref().unwrap_or_default(),
            reason = %rejection,
            "stored coupon no longer validates; converting without it"
        );
        cart.coupon_code = None;
        cart.total = totals.total;
        self.store.update_locked(conn, cart).await?;
        Ok(())
    }

    async fn convert_in_place(
        &self,
        conn: &mut SqliteConnection,
        cart: &mut Cart,
        order_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, CartError> {
        let recovered = cart.mark_converted(order_id, now)?;
        self.store.update_locked(conn, cart).await?;
        Ok(recovered)
    }

    async fn record_coupon_usage(
        &self,
        conn: &mut SqliteConnection,
        key: &CustomerKey,
        code: &str,
        order_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), CartError> {
        let Some(coupon) = self.collaborators.coupons.find_by_code(code).await? else {
            warn!(
                event_name = "cart.coupon.usage_unrecorded",
                customer_key = %key,
                coupon_code = code,
                order_id,
                "coupon on converted cart no longer exists; usage not recorded"
            );
            return Ok(());
        };

        let recorded =
            SqlCouponUsageRepository::record_usage_in(conn, &coupon.id, key, order_id, now).await?;
        debug!(
            event_name = "cart.coupon.usage_recorded",
            customer_key = %key,
            coupon_id = %coupon.id,
            order_id,
            recorded,
            "coupon usage recorded"
        );
        Ok(())
    }

    /// Scheduler hook: moves the customer's ACTIVE cart to ABANDONED.
    pub async fn mark_abandoned(&self, customer_key: &str) -> Result<Cart, CartError> {
        let key = CustomerKey::parse(customer_key)?;

        let mut tx = self.store.begin().await?;
        let outcome = self.mark_abandoned_in(&mut tx, &key).await;
        let cart = self.finish(tx, "mark_abandoned", &key, outcome).await?;

        info!(
            event_name = "cart.abandoned",
            cart_id = %cart.id,
            customer_key = %key,
            "cart abandoned"
        );
        Ok(cart)
    }

    async fn mark_abandoned_in(
        &self,
        conn: &mut SqliteConnection,
        key: &CustomerKey,
    ) -> Result<Cart, CartError> {
        let now = Utc::now();
        let mut cart = self.locked_active_cart(conn, key, now).await?;
        cart.mark_abandoned(now)?;
        self.store.update_locked(conn, &cart).await?;
        Ok(cart)
    }

    /// Carts idle longer than the configured abandonment window, for the reminder scheduler.
    pub async fn abandoned_candidates(&self, limit: u32) -> Result<Vec<Cart>, CartError> {
        let inactive_since = Utc::now() - self.settings.abandon_after;
        Ok(self.store.find_abandoned(inactive_since, limit).await?)
    }

    /// Expires every ACTIVE cart past its expiry, in batches. Returns the number expired.
    pub async fn cleanup_expired_carts(&self) -> Result<u64, CartError> {
        let batch_size = self.settings.cleanup_batch_size.max(1);
        let now = Utc::now();
        let mut expired = 0_u64;

        loop {
            let flipped = self.store.expire_stale(now, batch_size).await?;
            expired += flipped;
            if flipped < u64::from(batch_size) {
                break;
            }
        }

        info!(event_name = "cart.sweep.expired", expired, batch_size, "expired carts swept");
        Ok(expired)
    }

    async fn locked_active_cart(
        &self,
        conn: &mut SqliteConnection,
        key: &CustomerKey,
        now: DateTime<Utc>,
    ) -> Result<Cart, CartError> {
        let cart = self
            .store
            .find_active_by_customer_for_update(conn, key)
            .await?
            .ok_or_else(|| ValidationError::NoActiveCart { customer_key: key.0.clone() })?;

        if cart.is_expired_at(now) {
            return Err(DomainError::CartExpired { cart_id: cart.id.0 }.into());
        }
        Ok(cart)
    }

    async fn save_mutation(
        &self,
        conn: &mut SqliteConnection,
        cart: &mut Cart,
        now: DateTime<Utc>,
    ) -> Result<(), CartError> {
        cart.total = self.price(cart, &TransactionUsageLedger::new(&mut *conn), now).await?.total;
        cart.touch(now, now + self.settings.ttl);
        self.store.update_locked(conn, cart).await?;
        Ok(())
    }

    async fn price(
        &self,
        cart: &Cart,
        ledger: &dyn CouponUsageLedger,
        now: DateTime<Utc>,
    ) -> Result<CartTotals, CartError> {
        let resolved = self.resolve_lines(&cart.items).await?;
        let unresolved = unresolved_lines(&resolved);
        let subtotal = pricing::subtotal(&cart.items, &unresolved);

        let mut coupon = None;
        let mut coupon_issue = None;
        if let Some(code) = &cart.coupon_code {
            let lines = coupon_lines(&cart.items, &resolved);
            let context =
                CouponContext { customer_key: &cart.customer_key, subtotal, lines: &lines, ledger };
            match self.validator.validate(code, context, now).await {
                Ok(validated) => coupon = Some(validated.coupon),
                Err(CartError::Domain(DomainError::Coupon(rejection))) => {
                    debug!(
                        event_name = "cart.coupon.lapsed",
                        cart_id = %cart.id,
                        coupon_code = code.as_str(),
                        reason = %rejection,
                        "stored coupon no longer applies"
                    );
                    coupon_issue = Some(rejection);
                }
                Err(error) => return Err(error),
            }
        }

        let result = self.pricing.price(PricingInput {
            items: &cart.items,
            unresolved_lines: &unresolved,
            coupon: coupon.as_ref(),
        });

        Ok(CartTotals {
            subtotal: result.subtotal,
            discount: result.discount_total,
            tax: result.tax_total,
            shipping: result.shipping_total,
            total: result.total,
            coupon_code: cart.coupon_code.clone(),
            coupon_issue,
            skipped_lines: unresolved,
        })
    }

    async fn require_product(
        &self,
        product_id: &ProductId,
        variation_id: Option<&VariationId>,
    ) -> Result<ProductSnapshot, CartError> {
        self.collaborators.products.lookup(product_id, variation_id).await?.ok_or_else(|| {
            let product_id = match variation_id {
                Some(variation) => format!("{product_id}:{variation}"),
                None => product_id.0.clone(),
            };
            ValidationError::ProductNotFound { product_id }.into()
        })
    }

    async fn resolve_lines(
        &self,
        items: &[CartItem],
    ) -> Result<Vec<Option<ProductSnapshot>>, CartError> {
        let mut resolved = Vec::with_capacity(items.len());
        for item in items {
            resolved.push(
                self.collaborators
                    .products
                    .lookup(&item.product_id, item.variation_id.as_ref())
                    .await?,
            );
        }
        Ok(resolved)
    }

    async fn finish<T>(
        &self,
        tx: DbTransaction,
        operation: &'static str,
        key: &CustomerKey,
        outcome: Result<T, CartError>,
    ) -> Result<T, CartError> {
        match outcome {
            Ok(value) => {
                tx.commit().await.map_err(RepositoryError::from)?;
                Ok(value)
            }
            Err(error) => {
                if let Err(rollback_error) = tx.rollback().await {
                    warn!(
                        event_name = "cart.transaction.rollback_failed",
                        operation,
                        customer_key = %key,
                        error = %rollback_error,
                        "transaction rollback failed"
                    );
                }
                if error.is_expected() {
                    debug!(
                        event_name = "cart.operation.rejected",
                        operation,
                        customer_key = %key,
                        error = %error,
                        "cart operation rejected"
                    );
                } else {
                    warn!(
                        event_name = "cart.operation.failed",
                        operation,
                        customer_key = %key,
                        retryable = error.is_retryable(),
                        error = %error,
                        "cart operation failed"
                    );
                }
                Err(error)
            }
        }
    }

    // The mutation is already committed; a sink failure must not undo it.
    async fn notify_activity(&self, key: &CustomerKey) {
        if let Err(error) = self.collaborators.reminders.halt_reminders(key).await {
            warn!(
                event_name = "cart.reminders.halt_failed",
                customer_key = %key,
                error = %error,
                "could not halt abandoned-cart reminders"
            );
        }
    }
}

fn validate_quantity(quantity: i64) -> Result<u32, ValidationError> {
    if quantity <= 0 {
        return Err(ValidationError::NonPositiveQuantity { quantity });
    }
    u32::try_from(quantity)
        .ok()
        .filter(|quantity| *quantity <= MAX_LINE_QUANTITY)
        .ok_or(ValidationError::QuantityTooLarge { quantity })
}

fn unresolved_lines(resolved: &[Option<ProductSnapshot>]) -> Vec<usize> {
    resolved
        .iter()
        .enumerate()
        .filter_map(|(index, product)| product.is_none().then_some(index))
        .collect()
}

fn coupon_lines(items: &[CartItem], resolved: &[Option<ProductSnapshot>]) -> Vec<CouponCartLine> {
    items
        .iter()
        .zip(resolved)
        .filter_map(|(item, product)| {
            product
                .as_ref()
                .map(|product| CouponCartLine::from_item(item, product.category_ids.clone()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use chrono::{Duration, Utc};
    use rust_decimal::Decimal;
    use tempfile::TempDir;

    use chatcart_core::commerce::memory::{
        InMemoryCouponCatalog, InMemoryCustomerResolver, InMemoryProductCatalog,
        RecordingReminderSink,
    };
    use chatcart_core::commerce::pricing::{PricingPolicy, ShippingKind, ShippingMethod};
    use chatcart_core::domain::cart::{Cart, CartItem, CartStatus, CustomerKey};
    use chatcart_core::domain::coupon::{Coupon, CouponId, CouponStatus, DiscountKind};
    use chatcart_core::domain::product::{ProductId, ProductSnapshot};
    use chatcart_core::errors::{CartError, CouponRejection, DomainError, ValidationError};
    use chatcart_core::lock::InProcessLockManager;

    use super::{CartCollaborators, CartIssue, CartService, CartSettings};
    use crate::repositories::cart::CartStore;
    use crate::repositories::SqlCouponUsageRepository;
    use crate::{connect_with_settings, migrations};

    const PHONE: &str = "+1 (555) 010-0001";

    struct Harness {
        _dir: TempDir,
        products: Arc<InMemoryProductCatalog>,
        coupons: Arc<InMemoryCouponCatalog>,
        reminders: Arc<RecordingReminderSink>,
        service: CartService,
    }

    async fn harness_with(settings: CartSettings) -> Harness {
        harness_pooled(4, settings).await
    }

    async fn harness_pooled(max_connections: u32, settings: CartSettings) -> Harness {
        let dir = TempDir::new().expect("temp dir");
        let url = format!("sqlite://{}", dir.path().join("carts.db").display());
        let pool = connect_with_settings(&url, max_connections, 2).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");

        let products = Arc::new(InMemoryProductCatalog::default());
        let coupons = Arc::new(InMemoryCouponCatalog::default());
        let reminders = Arc::new(RecordingReminderSink::default());
        let collaborators = CartCollaborators {
            products: products.clone(),
            coupons: coupons.clone(),
            customers: Arc::new(InMemoryCustomerResolver::default()),
            reminders: reminders.clone(),
        };
        let service =
            CartService::new(pool, Arc::new(InProcessLockManager::new()), collaborators, settings);

        Harness { _dir: dir, products, coupons, reminders, service }
    }

    async fn harness() -> Harness {
        harness_with(CartSettings::default()).await
    }

    fn product(id: &str, cents: i64, stock: Option<u32>) -> ProductSnapshot {
        ProductSnapshot {
            product_id: ProductId(id.to_string()),
            variation_id: None,
            name: format!("Product {id}"),
            price: Decimal::new(cents, 2),
            in_stock: true,
            stock_quantity: stock,
            category_ids: vec!["general".to_string()],
            variant_attributes: BTreeMap::new(),
        }
    }

    fn coupon(code: &str, kind: DiscountKind, amount: Decimal) -> Coupon {
        Coupon {
            id: CouponId(format!("coupon-{code}")),
            code: code.to_string(),
            status: CouponStatus::Active,
            kind,
            amount,
            expires_at: None,
            usage_count: 0,
            usage_limit: None,
            usage_limit_per_user: None,
            used_by: vec![],
            minimum_amount: None,
            maximum_amount: None,
            product_ids: vec![],
            excluded_product_ids: vec![],
            category_ids: vec![],
            excluded_category_ids: vec![],
        }
    }

    fn pid(id: &str) -> ProductId {
        ProductId(id.to_string())
    }

    #[tokio::test]
    async fn get_cart_creates_once_and_is_idempotent() {
        let h = harness().await;

        let first = h.service.get_cart(PHONE).await.expect("create");
        let second = h.service.get_cart("+15550100001").await.expect("read");

        assert_eq!(first.id, second.id);
        assert_eq!(first.items, second.items);
        assert_eq!(first.status, CartStatus::Active);
        assert!(first.expires_at > Utc::now() + Duration::hours(71));
    }

    #[tokio::test]
    async fn add_item_validates_before_touching_the_cart() {
        let h = harness().await;

        let error = h.service.add_item(PHONE, &pid("10"), None, 0).await.expect_err("zero");
        assert_eq!(
            error,
            CartError::Validation(ValidationError::NonPositiveQuantity { quantity: 0 })
        );

        let error = h.service.add_item(PHONE, &pid("404"), None, 1).await.expect_err("unknown");
        assert!(matches!(error, CartError::Validation(ValidationError::ProductNotFound { .. })));

        let error = h.service.add_item("  ", &pid("10"), None, 1).await.expect_err("no customer");
        assert_eq!(error, CartError::Validation(ValidationError::EmptyCustomerKey));

        let key = CustomerKey::parse(PHONE).expect("key");
        assert!(h.service.store().find_active_by_customer(&key).await.expect("find").is_none());
        assert!(h.reminders.halted().await.is_empty());
    }

    #[tokio::test]
    async fn worked_example_add_merge_remove() {
        let h = harness().await;
        h.products.save(product("10", 999, Some(10))).await;

        let cart = h.service.add_item(PHONE, &pid("10"), None, 2).await.expect("add 2");
        assert_eq!(cart.total, Decimal::new(1998, 2));

        let cart = h.service.add_item(PHONE, &pid("10"), None, 1).await.expect("add 1");
        assert_eq!(cart.items.len(), 1);
        assert_eq!(cart.items[0].quantity, 3);
        assert_eq!(cart.total, Decimal::new(2997, 2));

        let cart = h.service.remove_item(PHONE, 0).await.expect("remove");
        assert!(cart.is_empty());
        assert_eq!(cart.total.to_string(), "0.00");

        assert_eq!(h.reminders.halted().await.len(), 3);
    }

    #[tokio::test]
    async fn stock_is_enforced_against_the_merged_quantity() {
        let h = harness().await;
        h.products.save(product("10", 500, Some(3))).await;

        h.service.add_item(PHONE, &pid("10"), None, 2).await.expect("within stock");
        let error = h.service.add_item(PHONE, &pid("10"), None, 2).await.expect_err("over stock");
        assert!(matches!(
            error,
            CartError::Domain(DomainError::InsufficientStock { requested: 4, available: 3, .. })
        ));

        let cart = h.service.get_cart(PHONE).await.expect("cart");
        assert_eq!(cart.items[0].quantity, 2, "failed add must not leave partial writes");
    }

    #[tokio::test]
    async fn update_quantity_checks_live_stock_and_zero_removes() {
        let h = harness().await;
        h.products.save(product("10", 500, Some(5))).await;
        h.products.save(product("20", 250, None)).await;
        h.service.add_item(PHONE, &pid("10"), None, 1).await.expect("add");
        h.service.add_item(PHONE, &pid("20"), None, 1).await.expect("add");

        let cart = h.service.update_quantity(PHONE, 0, 4).await.expect("update");
        assert_eq!(cart.items[0].quantity, 4);
        assert_eq!(cart.total, Decimal::new(2250, 2));

        let error = h.service.update_quantity(PHONE, 0, 6).await.expect_err("over stock");
        assert!(matches!(error, CartError::Domain(DomainError::InsufficientStock { .. })));

        let error = h.service.update_quantity(PHONE, 7, 1).await.expect_err("bad index");
        assert!(matches!(error, CartError::Validation(ValidationError::UnknownItemIndex { .. })));

        let cart = h.service.update_quantity(PHONE, 0, 0).await.expect("remove via zero");
        assert_eq!(cart.items.len(), 1);
        assert_eq!(cart.items[0].product_id, pid("20"));
    }

    #[tokio::test]
    async fn captured_prices_survive_catalog_changes() {
        let h = harness().await;
        h.products.save(product("10", 1000, None)).await;
        h.service.add_item(PHONE, &pid("10"), None, 2).await.expect("add");

        h.products.set_price(&pid("10"), None, Decimal::new(1500, 2)).await;
        let cart = h.service.get_cart(PHONE).await.expect("cart");
        let totals = h.service.calculate_totals(&cart).await.expect("totals");
        assert_eq!(totals.total, Decimal::new(2000, 2));

        let validity = h.service.check_cart_validity(PHONE).await.expect("validity");
        assert!(validity.is_valid, "price drift is not blocking");
        assert!(matches!(validity.issues.as_slice(), [CartIssue::PriceChanged { .. }]));

        let cart = h.service.add_item(PHONE, &pid("10"), None, 1).await.expect("re-add");
        assert_eq!(cart.items[0].price_at_add, Decimal::new(1500, 2));
    }

    #[tokio::test]
    async fn validity_reports_missing_and_short_products() {
        let h = harness().await;
        h.products.save(product("10", 1000, Some(5))).await;
        h.products.save(product("20", 500, Some(5))).await;
        h.service.add_item(PHONE, &pid("10"), None, 4).await.expect("add");
        h.service.add_item(PHONE, &pid("20"), None, 1).await.expect("add");

        h.products.set_stock(&pid("10"), None, true, Some(2)).await;
        h.products.remove(&pid("20"), None).await;

        let validity = h.service.check_cart_validity(PHONE).await.expect("validity");
        assert!(!validity.is_valid);
        assert_eq!(validity.issues.len(), 2);
        assert!(matches!(
            validity.issues[0],
            CartIssue::InsufficientStock { index: 0, available: 2, .. }
        ));
        assert!(matches!(validity.issues[1], CartIssue::ProductUnavailable { index: 1, .. }));

        let cart = h.service.get_cart(PHONE).await.expect("cart");
        let totals = h.service.calculate_totals(&cart).await.expect("totals");
        assert_eq!(totals.skipped_lines, vec![1]);
        assert_eq!(totals.subtotal, Decimal::new(4000, 2));

        let nobody = h.service.check_cart_validity("+15559999999").await.expect("no cart");
        assert!(nobody.is_valid);
    }

    #[tokio::test]
    async fn coupons_apply_recompute_and_remove() {
        let h = harness().await;
        h.products.save(product("10", 1000, None)).await;
        h.coupons.save(coupon("TENOFF", DiscountKind::Percent, Decimal::from(10))).await;
        h.service.add_item(PHONE, &pid("10"), None, 3).await.expect("add");

        let cart = h.service.apply_coupon(PHONE, " TenOff ").await.expect("apply");
        assert_eq!(cart.coupon_code.as_deref(), Some("tenoff"));
        assert_eq!(cart.total, Decimal::new(2700, 2));

        // The discount follows the live coupon definition.
        h.coupons.save(coupon("tenoff", DiscountKind::Percent, Decimal::from(20))).await;
        let totals = h.service.calculate_totals(&cart).await.expect("totals");
        assert_eq!(totals.discount, Decimal::new(600, 2));

        let mut disabled = coupon("tenoff", DiscountKind::Percent, Decimal::from(20));
        disabled.status = CouponStatus::Disabled;
        h.coupons.save(disabled).await;
        let totals = h.service.calculate_totals(&cart).await.expect("totals");
        assert_eq!(totals.discount, Decimal::ZERO);
        assert!(matches!(totals.coupon_issue, Some(CouponRejection::Inactive { .. })));

        let cart = h.service.remove_coupon(PHONE).await.expect("remove");
        assert_eq!(cart.coupon_code, None);
        assert_eq!(cart.total, Decimal::new(3000, 2));
    }

    #[tokio::test]
    async fn rejected_coupon_leaves_cart_unchanged() {
        let h = harness().await;
        h.products.save(product("10", 1000, None)).await;
        let mut minimum = coupon("BIG", DiscountKind::FixedCart, Decimal::from(5));
        minimum.minimum_amount = Some(Decimal::from(50));
        h.coupons.save(minimum).await;
        h.service.add_item(PHONE, &pid("10"), None, 1).await.expect("add");

        let error = h.service.apply_coupon(PHONE, "big").await.expect_err("below minimum");
        assert!(matches!(
            error,
            CartError::Domain(DomainError::Coupon(CouponRejection::BelowMinimumAmount { .. }))
        ));

        let cart = h.service.get_cart(PHONE).await.expect("cart");
        assert_eq!(cart.coupon_code, None);
    }

    #[tokio::test]
    async fn totals_include_tax_and_shipping() {
        let settings = CartSettings {
            pricing: PricingPolicy {
                tax_enabled: true,
                tax_rate: Decimal::from(10),
                shipping_methods: vec![ShippingMethod {
                    kind: ShippingKind::FlatRate,
                    enabled: true,
                    cost: Decimal::new(499, 2),
                }],
            },
            ..CartSettings::default()
        };
        let h = harness_with(settings).await;
        h.products.save(product("10", 1999, None)).await;

        let cart = h.service.add_item(PHONE, &pid("10"), None, 1).await.expect("add");
        // 19.99 + 2.00 tax + 4.99 shipping
        assert_eq!(cart.total, Decimal::new(2698, 2));
    }

    #[tokio::test]
    async fn clear_cart_resets_items_and_coupon() {
        let h = harness().await;
        h.products.save(product("10", 1000, None)).await;
        h.coupons.save(coupon("tenoff", DiscountKind::Percent, Decimal::from(10))).await;
        h.service.add_item(PHONE, &pid("10"), None, 2).await.expect("add");
        h.service.apply_coupon(PHONE, "tenoff").await.expect("apply");

        let cart = h.service.clear_cart(PHONE).await.expect("clear").expect("had a cart");
        assert!(cart.is_empty());
        assert_eq!(cart.coupon_code, None);
        assert_eq!(cart.total, Decimal::ZERO);

        assert!(h.service.clear_cart("+15559999999").await.expect("no cart").is_none());
    }

    #[tokio::test]
    async fn expired_carts_reject_mutation_and_are_replaced_on_add() {
        let h = harness().await;
        h.products.save(product("10", 1000, None)).await;
        let key = CustomerKey::parse(PHONE).expect("key");
        let now = Utc::now();
        let stale = Cart::new(key.clone(), now - Duration::hours(80), now - Duration::hours(8));
        let mut tx = h.service.store().begin().await.expect("begin");
        h.service.store().insert(&mut tx, &stale).await.expect("insert");
        tx.commit().await.expect("commit");

        let error = h.service.remove_coupon(PHONE).await.expect_err("expired");
        assert!(matches!(error, CartError::Domain(DomainError::CartExpired { .. })));

        let cart = h.service.add_item(PHONE, &pid("10"), None, 1).await.expect("fresh cart");
        assert_ne!(cart.id, stale.id);
        let old = h.service.store().find(&stale.id).await.expect("find").expect("exists");
        assert_eq!(old.status, CartStatus::Expired);
    }

    #[tokio::test]
    async fn mark_completed_converts_and_is_replay_safe() {
        let h = harness().await;
        h.products.save(product("10", 1000, None)).await;
        h.service.add_item(PHONE, &pid("10"), None, 1).await.expect("add");

        let completed = h.service.mark_completed(PHONE, "order-1").await.expect("complete");
        assert_eq!(completed.cart.status, CartStatus::Converted);
        assert_eq!(completed.cart.order_id.as_deref(), Some("order-1"));
        assert!(!completed.recovered);
        assert!(!completed.cart.recovered);

        let replay = h.service.mark_completed(PHONE, "order-1").await.expect("replay");
        assert!(replay.replayed);
        assert_eq!(replay.cart.id, completed.cart.id);

        let error = h.service.mark_completed(PHONE, "order-2").await.expect_err("nothing open");
        assert!(matches!(error, CartError::Validation(ValidationError::NoActiveCart { .. })));

        let error = h.service.mark_completed(PHONE, " ").await.expect_err("blank order");
        assert_eq!(error, CartError::Validation(ValidationError::EmptyOrderId));
    }

    #[tokio::test]
    async fn abandoned_cart_checkout_is_booked_as_recovered() {
        let h = harness().await;
        h.products.save(product("10", 1250, None)).await;
        h.service.add_item(PHONE, &pid("10"), None, 2).await.expect("add");

        let abandoned = h.service.mark_abandoned(PHONE).await.expect("abandon");
        assert_eq!(abandoned.status, CartStatus::Abandoned);
        assert!(abandoned.abandoned_at.is_some());

        let completed = h.service.mark_completed(PHONE, "order-9").await.expect("complete");
        assert!(completed.recovered);
        assert_eq!(completed.cart.recovered_order_id.as_deref(), Some("order-9"));
        assert_eq!(completed.cart.recovered_revenue, Some(Decimal::new(2500, 2)));
    }

    #[tokio::test]
    async fn completing_with_a_coupon_records_phone_usage() {
        let h = harness().await;
        h.products.save(product("10", 1000, None)).await;
        let mut once = coupon("ONCE", DiscountKind::FixedCart, Decimal::from(3));
        once.usage_limit_per_user = Some(1);
        h.coupons.save(once).await;

        h.service.add_item(PHONE, &pid("10"), None, 1).await.expect("add");
        h.service.apply_coupon(PHONE, "once").await.expect("first use");
        h.service.mark_completed(PHONE, "order-1").await.expect("complete");

        h.service.add_item(PHONE, &pid("10"), None, 1).await.expect("new cart");
        let error = h.service.apply_coupon(PHONE, "once").await.expect_err("second use");
        assert!(matches!(
            error,
            CartError::Domain(DomainError::Coupon(CouponRejection::PerCustomerLimitReached { .. }))
        ));
    }

    #[tokio::test]
    async fn per_phone_limit_holds_across_an_abandoned_and_a_new_cart() {
        let h = harness().await;
        h.products.save(product("10", 1000, None)).await;
        let mut once = coupon("ONCE", DiscountKind::FixedCart, Decimal::from(3));
        once.usage_limit_per_user = Some(1);
        h.coupons.save(once).await;

        h.service.add_item(PHONE, &pid("10"), None, 1).await.expect("add");
        h.service.apply_coupon(PHONE, "once").await.expect("apply on first cart");
        h.service.mark_abandoned(PHONE).await.expect("abandon");
        h.service.add_item(PHONE, &pid("10"), None, 1).await.expect("second cart");
        h.service.apply_coupon(PHONE, "once").await.expect("apply on second cart");

        let first = h.service.mark_completed(PHONE, "order-1").await.expect("complete");
        assert!(!first.recovered);
        assert_eq!(first.cart.coupon_code.as_deref(), Some("once"));
        assert_eq!(first.cart.total, Decimal::new(700, 2));

        // The abandoned cart still carries the code, but the phone has used it up.
        let second = h.service.mark_completed(PHONE, "order-2").await.expect("complete");
        assert!(second.recovered);
        assert_eq!(second.cart.coupon_code, None);
        assert_eq!(second.cart.total, Decimal::new(1000, 2));
        assert_eq!(second.cart.recovered_revenue, Some(Decimal::new(1000, 2)));

        let key = CustomerKey::parse(PHONE).expect("key");
        let ledger = SqlCouponUsageRepository::new(h.service.store().pool().clone());
        let used = ledger.count(&CouponId("coupon-ONCE".to_string()), &key).await.expect("count");
        assert_eq!(used, 1);
    }

    #[tokio::test]
    async fn coupon_mutations_run_on_a_single_connection_pool() {
        let h = harness_pooled(1, CartSettings::default()).await;
        h.products.save(product("10", 1000, None)).await;
        let mut once = coupon("ONCE", DiscountKind::Percent, Decimal::from(50));
        once.usage_limit_per_user = Some(1);
        h.coupons.save(once).await;

        h.service.add_item(PHONE, &pid("10"), None, 2).await.expect("add");
        let cart = h.service.apply_coupon(PHONE, "once").await.expect("apply");
        assert_eq!(cart.total, Decimal::new(1000, 2));
        h.service.mark_completed(PHONE, "order-1").await.expect("complete");

        h.service.add_item(PHONE, &pid("10"), None, 1).await.expect("new cart");
        let error = h.service.apply_coupon(PHONE, "once").await.expect_err("used up");
        assert!(matches!(
            error,
            CartError::Domain(DomainError::Coupon(CouponRejection::PerCustomerLimitReached { .. }))
        ));
    }

    #[tokio::test]
    async fn expired_active_carts_cannot_be_completed_or_abandoned() {
        let h = harness().await;
        let key = CustomerKey::parse(PHONE).expect("key");
        let now = Utc::now();
        let mut stale = Cart::new(key.clone(), now - Duration::hours(80), now - Duration::hours(8));
        stale.items.push(CartItem::from_snapshot(&product("10", 1000, None), 1));
        let mut tx = h.service.store().begin().await.expect("begin");
        h.service.store().insert(&mut tx, &stale).await.expect("insert");
        tx.commit().await.expect("commit");

        let error = h.service.mark_completed(PHONE, "order-x").await.expect_err("expired");
        assert!(matches!(error, CartError::Domain(DomainError::CartExpired { .. })));
        let error = h.service.mark_abandoned(PHONE).await.expect_err("expired");
        assert!(matches!(error, CartError::Domain(DomainError::CartExpired { .. })));

        let stored = h.service.store().find(&stale.id).await.expect("find").expect("exists");
        assert_eq!(stored.status, CartStatus::Active);
        assert_eq!(stored.order_id, None);
    }

    #[tokio::test]
    async fn reminder_sink_failures_do_not_fail_mutations() {
        let h = harness().await;
        h.products.save(product("10", 1000, None)).await;
        h.reminders.set_failing(true);

        let cart = h.service.add_item(PHONE, &pid("10"), None, 1).await.expect("committed");
        assert_eq!(cart.items.len(), 1);
    }

    #[tokio::test]
    async fn cleanup_sweeps_all_expired_carts_in_batches() {
        let settings = CartSettings { cleanup_batch_size: 2, ..CartSettings::default() };
        let h = harness_with(settings).await;
        let now = Utc::now();
        let mut tx = h.service.store().begin().await.expect("begin");
        for n in 0..5 {
            let cart = Cart::new(
                CustomerKey(format!("+1555020000{n}")),
                now - Duration::hours(80),
                now - Duration::hours(1),
            );
            h.service.store().insert(&mut tx, &cart).await.expect("insert");
        }
        tx.commit().await.expect("commit");

        assert_eq!(h.service.cleanup_expired_carts().await.expect("sweep"), 5);
        assert_eq!(h.service.cleanup_expired_carts().await.expect("sweep again"), 0);
    }

    #[tokio::test]
    async fn abandoned_candidates_use_the_configured_window() {
        let settings =
            CartSettings { abandon_after: Duration::minutes(30), ..CartSettings::default() };
        let h = harness_with(settings).await;
        let now = Utc::now();
        let mut idle = Cart::new(
            CustomerKey("+15550300001".to_string()),
            now - Duration::hours(2),
            now + Duration::hours(70),
        );
        idle.items.push(CartItem::from_snapshot(&product("10", 100, None), 1));
        let mut tx = h.service.store().begin().await.expect("begin");
        h.service.store().insert(&mut tx, &idle).await.expect("insert");
        tx.commit().await.expect("commit");

        let candidates = h.service.abandoned_candidates(10).await.expect("candidates");
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, idle.id);
    }
}
