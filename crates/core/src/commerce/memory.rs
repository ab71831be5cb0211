//! In-memory collaborators for tests and local tooling.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::RwLock;

use super::catalog::{
    CouponCatalog, CouponUsageLedger, CustomerResolver, ProductCatalog, ReminderSink,
};
use crate::domain::cart::CustomerKey;
use crate::domain::coupon::{Coupon, CouponId};
use crate::domain::customer::CustomerIdentity;
use crate::domain::product::{ProductId, ProductSnapshot, VariationId};
use crate::errors::CollaboratorError;

type ProductKey = (String, Option<String>);

fn product_key(product_id: &ProductId, variation_id: Option<&VariationId>) -> ProductKey {
    (product_id.0.clone(), variation_id.map(|variation| variation.0.clone()))
}

#[derive(Default)]
pub struct InMemoryProductCatalog {
    products: RwLock<HashMap<ProductKey, ProductSnapshot>>,
}

impl InMemoryProductCatalog {
    pub async fn save(&self, product: ProductSnapshot) {
        let key = product_key(&product.product_id, product.variation_id.as_ref());
        self.products.write().await.insert(key, product);
    }

    pub async fn remove(&self, product_id: &ProductId, variation_id: Option<&VariationId>) {
        self.products.write().await.remove(&product_key(product_id, variation_id));
    }

    pub async fn set_price(
        &self,
        product_id: &ProductId,
        variation_id: Option<&VariationId>,
        price: Decimal,
    ) {
        if let Some(product) =
            self.products.write().await.get_mut(&product_key(product_id, variation_id))
        {
            product.price = price;
        }
    }

    pub async fn set_stock(
        &self,
        product_id: &ProductId,
        variation_id: Option<&VariationId>,
        in_stock: bool,
        stock_quantity: Option<u32>,
    ) {
        if let Some(product) =
            self.products.write().await.get_mut(&product_key(product_id, variation_id))
        {
            product.in_stock = in_stock;
            product.stock_quantity = stock_quantity;
        }
    }
}

#[async_trait]
impl ProductCatalog for InMemoryProductCatalog {
    async fn lookup(
        &self,
        product_id: &ProductId,
        variation_id: Option<&VariationId>,
    ) -> Result<Option<ProductSnapshot>, CollaboratorError> {
        let products = self.products.read().await;
        Ok(products.get(&product_key(product_id, variation_id)).cloned())
    }
}

#[derive(Default)]
pub struct InMemoryCouponCatalog {
    coupons: RwLock<HashMap<String, Coupon>>,
}

impl InMemoryCouponCatalog {
    pub async fn save(&self, coupon: Coupon) {
        let code = Coupon::normalize_code(&coupon.code);
        self.coupons.write().await.insert(code, coupon);
    }
}

#[async_trait]
impl CouponCatalog for InMemoryCouponCatalog {
    async fn find_by_code(&self, code: &str) -> Result<Option<Coupon>, CollaboratorError> {
        let coupons = self.coupons.read().await;
        Ok(coupons.get(&Coupon::normalize_code(code)).cloned())
    }
}

#[derive(Default)]
pub struct InMemoryCouponUsageLedger {
    uses: RwLock<HashMap<(String, String), u32>>,
}

impl InMemoryCouponUsageLedger {
    pub async fn record(&self, coupon_id: &CouponId, customer_key: &CustomerKey) {
        let mut uses = self.uses.write().await;
        *uses.entry((coupon_id.0.clone(), customer_key.0.clone())).or_default() += 1;
    }
}

#[async_trait]
impl CouponUsageLedger for InMemoryCouponUsageLedger {
    async fn count_for_customer(
        &self,
        coupon_id: &CouponId,
        customer_key: &CustomerKey,
    ) -> Result<u32, CollaboratorError> {
        let uses = self.uses.read().await;
        Ok(uses.get(&(coupon_id.0.clone(), customer_key.0.clone())).copied().unwrap_or_default())
    }
}

#[derive(Default)]
pub struct InMemoryCustomerResolver {
    customers: RwLock<HashMap<String, CustomerIdentity>>,
}

impl InMemoryCustomerResolver {
    pub async fn link(&self, customer_key: &CustomerKey, identity: CustomerIdentity) {
        self.customers.write().await.insert(customer_key.0.clone(), identity);
    }
}

#[async_trait]
impl CustomerResolver for InMemoryCustomerResolver {
    async fn resolve(
        &self,
        customer_key: &CustomerKey,
    ) -> Result<Option<CustomerIdentity>, CollaboratorError> {
        let customers = self.customers.read().await;
        Ok(customers.get(&customer_key.0).cloned())
    }
}

/// Records every halt request; can be switched into a failing mode.
#[derive(Default)]
pub struct RecordingReminderSink {
    halted: RwLock<Vec<CustomerKey>>,
    failing: AtomicBool,
}

impl RecordingReminderSink {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn halted(&self) -> Vec<CustomerKey> {
        self.halted.read().await.clone()
    }
}

#[async_trait]
impl ReminderSink for RecordingReminderSink {
    async fn halt_reminders(&self, customer_key: &CustomerKey) -> Result<(), CollaboratorError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CollaboratorError::new("reminder scheduler", "sink offline"));
        }
        self.halted.write().await.push(customer_key.clone());
        Ok(())
    }
}
