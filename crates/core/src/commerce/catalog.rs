//! Collaborators the cart engine consumes but does not own.

use async_trait::async_trait;

use crate::domain::cart::CustomerKey;
use crate::domain::coupon::{Coupon, CouponId};
use crate::domain::customer::CustomerIdentity;
use crate::domain::product::{ProductId, ProductSnapshot, VariationId};
use crate::errors::CollaboratorError;

#[async_trait]
pub trait ProductCatalog: Send + Sync {
    /// Returns `None` when the product (or the requested variation) no longer exists.
    async fn lookup(
        &self,
        product_id: &ProductId,
        variation_id: Option<&VariationId>,
    ) -> Result<Option<ProductSnapshot>, CollaboratorError>;
}

#[async_trait]
pub trait CouponCatalog: Send + Sync {
    async fn find_by_code(&self, code: &str) -> Result<Option<Coupon>, CollaboratorError>;
}

/// Phone-keyed redemption counts recorded by this platform.
#[async_trait]
pub trait CouponUsageLedger: Send + Sync {
    async fn count_for_customer(
        &self,
        coupon_id: &CouponId,
        customer_key: &CustomerKey,
    ) -> Result<u32, CollaboratorError>;
}

#[async_trait]
pub trait CustomerResolver: Send + Sync {
    async fn resolve(
        &self,
        customer_key: &CustomerKey,
    ) -> Result<Option<CustomerIdentity>, CollaboratorError>;
}

/// Abandoned-cart reminder scheduler. Any cart activity halts an in-flight sequence.
#[async_trait]
pub trait ReminderSink: Send + Sync {
    async fn halt_reminders(&self, customer_key: &CustomerKey) -> Result<(), CollaboratorError>;
}
