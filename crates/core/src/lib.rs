pub mod commerce;
pub mod config;
pub mod domain;
pub mod errors;
pub mod lock;

pub use commerce::{
    CartTotals, CouponCatalog, CouponUsageLedger, CouponValidator, CustomerResolver,
    DeterministicPricingEngine, PricingEngine, PricingPolicy, ProductCatalog, ReminderSink,
};
pub use domain::cart::{Cart, CartId, CartItem, CartStatus, CustomerKey};
pub use domain::coupon::{Coupon, CouponId};
pub use domain::product::{ProductId, ProductSnapshot, VariationId};
pub use errors::{
    CartError, CollaboratorError, CouponRejection, DomainError, InterfaceError, LockError,
    ValidationError,
};
pub use lock::{InProcessLockManager, LockGuard, LockKey, LockManager};
