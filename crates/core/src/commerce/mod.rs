pub mod catalog;
pub mod coupons;
pub mod memory;
pub mod pricing;

pub use catalog::{CouponCatalog, CouponUsageLedger, CustomerResolver, ProductCatalog, ReminderSink};
pub use coupons::{CouponCartLine, CouponContext, CouponValidator, ValidatedCoupon};
pub use pricing::{
    CartTotals, DeterministicPricingEngine, PricingEngine, PricingInput, PricingPolicy,
    PricingResult, ShippingKind, ShippingMethod,
};
