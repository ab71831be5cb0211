use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::product::ProductId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CouponId(pub String);

impl std::fmt::Display for CouponId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CouponStatus {
    Active,
    Disabled,
    Deleted,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscountKind {
    /// `amount` is a percentage of the cart subtotal.
    Percent,
    /// `amount` is taken off the cart subtotal, never below zero.
    FixedCart,
    /// Kinds the cart engine does not price (for example per-product discounts).
    Other(String),
}

/// A promotion defined in the external coupon store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coupon {
    pub id: CouponId,
    pub code: String,
    pub status: CouponStatus,
    pub kind: DiscountKind,
    pub amount: Decimal,
    pub expires_at: Option<DateTime<Utc>>,
    pub usage_count: u32,
    pub usage_limit: Option<u32>,
    pub usage_limit_per_user: Option<u32>,
    /// Account ids and emails recorded by the coupon store on each redemption.
    #[serde(default)]
    pub used_by: Vec<String>,
    pub minimum_amount: Option<Decimal>,
    pub maximum_amount: Option<Decimal>,
    #[serde(default)]
    pub product_ids: Vec<ProductId>,
    #[serde(default)]
    pub excluded_product_ids: Vec<ProductId>,
    #[serde(default)]
    pub category_ids: Vec<String>,
    #[serde(default)]
    pub excluded_category_ids: Vec<String>,
}

impl Coupon {
    /// Coupon codes are matched case-insensitively with surrounding whitespace ignored.
    pub fn normalize_code(code: &str) -> String {
        code.trim().to_lowercase()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    // Zero and absent limits both mean "unlimited".
    pub fn global_limit(&self) -> Option<u32> {
        self.usage_limit.filter(|limit| *limit > 0)
    }

    pub fn per_user_limit(&self) -> Option<u32> {
        self.usage_limit_per_user.filter(|limit| *limit > 0)
    }

    pub fn minimum(&self) -> Option<Decimal> {
        self.minimum_amount.filter(|amount| *amount > Decimal::ZERO)
    }

    pub fn maximum(&self) -> Option<Decimal> {
        self.maximum_amount.filter(|amount| *amount > Decimal::ZERO)
    }
}
