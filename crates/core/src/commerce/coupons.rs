use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::debug;

use super::catalog::{CouponCatalog, CouponUsageLedger, CustomerResolver};
use super::pricing;
use crate::domain::cart::{CartItem, CustomerKey};
use crate::domain::coupon::{Coupon, CouponStatus};
use crate::domain::product::{ProductId, VariationId};
use crate::errors::{CartError, CouponRejection, UsageSource, ValidationError};

/// The parts of a cart line that coupon restrictions look at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CouponCartLine {
    pub product_id: ProductId,
    pub variation_id: Option<VariationId>,
    pub category_ids: Vec<String>,
}

impl CouponCartLine {
    pub fn from_item(item: &CartItem, category_ids: Vec<String>) -> Self {
        Self {
            product_id: item.product_id.clone(),
            variation_id: item.variation_id.clone(),
            category_ids,
        }
    }

    fn matches_product<'a>(&self, product_ids: &'a [ProductId]) -> Option<&'a ProductId> {
        product_ids.iter().find(|candidate| {
            **candidate == self.product_id
                || self.variation_id.as_ref().is_some_and(|variation| candidate.0 == variation.0)
        })
    }

    fn matches_category<'a>(&self, category_ids: &'a [String]) -> Option<&'a String> {
        category_ids.iter().find(|candidate| self.category_ids.contains(candidate))
    }
}

#[derive(Clone, Copy)]
pub struct CouponContext<'a> {
    pub customer_key: &'a CustomerKey,
    /// Rounded cart subtotal before any discount.
    pub subtotal: Decimal,
    pub lines: &'a [CouponCartLine],
    /// Phone-keyed usage, read through the caller's transaction when there is one.
    pub ledger: &'a dyn CouponUsageLedger,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidatedCoupon {
    pub coupon: Coupon,
    pub discount: Decimal,
}

#[derive(Clone)]
pub struct CouponValidator {
    coupons: Arc<dyn CouponCatalog>,
    customers: Arc<dyn CustomerResolver>,
}

impl CouponValidator {
    pub fn new(coupons: Arc<dyn CouponCatalog>, customers: Arc<dyn CustomerResolver>) -> Self {
        Self { coupons, customers }
    }

    /// Runs every coupon rule in order and stops at the first failure.
    pub async fn validate(
        &self,
        code: &str,
        context: CouponContext<'_>,
        now: DateTime<Utc>,
    ) -> Result<ValidatedCoupon, CartError> {
        let normalized = Coupon::normalize_code(code);
        if normalized.is_empty() {
            return Err(ValidationError::EmptyCouponCode.into());
        }

        let coupon = self
            .coupons
            .find_by_code(&normalized)
            .await?
            .ok_or_else(|| CouponRejection::NotFound { code: normalized.clone() })?;

        if let Err(rejection) = self.check(&coupon, &context, now).await? {
            debug!(
                event_name = "cart.coupon.rejected",
                coupon_code = %normalized,
                customer_key = %context.customer_key,
                reason = %rejection,
                "coupon rejected"
            );
            return Err(rejection.into());
        }

        let discount = pricing::discount(Some(&coupon), context.subtotal);
        Ok(ValidatedCoupon { coupon, discount })
    }

    // Outer error is a collaborator failure, inner error is a rule rejection.
    async fn check(
        &self,
        coupon: &Coupon,
        context: &CouponContext<'_>,
        now: DateTime<Utc>,
    ) -> Result<Result<(), CouponRejection>, CartError> {
        let code = Coupon::normalize_code(&coupon.code);

        if coupon.status != CouponStatus::Active {
            return Ok(Err(CouponRejection::Inactive { code }));
        }
        if coupon.is_expired_at(now) {
            return Ok(Err(CouponRejection::Expired { code }));
        }
        if coupon.global_limit().is_some_and(|limit| coupon.usage_count >= limit) {
            return Ok(Err(CouponRejection::UsageLimitReached { code }));
        }

        if let Some(limit) = coupon.per_user_limit() {
            let by_phone =
                context.ledger.count_for_customer(&coupon.id, context.customer_key).await?;
            if by_phone >= limit {
                return Ok(Err(CouponRejection::PerCustomerLimitReached {
                    code,
                    via: UsageSource::PhoneLedger,
                }));
            }

            let by_account = match self.customers.resolve(context.customer_key).await? {
                Some(identity) => coupon
                    .used_by
                    .iter()
                    .filter(|entry| identity.matches_usage_entry(entry))
                    .count(),
                None => 0,
            };
            if by_account >= limit as usize {
                return Ok(Err(CouponRejection::PerCustomerLimitReached {
                    code,
                    via: UsageSource::CustomerAccount,
                }));
            }
        }

        if let Some(minimum) = coupon.minimum() {
            if context.subtotal < minimum {
                return Ok(Err(CouponRejection::BelowMinimumAmount { code, minimum }));
            }
        }
        if let Some(maximum) = coupon.maximum() {
            if context.subtotal > maximum {
                return Ok(Err(CouponRejection::AboveMaximumAmount { code, maximum }));
            }
        }

        Ok(check_cart_contents(coupon, code, context.lines))
    }
}

fn check_cart_contents(
    coupon: &Coupon,
    code: String,
    lines: &[CouponCartLine],
) -> Result<(), CouponRejection> {
    let restricted = !coupon.product_ids.is_empty() || !coupon.category_ids.is_empty();
    if restricted {
        let eligible = lines.iter().any(|line| {
            line.matches_product(&coupon.product_ids).is_some()
                || line.matches_category(&coupon.category_ids).is_some()
        });
        if !eligible {
            return Err(CouponRejection::NoEligibleItems { code });
        }
    }

    for line in lines {
        if let Some(product_id) = line.matches_product(&coupon.excluded_product_ids) {
            return Err(CouponRejection::ExcludedProduct { code, product_id: product_id.0.clone() });
        }
        if let Some(category_id) = line.matches_category(&coupon.excluded_category_ids) {
            return Err(CouponRejection::ExcludedCategory {
                code,
                category_id: category_id.clone(),
            });
        }
    }
    Ok(())
}
