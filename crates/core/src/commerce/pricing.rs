use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::domain::cart::CartItem;
use crate::domain::coupon::{Coupon, DiscountKind};
use crate::errors::CouponRejection;

const HUNDRED: Decimal = Decimal::ONE_HUNDRED;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShippingKind {
    FlatRate,
    FreeShipping,
    LocalPickup,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShippingMethod {
    pub kind: ShippingKind,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub cost: Decimal,
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PricingPolicy {
    pub tax_enabled: bool,
    /// Base tax rate as a percentage, e.g. `8.25`.
    pub tax_rate: Decimal,
    pub shipping_methods: Vec<ShippingMethod>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingTraceStep {
    pub stage: String,
    pub detail: String,
    pub amount: Decimal,
}

#[derive(Clone, Copy, Debug)]
pub struct PricingInput<'a> {
    pub items: &'a [CartItem],
    /// Positions of lines whose product no longer resolves; they are priced as removed.
    pub unresolved_lines: &'a [usize],
    pub coupon: Option<&'a Coupon>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingResult {
    pub subtotal: Decimal,
    pub discount_total: Decimal,
    pub tax_total: Decimal,
    pub shipping_total: Decimal,
    pub total: Decimal,
    pub trace: Vec<PricingTraceStep>,
}

/// Priced view of a cart, including what happened to its stored coupon.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CartTotals {
    pub subtotal: Decimal,
    pub discount: Decimal,
    pub tax: Decimal,
    pub shipping: Decimal,
    pub total: Decimal,
    pub coupon_code: Option<String>,
    /// Set when the stored coupon no longer validates; no discount is applied then.
    pub coupon_issue: Option<CouponRejection>,
    pub skipped_lines: Vec<usize>,
}

pub trait PricingEngine: Send + Sync {
    fn price(&self, input: PricingInput<'_>) -> PricingResult;
}

#[derive(Clone, Debug, Default)]
pub struct DeterministicPricingEngine {
    policy: PricingPolicy,
}

impl DeterministicPricingEngine {
    pub fn new(policy: PricingPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &PricingPolicy {
        &self.policy
    }
}

impl PricingEngine for DeterministicPricingEngine {
    fn price(&self, input: PricingInput<'_>) -> PricingResult {
        price_cart(input, &self.policy)
    }
}

/// Currency minor-unit rounding, half away from zero.
pub fn round_currency(amount: Decimal) -> Decimal {
    let mut rounded = amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    rounded.rescale(2);
    rounded
}

pub fn subtotal(items: &[CartItem], unresolved_lines: &[usize]) -> Decimal {
    let sum: Decimal = items
        .iter()
        .enumerate()
        .filter(|(index, _)| !unresolved_lines.contains(index))
        .map(|(_, item)| item.line_total())
        .sum();
    round_currency(sum)
}

pub fn discount(coupon: Option<&Coupon>, subtotal: Decimal) -> Decimal {
    let Some(coupon) = coupon else {
        return Decimal::ZERO;
    };
    if subtotal <= Decimal::ZERO || coupon.amount <= Decimal::ZERO {
        return Decimal::ZERO;
    }

    let raw = match &coupon.kind {
        DiscountKind::Percent => round_currency(subtotal * coupon.amount / HUNDRED),
        DiscountKind::FixedCart => round_currency(coupon.amount),
        DiscountKind::Other(_) => Decimal::ZERO,
    };
    raw.min(subtotal)
}

pub fn tax(amount_after_discount: Decimal, policy: &PricingPolicy) -> Decimal {
    if !policy.tax_enabled || amount_after_discount <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    round_currency(amount_after_discount * policy.tax_rate / HUNDRED)
}

/// Cost of the first enabled flat-rate method; free or unconfigured shipping costs nothing.
pub fn shipping_estimate(methods: &[ShippingMethod]) -> Decimal {
    methods
        .iter()
        .find(|method| method.enabled && method.kind == ShippingKind::FlatRate)
        .map(|method| round_currency(method.cost.max(Decimal::ZERO)))
        .unwrap_or_else(|| round_currency(Decimal::ZERO))
}

pub fn price_cart(input: PricingInput<'_>, policy: &PricingPolicy) -> PricingResult {
    let subtotal = subtotal(input.items, input.unresolved_lines);
    let discount_total = round_currency(discount(input.coupon, subtotal));
    let after_discount = round_currency(subtotal - discount_total);
    let tax_total = round_currency(tax(after_discount, policy));
    let priced_lines = input.items.len().saturating_sub(
        input.unresolved_lines.iter().filter(|index| **index < input.items.len()).count(),
    );
    // Nothing ships from an empty cart.
    let shipping_total = if priced_lines == 0 {
        round_currency(Decimal::ZERO)
    } else {
        shipping_estimate(&policy.shipping_methods)
    };
    let total = round_currency(after_discount + tax_total + shipping_total);

    let mut trace = vec![PricingTraceStep {
        stage: "subtotal".to_string(),
        detail: format!(
            "sum(price_at_add * quantity) over {priced_lines} of {} lines",
            input.items.len()
        ),
        amount: subtotal,
    }];
    if let Some(coupon) = input.coupon {
        trace.push(PricingTraceStep {
            stage: "discount".to_string(),
            detail: format!("coupon {} ({:?} {})", coupon.code, coupon.kind, coupon.amount),
            amount: discount_total,
        });
    }
    if policy.tax_enabled {
        trace.push(PricingTraceStep {
            stage: "tax".to_string(),
            detail: format!("{}% of {after_discount}", policy.tax_rate),
            amount: tax_total,
        });
    }
    trace.push(PricingTraceStep {
        stage: "shipping".to_string(),
        detail: "first enabled flat rate".to_string(),
        amount: shipping_total,
    });

    PricingResult { subtotal, discount_total, tax_total, shipping_total, total, trace }
}
