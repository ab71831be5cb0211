use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::product::{ProductId, ProductSnapshot, VariationId};
use crate::errors::{DomainError, ValidationError};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CartId(pub String);

impl CartId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for CartId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of the cart owner on the chat channel, normally a phone number.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CustomerKey(pub String);

impl CustomerKey {
    /// Normalizes formatting characters away so `+1 (555) 010-2030` and
    /// `+15550102030` address the same cart.
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let normalized: String = raw
            .trim()
            .chars()
            .filter(|ch| !ch.is_whitespace() && !matches!(ch, '-' | '(' | ')' | '.'))
            .collect();

        if normalized.is_empty() {
            return Err(ValidationError::EmptyCustomerKey);
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CustomerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CartStatus {
    Active,
    Abandoned,
    Converted,
    Expired,
}

impl CartStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Abandoned => "abandoned",
            Self::Converted => "converted",
            Self::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "abandoned" => Some(Self::Abandoned),
            "converted" => Some(Self::Converted),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Converted | Self::Expired)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartItem {
    pub product_id: ProductId,
    pub variation_id: Option<VariationId>,
    pub quantity: u32,
    /// Unit price captured when the line was added; all billing uses this value.
    pub price_at_add: Decimal,
    pub product_name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variant_attributes: BTreeMap<String, String>,
}

impl CartItem {
    pub fn from_snapshot(product: &ProductSnapshot, quantity: u32) -> Self {
        Self {
            product_id: product.product_id.clone(),
            variation_id: product.variation_id.clone(),
            quantity,
            price_at_add: product.price,
            product_name: product.name.clone(),
            variant_attributes: product.variant_attributes.clone(),
        }
    }

    pub fn is_same_line(&self, product_id: &ProductId, variation_id: Option<&VariationId>) -> bool {
        &self.product_id == product_id && self.variation_id.as_ref() == variation_id
    }

    pub fn line_total(&self) -> Decimal {
        self.price_at_add * Decimal::from(self.quantity)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cart {
    pub id: CartId,
    pub customer_key: CustomerKey,
    pub items: Vec<CartItem>,
    pub coupon_code: Option<String>,
    pub status: CartStatus,
    pub total: Decimal,
    pub expires_at: DateTime<Utc>,
    pub abandoned_at: Option<DateTime<Utc>>,
    pub reminder_stage: u8,
    pub last_reminder_at: Option<DateTime<Utc>>,
    pub order_id: Option<String>,
    pub recovered: bool,
    pub recovered_order_id: Option<String>,
    pub recovered_revenue: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Cart {
    pub fn new(customer_key: CustomerKey, now: DateTime<Utc>, expires_at: DateTime<Utc>) -> Self {
        Self {
            id: CartId::generate(),
            customer_key,
            items: Vec::new(),
            coupon_code: None,
            status: CartStatus::Active,
            total: Decimal::new(0, 2),
            expires_at,
            abandoned_at: None,
            reminder_stage: 0,
            last_reminder_at: None,
            order_id: None,
            recovered: false,
            recovered_order_id: None,
            recovered_revenue: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn item_count(&self) -> u32 {
        self.items.iter().map(|item| item.quantity).sum()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Quantity already held on the line for this product/variation pair.
    pub fn quantity_of(&self, product_id: &ProductId, variation_id: Option<&VariationId>) -> u32 {
        self.items
            .iter()
            .filter(|item| item.is_same_line(product_id, variation_id))
            .map(|item| item.quantity)
            .sum()
    }

    /// Merges into the existing line for the same product/variation, or appends a new one.
    ///
    /// A merge sums quantities and re-captures the unit price and display data from
    /// `item`, since every `add` is a fresh price capture. Returns the line position.
    pub fn merge_item(&mut self, item: CartItem) -> usize {
        let existing = self
            .items
            .iter()
            .position(|line| line.is_same_line(&item.product_id, item.variation_id.as_ref()));

        match existing {
            Some(index) => {
                let line = &mut self.items[index];
                line.quantity = line.quantity.saturating_add(item.quantity);
                line.price_at_add = item.price_at_add;
                line.product_name = item.product_name;
                line.variant_attributes = item.variant_attributes;
                index
            }
            None => {
                self.items.push(item);
                self.items.len() - 1
            }
        }
    }

    pub fn item(&self, index: usize) -> Result<&CartItem, ValidationError> {
        self.items
            .get(index)
            .ok_or(ValidationError::UnknownItemIndex { index, len: self.items.len() })
    }

    pub fn set_quantity(&mut self, index: usize, quantity: u32) -> Result<(), ValidationError> {
        let len = self.items.len();
        let line =
            self.items.get_mut(index).ok_or(ValidationError::UnknownItemIndex { index, len })?;
        line.quantity = quantity;
        Ok(())
    }

    pub fn remove_item(&mut self, index: usize) -> Result<CartItem, ValidationError> {
        if index >= self.items.len() {
            return Err(ValidationError::UnknownItemIndex { index, len: self.items.len() });
        }
        Ok(self.items.remove(index))
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.coupon_code = None;
        self.total = Decimal::new(0, 2);
    }

    /// Records a successful mutation. The expiry only ever moves forward.
    pub fn touch(&mut self, now: DateTime<Utc>, expires_at: DateTime<Utc>) {
        if expires_at > self.expires_at {
            self.expires_at = expires_at;
        }
        self.updated_at = now;
    }

    pub fn can_transition_to(&self, next: CartStatus) -> bool {
        matches!(
            (self.status, next),
            (CartStatus::Active, CartStatus::Abandoned)
                | (CartStatus::Active, CartStatus::Converted)
                | (CartStatus::Active, CartStatus::Expired)
                | (CartStatus::Abandoned, CartStatus::Converted)
        )
    }

    pub fn transition_to(&mut self, next: CartStatus) -> Result<(), DomainError> {
        if self.can_transition_to(next) {
            self.status = next;
            return Ok(());
        }

        Err(DomainError::InvalidCartTransition { from: self.status, to: next })
    }

    pub fn mark_abandoned(&mut self, now: DateTime<Utc>) -> Result<(), DomainError> {
        self.transition_to(CartStatus::Abandoned)?;
        self.abandoned_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Converts the cart for `order_id`. Abandoned carts are also flagged as recovered,
    /// with the persisted total booked as recovered revenue. Returns whether the cart
    /// was recovered by this call.
    pub fn mark_converted(
        &mut self,
        order_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DomainError> {
        let was_abandoned = self.status == CartStatus::Abandoned;
        self.transition_to(CartStatus::Converted)?;
        self.order_id = Some(order_id.to_string());
        self.updated_at = now;

        if was_abandoned && !self.recovered {
            self.recovered = true;
            self.recovered_order_id = Some(order_id.to_string());
            self.recovered_revenue = Some(self.total);
            return Ok(true);
        }
        Ok(false)
    }
}
