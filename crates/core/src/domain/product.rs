use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProductId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VariationId(pub String);

impl std::fmt::Display for ProductId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Display for VariationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Live catalog view of a purchasable product or one of its variations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductSnapshot {
    pub product_id: ProductId,
    pub variation_id: Option<VariationId>,
    pub name: String,
    pub price: Decimal,
    pub in_stock: bool,
    /// `None` when the catalog does not track stock for this product.
    pub stock_quantity: Option<u32>,
    #[serde(default)]
    pub category_ids: Vec<String>,
    #[serde(default)]
    pub variant_attributes: BTreeMap<String, String>,
}

impl ProductSnapshot {
    /// Checks that `requested` units in total can be supplied right now.
    pub fn ensure_available(&self, requested: u32) -> Result<(), DomainError> {
        if !self.in_stock {
            return Err(DomainError::OutOfStock { product_id: self.display_id() });
        }

        match self.stock_quantity {
            Some(0) => Err(DomainError::OutOfStock { product_id: self.display_id() }),
            Some(available) if requested > available => Err(DomainError::InsufficientStock {
                product_id: self.display_id(),
                requested,
                available,
            }),
            _ => Ok(()),
        }
    }

    pub fn display_id(&self) -> String {
        match &self.variation_id {
            Some(variation) => format!("{}:{}", self.product_id, variation),
            None => self.product_id.0.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use rust_decimal::Decimal;

    use super::{ProductId, ProductSnapshot, VariationId};
    use crate::errors::DomainError;

    fn snapshot(in_stock: bool, stock_quantity: Option<u32>) -> ProductSnapshot {
        ProductSnapshot {
            product_id: ProductId("10".to_string()),
            variation_id: None,
            name: "Cold brew".to_string(),
            price: Decimal::new(999, 2),
            in_stock,
            stock_quantity,
            category_ids: vec![],
            variant_attributes: BTreeMap::new(),
        }
    }

    #[test]
    fn untracked_stock_accepts_any_quantity() {
        assert!(snapshot(true, None).ensure_available(10_000).is_ok());
    }

    #[test]
    fn insufficient_stock_reports_requested_and_available() {
        let error = snapshot(true, Some(2)).ensure_available(3).expect_err("only two left");
        assert_eq!(
            error,
            DomainError::InsufficientStock {
                product_id: "10".to_string(),
                requested: 3,
                available: 2,
            }
        );
    }

    #[test]
    fn out_of_stock_flag_wins_over_quantity() {
        let error =
            snapshot(false, Some(50)).ensure_available(1).expect_err("flagged out of stock");
        assert!(matches!(error, DomainError::OutOfStock { .. }));
    }

    #[test]
    fn variation_is_part_of_display_id() {
        let mut product = snapshot(true, None);
        product.variation_id = Some(VariationId("11".to_string()));
        assert_eq!(product.display_id(), "10:11");
    }
}
