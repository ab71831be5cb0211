use rust_decimal::Decimal;
use thiserror::Error;

use crate::domain::cart::CartStatus;

/// Malformed input. The cart is never touched when one of these is raised.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("customer key must not be empty")]
    EmptyCustomerKey,
    #[error("quantity must be greater than zero (got {quantity})")]
    NonPositiveQuantity { quantity: i64 },
    #[error("quantity {quantity} exceeds the supported maximum")]
    QuantityTooLarge { quantity: i64 },
    #[error("no cart item at position {index} (cart has {len} items)")]
    UnknownItemIndex { index: usize, len: usize },
    #[error("product `{product_id}` could not be found")]
    ProductNotFound { product_id: String },
    #[error("coupon code must not be empty")]
    EmptyCouponCode,
    #[error("order id must not be empty")]
    EmptyOrderId,
    #[error("customer `{customer_key}` has no open cart")]
    NoActiveCart { customer_key: String },
}

/// The coupon rule that rejected an application, in evaluation order.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CouponRejection {
    #[error("coupon `{code}` does not exist")]
    NotFound { code: String },
    #[error("coupon `{code}` is no longer available")]
    Inactive { code: String },
    #[error("coupon `{code}` has expired")]
    Expired { code: String },
    #[error("coupon `{code}` has reached its usage limit")]
    UsageLimitReached { code: String },
    #[error("coupon `{code}` was already used the maximum number of times by this customer")]
    PerCustomerLimitReached { code: String, via: UsageSource },
    #[error("coupon `{code}` requires a minimum cart subtotal of {minimum}")]
    BelowMinimumAmount { code: String, minimum: Decimal },
    #[error("coupon `{code}` only applies to cart subtotals up to {maximum}")]
    AboveMaximumAmount { code: String, maximum: Decimal },
    #[error("coupon `{code}` does not apply to any product in the cart")]
    NoEligibleItems { code: String },
    #[error("coupon `{code}` cannot be used with product `{product_id}`")]
    ExcludedProduct { code: String, product_id: String },
    #[error("coupon `{code}` cannot be used with products in category `{category_id}`")]
    ExcludedCategory { code: String, category_id: String },
}

/// Which usage record tripped a per-customer coupon limit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UsageSource {
    /// Phone-keyed ledger kept by this platform.
    PhoneLedger,
    /// The coupon's own usage list, matched by account id or email.
    CustomerAccount,
}

impl std::fmt::Display for UsageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PhoneLedger => f.write_str("phone ledger"),
            Self::CustomerAccount => f.write_str("customer account"),
        }
    }
}

/// Business-rule violations that will not succeed on retry with the same arguments.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("product `{product_id}` is out of stock")]
    OutOfStock { product_id: String },
    #[error("only {available} of product `{product_id}` available, {requested} requested")]
    InsufficientStock { product_id: String, requested: u32, available: u32 },
    #[error(transparent)]
    Coupon(#[from] CouponRejection),
    #[error("cart `{cart_id}` has expired")]
    CartExpired { cart_id: String },
    #[error("invalid cart transition from {from:?} to {to:?}")]
    InvalidCartTransition { from: CartStatus, to: CartStatus },
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("timed out after {waited_ms}ms waiting for lock `{key}`")]
    Timeout { key: String, waited_ms: u64 },
}

/// Failure reported by an external collaborator (catalog, coupon store, customer directory).
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{collaborator} unavailable: {message}")]
pub struct CollaboratorError {
    pub collaborator: &'static str,
    pub message: String,
}

impl CollaboratorError {
    pub fn new(collaborator: &'static str, message: impl Into<String>) -> Self {
        Self { collaborator, message: message.into() }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CartError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("concurrent cart access: {0}")]
    Concurrency(String),
    #[error("infrastructure failure: {0}")]
    Infrastructure(String),
}

impl CartError {
    /// Lock timeouts and busy storage can succeed when the caller retries.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Concurrency(_))
    }

    /// Validation and domain errors are user-facing outcomes, not operational failures.
    pub fn is_expected(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::Domain(_))
    }

    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::Rejected { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

impl From<LockError> for CartError {
    fn from(value: LockError) -> Self {
        Self::Concurrency(value.to_string())
    }
}

impl From<CouponRejection> for CartError {
    fn from(value: CouponRejection) -> Self {
        Self::Domain(DomainError::Coupon(value))
    }
}

impl From<CollaboratorError> for CartError {
    fn from(value: CollaboratorError) -> Self {
        Self::Infrastructure(value.to_string())
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("rejected: {message}")]
    Rejected { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
}

impl InterfaceError {
    /// Plain-language text suitable for replying to the customer.
    pub fn user_message(&self) -> &str {
        match self {
            Self::BadRequest { message, .. } | Self::Rejected { message, .. } => message,
            Self::ServiceUnavailable { .. } => {
                "Something went wrong while updating your cart. Please try again."
            }
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::BadRequest { correlation_id, .. }
            | Self::Rejected { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. } => correlation_id,
        }
    }
}

impl From<CartError> for InterfaceError {
    fn from(value: CartError) -> Self {
        let correlation_id = "unassigned".to_owned();
        match value {
            CartError::Validation(error) => {
                Self::BadRequest { message: error.to_string(), correlation_id }
            }
            CartError::Domain(error) => {
                Self::Rejected { message: error.to_string(), correlation_id }
            }
            CartError::Concurrency(message) | CartError::Infrastructure(message) => {
                Self::ServiceUnavailable { message, correlation_id }
            }
        }
    }
}
