use thiserror::Error;

use chatcart_core::errors::{CartError, LockError};

pub mod cart;
pub mod coupon_usage;

pub use cart::{CartStore, SqlCartStore};
pub use coupon_usage::{SqlCouponUsageRepository, TransactionUsageLedger};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("cart `{0}` does not exist")]
    CartNotFound(String),
    #[error(transparent)]
    Lock(#[from] LockError),
}

impl RepositoryError {
    /// SQLite reports contention as BUSY (5) or LOCKED (6), possibly with an extended code.
    /// A unique violation on the active-cart index means another writer won the race.
    pub fn is_contention(&self) -> bool {
        match self {
            Self::Database(sqlx::Error::Database(error)) => {
                let busy = error
                    .code()
                    .and_then(|code| code.parse::<i32>().ok())
                    .is_some_and(|code| matches!(code & 0xFF, 5 | 6));
                busy || error.is_unique_violation()
            }
            Self::Database(sqlx::Error::PoolTimedOut) | Self::Lock(_) => true,
            _ => false,
        }
    }
}

impl From<RepositoryError> for CartError {
    fn from(error: RepositoryError) -> Self {
        match error {
            RepositoryError::Lock(error) => error.into(),
            error if error.is_contention() => Self::Concurrency(error.to_string()),
            error => Self::Infrastructure(error.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use chatcart_core::errors::{CartError, LockError};

    use super::RepositoryError;

    #[test]
    fn lock_timeouts_and_pool_exhaustion_are_retryable() {
        let lock =
            RepositoryError::Lock(LockError::Timeout { key: "cart:1".into(), waited_ms: 10 });
        assert!(CartError::from(lock).is_retryable());

        let pool = RepositoryError::Database(sqlx::Error::PoolTimedOut);
        assert!(CartError::from(pool).is_retryable());
    }

    #[test]
    fn decode_failures_are_infrastructure_errors() {
        let error = CartError::from(RepositoryError::Decode("bad items_json".into()));
        assert!(matches!(
            error,
            CartError::Infrastructure(ref message) if message.contains("items_json")
        ));
        assert!(!error.is_retryable());
    }
}
