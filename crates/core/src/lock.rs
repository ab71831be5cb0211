//! Per-customer mutual exclusion for cart creation and mutation.
//!
//! Keys are derived from the customer identity, so two customers never contend for
//! the same lock. Guards release on drop, which covers early returns and errors in
//! the caller.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;
use tracing::trace;

use crate::domain::cart::CustomerKey;
use crate::errors::LockError;

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

// Idle slots are pruned once the table grows past this many keys.
const PRUNE_THRESHOLD: usize = 1024;

// Saturates instead of truncating the u128 millisecond count.
fn whole_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LockKey(String);

impl LockKey {
    pub fn for_customer(customer_key: &CustomerKey) -> Self {
        let digest = blake3::hash(customer_key.as_str().as_bytes());
        Self(format!("cart:{}", &digest.to_hex()[..32]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Held lock. Dropping the guard releases the lock.
pub struct LockGuard {
    key: LockKey,
    acquired_at: Instant,
    _held: Box<dyn Send + Sync>,
}

impl LockGuard {
    pub fn new(key: LockKey, held: impl Send + Sync + 'static) -> Self {
        Self { key, acquired_at: Instant::now(), _held: Box::new(held) }
    }

    pub fn key(&self) -> &LockKey {
        &self.key
    }

    pub fn release(self) {
        drop(self);
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        trace!(
            event_name = "cart.lock.released",
            lock_key = %self.key,
            held_ms = whole_millis(self.acquired_at.elapsed()),
            "cart lock released"
        );
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").field("key", &self.key).finish_non_exhaustive()
    }
}

#[async_trait]
pub trait LockManager: Send + Sync {
    /// Waits up to `timeout` for exclusive ownership of `key`.
    async fn acquire(&self, key: &LockKey, timeout: Duration) -> Result<LockGuard, LockError>;
}

/// Keyed async mutex for single-node deployments.
#[derive(Default)]
pub struct InProcessLockManager {
    slots: Mutex<HashMap<LockKey, Arc<AsyncMutex<()>>>>,
}

impl InProcessLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &LockKey) -> Arc<AsyncMutex<()>> {
        let mut slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if slots.len() > PRUNE_THRESHOLD {
            // A slot referenced only by the table has no holder and no waiter.
            slots.retain(|_, slot| Arc::strong_count(slot) > 1);
        }
        slots.entry(key.clone()).or_default().clone()
    }

    pub fn tracked_keys(&self) -> usize {
        self.slots.lock().map(|slots| slots.len()).unwrap_or_default()
    }
}

#[async_trait]
impl LockManager for InProcessLockManager {
    async fn acquire(&self, key: &LockKey, timeout: Duration) -> Result<LockGuard, LockError> {
        let slot = self.slot(key);
        let started = Instant::now();

        match tokio::time::timeout(timeout, slot.lock_owned()).await {
            Ok(guard) => {
                trace!(
                    event_name = "cart.lock.acquired",
                    lock_key = %key,
                    waited_ms = whole_millis(started.elapsed()),
                    "cart lock acquired"
                );
                Ok(LockGuard::new(key.clone(), guard))
            }
            Err(_) => Err(LockError::Timeout {
                key: key.to_string(),
                waited_ms: whole_millis(started.elapsed()),
            }),
        }
    }
}
