//! Per-tenant write locks.
//!
//! Full-sync reconciliation must not interleave with another reconciliation
//! of the same tenant. Different tenants never contend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Lazily created async mutex per tenant id.
///
/// Cloning shares the underlying map, so every repository handed out by one
/// [`crate::Database`] sees the same locks.
#[derive(Debug, Clone, Default)]
pub struct TenantLocks {
    inner: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl TenantLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for and returns the lock for `tenant_id`.
    pub async fn acquire(&self, tenant_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            // A poisoned map only means another thread panicked mid-insert;
            // the map itself is still usable.
            let mut map = match self.inner.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            map.entry(tenant_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_tenant_serializes() {
        let locks = TenantLocks::new();
        let guard = locks.acquire("acme").await;

        let other = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = other.acquire("acme").await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_different_tenants_do_not_contend() {
        let locks = TenantLocks::new();
        let _a = locks.acquire("a").await;
        let _b = tokio::time::timeout(Duration::from_millis(100), locks.acquire("b"))
            .await
            .expect("independent tenant lock");
    }
}
