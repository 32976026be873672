//! Per-tenant admission serialization
//!
//! Approval recomputes usage and reserves nothing, so two concurrent requests
//! can pass against the same headroom. When enabled, a tenant's mutating
//! requests run one at a time from approval until their completion has been
//! observed. Disabled, `acquire` is a no-op.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Tenant-keyed admission locks
#[derive(Default)]
pub struct AdmissionLocks {
    enabled: bool,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

/// Held for the lifetime of one admitted mutation
#[derive(Debug)]
pub struct AdmissionGuard {
    _guard: Option<OwnedMutexGuard<()>>,
}

impl AdmissionLocks {
    /// Create lock table
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            locks: DashMap::new(),
        }
    }

    /// Whether admissions are serialized
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Wait for the tenant's turn
    pub async fn acquire(&self, tenant: &str) -> AdmissionGuard {
        if !self.enabled {
            return AdmissionGuard { _guard: None };
        }

        let lock = self
            .locks
            .entry(tenant.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        AdmissionGuard {
            _guard: Some(lock.lock_owned().await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_disabled_never_blocks() {
        let locks = AdmissionLocks::new(false);
        let _a = locks.acquire("alice@pve").await;
        let _b = locks.acquire("alice@pve").await;
    }

    #[test]
    fn test_same_tenant_serialized() {
        let locks = AdmissionLocks::new(true);
        let first = tokio_test::block_on(locks.acquire("alice@pve"));

        let mut second = tokio_test::task::spawn(locks.acquire("alice@pve"));
        tokio_test::assert_pending!(second.poll());

        drop(first);
        assert!(second.is_woken());
        let _second = tokio_test::assert_ready!(second.poll());
    }

    #[tokio::test]
    async fn test_other_tenants_independent() {
        let locks = AdmissionLocks::new(true);
        let _alice = locks.acquire("alice@pve").await;
        let bob = tokio::time::timeout(Duration::from_millis(100), locks.acquire("bob@pve")).await;
        assert!(bob.is_ok());
    }
}
