use std::collections::HashMap;
use std::sync::Arc;

use recon_core::TenantId;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

/// One non-blocking single-writer lock per tenant.
#[derive(Debug, Default, Clone)]
pub struct TenantLocks {
    inner: Arc<Mutex<HashMap<TenantId, Arc<Semaphore>>>>,
}

/// Proof that the holder owns its tenant. Dropping it releases the tenant.
#[derive(Debug)]
pub struct TenantPermit {
    tenant: TenantId,
    _permit: OwnedSemaphorePermit,
}

impl TenantPermit {
    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }
}

impl TenantLocks {
    pub fn new() -> Self {
        Self::default()
    }

    async fn semaphore(&self, tenant: &TenantId) -> Arc<Semaphore> {
        let mut map = self.inner.lock().await;
        map.entry(tenant.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone()
    }

    /// `None` when another holder owns the tenant. Never waits for it.
    pub async fn try_acquire(&self, tenant: &TenantId) -> Option<TenantPermit> {
        let permit = self.semaphore(tenant).await.try_acquire_owned().ok()?;
        Some(TenantPermit {
            tenant: tenant.clone(),
            _permit: permit,
        })
    }

    pub async fn is_held(&self, tenant: &TenantId) -> bool {
        self.semaphore(tenant).await.available_permits() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_fails_until_release() {
        let locks = TenantLocks::new();
        let acme = TenantId::from("acme");
        let permit = locks.try_acquire(&acme).await.expect("first");
        assert_eq!(permit.tenant(), &acme);
        assert!(locks.try_acquire(&acme).await.is_none());
        assert!(locks.is_held(&acme).await);

        assert!(locks.try_acquire(&TenantId::from("globex")).await.is_some());

        drop(permit);
        assert!(!locks.is_held(&acme).await);
        assert!(locks.try_acquire(&acme).await.is_some());
    }
}
