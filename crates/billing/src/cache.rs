//! Per-tenant billing status cache
//!
//! No TTL: entries live until a writer invalidates them. Each tenant also has
//! a generation counter bumped on every invalidation. A reader captures the
//! generation before going to the store and only fills the cache if it is
//! unchanged, so a value read before a commit can never be cached after the
//! commit's invalidation.

use std::collections::HashMap;
use std::sync::Arc;

use clinicdesk_shared::BillingStatus;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct CacheState {
    entries: HashMap<Uuid, BillingStatus>,
    generations: HashMap<Uuid, u64>,
}

#[derive(Clone, Default)]
pub struct BillingStatusCache {
    inner: Arc<RwLock<CacheState>>,
}

impl BillingStatusCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, tenant_id: Uuid) -> Option<BillingStatus> {
        self.inner.read().await.entries.get(&tenant_id).copied()
    }

    /// Token to pass to [`Self::insert_if_current`]
    pub async fn generation(&self, tenant_id: Uuid) -> u64 {
        self.inner
            .read()
            .await
            .generations
            .get(&tenant_id)
            .copied()
            .unwrap_or(0)
    }

    /// Fill the entry unless the tenant was invalidated since `generation`
    pub async fn insert_if_current(
        &self,
        tenant_id: Uuid,
        status: BillingStatus,
        generation: u64,
    ) -> bool {
        let mut state = self.inner.write().await;
        let current = state.generations.get(&tenant_id).copied().unwrap_or(0);
        if current != generation {
            tracing::debug!(
                tenant_id = %tenant_id,
                "Discarding billing status read that raced an invalidation"
            );
            return false;
        }
        state.entries.insert(tenant_id, status);
        true
    }

    pub async fn invalidate(&self, tenant_id: Uuid) {
        let mut state = self.inner.write().await;
        state.entries.remove(&tenant_id);
        *state.generations.entry(tenant_id).or_insert(0) += 1;
        tracing::debug!(tenant_id = %tenant_id, "Billing status cache invalidated");
    }

    pub async fn clear(&self) {
        let mut state = self.inner.write().await;
        let tenants: Vec<Uuid> = state.entries.drain().map(|(tenant, _)| tenant).collect();
        for tenant_id in tenants {
            *state.generations.entry(tenant_id).or_insert(0) += 1;
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_and_get() {
        let cache = BillingStatusCache::new();
        let tenant = Uuid::new_v4();
        assert_eq!(cache.get(tenant).await, None);

        let generation = cache.generation(tenant).await;
        assert!(cache.insert_if_current(tenant, BillingStatus::Active, generation).await);
        assert_eq!(cache.get(tenant).await, Some(BillingStatus::Active));
    }

    #[tokio::test]
    async fn test_stale_fill_after_invalidation_is_rejected() {
        let cache = BillingStatusCache::new();
        let tenant = Uuid::new_v4();

        // reader captures generation, writer commits and invalidates, reader returns late
        let generation = cache.generation(tenant).await;
        cache.invalidate(tenant).await;
        assert!(!cache.insert_if_current(tenant, BillingStatus::Active, generation).await);
        assert_eq!(cache.get(tenant).await, None);
    }

    #[tokio::test]
    async fn test_invalidate_is_per_tenant() {
        let cache = BillingStatusCache::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        cache.insert_if_current(a, BillingStatus::Active, 0).await;
        cache.insert_if_current(b, BillingStatus::PastDue, 0).await;

        cache.invalidate(a).await;
        assert_eq!(cache.get(a).await, None);
        assert_eq!(cache.get(b).await, Some(BillingStatus::PastDue));
    }

    #[tokio::test]
    async fn test_clear_bumps_generations() {
        let cache = BillingStatusCache::new();
        let tenant = Uuid::new_v4();
        cache.insert_if_current(tenant, BillingStatus::Active, 0).await;

        cache.clear().await;
        assert!(cache.is_empty().await);
        assert!(!cache.insert_if_current(tenant, BillingStatus::Active, 0).await);
    }
}
