//! Access control gate
//!
//! Answers "may this tenant use the product" from the tenant billing status
//! alone. Anything other than `ACTIVE` is denied, including tenants that
//! have never subscribed or do not exist.

use std::sync::Arc;

use clinicdesk_shared::BillingStatus;
use uuid::Uuid;

use crate::cache::BillingStatusCache;
use crate::error::BillingResult;
use crate::store::BillingStore;

#[derive(Clone)]
pub struct AccessControlGate {
    store: Arc<dyn BillingStore>,
    cache: BillingStatusCache,
}

impl AccessControlGate {
    pub fn new(store: Arc<dyn BillingStore>, cache: BillingStatusCache) -> Self {
        Self { store, cache }
    }

    /// Coarse billing status, served from the cache when possible
    pub async fn billing_status(&self, tenant_id: Uuid) -> BillingResult<BillingStatus> {
        if let Some(status) = self.cache.get(tenant_id).await {
            return Ok(status);
        }

        let generation = self.cache.generation(tenant_id).await;
        let status = match self.store.tenant_billing(tenant_id).await? {
            Some(tenant) if tenant.has_subscription => tenant.billing_status,
            Some(_) => BillingStatus::PendingPayment,
            None => {
                tracing::debug!(tenant_id = %tenant_id, "Unknown tenant treated as pending payment");
                BillingStatus::PendingPayment
            }
        };

        self.cache
            .insert_if_current(tenant_id, status, generation)
            .await;
        Ok(status)
    }

    pub async fn has_active_billing(&self, tenant_id: Uuid) -> BillingResult<bool> {
        Ok(self.billing_status(tenant_id).await?.is_active())
    }

    /// Whether `actor_id` may enter the tenant's admin area.
    ///
    /// Only billing gates this today; the actor is carried for audit logging.
    pub async fn can_access_tenant_admin(
        &self,
        actor_id: Uuid,
        tenant_id: Uuid,
    ) -> BillingResult<bool> {
        let allowed = self.has_active_billing(tenant_id).await?;
        if !allowed {
            tracing::info!(
                actor_id = %actor_id,
                tenant_id = %tenant_id,
                "Tenant admin access denied: billing not active"
            );
        }
        Ok(allowed)
    }

    pub fn cache(&self) -> &BillingStatusCache {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBillingStore;
    use crate::store::SubscriptionRecord;
    use clinicdesk_shared::{BillingCycle, SubscriptionTier};

    fn gate_with(store: Arc<InMemoryBillingStore>) -> AccessControlGate {
        AccessControlGate::new(store, BillingStatusCache::new())
    }

    #[tokio::test]
    async fn test_unknown_tenant_is_denied() {
        let gate = gate_with(Arc::new(InMemoryBillingStore::new()));
        let tenant = Uuid::new_v4();

        assert_eq!(
            gate.billing_status(tenant).await.unwrap(),
            BillingStatus::PendingPayment
        );
        assert!(!gate.has_active_billing(tenant).await.unwrap());
        assert!(!gate
            .can_access_tenant_admin(Uuid::new_v4(), tenant)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_tenant_without_subscription_is_pending_even_if_flagged_active() {
        let store = Arc::new(InMemoryBillingStore::new());
        let tenant = Uuid::new_v4();
        store.add_tenant(tenant);
        store.set_tenant_status(tenant, BillingStatus::Active);

        let gate = gate_with(store);
        assert!(!gate.has_active_billing(tenant).await.unwrap());
    }

    #[tokio::test]
    async fn test_active_tenant_is_allowed_and_cached() {
        let store = Arc::new(InMemoryBillingStore::new());
        let tenant = Uuid::new_v4();
        let mut record = SubscriptionRecord::new_pending(
            tenant,
            Some("I-ACTIVE".to_string()),
            SubscriptionTier::Basic,
            BillingCycle::Monthly,
            None,
        );
        record.status = clinicdesk_shared::SubscriptionStatus::Active;
        store.put_subscription(record);
        store.set_tenant_status(tenant, BillingStatus::Active);

        let gate = gate_with(store.clone());
        assert!(gate.has_active_billing(tenant).await.unwrap());
        assert_eq!(gate.cache().get(tenant).await, Some(BillingStatus::Active));

        // Out-of-band change without invalidation keeps serving the cached value
        store.set_tenant_status(tenant, BillingStatus::PastDue);
        assert!(gate.has_active_billing(tenant).await.unwrap());

        gate.cache().invalidate(tenant).await;
        assert!(!gate.has_active_billing(tenant).await.unwrap());
    }
}
