//! Plan change service
//!
//! Tenant-initiated upgrades, downgrades and cancellations plus the
//! operator-only manual override. Every operation validates first, then
//! calls the provider (if needed), then persists through the
//! [`SubscriptionWriter`]. A provider failure leaves local state untouched.
//!
//! Upgrades are two-phase: the request stores a pending tier and the tier
//! only becomes current when the provider confirms it by webhook.
//! Downgrades and deferred cancellations are applied by the reconciliation
//! job at the end of the paid period.

use std::sync::Arc;

use clinicdesk_shared::{BillingCycle, BillingStatus, SubscriptionStatus, SubscriptionTier};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::catalog::{PlanCatalog, PlanPrice};
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, AuditAction, AuditEntryBuilder};
use crate::provider::PaymentProvider;
use crate::store::SubscriptionRecord;
use crate::writer::{Change, SubscriptionWriter, WriteOutcome};

const DEFAULT_CANCEL_REASON: &str = "Cancelled by customer";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    /// Staff of one clinic
    TenantUser,
    /// Platform operator, may act on any tenant
    SaasManager,
}

/// Who is asking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActorContext {
    pub actor_id: Uuid,
    /// Home tenant; `None` for platform operators
    pub tenant_id: Option<Uuid>,
    pub role: ActorRole,
}

impl ActorContext {
    pub fn tenant_user(actor_id: Uuid, tenant_id: Uuid) -> Self {
        Self {
            actor_id,
            tenant_id: Some(tenant_id),
            role: ActorRole::TenantUser,
        }
    }

    pub fn saas_manager(actor_id: Uuid) -> Self {
        Self {
            actor_id,
            tenant_id: None,
            role: ActorRole::SaasManager,
        }
    }

    pub fn is_saas_manager(&self) -> bool {
        self.role == ActorRole::SaasManager
    }

    /// Tenant users may only act on their own tenant
    pub fn authorize(&self, tenant_id: Uuid) -> BillingResult<()> {
        if self.is_saas_manager() || self.tenant_id == Some(tenant_id) {
            return Ok(());
        }
        tracing::warn!(
            actor_id = %self.actor_id,
            tenant_id = %tenant_id,
            "Actor attempted to manage another tenant's billing"
        );
        Err(BillingError::Forbidden(
            "actor may not manage this tenant's billing".to_string(),
        ))
    }

    pub fn require_saas_manager(&self) -> BillingResult<()> {
        if self.is_saas_manager() {
            Ok(())
        } else {
            Err(BillingError::Forbidden(
                "operation requires a SaaS manager".to_string(),
            ))
        }
    }

    fn actor_type(&self) -> ActorType {
        match self.role {
            ActorRole::TenantUser => ActorType::User,
            ActorRole::SaasManager => ActorType::Admin,
        }
    }
}

/// Result of an upgrade request
#[derive(Debug, Clone, Serialize)]
pub struct UpgradeResult {
    /// Provider page where the tenant approves the new price
    pub approval_url: Option<String>,
    pub current_tier: SubscriptionTier,
    pub pending_tier: SubscriptionTier,
    pub billing_cycle: BillingCycle,
    pub price: PlanPrice,
}

/// A plan change or cancellation waiting for its effective date
#[derive(Debug, Clone, Serialize)]
pub struct ScheduledChange {
    pub current_tier: SubscriptionTier,
    pub new_tier: SubscriptionTier,
    pub billing_cycle: BillingCycle,
    #[serde(with = "time::serde::rfc3339")]
    pub effective_date: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancellationResult {
    pub immediate: bool,
    pub status: SubscriptionStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub effective_date: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentUpdateSession {
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Upgrade,
    Downgrade,
}

/// Checks shared by upgrade and downgrade, run before the provider call and
/// again against the freshest record inside the write
fn validate_plan_change(
    record: &SubscriptionRecord,
    target: SubscriptionTier,
    direction: Direction,
) -> BillingResult<()> {
    if record.status != SubscriptionStatus::Active {
        return Err(BillingError::InvalidStatus(format!(
            "plan changes require an ACTIVE subscription (current status {})",
            record.status
        )));
    }
    if let Some(pending) = record.pending_plan_tier {
        return Err(BillingError::Conflict(format!(
            "a change to {} is already pending",
            pending
        )));
    }
    if record.has_pending_cancellation() {
        return Err(BillingError::Conflict(
            "a cancellation is already scheduled".to_string(),
        ));
    }

    let valid = match direction {
        Direction::Upgrade => target.is_upgrade_from(record.plan_tier),
        Direction::Downgrade => target.is_downgrade_from(record.plan_tier),
    };
    if !valid {
        let verb = match direction {
            Direction::Upgrade => "upgrade",
            Direction::Downgrade => "downgrade",
        };
        return Err(BillingError::InvalidTier(format!(
            "cannot {} from {} to {}",
            verb, record.plan_tier, target
        )));
    }
    Ok(())
}

pub struct SubscriptionService {
    provider: Arc<dyn PaymentProvider>,
    writer: SubscriptionWriter,
    catalog: Arc<PlanCatalog>,
}

impl SubscriptionService {
    pub fn new(
        provider: Arc<dyn PaymentProvider>,
        writer: SubscriptionWriter,
        catalog: Arc<PlanCatalog>,
    ) -> Self {
        Self {
            provider,
            writer,
            catalog,
        }
    }

    pub fn catalog(&self) -> &PlanCatalog {
        &self.catalog
    }

    /// Most recent record for the tenant, including a cancelled one
    async fn current_record(&self, tenant_id: Uuid) -> BillingResult<SubscriptionRecord> {
        self.writer
            .store()
            .find_latest_subscription(tenant_id)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound(tenant_id.to_string()))
    }

    fn linked_provider_id(record: &SubscriptionRecord) -> BillingResult<&str> {
        record.provider_subscription_id.as_deref().ok_or_else(|| {
            BillingError::InvalidStatus(
                "subscription is not yet linked to the payment provider".to_string(),
            )
        })
    }

    fn catalog_plan(
        &self,
        tier: SubscriptionTier,
        cycle: BillingCycle,
    ) -> BillingResult<(String, PlanPrice)> {
        let entry = self.catalog.entry(tier, cycle).ok_or_else(|| {
            BillingError::InvalidTier(format!("{} is not offered with {} billing", tier, cycle))
        })?;
        Ok((
            entry.provider_plan_id.clone(),
            PlanPrice {
                amount_cents: entry.price_cents,
                currency: entry.currency.clone(),
            },
        ))
    }

    /// Create the tenant's record at signup, before the provider confirms it
    pub async fn register_pending_subscription(
        &self,
        actor: &ActorContext,
        tenant_id: Uuid,
        provider_subscription_id: Option<String>,
        tier: SubscriptionTier,
        cycle: BillingCycle,
    ) -> BillingResult<SubscriptionRecord> {
        actor.authorize(tenant_id)?;
        let (provider_plan_id, _) = self.catalog_plan(tier, cycle)?;

        let record = SubscriptionRecord::new_pending(
            tenant_id,
            provider_subscription_id,
            tier,
            cycle,
            Some(provider_plan_id),
        );
        self.writer
            .insert(&record, BillingStatus::PendingPayment)
            .await?;

        tracing::info!(
            tenant_id = %tenant_id,
            subscription_id = %record.id,
            tier = %tier,
            billing_cycle = %cycle,
            "Registered pending subscription"
        );
        Ok(record)
    }

    pub async fn get_subscription(
        &self,
        actor: &ActorContext,
        tenant_id: Uuid,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        actor.authorize(tenant_id)?;
        self.writer.store().find_latest_subscription(tenant_id).await
    }

    /// Request an upgrade. The tier becomes current only once the provider
    /// confirms the revised plan by webhook.
    pub async fn upgrade_plan(
        &self,
        actor: &ActorContext,
        tenant_id: Uuid,
        target: SubscriptionTier,
        cycle: BillingCycle,
    ) -> BillingResult<UpgradeResult> {
        actor.authorize(tenant_id)?;
        let (provider_plan_id, price) = self.catalog_plan(target, cycle)?;

        let record = self.current_record(tenant_id).await?;
        validate_plan_change(&record, target, Direction::Upgrade)?;
        let provider_subscription_id = Self::linked_provider_id(&record)?;

        let revised = self
            .provider
            .revise_subscription(provider_subscription_id, &provider_plan_id)
            .await
            .map_err(|e| {
                tracing::error!(
                    tenant_id = %tenant_id,
                    target_tier = %target,
                    error = %e,
                    "Provider rejected subscription revision"
                );
                BillingError::from(e)
            })?;

        let now = OffsetDateTime::now_utc();
        let outcome = self
            .writer
            .mutate(record.id, |current| {
                validate_plan_change(current, target, Direction::Upgrade)?;
                let mut next = current.clone();
                next.set_pending_plan(target, cycle, now);
                let audit = AuditEntryBuilder::new(tenant_id, AuditAction::UpgradeRequested)
                    .subscription(current.id)
                    .actor(actor.actor_id, actor.actor_type())
                    .before(current.audit_snapshot())
                    .after(next.audit_snapshot())
                    .build();
                Ok(Some(Change::new(next).with_audit(audit)))
            })
            .await
            .inspect_err(|e| {
                tracing::warn!(
                    tenant_id = %tenant_id,
                    error = %e,
                    "Upgrade approved by provider but could not be recorded locally"
                );
            })?;

        tracing::info!(
            tenant_id = %tenant_id,
            from_tier = %record.plan_tier,
            pending_tier = %target,
            billing_cycle = %cycle,
            "Upgrade requested, awaiting provider confirmation"
        );

        Ok(UpgradeResult {
            approval_url: revised.approval_url,
            current_tier: outcome.record().plan_tier,
            pending_tier: target,
            billing_cycle: cycle,
            price,
        })
    }

    /// Schedule a downgrade for the end of the paid period. No provider call.
    pub async fn downgrade_plan(
        &self,
        actor: &ActorContext,
        tenant_id: Uuid,
        target: SubscriptionTier,
        cycle: BillingCycle,
    ) -> BillingResult<ScheduledChange> {
        actor.authorize(tenant_id)?;
        self.catalog_plan(target, cycle)?;

        let record = self.current_record(tenant_id).await?;
        validate_plan_change(&record, target, Direction::Downgrade)?;

        let now = OffsetDateTime::now_utc();
        let outcome = self
            .writer
            .mutate(record.id, |current| {
                validate_plan_change(current, target, Direction::Downgrade)?;
                let effective = current.renewal_date.unwrap_or(now);
                let mut next = current.clone();
                next.set_pending_plan(target, cycle, effective);
                let audit = AuditEntryBuilder::new(tenant_id, AuditAction::DowngradeScheduled)
                    .subscription(current.id)
                    .actor(actor.actor_id, actor.actor_type())
                    .before(current.audit_snapshot())
                    .after(next.audit_snapshot())
                    .build();
                Ok(Some(Change::new(next).with_audit(audit)))
            })
            .await?;

        let stored = outcome.into_record();
        let effective_date = stored.pending_plan_effective_date.unwrap_or(now);

        tracing::info!(
            tenant_id = %tenant_id,
            current_tier = %stored.plan_tier,
            new_tier = %target,
            effective_date = %effective_date,
            "Scheduled subscription downgrade for period end"
        );

        Ok(ScheduledChange {
            current_tier: stored.plan_tier,
            new_tier: target,
            billing_cycle: cycle,
            effective_date,
        })
    }

    /// Cancel now (provider first, then local state) or at period end
    pub async fn cancel_subscription(
        &self,
        actor: &ActorContext,
        tenant_id: Uuid,
        immediate: bool,
        reason: Option<String>,
    ) -> BillingResult<CancellationResult> {
        actor.authorize(tenant_id)?;
        let record = self.current_record(tenant_id).await?;
        Self::validate_cancellation(&record, immediate)?;

        let now = OffsetDateTime::now_utc();

        if immediate {
            if let Some(provider_subscription_id) = record.provider_subscription_id.as_deref() {
                let provider_reason = reason.as_deref().unwrap_or(DEFAULT_CANCEL_REASON);
                self.provider
                    .cancel_subscription(provider_subscription_id, provider_reason)
                    .await?;
            }

            let outcome = self
                .writer
                .mutate(record.id, |current| {
                    if current.status.is_terminal() {
                        // The provider's webhook got here first
                        return Ok(None);
                    }
                    let mut next = current.clone();
                    next.schedule_cancellation(now, now, reason.clone());
                    next.mark_cancelled(now);
                    let audit =
                        AuditEntryBuilder::new(tenant_id, AuditAction::CancellationApplied)
                            .subscription(current.id)
                            .actor(actor.actor_id, actor.actor_type())
                            .before(current.audit_snapshot())
                            .after(next.audit_snapshot())
                            .reason_opt(reason.clone())
                            .build();
                    Ok(Some(
                        Change::new(next)
                            .with_derived_tenant_status()
                            .with_audit(audit),
                    ))
                })
                .await?;

            let stored = outcome.into_record();
            tracing::info!(
                tenant_id = %tenant_id,
                subscription_id = %stored.id,
                "Subscription cancelled immediately"
            );

            return Ok(CancellationResult {
                immediate: true,
                status: stored.status,
                effective_date: stored.cancellation_effective_date.unwrap_or(now),
            });
        }

        let outcome = self
            .writer
            .mutate(record.id, |current| {
                Self::validate_cancellation(current, false)?;
                let effective = current.renewal_date.unwrap_or(now);
                let mut next = current.clone();
                next.schedule_cancellation(now, effective, reason.clone());
                let audit = AuditEntryBuilder::new(tenant_id, AuditAction::CancellationRequested)
                    .subscription(current.id)
                    .actor(actor.actor_id, actor.actor_type())
                    .before(current.audit_snapshot())
                    .after(next.audit_snapshot())
                    .reason_opt(reason.clone())
                    .build();
                Ok(Some(Change::new(next).with_audit(audit)))
            })
            .await?;

        let stored = outcome.into_record();
        let effective_date = stored.cancellation_effective_date.unwrap_or(now);
        tracing::info!(
            tenant_id = %tenant_id,
            subscription_id = %stored.id,
            effective_date = %effective_date,
            "Subscription cancellation scheduled for period end"
        );

        Ok(CancellationResult {
            immediate: false,
            status: stored.status,
            effective_date,
        })
    }

    fn validate_cancellation(record: &SubscriptionRecord, immediate: bool) -> BillingResult<()> {
        if record.status.is_terminal() {
            return Err(BillingError::InvalidStatus(
                "subscription is already cancelled".to_string(),
            ));
        }
        if record.has_pending_cancellation() {
            return Err(BillingError::Conflict(
                "a cancellation is already scheduled".to_string(),
            ));
        }
        if immediate {
            // Cancelling now drops any pending plan change with it
            return Ok(());
        }
        if let Some(pending) = record.pending_plan_tier {
            return Err(BillingError::Conflict(format!(
                "a change to {} is pending; clear it before scheduling a cancellation",
                pending
            )));
        }
        if record.status != SubscriptionStatus::Active {
            return Err(BillingError::InvalidStatus(format!(
                "end-of-period cancellation requires an ACTIVE subscription (current status {})",
                record.status
            )));
        }
        Ok(())
    }

    /// Drop a pending plan change or a scheduled cancellation
    pub async fn clear_scheduled_change(
        &self,
        actor: &ActorContext,
        tenant_id: Uuid,
    ) -> BillingResult<SubscriptionRecord> {
        actor.authorize(tenant_id)?;
        let record = self.current_record(tenant_id).await?;

        let outcome = self
            .writer
            .mutate(record.id, |current| {
                if current.status.is_terminal() {
                    return Err(BillingError::InvalidStatus(
                        "subscription is already cancelled".to_string(),
                    ));
                }
                if !current.has_pending_plan_change() && !current.has_pending_cancellation() {
                    return Err(BillingError::InvalidStatus(
                        "no scheduled change to clear".to_string(),
                    ));
                }
                let mut next = current.clone();
                next.clear_pending_plan();
                next.clear_cancellation();
                let audit = AuditEntryBuilder::new(tenant_id, AuditAction::ScheduledChangeCleared)
                    .subscription(current.id)
                    .actor(actor.actor_id, actor.actor_type())
                    .before(current.audit_snapshot())
                    .after(next.audit_snapshot())
                    .build();
                Ok(Some(Change::new(next).with_audit(audit)))
            })
            .await?;

        tracing::info!(tenant_id = %tenant_id, "Cleared scheduled subscription change");
        Ok(outcome.into_record())
    }

    /// Provider-hosted page for updating the payment method
    pub async fn create_payment_update_session(
        &self,
        actor: &ActorContext,
        tenant_id: Uuid,
    ) -> BillingResult<PaymentUpdateSession> {
        actor.authorize(tenant_id)?;
        let record = self.current_record(tenant_id).await?;

        if !matches!(
            record.status,
            SubscriptionStatus::Active | SubscriptionStatus::Suspended
        ) {
            return Err(BillingError::InvalidStatus(format!(
                "payment method can only be updated on an ACTIVE or SUSPENDED subscription (current status {})",
                record.status
            )));
        }
        let provider_subscription_id = Self::linked_provider_id(&record)?;

        let url = self
            .provider
            .billing_portal_url(provider_subscription_id)
            .await?;
        Ok(PaymentUpdateSession { url })
    }

    /// Operator-only: set the tier immediately without the provider
    pub async fn manual_plan_override(
        &self,
        actor: &ActorContext,
        tenant_id: Uuid,
        target: SubscriptionTier,
        cycle: Option<BillingCycle>,
        reason: &str,
    ) -> BillingResult<SubscriptionRecord> {
        actor.require_saas_manager()?;
        if reason.trim().is_empty() {
            return Err(BillingError::Validation(
                "a reason is required for a manual override".to_string(),
            ));
        }

        let record = self.current_record(tenant_id).await?;
        if record.status.is_terminal() {
            return Err(BillingError::InvalidStatus(
                "cannot override the plan of a cancelled subscription".to_string(),
            ));
        }

        let outcome = self
            .writer
            .mutate(record.id, |current| {
                if current.status.is_terminal() {
                    return Err(BillingError::InvalidStatus(
                        "cannot override the plan of a cancelled subscription".to_string(),
                    ));
                }
                let cycle = cycle.unwrap_or(current.billing_cycle);
                let mut next = current.clone();
                next.clear_pending_plan();
                next.plan_tier = target;
                next.billing_cycle = cycle;
                // Overrides may target tiers the catalog does not sell
                next.provider_plan_id = self
                    .catalog
                    .provider_plan_id(target, cycle)
                    .map(str::to_string);
                if next == *current {
                    return Ok(None);
                }
                let audit = AuditEntryBuilder::new(tenant_id, AuditAction::ManualOverride)
                    .subscription(current.id)
                    .actor(actor.actor_id, actor.actor_type())
                    .before(current.audit_snapshot())
                    .after(next.audit_snapshot())
                    .reason(reason)
                    .build();
                Ok(Some(Change::new(next).with_audit(audit)))
            })
            .await?;

        if let WriteOutcome::Applied(stored) = &outcome {
            tracing::info!(
                tenant_id = %tenant_id,
                actor_id = %actor.actor_id,
                from_tier = %record.plan_tier,
                to_tier = %stored.plan_tier,
                reason = %reason,
                "Manual plan override applied"
            );
        }
        Ok(outcome.into_record())
    }

    /// Pull renewal date, plan id and payment mask from the provider.
    /// Status stays webhook-driven.
    pub async fn refresh_from_provider(
        &self,
        actor: &ActorContext,
        tenant_id: Uuid,
    ) -> BillingResult<SubscriptionRecord> {
        actor.authorize(tenant_id)?;
        let record = self.current_record(tenant_id).await?;
        let provider_subscription_id = Self::linked_provider_id(&record)?;

        let remote = self
            .provider
            .get_subscription(provider_subscription_id)
            .await?;

        if !remote.status.eq_ignore_ascii_case(record.status.as_str()) {
            tracing::info!(
                tenant_id = %tenant_id,
                local_status = %record.status,
                provider_status = %remote.status,
                "Provider status differs from local record; waiting for webhook"
            );
        }

        let outcome = self
            .writer
            .mutate(record.id, |current| {
                let mut next = current.clone();
                if let Some(renewal) = remote.next_billing_time {
                    next.renewal_date = Some(renewal);
                }
                if let Some(mask) = &remote.payment_method_mask {
                    next.payment_method_mask = Some(mask.clone());
                }
                if let Some(plan_id) = &remote.plan_id {
                    next.provider_plan_id = Some(plan_id.clone());
                }
                if next == *current {
                    Ok(None)
                } else {
                    Ok(Some(Change::new(next)))
                }
            })
            .await?;

        Ok(outcome.into_record())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogEntry;
    use crate::memory::InMemoryBillingStore;
    use crate::provider::mock::{MockProvider, ProviderCall};
    use crate::provider::{ProviderError, ProviderSubscription};
    use crate::BillingStatusCache;

    struct Fixture {
        store: Arc<InMemoryBillingStore>,
        provider: Arc<MockProvider>,
        service: SubscriptionService,
        tenant_id: Uuid,
        actor: ActorContext,
    }

    fn catalog() -> PlanCatalog {
        let entry = |tier, cycle, id: &str, cents| CatalogEntry {
            tier,
            billing_cycle: cycle,
            provider_plan_id: id.to_string(),
            price_cents: cents,
            currency: "USD".to_string(),
        };
        PlanCatalog::from_entries(vec![
            entry(SubscriptionTier::Basic, BillingCycle::Monthly, "P-BASIC-M", 4900),
            entry(SubscriptionTier::Professional, BillingCycle::Monthly, "P-PRO-M", 9900),
            entry(SubscriptionTier::Enterprise, BillingCycle::Monthly, "P-ENT-M", 24900),
        ])
        .unwrap()
    }

    fn fixture(tier: SubscriptionTier, status: SubscriptionStatus) -> (Fixture, SubscriptionRecord) {
        let store = Arc::new(InMemoryBillingStore::new());
        let provider = Arc::new(MockProvider::new());
        let writer = SubscriptionWriter::new(store.clone(), BillingStatusCache::new());
        let service = SubscriptionService::new(provider.clone(), writer, Arc::new(catalog()));

        let tenant_id = Uuid::new_v4();
        let mut record = SubscriptionRecord::new_pending(
            tenant_id,
            Some("I-SUB".to_string()),
            tier,
            BillingCycle::Monthly,
            None,
        );
        record.status = status;
        record.renewal_date = Some(OffsetDateTime::now_utc() + time::Duration::days(20));
        store.put_subscription(record.clone());
        store.set_tenant_status(tenant_id, BillingStatus::for_subscription(status));

        let actor = ActorContext::tenant_user(Uuid::new_v4(), tenant_id);
        (
            Fixture {
                store,
                provider,
                service,
                tenant_id,
                actor,
            },
            record,
        )
    }

    #[tokio::test]
    async fn test_upgrade_sets_pending_and_returns_approval_url() {
        let (f, record) = fixture(SubscriptionTier::Basic, SubscriptionStatus::Active);

        let result = f
            .service
            .upgrade_plan(&f.actor, f.tenant_id, SubscriptionTier::Professional, BillingCycle::Monthly)
            .await
            .unwrap();

        assert!(result.approval_url.is_some());
        assert_eq!(result.price.amount_cents, 9900);
        assert_eq!(result.current_tier, SubscriptionTier::Basic);

        let stored = f.store.subscription(record.id).unwrap();
        assert_eq!(stored.plan_tier, SubscriptionTier::Basic);
        assert_eq!(stored.pending_plan_tier, Some(SubscriptionTier::Professional));
        assert!(stored.pending_plan_effective_date.is_some());
        assert_eq!(
            f.provider.outbound_calls(),
            vec![ProviderCall::Revise {
                subscription_id: "I-SUB".to_string(),
                plan_id: "P-PRO-M".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_upgrade_to_same_or_lower_tier_is_invalid() {
        let (f, _) = fixture(SubscriptionTier::Professional, SubscriptionStatus::Active);

        for target in [SubscriptionTier::Professional, SubscriptionTier::Basic] {
            let err = f
                .service
                .upgrade_plan(&f.actor, f.tenant_id, target, BillingCycle::Monthly)
                .await
                .unwrap_err();
            assert!(matches!(err, BillingError::InvalidTier(_)), "{:?}", err);
        }
        assert!(f.provider.outbound_calls().is_empty());
    }

    #[tokio::test]
    async fn test_upgrade_to_tier_missing_from_catalog_is_invalid() {
        let (f, _) = fixture(SubscriptionTier::Basic, SubscriptionStatus::Active);

        let err = f
            .service
            .upgrade_plan(&f.actor, f.tenant_id, SubscriptionTier::Enterprise, BillingCycle::Yearly)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidTier(_)));
    }

    #[tokio::test]
    async fn test_upgrade_requires_active_status() {
        let (f, _) = fixture(SubscriptionTier::Basic, SubscriptionStatus::Suspended);

        let err = f
            .service
            .upgrade_plan(&f.actor, f.tenant_id, SubscriptionTier::Professional, BillingCycle::Monthly)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidStatus(_)));
    }

    #[tokio::test]
    async fn test_provider_failure_leaves_record_untouched() {
        let (f, record) = fixture(SubscriptionTier::Basic, SubscriptionStatus::Active);
        f.provider.fail_next(ProviderError::Api {
            status: 503,
            message: "unavailable".to_string(),
        });

        let err = f
            .service
            .upgrade_plan(&f.actor, f.tenant_id, SubscriptionTier::Professional, BillingCycle::Monthly)
            .await
            .unwrap_err();

        assert!(matches!(err, BillingError::Provider { retryable: true, .. }));
        assert_eq!(f.store.subscription(record.id).unwrap(), record);
        assert!(f.store.audit_entries().is_empty());
    }

    #[tokio::test]
    async fn test_downgrade_is_scheduled_for_renewal_without_provider_call() {
        let (f, record) = fixture(SubscriptionTier::Enterprise, SubscriptionStatus::Active);

        let scheduled = f
            .service
            .downgrade_plan(&f.actor, f.tenant_id, SubscriptionTier::Basic, BillingCycle::Monthly)
            .await
            .unwrap();

        assert_eq!(Some(scheduled.effective_date), record.renewal_date);
        assert_eq!(scheduled.current_tier, SubscriptionTier::Enterprise);
        let stored = f.store.subscription(record.id).unwrap();
        assert_eq!(stored.plan_tier, SubscriptionTier::Enterprise);
        assert_eq!(stored.pending_plan_tier, Some(SubscriptionTier::Basic));
        assert!(f.provider.outbound_calls().is_empty());
    }

    #[tokio::test]
    async fn test_downgrade_without_renewal_date_is_due_now() {
        let (f, record) = fixture(SubscriptionTier::Professional, SubscriptionStatus::Active);
        let mut unknown = record.clone();
        unknown.renewal_date = None;
        f.store.put_subscription(unknown);

        let before = OffsetDateTime::now_utc();
        let scheduled = f
            .service
            .downgrade_plan(&f.actor, f.tenant_id, SubscriptionTier::Basic, BillingCycle::Monthly)
            .await
            .unwrap();
        assert!(scheduled.effective_date >= before);
        assert!(scheduled.effective_date <= OffsetDateTime::now_utc());
    }

    #[tokio::test]
    async fn test_pending_change_and_cancellation_are_exclusive() {
        let (f, record) = fixture(SubscriptionTier::Enterprise, SubscriptionStatus::Active);

        f.service
            .downgrade_plan(&f.actor, f.tenant_id, SubscriptionTier::Professional, BillingCycle::Monthly)
            .await
            .unwrap();

        let err = f
            .service
            .cancel_subscription(&f.actor, f.tenant_id, false, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Conflict(_)));

        let err = f
            .service
            .downgrade_plan(&f.actor, f.tenant_id, SubscriptionTier::Basic, BillingCycle::Monthly)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Conflict(_)));

        let stored = f.store.subscription(record.id).unwrap();
        assert_eq!(stored.pending_plan_tier, Some(SubscriptionTier::Professional));
        assert!(stored.cancellation_date.is_none());
    }

    #[tokio::test]
    async fn test_immediate_cancel_calls_provider_then_cancels_locally() {
        let (f, record) = fixture(SubscriptionTier::Basic, SubscriptionStatus::Active);

        let result = f
            .service
            .cancel_subscription(&f.actor, f.tenant_id, true, Some("closing".to_string()))
            .await
            .unwrap();

        assert!(result.immediate);
        assert_eq!(result.status, SubscriptionStatus::Cancelled);
        let stored = f.store.subscription(record.id).unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Cancelled);
        assert_eq!(stored.cancellation_reason.as_deref(), Some("closing"));
        assert_eq!(f.store.tenant_status(f.tenant_id), Some(BillingStatus::Canceled));
        assert_eq!(
            f.provider.outbound_calls(),
            vec![ProviderCall::Cancel {
                subscription_id: "I-SUB".to_string(),
                reason: "closing".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_immediate_cancel_provider_failure_keeps_subscription_active() {
        let (f, record) = fixture(SubscriptionTier::Basic, SubscriptionStatus::Active);
        f.provider.fail_next(ProviderError::Api {
            status: 422,
            message: "SUBSCRIPTION_STATUS_INVALID".to_string(),
        });

        let err = f
            .service
            .cancel_subscription(&f.actor, f.tenant_id, true, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Provider { retryable: false, .. }));
        assert_eq!(
            f.store.subscription(record.id).unwrap().status,
            SubscriptionStatus::Active
        );
        assert_eq!(f.store.tenant_status(f.tenant_id), Some(BillingStatus::Active));
    }

    #[tokio::test]
    async fn test_immediate_cancel_drops_abandoned_upgrade() {
        let (f, record) = fixture(SubscriptionTier::Basic, SubscriptionStatus::Active);
        f.service
            .upgrade_plan(&f.actor, f.tenant_id, SubscriptionTier::Professional, BillingCycle::Monthly)
            .await
            .unwrap();

        let result = f
            .service
            .cancel_subscription(&f.actor, f.tenant_id, true, None)
            .await
            .unwrap();

        assert_eq!(result.status, SubscriptionStatus::Cancelled);
        let stored = f.store.subscription(record.id).unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Cancelled);
        assert_eq!(stored.plan_tier, SubscriptionTier::Basic);
        assert!(stored.pending_plan_tier.is_none());
        assert!(stored.pending_plan_effective_date.is_none());
        assert_eq!(f.store.tenant_status(f.tenant_id), Some(BillingStatus::Canceled));
    }

    #[tokio::test]
    async fn test_deferred_cancel_keeps_access_until_renewal() {
        let (f, record) = fixture(SubscriptionTier::Basic, SubscriptionStatus::Active);

        let result = f
            .service
            .cancel_subscription(&f.actor, f.tenant_id, false, None)
            .await
            .unwrap();

        assert!(!result.immediate);
        assert_eq!(result.status, SubscriptionStatus::Active);
        assert_eq!(Some(result.effective_date), record.renewal_date);
        assert_eq!(f.store.tenant_status(f.tenant_id), Some(BillingStatus::Active));

        let err = f
            .service
            .cancel_subscription(&f.actor, f.tenant_id, false, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_clear_scheduled_change() {
        let (f, record) = fixture(SubscriptionTier::Professional, SubscriptionStatus::Active);
        f.service
            .cancel_subscription(&f.actor, f.tenant_id, false, Some("too pricey".to_string()))
            .await
            .unwrap();

        let cleared = f
            .service
            .clear_scheduled_change(&f.actor, f.tenant_id)
            .await
            .unwrap();
        assert!(!cleared.has_pending_cancellation());
        assert!(cleared.cancellation_reason.is_none());

        let err = f
            .service
            .clear_scheduled_change(&f.actor, f.tenant_id)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidStatus(_)));
        assert_eq!(
            f.store.subscription(record.id).unwrap().version,
            record.version + 2
        );
    }

    #[tokio::test]
    async fn test_manual_override_requires_saas_manager() {
        let (f, _) = fixture(SubscriptionTier::Basic, SubscriptionStatus::Active);

        let err = f
            .service
            .manual_plan_override(&f.actor, f.tenant_id, SubscriptionTier::Custom, None, "deal")
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_manual_override_clears_pending_and_audits() {
        let (f, record) = fixture(SubscriptionTier::Enterprise, SubscriptionStatus::Active);
        f.service
            .downgrade_plan(&f.actor, f.tenant_id, SubscriptionTier::Basic, BillingCycle::Monthly)
            .await
            .unwrap();

        let manager = ActorContext::saas_manager(Uuid::new_v4());
        let stored = f
            .service
            .manual_plan_override(
                &manager,
                f.tenant_id,
                SubscriptionTier::Custom,
                None,
                "negotiated contract",
            )
            .await
            .unwrap();

        assert_eq!(stored.plan_tier, SubscriptionTier::Custom);
        assert!(!stored.has_pending_plan_change());
        assert_eq!(stored.id, record.id);
        assert!(f.provider.outbound_calls().is_empty());

        let audit = f.store.audit_entries();
        let last = audit.last().unwrap();
        assert_eq!(last.action, AuditAction::ManualOverride);
        assert_eq!(last.actor_id, Some(manager.actor_id));
        assert_eq!(last.actor_type, ActorType::Admin);
        assert_eq!(last.reason.as_deref(), Some("negotiated contract"));
        assert_eq!(last.before_value["plan_tier"], "ENTERPRISE");
        assert_eq!(last.after_value["plan_tier"], "CUSTOM");
    }

    #[tokio::test]
    async fn test_manual_override_keeps_provider_plan_in_step_with_tier() {
        let (f, record) = fixture(SubscriptionTier::Enterprise, SubscriptionStatus::Active);
        let mut linked = record.clone();
        linked.provider_plan_id = Some("P-ENT-M".to_string());
        f.store.put_subscription(linked);
        let manager = ActorContext::saas_manager(Uuid::new_v4());

        let custom = f
            .service
            .manual_plan_override(&manager, f.tenant_id, SubscriptionTier::Custom, None, "pilot")
            .await
            .unwrap();
        assert_eq!(custom.plan_tier, SubscriptionTier::Custom);
        assert!(custom.provider_plan_id.is_none());

        let basic = f
            .service
            .manual_plan_override(&manager, f.tenant_id, SubscriptionTier::Basic, None, "pilot over")
            .await
            .unwrap();
        assert_eq!(basic.provider_plan_id.as_deref(), Some("P-BASIC-M"));
    }

    #[tokio::test]
    async fn test_manual_override_rejects_blank_reason() {
        let (f, _) = fixture(SubscriptionTier::Basic, SubscriptionStatus::Active);
        let manager = ActorContext::saas_manager(Uuid::new_v4());
        let err = f
            .service
            .manual_plan_override(&manager, f.tenant_id, SubscriptionTier::Custom, None, "  ")
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
    }

    #[tokio::test]
    async fn test_tenant_user_cannot_touch_other_tenant() {
        let (f, _) = fixture(SubscriptionTier::Basic, SubscriptionStatus::Active);
        let stranger = ActorContext::tenant_user(Uuid::new_v4(), Uuid::new_v4());

        let err = f
            .service
            .cancel_subscription(&stranger, f.tenant_id, true, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Forbidden(_)));
        assert!(f.provider.outbound_calls().is_empty());
    }

    #[tokio::test]
    async fn test_payment_update_session_requires_active_or_suspended() {
        let (f, _) = fixture(SubscriptionTier::Basic, SubscriptionStatus::Suspended);
        let session = f
            .service
            .create_payment_update_session(&f.actor, f.tenant_id)
            .await
            .unwrap();
        assert!(session.url.contains("I-SUB"));

        let (f, _) = fixture(SubscriptionTier::Basic, SubscriptionStatus::ApprovalPending);
        let err = f
            .service
            .create_payment_update_session(&f.actor, f.tenant_id)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidStatus(_)));
    }

    #[tokio::test]
    async fn test_register_pending_subscription_rejects_second_open_record() {
        let store = Arc::new(InMemoryBillingStore::new());
        let writer = SubscriptionWriter::new(store.clone(), BillingStatusCache::new());
        let service =
            SubscriptionService::new(Arc::new(MockProvider::new()), writer, Arc::new(catalog()));
        let tenant_id = Uuid::new_v4();
        store.add_tenant(tenant_id);
        let actor = ActorContext::tenant_user(Uuid::new_v4(), tenant_id);

        let record = service
            .register_pending_subscription(
                &actor,
                tenant_id,
                None,
                SubscriptionTier::Basic,
                BillingCycle::Monthly,
            )
            .await
            .unwrap();
        assert_eq!(record.status, SubscriptionStatus::ApprovalPending);
        assert_eq!(record.provider_plan_id.as_deref(), Some("P-BASIC-M"));
        assert_eq!(
            store.tenant_status(tenant_id),
            Some(BillingStatus::PendingPayment)
        );

        let err = service
            .register_pending_subscription(
                &actor,
                tenant_id,
                None,
                SubscriptionTier::Professional,
                BillingCycle::Monthly,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_refresh_from_provider_updates_display_fields_only() {
        let (f, record) = fixture(SubscriptionTier::Basic, SubscriptionStatus::Active);
        let renewal = OffsetDateTime::now_utc() + time::Duration::days(31);
        f.provider.set_subscription(ProviderSubscription {
            id: "I-SUB".to_string(),
            status: "SUSPENDED".to_string(),
            plan_id: Some("P-BASIC-M".to_string()),
            next_billing_time: Some(renewal),
            payment_method_mask: Some("VISA ****4242".to_string()),
        });

        let refreshed = f
            .service
            .refresh_from_provider(&f.actor, f.tenant_id)
            .await
            .unwrap();

        assert_eq!(refreshed.renewal_date, Some(renewal));
        assert_eq!(refreshed.payment_method_mask.as_deref(), Some("VISA ****4242"));
        assert_eq!(refreshed.status, SubscriptionStatus::Active);
        assert_eq!(refreshed.version, record.version + 1);
    }
}
