//! Reconciliation job
//!
//! Applies time-deferred transitions without waiting for a webhook: pending
//! downgrades whose effective date has passed and end-of-period
//! cancellations. Every transition goes through [`SubscriptionWriter`], so
//! a webhook that commits the same change first turns ours into a no-op.
//! The provider is never called from here, so a provider outage cannot hold
//! back a transition whose effective time has passed.

use std::sync::Arc;

use clinicdesk_shared::SubscriptionStatus;
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::catalog::PlanCatalog;
use crate::error::BillingResult;
use crate::events::{AuditAction, AuditEntryBuilder};
use crate::store::SubscriptionRecord;
use crate::writer::{Change, SubscriptionWriter};

/// Counts from one reconciliation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub plan_changes_applied: u32,
    pub cancellations_applied: u32,
    /// Due when listed but already handled by another writer, or an upgrade
    /// still waiting for provider confirmation
    pub skipped: u32,
    pub errors: u32,
}

impl ReconcileSummary {
    pub fn applied(&self) -> u32 {
        self.plan_changes_applied + self.cancellations_applied
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    PlanChange,
    Cancellation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Applied {
    Yes,
    NoOp,
}

fn due_transition(record: &SubscriptionRecord, now: OffsetDateTime) -> Option<Transition> {
    if record.status.is_terminal() {
        return None;
    }
    if record
        .pending_plan_effective_date
        .is_some_and(|effective| effective <= now)
    {
        return Some(Transition::PlanChange);
    }
    if record.status == SubscriptionStatus::Active
        && record
            .cancellation_effective_date
            .is_some_and(|effective| effective <= now)
    {
        return Some(Transition::Cancellation);
    }
    None
}

/// Pending upgrades are committed by the provider's confirming webhook only
fn is_pending_upgrade(record: &SubscriptionRecord) -> bool {
    record
        .pending_plan_tier
        .is_some_and(|pending| pending.is_upgrade_from(record.plan_tier))
}

pub struct ReconciliationJob {
    writer: SubscriptionWriter,
    catalog: Arc<PlanCatalog>,
}

impl ReconciliationJob {
    pub fn new(writer: SubscriptionWriter, catalog: Arc<PlanCatalog>) -> Self {
        Self { writer, catalog }
    }

    /// One sweep over every record with a transition due at `now`.
    ///
    /// Storage failures on individual records are logged and counted; the
    /// record is left as it was and picked up again on the next pass.
    pub async fn run_once(&self, now: OffsetDateTime) -> BillingResult<ReconcileSummary> {
        let due = self.writer.store().list_due_transitions(now).await?;
        let mut summary = ReconcileSummary::default();

        tracing::debug!(candidates = due.len(), "Starting reconciliation pass");

        for record in due {
            let Some(transition) = due_transition(&record, now) else {
                summary.skipped += 1;
                continue;
            };

            if transition == Transition::PlanChange && is_pending_upgrade(&record) {
                tracing::debug!(
                    subscription_id = %record.id,
                    tenant_id = %record.tenant_id,
                    "Pending upgrade still awaiting provider confirmation"
                );
                summary.skipped += 1;
                continue;
            }

            let result = match transition {
                Transition::PlanChange => self.apply_plan_change(&record, now).await,
                Transition::Cancellation => self.apply_cancellation(&record, now).await,
            };

            match (transition, result) {
                (Transition::PlanChange, Ok(Applied::Yes)) => summary.plan_changes_applied += 1,
                (Transition::Cancellation, Ok(Applied::Yes)) => {
                    summary.cancellations_applied += 1
                }
                (_, Ok(Applied::NoOp)) => summary.skipped += 1,
                (_, Err(e)) => {
                    tracing::error!(
                        subscription_id = %record.id,
                        tenant_id = %record.tenant_id,
                        transition = ?transition,
                        error = %e,
                        "Failed to apply scheduled subscription transition"
                    );
                    summary.errors += 1;
                }
            }
        }

        if summary.applied() > 0 || summary.errors > 0 {
            tracing::info!(
                plan_changes_applied = summary.plan_changes_applied,
                cancellations_applied = summary.cancellations_applied,
                skipped = summary.skipped,
                errors = summary.errors,
                "Reconciliation pass complete"
            );
        }

        Ok(summary)
    }

    async fn apply_plan_change(
        &self,
        record: &SubscriptionRecord,
        now: OffsetDateTime,
    ) -> BillingResult<Applied> {
        let (Some(target), Some(cycle)) = (record.pending_plan_tier, record.pending_billing_cycle)
        else {
            return Ok(Applied::NoOp);
        };
        let provider_plan_id = self
            .catalog
            .provider_plan_id(target, cycle)
            .map(str::to_string);

        let outcome = self
            .writer
            .mutate(record.id, |current| {
                // Another writer already applied or cleared it
                if current.status.is_terminal()
                    || current.pending_plan_tier != Some(target)
                    || !current
                        .pending_plan_effective_date
                        .is_some_and(|effective| effective <= now)
                {
                    return Ok(None);
                }

                let mut next = current.clone();
                let Some((from, to)) = next.commit_pending_plan() else {
                    return Ok(None);
                };
                if let Some(plan_id) = &provider_plan_id {
                    next.provider_plan_id = Some(plan_id.clone());
                }
                let action = if to.is_upgrade_from(from) {
                    AuditAction::UpgradeCommitted
                } else {
                    AuditAction::DowngradeApplied
                };
                let audit = AuditEntryBuilder::new(current.tenant_id, action)
                    .subscription(current.id)
                    .before(current.audit_snapshot())
                    .after(next.audit_snapshot())
                    .build();
                Ok(Some(Change::new(next).with_audit(audit)))
            })
            .await?;

        if outcome.is_applied() {
            tracing::info!(
                subscription_id = %record.id,
                tenant_id = %record.tenant_id,
                from_tier = %record.plan_tier,
                to_tier = %target,
                "Applied scheduled plan change"
            );
            Ok(Applied::Yes)
        } else {
            Ok(Applied::NoOp)
        }
    }

    async fn apply_cancellation(
        &self,
        record: &SubscriptionRecord,
        now: OffsetDateTime,
    ) -> BillingResult<Applied> {
        let outcome = self
            .writer
            .mutate(record.id, |current| {
                if current.status != SubscriptionStatus::Active
                    || !current
                        .cancellation_effective_date
                        .is_some_and(|effective| effective <= now)
                {
                    return Ok(None);
                }

                let mut next = current.clone();
                next.mark_cancelled(now);
                let audit =
                    AuditEntryBuilder::new(current.tenant_id, AuditAction::CancellationApplied)
                        .subscription(current.id)
                        .before(current.audit_snapshot())
                        .after(next.audit_snapshot())
                        .reason_opt(current.cancellation_reason.clone())
                        .build();
                Ok(Some(
                    Change::new(next)
                        .with_derived_tenant_status()
                        .with_audit(audit),
                ))
            })
            .await?;

        if outcome.is_applied() {
            tracing::info!(
                subscription_id = %record.id,
                tenant_id = %record.tenant_id,
                "Applied scheduled cancellation"
            );
            Ok(Applied::Yes)
        } else {
            Ok(Applied::NoOp)
        }
    }

    /// Ids of records that would be touched by a pass at `now`
    pub async fn preview(&self, now: OffsetDateTime) -> BillingResult<Vec<Uuid>> {
        Ok(self
            .writer
            .store()
            .list_due_transitions(now)
            .await?
            .into_iter()
            .filter(|r| due_transition(r, now).is_some() && !is_pending_upgrade(r))
            .map(|r| r.id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogEntry;
    use crate::memory::InMemoryBillingStore;
    use crate::provider::mock::MockProvider;
    use crate::provider::ProviderError;
    use crate::BillingStatusCache;
    use clinicdesk_shared::{BillingCycle, BillingStatus, SubscriptionTier};

    fn catalog() -> PlanCatalog {
        PlanCatalog::from_entries(vec![
            CatalogEntry {
                tier: SubscriptionTier::Basic,
                billing_cycle: BillingCycle::Monthly,
                provider_plan_id: "P-BASIC-M".to_string(),
                price_cents: 4900,
                currency: "USD".to_string(),
            },
            CatalogEntry {
                tier: SubscriptionTier::Enterprise,
                billing_cycle: BillingCycle::Monthly,
                provider_plan_id: "P-ENT-M".to_string(),
                price_cents: 24900,
                currency: "USD".to_string(),
            },
        ])
        .unwrap()
    }

    fn setup() -> (Arc<InMemoryBillingStore>, Arc<MockProvider>, ReconciliationJob) {
        let store = Arc::new(InMemoryBillingStore::new());
        let provider = Arc::new(MockProvider::new());
        let writer = SubscriptionWriter::new(store.clone(), BillingStatusCache::new());
        let job = ReconciliationJob::new(writer, Arc::new(catalog()));
        (store, provider, job)
    }

    fn active(tier: SubscriptionTier) -> SubscriptionRecord {
        let mut record = SubscriptionRecord::new_pending(
            Uuid::new_v4(),
            Some(format!("I-{}", Uuid::new_v4().simple())),
            tier,
            BillingCycle::Monthly,
            None,
        );
        record.status = SubscriptionStatus::Active;
        record
    }

    #[tokio::test]
    async fn test_applies_due_downgrade_once() {
        let (store, provider, job) = setup();
        let now = OffsetDateTime::now_utc();
        let mut record = active(SubscriptionTier::Enterprise);
        record.set_pending_plan(
            SubscriptionTier::Basic,
            BillingCycle::Monthly,
            now - time::Duration::minutes(1),
        );
        store.put_subscription(record.clone());

        let summary = job.run_once(now).await.unwrap();
        assert_eq!(summary.plan_changes_applied, 1);

        let stored = store.subscription(record.id).unwrap();
        assert_eq!(stored.plan_tier, SubscriptionTier::Basic);
        assert!(!stored.has_pending_plan_change());
        assert_eq!(stored.provider_plan_id.as_deref(), Some("P-BASIC-M"));
        assert!(provider.outbound_calls().is_empty());

        let again = job.run_once(now).await.unwrap();
        assert_eq!(again, ReconcileSummary::default());
        assert_eq!(store.subscription(record.id).unwrap().version, stored.version);
    }

    #[tokio::test]
    async fn test_future_changes_are_left_alone() {
        let (store, _, job) = setup();
        let now = OffsetDateTime::now_utc();
        let mut record = active(SubscriptionTier::Enterprise);
        record.set_pending_plan(
            SubscriptionTier::Basic,
            BillingCycle::Monthly,
            now + time::Duration::days(3),
        );
        store.put_subscription(record.clone());

        let summary = job.run_once(now).await.unwrap();
        assert_eq!(summary.applied(), 0);
        assert_eq!(store.subscription(record.id).unwrap(), record);
    }

    #[tokio::test]
    async fn test_pending_upgrade_waits_for_webhook() {
        let (store, provider, job) = setup();
        let now = OffsetDateTime::now_utc();
        let mut record = active(SubscriptionTier::Basic);
        record.set_pending_plan(SubscriptionTier::Enterprise, BillingCycle::Monthly, now);
        store.put_subscription(record.clone());

        let summary = job.run_once(now).await.unwrap();
        assert_eq!(summary.applied(), 0);
        assert_eq!(summary.skipped, 1);
        assert_eq!(
            store.subscription(record.id).unwrap().plan_tier,
            SubscriptionTier::Basic
        );
        assert!(provider.outbound_calls().is_empty());
    }

    #[tokio::test]
    async fn test_applies_due_cancellation() {
        let (store, _, job) = setup();
        let now = OffsetDateTime::now_utc();
        let mut record = active(SubscriptionTier::Basic);
        record.schedule_cancellation(
            now - time::Duration::days(10),
            now - time::Duration::seconds(5),
            Some("closing clinic".to_string()),
        );
        store.put_subscription(record.clone());
        store.set_tenant_status(record.tenant_id, BillingStatus::Active);

        let summary = job.run_once(now).await.unwrap();
        assert_eq!(summary.cancellations_applied, 1);

        let stored = store.subscription(record.id).unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Cancelled);
        assert_eq!(stored.cancellation_effective_date, record.cancellation_effective_date);
        assert_eq!(
            store.tenant_status(record.tenant_id),
            Some(BillingStatus::Canceled)
        );
        let audit = store.audit_entries();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].action, AuditAction::CancellationApplied);
        assert!(audit[0].actor_id.is_none());
    }

    #[tokio::test]
    async fn test_due_cancellation_applies_while_provider_is_down() {
        let (store, provider, job) = setup();
        let now = OffsetDateTime::now_utc();
        let mut record = active(SubscriptionTier::Basic);
        record.schedule_cancellation(
            now - time::Duration::days(30),
            now - time::Duration::seconds(1),
            None,
        );
        store.put_subscription(record.clone());
        store.set_tenant_status(record.tenant_id, BillingStatus::Active);
        provider.fail_next(ProviderError::Api {
            status: 400,
            message: "INVALID_REQUEST".to_string(),
        });

        let summary = job.run_once(now).await.unwrap();
        assert_eq!(summary.cancellations_applied, 1);
        assert_eq!(summary.errors, 0);
        assert_eq!(
            store.subscription(record.id).unwrap().status,
            SubscriptionStatus::Cancelled
        );
        assert_eq!(
            store.tenant_status(record.tenant_id),
            Some(BillingStatus::Canceled)
        );
        assert!(provider.outbound_calls().is_empty());
    }

    #[tokio::test]
    async fn test_due_downgrade_applies_while_provider_is_down() {
        let (store, provider, job) = setup();
        let now = OffsetDateTime::now_utc();
        let mut record = active(SubscriptionTier::Enterprise);
        record.set_pending_plan(
            SubscriptionTier::Basic,
            BillingCycle::Monthly,
            now - time::Duration::seconds(1),
        );
        store.put_subscription(record.clone());
        provider.fail_next(ProviderError::Transport("connection reset".to_string()));

        let summary = job.run_once(now).await.unwrap();
        assert_eq!(summary.plan_changes_applied, 1);
        assert_eq!(summary.errors, 0);
        assert_eq!(
            store.subscription(record.id).unwrap().plan_tier,
            SubscriptionTier::Basic
        );
    }

    #[tokio::test]
    async fn test_preview_lists_due_records() {
        let (store, _, job) = setup();
        let now = OffsetDateTime::now_utc();
        let mut due = active(SubscriptionTier::Enterprise);
        due.set_pending_plan(SubscriptionTier::Basic, BillingCycle::Monthly, now);
        let idle = active(SubscriptionTier::Basic);
        store.put_subscription(due.clone());
        store.put_subscription(idle);

        assert_eq!(job.preview(now).await.unwrap(), vec![due.id]);
    }
}
