//! Persistence boundary for billing state
//!
//! The engine only talks to storage through [`BillingStore`]. Every
//! subscription mutation is a version-checked compare-and-swap
//! ([`BillingStore::commit_subscription`]) that writes the record, the
//! tenant billing status and any audit entries in one transaction.

use async_trait::async_trait;
use clinicdesk_shared::{BillingCycle, BillingStatus, SubscriptionStatus, SubscriptionTier};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::events::AuditEntry;

/// Provider tag stored on every record issued by the PayPal backend
pub const PAYPAL_PROVIDER: &str = "paypal";

/// One tenant's billing relationship with the payment provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub provider: String,
    /// Immutable once linked
    pub provider_subscription_id: Option<String>,
    pub status: SubscriptionStatus,
    pub plan_tier: SubscriptionTier,
    pub billing_cycle: BillingCycle,
    /// Display only
    pub provider_plan_id: Option<String>,
    pub pending_plan_tier: Option<SubscriptionTier>,
    pub pending_billing_cycle: Option<BillingCycle>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub pending_plan_effective_date: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub cancellation_date: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub cancellation_effective_date: Option<OffsetDateTime>,
    pub cancellation_reason: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub renewal_date: Option<OffsetDateTime>,
    pub payment_method_mask: Option<String>,
    pub version: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl SubscriptionRecord {
    /// New record in `APPROVAL_PENDING`, as created at signup
    pub fn new_pending(
        tenant_id: Uuid,
        provider_subscription_id: Option<String>,
        tier: SubscriptionTier,
        cycle: BillingCycle,
        provider_plan_id: Option<String>,
    ) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            provider: PAYPAL_PROVIDER.to_string(),
            provider_subscription_id,
            status: SubscriptionStatus::ApprovalPending,
            plan_tier: tier,
            billing_cycle: cycle,
            provider_plan_id,
            pending_plan_tier: None,
            pending_billing_cycle: None,
            pending_plan_effective_date: None,
            cancellation_date: None,
            cancellation_effective_date: None,
            cancellation_reason: None,
            renewal_date: None,
            payment_method_mask: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_open(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn has_pending_plan_change(&self) -> bool {
        self.pending_plan_tier.is_some()
    }

    pub fn has_pending_cancellation(&self) -> bool {
        self.cancellation_effective_date.is_some() && !self.status.is_terminal()
    }

    pub fn set_pending_plan(
        &mut self,
        tier: SubscriptionTier,
        cycle: BillingCycle,
        effective: OffsetDateTime,
    ) {
        self.pending_plan_tier = Some(tier);
        self.pending_billing_cycle = Some(cycle);
        self.pending_plan_effective_date = Some(effective);
    }

    pub fn clear_pending_plan(&mut self) {
        self.pending_plan_tier = None;
        self.pending_billing_cycle = None;
        self.pending_plan_effective_date = None;
    }

    /// Move the pending tier into `plan_tier` and clear the pending fields.
    /// Returns `(from, to)` when something was committed.
    pub fn commit_pending_plan(&mut self) -> Option<(SubscriptionTier, SubscriptionTier)> {
        let to = self.pending_plan_tier?;
        let from = self.plan_tier;
        self.plan_tier = to;
        if let Some(cycle) = self.pending_billing_cycle {
            self.billing_cycle = cycle;
        }
        self.clear_pending_plan();
        Some((from, to))
    }

    pub fn schedule_cancellation(
        &mut self,
        requested_at: OffsetDateTime,
        effective: OffsetDateTime,
        reason: Option<String>,
    ) {
        self.cancellation_date = Some(requested_at);
        self.cancellation_effective_date = Some(effective);
        self.cancellation_reason = reason;
    }

    pub fn clear_cancellation(&mut self) {
        self.cancellation_date = None;
        self.cancellation_effective_date = None;
        self.cancellation_reason = None;
    }

    /// Fields recorded as before/after values in the audit log
    pub fn audit_snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "status": self.status,
            "plan_tier": self.plan_tier,
            "billing_cycle": self.billing_cycle,
            "pending_plan_tier": self.pending_plan_tier,
            "pending_plan_effective_date": self
                .pending_plan_effective_date
                .map(|d| d.unix_timestamp()),
            "cancellation_effective_date": self
                .cancellation_effective_date
                .map(|d| d.unix_timestamp()),
        })
    }

    /// Terminal cancellation; pending plan changes die with the subscription
    pub fn mark_cancelled(&mut self, at: OffsetDateTime) {
        self.status = SubscriptionStatus::Cancelled;
        self.clear_pending_plan();
        if self.cancellation_effective_date.is_none() {
            self.cancellation_date = Some(at);
            self.cancellation_effective_date = Some(at);
        }
    }
}

/// Coarse billing view of a tenant row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TenantBilling {
    pub tenant_id: Uuid,
    pub billing_status: BillingStatus,
    pub has_subscription: bool,
}

/// Payment recorded from a completed sale
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentTransaction {
    pub id: Uuid,
    pub provider_transaction_id: String,
    pub tenant_id: Uuid,
    pub subscription_id: Uuid,
    pub amount: Option<String>,
    pub currency: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

/// Processing state of a webhook event in the idempotency ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventProcessingStatus {
    Processing,
    Success,
    Error,
    Ignored,
}

impl EventProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventProcessingStatus::Processing => "processing",
            EventProcessingStatus::Success => "success",
            EventProcessingStatus::Error => "error",
            EventProcessingStatus::Ignored => "ignored",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "processing" => Some(EventProcessingStatus::Processing),
            "success" => Some(EventProcessingStatus::Success),
            "error" => Some(EventProcessingStatus::Error),
            "ignored" => Some(EventProcessingStatus::Ignored),
            _ => None,
        }
    }
}

/// Result of trying to claim exclusive processing rights for an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookClaim {
    Claimed,
    /// Another delivery owns or already finished this event
    AlreadySeen(EventProcessingStatus),
}

/// Stored webhook ledger row
#[derive(Debug, Clone, Serialize)]
pub struct WebhookEventRecord {
    pub event_id: String,
    pub event_type: String,
    pub status: EventProcessingStatus,
    pub error_message: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
}

/// One atomic unit of work against a subscription record
#[derive(Debug, Clone)]
pub struct SubscriptionCommit {
    /// New state of the record; written only if the stored version still
    /// equals `expected_version`
    pub record: SubscriptionRecord,
    pub expected_version: i64,
    pub tenant_status: Option<BillingStatus>,
    pub audit: Vec<AuditEntry>,
}

#[async_trait]
pub trait BillingStore: Send + Sync {
    // Tenants

    async fn tenant_billing(&self, tenant_id: Uuid) -> BillingResult<Option<TenantBilling>>;

    async fn list_tenant_statuses(&self) -> BillingResult<Vec<(Uuid, BillingStatus)>>;

    // Subscriptions

    async fn get_subscription(&self, id: Uuid) -> BillingResult<Option<SubscriptionRecord>>;

    /// The tenant's non-cancelled record, if any
    async fn find_open_subscription(
        &self,
        tenant_id: Uuid,
    ) -> BillingResult<Option<SubscriptionRecord>>;

    /// Most recently created record regardless of status
    async fn find_latest_subscription(
        &self,
        tenant_id: Uuid,
    ) -> BillingResult<Option<SubscriptionRecord>>;

    async fn find_by_provider_id(
        &self,
        provider_subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>>;

    /// Insert a new record and set the tenant status in the same transaction.
    /// Fails with `Conflict` if the tenant already has an open record.
    async fn insert_subscription(
        &self,
        record: &SubscriptionRecord,
        tenant_status: BillingStatus,
    ) -> BillingResult<()>;

    /// Compare-and-swap on `version`. Returns `Ok(false)` if another writer
    /// got there first. On success the stored version is `expected_version + 1`.
    async fn commit_subscription(&self, commit: &SubscriptionCommit) -> BillingResult<bool>;

    /// Records with a pending plan change or cancellation due at or before `now`
    async fn list_due_transitions(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<SubscriptionRecord>>;

    async fn list_subscriptions(&self) -> BillingResult<Vec<SubscriptionRecord>>;

    // Payments

    /// Idempotent insert keyed by provider transaction id; `false` on duplicate
    async fn record_payment(&self, payment: &PaymentTransaction) -> BillingResult<bool>;

    async fn count_payments(&self, subscription_id: Uuid) -> BillingResult<i64>;

    // Webhook idempotency ledger

    /// Claim an event for processing. Rows in `error`, or stuck in
    /// `processing` for longer than `stale_after`, may be re-claimed.
    async fn claim_webhook_event(
        &self,
        event_id: &str,
        event_type: &str,
        stale_after: time::Duration,
    ) -> BillingResult<WebhookClaim>;

    async fn finish_webhook_event(
        &self,
        event_id: &str,
        status: EventProcessingStatus,
        error_message: Option<&str>,
    ) -> BillingResult<()>;

    async fn list_webhook_events(
        &self,
        status: Option<EventProcessingStatus>,
        limit: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>>;

    /// Make a stuck or failed event claimable again; `false` if no such row
    async fn reset_webhook_event(&self, event_id: &str) -> BillingResult<bool>;

    // Audit

    async fn list_audit_entries(&self, tenant_id: Uuid, limit: i64)
        -> BillingResult<Vec<AuditEntry>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active_record() -> SubscriptionRecord {
        let mut record = SubscriptionRecord::new_pending(
            Uuid::new_v4(),
            Some("I-TEST".to_string()),
            SubscriptionTier::Basic,
            BillingCycle::Monthly,
            None,
        );
        record.status = SubscriptionStatus::Active;
        record
    }

    #[test]
    fn test_new_pending_record() {
        let record = SubscriptionRecord::new_pending(
            Uuid::new_v4(),
            None,
            SubscriptionTier::Professional,
            BillingCycle::Yearly,
            Some("P-PRO-Y".to_string()),
        );
        assert_eq!(record.status, SubscriptionStatus::ApprovalPending);
        assert_eq!(record.provider, PAYPAL_PROVIDER);
        assert_eq!(record.version, 0);
        assert!(!record.has_pending_plan_change());
        assert!(!record.has_pending_cancellation());
    }

    #[test]
    fn test_commit_pending_plan_clears_all_pending_fields() {
        let mut record = active_record();
        record.set_pending_plan(
            SubscriptionTier::Enterprise,
            BillingCycle::Yearly,
            OffsetDateTime::now_utc(),
        );

        let committed = record.commit_pending_plan();
        assert_eq!(
            committed,
            Some((SubscriptionTier::Basic, SubscriptionTier::Enterprise))
        );
        assert_eq!(record.plan_tier, SubscriptionTier::Enterprise);
        assert_eq!(record.billing_cycle, BillingCycle::Yearly);
        assert!(record.pending_plan_tier.is_none());
        assert!(record.pending_billing_cycle.is_none());
        assert!(record.pending_plan_effective_date.is_none());

        // second commit is a no-op
        assert_eq!(record.commit_pending_plan(), None);
    }

    #[test]
    fn test_mark_cancelled_keeps_requested_dates() {
        let mut record = active_record();
        let requested = OffsetDateTime::now_utc() - time::Duration::days(3);
        let effective = OffsetDateTime::now_utc() - time::Duration::hours(1);
        record.schedule_cancellation(requested, effective, Some("closing clinic".to_string()));

        record.mark_cancelled(OffsetDateTime::now_utc());
        assert_eq!(record.status, SubscriptionStatus::Cancelled);
        assert_eq!(record.cancellation_date, Some(requested));
        assert_eq!(record.cancellation_effective_date, Some(effective));
        assert!(!record.has_pending_cancellation());
    }

    #[test]
    fn test_mark_cancelled_stamps_dates_and_drops_pending_plan() {
        let mut record = active_record();
        record.set_pending_plan(
            SubscriptionTier::Professional,
            BillingCycle::Monthly,
            OffsetDateTime::now_utc(),
        );
        let now = OffsetDateTime::now_utc();
        record.mark_cancelled(now);
        assert_eq!(record.cancellation_effective_date, Some(now));
        assert!(!record.has_pending_plan_change());
    }

    #[test]
    fn test_event_status_round_trip() {
        for status in [
            EventProcessingStatus::Processing,
            EventProcessingStatus::Success,
            EventProcessingStatus::Error,
            EventProcessingStatus::Ignored,
        ] {
            assert_eq!(EventProcessingStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(EventProcessingStatus::parse("replaying"), None);
    }
}
