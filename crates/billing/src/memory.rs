//! In-memory [`BillingStore`] for tests
//!
//! One mutex guards the whole state, so every trait call is atomic in the
//! same way a single Postgres transaction is.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use clinicdesk_shared::{BillingStatus, SubscriptionStatus};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::events::AuditEntry;
use crate::store::{
    BillingStore, EventProcessingStatus, PaymentTransaction, SubscriptionCommit,
    SubscriptionRecord, TenantBilling, WebhookClaim, WebhookEventRecord,
};

type Interference = Box<dyn FnOnce(&mut SubscriptionRecord) + Send>;

#[derive(Default)]
struct MemoryState {
    tenants: HashMap<Uuid, BillingStatus>,
    subscriptions: HashMap<Uuid, SubscriptionRecord>,
    payments: HashMap<String, PaymentTransaction>,
    webhook_events: HashMap<String, WebhookEventRecord>,
    audit: Vec<AuditEntry>,
    /// Applied to the stored record right before the next commit is checked
    interference: Option<Interference>,
}

#[derive(Default)]
pub struct InMemoryBillingStore {
    state: Mutex<MemoryState>,
}

impl InMemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a tenant in `PENDING_PAYMENT`
    pub fn add_tenant(&self, tenant_id: Uuid) {
        self.state()
            .tenants
            .entry(tenant_id)
            .or_insert(BillingStatus::PendingPayment);
    }

    pub fn set_tenant_status(&self, tenant_id: Uuid, status: BillingStatus) {
        self.state().tenants.insert(tenant_id, status);
    }

    pub fn tenant_status(&self, tenant_id: Uuid) -> Option<BillingStatus> {
        self.state().tenants.get(&tenant_id).copied()
    }

    /// Seed a record as-is, bypassing the open-record check
    pub fn put_subscription(&self, record: SubscriptionRecord) {
        let mut state = self.state();
        state
            .tenants
            .entry(record.tenant_id)
            .or_insert(BillingStatus::PendingPayment);
        state.subscriptions.insert(record.id, record);
    }

    pub fn subscription(&self, id: Uuid) -> Option<SubscriptionRecord> {
        self.state().subscriptions.get(&id).cloned()
    }

    pub fn audit_entries(&self) -> Vec<AuditEntry> {
        self.state().audit.clone()
    }

    pub fn payments(&self) -> Vec<PaymentTransaction> {
        self.state().payments.values().cloned().collect()
    }

    pub fn webhook_event(&self, event_id: &str) -> Option<WebhookEventRecord> {
        self.state().webhook_events.get(event_id).cloned()
    }

    /// Simulate a concurrent writer landing between the next read and commit.
    /// The closure mutates the stored record and its version is bumped.
    pub fn interfere_before_next_commit<F>(&self, f: F)
    where
        F: FnOnce(&mut SubscriptionRecord) + Send + 'static,
    {
        self.state().interference = Some(Box::new(f));
    }
}

#[async_trait]
impl BillingStore for InMemoryBillingStore {
    async fn tenant_billing(&self, tenant_id: Uuid) -> BillingResult<Option<TenantBilling>> {
        let state = self.state();
        Ok(state.tenants.get(&tenant_id).map(|status| TenantBilling {
            tenant_id,
            billing_status: *status,
            has_subscription: state
                .subscriptions
                .values()
                .any(|s| s.tenant_id == tenant_id),
        }))
    }

    async fn list_tenant_statuses(&self) -> BillingResult<Vec<(Uuid, BillingStatus)>> {
        Ok(self
            .state()
            .tenants
            .iter()
            .map(|(id, status)| (*id, *status))
            .collect())
    }

    async fn get_subscription(&self, id: Uuid) -> BillingResult<Option<SubscriptionRecord>> {
        Ok(self.state().subscriptions.get(&id).cloned())
    }

    async fn find_open_subscription(
        &self,
        tenant_id: Uuid,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        Ok(self
            .state()
            .subscriptions
            .values()
            .filter(|s| s.tenant_id == tenant_id && s.is_open())
            .max_by_key(|s| s.created_at)
            .cloned())
    }

    async fn find_latest_subscription(
        &self,
        tenant_id: Uuid,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        Ok(self
            .state()
            .subscriptions
            .values()
            .filter(|s| s.tenant_id == tenant_id)
            .max_by_key(|s| s.created_at)
            .cloned())
    }

    async fn find_by_provider_id(
        &self,
        provider_subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        Ok(self
            .state()
            .subscriptions
            .values()
            .find(|s| s.provider_subscription_id.as_deref() == Some(provider_subscription_id))
            .cloned())
    }

    async fn insert_subscription(
        &self,
        record: &SubscriptionRecord,
        tenant_status: BillingStatus,
    ) -> BillingResult<()> {
        let mut state = self.state();
        if !state.tenants.contains_key(&record.tenant_id) {
            return Err(BillingError::TenantNotFound(record.tenant_id.to_string()));
        }
        if state
            .subscriptions
            .values()
            .any(|s| s.tenant_id == record.tenant_id && s.is_open())
        {
            return Err(BillingError::Conflict(
                "tenant already has an open subscription".to_string(),
            ));
        }
        if let Some(provider_id) = &record.provider_subscription_id {
            if state
                .subscriptions
                .values()
                .any(|s| s.provider_subscription_id.as_ref() == Some(provider_id))
            {
                return Err(BillingError::Conflict(format!(
                    "provider subscription {} is already linked",
                    provider_id
                )));
            }
        }

        state.subscriptions.insert(record.id, record.clone());
        state.tenants.insert(record.tenant_id, tenant_status);
        Ok(())
    }

    async fn commit_subscription(&self, commit: &SubscriptionCommit) -> BillingResult<bool> {
        let mut state = self.state();

        if let Some(interfere) = state.interference.take() {
            if let Some(stored) = state.subscriptions.get_mut(&commit.record.id) {
                interfere(stored);
                stored.version += 1;
            }
        }

        let Some(stored) = state.subscriptions.get(&commit.record.id) else {
            return Err(BillingError::SubscriptionNotFound(commit.record.id.to_string()));
        };
        if stored.version != commit.expected_version {
            return Ok(false);
        }

        if let Some(provider_id) = &commit.record.provider_subscription_id {
            let taken = state.subscriptions.values().any(|s| {
                s.id != commit.record.id && s.provider_subscription_id.as_ref() == Some(provider_id)
            });
            if taken {
                return Err(BillingError::Conflict(format!(
                    "provider subscription {} is already linked",
                    provider_id
                )));
            }
        }

        state
            .subscriptions
            .insert(commit.record.id, commit.record.clone());
        if let Some(status) = commit.tenant_status {
            state.tenants.insert(commit.record.tenant_id, status);
        }
        state.audit.extend(commit.audit.iter().cloned());
        Ok(true)
    }

    async fn list_due_transitions(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<SubscriptionRecord>> {
        let mut due: Vec<SubscriptionRecord> = self
            .state()
            .subscriptions
            .values()
            .filter(|s| {
                let plan_due = s.is_open()
                    && s.pending_plan_effective_date.is_some_and(|at| at <= now);
                let cancel_due = s.status == SubscriptionStatus::Active
                    && s.cancellation_effective_date.is_some_and(|at| at <= now);
                plan_due || cancel_due
            })
            .cloned()
            .collect();
        due.sort_by_key(|s| s.created_at);
        Ok(due)
    }

    async fn list_subscriptions(&self) -> BillingResult<Vec<SubscriptionRecord>> {
        Ok(self.state().subscriptions.values().cloned().collect())
    }

    async fn record_payment(&self, payment: &PaymentTransaction) -> BillingResult<bool> {
        let mut state = self.state();
        if state
            .payments
            .contains_key(&payment.provider_transaction_id)
        {
            return Ok(false);
        }
        state
            .payments
            .insert(payment.provider_transaction_id.clone(), payment.clone());
        Ok(true)
    }

    async fn count_payments(&self, subscription_id: Uuid) -> BillingResult<i64> {
        let count = self
            .state()
            .payments
            .values()
            .filter(|p| p.subscription_id == subscription_id)
            .count();
        Ok(count as i64)
    }

    async fn claim_webhook_event(
        &self,
        event_id: &str,
        event_type: &str,
        stale_after: time::Duration,
    ) -> BillingResult<WebhookClaim> {
        let mut state = self.state();
        let now = OffsetDateTime::now_utc();

        if let Some(existing) = state.webhook_events.get_mut(event_id) {
            let reclaimable = match existing.status {
                EventProcessingStatus::Error => true,
                EventProcessingStatus::Processing => existing.started_at < now - stale_after,
                EventProcessingStatus::Success | EventProcessingStatus::Ignored => false,
            };
            if !reclaimable {
                return Ok(WebhookClaim::AlreadySeen(existing.status));
            }
            existing.status = EventProcessingStatus::Processing;
            existing.started_at = now;
            existing.finished_at = None;
            return Ok(WebhookClaim::Claimed);
        }

        state.webhook_events.insert(
            event_id.to_string(),
            WebhookEventRecord {
                event_id: event_id.to_string(),
                event_type: event_type.to_string(),
                status: EventProcessingStatus::Processing,
                error_message: None,
                started_at: now,
                finished_at: None,
            },
        );
        Ok(WebhookClaim::Claimed)
    }

    async fn finish_webhook_event(
        &self,
        event_id: &str,
        status: EventProcessingStatus,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        if let Some(event) = self.state().webhook_events.get_mut(event_id) {
            event.status = status;
            event.error_message = error_message.map(str::to_string);
            event.finished_at = Some(OffsetDateTime::now_utc());
        }
        Ok(())
    }

    async fn list_webhook_events(
        &self,
        status: Option<EventProcessingStatus>,
        limit: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        let mut events: Vec<WebhookEventRecord> = self
            .state()
            .webhook_events
            .values()
            .filter(|e| status.is_none_or(|s| e.status == s))
            .cloned()
            .collect();
        events.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        events.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(events)
    }

    async fn reset_webhook_event(&self, event_id: &str) -> BillingResult<bool> {
        let mut state = self.state();
        let Some(event) = state.webhook_events.get_mut(event_id) else {
            return Ok(false);
        };
        if event.status == EventProcessingStatus::Success {
            return Ok(false);
        }
        event.status = EventProcessingStatus::Error;
        event.error_message = Some("reset for replay".to_string());
        Ok(true)
    }

    async fn list_audit_entries(
        &self,
        tenant_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<AuditEntry>> {
        let mut entries: Vec<AuditEntry> = self
            .state()
            .audit
            .iter()
            .filter(|e| e.tenant_id == tenant_id)
            .cloned()
            .collect();
        entries.reverse();
        entries.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(entries)
    }
}
