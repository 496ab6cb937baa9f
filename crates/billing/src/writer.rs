//! Version-checked read-modify-write for subscription records
//!
//! Webhooks, plan changes and reconciliation all mutate records through
//! [`SubscriptionWriter::mutate`]. The closure sees the freshest stored
//! record and decides what to write; if another writer commits first the
//! record is re-read and the closure runs again. A closure that finds
//! nothing left to do returns `None`, which is how a late duplicate becomes
//! a no-op.

use std::sync::Arc;

use clinicdesk_shared::BillingStatus;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::cache::BillingStatusCache;
use crate::error::{BillingError, BillingResult};
use crate::events::AuditEntry;
use crate::store::{BillingStore, SubscriptionCommit, SubscriptionRecord};

/// Attempts before giving up with `ConcurrentModification`
pub const MAX_WRITE_ATTEMPTS: usize = 5;

/// What a mutation closure wants written
#[derive(Debug, Clone)]
pub struct Change {
    pub record: SubscriptionRecord,
    pub tenant_status: Option<BillingStatus>,
    pub audit: Vec<AuditEntry>,
}

impl Change {
    pub fn new(record: SubscriptionRecord) -> Self {
        Self {
            record,
            tenant_status: None,
            audit: Vec::new(),
        }
    }

    /// Also set the tenant status implied by the record's status
    pub fn with_derived_tenant_status(mut self) -> Self {
        self.tenant_status = Some(BillingStatus::for_subscription(self.record.status));
        self
    }

    pub fn with_audit(mut self, entry: AuditEntry) -> Self {
        self.audit.push(entry);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The change was committed; holds the record as stored
    Applied(SubscriptionRecord),
    /// The closure declined to change anything
    Unchanged(SubscriptionRecord),
}

impl WriteOutcome {
    pub fn record(&self) -> &SubscriptionRecord {
        match self {
            WriteOutcome::Applied(record) | WriteOutcome::Unchanged(record) => record,
        }
    }

    pub fn into_record(self) -> SubscriptionRecord {
        match self {
            WriteOutcome::Applied(record) | WriteOutcome::Unchanged(record) => record,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, WriteOutcome::Applied(_))
    }
}

#[derive(Clone)]
pub struct SubscriptionWriter {
    store: Arc<dyn BillingStore>,
    cache: BillingStatusCache,
}

impl SubscriptionWriter {
    pub fn new(store: Arc<dyn BillingStore>, cache: BillingStatusCache) -> Self {
        Self { store, cache }
    }

    pub fn store(&self) -> &Arc<dyn BillingStore> {
        &self.store
    }

    /// Apply `decide` to the current record under optimistic locking.
    ///
    /// The tenant's cache entry is invalidated before this returns whenever
    /// a change was committed.
    pub async fn mutate<F>(
        &self,
        subscription_id: Uuid,
        mut decide: F,
    ) -> BillingResult<WriteOutcome>
    where
        F: FnMut(&SubscriptionRecord) -> BillingResult<Option<Change>> + Send,
    {
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let current = self
                .store
                .get_subscription(subscription_id)
                .await?
                .ok_or_else(|| BillingError::SubscriptionNotFound(subscription_id.to_string()))?;

            let Some(mut change) = decide(&current)? else {
                return Ok(WriteOutcome::Unchanged(current));
            };

            if change.record.id != current.id || change.record.tenant_id != current.tenant_id {
                return Err(BillingError::Internal(
                    "mutation changed record identity".to_string(),
                ));
            }
            if current.provider_subscription_id.is_some()
                && change.record.provider_subscription_id != current.provider_subscription_id
            {
                return Err(BillingError::Internal(
                    "provider subscription id is immutable once linked".to_string(),
                ));
            }

            change.record.updated_at = OffsetDateTime::now_utc();
            change.record.version = current.version + 1;

            let commit = SubscriptionCommit {
                record: change.record,
                expected_version: current.version,
                tenant_status: change.tenant_status,
                audit: change.audit,
            };

            if self.store.commit_subscription(&commit).await? {
                self.cache.invalidate(current.tenant_id).await;
                tracing::debug!(
                    subscription_id = %subscription_id,
                    tenant_id = %current.tenant_id,
                    version = commit.record.version,
                    "Subscription record committed"
                );
                return Ok(WriteOutcome::Applied(commit.record));
            }

            tracing::debug!(
                subscription_id = %subscription_id,
                attempt = attempt,
                expected_version = current.version,
                "Lost optimistic lock race, re-reading subscription"
            );
        }

        tracing::warn!(
            subscription_id = %subscription_id,
            attempts = MAX_WRITE_ATTEMPTS,
            "Giving up on subscription write after repeated version conflicts"
        );
        Err(BillingError::ConcurrentModification(format!(
            "subscription {} changed concurrently",
            subscription_id
        )))
    }

    /// Insert a brand new record and set the tenant status alongside it
    pub async fn insert(
        &self,
        record: &SubscriptionRecord,
        tenant_status: BillingStatus,
    ) -> BillingResult<()> {
        self.store.insert_subscription(record, tenant_status).await?;
        self.cache.invalidate(record.tenant_id).await;
        Ok(())
    }
}
