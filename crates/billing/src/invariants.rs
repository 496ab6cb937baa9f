//! Billing Invariants Module
//!
//! Runnable consistency checks over stored billing state. Safe to run at any
//! time, including after a webhook replay or a manual override; checks only
//! read.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use clinicdesk_shared::{BillingStatus, SubscriptionStatus};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::store::{BillingStore, SubscriptionRecord};

const SINGLE_OPEN_SUBSCRIPTION: &str = "single_open_subscription";
const PENDING_EXCLUSIVITY: &str = "pending_exclusivity";
const PENDING_FIELDS_COMPLETE: &str = "pending_fields_complete";
const TENANT_STATUS_CONSISTENT: &str = "tenant_status_consistent";
const CANCELLED_HAS_EFFECTIVE_DATE: &str = "cancelled_has_effective_date";

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Tenant(s) affected
    pub tenant_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Access or charges may be wrong right now
    Critical,
    /// Data inconsistency that needs attention
    High,
    /// Potential issue, should investigate
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

/// Snapshot the checks run against
struct BillingSnapshot {
    subscriptions: Vec<SubscriptionRecord>,
    tenants: Vec<(Uuid, BillingStatus)>,
}

impl BillingSnapshot {
    fn by_tenant(&self) -> HashMap<Uuid, Vec<&SubscriptionRecord>> {
        let mut map: HashMap<Uuid, Vec<&SubscriptionRecord>> = HashMap::new();
        for record in &self.subscriptions {
            map.entry(record.tenant_id).or_default().push(record);
        }
        map
    }
}

/// Service for running billing invariant checks
pub struct InvariantChecker {
    store: Arc<dyn BillingStore>,
}

impl InvariantChecker {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    async fn snapshot(&self) -> BillingResult<BillingSnapshot> {
        Ok(BillingSnapshot {
            subscriptions: self.store.list_subscriptions().await?,
            tenants: self.store.list_tenant_statuses().await?,
        })
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let snapshot = self.snapshot().await?;

        let mut violations = Vec::new();
        for name in Self::available_checks() {
            violations.extend(run_named(name, &snapshot));
        }

        let checks_run = Self::available_checks().len();
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<HashSet<_>>()
            .len();

        let summary = InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed: checks_run - checks_failed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        };

        if summary.healthy {
            tracing::info!(checks_run = checks_run, "Billing invariants hold");
        } else {
            for violation in &summary.violations {
                tracing::warn!(
                    invariant = %violation.invariant,
                    severity = %violation.severity,
                    tenant_ids = ?violation.tenant_ids,
                    "{}",
                    violation.description
                );
            }
        }

        Ok(summary)
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        let snapshot = self.snapshot().await?;
        Ok(run_named(name, &snapshot))
    }

    pub fn available_checks() -> Vec<&'static str> {
        vec![
            SINGLE_OPEN_SUBSCRIPTION,
            PENDING_EXCLUSIVITY,
            PENDING_FIELDS_COMPLETE,
            TENANT_STATUS_CONSISTENT,
            CANCELLED_HAS_EFFECTIVE_DATE,
        ]
    }
}

fn run_named(name: &str, snapshot: &BillingSnapshot) -> Vec<InvariantViolation> {
    match name {
        SINGLE_OPEN_SUBSCRIPTION => check_single_open_subscription(snapshot),
        PENDING_EXCLUSIVITY => check_pending_exclusivity(snapshot),
        PENDING_FIELDS_COMPLETE => check_pending_fields_complete(snapshot),
        TENANT_STATUS_CONSISTENT => check_tenant_status_consistent(snapshot),
        CANCELLED_HAS_EFFECTIVE_DATE => check_cancelled_has_effective_date(snapshot),
        _ => vec![],
    }
}

/// At most one non-cancelled record per tenant
fn check_single_open_subscription(snapshot: &BillingSnapshot) -> Vec<InvariantViolation> {
    snapshot
        .by_tenant()
        .into_iter()
        .filter_map(|(tenant_id, records)| {
            let open: Vec<Uuid> = records.iter().filter(|r| r.is_open()).map(|r| r.id).collect();
            (open.len() > 1).then(|| InvariantViolation {
                invariant: SINGLE_OPEN_SUBSCRIPTION.to_string(),
                tenant_ids: vec![tenant_id],
                description: format!(
                    "Tenant has {} open subscriptions (expected at most 1)",
                    open.len()
                ),
                context: serde_json::json!({ "subscription_ids": open }),
                severity: ViolationSeverity::Critical,
            })
        })
        .collect()
}

/// A pending plan change and a scheduled cancellation never coexist
fn check_pending_exclusivity(snapshot: &BillingSnapshot) -> Vec<InvariantViolation> {
    snapshot
        .subscriptions
        .iter()
        .filter(|r| r.pending_plan_tier.is_some() && r.cancellation_effective_date.is_some())
        .map(|r| InvariantViolation {
            invariant: PENDING_EXCLUSIVITY.to_string(),
            tenant_ids: vec![r.tenant_id],
            description: "Subscription has both a pending plan change and a scheduled cancellation"
                .to_string(),
            context: serde_json::json!({
                "subscription_id": r.id,
                "pending_plan_tier": r.pending_plan_tier,
                "status": r.status,
            }),
            severity: ViolationSeverity::High,
        })
        .collect()
}

/// Pending plan fields and cancellation dates are set together
fn check_pending_fields_complete(snapshot: &BillingSnapshot) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    for r in &snapshot.subscriptions {
        let plan_fields = [
            r.pending_plan_tier.is_some(),
            r.pending_billing_cycle.is_some(),
            r.pending_plan_effective_date.is_some(),
        ];
        if plan_fields.iter().any(|set| *set) && !plan_fields.iter().all(|set| *set) {
            violations.push(InvariantViolation {
                invariant: PENDING_FIELDS_COMPLETE.to_string(),
                tenant_ids: vec![r.tenant_id],
                description: "Pending plan change is only partially set".to_string(),
                context: serde_json::json!({
                    "subscription_id": r.id,
                    "pending_plan_tier": r.pending_plan_tier,
                    "pending_billing_cycle": r.pending_billing_cycle,
                    "has_effective_date": r.pending_plan_effective_date.is_some(),
                }),
                severity: ViolationSeverity::High,
            });
        }
        if r.cancellation_date.is_some() != r.cancellation_effective_date.is_some() {
            violations.push(InvariantViolation {
                invariant: PENDING_FIELDS_COMPLETE.to_string(),
                tenant_ids: vec![r.tenant_id],
                description: "Cancellation dates are only partially set".to_string(),
                context: serde_json::json!({
                    "subscription_id": r.id,
                    "has_cancellation_date": r.cancellation_date.is_some(),
                    "has_effective_date": r.cancellation_effective_date.is_some(),
                }),
                severity: ViolationSeverity::High,
            });
        }
    }
    violations
}

/// Tenant status matches the status of its current record; tenants without
/// a record must not be ACTIVE
fn check_tenant_status_consistent(snapshot: &BillingSnapshot) -> Vec<InvariantViolation> {
    let by_tenant = snapshot.by_tenant();
    let mut violations = Vec::new();

    for (tenant_id, tenant_status) in &snapshot.tenants {
        let current = by_tenant.get(tenant_id).and_then(|records| {
            records
                .iter()
                .filter(|r| r.is_open())
                .max_by_key(|r| r.created_at)
                .or_else(|| records.iter().max_by_key(|r| r.created_at))
                .copied()
        });

        match current {
            None if tenant_status.is_active() => violations.push(InvariantViolation {
                invariant: TENANT_STATUS_CONSISTENT.to_string(),
                tenant_ids: vec![*tenant_id],
                description: "Tenant is ACTIVE without any subscription record".to_string(),
                context: serde_json::json!({ "billing_status": tenant_status }),
                severity: ViolationSeverity::Critical,
            }),
            None => {}
            Some(record) => {
                let expected = BillingStatus::for_subscription(record.status);
                if expected != *tenant_status {
                    let severity = if tenant_status.is_active() {
                        ViolationSeverity::Critical
                    } else {
                        ViolationSeverity::High
                    };
                    violations.push(InvariantViolation {
                        invariant: TENANT_STATUS_CONSISTENT.to_string(),
                        tenant_ids: vec![*tenant_id],
                        description: format!(
                            "Tenant billing status {} does not match subscription status {}",
                            tenant_status, record.status
                        ),
                        context: serde_json::json!({
                            "subscription_id": record.id,
                            "billing_status": tenant_status,
                            "subscription_status": record.status,
                            "expected_billing_status": expected,
                        }),
                        severity,
                    });
                }
            }
        }
    }
    violations
}

fn check_cancelled_has_effective_date(snapshot: &BillingSnapshot) -> Vec<InvariantViolation> {
    snapshot
        .subscriptions
        .iter()
        .filter(|r| {
            r.status == SubscriptionStatus::Cancelled && r.cancellation_effective_date.is_none()
        })
        .map(|r| InvariantViolation {
            invariant: CANCELLED_HAS_EFFECTIVE_DATE.to_string(),
            tenant_ids: vec![r.tenant_id],
            description: "Cancelled subscription has no cancellation effective date".to_string(),
            context: serde_json::json!({ "subscription_id": r.id }),
            severity: ViolationSeverity::Medium,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBillingStore;
    use clinicdesk_shared::{BillingCycle, SubscriptionTier};

    fn record(tenant_id: Uuid, status: SubscriptionStatus) -> SubscriptionRecord {
        let mut record = SubscriptionRecord::new_pending(
            tenant_id,
            None,
            SubscriptionTier::Basic,
            BillingCycle::Monthly,
            None,
        );
        record.status = status;
        record
    }

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 5);
        assert!(checks.contains(&"single_open_subscription"));
        assert!(checks.contains(&"tenant_status_consistent"));
    }

    #[tokio::test]
    async fn test_healthy_state_passes() {
        let store = Arc::new(InMemoryBillingStore::new());
        let tenant = Uuid::new_v4();
        let mut old = record(tenant, SubscriptionStatus::Cancelled);
        old.mark_cancelled(OffsetDateTime::now_utc());
        store.put_subscription(old);
        store.put_subscription(record(tenant, SubscriptionStatus::Active));
        store.set_tenant_status(tenant, BillingStatus::Active);
        store.add_tenant(Uuid::new_v4());

        let summary = InvariantChecker::new(store).run_all_checks().await.unwrap();
        assert!(summary.healthy, "{:?}", summary.violations);
        assert_eq!(summary.checks_passed, summary.checks_run);
    }

    #[tokio::test]
    async fn test_detects_broken_state() {
        let store = Arc::new(InMemoryBillingStore::new());
        let now = OffsetDateTime::now_utc();

        let doubled = Uuid::new_v4();
        store.put_subscription(record(doubled, SubscriptionStatus::Active));
        store.put_subscription(record(doubled, SubscriptionStatus::Active));
        store.set_tenant_status(doubled, BillingStatus::Active);

        let both_pending = Uuid::new_v4();
        let mut r = record(both_pending, SubscriptionStatus::Active);
        r.set_pending_plan(SubscriptionTier::Basic, BillingCycle::Monthly, now);
        r.schedule_cancellation(now, now, None);
        store.put_subscription(r);
        store.set_tenant_status(both_pending, BillingStatus::Active);

        let orphan_active = Uuid::new_v4();
        store.set_tenant_status(orphan_active, BillingStatus::Active);

        let checker = InvariantChecker::new(store);
        let summary = checker.run_all_checks().await.unwrap();
        assert!(!summary.healthy);

        let failed: HashSet<&str> = summary
            .violations
            .iter()
            .map(|v| v.invariant.as_str())
            .collect();
        assert!(failed.contains(SINGLE_OPEN_SUBSCRIPTION));
        assert!(failed.contains(PENDING_EXCLUSIVITY));
        assert!(failed.contains(TENANT_STATUS_CONSISTENT));
        assert!(!failed.contains(CANCELLED_HAS_EFFECTIVE_DATE));

        let orphan = checker.run_check(TENANT_STATUS_CONSISTENT).await.unwrap();
        assert!(orphan
            .iter()
            .any(|v| v.tenant_ids == vec![orphan_active]
                && v.severity == ViolationSeverity::Critical));
    }

    #[tokio::test]
    async fn test_unknown_check_name_is_empty() {
        let checker = InvariantChecker::new(Arc::new(InMemoryBillingStore::new()));
        assert!(checker.run_check("no_such_check").await.unwrap().is_empty());
    }
}
