//! Scheduled job bodies
//!
//! Each job logs its own outcome and never returns an error to the
//! scheduler; a failed run is retried on the next tick.

use std::sync::Arc;

use clinicdesk_billing::{BillingService, InvariantCheckSummary, ReconcileSummary};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Failed deliveries listed per report
const FAILED_EVENT_REPORT_LIMIT: i64 = 50;

/// Runs reconciliation passes one at a time
#[derive(Clone)]
pub struct ReconcileRunner {
    billing: Arc<BillingService>,
    running: Arc<Mutex<()>>,
}

impl ReconcileRunner {
    pub fn new(billing: Arc<BillingService>) -> Self {
        Self {
            billing,
            running: Arc::new(Mutex::new(())),
        }
    }

    /// One pass; `None` if the previous pass is still running or the pass failed
    pub async fn run(&self, now: OffsetDateTime) -> Option<ReconcileSummary> {
        let Ok(_guard) = self.running.try_lock() else {
            warn!("Previous reconciliation pass still running, skipping this tick");
            return None;
        };

        match self.billing.reconciliation.run_once(now).await {
            Ok(summary) => {
                info!(
                    plan_changes_applied = summary.plan_changes_applied,
                    cancellations_applied = summary.cancellations_applied,
                    skipped = summary.skipped,
                    errors = summary.errors,
                    "Reconciliation pass complete"
                );
                Some(summary)
            }
            Err(e) => {
                error!(error = %e, "Reconciliation pass failed");
                None
            }
        }
    }
}

pub async fn run_invariant_checks(billing: &BillingService) -> Option<InvariantCheckSummary> {
    match billing.invariants.run_all_checks().await {
        Ok(summary) => {
            for violation in &summary.violations {
                error!(
                    invariant = %violation.invariant,
                    severity = %violation.severity,
                    tenants = violation.tenant_ids.len(),
                    "{}",
                    violation.description
                );
            }
            Some(summary)
        }
        Err(e) => {
            error!(error = %e, "Invariant checks failed to run");
            None
        }
    }
}

/// Log deliveries stuck in `error` so an operator can replay them
pub async fn report_failed_webhooks(billing: &BillingService) -> usize {
    match billing
        .webhooks
        .list_failed_events(FAILED_EVENT_REPORT_LIMIT)
        .await
    {
        Ok(events) => {
            for event in &events {
                warn!(
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    error = ?event.error_message,
                    "Webhook event failed processing"
                );
            }
            if !events.is_empty() {
                warn!(count = events.len(), "Failed webhook events awaiting replay");
            }
            events.len()
        }
        Err(e) => {
            error!(error = %e, "Failed to list failed webhook events");
            0
        }
    }
}
