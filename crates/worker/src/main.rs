#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! ClinicDesk Background Worker
//!
//! Handles scheduled jobs including:
//! - Reconciliation of due downgrades and cancellations (RECONCILE_CRON, default every 5 minutes)
//! - Billing invariant checks (INVARIANT_CRON, default daily at 03:30 UTC)
//! - Failed webhook report (hourly)
//! - Heartbeat (every 5 minutes)

mod config;
mod jobs;

use std::sync::Arc;
use std::time::Duration;

use clinicdesk_billing::BillingService;
use clinicdesk_shared::create_pool;
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;

use crate::config::WorkerConfig;
use crate::jobs::ReconcileRunner;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,clinicdesk_worker=debug")),
        )
        .init();

    info!("Starting ClinicDesk Worker");

    let config = WorkerConfig::from_env()?;
    let pool = create_pool(&config.database_url).await?;
    let billing = Arc::new(BillingService::from_env(pool)?);

    let scheduler = JobScheduler::new().await?;

    // Job 1: Apply scheduled downgrades and cancellations
    let runner = ReconcileRunner::new(billing.clone());
    scheduler
        .add(Job::new_async(config.reconcile_cron.as_str(), move |_uuid, _l| {
            let runner = runner.clone();
            Box::pin(async move {
                runner.run(OffsetDateTime::now_utc()).await;
            })
        })?)
        .await?;
    info!(cron = %config.reconcile_cron, "Scheduled: Subscription reconciliation");

    // Job 2: Billing invariant checks
    let invariant_billing = billing.clone();
    scheduler
        .add(Job::new_async(config.invariant_cron.as_str(), move |_uuid, _l| {
            let billing = invariant_billing.clone();
            Box::pin(async move {
                jobs::run_invariant_checks(&billing).await;
            })
        })?)
        .await?;
    info!(cron = %config.invariant_cron, "Scheduled: Billing invariant checks");

    // Job 3: Failed webhook report (hourly)
    let webhook_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let billing = webhook_billing.clone();
            Box::pin(async move {
                jobs::report_failed_webhooks(&billing).await;
            })
        })?)
        .await?;
    info!("Scheduled: Failed webhook report (hourly)");

    // Job 4: Heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("ClinicDesk Worker started successfully with {} scheduled jobs", 4);

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
