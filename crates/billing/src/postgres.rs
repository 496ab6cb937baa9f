//! Postgres-backed [`BillingStore`]

use async_trait::async_trait;
use clinicdesk_shared::BillingStatus;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, AuditAction, AuditEntry};
use crate::store::{
    BillingStore, EventProcessingStatus, PaymentTransaction, SubscriptionCommit,
    SubscriptionRecord, TenantBilling, WebhookClaim, WebhookEventRecord,
};

const SUBSCRIPTION_COLUMNS: &str = r#"
    id, tenant_id, provider, provider_subscription_id, status, plan_tier, billing_cycle,
    provider_plan_id, pending_plan_tier, pending_billing_cycle, pending_plan_effective_date,
    cancellation_date, cancellation_effective_date, cancellation_reason, renewal_date,
    payment_method_mask, version, created_at, updated_at
"#;

#[derive(Debug, FromRow)]
struct SubscriptionRow {
    id: Uuid,
    tenant_id: Uuid,
    provider: String,
    provider_subscription_id: Option<String>,
    status: String,
    plan_tier: String,
    billing_cycle: String,
    provider_plan_id: Option<String>,
    pending_plan_tier: Option<String>,
    pending_billing_cycle: Option<String>,
    pending_plan_effective_date: Option<OffsetDateTime>,
    cancellation_date: Option<OffsetDateTime>,
    cancellation_effective_date: Option<OffsetDateTime>,
    cancellation_reason: Option<String>,
    renewal_date: Option<OffsetDateTime>,
    payment_method_mask: Option<String>,
    version: i64,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<SubscriptionRow> for SubscriptionRecord {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        Ok(SubscriptionRecord {
            id: row.id,
            tenant_id: row.tenant_id,
            provider: row.provider,
            provider_subscription_id: row.provider_subscription_id,
            status: row.status.parse()?,
            plan_tier: row.plan_tier.parse()?,
            billing_cycle: row.billing_cycle.parse()?,
            provider_plan_id: row.provider_plan_id,
            pending_plan_tier: row.pending_plan_tier.map(|t| t.parse()).transpose()?,
            pending_billing_cycle: row.pending_billing_cycle.map(|c| c.parse()).transpose()?,
            pending_plan_effective_date: row.pending_plan_effective_date,
            cancellation_date: row.cancellation_date,
            cancellation_effective_date: row.cancellation_effective_date,
            cancellation_reason: row.cancellation_reason,
            renewal_date: row.renewal_date,
            payment_method_mask: row.payment_method_mask,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct WebhookEventRow {
    event_id: String,
    event_type: String,
    status: String,
    error_message: Option<String>,
    started_at: OffsetDateTime,
    finished_at: Option<OffsetDateTime>,
}

impl TryFrom<WebhookEventRow> for WebhookEventRecord {
    type Error = BillingError;

    fn try_from(row: WebhookEventRow) -> Result<Self, Self::Error> {
        let status = EventProcessingStatus::parse(&row.status).ok_or_else(|| {
            BillingError::Database(format!("unknown webhook event status '{}'", row.status))
        })?;
        Ok(WebhookEventRecord {
            event_id: row.event_id,
            event_type: row.event_type,
            status,
            error_message: row.error_message,
            started_at: row.started_at,
            finished_at: row.finished_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct AuditRow {
    id: Uuid,
    tenant_id: Uuid,
    subscription_id: Option<Uuid>,
    actor_id: Option<Uuid>,
    actor_type: String,
    action: String,
    before_value: serde_json::Value,
    after_value: serde_json::Value,
    reason: Option<String>,
    provider_event_id: Option<String>,
    created_at: OffsetDateTime,
}

impl TryFrom<AuditRow> for AuditEntry {
    type Error = BillingError;

    fn try_from(row: AuditRow) -> Result<Self, Self::Error> {
        Ok(AuditEntry {
            id: row.id,
            tenant_id: row.tenant_id,
            subscription_id: row.subscription_id,
            actor_id: row.actor_id,
            actor_type: ActorType::parse(&row.actor_type).ok_or_else(|| {
                BillingError::Database(format!("unknown actor type '{}'", row.actor_type))
            })?,
            action: AuditAction::parse(&row.action).ok_or_else(|| {
                BillingError::Database(format!("unknown audit action '{}'", row.action))
            })?,
            before_value: row.before_value,
            after_value: row.after_value,
            reason: row.reason,
            provider_event_id: row.provider_event_id,
            created_at: row.created_at,
        })
    }
}

/// Map constraint violations to domain errors
fn map_write_error(err: sqlx::Error, tenant_id: Uuid) -> BillingError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return BillingError::Conflict(
                "tenant already has an open subscription or the provider id is taken".to_string(),
            );
        }
        if db.is_foreign_key_violation() {
            return BillingError::TenantNotFound(tenant_id.to_string());
        }
    }
    BillingError::from(err)
}

#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_one_subscription(
        &self,
        filter: &str,
        bind: impl for<'q> sqlx::Encode<'q, Postgres> + sqlx::Type<Postgres> + Send + 'static,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let sql = format!("SELECT {} FROM subscriptions {}", SUBSCRIPTION_COLUMNS, filter);
        let row: Option<SubscriptionRow> = sqlx::query_as(&sql)
            .bind(bind)
            .fetch_optional(&self.pool)
            .await?;
        row.map(SubscriptionRecord::try_from).transpose()
    }

    async fn set_tenant_status(
        tx: &mut Transaction<'_, Postgres>,
        tenant_id: Uuid,
        status: BillingStatus,
    ) -> BillingResult<()> {
        let result = sqlx::query(
            "UPDATE tenants SET billing_status = $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(status.as_str())
        .bind(tenant_id)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::TenantNotFound(tenant_id.to_string()));
        }
        Ok(())
    }

    async fn insert_audit(
        tx: &mut Transaction<'_, Postgres>,
        entry: &AuditEntry,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_audit_log
                (id, tenant_id, subscription_id, actor_id, actor_type, action,
                 provider_event_id, before_value, after_value, reason, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(entry.id)
        .bind(entry.tenant_id)
        .bind(entry.subscription_id)
        .bind(entry.actor_id)
        .bind(entry.actor_type.as_str())
        .bind(entry.action.as_str())
        .bind(&entry.provider_event_id)
        .bind(&entry.before_value)
        .bind(&entry.after_value)
        .bind(&entry.reason)
        .bind(entry.created_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn tenant_billing(&self, tenant_id: Uuid) -> BillingResult<Option<TenantBilling>> {
        let row: Option<(String, bool)> = sqlx::query_as(
            r#"
            SELECT t.billing_status,
                   EXISTS (SELECT 1 FROM subscriptions s WHERE s.tenant_id = t.id)
            FROM tenants t
            WHERE t.id = $1
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some((status, has_subscription)) = row else {
            return Ok(None);
        };
        Ok(Some(TenantBilling {
            tenant_id,
            billing_status: status.parse::<BillingStatus>()?,
            has_subscription,
        }))
    }

    async fn list_tenant_statuses(&self) -> BillingResult<Vec<(Uuid, BillingStatus)>> {
        let rows: Vec<(Uuid, String)> = sqlx::query_as("SELECT id, billing_status FROM tenants")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|(id, status)| Ok((id, status.parse::<BillingStatus>()?)))
            .collect::<BillingResult<Vec<_>>>()
    }

    async fn get_subscription(&self, id: Uuid) -> BillingResult<Option<SubscriptionRecord>> {
        self.fetch_one_subscription("WHERE id = $1", id).await
    }

    async fn find_open_subscription(
        &self,
        tenant_id: Uuid,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        self.fetch_one_subscription(
            "WHERE tenant_id = $1 AND status <> 'CANCELLED' ORDER BY created_at DESC LIMIT 1",
            tenant_id,
        )
        .await
    }

    async fn find_latest_subscription(
        &self,
        tenant_id: Uuid,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        self.fetch_one_subscription(
            "WHERE tenant_id = $1 ORDER BY created_at DESC LIMIT 1",
            tenant_id,
        )
        .await
    }

    async fn find_by_provider_id(
        &self,
        provider_subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        self.fetch_one_subscription(
            "WHERE provider_subscription_id = $1",
            provider_subscription_id.to_string(),
        )
        .await
    }

    async fn insert_subscription(
        &self,
        record: &SubscriptionRecord,
        tenant_status: BillingStatus,
    ) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO subscriptions
                (id, tenant_id, provider, provider_subscription_id, status, plan_tier,
                 billing_cycle, provider_plan_id, renewal_date, payment_method_mask,
                 version, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(record.id)
        .bind(record.tenant_id)
        .bind(&record.provider)
        .bind(&record.provider_subscription_id)
        .bind(record.status.as_str())
        .bind(record.plan_tier.as_str())
        .bind(record.billing_cycle.as_str())
        .bind(&record.provider_plan_id)
        .bind(record.renewal_date)
        .bind(&record.payment_method_mask)
        .bind(record.version)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_write_error(e, record.tenant_id))?;

        Self::set_tenant_status(&mut tx, record.tenant_id, tenant_status).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn commit_subscription(&self, commit: &SubscriptionCommit) -> BillingResult<bool> {
        let record = &commit.record;
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE subscriptions SET
                status = $3,
                plan_tier = $4,
                billing_cycle = $5,
                provider_plan_id = $6,
                pending_plan_tier = $7,
                pending_billing_cycle = $8,
                pending_plan_effective_date = $9,
                cancellation_date = $10,
                cancellation_effective_date = $11,
                cancellation_reason = $12,
                renewal_date = $13,
                payment_method_mask = $14,
                provider_subscription_id = COALESCE(provider_subscription_id, $15),
                version = $16,
                updated_at = $17
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(record.id)
        .bind(commit.expected_version)
        .bind(record.status.as_str())
        .bind(record.plan_tier.as_str())
        .bind(record.billing_cycle.as_str())
        .bind(&record.provider_plan_id)
        .bind(record.pending_plan_tier.map(|t| t.as_str()))
        .bind(record.pending_billing_cycle.map(|c| c.as_str()))
        .bind(record.pending_plan_effective_date)
        .bind(record.cancellation_date)
        .bind(record.cancellation_effective_date)
        .bind(&record.cancellation_reason)
        .bind(record.renewal_date)
        .bind(&record.payment_method_mask)
        .bind(&record.provider_subscription_id)
        .bind(record.version)
        .bind(record.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_write_error(e, record.tenant_id))?;

        if result.rows_affected() == 0 {
            // Version moved on; dropping the transaction rolls it back
            return Ok(false);
        }

        if let Some(status) = commit.tenant_status {
            Self::set_tenant_status(&mut tx, record.tenant_id, status).await?;
        }
        for entry in &commit.audit {
            Self::insert_audit(&mut tx, entry).await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn list_due_transitions(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<SubscriptionRecord>> {
        let sql = format!(
            r#"
            SELECT {} FROM subscriptions
            WHERE (status <> 'CANCELLED' AND pending_plan_effective_date <= $1)
               OR (status = 'ACTIVE' AND cancellation_effective_date <= $1)
            ORDER BY created_at
            "#,
            SUBSCRIPTION_COLUMNS
        );
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&sql).bind(now).fetch_all(&self.pool).await?;
        rows.into_iter().map(SubscriptionRecord::try_from).collect()
    }

    async fn list_subscriptions(&self) -> BillingResult<Vec<SubscriptionRecord>> {
        let sql = format!("SELECT {} FROM subscriptions", SUBSCRIPTION_COLUMNS);
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        rows.into_iter().map(SubscriptionRecord::try_from).collect()
    }

    async fn record_payment(&self, payment: &PaymentTransaction) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO payment_transactions
                (id, provider_transaction_id, tenant_id, subscription_id, amount, currency, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (provider_transaction_id) DO NOTHING
            "#,
        )
        .bind(payment.id)
        .bind(&payment.provider_transaction_id)
        .bind(payment.tenant_id)
        .bind(payment.subscription_id)
        .bind(&payment.amount)
        .bind(&payment.currency)
        .bind(payment.recorded_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn count_payments(&self, subscription_id: Uuid) -> BillingResult<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM payment_transactions WHERE subscription_id = $1")
                .bind(subscription_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    async fn claim_webhook_event(
        &self,
        event_id: &str,
        event_type: &str,
        stale_after: time::Duration,
    ) -> BillingResult<WebhookClaim> {
        // Only one concurrent delivery gets a row back. Failed rows and rows
        // stuck in processing past the timeout can be claimed again.
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO billing_webhook_events (id, event_id, event_type, status, started_at)
            VALUES ($1, $2, $3, 'processing', NOW())
            ON CONFLICT (event_id) DO UPDATE SET
                status = 'processing',
                started_at = NOW(),
                finished_at = NULL,
                error_message = CASE
                    WHEN billing_webhook_events.status = 'processing'
                        THEN CONCAT('Recovered from stuck state at ', NOW()::TEXT)
                    ELSE billing_webhook_events.error_message
                END
            WHERE billing_webhook_events.status = 'error'
               OR (billing_webhook_events.status = 'processing'
                   AND billing_webhook_events.started_at < NOW() - make_interval(secs => $4))
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(event_id)
        .bind(event_type)
        .bind(stale_after.as_seconds_f64())
        .fetch_optional(&self.pool)
        .await?;

        if claimed.is_some() {
            return Ok(WebhookClaim::Claimed);
        }

        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM billing_webhook_events WHERE event_id = $1")
                .bind(event_id)
                .fetch_optional(&self.pool)
                .await?;
        let status = status
            .as_deref()
            .and_then(EventProcessingStatus::parse)
            .unwrap_or(EventProcessingStatus::Processing);

        Ok(WebhookClaim::AlreadySeen(status))
    }

    async fn finish_webhook_event(
        &self,
        event_id: &str,
        status: EventProcessingStatus,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE billing_webhook_events
            SET status = $1, error_message = $2, finished_at = NOW()
            WHERE event_id = $3
            "#,
        )
        .bind(status.as_str())
        .bind(error_message)
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_webhook_events(
        &self,
        status: Option<EventProcessingStatus>,
        limit: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        let rows: Vec<WebhookEventRow> = sqlx::query_as(
            r#"
            SELECT event_id, event_type, status, error_message, started_at, finished_at
            FROM billing_webhook_events
            WHERE $1::TEXT IS NULL OR status = $1
            ORDER BY started_at DESC
            LIMIT $2
            "#,
        )
        .bind(status.map(|s| s.as_str()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(WebhookEventRecord::try_from).collect()
    }

    async fn reset_webhook_event(&self, event_id: &str) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE billing_webhook_events
            SET status = 'error', error_message = 'reset for replay'
            WHERE event_id = $1 AND status <> 'success'
            "#,
        )
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_audit_entries(
        &self,
        tenant_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<AuditEntry>> {
        let rows: Vec<AuditRow> = sqlx::query_as(
            r#"
            SELECT id, tenant_id, subscription_id, actor_id, actor_type, action,
                   before_value, after_value, reason, provider_event_id, created_at
            FROM billing_audit_log
            WHERE tenant_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(tenant_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(AuditEntry::try_from).collect()
    }
}
