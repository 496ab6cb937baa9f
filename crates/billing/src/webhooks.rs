//! PayPal webhook processing
//!
//! Deliveries are at-least-once and may arrive out of order or concurrently.
//! Each event id is claimed in the `billing_webhook_events` ledger before
//! any side effect, and every record change goes through the version-checked
//! [`SubscriptionWriter`], so replays and racing deliveries converge on the
//! same state.

use std::sync::Arc;

use serde::Deserialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::catalog::PlanCatalog;
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, AuditAction, AuditEntryBuilder};
use crate::provider::paypal::parse_provider_time;
use crate::provider::{PaymentProvider, SubscriberPayload, WebhookHeaders};
use crate::store::{
    EventProcessingStatus, PaymentTransaction, SubscriptionRecord, WebhookClaim,
    WebhookEventRecord,
};
use crate::writer::{Change, SubscriptionWriter};
use clinicdesk_shared::SubscriptionStatus;

/// Events stuck in `processing` longer than this may be claimed again
const PROCESSING_TIMEOUT_MINUTES: i64 = 30;

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    pub event_type: String,
    #[serde(default)]
    pub resource: WebhookResource,
    pub create_time: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookResource {
    pub id: Option<String>,
    pub status: Option<String>,
    pub plan_id: Option<String>,
    /// Tenant id, set when the subscription was created
    pub custom_id: Option<String>,
    /// Subscription id on sale events
    pub billing_agreement_id: Option<String>,
    pub billing_info: Option<BillingInfoPayload>,
    pub subscriber: Option<SubscriberPayload>,
    pub amount: Option<AmountPayload>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BillingInfoPayload {
    pub next_billing_time: Option<String>,
    pub last_payment: Option<LastPaymentPayload>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LastPaymentPayload {
    pub amount: Option<AmountPayload>,
    pub time: Option<String>,
}

/// Sale events use `total`/`currency`, subscription payloads `value`/`currency_code`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AmountPayload {
    pub total: Option<String>,
    pub value: Option<String>,
    pub currency: Option<String>,
    pub currency_code: Option<String>,
}

impl AmountPayload {
    pub fn amount(&self) -> Option<&str> {
        self.total.as_deref().or(self.value.as_deref())
    }

    pub fn currency(&self) -> Option<&str> {
        self.currency.as_deref().or(self.currency_code.as_deref())
    }
}

impl WebhookResource {
    fn next_billing_time(&self) -> Option<OffsetDateTime> {
        self.billing_info
            .as_ref()?
            .next_billing_time
            .as_deref()
            .and_then(parse_provider_time)
    }

    fn payment_method_mask(&self) -> Option<String> {
        self.subscriber.as_ref()?.payment_method_mask()
    }

    fn tenant_id(&self) -> Option<Uuid> {
        Uuid::parse_str(self.custom_id.as_deref()?.trim()).ok()
    }
}

/// Event types the engine acts on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookEventKind {
    /// Includes re-activation
    Activated,
    Suspended,
    /// Includes expiry
    Cancelled,
    Updated,
    PaymentSaleCompleted,
    Other(String),
}

impl WebhookEventKind {
    /// Accepts both `BILLING.SUBSCRIPTION.*` and bare `SUBSCRIPTION.*` names
    pub fn parse(event_type: &str) -> Self {
        let normalized = event_type.trim().to_ascii_uppercase();
        let name = normalized.strip_prefix("BILLING.").unwrap_or(&normalized);
        match name {
            "SUBSCRIPTION.ACTIVATED" | "SUBSCRIPTION.RE-ACTIVATED" => WebhookEventKind::Activated,
            "SUBSCRIPTION.SUSPENDED" => WebhookEventKind::Suspended,
            "SUBSCRIPTION.CANCELLED" | "SUBSCRIPTION.EXPIRED" => WebhookEventKind::Cancelled,
            "SUBSCRIPTION.UPDATED" => WebhookEventKind::Updated,
            "PAYMENT.SALE.COMPLETED" => WebhookEventKind::PaymentSaleCompleted,
            _ => WebhookEventKind::Other(event_type.to_string()),
        }
    }

    /// Status the record moves to, for status-bearing events
    fn target_status(&self) -> Option<SubscriptionStatus> {
        match self {
            WebhookEventKind::Activated => Some(SubscriptionStatus::Active),
            WebhookEventKind::Suspended => Some(SubscriptionStatus::Suspended),
            WebhookEventKind::Cancelled => Some(SubscriptionStatus::Cancelled),
            _ => None,
        }
    }
}

/// What happened to a delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Processed,
    /// Event id already handled or being handled elsewhere
    Duplicate,
    /// Event type the engine does not act on
    Ignored,
    /// No subscription record matches the event
    UnknownSubscription,
    /// Processing failed; the ledger row is left claimable for redelivery
    Failed(String),
}

impl WebhookOutcome {
    /// Whether the provider should be told the delivery succeeded
    pub fn is_acknowledged(&self) -> bool {
        !matches!(self, WebhookOutcome::Failed(_))
    }
}

enum Disposition {
    Applied,
    NoChange,
    Ignored,
    UnknownSubscription,
}

pub struct WebhookProcessor {
    provider: Arc<dyn PaymentProvider>,
    writer: SubscriptionWriter,
    catalog: Arc<PlanCatalog>,
}

impl WebhookProcessor {
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

    /// Verify and process one delivery.
    ///
    /// Only authentication problems are returned as errors. Everything after
    /// verification is reported through [`WebhookOutcome`].
    pub async fn process_event(
        &self,
        headers: &WebhookHeaders,
        body: &str,
    ) -> BillingResult<WebhookOutcome> {
        let verified = self
            .provider
            .verify_webhook_signature(headers, body)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Webhook signature verification call failed");
                BillingError::from(e)
            })?;

        if !verified {
            tracing::warn!(
                transmission_id = %headers.transmission_id,
                "Rejecting webhook with invalid signature"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let event: WebhookEvent = match serde_json::from_str(body) {
            Ok(event) => event,
            Err(e) => {
                tracing::error!(error = %e, "Verified webhook body could not be parsed");
                return Ok(WebhookOutcome::Failed(format!("invalid payload: {}", e)));
            }
        };

        Ok(self.handle_event(event).await)
    }

    /// Process an already-verified event
    pub async fn handle_event(&self, event: WebhookEvent) -> WebhookOutcome {
        let store = self.writer.store();

        let claim = store
            .claim_webhook_event(
                &event.id,
                &event.event_type,
                time::Duration::minutes(PROCESSING_TIMEOUT_MINUTES),
            )
            .await;

        match claim {
            Ok(WebhookClaim::Claimed) => {}
            Ok(WebhookClaim::AlreadySeen(status)) => {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    ledger_status = %status.as_str(),
                    "Duplicate webhook event"
                );
                return WebhookOutcome::Duplicate;
            }
            Err(e) => {
                tracing::error!(
                    event_id = %event.id,
                    error = %e,
                    "Failed to claim webhook event for processing"
                );
                return WebhookOutcome::Failed(e.to_string());
            }
        }

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Processing PayPal webhook event"
        );

        let (ledger_status, error_message, outcome) = match self.apply_event(&event).await {
            Ok(Disposition::Applied) | Ok(Disposition::NoChange) => {
                (EventProcessingStatus::Success, None, WebhookOutcome::Processed)
            }
            Ok(Disposition::Ignored) => {
                (EventProcessingStatus::Ignored, None, WebhookOutcome::Ignored)
            }
            Ok(Disposition::UnknownSubscription) => (
                EventProcessingStatus::Ignored,
                Some("no matching subscription".to_string()),
                WebhookOutcome::UnknownSubscription,
            ),
            Err(e) => {
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %e,
                    "Webhook event processing failed"
                );
                (
                    EventProcessingStatus::Error,
                    Some(e.to_string()),
                    WebhookOutcome::Failed(e.to_string()),
                )
            }
        };

        self.finish(&event, ledger_status, error_message.as_deref())
            .await;
        outcome
    }

    /// Record the final ledger status, retrying once
    async fn finish(
        &self,
        event: &WebhookEvent,
        status: EventProcessingStatus,
        error_message: Option<&str>,
    ) {
        let store = self.writer.store();
        if let Err(first) = store
            .finish_webhook_event(&event.id, status, error_message)
            .await
        {
            tracing::warn!(
                event_id = %event.id,
                error = %first,
                "First attempt to update webhook ledger failed, retrying"
            );
            if let Err(retry) = store
                .finish_webhook_event(&event.id, status, error_message)
                .await
            {
                tracing::error!(
                    event_id = %event.id,
                    ledger_status = %status.as_str(),
                    first_error = %first,
                    retry_error = %retry,
                    "Failed to update webhook ledger after retry; event stays in processing until the stuck timeout"
                );
            }
        }
    }

    async fn apply_event(&self, event: &WebhookEvent) -> BillingResult<Disposition> {
        let kind = WebhookEventKind::parse(&event.event_type);

        if let WebhookEventKind::Other(event_type) = &kind {
            tracing::info!(
                event_id = %event.id,
                event_type = %event_type,
                "Received unhandled PayPal event type"
            );
            return Ok(Disposition::Ignored);
        }

        let Some(record) = self.locate_subscription(event, &kind).await? else {
            tracing::warn!(
                event_id = %event.id,
                event_type = %event.event_type,
                resource_id = ?event.resource.id,
                custom_id = ?event.resource.custom_id,
                "Webhook does not match any subscription"
            );
            return Ok(Disposition::UnknownSubscription);
        };

        if kind == WebhookEventKind::PaymentSaleCompleted {
            return self.record_payment(event, &record).await;
        }

        let outcome = self
            .writer
            .mutate(record.id, |current| {
                Ok(self.subscription_change(current, event, &kind))
            })
            .await?;

        if outcome.is_applied() {
            let record = outcome.record();
            tracing::info!(
                event_id = %event.id,
                tenant_id = %record.tenant_id,
                subscription_id = %record.id,
                status = %record.status,
                plan_tier = %record.plan_tier,
                "Applied webhook to subscription"
            );
            Ok(Disposition::Applied)
        } else {
            Ok(Disposition::NoChange)
        }
    }

    /// Find the record an event refers to, falling back to the tenant id in
    /// `custom_id` and linking the provider id if the record was unlinked
    async fn locate_subscription(
        &self,
        event: &WebhookEvent,
        kind: &WebhookEventKind,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let store = self.writer.store();
        let resource = &event.resource;
        let provider_id = match kind {
            WebhookEventKind::PaymentSaleCompleted => resource.billing_agreement_id.as_deref(),
            _ => resource.id.as_deref(),
        };

        if let Some(provider_id) = provider_id {
            if let Some(record) = store.find_by_provider_id(provider_id).await? {
                return Ok(Some(record));
            }
        }

        let Some(tenant_id) = resource.tenant_id() else {
            return Ok(None);
        };
        let Some(record) = store.find_open_subscription(tenant_id).await? else {
            return Ok(None);
        };

        let Some(provider_id) = provider_id else {
            return Ok(Some(record));
        };

        match record.provider_subscription_id.as_deref() {
            Some(linked) if linked != provider_id => {
                tracing::warn!(
                    tenant_id = %tenant_id,
                    linked_id = %linked,
                    event_id = %event.id,
                    event_provider_id = %provider_id,
                    "custom_id points at a subscription linked to a different provider id"
                );
                Ok(None)
            }
            Some(_) => Ok(Some(record)),
            None => {
                let event_id = event.id.clone();
                let outcome = self
                    .writer
                    .mutate(record.id, |current| {
                        if current.provider_subscription_id.is_some() {
                            return Ok(None);
                        }
                        let mut next = current.clone();
                        next.provider_subscription_id = Some(provider_id.to_string());
                        let audit = AuditEntryBuilder::new(current.tenant_id, AuditAction::ProviderLinked)
                            .subscription(current.id)
                            .actor_opt(None, ActorType::Provider)
                            .after(serde_json::json!({ "provider_subscription_id": provider_id }))
                            .provider_event(event_id.clone())
                            .build();
                        Ok(Some(Change::new(next).with_audit(audit)))
                    })
                    .await?;

                let record = outcome.into_record();
                if record.provider_subscription_id.as_deref() == Some(provider_id) {
                    tracing::info!(
                        tenant_id = %tenant_id,
                        subscription_id = %record.id,
                        provider_subscription_id = %provider_id,
                        "Linked provider subscription id via custom_id"
                    );
                    Ok(Some(record))
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Pure decision for status and metadata events; `None` means no change
    fn subscription_change(
        &self,
        current: &SubscriptionRecord,
        event: &WebhookEvent,
        kind: &WebhookEventKind,
    ) -> Option<Change> {
        if current.status.is_terminal() {
            if *kind != WebhookEventKind::Cancelled {
                tracing::warn!(
                    event_id = %event.id,
                    subscription_id = %current.id,
                    event_type = %event.event_type,
                    "Ignoring event for cancelled subscription"
                );
            }
            return None;
        }

        let resource = &event.resource;
        let mut next = current.clone();
        let mut audit = Vec::new();
        let audit_entry = |action: AuditAction, before: &SubscriptionRecord, after: &SubscriptionRecord| {
            AuditEntryBuilder::new(current.tenant_id, action)
                .subscription(current.id)
                .actor_opt(None, ActorType::Provider)
                .before(before.audit_snapshot())
                .after(after.audit_snapshot())
                .provider_event(event.id.clone())
                .build()
        };

        if let Some(renewal) = resource.next_billing_time() {
            next.renewal_date = Some(renewal);
        }
        if let Some(mask) = resource.payment_method_mask() {
            next.payment_method_mask = Some(mask);
        }

        if let Some(status) = kind.target_status() {
            if status == SubscriptionStatus::Cancelled {
                next.mark_cancelled(OffsetDateTime::now_utc());
            } else {
                next.status = status;
            }
            if next.status != current.status {
                let action = if status == SubscriptionStatus::Cancelled {
                    AuditAction::CancellationApplied
                } else {
                    AuditAction::StatusChanged
                };
                audit.push(audit_entry(action, current, &next));
            }
        }

        let confirms_pending = matches!(
            kind,
            WebhookEventKind::Activated | WebhookEventKind::Updated
        ) && self.confirms_pending_plan(&next, resource);

        if confirms_pending {
            let before = next.clone();
            if let Some((from, to)) = next.commit_pending_plan() {
                let action = if to.is_upgrade_from(from) {
                    AuditAction::UpgradeCommitted
                } else {
                    AuditAction::DowngradeApplied
                };
                audit.push(audit_entry(action, &before, &next));
                tracing::info!(
                    event_id = %event.id,
                    subscription_id = %current.id,
                    from_tier = %from,
                    to_tier = %to,
                    "Provider confirmed pending plan change"
                );
            }
        }

        if matches!(
            kind,
            WebhookEventKind::Activated | WebhookEventKind::Updated
        ) {
            if let Some(plan_id) = resource.plan_id.as_deref() {
                next.provider_plan_id = Some(plan_id.to_string());
            }
        }

        if next == *current {
            return None;
        }

        let mut change = Change::new(next).with_derived_tenant_status();
        change.audit = audit;
        Some(change)
    }

    /// Whether the event's plan id is the catalog plan for the pending tier
    fn confirms_pending_plan(&self, record: &SubscriptionRecord, resource: &WebhookResource) -> bool {
        let (Some(pending), Some(plan_id)) = (record.pending_plan_tier, resource.plan_id.as_deref())
        else {
            return false;
        };
        matches!(
            self.catalog.plan_for_provider_id(plan_id),
            Some((tier, _)) if tier == pending
        )
    }

    async fn record_payment(
        &self,
        event: &WebhookEvent,
        record: &SubscriptionRecord,
    ) -> BillingResult<Disposition> {
        let resource = &event.resource;
        let transaction_id = resource.id.clone().ok_or_else(|| {
            BillingError::InvalidPayload("sale event without a transaction id".to_string())
        })?;

        let payment = PaymentTransaction {
            id: Uuid::new_v4(),
            provider_transaction_id: transaction_id.clone(),
            tenant_id: record.tenant_id,
            subscription_id: record.id,
            amount: resource
                .amount
                .as_ref()
                .and_then(|a| a.amount())
                .map(str::to_string),
            currency: resource
                .amount
                .as_ref()
                .and_then(|a| a.currency())
                .map(str::to_string),
            recorded_at: OffsetDateTime::now_utc(),
        };

        if self.writer.store().record_payment(&payment).await? {
            tracing::info!(
                event_id = %event.id,
                tenant_id = %record.tenant_id,
                transaction_id = %transaction_id,
                amount = ?payment.amount,
                currency = ?payment.currency,
                "Recorded subscription payment"
            );
            Ok(Disposition::Applied)
        } else {
            tracing::info!(
                event_id = %event.id,
                transaction_id = %transaction_id,
                "Payment transaction already recorded"
            );
            Ok(Disposition::NoChange)
        }
    }

    // =========================================================================
    // Ledger administration
    // =========================================================================

    pub async fn list_failed_events(&self, limit: i64) -> BillingResult<Vec<WebhookEventRecord>> {
        self.writer
            .store()
            .list_webhook_events(Some(EventProcessingStatus::Error), limit)
            .await
    }

    pub async fn list_events(
        &self,
        status: Option<EventProcessingStatus>,
        limit: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        self.writer.store().list_webhook_events(status, limit).await
    }

    /// Make a failed, stuck or ignored event claimable so the next
    /// redelivery is processed
    pub async fn reset_event(&self, event_id: &str) -> BillingResult<bool> {
        let reset = self.writer.store().reset_webhook_event(event_id).await?;
        if reset {
            tracing::info!(event_id = %event_id, "Webhook event reset for replay");
        }
        Ok(reset)
    }
}
