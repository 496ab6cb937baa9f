//! Tenant-facing billing routes
//!
//! Every route acts on the caller's own clinic. SaaS managers have no home
//! clinic and pass `?tenant_id=` instead.

use axum::{
    extract::{Extension, Path, Query, State},
    Json,
};
use clinicdesk_billing::{
    BillingError, CancellationResult, PaymentUpdateSession, ScheduledChange, SubscriptionRecord,
    UpgradeResult,
};
use clinicdesk_shared::{BillingCycle, BillingStatus, SubscriptionTier};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct TenantQuery {
    pub tenant_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct PlanChangeRequest {
    pub tier: String,
    pub billing_cycle: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    pub immediate: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SubscriptionResponse {
    pub tenant_id: Uuid,
    pub billing_status: BillingStatus,
    pub subscription: Option<SubscriptionRecord>,
}

#[derive(Debug, Serialize)]
pub struct AccessResponse {
    pub tenant_id: Uuid,
    pub billing_status: BillingStatus,
    pub has_active_billing: bool,
}

#[derive(Debug, Serialize)]
pub struct AdminAccessResponse {
    pub tenant_id: Uuid,
    pub allowed: bool,
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Tenant the request acts on: the explicit query value, else the caller's clinic
fn resolve_tenant(auth_user: &AuthUser, query: &TenantQuery) -> ApiResult<Uuid> {
    match query.tenant_id {
        Some(tenant_id) => Ok(tenant_id),
        None => Ok(auth_user.require_tenant_id()?),
    }
}

pub(crate) fn parse_tier(raw: &str) -> ApiResult<SubscriptionTier> {
    raw.parse()
        .map_err(|_| ApiError::from(BillingError::InvalidTier(raw.to_string())))
}

pub(crate) fn parse_cycle(raw: Option<&str>) -> ApiResult<Option<BillingCycle>> {
    raw.map(|value| {
        value
            .parse()
            .map_err(|_| ApiError::from(BillingError::InvalidBillingCycle(value.to_string())))
    })
    .transpose()
}

// =============================================================================
// Handlers
// =============================================================================

/// Current subscription record and coarse billing status
pub async fn get_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<TenantQuery>,
) -> ApiResult<Json<SubscriptionResponse>> {
    let tenant_id = resolve_tenant(&auth_user, &query)?;

    let subscription = state
        .billing
        .subscriptions
        .get_subscription(&auth_user.actor(), tenant_id)
        .await?;
    let billing_status = state.billing.access.billing_status(tenant_id).await?;

    Ok(Json(SubscriptionResponse {
        tenant_id,
        billing_status,
        subscription,
    }))
}

/// Request an upgrade; the client redirects to the returned approval URL
pub async fn upgrade_plan(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<TenantQuery>,
    Json(req): Json<PlanChangeRequest>,
) -> ApiResult<Json<UpgradeResult>> {
    let tenant_id = resolve_tenant(&auth_user, &query)?;
    let tier = parse_tier(&req.tier)?;
    let cycle = parse_cycle(req.billing_cycle.as_deref())?.unwrap_or_default();

    let result = state
        .billing
        .subscriptions
        .upgrade_plan(&auth_user.actor(), tenant_id, tier, cycle)
        .await?;

    Ok(Json(result))
}

/// Schedule a downgrade for the end of the current period
pub async fn downgrade_plan(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<TenantQuery>,
    Json(req): Json<PlanChangeRequest>,
) -> ApiResult<Json<ScheduledChange>> {
    let tenant_id = resolve_tenant(&auth_user, &query)?;
    let tier = parse_tier(&req.tier)?;
    let cycle = parse_cycle(req.billing_cycle.as_deref())?.unwrap_or_default();

    let scheduled = state
        .billing
        .subscriptions
        .downgrade_plan(&auth_user.actor(), tenant_id, tier, cycle)
        .await?;

    Ok(Json(scheduled))
}

pub async fn cancel_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<TenantQuery>,
    Json(req): Json<CancelRequest>,
) -> ApiResult<Json<CancellationResult>> {
    let tenant_id = resolve_tenant(&auth_user, &query)?;
    let reason = req.reason.filter(|r| !r.trim().is_empty());

    let result = state
        .billing
        .subscriptions
        .cancel_subscription(&auth_user.actor(), tenant_id, req.immediate, reason)
        .await?;

    Ok(Json(result))
}

/// Drop a pending downgrade or a scheduled cancellation
pub async fn clear_scheduled_change(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<TenantQuery>,
) -> ApiResult<Json<SubscriptionRecord>> {
    let tenant_id = resolve_tenant(&auth_user, &query)?;

    let record = state
        .billing
        .subscriptions
        .clear_scheduled_change(&auth_user.actor(), tenant_id)
        .await?;

    Ok(Json(record))
}

pub async fn create_payment_update_session(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<TenantQuery>,
) -> ApiResult<Json<PaymentUpdateSession>> {
    let tenant_id = resolve_tenant(&auth_user, &query)?;

    let session = state
        .billing
        .subscriptions
        .create_payment_update_session(&auth_user.actor(), tenant_id)
        .await?;

    Ok(Json(session))
}

/// Coarse billing status as seen by the access gate
pub async fn get_access(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<TenantQuery>,
) -> ApiResult<Json<AccessResponse>> {
    let tenant_id = resolve_tenant(&auth_user, &query)?;
    auth_user.actor().authorize(tenant_id)?;

    let billing_status = state.billing.access.billing_status(tenant_id).await?;

    Ok(Json(AccessResponse {
        tenant_id,
        billing_status,
        has_active_billing: billing_status.is_active(),
    }))
}

pub async fn get_tenant_admin_access(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(tenant_id): Path<Uuid>,
) -> ApiResult<Json<AdminAccessResponse>> {
    auth_user.actor().authorize(tenant_id)?;

    let allowed = state
        .billing
        .access
        .can_access_tenant_admin(auth_user.user_id, tenant_id)
        .await?;

    Ok(Json(AdminAccessResponse { tenant_id, allowed }))
}
