//! Platform operator routes

use axum::{
    extract::{Extension, Path, State},
    Json,
};
use clinicdesk_billing::SubscriptionRecord;
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    error::ApiResult,
    routes::billing::{parse_cycle, parse_tier},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct PlanOverrideRequest {
    pub tier: String,
    pub billing_cycle: Option<String>,
    #[serde(default)]
    pub reason: String,
}

/// Set a clinic's tier immediately, bypassing the payment provider
pub async fn plan_override(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(tenant_id): Path<Uuid>,
    Json(req): Json<PlanOverrideRequest>,
) -> ApiResult<Json<SubscriptionRecord>> {
    let actor = auth_user.actor();
    actor.require_saas_manager()?;

    let tier = parse_tier(&req.tier)?;
    let cycle = parse_cycle(req.billing_cycle.as_deref())?;

    let record = state
        .billing
        .subscriptions
        .manual_plan_override(&actor, tenant_id, tier, cycle, &req.reason)
        .await?;

    tracing::info!(
        admin_user_id = %auth_user.user_id,
        tenant_id = %tenant_id,
        tier = %record.plan_tier,
        "Applied manual plan override"
    );

    Ok(Json(record))
}
