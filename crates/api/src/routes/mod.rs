//! HTTP routes

use axum::{
    middleware,
    routing::{delete, get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::{auth::require_auth, state::AppState};

pub mod admin;
pub mod billing;
pub mod webhooks;


/// Build the application router
pub fn create_router(state: AppState) -> Router {
    let protected = Router::new()
        .route(
            "/api/v1/billing/subscription",
            get(billing::get_subscription),
        )
        .route("/api/v1/billing/upgrade", post(billing::upgrade_plan))
        .route("/api/v1/billing/downgrade", post(billing::downgrade_plan))
        .route("/api/v1/billing/cancel", post(billing::cancel_subscription))
        .route(
            "/api/v1/billing/scheduled-change",
            delete(billing::clear_scheduled_change),
        )
        .route(
            "/api/v1/billing/payment-method/session",
            post(billing::create_payment_update_session),
        )
        .route("/api/v1/billing/access", get(billing::get_access))
        .route(
            "/api/v1/tenants/{id}/admin-access",
            get(billing::get_tenant_admin_access),
        )
        .route(
            "/api/v1/admin/tenants/{id}/plan-override",
            post(admin::plan_override),
        )
        .layer(middleware::from_fn_with_state(
            state.auth_state(),
            require_auth,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/api/v1/webhooks/paypal", post(webhooks::paypal_webhook))
        .merge(protected)
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
