//! PayPal webhook endpoint
//!
//! Unauthenticated; deliveries are verified against the provider before any
//! state changes.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use clinicdesk_billing::{WebhookHeaders, WebhookOutcome};
use serde_json::json;

use crate::{error::ApiError, state::AppState};

fn outcome_label(outcome: &WebhookOutcome) -> &'static str {
    match outcome {
        WebhookOutcome::Processed => "processed",
        WebhookOutcome::Duplicate => "duplicate",
        WebhookOutcome::Ignored => "ignored",
        WebhookOutcome::UnknownSubscription => "unknown_subscription",
        WebhookOutcome::Failed(_) => "failed",
    }
}

/// Anything but `Failed` is acknowledged with 200; a 500 makes PayPal redeliver
pub async fn paypal_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let webhook_headers = WebhookHeaders::from_lookup(|name| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
    });

    let outcome = match state
        .billing
        .webhooks
        .process_event(&webhook_headers, &body)
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => return ApiError::from(e).into_response(),
    };

    tracing::debug!(
        transmission_id = %webhook_headers.transmission_id,
        outcome = outcome_label(&outcome),
        "Webhook delivery handled"
    );

    if outcome.is_acknowledged() {
        (
            StatusCode::OK,
            Json(json!({ "received": true, "outcome": outcome_label(&outcome) })),
        )
            .into_response()
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "error": "Webhook processing failed",
                "code": StatusCode::INTERNAL_SERVER_ERROR.as_u16()
            })),
        )
            .into_response()
    }
}
