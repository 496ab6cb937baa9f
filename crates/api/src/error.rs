//! API error type and its HTTP mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use clinicdesk_billing::BillingError;
use serde_json::json;

use crate::auth::AuthError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Authentication required")]
    Unauthorized,
    #[error("Forbidden")]
    Forbidden,
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Conflict(String),
    /// Provider rejected the request
    #[error("Payment provider error: {0}")]
    BadGateway(String),
    /// Provider or storage unavailable; the client may retry
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Internal server error")]
    Internal,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Database(_) | ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::InvalidTier(_)
            | BillingError::InvalidBillingCycle(_)
            | BillingError::InvalidStatus(_)
            | BillingError::Validation(_)
            | BillingError::InvalidPayload(_) => ApiError::Validation(err.to_string()),
            BillingError::Conflict(_) => ApiError::Conflict(err.to_string()),
            BillingError::TenantNotFound(_) | BillingError::SubscriptionNotFound(_) => {
                ApiError::NotFound(err.to_string())
            }
            BillingError::Forbidden(_) => ApiError::Forbidden,
            BillingError::WebhookSignatureInvalid => ApiError::Unauthorized,
            BillingError::Provider { message, retryable } => {
                if retryable {
                    ApiError::ServiceUnavailable(message)
                } else {
                    ApiError::BadGateway(message)
                }
            }
            BillingError::ConcurrentModification(_) => {
                ApiError::ServiceUnavailable(err.to_string())
            }
            BillingError::Database(msg) => ApiError::Database(msg),
            BillingError::Config(_) | BillingError::Internal(_) => {
                tracing::error!(error = %err, "Unexpected billing error");
                ApiError::Internal
            }
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::MissingAuth | AuthError::InvalidToken => ApiError::Unauthorized,
            AuthError::NoTenant => ApiError::Validation(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            // Storage details stay in the logs
            ApiError::Database(detail) => {
                tracing::error!(error = %detail, "Database error while serving request");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        let body = Json(json!({
            "error": message,
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}
