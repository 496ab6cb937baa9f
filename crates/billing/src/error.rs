//! Billing error types

use clinicdesk_shared::ParseEnumError;

use crate::provider::ProviderError;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    /// Tier missing from the plan catalog or not valid for the requested change
    #[error("Invalid tier: {0}")]
    InvalidTier(String),

    #[error("Invalid billing cycle: {0}")]
    InvalidBillingCycle(String),

    /// Subscription is not in a status that permits the operation
    #[error("Invalid subscription status: {0}")]
    InvalidStatus(String),

    /// A pending plan change or cancellation already exists
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Tenant not found: {0}")]
    TenantNotFound(String),

    #[error("Subscription not found for tenant {0}")]
    SubscriptionNotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Payment provider error: {message}")]
    Provider { message: String, retryable: bool },

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Invalid webhook payload: {0}")]
    InvalidPayload(String),

    /// Optimistic lock lost repeatedly against concurrent writers
    #[error("Concurrent modification: {0}")]
    ConcurrentModification(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Whether the caller may retry the same request later
    pub fn is_retryable(&self) -> bool {
        match self {
            BillingError::Provider { retryable, .. } => *retryable,
            BillingError::ConcurrentModification(_) | BillingError::Database(_) => true,
            _ => false,
        }
    }

    /// Rejected before any external call was made
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            BillingError::InvalidTier(_)
                | BillingError::InvalidBillingCycle(_)
                | BillingError::InvalidStatus(_)
                | BillingError::Conflict(_)
                | BillingError::TenantNotFound(_)
                | BillingError::SubscriptionNotFound(_)
                | BillingError::Forbidden(_)
                | BillingError::Validation(_)
                | BillingError::InvalidPayload(_)
        )
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<ProviderError> for BillingError {
    fn from(err: ProviderError) -> Self {
        BillingError::Provider {
            retryable: err.is_retryable(),
            message: err.to_string(),
        }
    }
}

impl From<ParseEnumError> for BillingError {
    fn from(err: ParseEnumError) -> Self {
        BillingError::Database(format!("corrupt stored value: {}", err))
    }
}
