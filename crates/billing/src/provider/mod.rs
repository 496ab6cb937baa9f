//! Payment provider boundary
//!
//! The engine only needs five provider calls. [`PayPalClient`] is the live
//! implementation; [`mock::MockProvider`] backs the tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub mod paypal;

#[cfg(any(test, feature = "test-billing"))]
pub mod mock;

pub use paypal::{PayPalClient, PayPalConfig};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("provider transport error: {0}")]
    Transport(String),

    #[error("provider returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("provider authentication failed: {0}")]
    Auth(String),

    #[error("unexpected provider response: {0}")]
    Decode(String),
}

impl ProviderError {
    /// Transport failures, throttling and 5xx responses may succeed later
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Transport(_) => true,
            ProviderError::Api { status, .. } => *status == 429 || *status >= 500,
            ProviderError::Auth(_) | ProviderError::Decode(_) => false,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ProviderError::Decode(err.to_string())
        } else {
            ProviderError::Transport(err.to_string())
        }
    }
}

/// Signature headers the provider attaches to each webhook delivery
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WebhookHeaders {
    pub transmission_id: String,
    pub transmission_time: String,
    pub transmission_sig: String,
    pub cert_url: String,
    pub auth_algo: String,
}

impl WebhookHeaders {
    pub const TRANSMISSION_ID: &'static str = "paypal-transmission-id";
    pub const TRANSMISSION_TIME: &'static str = "paypal-transmission-time";
    pub const TRANSMISSION_SIG: &'static str = "paypal-transmission-sig";
    pub const CERT_URL: &'static str = "paypal-cert-url";
    pub const AUTH_ALGO: &'static str = "paypal-auth-algo";

    /// Build from any header lookup; absent headers become empty strings
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).unwrap_or_default();
        Self {
            transmission_id: get(Self::TRANSMISSION_ID),
            transmission_time: get(Self::TRANSMISSION_TIME),
            transmission_sig: get(Self::TRANSMISSION_SIG),
            cert_url: get(Self::CERT_URL),
            auth_algo: get(Self::AUTH_ALGO),
        }
    }

    pub fn is_complete(&self) -> bool {
        [
            &self.transmission_id,
            &self.transmission_time,
            &self.transmission_sig,
            &self.cert_url,
            &self.auth_algo,
        ]
        .iter()
        .all(|v| !v.trim().is_empty())
    }
}

/// Result of asking the provider to move a subscription to another plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisedSubscription {
    /// Where the subscriber must approve the new price
    pub approval_url: Option<String>,
    pub plan_id: Option<String>,
}

/// Provider's view of a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSubscription {
    pub id: String,
    pub status: String,
    pub plan_id: Option<String>,
    pub next_billing_time: Option<OffsetDateTime>,
    pub payment_method_mask: Option<String>,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Backend tag stored on subscription records
    fn name(&self) -> &'static str;

    async fn revise_subscription(
        &self,
        provider_subscription_id: &str,
        provider_plan_id: &str,
    ) -> Result<RevisedSubscription, ProviderError>;

    async fn cancel_subscription(
        &self,
        provider_subscription_id: &str,
        reason: &str,
    ) -> Result<(), ProviderError>;

    async fn get_subscription(
        &self,
        provider_subscription_id: &str,
    ) -> Result<ProviderSubscription, ProviderError>;

    /// Provider-hosted page where the subscriber updates the payment method
    async fn billing_portal_url(&self, provider_subscription_id: &str)
        -> Result<String, ProviderError>;

    /// `Ok(false)` means the delivery is not authentic
    async fn verify_webhook_signature(
        &self,
        headers: &WebhookHeaders,
        body: &str,
    ) -> Result<bool, ProviderError>;
}

/// `subscriber` object as PayPal sends it in API responses and webhooks
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SubscriberPayload {
    pub payment_source: Option<PaymentSourcePayload>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PaymentSourcePayload {
    pub card: Option<CardPayload>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CardPayload {
    pub last_digits: Option<String>,
    pub brand: Option<String>,
}

impl SubscriberPayload {
    pub fn payment_method_mask(&self) -> Option<String> {
        let card = self.payment_source.as_ref()?.card.as_ref()?;
        let digits = card.last_digits.as_deref()?;
        Some(card_mask(card.brand.as_deref(), digits))
    }
}

/// "VISA ****4242" style mask from a card brand and last digits
pub fn card_mask(brand: Option<&str>, last_digits: &str) -> String {
    match brand {
        Some(brand) if !brand.is_empty() => format!("{} ****{}", brand.to_uppercase(), last_digits),
        _ => format!("****{}", last_digits),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ProviderError::Transport("reset".into()).is_retryable());
        assert!(ProviderError::Api {
            status: 429,
            message: "RATE_LIMIT_REACHED".into()
        }
        .is_retryable());
        assert!(ProviderError::Api {
            status: 502,
            message: "bad gateway".into()
        }
        .is_retryable());
        assert!(!ProviderError::Api {
            status: 404,
            message: "RESOURCE_NOT_FOUND".into()
        }
        .is_retryable());
        assert!(!ProviderError::Auth("invalid_client".into()).is_retryable());
    }

    #[test]
    fn test_headers_from_lookup() {
        let headers = WebhookHeaders::from_lookup(|name| match name {
            WebhookHeaders::TRANSMISSION_ID => Some("tid".to_string()),
            WebhookHeaders::AUTH_ALGO => Some("SHA256withRSA".to_string()),
            _ => None,
        });
        assert_eq!(headers.transmission_id, "tid");
        assert_eq!(headers.cert_url, "");
        assert!(!headers.is_complete());
    }

    #[test]
    fn test_card_mask() {
        assert_eq!(card_mask(Some("visa"), "4242"), "VISA ****4242");
        assert_eq!(card_mask(None, "0005"), "****0005");
    }

    #[test]
    fn test_subscriber_mask_requires_last_digits() {
        let subscriber: SubscriberPayload = serde_json::from_str(
            r#"{"payment_source":{"card":{"brand":"MASTERCARD","last_digits":"4444"}}}"#,
        )
        .unwrap();
        assert_eq!(
            subscriber.payment_method_mask().as_deref(),
            Some("MASTERCARD ****4444")
        );

        let wallet: SubscriberPayload =
            serde_json::from_str(r#"{"payment_source":{"paypal":{}}}"#).unwrap();
        assert_eq!(wallet.payment_method_mask(), None);
    }
}
