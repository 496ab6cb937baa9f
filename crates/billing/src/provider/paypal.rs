//! PayPal Subscriptions REST client

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use super::{
    PaymentProvider, ProviderError, ProviderSubscription, RevisedSubscription, SubscriberPayload,
    WebhookHeaders,
};
use crate::error::{BillingError, BillingResult};
use crate::store::PAYPAL_PROVIDER;

const SANDBOX_API_BASE: &str = "https://api-m.sandbox.paypal.com";
const DEFAULT_MANAGE_URL: &str = "https://www.paypal.com/myaccount/autopay/connect";

/// Refresh the token this long before PayPal says it expires
const TOKEN_EXPIRY_MARGIN_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct PayPalConfig {
    pub client_id: String,
    pub client_secret: String,
    /// Id of the webhook registration, required by signature verification
    pub webhook_id: String,
    pub api_base: String,
    pub return_url: String,
    pub cancel_url: String,
    pub manage_url_base: String,
    /// Extra attempts for idempotent calls
    pub max_retries: usize,
    pub timeout: Duration,
}

impl PayPalConfig {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        webhook_id: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            webhook_id: webhook_id.into(),
            api_base: SANDBOX_API_BASE.to_string(),
            return_url: "http://localhost:3000/billing/return".to_string(),
            cancel_url: "http://localhost:3000/billing/cancel".to_string(),
            manage_url_base: DEFAULT_MANAGE_URL.to_string(),
            max_retries: 2,
            timeout: Duration::from_secs(15),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn from_env() -> BillingResult<Self> {
        let required = |name: &str| {
            std::env::var(name).map_err(|_| BillingError::Config(format!("{} must be set", name)))
        };

        let mut config = Self::new(
            required("PAYPAL_CLIENT_ID")?,
            required("PAYPAL_CLIENT_SECRET")?,
            required("PAYPAL_WEBHOOK_ID")?,
        );
        if let Ok(base) = std::env::var("PAYPAL_API_BASE") {
            config = config.with_api_base(base);
        }
        if let Ok(url) = std::env::var("PAYPAL_RETURN_URL") {
            config.return_url = url;
        }
        if let Ok(url) = std::env::var("PAYPAL_CANCEL_URL") {
            config.cancel_url = url;
        }
        if let Ok(url) = std::env::var("PAYPAL_MANAGE_URL") {
            config.manage_url_base = url.trim_end_matches('/').to_string();
        }
        if let Ok(retries) = std::env::var("PAYPAL_MAX_RETRIES") {
            config.max_retries = retries
                .parse()
                .map_err(|e| BillingError::Config(format!("PAYPAL_MAX_RETRIES: {}", e)))?;
        }

        Ok(config)
    }
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

#[derive(Clone)]
pub struct PayPalClient {
    http: reqwest::Client,
    config: Arc<PayPalConfig>,
    token: Arc<RwLock<Option<CachedToken>>>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    name: Option<String>,
    message: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

#[derive(Deserialize)]
struct Link {
    href: String,
    rel: String,
}

#[derive(Deserialize)]
struct ReviseResponse {
    plan_id: Option<String>,
    #[serde(default)]
    links: Vec<Link>,
}

#[derive(Deserialize)]
struct SubscriptionResponse {
    id: String,
    status: String,
    plan_id: Option<String>,
    billing_info: Option<BillingInfo>,
    subscriber: Option<SubscriberPayload>,
}

#[derive(Deserialize)]
struct BillingInfo {
    next_billing_time: Option<String>,
}

#[derive(Serialize)]
struct VerifyRequest<'a> {
    auth_algo: &'a str,
    cert_url: &'a str,
    transmission_id: &'a str,
    transmission_sig: &'a str,
    transmission_time: &'a str,
    webhook_id: &'a str,
    webhook_event: serde_json::Value,
}

#[derive(Deserialize)]
struct VerifyResponse {
    verification_status: String,
}

impl PayPalClient {
    pub fn new(config: PayPalConfig) -> BillingResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| BillingError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            config: Arc::new(config),
            token: Arc::new(RwLock::new(None)),
        })
    }

    pub fn config(&self) -> &PayPalConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base, path)
    }

    /// Cached OAuth token, fetched on first use and on expiry
    async fn access_token(&self) -> Result<String, ProviderError> {
        {
            let cached = self.token.read().await;
            if let Some(token) = cached.as_ref().filter(|t| t.is_fresh()) {
                return Ok(token.value.clone());
            }
        }

        let mut cached = self.token.write().await;
        if let Some(token) = cached.as_ref().filter(|t| t.is_fresh()) {
            return Ok(token.value.clone());
        }

        let response = self
            .http
            .post(self.url("/v1/oauth2/token"))
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            let message = error_message(response).await;
            tracing::error!(error = %message, "PayPal rejected client credentials");
            return Err(ProviderError::Auth(message));
        }

        let body: TokenResponse = check_status(response).await?.json().await?;
        let lifetime = body.expires_in.saturating_sub(TOKEN_EXPIRY_MARGIN_SECS);
        *cached = Some(CachedToken {
            value: body.access_token.clone(),
            expires_at: Instant::now() + Duration::from_secs(lifetime),
        });

        tracing::debug!(expires_in = body.expires_in, "PayPal access token refreshed");
        Ok(body.access_token)
    }

    async fn clear_token(&self) {
        *self.token.write().await = None;
    }

    /// Retry transport failures and retryable statuses with exponential backoff
    async fn with_retry<T, F, Fut>(
        &self,
        operation: &'static str,
        action: F,
    ) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(50)
            .max_delay(Duration::from_secs(2))
            .map(jitter)
            .take(self.config.max_retries);

        RetryIf::start(strategy, action, |e: &ProviderError| {
            let retry = e.is_retryable();
            if retry {
                tracing::warn!(operation = operation, error = %e, "PayPal call failed, retrying");
            }
            retry
        })
        .await
    }

    async fn send_authorized(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, ProviderError> {
        let token = self.access_token().await?;
        let response = request.bearer_auth(token).send().await?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            self.clear_token().await;
        }
        check_status(response).await
    }
}

async fn error_message(response: reqwest::Response) -> String {
    let text = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ApiErrorBody>(&text) {
        Ok(body) => body
            .name
            .or(body.error)
            .map(|name| match body.message.or(body.error_description) {
                Some(message) => format!("{}: {}", name, message),
                None => name,
            })
            .unwrap_or(text),
        Err(_) => text,
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    Err(ProviderError::Api {
        status: status.as_u16(),
        message: error_message(response).await,
    })
}

/// Parse an RFC 3339 timestamp as sent by PayPal
pub(crate) fn parse_provider_time(value: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(value, &Rfc3339).ok()
}

#[async_trait]
impl PaymentProvider for PayPalClient {
    fn name(&self) -> &'static str {
        PAYPAL_PROVIDER
    }

    async fn revise_subscription(
        &self,
        provider_subscription_id: &str,
        provider_plan_id: &str,
    ) -> Result<RevisedSubscription, ProviderError> {
        let body = serde_json::json!({
            "plan_id": provider_plan_id,
            "application_context": {
                "return_url": self.config.return_url,
                "cancel_url": self.config.cancel_url,
            }
        });

        // Not retried: a duplicate revise would issue a second approval link
        let response = self
            .send_authorized(
                self.http
                    .post(self.url(&format!(
                        "/v1/billing/subscriptions/{}/revise",
                        provider_subscription_id
                    )))
                    .json(&body),
            )
            .await?;
        let revised: ReviseResponse = response.json().await?;

        let approval_url = revised
            .links
            .into_iter()
            .find(|link| link.rel == "approve")
            .map(|link| link.href);

        tracing::info!(
            subscription_id = %provider_subscription_id,
            plan_id = %provider_plan_id,
            has_approval_url = approval_url.is_some(),
            "PayPal subscription revision requested"
        );

        Ok(RevisedSubscription {
            approval_url,
            plan_id: revised.plan_id,
        })
    }

    async fn cancel_subscription(
        &self,
        provider_subscription_id: &str,
        reason: &str,
    ) -> Result<(), ProviderError> {
        self.send_authorized(
            self.http
                .post(self.url(&format!(
                    "/v1/billing/subscriptions/{}/cancel",
                    provider_subscription_id
                )))
                .json(&serde_json::json!({ "reason": reason })),
        )
        .await?;

        tracing::info!(subscription_id = %provider_subscription_id, "PayPal subscription cancelled");
        Ok(())
    }

    async fn get_subscription(
        &self,
        provider_subscription_id: &str,
    ) -> Result<ProviderSubscription, ProviderError> {
        let url = self.url(&format!("/v1/billing/subscriptions/{}", provider_subscription_id));

        let url = &url;
        let body: SubscriptionResponse = self
            .with_retry("get_subscription", || async move {
                let response = self.send_authorized(self.http.get(url)).await?;
                Ok(response.json::<SubscriptionResponse>().await?)
            })
            .await?;

        let next_billing_time = body
            .billing_info
            .and_then(|info| info.next_billing_time)
            .and_then(|t| parse_provider_time(&t));
        let payment_method_mask = body
            .subscriber
            .and_then(|s| s.payment_method_mask());

        Ok(ProviderSubscription {
            id: body.id,
            status: body.status,
            plan_id: body.plan_id,
            next_billing_time,
            payment_method_mask,
        })
    }

    async fn billing_portal_url(
        &self,
        provider_subscription_id: &str,
    ) -> Result<String, ProviderError> {
        // PayPal has no session API; subscribers manage funding on the autopay page
        Ok(format!(
            "{}/{}",
            self.config.manage_url_base, provider_subscription_id
        ))
    }

    async fn verify_webhook_signature(
        &self,
        headers: &WebhookHeaders,
        body: &str,
    ) -> Result<bool, ProviderError> {
        if !headers.is_complete() {
            tracing::warn!("Webhook delivery is missing PayPal signature headers");
            return Ok(false);
        }

        let webhook_event: serde_json::Value = match serde_json::from_str(body) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(error = %e, "Webhook body is not valid JSON");
                return Ok(false);
            }
        };

        let request = VerifyRequest {
            auth_algo: &headers.auth_algo,
            cert_url: &headers.cert_url,
            transmission_id: &headers.transmission_id,
            transmission_sig: &headers.transmission_sig,
            transmission_time: &headers.transmission_time,
            webhook_id: &self.config.webhook_id,
            webhook_event,
        };
        let url = self.url("/v1/notifications/verify-webhook-signature");
        let (url, request) = (&url, &request);

        let verified: VerifyResponse = self
            .with_retry("verify_webhook_signature", || async move {
                let response = self
                    .send_authorized(self.http.post(url).json(request))
                    .await?;
                Ok(response.json::<VerifyResponse>().await?)
            })
            .await?;

        let ok = verified.verification_status == "SUCCESS";
        if !ok {
            tracing::warn!(
                transmission_id = %headers.transmission_id,
                status = %verified.verification_status,
                "PayPal webhook signature rejected"
            );
        }
        Ok(ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN_BODY: &str = r#"{"access_token":"A21AA-test","token_type":"Bearer","expires_in":32400}"#;

    fn client_for(server: &mockito::ServerGuard) -> PayPalClient {
        let config = PayPalConfig::new("client", "secret", "WH-1").with_api_base(server.url());
        PayPalClient::new(config).unwrap()
    }

    fn signed_headers() -> WebhookHeaders {
        WebhookHeaders {
            transmission_id: "tid-1".to_string(),
            transmission_time: "2026-01-01T00:00:00Z".to_string(),
            transmission_sig: "sig".to_string(),
            cert_url: "https://api.paypal.com/cert.pem".to_string(),
            auth_algo: "SHA256withRSA".to_string(),
        }
    }

    #[tokio::test]
    async fn test_token_is_cached_between_calls() {
        let mut server = mockito::Server::new_async().await;
        let token = server
            .mock("POST", "/v1/oauth2/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(TOKEN_BODY)
            .expect(1)
            .create_async()
            .await;
        let sub = server
            .mock("GET", "/v1/billing/subscriptions/I-SUB1")
            .match_header("authorization", "Bearer A21AA-test")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{
                    "id": "I-SUB1",
                    "status": "ACTIVE",
                    "plan_id": "P-PRO-M",
                    "billing_info": {"next_billing_time": "2026-11-01T10:00:00Z"},
                    "subscriber": {"payment_source": {"card": {"last_digits": "4242", "brand": "VISA"}}}
                }"#,
            )
            .expect(2)
            .create_async()
            .await;

        let client = client_for(&server);
        let first = client.get_subscription("I-SUB1").await.unwrap();
        let second = client.get_subscription("I-SUB1").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.status, "ACTIVE");
        assert_eq!(first.plan_id.as_deref(), Some("P-PRO-M"));
        assert_eq!(first.payment_method_mask.as_deref(), Some("VISA ****4242"));
        assert!(first.next_billing_time.is_some());
        token.assert_async().await;
        sub.assert_async().await;
    }

    #[tokio::test]
    async fn test_retryable_status_is_retried_then_surfaced() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/oauth2/token")
            .with_status(200)
            .with_body(TOKEN_BODY)
            .create_async()
            .await;
        let unavailable = server
            .mock("GET", "/v1/billing/subscriptions/I-DOWN")
            .with_status(503)
            .with_body(r#"{"name":"SERVICE_UNAVAILABLE","message":"try later"}"#)
            .expect(3)
            .create_async()
            .await;

        let client = client_for(&server);
        let err = client.get_subscription("I-DOWN").await.unwrap_err();

        assert_eq!(
            err,
            ProviderError::Api {
                status: 503,
                message: "SERVICE_UNAVAILABLE: try later".to_string()
            }
        );
        assert!(err.is_retryable());
        unavailable.assert_async().await;
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/oauth2/token")
            .with_status(200)
            .with_body(TOKEN_BODY)
            .create_async()
            .await;
        let missing = server
            .mock("GET", "/v1/billing/subscriptions/I-GONE")
            .with_status(404)
            .with_body(r#"{"name":"RESOURCE_NOT_FOUND"}"#)
            .expect(1)
            .create_async()
            .await;

        let client = client_for(&server);
        let err = client.get_subscription("I-GONE").await.unwrap_err();
        assert!(!err.is_retryable());
        missing.assert_async().await;
    }

    #[tokio::test]
    async fn test_bad_credentials_are_auth_errors() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/oauth2/token")
            .with_status(401)
            .with_body(r#"{"error":"invalid_client","error_description":"Client Authentication failed"}"#)
            .create_async()
            .await;

        let client = client_for(&server);
        let err = client.cancel_subscription("I-SUB1", "bye").await.unwrap_err();
        assert_eq!(
            err,
            ProviderError::Auth("invalid_client: Client Authentication failed".to_string())
        );
    }

    #[tokio::test]
    async fn test_revise_returns_approval_link() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/oauth2/token")
            .with_status(200)
            .with_body(TOKEN_BODY)
            .create_async()
            .await;
        let revise = server
            .mock("POST", "/v1/billing/subscriptions/I-SUB1/revise")
            .match_body(mockito::Matcher::PartialJson(
                serde_json::json!({ "plan_id": "P-ENT-M" }),
            ))
            .with_status(200)
            .with_body(
                r#"{
                    "plan_id": "P-ENT-M",
                    "links": [
                        {"href": "https://www.paypal.com/webapps/billing/subscriptions/update?ba_token=BA-1", "rel": "approve", "method": "GET"},
                        {"href": "https://api-m.paypal.com/v1/billing/subscriptions/I-SUB1", "rel": "edit", "method": "PATCH"}
                    ]
                }"#,
            )
            .expect(1)
            .create_async()
            .await;

        let client = client_for(&server);
        let revised = client.revise_subscription("I-SUB1", "P-ENT-M").await.unwrap();
        assert_eq!(
            revised.approval_url.as_deref(),
            Some("https://www.paypal.com/webapps/billing/subscriptions/update?ba_token=BA-1")
        );
        revise.assert_async().await;
    }

    #[tokio::test]
    async fn test_verify_signature_success_and_failure() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/oauth2/token")
            .with_status(200)
            .with_body(TOKEN_BODY)
            .create_async()
            .await;
        server
            .mock("POST", "/v1/notifications/verify-webhook-signature")
            .match_body(mockito::Matcher::PartialJson(
                serde_json::json!({ "transmission_id": "tid-1", "webhook_id": "WH-1" }),
            ))
            .with_status(200)
            .with_body(r#"{"verification_status":"SUCCESS"}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/v1/notifications/verify-webhook-signature")
            .match_body(mockito::Matcher::PartialJson(
                serde_json::json!({ "transmission_id": "tid-forged" }),
            ))
            .with_status(200)
            .with_body(r#"{"verification_status":"FAILURE"}"#)
            .create_async()
            .await;

        let client = client_for(&server);
        let body = r#"{"id":"WH-EVT-1","event_type":"BILLING.SUBSCRIPTION.ACTIVATED","resource":{}}"#;

        assert!(client
            .verify_webhook_signature(&signed_headers(), body)
            .await
            .unwrap());

        let mut forged = signed_headers();
        forged.transmission_id = "tid-forged".to_string();
        assert!(!client.verify_webhook_signature(&forged, body).await.unwrap());
    }

    #[tokio::test]
    async fn test_incomplete_headers_fail_without_network() {
        let server = mockito::Server::new_async().await;
        let client = client_for(&server);
        let mut headers = signed_headers();
        headers.transmission_sig.clear();

        assert!(!client
            .verify_webhook_signature(&headers, "{}")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_portal_url_points_at_subscription() {
        let server = mockito::Server::new_async().await;
        let client = client_for(&server);
        let url = client.billing_portal_url("I-SUB1").await.unwrap();
        assert!(url.ends_with("/I-SUB1"));
    }
}
