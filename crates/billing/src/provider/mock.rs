//! Scriptable in-process provider for tests

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{
    PaymentProvider, ProviderError, ProviderSubscription, RevisedSubscription, WebhookHeaders,
};
use crate::store::PAYPAL_PROVIDER;

/// Recorded provider interaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderCall {
    Revise {
        subscription_id: String,
        plan_id: String,
    },
    Cancel {
        subscription_id: String,
        reason: String,
    },
    Get {
        subscription_id: String,
    },
    PortalUrl {
        subscription_id: String,
    },
    Verify {
        transmission_id: String,
    },
}

#[derive(Default)]
struct MockState {
    calls: Vec<ProviderCall>,
    fail_next: Option<ProviderError>,
    reject_signatures: bool,
    subscriptions: HashMap<String, ProviderSubscription>,
}

/// Accepts every signature unless told otherwise and answers from canned data
#[derive(Default)]
pub struct MockProvider {
    state: Mutex<MockState>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fail the next outbound call with `err`
    pub fn fail_next(&self, err: ProviderError) {
        self.state().fail_next = Some(err);
    }

    pub fn reject_signatures(&self, reject: bool) {
        self.state().reject_signatures = reject;
    }

    pub fn set_subscription(&self, subscription: ProviderSubscription) {
        self.state()
            .subscriptions
            .insert(subscription.id.clone(), subscription);
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        self.state().calls.clone()
    }

    /// Calls other than signature verification
    pub fn outbound_calls(&self) -> Vec<ProviderCall> {
        self.calls()
            .into_iter()
            .filter(|c| !matches!(c, ProviderCall::Verify { .. }))
            .collect()
    }

    fn record(&self, call: ProviderCall) -> Result<(), ProviderError> {
        let mut state = self.state();
        state.calls.push(call);
        match state.fail_next.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl PaymentProvider for MockProvider {
    fn name(&self) -> &'static str {
        PAYPAL_PROVIDER
    }

    async fn revise_subscription(
        &self,
        provider_subscription_id: &str,
        provider_plan_id: &str,
    ) -> Result<RevisedSubscription, ProviderError> {
        self.record(ProviderCall::Revise {
            subscription_id: provider_subscription_id.to_string(),
            plan_id: provider_plan_id.to_string(),
        })?;
        Ok(RevisedSubscription {
            approval_url: Some(format!(
                "https://paypal.test/approve/{}?plan={}",
                provider_subscription_id, provider_plan_id
            )),
            plan_id: Some(provider_plan_id.to_string()),
        })
    }

    async fn cancel_subscription(
        &self,
        provider_subscription_id: &str,
        reason: &str,
    ) -> Result<(), ProviderError> {
        self.record(ProviderCall::Cancel {
            subscription_id: provider_subscription_id.to_string(),
            reason: reason.to_string(),
        })
    }

    async fn get_subscription(
        &self,
        provider_subscription_id: &str,
    ) -> Result<ProviderSubscription, ProviderError> {
        self.record(ProviderCall::Get {
            subscription_id: provider_subscription_id.to_string(),
        })?;
        self.state()
            .subscriptions
            .get(provider_subscription_id)
            .cloned()
            .ok_or_else(|| ProviderError::Api {
                status: 404,
                message: "RESOURCE_NOT_FOUND".to_string(),
            })
    }

    async fn billing_portal_url(
        &self,
        provider_subscription_id: &str,
    ) -> Result<String, ProviderError> {
        self.record(ProviderCall::PortalUrl {
            subscription_id: provider_subscription_id.to_string(),
        })?;
        Ok(format!("https://paypal.test/autopay/{}", provider_subscription_id))
    }

    async fn verify_webhook_signature(
        &self,
        headers: &WebhookHeaders,
        _body: &str,
    ) -> Result<bool, ProviderError> {
        let mut state = self.state();
        state.calls.push(ProviderCall::Verify {
            transmission_id: headers.transmission_id.clone(),
        });
        Ok(!state.reject_signatures)
    }
}
