//! Application state

use std::sync::Arc;

use clinicdesk_billing::BillingService;

use crate::{
    auth::{AuthState, JwtManager},
    config::Config,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub jwt_manager: JwtManager,
    pub billing: Arc<BillingService>,
}

impl AppState {
    pub fn new(config: Config, billing: Arc<BillingService>) -> Self {
        let jwt_manager = JwtManager::new(&config.jwt_secret, config.jwt_expiry_hours);
        Self {
            config,
            jwt_manager,
            billing,
        }
    }

    /// Get auth state for middleware
    pub fn auth_state(&self) -> AuthState {
        AuthState {
            jwt_manager: self.jwt_manager.clone(),
        }
    }
}
