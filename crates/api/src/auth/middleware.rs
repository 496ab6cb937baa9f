//! Authentication middleware for Axum

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use clinicdesk_billing::{ActorContext, ActorRole};
use serde_json::json;
use uuid::Uuid;

use super::jwt::JwtManager;

/// Authenticated caller extracted from the bearer token
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub tenant_id: Option<Uuid>,
    pub role: ActorRole,
}

impl AuthUser {
    /// Get tenant_id, returning an error if the caller has no home clinic
    pub fn require_tenant_id(&self) -> Result<Uuid, AuthError> {
        self.tenant_id.ok_or(AuthError::NoTenant)
    }

    /// Billing actor for this caller
    pub fn actor(&self) -> ActorContext {
        ActorContext {
            actor_id: self.user_id,
            tenant_id: self.tenant_id,
            role: self.role,
        }
    }
}

/// State needed for authentication
#[derive(Clone)]
pub struct AuthState {
    pub jwt_manager: JwtManager,
}

/// Extract bearer token from the Authorization header
fn extract_bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

fn authenticate_jwt(auth_state: &AuthState, token: &str) -> Result<AuthUser, AuthError> {
    let claims = auth_state.jwt_manager.validate_token(token).map_err(|e| {
        tracing::debug!(error = %e, "JWT validation failed");
        AuthError::InvalidToken
    })?;

    if claims.role == ActorRole::TenantUser && claims.tenant_id.is_none() {
        return Err(AuthError::NoTenant);
    }

    Ok(AuthUser {
        user_id: claims.sub,
        tenant_id: claims.tenant_id,
        role: claims.role,
    })
}

/// Middleware that requires authentication
pub async fn require_auth(
    State(auth_state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let auth_result = match extract_bearer_token(&request) {
        Some(token) => authenticate_jwt(&auth_state, token),
        None => Err(AuthError::MissingAuth),
    };

    match auth_result {
        Ok(auth_user) => {
            tracing::debug!(
                path = %path,
                user_id = %auth_user.user_id,
                tenant_id = ?auth_user.tenant_id,
                role = ?auth_user.role,
                "require_auth: authentication successful"
            );
            request.extensions_mut().insert(auth_user);
            next.run(request).await
        }
        Err(err) => {
            tracing::warn!(path = %path, error = ?err, "require_auth: authentication failed");
            err.into_response()
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing authentication")]
    MissingAuth,
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("No clinic found for user")]
    NoTenant,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthError::MissingAuth => (StatusCode::UNAUTHORIZED, "Authentication required"),
            AuthError::InvalidToken => (StatusCode::UNAUTHORIZED, "Invalid or expired token"),
            AuthError::NoTenant => (
                StatusCode::BAD_REQUEST,
                "No clinic found for this account.",
            ),
        };

        let body = Json(json!({
            "error": message,
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenant_user_token_without_tenant_is_rejected() {
        let manager = JwtManager::new("test-jwt-secret-key-for-testing-only", 1);
        let token = manager
            .generate_token(Uuid::new_v4(), None, ActorRole::TenantUser)
            .unwrap();
        let state = AuthState {
            jwt_manager: manager,
        };

        assert!(matches!(
            authenticate_jwt(&state, &token),
            Err(AuthError::NoTenant)
        ));
    }

    #[test]
    fn test_saas_manager_actor_has_no_home_tenant() {
        let user = AuthUser {
            user_id: Uuid::new_v4(),
            tenant_id: None,
            role: ActorRole::SaasManager,
        };

        let actor = user.actor();
        assert!(actor.is_saas_manager());
        assert!(actor.tenant_id.is_none());
        assert!(user.require_tenant_id().is_err());
    }
}
