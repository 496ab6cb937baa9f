//! HS256 access tokens

use clinicdesk_billing::ActorRole;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

/// Claims carried by every access token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub sub: Uuid,
    /// Home clinic; absent for platform operators
    #[serde(default)]
    pub tenant_id: Option<Uuid>,
    pub role: ActorRole,
    pub exp: i64,
    pub iat: i64,
}

#[derive(Clone)]
pub struct JwtManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    expiry_hours: i64,
}

impl JwtManager {
    pub fn new(secret: &str, expiry_hours: i64) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;

        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            expiry_hours,
        }
    }

    /// Issue a token; used by the identity service and in tests
    pub fn generate_token(
        &self,
        user_id: Uuid,
        tenant_id: Option<Uuid>,
        role: ActorRole,
    ) -> Result<String, jsonwebtoken::errors::Error> {
        let now = OffsetDateTime::now_utc();
        let claims = Claims {
            sub: user_id,
            tenant_id,
            role,
            exp: (now + Duration::hours(self.expiry_hours)).unix_timestamp(),
            iat: now.unix_timestamp(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
    }

    pub fn validate_token(&self, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
        decode::<Claims>(token, &self.decoding_key, &self.validation).map(|data| data.claims)
    }
}
