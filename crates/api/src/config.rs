//! API server configuration

use std::env;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Settings read from the environment at startup
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    pub jwt_secret: String,
    pub jwt_expiry_hours: i64,
    /// Origins allowed by the CORS layer
    pub allowed_origins: Vec<String>,
    /// Apply pending migrations before serving
    pub run_migrations: bool,
}

const DEFAULT_ALLOWED_ORIGINS: &str = "http://localhost:3000,http://127.0.0.1:3000";

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url =
            env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;
        let jwt_secret = env::var("JWT_SECRET").map_err(|_| ConfigError::Missing("JWT_SECRET"))?;
        if jwt_secret.len() < 32 {
            return Err(ConfigError::Invalid {
                name: "JWT_SECRET",
                reason: "must be at least 32 characters".to_string(),
            });
        }

        let jwt_expiry_hours = match env::var("JWT_EXPIRY_HOURS") {
            Ok(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                name: "JWT_EXPIRY_HOURS",
                reason: format!("'{}' is not a number", raw),
            })?,
            Err(_) => 24,
        };

        Ok(Self {
            database_url,
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            jwt_secret,
            jwt_expiry_hours,
            allowed_origins: parse_origins(
                &env::var("ALLOWED_ORIGINS").unwrap_or_else(|_| DEFAULT_ALLOWED_ORIGINS.to_string()),
            ),
            run_migrations: env::var("RUN_MIGRATIONS")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(true),
        })
    }
}

fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_origins_skips_blanks() {
        assert_eq!(
            parse_origins(" https://app.clinicdesk.io, ,http://localhost:3000 "),
            vec![
                "https://app.clinicdesk.io".to_string(),
                "http://localhost:3000".to_string()
            ]
        );
    }
}
