//! Worker configuration

use std::env;

/// Every five minutes, on the minute
pub const DEFAULT_RECONCILE_CRON: &str = "0 */5 * * * *";
/// Daily at 03:30 UTC
pub const DEFAULT_INVARIANT_CRON: &str = "0 30 3 * * *";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    Missing(&'static str),
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub reconcile_cron: String,
    pub invariant_cron: String,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
            reconcile_cron: cron_or_default("RECONCILE_CRON", DEFAULT_RECONCILE_CRON),
            invariant_cron: cron_or_default("INVARIANT_CRON", DEFAULT_INVARIANT_CRON),
        })
    }
}

fn cron_or_default(name: &str, default: &str) -> String {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}
