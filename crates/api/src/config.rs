//! Server configuration

use wplib_billing::StripeConfig;

const DEFAULT_ORIGINS: &str = "http://localhost:3000,http://127.0.0.1:3000";

/// Application configuration, read once at startup
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    pub database_url: String,
    pub jwt_secret: String,
    pub jwt_expiry_hours: i64,
    pub allowed_origins: Vec<String>,
    pub stripe: StripeConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} not set")]
    Missing(&'static str),
    #[error("{key} is invalid: {value}")]
    Invalid { key: &'static str, value: String },
    #[error(transparent)]
    Billing(#[from] wplib_billing::BillingError),
}

impl Config {
    /// Load configuration from environment variables. Call after
    /// `dotenvy::dotenv()` so a local `.env` is honored.
    pub fn from_env() -> Result<Self, ConfigError> {
        let required = |key: &'static str| {
            std::env::var(key)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .ok_or(ConfigError::Missing(key))
        };

        let jwt_expiry_hours = match std::env::var("JWT_EXPIRY_HOURS") {
            Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
                key: "JWT_EXPIRY_HOURS",
                value: raw,
            })?,
            Err(_) => 24,
        };

        Ok(Self {
            bind_address: std::env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            database_url: required("DATABASE_URL")?,
            jwt_secret: required("JWT_SECRET")?,
            jwt_expiry_hours,
            allowed_origins: parse_origins(
                &std::env::var("ALLOWED_ORIGINS").unwrap_or_else(|_| DEFAULT_ORIGINS.to_string()),
            ),
            stripe: StripeConfig::from_env()?,
        })
    }
}

/// Comma separated list, blanks dropped
pub fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
