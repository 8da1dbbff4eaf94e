//! Billing error types

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    /// Missing credentials or identifiers; raised at startup
    #[error("Billing configuration error: {0}")]
    Config(String),

    /// Request rejected before any external call
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Stripe error: {0}")]
    Stripe(#[from] stripe::StripeError),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid webhook signature")]
    WebhookSignatureInvalid,

    #[error("Malformed webhook payload: {0}")]
    WebhookPayload(String),

    /// A provider object could not be mapped to a local user or plan
    #[error("Resolution failed: {0}")]
    Resolution(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(err: reqwest::Error) -> Self {
        BillingError::StripeApi(err.to_string())
    }
}

impl BillingError {
    /// Errors raised by the billing provider (network, 4xx, 5xx)
    pub fn is_upstream(&self) -> bool {
        matches!(self, BillingError::StripeApi(_) | BillingError::Stripe(_))
    }
}
