//! Application state

use axum::extract::FromRef;
use sqlx::PgPool;
use std::sync::Arc;
use wplib_billing::BillingService;

use crate::{
    auth::{AuthState, JwtManager},
    config::Config,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub billing: Arc<BillingService>,
    pub auth: AuthState,
}

impl AppState {
    /// Production wiring: Stripe and Postgres behind the billing ports
    pub fn new(pool: PgPool, config: Config) -> Self {
        let billing = BillingService::new(config.stripe.clone(), pool);
        tracing::info!(api_base = %config.stripe.api_base, "Stripe billing service initialized");
        Self::with_billing(config, Arc::new(billing))
    }

    pub fn with_billing(config: Config, billing: Arc<BillingService>) -> Self {
        let auth = AuthState {
            jwt_manager: JwtManager::new(&config.jwt_secret, config.jwt_expiry_hours),
        };
        Self {
            config,
            billing,
            auth,
        }
    }
}

impl FromRef<AppState> for AuthState {
    fn from_ref(state: &AppState) -> Self {
        state.auth.clone()
    }
}
