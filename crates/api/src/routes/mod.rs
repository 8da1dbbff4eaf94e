//! HTTP routes

pub mod admin;
pub mod billing;
pub mod webhooks;

use axum::{
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::{
    auth::{require_admin, require_auth},
    state::AppState,
};

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub fn create_router(state: AppState) -> Router {
    let billing_routes = Router::new()
        .route("/plans", get(billing::list_plans))
        .route("/change-plan", post(billing::change_plan))
        .route("/preview", post(billing::preview_change))
        .route("/portal", post(billing::open_portal))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let admin_routes = Router::new()
        .route("/billing/sync", post(admin::bulk_sync))
        .route("/billing/invariants", get(admin::check_invariants))
        .route("/plans/{plan_id}/migrate", post(admin::migrate_plan))
        .route("/users/{user_id}/plan", post(admin::assign_plan))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));

    // Signature-authenticated, no bearer token
    let webhook_routes = Router::new().route("/stripe", post(webhooks::stripe_webhook));

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1/billing", billing_routes)
        .nest("/api/v1/admin", admin_routes)
        .nest("/api/v1/webhooks", webhook_routes)
        .with_state(state)
}
