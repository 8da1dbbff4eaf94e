//! Stripe webhook endpoint

use axum::{extract::State, http::HeaderMap, Json};
use serde_json::{json, Value};

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

const SIGNATURE_HEADER: &str = "stripe-signature";

/// Verify, then reconcile. Any non-2xx makes Stripe redeliver.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<Value>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Webhook request without a Stripe-Signature header");
            ApiError::Validation("Missing Stripe-Signature header".to_string())
        })?;

    let outcome = state.billing.webhooks.process(&body, signature).await?;
    tracing::debug!(outcome = ?outcome, "Webhook processed");

    Ok(Json(json!({ "received": true })))
}
