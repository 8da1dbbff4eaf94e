//! Subscriber billing routes
//!
//! All routes here run behind `require_auth`; the caller's user id comes
//! from the token, never from the body.

use axum::{
    body::Bytes,
    extract::{Extension, State},
    Json,
};
use serde::Deserialize;
use wplib_billing::{
    HostedSession, InvoicePreview, PlanChangeOutcome, PlanChangeRequest, PlanSummary, UpdateType,
};

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePlanBody {
    pub price_id: String,
    pub return_url: Option<String>,
    pub update_type: Option<UpdateType>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewBody {
    pub subscription_id: String,
    pub new_price_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortalBody {
    pub return_url: Option<String>,
}

/// List catalog plans with their limits
pub async fn list_plans(State(state): State<AppState>) -> ApiResult<Json<Vec<PlanSummary>>> {
    let plans = state.billing.catalog.list_plans().await?;
    Ok(Json(plans))
}

/// Upgrade now, downgrade at period end, or hand off to a hosted page
pub async fn change_plan(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(body): Json<ChangePlanBody>,
) -> ApiResult<Json<PlanChangeOutcome>> {
    let request = PlanChangeRequest {
        user_id: auth_user.user_id,
        price_id: body.price_id,
        return_url: body.return_url,
        update_type: body.update_type,
    };
    let outcome = state.billing.subscriptions.change_plan(&request).await?;
    Ok(Json(outcome))
}

pub async fn preview_change(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(body): Json<PreviewBody>,
) -> ApiResult<Json<InvoicePreview>> {
    let preview = state
        .billing
        .previewer
        .preview_for_user(auth_user.user_id, &body.subscription_id, &body.new_price_id)
        .await?;
    Ok(Json(preview))
}

pub async fn open_portal(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    body: Bytes,
) -> ApiResult<Json<HostedSession>> {
    // Body is optional
    let body: PortalBody = if body.is_empty() {
        PortalBody::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::Validation(e.to_string()))?
    };
    let session = state
        .billing
        .subscriptions
        .open_portal(auth_user.user_id, body.return_url.as_deref())
        .await?;
    Ok(Json(session))
}
