//! Operator routes
//!
//! These routes are protected by `require_admin`.

use axum::{
    extract::{Extension, Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use wplib_billing::{
    BulkSyncReport, InvariantCheckSummary, MigrationPrice, MigrationResult, RecordWrite,
    SubscriptionRecord,
};

use crate::{auth::AuthUser, error::ApiResult, state::AppState};

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct MigratePlanBody {
    pub prices: Vec<MigrationPrice>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignPlanBody {
    pub plan_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct AssignPlanResponse {
    pub write: RecordWrite,
    pub record: Option<SubscriptionRecord>,
}

// =============================================================================
// Handlers
// =============================================================================

/// Reconcile every provider subscription
pub async fn bulk_sync(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<BulkSyncReport>> {
    tracing::info!(admin_id = %auth_user.user_id, "Bulk sync requested");
    let report = state.billing.bulk_sync.run().await?;
    Ok(Json(report))
}

pub async fn check_invariants(
    State(state): State<AppState>,
) -> ApiResult<Json<InvariantCheckSummary>> {
    let summary = state.billing.invariants.run().await?;
    Ok(Json(summary))
}

pub async fn migrate_plan(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(plan_id): Path<Uuid>,
    Json(body): Json<MigratePlanBody>,
) -> ApiResult<Json<MigrationResult>> {
    tracing::info!(
        admin_id = %auth_user.user_id,
        local_plan_id = %plan_id,
        prices = body.prices.len(),
        "Local plan migration requested"
    );
    let result = state.billing.migrator.migrate(plan_id, &body.prices).await?;
    Ok(Json(result))
}

pub async fn assign_plan(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(user_id): Path<Uuid>,
    Json(body): Json<AssignPlanBody>,
) -> ApiResult<Json<AssignPlanResponse>> {
    tracing::info!(
        admin_id = %auth_user.user_id,
        user_id = %user_id,
        local_plan_id = %body.plan_id,
        "Local plan assignment requested"
    );
    let outcome = state.billing.assigner.assign(user_id, body.plan_id).await?;
    Ok(Json(AssignPlanResponse {
        write: outcome.write,
        record: outcome.record,
    }))
}
