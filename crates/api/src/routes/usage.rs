use axum::{
    extract::{Query, State},
    routing::get,
    Extension, Json, Router,
};
use gateway_core::circuit::CircuitSnapshot;
use gateway_core::error::QuotaError;
use gateway_core::quota::{ThresholdStatus, UsageStats};
use gateway_core::{Plan, Provider};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::{
    error::{ApiResult, AppError},
    middleware::org::OrgContext,
    state::{AppState, RequestId},
};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/usage", get(usage))
        .route("/v1/circuits", get(circuits))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct UsageQuery {
    provider: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProviderLimit {
    provider: Provider,
    #[serde(flatten)]
    status: ThresholdStatus,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UsageResponse {
    plan: Plan,
    stats: UsageStats,
    limits: Vec<ProviderLimit>,
}

#[derive(Debug, Serialize)]
struct CircuitsResponse {
    items: Vec<CircuitSnapshot>,
}

/// Current-window usage for the calling organization, with the plan limit
/// standing of each AI provider.
pub async fn usage(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Extension(org): Extension<OrgContext>,
    Query(query): Query<UsageQuery>,
) -> ApiResult<Json<UsageResponse>> {
    let provider = match query.provider.as_deref() {
        Some(raw) => Some(
            raw.parse::<Provider>()
                .map_err(|e| AppError::BadRequest(e).with_request_id(&request_id.0))?,
        ),
        None => None,
    };

    let store_failure = |err: QuotaError| {
        error!(organization_id = %org.organization_id, error = %err, "usage lookup failed");
        AppError::Internal.with_request_id(&request_id.0)
    };

    let tracker = state.gateway.tracker();
    let stats = tracker
        .usage_stats(&org.organization_id, provider)
        .await
        .map_err(store_failure)?;

    let limit = state.settings.plan_limits.limit_for(org.plan);
    let mut limits = Vec::new();
    for ai in Provider::ALL.into_iter().filter(Provider::is_ai) {
        if provider.is_some_and(|p| p != ai) {
            continue;
        }
        let status = tracker
            .check_threshold(&org.organization_id, ai, limit)
            .await
            .map_err(store_failure)?;
        limits.push(ProviderLimit {
            provider: ai,
            status,
        });
    }

    Ok(Json(UsageResponse {
        plan: org.plan,
        stats,
        limits,
    }))
}

pub async fn circuits(State(state): State<AppState>) -> Json<CircuitsResponse> {
    Json(CircuitsResponse {
        items: state.gateway.breaker().snapshots().await,
    })
}
