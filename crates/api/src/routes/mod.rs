pub mod ai;
pub mod alerts;
pub mod health;
pub mod usage;
pub mod webhooks;

use axum::{middleware::from_fn, Router};
use gateway_core::gateway::GatewayOutcome;
use gateway_core::Provider;
use serde::Serialize;
use tracing::info;

use crate::{
    error::{ApiResult, AppError},
    middleware::{org::organization, request_id::request_id},
    state::{AppState, RequestId},
};

pub fn v1_router(state: AppState) -> Router {
    Router::new()
        .merge(alerts::router(state.clone()))
        .merge(ai::router(state.clone()))
        .merge(usage::router(state))
}

pub fn public_router(state: AppState) -> Router {
    Router::new()
        .merge(health::router(state.clone()))
        .merge(webhooks::router(state))
}

/// Full application. The organization layer covers `/v1` only; request ids
/// wrap everything.
pub fn app(state: AppState) -> Router {
    let v1 = v1_router(state.clone()).layer(from_fn(organization));

    Router::new()
        .merge(public_router(state))
        .merge(v1)
        .layer(from_fn(request_id))
}

/// Gateway metadata returned alongside every outbound result.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallMeta {
    pub correlation_id: String,
    pub provider: Provider,
    pub attempts: u32,
    pub used_fallback: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_from: Option<Provider>,
}

/// Logs the outcome's audit trail and turns it into a handler result.
pub(crate) fn settle<T>(
    outcome: GatewayOutcome<T>,
    organization_id: &str,
    request_id: &RequestId,
) -> ApiResult<(CallMeta, T)> {
    for event in outcome.audit_events() {
        info!(
            organization_id,
            request_id = %request_id.0,
            audit = ?event,
            "gateway audit event"
        );
    }

    let meta = CallMeta {
        correlation_id: outcome.correlation_id,
        provider: outcome.provider,
        attempts: outcome.attempts,
        used_fallback: outcome.used_fallback,
        fallback_from: outcome.fallback_from,
    };

    match outcome.result {
        Ok(value) => Ok((meta, value)),
        Err(err) => Err(AppError::from(err)
            .with_request_id(&request_id.0)
            .with_correlation_id(&meta.correlation_id)),
    }
}
