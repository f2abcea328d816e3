use axum::{extract::State, routing::post, Extension, Json, Router};
use gateway_core::{GatewayRequest, TokenUsage};
use integrations::ai::{AiRequest, CompletionClient};
use serde::{Deserialize, Serialize};

use crate::{
    error::{ApiResult, AppError},
    middleware::org::OrgContext,
    routes::{settle, CallMeta},
    state::{AppState, RequestId},
};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/analyze", post(analyze))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeRequest {
    prompt: String,
    system: Option<String>,
    max_tokens: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeResponse {
    #[serde(flatten)]
    meta: CallMeta,
    model: String,
    text: String,
    usage: TokenUsage,
    #[serde(skip_serializing_if = "Option::is_none")]
    cost: Option<f64>,
}

/// Runs a completion on Claude, falling back to OpenAI. Each provider is
/// held to the organization's plan limit for the current window.
pub async fn analyze(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Extension(org): Extension<OrgContext>,
    Json(payload): Json<AnalyzeRequest>,
) -> ApiResult<Json<AnalyzeResponse>> {
    if payload.prompt.trim().is_empty() {
        return Err(AppError::BadRequest("prompt required".to_string()).with_request_id(&request_id.0));
    }

    let mut request = AiRequest::new(payload.prompt);
    request.system = payload.system;
    if let Some(max_tokens) = payload.max_tokens {
        request.max_tokens = max_tokens;
    }

    let limit = state.settings.plan_limits.limit_for(org.plan);
    let gateway_request = |client: &dyn CompletionClient| {
        GatewayRequest::new(&org.organization_id, client.provider()).quota_limit(limit)
    };

    let clients: Vec<&dyn CompletionClient> = [state.clients.claude.as_deref(), state.clients.openai.as_deref()]
        .into_iter()
        .flatten()
        .collect();

    let request = &request;
    let outcome = match clients.as_slice() {
        [primary, fallback] => {
            let (primary, fallback) = (*primary, *fallback);
            state
                .gateway
                .execute_with_fallback(
                    &gateway_request(primary),
                    move || primary.complete(request),
                    &gateway_request(fallback),
                    move || fallback.complete(request),
                )
                .await
        }
        [only] => {
            let only = *only;
            state
                .gateway
                .execute(&gateway_request(only), move || only.complete(request))
                .await
        }
        _ => return Err(AppError::NotConfigured("AI analysis").with_request_id(&request_id.0)),
    };

    let (meta, completion) = settle(outcome, &org.organization_id, &request_id)?;
    Ok(Json(AnalyzeResponse {
        meta,
        model: completion.model,
        text: completion.text,
        usage: completion.usage,
        cost: completion.cost,
    }))
}
