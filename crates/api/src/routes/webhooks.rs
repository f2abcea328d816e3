use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::post,
    Extension, Json, Router,
};
use gateway_core::events::{normalize_pagerduty, normalize_slack, NormalizedEvent, SlackInbound};
use gateway_core::webhook::{
    SignatureScheme, WebhookEnvelope, PAGERDUTY_SIGNATURE_HEADER, SLACK_SIGNATURE_HEADER,
    SLACK_TIMESTAMP_HEADER,
};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::info;

use crate::{
    error::{ApiResult, AppError},
    state::{AppState, RequestId},
};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/webhooks/pagerduty/{organization_id}", post(pagerduty_webhook))
        .route("/webhooks/slack/{organization_id}", post(slack_webhook))
        .with_state(state)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookAck {
    received: usize,
    events: Vec<NormalizedEvent>,
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Every verification failure gets the same answer; the reason is only
/// logged by the verifier.
fn authenticate(
    state: &AppState,
    scheme: SignatureScheme,
    envelope: &WebhookEnvelope<'_>,
    request_id: &RequestId,
) -> ApiResult<()> {
    state
        .verifier
        .check(scheme, envelope)
        .map_err(|_| AppError::Unauthorized("invalid signature".to_string()).with_request_id(&request_id.0))
}

pub async fn pagerduty_webhook(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Path(organization_id): Path<String>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<WebhookAck>> {
    let envelope = WebhookEnvelope {
        raw_payload: &body,
        provided_signature: header(&headers, PAGERDUTY_SIGNATURE_HEADER),
        provided_timestamp: None,
        secret: state.settings.pagerduty_webhook_secret.as_deref(),
    };
    authenticate(&state, SignatureScheme::RawPayload, &envelope, &request_id)?;

    let payload: Value = serde_json::from_str(&body).map_err(|_| {
        AppError::BadRequest("payload is not valid JSON".to_string()).with_request_id(&request_id.0)
    })?;
    let events = normalize_pagerduty(&payload);

    for event in &events {
        info!(
            organization_id = %organization_id,
            event_id = ?event.event_id,
            event_type = %event.event_type,
            incident_id = ?event.resource_id,
            status = ?event.status,
            "pagerduty event received"
        );
    }

    Ok(Json(WebhookAck {
        received: events.len(),
        events,
    }))
}

pub async fn slack_webhook(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Path(organization_id): Path<String>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Response> {
    let envelope = WebhookEnvelope {
        raw_payload: &body,
        provided_signature: header(&headers, SLACK_SIGNATURE_HEADER),
        provided_timestamp: header(&headers, SLACK_TIMESTAMP_HEADER),
        secret: state.settings.slack_signing_secret.as_deref(),
    };
    authenticate(&state, SignatureScheme::TimestampPrefixed, &envelope, &request_id)?;

    let response = match normalize_slack(&body) {
        SlackInbound::UrlVerification { challenge } => {
            info!(organization_id = %organization_id, "slack url verification");
            Json(json!({ "challenge": challenge })).into_response()
        }
        SlackInbound::Event(event) => {
            info!(
                organization_id = %organization_id,
                event_id = ?event.event_id,
                event_type = %event.event_type,
                channel = ?event.resource_id,
                "slack event received"
            );
            Json(WebhookAck {
                received: 1,
                events: vec![event],
            })
            .into_response()
        }
        SlackInbound::Command { raw } => {
            info!(organization_id = %organization_id, bytes = raw.len(), "slack command received");
            Json(json!({ "response_type": "ephemeral", "text": "Received" })).into_response()
        }
    };
    Ok(response)
}
