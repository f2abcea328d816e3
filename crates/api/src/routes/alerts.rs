use axum::{extract::State, http::StatusCode, routing::post, Extension, Json, Router};
use gateway_core::{GatewayRequest, Metered, Provider};
use integrations::pagerduty::{Incident, IncidentRequest, Severity};
use integrations::slack::{Posted, SlackMessage};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::{ApiResult, AppError},
    middleware::org::OrgContext,
    routes::{settle, CallMeta},
    state::{AppState, RequestId},
};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/incidents", post(create_incident))
        .route("/v1/messages", post(post_message))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateIncidentRequest {
    summary: String,
    source: Option<String>,
    severity: Option<Severity>,
    component: Option<String>,
    service_id: Option<String>,
    #[serde(default)]
    details: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostMessageRequest {
    text: String,
    channel: Option<String>,
}

/// Where an alert ended up.
#[derive(Debug, Serialize)]
#[serde(tag = "channel", content = "receipt", rename_all = "lowercase")]
enum Delivery {
    PagerDuty(Incident),
    Slack(Posted),
}

impl Metered for Delivery {}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AlertResponse {
    #[serde(flatten)]
    meta: CallMeta,
    delivery: Delivery,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MessageResponse {
    #[serde(flatten)]
    meta: CallMeta,
    message: Posted,
}

/// Opens a PagerDuty incident, falling back to a Slack alert when PagerDuty
/// cannot take it.
pub async fn create_incident(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Extension(org): Extension<OrgContext>,
    Json(payload): Json<CreateIncidentRequest>,
) -> ApiResult<(StatusCode, Json<AlertResponse>)> {
    if payload.summary.trim().is_empty() {
        return Err(AppError::BadRequest("summary required".to_string()).with_request_id(&request_id.0));
    }

    let incident = IncidentRequest {
        service_id: payload
            .service_id
            .or_else(|| state.settings.pagerduty_service_id.clone())
            .unwrap_or_default(),
        summary: payload.summary,
        source: payload.source.unwrap_or_else(|| "processaudit".to_string()),
        severity: payload.severity.unwrap_or(Severity::Error),
        component: payload.component,
        details: payload.details,
    };
    let alert = SlackMessage::alert(incident.severity.as_str(), &incident.summary, &incident.source);

    let pagerduty = GatewayRequest::new(&org.organization_id, Provider::PagerDuty)
        .target(incident.circuit_target());
    let mut slack = GatewayRequest::new(&org.organization_id, Provider::Slack);
    if let Some(client) = state.clients.slack.as_deref() {
        slack = slack.target(client.circuit_target(&alert));
    }
    let gateway = &state.gateway;

    let outcome = match (state.clients.pagerduty.as_deref(), state.clients.slack.as_deref()) {
        (Some(pd), Some(sl)) => {
            let (incident, alert) = (&incident, &alert);
            gateway
                .execute_with_fallback(
                    &pagerduty,
                    move || async move { pd.create_incident(incident).await.map(Delivery::PagerDuty) },
                    &slack,
                    move || async move { sl.post_message(alert).await.map(Delivery::Slack) },
                )
                .await
        }
        (Some(pd), None) => {
            let incident = &incident;
            gateway
                .execute(&pagerduty, move || async move {
                    pd.create_incident(incident).await.map(Delivery::PagerDuty)
                })
                .await
        }
        (None, Some(sl)) => {
            let alert = &alert;
            gateway
                .execute(&slack, move || async move {
                    sl.post_message(alert).await.map(Delivery::Slack)
                })
                .await
        }
        (None, None) => {
            return Err(AppError::NotConfigured("alerting").with_request_id(&request_id.0));
        }
    };

    let (meta, delivery) = settle(outcome, &org.organization_id, &request_id)?;
    Ok((StatusCode::CREATED, Json(AlertResponse { meta, delivery })))
}

pub async fn post_message(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Extension(org): Extension<OrgContext>,
    Json(payload): Json<PostMessageRequest>,
) -> ApiResult<Json<MessageResponse>> {
    let Some(client) = state.clients.slack.as_deref() else {
        return Err(AppError::NotConfigured("Slack").with_request_id(&request_id.0));
    };
    let message = SlackMessage {
        channel: payload.channel,
        ..SlackMessage::text(payload.text)
    };

    let request = GatewayRequest::new(&org.organization_id, Provider::Slack)
        .target(client.circuit_target(&message));
    let message = &message;
    let outcome = state
        .gateway
        .execute(&request, move || async move { client.post_message(message).await })
        .await;

    let (meta, message) = settle(outcome, &org.organization_id, &request_id)?;
    Ok(Json(MessageResponse { meta, message }))
}
