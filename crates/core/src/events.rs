//! Normalization of verified inbound webhook payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::Provider;

/// Provider-independent view of one inbound event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedEvent {
    pub provider: Provider,
    pub event_id: Option<String>,
    pub event_type: String,
    pub resource_id: Option<String>,
    pub summary: Option<String>,
    pub status: Option<String>,
    pub urgency: Option<String>,
    pub url: Option<String>,
    pub occurred_at: Option<String>,
}

impl NormalizedEvent {
    fn new(provider: Provider, event_type: impl Into<String>) -> Self {
        Self {
            provider,
            event_id: None,
            event_type: event_type.into(),
            resource_id: None,
            summary: None,
            status: None,
            urgency: None,
            url: None,
            occurred_at: None,
        }
    }
}

fn text(value: &Value, pointer: &str) -> Option<String> {
    value.pointer(pointer).and_then(Value::as_str).map(str::to_string)
}

fn incident_fields(mut event: NormalizedEvent, incident: &Value) -> NormalizedEvent {
    event.resource_id = text(incident, "/id");
    event.summary = text(incident, "/title").or_else(|| text(incident, "/summary"));
    event.status = text(incident, "/status");
    event.urgency = text(incident, "/urgency");
    event.url = text(incident, "/html_url");
    event
}

/// Accepts both the v3 envelope (`{"event": {...}}`) and the v2 envelope
/// (`{"messages": [...]}`). Returns an empty list for anything else.
pub fn normalize_pagerduty(payload: &Value) -> Vec<NormalizedEvent> {
    if let Some(event) = payload.get("event").filter(|e| e.is_object()) {
        let event_type = text(event, "/event_type").unwrap_or_else(|| "unknown".to_string());
        let mut normalized = incident_fields(
            NormalizedEvent::new(Provider::PagerDuty, event_type),
            event.get("data").unwrap_or(&Value::Null),
        );
        normalized.event_id = text(event, "/id");
        normalized.occurred_at = text(event, "/occurred_at");
        return vec![normalized];
    }

    payload
        .get("messages")
        .and_then(Value::as_array)
        .map(|messages| {
            messages
                .iter()
                .map(|message| {
                    let event_type =
                        text(message, "/event").unwrap_or_else(|| "unknown".to_string());
                    let mut normalized = incident_fields(
                        NormalizedEvent::new(Provider::PagerDuty, event_type),
                        message.get("incident").unwrap_or(&Value::Null),
                    );
                    normalized.event_id = text(message, "/id");
                    normalized.occurred_at = text(message, "/created_on");
                    normalized
                })
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq)]
pub enum SlackInbound {
    /// Endpoint ownership check; the challenge must be echoed back.
    UrlVerification { challenge: String },
    Event(NormalizedEvent),
    /// Non-JSON body, e.g. a form-encoded slash command.
    Command { raw: String },
}

pub fn normalize_slack(raw_payload: &str) -> SlackInbound {
    let Ok(payload) = serde_json::from_str::<Value>(raw_payload) else {
        return SlackInbound::Command {
            raw: raw_payload.to_string(),
        };
    };

    match payload.get("type").and_then(Value::as_str) {
        Some("url_verification") => SlackInbound::UrlVerification {
            challenge: text(&payload, "/challenge").unwrap_or_default(),
        },
        Some("event_callback") => {
            let inner = payload.get("event").unwrap_or(&Value::Null);
            let event_type = text(inner, "/type").unwrap_or_else(|| "unknown".to_string());
            let mut event = NormalizedEvent::new(Provider::Slack, event_type);
            event.event_id = text(&payload, "/event_id");
            event.resource_id = text(inner, "/channel");
            event.summary = text(inner, "/text");
            event.occurred_at = payload
                .get("event_time")
                .and_then(Value::as_i64)
                .map(|t| t.to_string());
            SlackInbound::Event(event)
        }
        other => SlackInbound::Event(NormalizedEvent::new(
            Provider::Slack,
            other.unwrap_or("unknown"),
        )),
    }
}
