use std::time::Duration;

use gateway_core::error::IntegrationError;
use gateway_core::types::Metered;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::http::{build_client, check_response, decode_json, transport_error};

pub const DEFAULT_BASE_URL: &str = "https://api.pagerduty.com";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Error,
    Warning,
    Info,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
        }
    }

    pub fn urgency(&self) -> &'static str {
        match self {
            Severity::Critical | Severity::Error => "high",
            Severity::Warning | Severity::Info => "low",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentRequest {
    pub service_id: String,
    pub summary: String,
    pub source: String,
    pub severity: Severity,
    #[serde(default)]
    pub component: Option<String>,
    #[serde(default)]
    pub details: Value,
}

impl IncidentRequest {
    /// Circuit key: one breaker per PagerDuty service.
    pub fn circuit_target(&self) -> String {
        format!("pagerduty:{}", self.service_id)
    }

    pub fn validate(&self) -> Result<(), IntegrationError> {
        if self.service_id.trim().is_empty() {
            return Err(IntegrationError::InvalidInput("service_id is required".into()));
        }
        if self.summary.trim().is_empty() {
            return Err(IntegrationError::InvalidInput("summary is required".into()));
        }
        Ok(())
    }

    fn body(&self) -> Value {
        json!({
            "incident": {
                "type": "incident",
                "title": &self.summary,
                "urgency": self.severity.urgency(),
                "service": {
                    "id": &self.service_id,
                    "type": "service_reference",
                },
                "body": {
                    "type": "incident_body",
                    "details": json!({
                        "summary": &self.summary,
                        "source": &self.source,
                        "severity": self.severity,
                        "component": &self.component,
                        "details": &self.details,
                    })
                    .to_string(),
                },
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: String,
    #[serde(default)]
    pub incident_number: Option<u64>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub html_url: Option<String>,
}

impl Metered for Incident {}

#[derive(Deserialize)]
struct IncidentEnvelope {
    incident: Incident,
}

#[derive(Debug, Clone)]
pub struct PagerDutyClient {
    client: reqwest::Client,
    base_url: String,
    api_token: String,
    from_email: String,
    timeout: Duration,
}

impl PagerDutyClient {
    pub fn new(
        api_token: impl Into<String>,
        from_email: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, IntegrationError> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_token: api_token.into(),
            from_email: from_email.into(),
            timeout,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// One attempt at `POST /incidents`.
    pub async fn create_incident(&self, request: &IncidentRequest) -> Result<Incident, IntegrationError> {
        request.validate()?;

        let response = self
            .client
            .post(format!("{}/incidents", self.base_url))
            .header("Authorization", format!("Token token={}", self.api_token))
            .header("From", &self.from_email)
            .header("Accept", "application/vnd.pagerduty+json;version=2")
            .json(&request.body())
            .send()
            .await
            .map_err(|e| transport_error(e, self.timeout))?;

        let response = check_response(response).await?;
        let envelope: IncidentEnvelope = decode_json(response).await?;
        info!(incident_id = %envelope.incident.id, "pagerduty incident created");
        Ok(envelope.incident)
    }
}
