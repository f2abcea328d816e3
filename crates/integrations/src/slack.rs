use std::time::Duration;

use gateway_core::error::IntegrationError;
use gateway_core::types::Metered;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::http::{build_client, check_response, decode_json, transport_error};

pub const DEFAULT_API_URL: &str = "https://slack.com/api";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlackMessage {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocks: Option<Value>,
}

impl SlackMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    /// Alert text used when an incident is routed to Slack instead of
    /// PagerDuty.
    pub fn alert(severity: &str, summary: &str, source: &str) -> Self {
        Self::text(format!(
            ":rotating_light: *[{}]* {} (source: {})",
            severity.to_uppercase(),
            summary,
            source
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Posted {
    pub channel: Option<String>,
    pub ts: Option<String>,
}

impl Metered for Posted {}

#[derive(Debug, Clone)]
enum Destination {
    /// Incoming webhook URL; the channel is fixed by the URL.
    Webhook(String),
    /// `chat.postMessage` with a bot token.
    Bot { token: String, api_url: String },
}

#[derive(Deserialize)]
struct ApiReply {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    ts: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SlackClient {
    client: reqwest::Client,
    destination: Destination,
    timeout: Duration,
}

impl SlackClient {
    pub fn webhook(url: impl Into<String>, timeout: Duration) -> Result<Self, IntegrationError> {
        Ok(Self {
            client: build_client(timeout)?,
            destination: Destination::Webhook(url.into()),
            timeout,
        })
    }

    pub fn bot(token: impl Into<String>, timeout: Duration) -> Result<Self, IntegrationError> {
        Ok(Self {
            client: build_client(timeout)?,
            destination: Destination::Bot {
                token: token.into(),
                api_url: DEFAULT_API_URL.to_string(),
            },
            timeout,
        })
    }

    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        if let Destination::Bot { api_url, .. } = &mut self.destination {
            *api_url = url.into().trim_end_matches('/').to_string();
        }
        self
    }

    /// Circuit key for `message`. Webhook URLs carry credentials, so a
    /// webhook destination is keyed by kind only; bot messages by channel.
    pub fn circuit_target(&self, message: &SlackMessage) -> String {
        match (&self.destination, message.channel.as_deref()) {
            (Destination::Bot { .. }, Some(channel)) => format!("slack:{}", channel),
            (Destination::Bot { .. }, None) => "slack".to_string(),
            (Destination::Webhook(_), _) => "slack:webhook".to_string(),
        }
    }

    /// One attempt at delivering `message`.
    pub async fn post_message(&self, message: &SlackMessage) -> Result<Posted, IntegrationError> {
        if message.text.trim().is_empty() && message.blocks.is_none() {
            return Err(IntegrationError::InvalidInput("message text is empty".into()));
        }

        match &self.destination {
            Destination::Webhook(url) => {
                let response = self
                    .client
                    .post(url)
                    .json(message)
                    .send()
                    .await
                    .map_err(|e| transport_error(e, self.timeout))?;
                check_response(response).await?;
                Ok(Posted {
                    channel: message.channel.clone(),
                    ts: None,
                })
            }
            Destination::Bot { token, api_url } => {
                if message.channel.is_none() {
                    return Err(IntegrationError::InvalidInput(
                        "channel is required for bot messages".into(),
                    ));
                }
                let response = self
                    .client
                    .post(format!("{}/chat.postMessage", api_url))
                    .bearer_auth(token)
                    .json(message)
                    .send()
                    .await
                    .map_err(|e| transport_error(e, self.timeout))?;
                let response = check_response(response).await?;
                let reply: ApiReply = decode_json(response).await?;
                if reply.ok {
                    return Ok(Posted {
                        channel: reply.channel,
                        ts: reply.ts,
                    });
                }
                // The Web API reports failures in a 200 body.
                let error = reply.error.unwrap_or_else(|| "unknown_error".to_string());
                Err(match error.as_str() {
                    "ratelimited" => IntegrationError::rate_limited(None),
                    "internal_error" | "fatal_error" | "service_unavailable" => {
                        IntegrationError::http(503, error)
                    }
                    _ => IntegrationError::http(400, error),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_webhook_post() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/services/T000/B000/XXX"))
            .and(matchers::body_json(json!({"text": "hello"})))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let client = SlackClient::webhook(
            format!("{}/services/T000/B000/XXX", server.uri()),
            Duration::from_secs(5),
        )
        .unwrap();
        client.post_message(&SlackMessage::text("hello")).await.unwrap();
    }

    #[tokio::test]
    async fn test_webhook_rate_limit_uses_retry_after() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "3"))
            .mount(&server)
            .await;

        let client = SlackClient::webhook(server.uri(), Duration::from_secs(5)).unwrap();
        let err = client
            .post_message(&SlackMessage::text("hello"))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(429));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
    }

    #[tokio::test]
    async fn test_bot_api_error_in_body() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/chat.postMessage"))
            .and(matchers::header("Authorization", "Bearer xoxb-test"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"ok": false, "error": "channel_not_found"})),
            )
            .mount(&server)
            .await;

        let client = SlackClient::bot("xoxb-test", Duration::from_secs(5))
            .unwrap()
            .with_api_url(server.uri());
        let message = SlackMessage {
            channel: Some("C404".to_string()),
            ..SlackMessage::text("hello")
        };
        let err = client.post_message(&message).await.unwrap_err();
        assert_eq!(err.status(), Some(400));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_bot_api_success() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/chat.postMessage"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({"ok": true, "channel": "C123", "ts": "1707386400.000100"}),
            ))
            .mount(&server)
            .await;

        let client = SlackClient::bot("xoxb-test", Duration::from_secs(5))
            .unwrap()
            .with_api_url(server.uri());
        let message = SlackMessage {
            channel: Some("C123".to_string()),
            ..SlackMessage::text("audit finished")
        };
        let posted = client.post_message(&message).await.unwrap();
        assert_eq!(posted.ts.as_deref(), Some("1707386400.000100"));
    }

    #[tokio::test]
    async fn test_empty_message_rejected() {
        let client = SlackClient::webhook("http://127.0.0.1:9", Duration::from_secs(5)).unwrap();
        let err = client.post_message(&SlackMessage::text("  ")).await.unwrap_err();
        assert!(matches!(err, IntegrationError::InvalidInput(_)));
    }

    #[test]
    fn test_circuit_target_per_destination() {
        let timeout = Duration::from_secs(5);
        let message = SlackMessage {
            channel: Some("C123".to_string()),
            ..SlackMessage::text("hi")
        };

        let bot = SlackClient::bot("xoxb-token", timeout).unwrap();
        assert_eq!(bot.circuit_target(&message), "slack:C123");
        assert_eq!(bot.circuit_target(&SlackMessage::text("hi")), "slack");

        let hook = SlackClient::webhook("https://hooks.slack.com/services/T/B/secret", timeout).unwrap();
        assert_eq!(hook.circuit_target(&message), "slack:webhook");
        assert!(!hook.circuit_target(&message).contains("secret"));
    }

    #[test]
    fn test_alert_text() {
        let message = SlackMessage::alert("critical", "Audit pipeline stalled", "analyzer");
        assert!(message.text.contains("[CRITICAL]"));
        assert!(message.text.contains("Audit pipeline stalled"));
    }
}
