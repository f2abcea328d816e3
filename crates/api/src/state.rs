use std::sync::Arc;

use gateway_core::config::Settings;
use gateway_core::quota::UsageStore;
use gateway_core::{CircuitBreaker, Gateway, QuotaTracker, RetryPolicy, WebhookVerifier};
use integrations::{ClaudeClient, CompletionClient, OpenAiClient, PagerDutyClient, SlackClient};
use tracing::info;

#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Outbound clients. A missing client means the provider is not configured.
#[derive(Clone, Default)]
pub struct Clients {
    pub pagerduty: Option<Arc<PagerDutyClient>>,
    pub slack: Option<Arc<SlackClient>>,
    pub claude: Option<Arc<dyn CompletionClient>>,
    pub openai: Option<Arc<dyn CompletionClient>>,
}

impl Clients {
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let timeout = settings.retry.attempt_timeout();
        let mut clients = Clients::default();

        if let (Some(token), Some(from)) = (
            settings.pagerduty_api_token.as_deref(),
            settings.pagerduty_from_email.as_deref(),
        ) {
            clients.pagerduty = Some(Arc::new(PagerDutyClient::new(token, from, timeout)?));
        }
        if let Some(url) = settings.slack_webhook_url.as_deref() {
            clients.slack = Some(Arc::new(SlackClient::webhook(url, timeout)?));
        }
        if let Some(key) = settings.anthropic_api_key.as_deref() {
            clients.claude = Some(Arc::new(ClaudeClient::new(key, timeout)?));
        }
        if let Some(key) = settings.openai_api_key.as_deref() {
            clients.openai = Some(Arc::new(OpenAiClient::new(key, timeout)?));
        }

        info!(
            pagerduty = clients.pagerduty.is_some(),
            slack = clients.slack.is_some(),
            claude = clients.claude.is_some(),
            openai = clients.openai.is_some(),
            "outbound clients configured"
        );
        Ok(clients)
    }
}

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub gateway: Arc<Gateway>,
    pub verifier: Arc<WebhookVerifier>,
    pub clients: Clients,
}

impl AppState {
    pub fn new(
        settings: Settings,
        store: Arc<dyn UsageStore>,
        clients: Clients,
    ) -> anyhow::Result<Self> {
        let breaker = CircuitBreaker::new(settings.circuit.clone())?;
        let retry = RetryPolicy::new(settings.retry.clone())?;
        let tracker = QuotaTracker::new(settings.quota.clone(), store)?;
        let verifier = WebhookVerifier::new(settings.webhook_tolerance_secs);

        Ok(Self {
            gateway: Arc::new(Gateway::new(Arc::new(breaker), retry, Arc::new(tracker))),
            verifier: Arc::new(verifier),
            settings: Arc::new(settings),
            clients,
        })
    }
}
