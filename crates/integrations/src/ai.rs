//! Claude and OpenAI completion clients behind one trait, so callers can
//! fall back from one provider to the other.

use std::time::Duration;

use async_trait::async_trait;
use gateway_core::error::IntegrationError;
use gateway_core::types::{Metered, Provider, TokenUsage};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::http::{build_client, check_response, decode_json, transport_error};

pub const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
pub const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const OPENAI_BASE_URL: &str = "https://api.openai.com";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiRequest {
    pub prompt: String,
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_max_tokens() -> u32 {
    1024
}

impl AiRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system: None,
            max_tokens: default_max_tokens(),
        }
    }

    fn validate(&self) -> Result<(), IntegrationError> {
        if self.prompt.trim().is_empty() {
            return Err(IntegrationError::InvalidInput("prompt is empty".into()));
        }
        if self.max_tokens == 0 {
            return Err(IntegrationError::InvalidInput("max_tokens must be positive".into()));
        }
        Ok(())
    }
}

/// USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

impl Pricing {
    pub fn cost(&self, usage: TokenUsage) -> f64 {
        (usage.input_tokens as f64 * self.input_per_mtok
            + usage.output_tokens as f64 * self.output_per_mtok)
            / 1_000_000.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Completion {
    pub provider: Provider,
    pub model: String,
    pub text: String,
    pub usage: TokenUsage,
    pub cost: Option<f64>,
}

impl Metered for Completion {
    fn tokens(&self) -> Option<TokenUsage> {
        Some(self.usage)
    }

    fn cost(&self) -> Option<f64> {
        self.cost
    }
}

#[async_trait]
pub trait CompletionClient: Send + Sync {
    fn provider(&self) -> Provider;

    /// One attempt at a completion.
    async fn complete(&self, request: &AiRequest) -> Result<Completion, IntegrationError>;
}

#[derive(Debug, Clone)]
pub struct ClaudeClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    pricing: Option<Pricing>,
    timeout: Duration,
}

impl ClaudeClient {
    pub fn new(api_key: impl Into<String>, timeout: Duration) -> Result<Self, IntegrationError> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: ANTHROPIC_BASE_URL.to_string(),
            api_key: api_key.into(),
            model: "claude-3-5-sonnet-latest".to_string(),
            pricing: Some(Pricing {
                input_per_mtok: 3.0,
                output_per_mtok: 15.0,
            }),
            timeout,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>, pricing: Option<Pricing>) -> Self {
        self.model = model.into();
        self.pricing = pricing;
        self
    }
}

#[derive(Deserialize)]
struct ClaudeReply {
    model: String,
    content: Vec<ClaudeBlock>,
    usage: ClaudeUsage,
}

#[derive(Deserialize)]
struct ClaudeBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct ClaudeUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[async_trait]
impl CompletionClient for ClaudeClient {
    fn provider(&self) -> Provider {
        Provider::Claude
    }

    async fn complete(&self, request: &AiRequest) -> Result<Completion, IntegrationError> {
        request.validate()?;

        let mut body = json!({
            "model": &self.model,
            "max_tokens": request.max_tokens,
            "messages": [{"role": "user", "content": &request.prompt}],
        });
        if let Some(system) = &request.system {
            body["system"] = json!(system);
        }

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(e, self.timeout))?;

        let reply: ClaudeReply = decode_json(check_response(response).await?).await?;
        let usage = TokenUsage {
            input_tokens: reply.usage.input_tokens,
            output_tokens: reply.usage.output_tokens,
        };
        let text = reply
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .map(|block| block.text)
            .collect::<Vec<_>>()
            .join("");

        Ok(Completion {
            provider: Provider::Claude,
            model: reply.model,
            text,
            usage,
            cost: self.pricing.map(|p| p.cost(usage)),
        })
    }
}

#[derive(Debug, Clone)]
pub struct OpenAiClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    pricing: Option<Pricing>,
    timeout: Duration,
}

impl OpenAiClient {
    pub fn new(api_key: impl Into<String>, timeout: Duration) -> Result<Self, IntegrationError> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: OPENAI_BASE_URL.to_string(),
            api_key: api_key.into(),
            model: "gpt-4o".to_string(),
            pricing: Some(Pricing {
                input_per_mtok: 2.5,
                output_per_mtok: 10.0,
            }),
            timeout,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>, pricing: Option<Pricing>) -> Self {
        self.model = model.into();
        self.pricing = pricing;
        self
    }
}

#[derive(Deserialize)]
struct OpenAiReply {
    model: String,
    choices: Vec<OpenAiChoice>,
    usage: OpenAiUsage,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Deserialize)]
struct OpenAiMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[async_trait]
impl CompletionClient for OpenAiClient {
    fn provider(&self) -> Provider {
        Provider::OpenAi
    }

    async fn complete(&self, request: &AiRequest) -> Result<Completion, IntegrationError> {
        request.validate()?;

        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": &request.prompt}));

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": &self.model,
                "max_tokens": request.max_tokens,
                "messages": messages,
            }))
            .send()
            .await
            .map_err(|e| transport_error(e, self.timeout))?;

        let reply: OpenAiReply = decode_json(check_response(response).await?).await?;
        let usage = TokenUsage {
            input_tokens: reply.usage.prompt_tokens,
            output_tokens: reply.usage.completion_tokens,
        };
        let text = reply
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default();

        Ok(Completion {
            provider: Provider::OpenAi,
            model: reply.model,
            text,
            usage,
            cost: self.pricing.map(|p| p.cost(usage)),
        })
    }
}
