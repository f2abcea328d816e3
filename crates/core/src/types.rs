use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Claude,
    OpenAi,
    PagerDuty,
    Slack,
}

impl Provider {
    pub const ALL: [Provider; 4] = [
        Provider::Claude,
        Provider::OpenAi,
        Provider::PagerDuty,
        Provider::Slack,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Claude => "claude",
            Provider::OpenAi => "openai",
            Provider::PagerDuty => "pagerduty",
            Provider::Slack => "slack",
        }
    }

    pub fn is_ai(&self) -> bool {
        matches!(self, Provider::Claude | Provider::OpenAi)
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "claude" | "anthropic" => Ok(Provider::Claude),
            "openai" => Ok(Provider::OpenAi),
            "pagerduty" => Ok(Provider::PagerDuty),
            "slack" => Ok(Provider::Slack),
            other => Err(format!("unknown provider: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Free,
    Pro,
    Enterprise,
}

impl FromStr for Plan {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "free" => Ok(Plan::Free),
            "pro" | "professional" => Ok(Plan::Pro),
            "enterprise" | "ent" => Ok(Plan::Enterprise),
            other => Err(format!("unknown plan: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Usage metadata an operation result can report back to the quota tracker.
pub trait Metered {
    fn tokens(&self) -> Option<TokenUsage> {
        None
    }

    fn cost(&self) -> Option<f64> {
        None
    }
}

impl Metered for () {}

impl Metered for serde_json::Value {}

impl Metered for String {}

/// Audit record the calling layer persists for a gateway invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    SucceededAfterRetry {
        correlation_id: String,
        provider: Provider,
        attempts: u32,
    },
    FailedAfterAttempts {
        correlation_id: String,
        provider: Provider,
        attempts: u32,
        status: Option<u16>,
    },
    CircuitRejected {
        correlation_id: String,
        provider: Provider,
        target: String,
    },
    QuotaBlocked {
        correlation_id: String,
        provider: Provider,
        organization_id: String,
    },
    FallbackUsed {
        correlation_id: String,
        primary: Provider,
        fallback: Provider,
        succeeded: bool,
    },
}
