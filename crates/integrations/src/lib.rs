//! Outbound HTTP clients. Every call returns the raw
//! [`IntegrationError`](gateway_core::error::IntegrationError) for one
//! attempt; retries and circuit bookkeeping belong to the gateway.

pub mod ai;
pub mod http;
pub mod pagerduty;
pub mod slack;

pub use ai::{AiRequest, ClaudeClient, Completion, CompletionClient, OpenAiClient};
pub use pagerduty::{Incident, IncidentRequest, PagerDutyClient, Severity};
pub use slack::{SlackClient, SlackMessage};
