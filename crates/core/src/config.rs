use std::str::FromStr;

use serde::Deserialize;

use crate::circuit::CircuitConfig;
use crate::error::ConfigError;
use crate::quota::QuotaConfig;
use crate::retry::RetryConfig;
use crate::types::Plan;

#[derive(Debug, Clone, Deserialize)]
pub struct PlanLimits {
    pub free: f64,
    pub pro: f64,
    pub enterprise: f64,
}

impl PlanLimits {
    pub fn limit_for(&self, plan: Plan) -> f64 {
        match plan {
            Plan::Free => self.free,
            Plan::Pro => self.pro,
            Plan::Enterprise => self.enterprise,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub env: String,
    pub api_bind: String,
    pub database_url: Option<String>,
    pub pagerduty_api_token: Option<String>,
    pub pagerduty_from_email: Option<String>,
    pub pagerduty_service_id: Option<String>,
    pub pagerduty_webhook_secret: Option<String>,
    pub slack_signing_secret: Option<String>,
    pub slack_webhook_url: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub webhook_tolerance_secs: i64,
    pub circuit: CircuitConfig,
    pub retry: RetryConfig,
    pub quota: QuotaConfig,
    pub plan_limits: PlanLimits,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds settings from an arbitrary key lookup. Blank values count as
    /// unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let circuit = CircuitConfig {
            failure_threshold: parse_or(&var, "PA_CIRCUIT_FAILURE_THRESHOLD", 3)?,
            cooldown_ms: parse_or(&var, "PA_CIRCUIT_COOLDOWN_MS", 60_000)?,
        };
        circuit.validate()?;

        let retry = RetryConfig {
            max_attempts: parse_or(&var, "PA_RETRY_MAX_ATTEMPTS", 3)?,
            backoff_base_ms: parse_or(&var, "PA_RETRY_BASE_MS", 1_000)?,
            backoff_multiplier: parse_or(&var, "PA_RETRY_MULTIPLIER", 2.0)?,
            max_backoff_ms: parse_or(&var, "PA_RETRY_MAX_BACKOFF_MS", 30_000)?,
            jitter: parse_or(&var, "PA_RETRY_JITTER", 0.0)?,
            attempt_timeout_ms: parse_or(&var, "PA_REQUEST_TIMEOUT_MS", 30_000)?,
        };
        retry.validate()?;

        let quota = QuotaConfig {
            window_secs: parse_or(&var, "PA_QUOTA_WINDOW_SECS", 86_400)?,
            warning_fraction: parse_or(&var, "PA_QUOTA_WARNING_FRACTION", 0.9)?,
        };
        quota.validate()?;

        let webhook_tolerance_secs = parse_or(&var, "PA_WEBHOOK_TOLERANCE_SECS", 300)?;
        if webhook_tolerance_secs <= 0 {
            return Err(ConfigError::invalid(
                "PA_WEBHOOK_TOLERANCE_SECS",
                "must be positive",
            ));
        }

        Ok(Self {
            env: var("PA_ENV").unwrap_or_else(|| "dev".to_string()),
            api_bind: var("PA_API_BIND").unwrap_or_else(|| "0.0.0.0:3000".to_string()),
            database_url: var("DATABASE_URL"),
            pagerduty_api_token: var("PAGERDUTY_API_TOKEN"),
            pagerduty_from_email: var("PAGERDUTY_FROM_EMAIL"),
            pagerduty_service_id: var("PAGERDUTY_SERVICE_ID"),
            pagerduty_webhook_secret: var("PAGERDUTY_WEBHOOK_SECRET"),
            slack_signing_secret: var("SLACK_SIGNING_SECRET"),
            slack_webhook_url: var("SLACK_WEBHOOK_URL"),
            anthropic_api_key: var("ANTHROPIC_API_KEY"),
            openai_api_key: var("OPENAI_API_KEY"),
            webhook_tolerance_secs,
            circuit,
            retry,
            quota,
            plan_limits: PlanLimits {
                free: parse_or(&var, "PA_QUOTA_FREE", 50.0)?,
                pro: parse_or(&var, "PA_QUOTA_PRO", 1_000.0)?,
                enterprise: parse_or(&var, "PA_QUOTA_ENT", 10_000.0)?,
            },
        })
    }

    pub fn is_production(&self) -> bool {
        matches!(self.env.as_str(), "prod" | "production")
    }
}

fn parse_or<T, F>(var: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::invalid(key, e.to_string())),
        None => Ok(default),
    }
}
