use std::time::Duration;

use thiserror::Error;

use crate::types::Provider;

/// Whether a failed attempt is worth repeating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Retryable,
    Fatal,
}

/// Failure of a single outbound attempt, before any retry or circuit
/// bookkeeping has been applied.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum IntegrationError {
    #[error("HTTP {status}: {message}")]
    Http {
        status: u16,
        message: String,
        retry_after: Option<Duration>,
    },
    #[error("network error: {0}")]
    Network(String),
    #[error("timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("invalid request: {0}")]
    InvalidInput(String),
}

impl IntegrationError {
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn rate_limited(retry_after: Option<Duration>) -> Self {
        Self::Http {
            status: 429,
            message: "rate limited".to_string(),
            retry_after,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Provider supplied wait hint (`Retry-After` / `x-ratelimit-reset`).
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Http { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// 5xx, 429, network failures and timeouts are retryable; every other
    /// 4xx and malformed input is fatal.
    pub fn classify(&self) -> Classification {
        match self {
            Self::Http { status: 429, .. } => Classification::Retryable,
            Self::Http { status, .. } if (500..=599).contains(status) => Classification::Retryable,
            Self::Http { .. } => Classification::Fatal,
            Self::Network(_) | Self::Timeout(_) => Classification::Retryable,
            Self::InvalidInput(_) => Classification::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.classify() == Classification::Retryable
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("circuit open for {target}, retry in {}ms", retry_in.as_millis())]
pub struct CircuitOpen {
    pub target: String,
    pub retry_in: Duration,
}

/// Result of running an operation directly through the circuit breaker.
#[derive(Debug, Error)]
pub enum CircuitError<E>
where
    E: std::error::Error + 'static,
{
    #[error(transparent)]
    Open(#[from] CircuitOpen),
    #[error(transparent)]
    Operation(E),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RetryError {
    #[error("fatal error on attempt {attempts}: {source}")]
    Fatal {
        attempts: u32,
        #[source]
        source: IntegrationError,
    },
    #[error("retries exhausted after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: IntegrationError,
    },
    #[error("cancelled after {attempts} attempts")]
    Cancelled {
        attempts: u32,
        last_error: Option<IntegrationError>,
    },
}

impl RetryError {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Fatal { attempts, .. }
            | Self::Exhausted { attempts, .. }
            | Self::Cancelled { attempts, .. } => *attempts,
        }
    }

    pub fn last_error(&self) -> Option<&IntegrationError> {
        match self {
            Self::Fatal { source, .. } | Self::Exhausted { source, .. } => Some(source),
            Self::Cancelled { last_error, .. } => last_error.as_ref(),
        }
    }
}

/// Error surfaced by the gateway façade. Wraps the underlying cause with the
/// provider and attempt metadata the calling layer needs to sanitise and
/// audit the failure.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GatewayError {
    #[error("{provider}: {open}")]
    CircuitOpen { provider: Provider, open: CircuitOpen },
    #[error("{provider}: retries exhausted after {attempts} attempts: {source}")]
    RetryExhausted {
        provider: Provider,
        attempts: u32,
        #[source]
        source: IntegrationError,
    },
    #[error("{provider}: fatal integration error: {source}")]
    Fatal {
        provider: Provider,
        attempts: u32,
        #[source]
        source: IntegrationError,
    },
    #[error("{provider}: quota exceeded for organization {organization_id} ({used} of {limit})")]
    QuotaExceeded {
        provider: Provider,
        organization_id: String,
        used: f64,
        limit: f64,
    },
    #[error("{provider}: cancelled after {attempts} attempts")]
    Cancelled { provider: Provider, attempts: u32 },
    #[error("{provider}: usage tracking failed: {source}")]
    Quota {
        provider: Provider,
        #[source]
        source: QuotaError,
    },
}

impl GatewayError {
    pub fn from_retry(provider: Provider, err: RetryError) -> Self {
        match err {
            RetryError::Fatal { attempts, source } => Self::Fatal {
                provider,
                attempts,
                source,
            },
            RetryError::Exhausted { attempts, source } => Self::RetryExhausted {
                provider,
                attempts,
                source,
            },
            RetryError::Cancelled { attempts, .. } => Self::Cancelled { provider, attempts },
        }
    }

    pub fn provider(&self) -> Provider {
        match self {
            Self::CircuitOpen { provider, .. }
            | Self::RetryExhausted { provider, .. }
            | Self::Fatal { provider, .. }
            | Self::QuotaExceeded { provider, .. }
            | Self::Cancelled { provider, .. }
            | Self::Quota { provider, .. } => *provider,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::RetryExhausted { attempts, .. }
            | Self::Fatal { attempts, .. }
            | Self::Cancelled { attempts, .. } => *attempts,
            Self::CircuitOpen { .. } | Self::QuotaExceeded { .. } | Self::Quota { .. } => 0,
        }
    }

    /// Upstream HTTP status, when the failure came from a response.
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            Self::RetryExhausted { source, .. } | Self::Fatal { source, .. } => source.status(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WebhookVerificationError {
    #[error("missing required input: {0}")]
    MissingInput(&'static str),
    #[error("timestamp outside the {tolerance_secs}s replay window")]
    StaleTimestamp { tolerance_secs: i64 },
    #[error("malformed {0}")]
    Malformed(&'static str),
    #[error("signature mismatch")]
    SignatureMismatch,
}

impl WebhookVerificationError {
    /// Stable label used in logs and audit records.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::MissingInput(_) => "missing_input",
            Self::StaleTimestamp { .. } => "stale_timestamp",
            Self::Malformed(_) => "malformed",
            Self::SignatureMismatch => "signature_mismatch",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum QuotaError {
    #[error("invalid usage amount {0}: must be finite and non-negative")]
    InvalidAmount(f64),
    #[error("usage store error: {0}")]
    Store(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing configuration value {0}")]
    Missing(String),
    #[error("invalid configuration value {key}: {reason}")]
    Invalid { key: String, reason: String },
}

impl ConfigError {
    pub fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_errors_are_retryable() {
        for status in [500, 502, 503, 504] {
            assert_eq!(
                IntegrationError::http(status, "boom").classify(),
                Classification::Retryable,
                "HTTP {} should be retryable",
                status
            );
        }
    }

    #[test]
    fn test_client_errors_are_fatal() {
        for status in [400, 401, 403, 404, 422] {
            assert_eq!(
                IntegrationError::http(status, "nope").classify(),
                Classification::Fatal,
                "HTTP {} should be fatal",
                status
            );
        }
    }

    #[test]
    fn test_rate_limit_is_retryable_and_keeps_hint() {
        let err = IntegrationError::rate_limited(Some(Duration::from_secs(7)));
        assert!(err.is_retryable());
        assert_eq!(err.status(), Some(429));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
    }

    #[test]
    fn test_transport_errors_are_retryable() {
        assert!(IntegrationError::Network("reset".to_string()).is_retryable());
        assert!(IntegrationError::Timeout(Duration::from_secs(30)).is_retryable());
        assert!(!IntegrationError::InvalidInput("empty".to_string()).is_retryable());
    }

    #[test]
    fn test_gateway_error_keeps_cause() {
        let err = GatewayError::from_retry(
            Provider::PagerDuty,
            RetryError::Exhausted {
                attempts: 3,
                source: IntegrationError::http(503, "unavailable"),
            },
        );
        assert_eq!(err.attempts(), 3);
        assert_eq!(err.upstream_status(), Some(503));
        assert_eq!(err.provider(), Provider::PagerDuty);
        assert!(err.to_string().contains("HTTP 503"));
    }

    #[test]
    fn test_verification_reasons_are_distinct() {
        let reasons = [
            WebhookVerificationError::MissingInput("secret").reason(),
            WebhookVerificationError::StaleTimestamp { tolerance_secs: 300 }.reason(),
            WebhookVerificationError::Malformed("signature").reason(),
            WebhookVerificationError::SignatureMismatch.reason(),
        ];
        for (i, a) in reasons.iter().enumerate() {
            for b in reasons.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }
}
