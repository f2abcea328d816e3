//! Bounded retry with exponential backoff.
//!
//! Attempts run strictly one after another. The only suspension points are
//! the attempt itself (bounded by the per-attempt timeout) and the backoff
//! sleep; both abort as soon as the caller's cancellation token fires.

use std::future::Future;
use std::time::Duration;

use backoff::{backoff::Backoff, ExponentialBackoff};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Classification, ConfigError, IntegrationError, RetryError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
    /// Randomization factor in `[0, 1)`; 0 gives exact delays.
    pub jitter: f64,
    pub attempt_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 1_000,
            backoff_multiplier: 2.0,
            max_backoff_ms: 30_000,
            jitter: 0.0,
            attempt_timeout_ms: 30_000,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts", "must be at least 1"));
        }
        if self.backoff_base_ms == 0 {
            return Err(ConfigError::invalid("backoff_base_ms", "must be positive"));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::invalid(
                "backoff_multiplier",
                "must be a finite number >= 1",
            ));
        }
        if self.max_backoff_ms < self.backoff_base_ms {
            return Err(ConfigError::invalid(
                "max_backoff_ms",
                "must not be smaller than backoff_base_ms",
            ));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(ConfigError::invalid("jitter", "must be in [0, 1)"));
        }
        if self.attempt_timeout_ms == 0 {
            return Err(ConfigError::invalid("attempt_timeout_ms", "must be positive"));
        }
        Ok(())
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

/// Successful value plus the bookkeeping the caller reports on.
#[derive(Debug, Clone, PartialEq)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
    pub delays: Vec<Duration>,
}

impl<T> Retried<T> {
    pub fn succeeded_after_retry(&self) -> bool {
        self.attempts > 1
    }
}

/// State of one logical invocation. Discarded when the call ends.
struct RetryContext {
    attempt: u32,
    max_attempts: u32,
    backoff: ExponentialBackoff,
    last_error: Option<IntegrationError>,
    delays: Vec<Duration>,
}

impl RetryContext {
    /// A provider wait hint wins over the computed delay when larger, but
    /// never past `max_interval`.
    fn next_delay(&mut self, retry_after: Option<Duration>) -> Duration {
        let cap = self.backoff.max_interval;
        let computed = self
            .backoff
            .next_backoff()
            .map(whole_millis)
            .unwrap_or(cap);
        match retry_after {
            Some(hint) if hint > computed => whole_millis(hint.min(cap)),
            _ => computed,
        }
    }
}

// backoff adds up to a nanosecond of noise even with no randomization.
fn whole_millis(delay: Duration) -> Duration {
    Duration::from_millis(delay.as_millis() as u64)
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    fn backoff(&self) -> ExponentialBackoff {
        let base = Duration::from_millis(self.config.backoff_base_ms);
        ExponentialBackoff {
            current_interval: base,
            initial_interval: base,
            randomization_factor: self.config.jitter,
            multiplier: self.config.backoff_multiplier,
            max_interval: Duration::from_millis(self.config.max_backoff_ms),
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    /// Nominal delay before retry number `retry` (0-based), without jitter.
    pub fn nominal_delay(&self, retry: u32) -> Duration {
        let millis = self.config.backoff_base_ms as f64
            * self.config.backoff_multiplier.powi(retry.min(64) as i32);
        Duration::from_millis(millis.min(self.config.max_backoff_ms as f64) as u64)
    }

    /// Retries with the default classification from
    /// [`IntegrationError::classify`].
    pub async fn execute<T, F, Fut>(
        &self,
        operation: F,
        cancel: &CancellationToken,
    ) -> Result<Retried<T>, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, IntegrationError>>,
    {
        self.execute_with_retry(operation, IntegrationError::classify, cancel)
            .await
    }

    pub async fn execute_with_retry<T, F, Fut, C>(
        &self,
        mut operation: F,
        classify: C,
        cancel: &CancellationToken,
    ) -> Result<Retried<T>, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, IntegrationError>>,
        C: Fn(&IntegrationError) -> Classification,
    {
        let timeout = self.config.attempt_timeout();
        let mut ctx = RetryContext {
            attempt: 0,
            max_attempts: self.config.max_attempts,
            backoff: self.backoff(),
            last_error: None,
            delays: Vec::new(),
        };

        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled {
                    attempts: ctx.attempt,
                    last_error: ctx.last_error,
                });
            }

            ctx.attempt += 1;
            debug!(attempt = ctx.attempt, max_attempts = ctx.max_attempts, "attempt starting");

            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(RetryError::Cancelled {
                        attempts: ctx.attempt,
                        last_error: ctx.last_error,
                    });
                }
                result = tokio::time::timeout(timeout, operation()) => result,
            };

            let err = match result {
                Ok(Ok(value)) => {
                    if ctx.attempt > 1 {
                        info!(attempts = ctx.attempt, "succeeded after retry");
                    }
                    return Ok(Retried {
                        value,
                        attempts: ctx.attempt,
                        delays: ctx.delays,
                    });
                }
                Ok(Err(err)) => err,
                Err(_) => IntegrationError::Timeout(timeout),
            };

            if classify(&err) == Classification::Fatal {
                warn!(attempt = ctx.attempt, error = %err, "non-retryable failure");
                return Err(RetryError::Fatal {
                    attempts: ctx.attempt,
                    source: err,
                });
            }

            if ctx.attempt >= ctx.max_attempts {
                warn!(attempts = ctx.attempt, error = %err, "retries exhausted");
                return Err(RetryError::Exhausted {
                    attempts: ctx.attempt,
                    source: err,
                });
            }

            let delay = ctx.next_delay(err.retry_after());
            warn!(
                attempt = ctx.attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retryable failure, backing off"
            );
            ctx.delays.push(delay);
            ctx.last_error = Some(err);

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(RetryError::Cancelled {
                        attempts: ctx.attempt,
                        last_error: ctx.last_error,
                    });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
