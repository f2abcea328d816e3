//! Outbound call façade: quota check, circuit admission, retried execution,
//! and usage accounting for a single logical operation.

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::circuit::CircuitBreaker;
use crate::error::{Classification, GatewayError, IntegrationError, QuotaError, RetryError};
use crate::quota::{QuotaTracker, UsageEvent};
use crate::retry::RetryPolicy;
use crate::types::{AuditEvent, Metered, Provider};

pub fn correlation_id() -> String {
    format!("corr_{}", nanoid::nanoid!(12))
}

/// Describes one outbound operation.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub organization_id: String,
    pub provider: Provider,
    /// Circuit key. Defaults to the provider name.
    pub target: String,
    /// Hard limit checked before the call. `None` skips the check.
    pub quota_limit: Option<f64>,
    /// Usage recorded on success.
    pub units: f64,
    pub cancel: CancellationToken,
}

impl GatewayRequest {
    pub fn new(organization_id: impl Into<String>, provider: Provider) -> Self {
        Self {
            organization_id: organization_id.into(),
            provider,
            target: provider.as_str().to_string(),
            quota_limit: None,
            units: 1.0,
            cancel: CancellationToken::new(),
        }
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    pub fn quota_limit(mut self, limit: f64) -> Self {
        self.quota_limit = Some(limit);
        self
    }

    pub fn units(mut self, units: f64) -> Self {
        self.units = units;
        self
    }

    pub fn cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Result of a gateway invocation plus the metadata the caller needs to
/// sanitise errors and write audit records.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayOutcome<T> {
    pub correlation_id: String,
    pub provider: Provider,
    pub target: String,
    /// Attempts across the primary and, when used, the fallback.
    pub attempts: u32,
    pub used_fallback: bool,
    /// Provider that failed before the fallback ran.
    pub fallback_from: Option<Provider>,
    #[serde(skip)]
    pub primary_error: Option<GatewayError>,
    #[serde(skip)]
    pub result: Result<T, GatewayError>,
}

impl<T> GatewayOutcome<T> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn error(&self) -> Option<&GatewayError> {
        self.result.as_ref().err()
    }

    pub fn into_result(self) -> Result<T, GatewayError> {
        self.result
    }

    /// Audit records describing how this invocation went. Empty for a
    /// first-attempt success on the primary provider.
    pub fn audit_events(&self) -> Vec<AuditEvent> {
        let mut events = Vec::new();
        let correlation_id = self.correlation_id.clone();

        if let (Some(primary), Some(primary_error)) = (self.fallback_from, &self.primary_error) {
            events.extend(failure_event(&correlation_id, primary_error));
            events.push(AuditEvent::FallbackUsed {
                correlation_id: correlation_id.clone(),
                primary,
                fallback: self.provider,
                succeeded: self.is_success(),
            });
        }

        match &self.result {
            Ok(_) if self.attempts > 1 && !self.used_fallback => events.push(AuditEvent::SucceededAfterRetry {
                correlation_id,
                provider: self.provider,
                attempts: self.attempts,
            }),
            Ok(_) => {}
            Err(err) => events.extend(failure_event(&correlation_id, err)),
        }
        events
    }
}

fn failure_event(correlation_id: &str, err: &GatewayError) -> Option<AuditEvent> {
    let correlation_id = correlation_id.to_string();
    match err {
        GatewayError::CircuitOpen { provider, open } => Some(AuditEvent::CircuitRejected {
            correlation_id,
            provider: *provider,
            target: open.target.clone(),
        }),
        GatewayError::QuotaExceeded {
            provider,
            organization_id,
            ..
        } => Some(AuditEvent::QuotaBlocked {
            correlation_id,
            provider: *provider,
            organization_id: organization_id.clone(),
        }),
        GatewayError::RetryExhausted { .. } | GatewayError::Fatal { .. } => {
            Some(AuditEvent::FailedAfterAttempts {
                correlation_id,
                provider: err.provider(),
                attempts: err.attempts(),
                status: err.upstream_status(),
            })
        }
        GatewayError::Cancelled { .. } | GatewayError::Quota { .. } => None,
    }
}

pub struct Gateway {
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    tracker: Arc<QuotaTracker>,
}

impl Gateway {
    pub fn new(breaker: Arc<CircuitBreaker>, retry: RetryPolicy, tracker: Arc<QuotaTracker>) -> Self {
        Self {
            breaker,
            retry,
            tracker,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn tracker(&self) -> &QuotaTracker {
        &self.tracker
    }

    /// Quota check, then one circuit admission around the whole retry loop,
    /// then usage recording.
    ///
    /// The circuit sees the retry result, not each attempt, and unlike
    /// [`CircuitBreaker::execute`] not every error counts against it: only
    /// exhausted retries fail the circuit. A fatal (non-retryable) error
    /// means the provider answered, so it settles the permit as a success,
    /// which closes a HALF_OPEN circuit and resets the failure count. A
    /// cancelled call releases the permit without an outcome.
    pub async fn execute<T, F, Fut>(&self, request: &GatewayRequest, operation: F) -> GatewayOutcome<T>
    where
        T: Metered,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, IntegrationError>>,
    {
        self.run(request, operation, IntegrationError::classify, correlation_id())
            .await
    }

    /// Like [`execute`](Self::execute) with a caller supplied classifier.
    pub async fn execute_classified<T, F, Fut, C>(
        &self,
        request: &GatewayRequest,
        operation: F,
        classify: C,
    ) -> GatewayOutcome<T>
    where
        T: Metered,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, IntegrationError>>,
        C: Fn(&IntegrationError) -> Classification,
    {
        self.run(request, operation, classify, correlation_id()).await
    }

    /// Runs `primary`; on any failure other than cancellation runs `fallback`
    /// under the same correlation id.
    pub async fn execute_with_fallback<T, F, Fut, G, Gut>(
        &self,
        primary: &GatewayRequest,
        primary_op: F,
        fallback: &GatewayRequest,
        fallback_op: G,
    ) -> GatewayOutcome<T>
    where
        T: Metered,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, IntegrationError>>,
        G: FnMut() -> Gut,
        Gut: Future<Output = Result<T, IntegrationError>>,
    {
        let correlation_id = correlation_id();
        let first = self
            .run(primary, primary_op, IntegrationError::classify, correlation_id.clone())
            .await;

        let primary_attempts = first.attempts;
        let primary_error = match first.result {
            Ok(_) | Err(GatewayError::Cancelled { .. }) => return first,
            Err(err) => err,
        };

        warn!(
            correlation_id = %correlation_id,
            primary = %primary.provider,
            fallback = %fallback.provider,
            error = %primary_error,
            "primary provider failed, trying fallback"
        );

        let mut outcome = self
            .run(fallback, fallback_op, IntegrationError::classify, correlation_id)
            .await;
        outcome.attempts += primary_attempts;
        outcome.used_fallback = true;
        outcome.fallback_from = Some(primary.provider);
        outcome.primary_error = Some(primary_error);
        outcome
    }

    async fn run<T, F, Fut, C>(
        &self,
        request: &GatewayRequest,
        operation: F,
        classify: C,
        correlation_id: String,
    ) -> GatewayOutcome<T>
    where
        T: Metered,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, IntegrationError>>,
        C: Fn(&IntegrationError) -> Classification,
    {
        let provider = request.provider;
        let outcome = |attempts: u32, result: Result<T, GatewayError>| GatewayOutcome {
            correlation_id: correlation_id.clone(),
            provider,
            target: request.target.clone(),
            attempts,
            used_fallback: false,
            fallback_from: None,
            primary_error: None,
            result,
        };

        if !request.units.is_finite() || request.units < 0.0 {
            error!(
                correlation_id = %correlation_id,
                organization_id = %request.organization_id,
                %provider,
                units = request.units,
                "invalid usage units, call not attempted"
            );
            return outcome(
                0,
                Err(GatewayError::Quota {
                    provider,
                    source: QuotaError::InvalidAmount(request.units),
                }),
            );
        }

        if let Some(limit) = request.quota_limit {
            match self
                .tracker
                .check_threshold(&request.organization_id, provider, limit)
                .await
            {
                Ok(status) if !status.within_limit => {
                    return outcome(
                        0,
                        Err(GatewayError::QuotaExceeded {
                            provider,
                            organization_id: request.organization_id.clone(),
                            used: status.used,
                            limit,
                        }),
                    );
                }
                Ok(_) => {}
                Err(source) => return outcome(0, Err(GatewayError::Quota { provider, source })),
            }
        }

        let permit = match self.breaker.acquire(&request.target).await {
            Ok(permit) => permit,
            Err(open) => {
                info!(
                    correlation_id = %correlation_id,
                    %provider,
                    circuit = %open.target,
                    retry_in_ms = open.retry_in.as_millis() as u64,
                    "call rejected by open circuit"
                );
                return outcome(0, Err(GatewayError::CircuitOpen { provider, open }));
            }
        };

        let started = Instant::now();
        let result = self
            .retry
            .execute_with_retry(operation, classify, &request.cancel)
            .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let usage = match &result {
            Ok(retried) => {
                permit.succeed();
                Some(UsageEvent {
                    amount: request.units,
                    success: true,
                    tokens: retried.value.tokens(),
                    cost: retried.value.cost(),
                    response_time_ms: Some(elapsed_ms),
                })
            }
            Err(RetryError::Exhausted { .. }) => {
                permit.fail();
                Some(failed_usage(elapsed_ms))
            }
            // The provider answered; see `execute`.
            Err(RetryError::Fatal { .. }) => {
                permit.succeed();
                Some(failed_usage(elapsed_ms))
            }
            Err(RetryError::Cancelled { .. }) => {
                permit.release();
                None
            }
        };

        if let Some(event) = usage {
            if let Err(err) = self
                .tracker
                .record_event(&request.organization_id, provider, event)
                .await
            {
                error!(
                    correlation_id = %correlation_id,
                    organization_id = %request.organization_id,
                    %provider,
                    error = %err,
                    "failed to record usage"
                );
            }
        }

        match result {
            Ok(retried) => {
                if retried.succeeded_after_retry() {
                    info!(
                        correlation_id = %correlation_id,
                        %provider,
                        attempts = retried.attempts,
                        "succeeded after retry"
                    );
                }
                outcome(retried.attempts, Ok(retried.value))
            }
            Err(err) => {
                let attempts = err.attempts();
                let err = GatewayError::from_retry(provider, err);
                warn!(
                    correlation_id = %correlation_id,
                    %provider,
                    attempts,
                    status = ?err.upstream_status(),
                    error = %err,
                    "outbound call failed"
                );
                outcome(attempts, Err(err))
            }
        }
    }
}

fn failed_usage(elapsed_ms: u64) -> UsageEvent {
    UsageEvent {
        response_time_ms: Some(elapsed_ms),
        ..UsageEvent::failure()
    }
}
