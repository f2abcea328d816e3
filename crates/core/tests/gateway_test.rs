use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gateway_core::circuit::{CircuitBreaker, CircuitConfig, CircuitStatus};
use gateway_core::error::{GatewayError, IntegrationError};
use gateway_core::gateway::{Gateway, GatewayRequest};
use gateway_core::quota::{InMemoryUsageStore, QuotaConfig, QuotaTracker};
use gateway_core::retry::{RetryConfig, RetryPolicy};
use gateway_core::types::{AuditEvent, Metered, Provider, TokenUsage};

fn gateway(failure_threshold: u32) -> Gateway {
    let breaker = CircuitBreaker::new(CircuitConfig {
        failure_threshold,
        cooldown_ms: 60_000,
    })
    .unwrap();
    let retry = RetryPolicy::new(RetryConfig {
        max_attempts: 3,
        backoff_base_ms: 100,
        backoff_multiplier: 2.0,
        ..Default::default()
    })
    .unwrap();
    let tracker =
        QuotaTracker::new(QuotaConfig::default(), Arc::new(InMemoryUsageStore::new())).unwrap();
    Gateway::new(Arc::new(breaker), retry, Arc::new(tracker))
}

#[derive(Debug, Clone, PartialEq)]
struct Completion {
    text: String,
    usage: TokenUsage,
}

impl Metered for Completion {
    fn tokens(&self) -> Option<TokenUsage> {
        Some(self.usage)
    }

    fn cost(&self) -> Option<f64> {
        Some(self.usage.total() as f64 * 0.00001)
    }
}

#[tokio::test(start_paused = true)]
async fn test_unauthorized_short_circuits_retries() {
    let gateway = gateway(3);
    let request = GatewayRequest::new("org_1", Provider::PagerDuty);
    let calls = AtomicU32::new(0);

    let outcome = gateway
        .execute(&request, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(IntegrationError::http(401, "invalid credentials")) }
        })
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(outcome.attempts, 1);
    match outcome.error() {
        Some(GatewayError::Fatal { source, .. }) => assert_eq!(source.status(), Some(401)),
        other => panic!("expected fatal error, got {:?}", other),
    }
    assert_eq!(
        gateway.breaker().status("pagerduty").await,
        CircuitStatus::Closed,
        "a rejected credential proves the target is reachable"
    );
}

#[tokio::test(start_paused = true)]
async fn test_service_unavailable_exhausts_attempts() {
    let gateway = gateway(3);
    let request = GatewayRequest::new("org_1", Provider::Slack);
    let calls = AtomicU32::new(0);

    let outcome = gateway
        .execute(&request, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(IntegrationError::http(503, "unavailable")) }
        })
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    match outcome.error() {
        Some(GatewayError::RetryExhausted {
            attempts, source, ..
        }) => {
            assert_eq!(*attempts, 3);
            assert_eq!(source.status(), Some(503));
        }
        other => panic!("expected exhausted error, got {:?}", other),
    }
    assert!(matches!(
        outcome.audit_events().as_slice(),
        [AuditEvent::FailedAfterAttempts {
            attempts: 3,
            status: Some(503),
            ..
        }]
    ));
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_invocations_trip_the_circuit() {
    let gateway = gateway(2);
    let request = GatewayRequest::new("org_1", Provider::Claude);
    let calls = AtomicU32::new(0);
    let failing = || {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Err::<(), _>(IntegrationError::Network("connection reset".to_string())) }
    };

    gateway.execute(&request, failing).await;
    gateway.execute(&request, failing).await;
    assert_eq!(calls.load(Ordering::SeqCst), 6);
    assert_eq!(gateway.breaker().status("claude").await, CircuitStatus::Open);

    let outcome = gateway.execute(&request, failing).await;
    assert_eq!(calls.load(Ordering::SeqCst), 6, "open circuit must not call out");
    assert!(matches!(outcome.error(), Some(GatewayError::CircuitOpen { .. })));
    assert_eq!(outcome.attempts, 0);

    tokio::time::advance(Duration::from_millis(60_001)).await;
    let outcome = gateway
        .execute(&request, || async { Ok::<_, IntegrationError>(()) })
        .await;
    assert!(outcome.is_success());
    assert_eq!(gateway.breaker().status("claude").await, CircuitStatus::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_fatal_error_settles_circuit_as_success() {
    let gateway = gateway(2);
    let request = GatewayRequest::new("org_1", Provider::PagerDuty).target("pagerduty:PSVC1");
    let unavailable = || async { Err::<(), _>(IntegrationError::http(503, "unavailable")) };
    let rejected = || async { Err::<(), _>(IntegrationError::http(401, "invalid credentials")) };

    gateway.execute(&request, unavailable).await;
    let snapshot = gateway.breaker().snapshot("pagerduty:PSVC1").await.unwrap();
    assert_eq!(snapshot.consecutive_failures, 1);

    gateway.execute(&request, rejected).await;
    let snapshot = gateway.breaker().snapshot("pagerduty:PSVC1").await.unwrap();
    assert_eq!(snapshot.consecutive_failures, 0);

    gateway.execute(&request, unavailable).await;
    gateway.execute(&request, unavailable).await;
    assert_eq!(gateway.breaker().status("pagerduty:PSVC1").await, CircuitStatus::Open);

    tokio::time::advance(Duration::from_millis(60_001)).await;
    let outcome = gateway.execute(&request, rejected).await;
    assert!(matches!(outcome.error(), Some(GatewayError::Fatal { .. })));
    assert_eq!(
        gateway.breaker().status("pagerduty:PSVC1").await,
        CircuitStatus::Closed,
        "a fatal half-open call reached the provider"
    );
    assert_eq!(gateway.breaker().status("pagerduty").await, CircuitStatus::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_fallback_after_primary_failure() {
    let gateway = gateway(3);
    let primary = GatewayRequest::new("org_pro", Provider::Claude).quota_limit(1_000.0);
    let fallback = GatewayRequest::new("org_pro", Provider::OpenAi).quota_limit(1_000.0);

    let outcome = gateway
        .execute_with_fallback(
            &primary,
            || async {
                Err::<Completion, _>(IntegrationError::http(500, "overloaded"))
            },
            &fallback,
            || async {
                Ok(Completion {
                    text: "audit complete".to_string(),
                    usage: TokenUsage {
                        input_tokens: 800,
                        output_tokens: 200,
                    },
                })
            },
        )
        .await;

    assert!(outcome.used_fallback);
    assert_eq!(outcome.provider, Provider::OpenAi);
    assert_eq!(outcome.fallback_from, Some(Provider::Claude));
    assert_eq!(outcome.attempts, 4, "three primary attempts plus one fallback");
    assert_eq!(outcome.result.as_ref().unwrap().text, "audit complete");

    let events = outcome.audit_events();
    assert!(matches!(
        events.as_slice(),
        [
            AuditEvent::FailedAfterAttempts { provider: Provider::Claude, .. },
            AuditEvent::FallbackUsed {
                primary: Provider::Claude,
                fallback: Provider::OpenAi,
                succeeded: true,
                ..
            },
        ]
    ));

    let stats = gateway.tracker().usage_stats("org_pro", None).await.unwrap();
    assert_eq!(stats.request_count, 2);
    assert_eq!(stats.success_count, 1);
    assert_eq!(stats.failure_count, 1);
    assert_eq!(stats.total_amount, 1.0);
    let openai = stats
        .providers
        .iter()
        .find(|p| p.provider == Provider::OpenAi)
        .unwrap();
    assert_eq!(openai.input_tokens, 800);
    assert_eq!(openai.output_tokens, 200);
}

#[tokio::test(start_paused = true)]
async fn test_fallback_skipped_when_primary_succeeds() {
    let gateway = gateway(3);
    let primary = GatewayRequest::new("org_1", Provider::PagerDuty);
    let fallback = GatewayRequest::new("org_1", Provider::Slack);
    let fallback_calls = AtomicU32::new(0);

    let outcome = gateway
        .execute_with_fallback(
            &primary,
            || async { Ok::<_, IntegrationError>(()) },
            &fallback,
            || {
                fallback_calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, IntegrationError>(()) }
            },
        )
        .await;

    assert!(outcome.is_success());
    assert!(!outcome.used_fallback);
    assert_eq!(fallback_calls.load(Ordering::SeqCst), 0);
}
