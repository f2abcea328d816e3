//! Per-target circuit breaker.
//!
//! ```text
//!   CLOSED --failure_threshold consecutive failures--> OPEN
//!   OPEN   --cooldown elapsed, one probe admitted----> HALF_OPEN
//!   HALF_OPEN --probe succeeds--> CLOSED
//!   HALF_OPEN --probe fails-----> OPEN (opened_at reset)
//! ```
//!
//! While OPEN (or while a HALF_OPEN probe is in flight) calls fail fast with
//! [`CircuitOpen`] without invoking the operation or touching any counter.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::{CircuitError, CircuitOpen, ConfigError};
use crate::keyed::{lock, KeyedState};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitConfig {
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown_ms: 60_000,
        }
    }
}

impl CircuitConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid(
                "failure_threshold",
                "must be at least 1",
            ));
        }
        if self.cooldown_ms == 0 {
            return Err(ConfigError::invalid("cooldown_ms", "must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitState {
    pub status: CircuitStatus,
    pub consecutive_failures: u32,
    pub opened_at: Option<Instant>,
    pub probe_in_flight: bool,
    /// Number of times this target has tripped open since process start.
    pub trips: u64,
}

impl CircuitState {
    fn new() -> Self {
        Self {
            status: CircuitStatus::Closed,
            consecutive_failures: 0,
            opened_at: None,
            probe_in_flight: false,
            trips: 0,
        }
    }

    fn open(&mut self) {
        self.status = CircuitStatus::Open;
        self.opened_at = Some(Instant::now());
        self.probe_in_flight = false;
        self.trips += 1;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitSnapshot {
    pub target: String,
    pub status: CircuitStatus,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub trips: u64,
    pub retry_in_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Normal,
    Probe,
}

/// Admission to call a target. The holder must report the outcome with
/// [`CircuitPermit::succeed`] or [`CircuitPermit::fail`]; a permit dropped
/// without an outcome gives its probe slot back.
#[must_use = "report the call outcome through the permit"]
pub struct CircuitPermit {
    target: String,
    admission: Admission,
    entry: Arc<Mutex<CircuitState>>,
    failure_threshold: u32,
    settled: bool,
}

impl CircuitPermit {
    pub fn admission(&self) -> Admission {
        self.admission
    }

    pub fn succeed(mut self) {
        self.settled = true;
        let mut state = lock(&self.entry);
        state.consecutive_failures = 0;
        if state.status != CircuitStatus::Closed {
            info!(circuit = %self.target, "circuit closed");
        }
        state.status = CircuitStatus::Closed;
        state.opened_at = None;
        state.probe_in_flight = false;
    }

    pub fn fail(mut self) {
        self.settled = true;
        let mut state = lock(&self.entry);
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);

        match (self.admission, state.status) {
            (Admission::Probe, _) => {
                state.open();
                warn!(
                    circuit = %self.target,
                    trips = state.trips,
                    "recovery probe failed, circuit reopened"
                );
            }
            (Admission::Normal, CircuitStatus::Closed)
                if state.consecutive_failures >= self.failure_threshold =>
            {
                state.open();
                warn!(
                    circuit = %self.target,
                    failures = state.consecutive_failures,
                    trips = state.trips,
                    "circuit opened"
                );
            }
            _ => {}
        }
    }

    /// Gives the permit back without recording an outcome.
    pub fn release(self) {}
}

impl Drop for CircuitPermit {
    fn drop(&mut self) {
        if self.settled || self.admission != Admission::Probe {
            return;
        }
        let mut state = lock(&self.entry);
        if state.status == CircuitStatus::HalfOpen {
            state.probe_in_flight = false;
        }
    }
}

pub struct CircuitBreaker {
    config: CircuitConfig,
    circuits: KeyedState<String, CircuitState>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            circuits: KeyedState::new(),
        })
    }

    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// Admits a call to `target` or fails fast.
    pub async fn acquire(&self, target: &str) -> Result<CircuitPermit, CircuitOpen> {
        let entry = self
            .circuits
            .get_or_insert_with(&target.to_string(), CircuitState::new)
            .await;

        let admission = {
            let mut state = lock(&entry);
            match state.status {
                CircuitStatus::Closed => Admission::Normal,
                CircuitStatus::Open => {
                    let elapsed = state.opened_at.map(|at| at.elapsed()).unwrap_or_default();
                    let cooldown = self.config.cooldown();
                    if elapsed < cooldown {
                        return Err(CircuitOpen {
                            target: target.to_string(),
                            retry_in: cooldown - elapsed,
                        });
                    }
                    state.status = CircuitStatus::HalfOpen;
                    state.probe_in_flight = true;
                    info!(circuit = %target, "circuit half-open, admitting probe");
                    Admission::Probe
                }
                CircuitStatus::HalfOpen => {
                    if state.probe_in_flight {
                        return Err(CircuitOpen {
                            target: target.to_string(),
                            retry_in: Duration::ZERO,
                        });
                    }
                    state.probe_in_flight = true;
                    Admission::Probe
                }
            }
        };

        Ok(CircuitPermit {
            target: target.to_string(),
            admission,
            entry,
            failure_threshold: self.config.failure_threshold,
            settled: false,
        })
    }

    /// Runs `operation` if the circuit admits it. Every operation error
    /// counts as a failure.
    pub async fn execute<T, E, F, Fut>(
        &self,
        target: &str,
        operation: F,
    ) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
    {
        self.execute_with(target, operation, |_| true).await
    }

    /// Like [`execute`](Self::execute), but only errors for which `is_outage`
    /// returns true count towards tripping. Other errors prove the target is
    /// reachable and are recorded as successes before being returned.
    pub async fn execute_with<T, E, F, Fut, P>(
        &self,
        target: &str,
        operation: F,
        is_outage: P,
    ) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
        P: FnOnce(&E) -> bool,
    {
        let permit = self.acquire(target).await?;
        match operation().await {
            Ok(value) => {
                permit.succeed();
                Ok(value)
            }
            Err(err) => {
                if is_outage(&err) {
                    permit.fail();
                } else {
                    permit.succeed();
                }
                Err(CircuitError::Operation(err))
            }
        }
    }

    pub async fn status(&self, target: &str) -> CircuitStatus {
        match self.circuits.get(&target.to_string()).await {
            Some(entry) => lock(&entry).status,
            None => CircuitStatus::Closed,
        }
    }

    pub async fn snapshot(&self, target: &str) -> Option<CircuitSnapshot> {
        let entry = self.circuits.get(&target.to_string()).await?;
        let state = lock(&entry).clone();
        Some(self.describe(target.to_string(), &state))
    }

    pub async fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let mut snapshots: Vec<_> = self
            .circuits
            .snapshot()
            .await
            .into_iter()
            .map(|(target, state)| self.describe(target, &state))
            .collect();
        snapshots.sort_by(|a, b| a.target.cmp(&b.target));
        snapshots
    }

    fn describe(&self, target: String, state: &CircuitState) -> CircuitSnapshot {
        let retry_in_ms = match (state.status, state.opened_at) {
            (CircuitStatus::Open, Some(opened_at)) => Some(
                self.config
                    .cooldown()
                    .saturating_sub(opened_at.elapsed())
                    .as_millis() as u64,
            ),
            _ => None,
        };
        CircuitSnapshot {
            target,
            status: state.status,
            consecutive_failures: state.consecutive_failures,
            failure_threshold: self.config.failure_threshold,
            trips: state.trips,
            retry_in_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IntegrationError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(CircuitConfig {
            failure_threshold: 3,
            cooldown_ms: 60_000,
        })
        .unwrap()
    }

    async fn fail_once(breaker: &CircuitBreaker, target: &str, calls: &AtomicU32) {
        let result: Result<(), _> = breaker
            .execute(target, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(IntegrationError::http(503, "unavailable"))
            })
            .await;
        assert!(matches!(result, Err(CircuitError::Operation(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_trips_after_threshold_and_fails_fast() {
        let breaker = breaker();
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            fail_once(&breaker, "pagerduty:svc_1", &calls).await;
        }
        assert_eq!(breaker.status("pagerduty:svc_1").await, CircuitStatus::Open);

        let result: Result<(), CircuitError<IntegrationError>> = breaker
            .execute("pagerduty:svc_1", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(CircuitError::Open(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3, "open circuit must not invoke the operation");
        let snapshot = breaker.snapshot("pagerduty:svc_1").await.unwrap();
        assert_eq!(snapshot.consecutive_failures, 3, "fail-fast must not mutate counters");
        assert_eq!(snapshot.trips, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_after_cooldown_closes_on_success() {
        let breaker = breaker();
        let calls = AtomicU32::new(0);
        for _ in 0..3 {
            fail_once(&breaker, "slack", &calls).await;
        }

        tokio::time::advance(Duration::from_millis(60_001)).await;

        let result: Result<&str, CircuitError<IntegrationError>> =
            breaker.execute("slack", || async { Ok("posted") }).await;
        assert_eq!(result.unwrap(), "posted");
        assert_eq!(breaker.status("slack").await, CircuitStatus::Closed);

        let snapshot = breaker.snapshot("slack").await.unwrap();
        assert_eq!(snapshot.consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_still_open_just_before_cooldown() {
        let breaker = breaker();
        let calls = AtomicU32::new(0);
        for _ in 0..3 {
            fail_once(&breaker, "claude", &calls).await;
        }

        tokio::time::advance(Duration::from_millis(59_999)).await;

        let err = breaker.acquire("claude").await.err().unwrap();
        assert_eq!(err.retry_in, Duration::from_millis(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_reopens_and_resets_opened_at() {
        let breaker = breaker();
        let calls = AtomicU32::new(0);
        for _ in 0..3 {
            fail_once(&breaker, "openai", &calls).await;
        }

        tokio::time::advance(Duration::from_millis(60_001)).await;
        fail_once(&breaker, "openai", &calls).await;

        assert_eq!(breaker.status("openai").await, CircuitStatus::Open);
        let err = breaker.acquire("openai").await.err().unwrap();
        assert_eq!(err.retry_in, Duration::from_millis(60_000), "cooldown restarts at reopen");

        let snapshot = breaker.snapshot("openai").await.unwrap();
        assert_eq!(snapshot.trips, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_one_probe_while_half_open() {
        let breaker = breaker();
        let calls = AtomicU32::new(0);
        for _ in 0..3 {
            fail_once(&breaker, "slack", &calls).await;
        }
        tokio::time::advance(Duration::from_millis(60_001)).await;

        let probe = breaker.acquire("slack").await.unwrap();
        assert_eq!(probe.admission(), Admission::Probe);
        assert_eq!(breaker.status("slack").await, CircuitStatus::HalfOpen);

        assert!(breaker.acquire("slack").await.is_err(), "second caller must fail fast");
        assert!(breaker.acquire("slack").await.is_err());

        probe.succeed();
        let next = breaker.acquire("slack").await.unwrap();
        assert_eq!(next.admission(), Admission::Normal);
        next.succeed();
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_probe_releases_slot() {
        let breaker = breaker();
        let calls = AtomicU32::new(0);
        for _ in 0..3 {
            fail_once(&breaker, "slack", &calls).await;
        }
        tokio::time::advance(Duration::from_millis(60_001)).await;

        let probe = breaker.acquire("slack").await.unwrap();
        drop(probe);

        assert_eq!(breaker.status("slack").await, CircuitStatus::HalfOpen);
        let retry = breaker.acquire("slack").await.unwrap();
        assert_eq!(retry.admission(), Admission::Probe);
        retry.fail();
        assert_eq!(breaker.status("slack").await, CircuitStatus::Open);
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_failures() {
        let breaker = breaker();
        let calls = AtomicU32::new(0);

        fail_once(&breaker, "claude", &calls).await;
        fail_once(&breaker, "claude", &calls).await;
        let ok: Result<(), CircuitError<IntegrationError>> =
            breaker.execute("claude", || async { Ok(()) }).await;
        assert!(ok.is_ok());
        fail_once(&breaker, "claude", &calls).await;
        fail_once(&breaker, "claude", &calls).await;

        assert_eq!(breaker.status("claude").await, CircuitStatus::Closed);
    }

    #[tokio::test]
    async fn test_targets_are_independent() {
        let breaker = breaker();
        let calls = AtomicU32::new(0);
        for _ in 0..3 {
            fail_once(&breaker, "pagerduty:svc_a", &calls).await;
        }

        assert_eq!(breaker.status("pagerduty:svc_a").await, CircuitStatus::Open);
        assert_eq!(breaker.status("pagerduty:svc_b").await, CircuitStatus::Closed);
        assert!(breaker.acquire("pagerduty:svc_b").await.is_ok());
    }

    #[tokio::test]
    async fn test_non_outage_errors_do_not_trip() {
        let breaker = breaker();
        for _ in 0..5 {
            let result: Result<(), _> = breaker
                .execute_with(
                    "pagerduty:svc_1",
                    || async { Err(IntegrationError::http(400, "bad service config")) },
                    |err: &IntegrationError| err.is_retryable(),
                )
                .await;
            match result {
                Err(CircuitError::Operation(err)) => assert_eq!(err.status(), Some(400)),
                other => panic!("expected operation error, got {:?}", other.err()),
            }
        }
        assert_eq!(breaker.status("pagerduty:svc_1").await, CircuitStatus::Closed);
    }

    #[tokio::test]
    async fn test_snapshots_sorted_by_target() {
        let breaker = breaker();
        breaker.acquire("slack").await.unwrap().succeed();
        breaker.acquire("claude").await.unwrap().succeed();

        let targets: Vec<_> = breaker
            .snapshots()
            .await
            .into_iter()
            .map(|s| s.target)
            .collect();
        assert_eq!(targets, vec!["claude", "slack"]);
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(CircuitBreaker::new(CircuitConfig {
            failure_threshold: 0,
            cooldown_ms: 1000,
        })
        .is_err());
        assert!(CircuitBreaker::new(CircuitConfig {
            failure_threshold: 3,
            cooldown_ms: 0,
        })
        .is_err());
    }
}
