//! Usage accumulation per organization and provider, and threshold checks.
//!
//! Usage is bucketed into fixed windows aligned to the unix epoch (one day by
//! default). A record belongs to exactly one window; the first event after
//! `window_end` starts a fresh record.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{ConfigError, QuotaError};
use crate::keyed::{lock, KeyedState};
use crate::types::{Provider, TokenUsage};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaConfig {
    pub window_secs: i64,
    /// Fraction of the limit at which a warning is raised.
    pub warning_fraction: f64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            window_secs: 86_400,
            warning_fraction: 0.9,
        }
    }
}

impl QuotaConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_secs <= 0 {
            return Err(ConfigError::invalid("window_secs", "must be positive"));
        }
        if !self.warning_fraction.is_finite()
            || self.warning_fraction <= 0.0
            || self.warning_fraction > 1.0
        {
            return Err(ConfigError::invalid("warning_fraction", "must be in (0, 1]"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UsageKey {
    pub organization_id: String,
    pub provider: Provider,
}

impl UsageKey {
    pub fn new(organization_id: impl Into<String>, provider: Provider) -> Self {
        Self {
            organization_id: organization_id.into(),
            provider,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl UsageWindow {
    pub fn containing(now: DateTime<Utc>, window_secs: i64) -> Self {
        let ts = now.timestamp();
        let start_secs = ts - ts.rem_euclid(window_secs);
        let start = Utc
            .timestamp_opt(start_secs, 0)
            .single()
            .unwrap_or(now);
        Self {
            start,
            end: start + Duration::seconds(window_secs),
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }
}

/// Metadata describing one usage event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageEvent {
    pub amount: f64,
    pub success: bool,
    pub tokens: Option<TokenUsage>,
    pub cost: Option<f64>,
    pub response_time_ms: Option<u64>,
}

impl UsageEvent {
    pub fn success(amount: f64) -> Self {
        Self {
            amount,
            success: true,
            ..Default::default()
        }
    }

    pub fn failure() -> Self {
        Self {
            amount: 0.0,
            success: false,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub organization_id: String,
    pub provider: Provider,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub amount: f64,
    pub request_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_cost: f64,
    pub cost_samples: u64,
    pub total_response_time_ms: u64,
    pub response_time_samples: u64,
}

impl UsageRecord {
    pub fn empty(key: &UsageKey, window: UsageWindow) -> Self {
        Self {
            organization_id: key.organization_id.clone(),
            provider: key.provider,
            window_start: window.start,
            window_end: window.end,
            amount: 0.0,
            request_count: 0,
            success_count: 0,
            failure_count: 0,
            input_tokens: 0,
            output_tokens: 0,
            total_cost: 0.0,
            cost_samples: 0,
            total_response_time_ms: 0,
            response_time_samples: 0,
        }
    }

    /// Folds one event into the accumulators. All updates are additive so
    /// concurrent events commute.
    pub fn apply(&mut self, event: &UsageEvent) {
        self.amount += event.amount;
        self.request_count += 1;
        if event.success {
            self.success_count += 1;
        } else {
            self.failure_count += 1;
        }
        if let Some(tokens) = event.tokens {
            self.input_tokens += tokens.input_tokens;
            self.output_tokens += tokens.output_tokens;
        }
        if let Some(cost) = event.cost {
            self.total_cost += cost;
            self.cost_samples += 1;
        }
        if let Some(ms) = event.response_time_ms {
            self.total_response_time_ms += ms;
            self.response_time_samples += 1;
        }
    }
}

/// Narrow persistence capability behind the tracker. Implementations must
/// apply `record` atomically per key.
#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn record(
        &self,
        key: &UsageKey,
        window: UsageWindow,
        event: &UsageEvent,
    ) -> Result<UsageRecord, QuotaError>;

    async fn read(
        &self,
        key: &UsageKey,
        window: UsageWindow,
    ) -> Result<Option<UsageRecord>, QuotaError>;

    async fn read_organization(
        &self,
        organization_id: &str,
        window: UsageWindow,
    ) -> Result<Vec<UsageRecord>, QuotaError>;
}

/// Process-local store. Keeps only the newest window per key; older
/// windows are dropped as soon as a newer one is written, and late writes
/// for them are discarded.
#[derive(Default)]
pub struct InMemoryUsageStore {
    records: KeyedState<UsageKey, UsageRecord>,
}

impl InMemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UsageStore for InMemoryUsageStore {
    async fn record(
        &self,
        key: &UsageKey,
        window: UsageWindow,
        event: &UsageEvent,
    ) -> Result<UsageRecord, QuotaError> {
        let entry = self
            .records
            .get_or_insert_with(key, || UsageRecord::empty(key, window))
            .await;
        let mut record = lock(&entry);
        if window.start < record.window_start {
            warn!(
                organization_id = %key.organization_id,
                provider = %key.provider,
                window_start = %window.start,
                current_window_start = %record.window_start,
                "usage for a closed window dropped"
            );
            let mut late = UsageRecord::empty(key, window);
            late.apply(event);
            return Ok(late);
        }
        if window.start > record.window_start {
            *record = UsageRecord::empty(key, window);
        }
        record.apply(event);
        Ok(record.clone())
    }

    async fn read(
        &self,
        key: &UsageKey,
        window: UsageWindow,
    ) -> Result<Option<UsageRecord>, QuotaError> {
        let Some(entry) = self.records.get(key).await else {
            return Ok(None);
        };
        let record = lock(&entry);
        Ok((record.window_start == window.start).then(|| record.clone()))
    }

    async fn read_organization(
        &self,
        organization_id: &str,
        window: UsageWindow,
    ) -> Result<Vec<UsageRecord>, QuotaError> {
        Ok(self
            .records
            .snapshot()
            .await
            .into_iter()
            .filter(|(key, record)| {
                key.organization_id == organization_id && record.window_start == window.start
            })
            .map(|(_, record)| record)
            .collect())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdStatus {
    pub within_limit: bool,
    pub used: f64,
    pub limit: f64,
    pub remaining: f64,
    pub percentage_used: f64,
    pub warning: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderUsage {
    pub provider: Provider,
    pub amount: f64,
    pub request_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub average_cost: Option<f64>,
    pub average_response_time_ms: Option<f64>,
}

impl From<&UsageRecord> for ProviderUsage {
    fn from(record: &UsageRecord) -> Self {
        Self {
            provider: record.provider,
            amount: record.amount,
            request_count: record.request_count,
            success_count: record.success_count,
            failure_count: record.failure_count,
            input_tokens: record.input_tokens,
            output_tokens: record.output_tokens,
            average_cost: average(record.total_cost, record.cost_samples),
            average_response_time_ms: average(
                record.total_response_time_ms as f64,
                record.response_time_samples,
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStats {
    pub organization_id: String,
    pub window: UsageWindow,
    pub total_amount: f64,
    pub request_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub total_cost: f64,
    pub average_cost: Option<f64>,
    pub average_response_time_ms: Option<f64>,
    pub providers: Vec<ProviderUsage>,
}

fn average(total: f64, samples: u64) -> Option<f64> {
    (samples > 0).then(|| total / samples as f64)
}

pub struct QuotaTracker {
    config: QuotaConfig,
    store: Arc<dyn UsageStore>,
    clock: Arc<dyn Clock>,
}

impl QuotaTracker {
    pub fn new(config: QuotaConfig, store: Arc<dyn UsageStore>) -> Result<Self, ConfigError> {
        Self::with_clock(config, store, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: QuotaConfig,
        store: Arc<dyn UsageStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            store,
            clock,
        })
    }

    pub fn current_window(&self) -> UsageWindow {
        UsageWindow::containing(self.clock.now(), self.config.window_secs)
    }

    /// Adds `amount` to the current window for (organization, provider).
    pub async fn record(
        &self,
        organization_id: &str,
        provider: Provider,
        amount: f64,
    ) -> Result<UsageRecord, QuotaError> {
        self.record_event(organization_id, provider, UsageEvent::success(amount))
            .await
    }

    pub async fn record_event(
        &self,
        organization_id: &str,
        provider: Provider,
        event: UsageEvent,
    ) -> Result<UsageRecord, QuotaError> {
        if !event.amount.is_finite() || event.amount < 0.0 {
            error!(
                organization_id,
                %provider,
                amount = event.amount,
                "rejected invalid usage amount"
            );
            return Err(QuotaError::InvalidAmount(event.amount));
        }
        let key = UsageKey::new(organization_id, provider);
        self.store
            .record(&key, self.current_window(), &event)
            .await
    }

    pub async fn current_usage(
        &self,
        organization_id: &str,
        provider: Provider,
    ) -> Result<f64, QuotaError> {
        let key = UsageKey::new(organization_id, provider);
        Ok(self
            .store
            .read(&key, self.current_window())
            .await?
            .map(|record| record.amount)
            .unwrap_or(0.0))
    }

    pub async fn check_threshold(
        &self,
        organization_id: &str,
        provider: Provider,
        limit: f64,
    ) -> Result<ThresholdStatus, QuotaError> {
        let used = self.current_usage(organization_id, provider).await?;
        let status = evaluate(used, limit, self.config.warning_fraction);
        if !status.within_limit {
            warn!(organization_id, %provider, used, limit, "quota exceeded");
        } else if status.warning {
            warn!(
                organization_id,
                %provider,
                used,
                limit,
                percentage_used = status.percentage_used,
                "quota nearly exhausted"
            );
        }
        Ok(status)
    }

    /// Aggregates the current window, optionally restricted to one provider.
    /// Unknown organizations get an all-zero baseline.
    pub async fn usage_stats(
        &self,
        organization_id: &str,
        provider: Option<Provider>,
    ) -> Result<UsageStats, QuotaError> {
        let window = self.current_window();
        let mut records: Vec<UsageRecord> = match provider {
            Some(provider) => self
                .store
                .read(&UsageKey::new(organization_id, provider), window)
                .await?
                .into_iter()
                .collect(),
            None => self.store.read_organization(organization_id, window).await?,
        };
        records.sort_by_key(|r| r.provider.as_str());

        let total_cost: f64 = records.iter().map(|r| r.total_cost).sum();
        let cost_samples: u64 = records.iter().map(|r| r.cost_samples).sum();
        let response_ms: u64 = records.iter().map(|r| r.total_response_time_ms).sum();
        let response_samples: u64 = records.iter().map(|r| r.response_time_samples).sum();

        Ok(UsageStats {
            organization_id: organization_id.to_string(),
            window,
            total_amount: records.iter().map(|r| r.amount).sum(),
            request_count: records.iter().map(|r| r.request_count).sum(),
            success_count: records.iter().map(|r| r.success_count).sum(),
            failure_count: records.iter().map(|r| r.failure_count).sum(),
            total_cost,
            average_cost: average(total_cost, cost_samples),
            average_response_time_ms: average(response_ms as f64, response_samples),
            providers: records.iter().map(ProviderUsage::from).collect(),
        })
    }
}

/// Pure threshold evaluation. A non-positive limit allows nothing.
pub fn evaluate(used: f64, limit: f64, warning_fraction: f64) -> ThresholdStatus {
    if limit <= 0.0 {
        return ThresholdStatus {
            within_limit: false,
            used,
            limit,
            remaining: 0.0,
            percentage_used: 100.0,
            warning: true,
        };
    }
    let percentage_used = used / limit * 100.0;
    ThresholdStatus {
        within_limit: used < limit,
        used,
        limit,
        remaining: (limit - used).max(0.0),
        percentage_used,
        warning: percentage_used >= warning_fraction * 100.0,
    }
}
