use chrono::{DateTime, Utc};
use gateway_core::error::QuotaError;
use gateway_core::quota::UsageRecord;
use gateway_core::types::Provider;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UsageRow {
    pub organization_id: String,
    pub provider: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub amount: f64,
    pub request_count: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_cost: f64,
    pub cost_samples: i64,
    pub total_response_time_ms: i64,
    pub response_time_samples: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// Counters are never negative in storage; clamp rather than wrap if a row
// was edited by hand.
fn count(v: i64) -> u64 {
    v.max(0) as u64
}

impl TryFrom<UsageRow> for UsageRecord {
    type Error = QuotaError;

    fn try_from(row: UsageRow) -> Result<Self, Self::Error> {
        let provider: Provider = row
            .provider
            .parse()
            .map_err(QuotaError::Store)?;
        Ok(UsageRecord {
            organization_id: row.organization_id,
            provider,
            window_start: row.window_start,
            window_end: row.window_end,
            amount: row.amount,
            request_count: count(row.request_count),
            success_count: count(row.success_count),
            failure_count: count(row.failure_count),
            input_tokens: count(row.input_tokens),
            output_tokens: count(row.output_tokens),
            total_cost: row.total_cost,
            cost_samples: count(row.cost_samples),
            total_response_time_ms: count(row.total_response_time_ms),
            response_time_samples: count(row.response_time_samples),
        })
    }
}
