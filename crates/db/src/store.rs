use async_trait::async_trait;
use gateway_core::error::QuotaError;
use gateway_core::quota::{UsageEvent, UsageKey, UsageRecord, UsageStore, UsageWindow};
use sqlx::PgPool;
use tracing::error;

use crate::queries::usage::{self, UsageDelta};

/// Postgres-backed [`UsageStore`]. Each event is a single upsert, so
/// increments stay atomic across processes sharing the database.
#[derive(Clone)]
pub struct PgUsageStore {
    pool: PgPool,
}

impl PgUsageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn store_error(err: sqlx::Error) -> QuotaError {
    error!(error = %err, "usage store query failed");
    QuotaError::Store(err.to_string())
}

fn clamp_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

pub fn delta_for(event: &UsageEvent) -> UsageDelta {
    let tokens = event.tokens.unwrap_or_default();
    UsageDelta {
        amount: event.amount,
        success: i64::from(event.success),
        failure: i64::from(!event.success),
        input_tokens: clamp_i64(tokens.input_tokens),
        output_tokens: clamp_i64(tokens.output_tokens),
        cost: event.cost.unwrap_or(0.0),
        cost_samples: i64::from(event.cost.is_some()),
        response_time_ms: clamp_i64(event.response_time_ms.unwrap_or(0)),
        response_time_samples: i64::from(event.response_time_ms.is_some()),
    }
}

#[async_trait]
impl UsageStore for PgUsageStore {
    async fn record(
        &self,
        key: &UsageKey,
        window: UsageWindow,
        event: &UsageEvent,
    ) -> Result<UsageRecord, QuotaError> {
        let row = usage::accumulate(
            &self.pool,
            &key.organization_id,
            key.provider.as_str(),
            window.start,
            window.end,
            &delta_for(event),
        )
        .await
        .map_err(store_error)?;
        UsageRecord::try_from(row)
    }

    async fn read(
        &self,
        key: &UsageKey,
        window: UsageWindow,
    ) -> Result<Option<UsageRecord>, QuotaError> {
        usage::get(
            &self.pool,
            &key.organization_id,
            key.provider.as_str(),
            window.start,
        )
        .await
        .map_err(store_error)?
        .map(UsageRecord::try_from)
        .transpose()
    }

    async fn read_organization(
        &self,
        organization_id: &str,
        window: UsageWindow,
    ) -> Result<Vec<UsageRecord>, QuotaError> {
        usage::list_for_organization(&self.pool, organization_id, window.start)
            .await
            .map_err(store_error)?
            .into_iter()
            .map(UsageRecord::try_from)
            .collect()
    }
}
