use crate::models::UsageRow;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

/// Per-event increments applied by [`accumulate`].
#[derive(Debug, Clone, Default)]
pub struct UsageDelta {
    pub amount: f64,
    pub success: i64,
    pub failure: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost: f64,
    pub cost_samples: i64,
    pub response_time_ms: i64,
    pub response_time_samples: i64,
}

/// Inserts the window row or adds `delta` to it in one statement, so
/// concurrent writers for the same key never lose an update.
pub async fn accumulate(
    pool: &PgPool,
    organization_id: &str,
    provider: &str,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    delta: &UsageDelta,
) -> Result<UsageRow, sqlx::Error> {
    sqlx::query_as::<_, UsageRow>(
        r#"
        INSERT INTO usage_records
            (organization_id, provider, window_start, window_end, amount,
             request_count, success_count, failure_count, input_tokens, output_tokens,
             total_cost, cost_samples, total_response_time_ms, response_time_samples)
        VALUES ($1, $2, $3, $4, $5, 1, $6, $7, $8, $9, $10, $11, $12, $13)
        ON CONFLICT (organization_id, provider, window_start) DO UPDATE SET
            amount = usage_records.amount + EXCLUDED.amount,
            request_count = usage_records.request_count + 1,
            success_count = usage_records.success_count + EXCLUDED.success_count,
            failure_count = usage_records.failure_count + EXCLUDED.failure_count,
            input_tokens = usage_records.input_tokens + EXCLUDED.input_tokens,
            output_tokens = usage_records.output_tokens + EXCLUDED.output_tokens,
            total_cost = usage_records.total_cost + EXCLUDED.total_cost,
            cost_samples = usage_records.cost_samples + EXCLUDED.cost_samples,
            total_response_time_ms =
                usage_records.total_response_time_ms + EXCLUDED.total_response_time_ms,
            response_time_samples =
                usage_records.response_time_samples + EXCLUDED.response_time_samples,
            updated_at = now()
        RETURNING organization_id, provider, window_start, window_end, amount,
                  request_count, success_count, failure_count, input_tokens, output_tokens,
                  total_cost, cost_samples, total_response_time_ms, response_time_samples,
                  created_at, updated_at
        "#,
    )
    .bind(organization_id)
    .bind(provider)
    .bind(window_start)
    .bind(window_end)
    .bind(delta.amount)
    .bind(delta.success)
    .bind(delta.failure)
    .bind(delta.input_tokens)
    .bind(delta.output_tokens)
    .bind(delta.cost)
    .bind(delta.cost_samples)
    .bind(delta.response_time_ms)
    .bind(delta.response_time_samples)
    .fetch_one(pool)
    .await
}

pub async fn get(
    pool: &PgPool,
    organization_id: &str,
    provider: &str,
    window_start: DateTime<Utc>,
) -> Result<Option<UsageRow>, sqlx::Error> {
    sqlx::query_as::<_, UsageRow>(
        r#"
        SELECT organization_id, provider, window_start, window_end, amount,
               request_count, success_count, failure_count, input_tokens, output_tokens,
               total_cost, cost_samples, total_response_time_ms, response_time_samples,
               created_at, updated_at
        FROM usage_records
        WHERE organization_id = $1 AND provider = $2 AND window_start = $3
        "#,
    )
    .bind(organization_id)
    .bind(provider)
    .bind(window_start)
    .fetch_optional(pool)
    .await
}

pub async fn list_for_organization(
    pool: &PgPool,
    organization_id: &str,
    window_start: DateTime<Utc>,
) -> Result<Vec<UsageRow>, sqlx::Error> {
    sqlx::query_as::<_, UsageRow>(
        r#"
        SELECT organization_id, provider, window_start, window_end, amount,
               request_count, success_count, failure_count, input_tokens, output_tokens,
               total_cost, cost_samples, total_response_time_ms, response_time_samples,
               created_at, updated_at
        FROM usage_records
        WHERE organization_id = $1 AND window_start = $2
        ORDER BY provider
        "#,
    )
    .bind(organization_id)
    .bind(window_start)
    .fetch_all(pool)
    .await
}
