//! Captured-log drain and the normalization error ledger.

use sqlx::PgPool;
use tracing::debug;

use crate::error::StoreError;
use crate::models::CapturedLog;

/// Where a rejected statement came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSource {
    Log,
    View,
    Function,
}

impl ErrorSource {
    fn as_str(self) -> &'static str {
        match self {
            ErrorSource::Log => "LOG",
            ErrorSource::View => "VIEW",
            ErrorSource::Function => "FUNCTION",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogStore {
    pool: PgPool,
}

impl LogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Fetch the next batch of unprocessed log rows, oldest first.
    pub async fn fetch_unprocessed(&self, limit: i64) -> Result<Vec<CapturedLog>, StoreError> {
        let rows = sqlx::query_as(
            r#"
            SELECT log_id, log_time, source_database_name, raw_sql_text, duration_ms
            FROM lineascope.captured_logs
            WHERE is_processed_for_analysis = FALSE
            ORDER BY log_id
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Mark a batch consumed, stamping the fingerprint hash where one was
    /// produced. Rows rejected by the fingerprinter get `NULL` hashes and
    /// are still consumed — they will never be retried.
    ///
    /// Re-delivery is a no-op: the flag and hash are absolute values, so
    /// writing them twice changes nothing.
    pub async fn mark_processed(
        &self,
        outcomes: &[(i64, Option<String>)],
    ) -> Result<u64, StoreError> {
        if outcomes.is_empty() {
            return Ok(0);
        }

        let with_hash_ids: Vec<i64> = outcomes
            .iter()
            .filter(|(_, hash)| hash.is_some())
            .map(|(id, _)| *id)
            .collect();
        let with_hash_values: Vec<String> = outcomes
            .iter()
            .filter_map(|(_, hash)| hash.clone())
            .collect();
        let without_hash_ids: Vec<i64> = outcomes
            .iter()
            .filter(|(_, hash)| hash.is_none())
            .map(|(id, _)| *id)
            .collect();

        let mut updated = 0u64;

        if !with_hash_ids.is_empty() {
            let result = sqlx::query(
                r#"
                UPDATE lineascope.captured_logs AS logs
                SET is_processed_for_analysis = TRUE,
                    normalized_sql_hash = batch.sql_hash
                FROM UNNEST($1::bigint[], $2::text[]) AS batch (log_id, sql_hash)
                WHERE logs.log_id = batch.log_id
                "#,
            )
            .bind(&with_hash_ids)
            .bind(&with_hash_values)
            .execute(&self.pool)
            .await?;
            updated += result.rows_affected();
        }

        if !without_hash_ids.is_empty() {
            let result = sqlx::query(
                r#"
                UPDATE lineascope.captured_logs
                SET is_processed_for_analysis = TRUE
                WHERE log_id = ANY($1)
                "#,
            )
            .bind(&without_hash_ids)
            .execute(&self.pool)
            .await?;
            updated += result.rows_affected();
        }

        debug!(updated, "marked captured logs as processed");
        Ok(updated)
    }

    /// Record a statement the fingerprinter refused, for operator review.
    pub async fn record_normalization_error(
        &self,
        source: ErrorSource,
        source_id: i64,
        raw_sql: &str,
        reason_code: &str,
        detail: Option<&str>,
        source_database: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO lineascope.normalization_errors (
                source_type, source_id, raw_sql_text,
                error_reason, error_detail, source_database_name
            ) VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(source.as_str())
        .bind(source_id)
        .bind(raw_sql)
        .bind(reason_code)
        .bind(detail)
        .bind(source_database)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
