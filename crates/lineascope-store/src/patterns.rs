//! The `sql_patterns` repository.
//!
//! A pattern row is keyed by its content-addressed hash and is the unit of
//! work for both the LLM extractor and the lineage graph builder. All upserts
//! conflict on `sql_hash`; all batch claims take row locks with
//! `FOR UPDATE SKIP LOCKED` so concurrent workers partition the backlog
//! instead of colliding on it.

use chrono::{DateTime, Duration, Utc};
use lineascope_core::Fingerprint;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::models::{LlmStatus, SqlPatternRow};

const PATTERN_COLUMNS: &str = "sql_hash, normalized_sql_text, sample_raw_sql_text, \
     source_database_name, first_seen_at, last_seen_at, execution_count, \
     total_duration_ms, avg_duration_ms, max_duration_ms, min_duration_ms, \
     llm_status, llm_extracted_json, llm_error_message, last_llm_analysis_at, \
     loaded_to_graph, graph_load_error";

#[derive(Debug, Clone)]
pub struct PatternStore {
    pool: PgPool,
    /// When true, an observation arriving for a `FAILED_*` pattern re-primes
    /// it to `PENDING` (operator policy).
    reanalyze_failed: bool,
}

impl PatternStore {
    pub fn new(pool: PgPool, reanalyze_failed: bool) -> Self {
        Self {
            pool,
            reanalyze_failed,
        }
    }

    /// Upsert one observation from the query log.
    ///
    /// New hash: the row starts with `execution_count = 1` and the
    /// observation's duration as every aggregate. Existing hash: the counter
    /// increments, duration aggregates fold in, and the sample/normalised
    /// text is left alone (first writer wins — the texts are equivalent by
    /// construction).
    pub async fn upsert_from_log(
        &self,
        fingerprint: &Fingerprint,
        raw_sql: &str,
        source_database: &str,
        log_time: DateTime<Utc>,
        duration_ms: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO lineascope.sql_patterns (
                sql_hash, normalized_sql_text, sample_raw_sql_text,
                source_database_name, first_seen_at, last_seen_at,
                execution_count, total_duration_ms, avg_duration_ms,
                max_duration_ms, min_duration_ms, llm_status
            ) VALUES ($1, $2, $3, $4, $5, $5, 1, $6, $6, $6, $6, 'PENDING')
            ON CONFLICT (sql_hash) DO UPDATE SET
                last_seen_at      = GREATEST(sql_patterns.last_seen_at, EXCLUDED.last_seen_at),
                execution_count   = sql_patterns.execution_count + 1,
                total_duration_ms = sql_patterns.total_duration_ms + EXCLUDED.total_duration_ms,
                avg_duration_ms   = (sql_patterns.total_duration_ms + EXCLUDED.total_duration_ms)::float8
                                    / (sql_patterns.execution_count + 1),
                max_duration_ms   = GREATEST(sql_patterns.max_duration_ms, EXCLUDED.max_duration_ms),
                min_duration_ms   = LEAST(sql_patterns.min_duration_ms, EXCLUDED.min_duration_ms),
                llm_status        = CASE
                    WHEN $7 AND sql_patterns.llm_status IN ('FAILED_PARSE', 'FAILED_LLM')
                        THEN 'PENDING'
                    ELSE sql_patterns.llm_status
                END,
                updated_at        = now()
            "#,
        )
        .bind(&fingerprint.sql_hash)
        .bind(&fingerprint.normalized_sql)
        .bind(raw_sql)
        .bind(source_database)
        .bind(log_time)
        .bind(duration_ms.max(0))
        .bind(self.reanalyze_failed)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Upsert a pattern discovered in a view or function definition.
    ///
    /// Definitions carry no execution statistics (`execution_count = 0`) and
    /// must never clobber statistics of a pattern also seen in the log: the
    /// sample text is only replaced while the row is still
    /// definition-sourced, and a successful analysis is never re-primed.
    pub async fn upsert_from_definition(
        &self,
        fingerprint: &Fingerprint,
        definition_sql: &str,
        source_database: &str,
        metadata_updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO lineascope.sql_patterns (
                sql_hash, normalized_sql_text, sample_raw_sql_text,
                source_database_name, first_seen_at, last_seen_at,
                execution_count, total_duration_ms, avg_duration_ms,
                max_duration_ms, min_duration_ms, llm_status
            ) VALUES ($1, $2, $3, $4, $5, $5, 0, 0, 0, 0, 0, 'PENDING')
            ON CONFLICT (sql_hash) DO UPDATE SET
                last_seen_at        = GREATEST(sql_patterns.last_seen_at, EXCLUDED.last_seen_at),
                sample_raw_sql_text = CASE
                    WHEN sql_patterns.execution_count = 0 THEN EXCLUDED.sample_raw_sql_text
                    ELSE sql_patterns.sample_raw_sql_text
                END,
                llm_status          = CASE
                    WHEN sql_patterns.llm_status IN ('COMPLETED_SUCCESS', 'COMPLETED_NO_LINEAGE', 'IN_PROGRESS')
                        THEN sql_patterns.llm_status
                    ELSE 'PENDING'
                END,
                updated_at          = now()
            "#,
        )
        .bind(&fingerprint.sql_hash)
        .bind(&fingerprint.normalized_sql)
        .bind(definition_sql)
        .bind(source_database)
        .bind(metadata_updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Claim up to `limit` `PENDING` patterns for LLM analysis and move them
    /// to `IN_PROGRESS`.
    ///
    /// The claim transaction is short: the status transition itself is what
    /// keeps other workers away during the (long) LLM call. Busiest patterns
    /// first.
    pub async fn claim_for_analysis(&self, limit: i64) -> Result<Vec<SqlPatternRow>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let rows: Vec<SqlPatternRow> = sqlx::query_as(&format!(
            r#"
            SELECT {PATTERN_COLUMNS}
            FROM lineascope.sql_patterns
            WHERE llm_status = 'PENDING'
            ORDER BY execution_count DESC, last_seen_at DESC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#
        ))
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        if rows.is_empty() {
            tx.rollback().await?;
            return Ok(rows);
        }

        let hashes: Vec<String> = rows.iter().map(|r| r.sql_hash.clone()).collect();
        sqlx::query(
            r#"
            UPDATE lineascope.sql_patterns
            SET llm_status = 'IN_PROGRESS', claimed_at = now(), updated_at = now()
            WHERE sql_hash = ANY($1)
            "#,
        )
        .bind(&hashes)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(count = rows.len(), "claimed patterns for analysis");
        Ok(rows)
    }

    /// Record the outcome of an LLM analysis.
    pub async fn record_analysis_outcome(
        &self,
        sql_hash: &str,
        status: LlmStatus,
        document_json: Option<serde_json::Value>,
        error_message: Option<&str>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE lineascope.sql_patterns
            SET llm_status = $2,
                llm_extracted_json = COALESCE($3, llm_extracted_json),
                llm_error_message = $4,
                last_llm_analysis_at = now(),
                updated_at = now()
            WHERE sql_hash = $1
            "#,
        )
        .bind(sql_hash)
        .bind(status.as_str())
        .bind(document_json)
        .bind(error_message)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::PatternNotFound {
                sql_hash: sql_hash.to_string(),
            });
        }
        Ok(())
    }

    /// Claim patterns ready for graph loading, keeping their row locks for
    /// the lifetime of the returned batch.
    pub async fn claim_for_graph_load(&self, limit: i64) -> Result<ClaimedPatterns, StoreError> {
        let mut tx = self.pool.begin().await?;
        let rows: Vec<SqlPatternRow> = sqlx::query_as(&format!(
            r#"
            SELECT {PATTERN_COLUMNS}
            FROM lineascope.sql_patterns
            WHERE llm_status = 'COMPLETED_SUCCESS' AND loaded_to_graph = FALSE
            ORDER BY last_seen_at DESC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#
        ))
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        Ok(ClaimedPatterns { tx, rows })
    }

    /// Return stale `IN_PROGRESS` claims to `PENDING`.
    ///
    /// Run at worker startup: a graceful shutdown never leaves claims
    /// behind, so anything older than the grace interval belongs to a dead
    /// worker.
    pub async fn reset_stale_in_progress(&self, grace: Duration) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - grace;
        let result = sqlx::query(
            r#"
            UPDATE lineascope.sql_patterns
            SET llm_status = 'PENDING', claimed_at = NULL, updated_at = now()
            WHERE llm_status = 'IN_PROGRESS' AND claimed_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        let swept = result.rows_affected();
        if swept > 0 {
            info!(swept, "reset stale IN_PROGRESS patterns to PENDING");
        }
        Ok(swept)
    }

    /// Operator action: make `FAILED_*` patterns eligible again.
    pub async fn reset_failed(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE lineascope.sql_patterns
            SET llm_status = 'PENDING', llm_error_message = NULL, updated_at = now()
            WHERE llm_status IN ('FAILED_PARSE', 'FAILED_LLM')
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn fetch(&self, sql_hash: &str) -> Result<Option<SqlPatternRow>, StoreError> {
        let row = sqlx::query_as(&format!(
            "SELECT {PATTERN_COLUMNS} FROM lineascope.sql_patterns WHERE sql_hash = $1"
        ))
        .bind(sql_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}

/// A locked batch of patterns being loaded into the graph.
///
/// Row locks are held until [`ClaimedPatterns::commit`]; other workers skip
/// past them. Per-pattern outcomes are written through the same transaction
/// so a crash releases the locks with the flags untouched and the batch is
/// simply re-claimed later.
pub struct ClaimedPatterns {
    tx: Transaction<'static, Postgres>,
    pub rows: Vec<SqlPatternRow>,
}

impl ClaimedPatterns {
    /// `loaded_to_graph = true`; legal only from `COMPLETED_SUCCESS`.
    pub async fn mark_loaded(&mut self, sql_hash: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE lineascope.sql_patterns
            SET loaded_to_graph = TRUE, graph_load_error = NULL, updated_at = now()
            WHERE sql_hash = $1 AND llm_status = 'COMPLETED_SUCCESS'
            "#,
        )
        .bind(sql_hash)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    pub async fn mark_load_failed(
        &mut self,
        sql_hash: &str,
        error_message: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE lineascope.sql_patterns
            SET loaded_to_graph = FALSE, graph_load_error = $2, updated_at = now()
            WHERE sql_hash = $1
            "#,
        )
        .bind(sql_hash)
        .bind(error_message)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    pub async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }
}
