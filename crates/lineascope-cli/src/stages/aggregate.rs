//! Stage: captured logs (and metadata definitions) → sql patterns.
//!
//! Each log row is fingerprinted and either upserted as a pattern
//! observation or recorded as a normalization error; both paths mark the row
//! consumed, so a redelivered batch is a no-op. Transient database errors
//! are retried with backoff; a row whose upsert still fails is left
//! unconsumed for the next run.

use std::sync::Arc;

use anyhow::Result;
use lineascope_core::fingerprint;
use lineascope_store::logs::ErrorSource;
use lineascope_store::{LogStore, MetadataStore, PatternStore, RetryPolicy, StoreError};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

#[derive(Debug, Default)]
pub struct AggregateOutcome {
    pub logs_fetched: usize,
    pub patterns_upserted: usize,
    pub rejected: usize,
    pub logs_marked: u64,
    pub view_definitions: usize,
    pub function_definitions: usize,
}

pub struct AggregateStage {
    pub patterns: PatternStore,
    pub logs: LogStore,
    pub metadata: MetadataStore,
    pub batch_size: i64,
    pub concurrency: usize,
    pub retry: RetryPolicy,
}

impl AggregateStage {
    pub async fn run(&self) -> Result<AggregateOutcome> {
        let mut outcome = self.process_logs().await?;
        self.process_definitions(&mut outcome).await?;
        info!(
            fetched = outcome.logs_fetched,
            upserted = outcome.patterns_upserted,
            rejected = outcome.rejected,
            views = outcome.view_definitions,
            functions = outcome.function_definitions,
            "aggregate stage finished"
        );
        Ok(outcome)
    }

    async fn process_logs(&self) -> Result<AggregateOutcome> {
        let mut outcome = AggregateOutcome::default();
        let batch = self.logs.fetch_unprocessed(self.batch_size).await?;
        outcome.logs_fetched = batch.len();
        if batch.is_empty() {
            return Ok(outcome);
        }

        let semaphore = Arc::new(Semaphore::new(self.concurrency.max(1)));
        let mut tasks: JoinSet<Option<(i64, Option<String>)>> = JoinSet::new();

        for log in batch {
            let permit = semaphore.clone().acquire_owned().await?;
            let patterns = self.patterns.clone();
            let logs = self.logs.clone();
            let retry = self.retry.clone();

            tasks.spawn(async move {
                let _permit = permit;
                match fingerprint(&log.raw_sql_text) {
                    Ok(fp) => {
                        let upserted = with_retries(&retry, || {
                            patterns.upsert_from_log(
                                &fp,
                                &log.raw_sql_text,
                                &log.source_database_name,
                                log.log_time,
                                log.duration_ms,
                            )
                        })
                        .await;
                        match upserted {
                            Ok(()) => Some((log.log_id, Some(fp.sql_hash))),
                            Err(store_error) => {
                                // Leave the row unconsumed; next run retries.
                                error!(
                                    log_id = log.log_id,
                                    error = %store_error,
                                    "pattern upsert failed"
                                );
                                None
                            }
                        }
                    }
                    Err(rejected) => {
                        if let Err(store_error) = logs
                            .record_normalization_error(
                                ErrorSource::Log,
                                log.log_id,
                                &log.raw_sql_text,
                                rejected.reason.code(),
                                Some(&rejected.detail),
                                Some(&log.source_database_name),
                            )
                            .await
                        {
                            warn!(
                                log_id = log.log_id,
                                error = %store_error,
                                "failed to record normalization error"
                            );
                        }
                        Some((log.log_id, None))
                    }
                }
            });
        }

        let mut processed: Vec<(i64, Option<String>)> = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(entry)) => {
                    if entry.1.is_some() {
                        outcome.patterns_upserted += 1;
                    } else {
                        outcome.rejected += 1;
                    }
                    processed.push(entry);
                }
                Ok(None) => {}
                Err(join_error) => error!(error = %join_error, "aggregate worker panicked"),
            }
        }

        outcome.logs_marked = self.logs.mark_processed(&processed).await?;
        Ok(outcome)
    }

    /// Views, materialised views and functions also carry SQL worth a
    /// pattern; they enter with zero execution statistics.
    async fn process_definitions(&self, outcome: &mut AggregateOutcome) -> Result<()> {
        for view in self.metadata.unprocessed_view_definitions().await? {
            let Some(definition) = view.definition.as_deref() else {
                continue;
            };
            match fingerprint(definition) {
                Ok(fp) => {
                    self.patterns
                        .upsert_from_definition(&fp, definition, &view.database_name, view.updated_at)
                        .await?;
                    self.metadata
                        .mark_object_definition_processed(view.object_id, &fp.sql_hash)
                        .await?;
                    outcome.view_definitions += 1;
                }
                Err(rejected) => {
                    self.logs
                        .record_normalization_error(
                            ErrorSource::View,
                            view.object_id,
                            definition,
                            rejected.reason.code(),
                            Some(&rejected.detail),
                            Some(&view.database_name),
                        )
                        .await?;
                    // Stamp a non-empty marker so the rejection is not
                    // re-fetched on every run.
                    self.metadata
                        .mark_object_definition_processed(
                            view.object_id,
                            &format!("rejected:{}", rejected.reason.code()),
                        )
                        .await?;
                    outcome.rejected += 1;
                }
            }
        }

        for function in self.metadata.unprocessed_function_definitions().await? {
            let Some(definition) = function.definition.as_deref() else {
                continue;
            };
            match fingerprint(definition) {
                Ok(fp) => {
                    self.patterns
                        .upsert_from_definition(
                            &fp,
                            definition,
                            &function.database_name,
                            function.updated_at,
                        )
                        .await?;
                    self.metadata
                        .mark_function_definition_processed(function.function_id, &fp.sql_hash)
                        .await?;
                    outcome.function_definitions += 1;
                }
                Err(rejected) => {
                    self.logs
                        .record_normalization_error(
                            ErrorSource::Function,
                            function.function_id,
                            definition,
                            rejected.reason.code(),
                            Some(&rejected.detail),
                            Some(&function.database_name),
                        )
                        .await?;
                    self.metadata
                        .mark_function_definition_processed(
                            function.function_id,
                            &format!("rejected:{}", rejected.reason.code()),
                        )
                        .await?;
                    outcome.rejected += 1;
                }
            }
        }
        Ok(())
    }
}

/// Retry a store operation while its failure is transient.
async fn with_retries<F, Fut>(policy: &RetryPolicy, mut operation: F) -> Result<(), StoreError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<(), StoreError>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(()) => return Ok(()),
            Err(store_error)
                if store_error.is_transient() && attempt + 1 < policy.max_attempts =>
            {
                tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
                attempt += 1;
            }
            Err(store_error) => return Err(store_error),
        }
    }
}
