//! Stage: claimed patterns → LLM extraction → recorded outcomes.

use std::sync::Arc;

use anyhow::Result;
use lineascope_core::{fingerprint, StatementKind};
use lineascope_llm::{ContextAssembler, ContextError, ExtractionOutcome, LineageExtractor};
use lineascope_store::{LlmStatus, PatternStore, SqlPatternRow};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

#[derive(Debug, Default)]
pub struct AnalyzeOutcome {
    pub claimed: usize,
    pub succeeded: usize,
    pub no_lineage: usize,
    pub failed_parse: usize,
    pub failed_llm: usize,
}

pub struct AnalyzeStage {
    pub patterns: PatternStore,
    pub assembler: Arc<ContextAssembler>,
    pub extractor: Arc<LineageExtractor>,
    pub batch_size: i64,
    pub concurrency: usize,
}

impl AnalyzeStage {
    pub async fn run(&self) -> Result<AnalyzeOutcome> {
        let claimed = self.patterns.claim_for_analysis(self.batch_size).await?;
        let mut outcome = AnalyzeOutcome {
            claimed: claimed.len(),
            ..AnalyzeOutcome::default()
        };
        if claimed.is_empty() {
            return Ok(outcome);
        }

        let semaphore = Arc::new(Semaphore::new(self.concurrency.max(1)));
        let mut tasks: JoinSet<Option<LlmStatus>> = JoinSet::new();

        for pattern in claimed {
            let permit = semaphore.clone().acquire_owned().await?;
            let patterns = self.patterns.clone();
            let assembler = self.assembler.clone();
            let extractor = self.extractor.clone();

            tasks.spawn(async move {
                let _permit = permit;
                analyze_one(&patterns, &assembler, &extractor, &pattern).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(LlmStatus::CompletedSuccess)) => outcome.succeeded += 1,
                Ok(Some(LlmStatus::CompletedNoLineage)) => outcome.no_lineage += 1,
                Ok(Some(LlmStatus::FailedParse)) => outcome.failed_parse += 1,
                Ok(Some(LlmStatus::FailedLlm)) => outcome.failed_llm += 1,
                Ok(_) => {}
                Err(join_error) => error!(error = %join_error, "analysis worker panicked"),
            }
        }

        info!(
            claimed = outcome.claimed,
            succeeded = outcome.succeeded,
            no_lineage = outcome.no_lineage,
            failed_parse = outcome.failed_parse,
            failed_llm = outcome.failed_llm,
            "analyze stage finished"
        );
        Ok(outcome)
    }
}

/// Analyse one claimed pattern and persist the result. Returns the recorded
/// status, or `None` when the pattern was intentionally left `IN_PROGRESS`
/// for the sweep to reclaim (transient store trouble).
async fn analyze_one(
    patterns: &PatternStore,
    assembler: &ContextAssembler,
    extractor: &LineageExtractor,
    pattern: &SqlPatternRow,
) -> Option<LlmStatus> {
    let context = match assembler.assemble(pattern).await {
        Ok(context) => context,
        Err(ContextError::TooLarge { budget, required }) => {
            let message =
                format!("prompt context exceeds budget: {required} chars > {budget} chars");
            let status = LlmStatus::FailedParse;
            record(patterns, &pattern.sql_hash, status, None, Some(&message)).await?;
            return Some(status);
        }
        Err(ContextError::Store(store_error)) => {
            // Leave IN_PROGRESS; the startup sweep returns it to PENDING.
            warn!(
                sql_hash = %pattern.sql_hash,
                error = %store_error,
                "context assembly hit the store; leaving claim for the sweep"
            );
            return None;
        }
    };

    // The statement kind feeds the no-lineage classification; the sample
    // already survived fingerprinting once, so a re-parse failure here is
    // harmless and defaults to read-only.
    let kind = fingerprint(&pattern.sample_raw_sql_text)
        .map(|fp| fp.kind)
        .unwrap_or(StatementKind::Select);

    let extraction = extractor
        .extract(
            &pattern.sql_hash,
            kind,
            &pattern.sample_raw_sql_text,
            &context,
        )
        .await;

    let (status, document_json, message) = match extraction {
        ExtractionOutcome::Success(document) => (
            LlmStatus::CompletedSuccess,
            serde_json::to_value(&document).ok(),
            None,
        ),
        ExtractionOutcome::NoLineage(document) => (
            LlmStatus::CompletedNoLineage,
            serde_json::to_value(&document).ok(),
            Some("document valid but carries no loadable lineage".to_string()),
        ),
        ExtractionOutcome::FailedParse {
            error,
            raw_response,
        } => {
            let mut message = error;
            if let Some(raw) = raw_response {
                let snippet: String = raw.chars().take(2000).collect();
                message = format!("{message}; last response: {snippet}");
            }
            (LlmStatus::FailedParse, None, Some(message))
        }
        ExtractionOutcome::FailedLlm { error } => (LlmStatus::FailedLlm, None, Some(error)),
    };

    record(
        patterns,
        &pattern.sql_hash,
        status,
        document_json,
        message.as_deref(),
    )
    .await?;
    Some(status)
}

async fn record(
    patterns: &PatternStore,
    sql_hash: &str,
    status: LlmStatus,
    document_json: Option<serde_json::Value>,
    message: Option<&str>,
) -> Option<()> {
    if let Err(store_error) = patterns
        .record_analysis_outcome(sql_hash, status, document_json, message)
        .await
    {
        error!(sql_hash, error = %store_error, "failed to record analysis outcome");
        return None;
    }
    Some(())
}
