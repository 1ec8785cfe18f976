//! The extraction loop: call the model, strip fences, validate, re-prompt.

use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use lineascope_core::{LineageDocument, StatementKind};
use lineascope_store::RetryPolicy;
use regex::Regex;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::client::{ChatClient, ChatCompletion, ChatMessage, LlmError};
use crate::context::PromptContext;
use crate::limiter::{estimate_tokens, RateLimiter};
use crate::prompt::{build_messages, repair_message};

/// Terminal result of one extraction attempt chain.
#[derive(Debug)]
pub enum ExtractionOutcome {
    /// Valid document worth loading into the graph.
    Success(LineageDocument),
    /// Valid document with nothing to load (low confidence, or a write with
    /// no column lineage). Persisted for audit only.
    NoLineage(LineageDocument),
    /// The model never produced a schema-valid document.
    FailedParse {
        error: String,
        raw_response: Option<String>,
    },
    /// Transport/auth/quota trouble outlasted the retry budget.
    FailedLlm { error: String },
}

#[derive(Debug, Clone)]
pub struct ExtractorSettings {
    /// Total schema-validation attempts (initial call plus re-prompts).
    pub max_validation_attempts: u32,
    /// Hard wall-clock limit per LLM call.
    pub call_timeout: Duration,
    pub transport_retry: RetryPolicy,
}

impl Default for ExtractorSettings {
    fn default() -> Self {
        Self {
            max_validation_attempts: 3,
            call_timeout: Duration::from_secs(120),
            transport_retry: RetryPolicy::exponential(3),
        }
    }
}

pub struct LineageExtractor {
    client: Arc<dyn ChatClient>,
    limiter: Arc<RateLimiter>,
    settings: ExtractorSettings,
}

impl LineageExtractor {
    pub fn new(
        client: Arc<dyn ChatClient>,
        limiter: Arc<RateLimiter>,
        settings: ExtractorSettings,
    ) -> Self {
        Self {
            client,
            limiter,
            settings,
        }
    }

    /// Drive one pattern through prompt → completion → validation.
    pub async fn extract(
        &self,
        sql_hash: &str,
        kind: StatementKind,
        sample_sql: &str,
        context: &PromptContext,
    ) -> ExtractionOutcome {
        let mut messages = build_messages(sql_hash, kind, sample_sql, context);
        let mut last_error = String::new();
        let mut last_raw = None;

        for attempt in 0..self.settings.max_validation_attempts {
            let completion = match self.call_with_transport_retries(&messages).await {
                Ok(completion) => completion,
                Err(error) => {
                    return ExtractionOutcome::FailedLlm {
                        error: error.to_string(),
                    }
                }
            };

            let json_text = extract_json(&completion.content);
            let parsed: Result<LineageDocument, _> = serde_json::from_str(json_text);
            let violation = match parsed {
                Ok(document) => match document.validate(sql_hash) {
                    Ok(()) => {
                        return if document.is_no_lineage(kind.is_write()) {
                            ExtractionOutcome::NoLineage(document)
                        } else {
                            ExtractionOutcome::Success(document)
                        };
                    }
                    Err(error) => error.to_string(),
                },
                Err(error) => error.to_string(),
            };

            warn!(
                sql_hash,
                attempt,
                %violation,
                "llm response failed validation"
            );
            last_error = violation.clone();
            last_raw = Some(completion.content.clone());

            // Show the model its own output and the validator's complaint.
            messages.push(ChatMessage::assistant(completion.content));
            messages.push(repair_message(&violation));
        }

        ExtractionOutcome::FailedParse {
            error: last_error,
            raw_response: last_raw,
        }
    }

    async fn call_with_transport_retries(
        &self,
        messages: &[ChatMessage],
    ) -> Result<ChatCompletion, LlmError> {
        let estimated: usize = messages.iter().map(|m| m.content.len()).sum();
        let policy = &self.settings.transport_retry;

        let mut attempt = 0;
        loop {
            self.limiter.acquire(estimate_tokens(estimated)).await;

            let result = match timeout(self.settings.call_timeout, self.client.chat(messages)).await
            {
                Ok(result) => result,
                Err(_) => Err(LlmError::Timeout(self.settings.call_timeout)),
            };

            match result {
                Ok(completion) => return Ok(completion),
                Err(error) if error.is_retriable() && attempt + 1 < policy.max_attempts => {
                    let delay = policy.delay_for_attempt(attempt);
                    debug!(attempt, ?delay, %error, "retrying llm call");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

/// Pull the JSON object out of a possibly fenced, possibly chatty response.
fn extract_json(response: &str) -> &str {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    let fence = FENCE.get_or_init(|| {
        Regex::new(r"```(?:json)?\s*([\s\S]*?)\s*```").expect("fence regex")
    });

    if let Some(captures) = fence.captures(response) {
        if let Some(inner) = captures.get(1) {
            return inner.as_str();
        }
    }

    // No fence: trim any prose around the outermost object.
    let trimmed = response.trim();
    match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => &trimmed[start..=end],
        _ => trimmed,
    }
}
