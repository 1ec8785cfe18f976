//! Configuration loaded from a TOML file.
//!
//! One explicit object handed to each stage driver — no process-wide
//! singleton. The LLM API key can be kept out of the file and supplied via
//! `LINEASCOPE_LLM_API_KEY`.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub control_plane: ControlPlaneConfig,
    pub graph: GraphConfig,
    pub llm: LlmConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlPlaneConfig {
    pub database_url: String,
    #[serde(default = "default_pool_size")]
    pub max_connections: u32,
    #[serde(default = "default_statement_timeout_secs")]
    pub statement_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GraphConfig {
    pub database_url: String,
    #[serde(default = "default_graph_name")]
    pub graph_name: String,
    #[serde(default = "default_graph_pool_size")]
    pub max_connections: u32,
    #[serde(default = "default_graph_statement_timeout_secs")]
    pub statement_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_llm_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    #[serde(default = "default_tokens_per_minute")]
    pub tokens_per_minute: u32,
    #[serde(default = "default_llm_concurrency")]
    pub max_concurrency: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub log_batch_size: i64,
    pub analyze_batch_size: i64,
    pub graph_batch_size: i64,
    pub aggregate_concurrency: usize,
    pub context_budget_chars: usize,
    /// Re-prime `FAILED_*` patterns to `PENDING` when they are observed
    /// again in the log.
    pub reanalyze_failed: bool,
    /// `IN_PROGRESS` claims older than this are considered abandoned.
    pub claim_grace_secs: u64,
    pub graph_conflict_retries: u32,
    pub db_retry_attempts: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            log_batch_size: 200,
            analyze_batch_size: 10,
            graph_batch_size: 25,
            aggregate_concurrency: 8,
            context_budget_chars: 24_000,
            reanalyze_failed: false,
            claim_grace_secs: 900,
            graph_conflict_retries: 3,
            db_retry_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

fn default_pool_size() -> u32 {
    8
}
fn default_statement_timeout_secs() -> u64 {
    60
}
fn default_graph_name() -> String {
    "lineascope".to_string()
}
fn default_graph_pool_size() -> u32 {
    4
}
fn default_graph_statement_timeout_secs() -> u64 {
    120
}
fn default_temperature() -> f32 {
    0.2
}
fn default_max_tokens() -> u32 {
    4000
}
fn default_llm_timeout_secs() -> u64 {
    120
}
fn default_requests_per_minute() -> u32 {
    60
}
fn default_tokens_per_minute() -> u32 {
    200_000
}
fn default_llm_concurrency() -> usize {
    4
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read config file {:?}", path.as_ref()))?;
        let mut config: Config = toml::from_str(&text).context("failed to parse config file")?;

        if let Ok(key) = std::env::var("LINEASCOPE_LLM_API_KEY") {
            if !key.is_empty() {
                config.llm.api_key = key;
            }
        }
        Ok(config)
    }

    pub fn statement_timeout(&self) -> Duration {
        Duration::from_secs(self.control_plane.statement_timeout_secs)
    }

    pub fn graph_statement_timeout(&self) -> Duration {
        Duration::from_secs(self.graph.statement_timeout_secs)
    }

    pub fn llm_request_timeout(&self) -> Duration {
        Duration::from_secs(self.llm.request_timeout_secs)
    }

    pub fn claim_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.pipeline.claim_grace_secs as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
        [control_plane]
        database_url = "postgres://lineascope@localhost/lineascope"

        [graph]
        database_url = "postgres://lineascope@localhost/lineascope"

        [llm]
        base_url = "https://llm.example.com/v1"
        api_key = "sk-test"
        model = "qwen-plus-latest"
    "#;

    #[test]
    fn minimal_config_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.graph.graph_name, "lineascope");
        assert_eq!(config.llm.temperature, 0.2);
        assert_eq!(config.pipeline.analyze_batch_size, 10);
        assert!(!config.pipeline.reanalyze_failed);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn missing_section_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"[control_plane]\ndatabase_url = \"x\"\n").unwrap();
        assert!(Config::from_file(file.path()).is_err());
    }
}
