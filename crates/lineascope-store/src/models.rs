//! Row types and the pattern state machine.

use chrono::{DateTime, Utc};
use lineascope_core::LineageDocument;
use sqlx::FromRow;

use crate::error::StoreError;

/// Lifecycle of a pattern through the LLM pipeline.
///
/// ```text
/// PENDING ─▶ IN_PROGRESS ─▶ COMPLETED_SUCCESS ─(graph load)─▶ loaded_to_graph
///                        ├▶ COMPLETED_NO_LINEAGE
///                        ├▶ FAILED_PARSE ─(operator reset)─▶ PENDING
///                        └▶ FAILED_LLM   ─(operator reset)─▶ PENDING
/// ```
///
/// The startup sweep additionally returns stale `IN_PROGRESS` rows to
/// `PENDING`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmStatus {
    Pending,
    InProgress,
    CompletedSuccess,
    CompletedNoLineage,
    FailedParse,
    FailedLlm,
}

impl LlmStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LlmStatus::Pending => "PENDING",
            LlmStatus::InProgress => "IN_PROGRESS",
            LlmStatus::CompletedSuccess => "COMPLETED_SUCCESS",
            LlmStatus::CompletedNoLineage => "COMPLETED_NO_LINEAGE",
            LlmStatus::FailedParse => "FAILED_PARSE",
            LlmStatus::FailedLlm => "FAILED_LLM",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "PENDING" => LlmStatus::Pending,
            "IN_PROGRESS" => LlmStatus::InProgress,
            "COMPLETED_SUCCESS" => LlmStatus::CompletedSuccess,
            "COMPLETED_NO_LINEAGE" => LlmStatus::CompletedNoLineage,
            "FAILED_PARSE" => LlmStatus::FailedParse,
            "FAILED_LLM" => LlmStatus::FailedLlm,
            _ => return None,
        })
    }

    pub fn is_terminal_failure(self) -> bool {
        matches!(self, LlmStatus::FailedParse | LlmStatus::FailedLlm)
    }

    /// Whether `from -> to` is a legal edge in the status graph.
    pub fn can_transition(from: LlmStatus, to: LlmStatus) -> bool {
        use LlmStatus::*;
        matches!(
            (from, to),
            (Pending, InProgress)
                | (InProgress, CompletedSuccess)
                | (InProgress, CompletedNoLineage)
                | (InProgress, FailedParse)
                | (InProgress, FailedLlm)
                // stale-claim sweep
                | (InProgress, Pending)
                // operator reset
                | (FailedParse, Pending)
                | (FailedLlm, Pending)
        )
    }
}

/// One row of `lineascope.sql_patterns`.
#[derive(Debug, Clone, FromRow)]
pub struct SqlPatternRow {
    pub sql_hash: String,
    pub normalized_sql_text: String,
    pub sample_raw_sql_text: String,
    pub source_database_name: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub execution_count: i64,
    pub total_duration_ms: i64,
    pub avg_duration_ms: f64,
    pub max_duration_ms: i64,
    pub min_duration_ms: i64,
    pub llm_status: String,
    pub llm_extracted_json: Option<serde_json::Value>,
    pub llm_error_message: Option<String>,
    pub last_llm_analysis_at: Option<DateTime<Utc>>,
    pub loaded_to_graph: bool,
    pub graph_load_error: Option<String>,
}

impl SqlPatternRow {
    pub fn status(&self) -> Option<LlmStatus> {
        LlmStatus::parse(&self.llm_status)
    }

    /// Definition-sourced patterns carry `execution_count = 0`.
    pub fn is_definition_sourced(&self) -> bool {
        self.execution_count == 0
    }

    /// Deserialize the stored lineage document, if any.
    pub fn document(&self) -> Result<Option<LineageDocument>, StoreError> {
        match &self.llm_extracted_json {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone()).map(Some).map_err(|e| {
                StoreError::CorruptDocument {
                    sql_hash: self.sql_hash.clone(),
                    source: e,
                }
            }),
        }
    }
}

/// One row of `lineascope.captured_logs`.
#[derive(Debug, Clone, FromRow)]
pub struct CapturedLog {
    pub log_id: i64,
    pub log_time: DateTime<Utc>,
    pub source_database_name: String,
    pub raw_sql_text: String,
    pub duration_ms: i64,
}

/// A monitored PostgreSQL instance.
#[derive(Debug, Clone, FromRow)]
pub struct DataSource {
    pub source_id: i64,
    pub source_name: String,
    pub database_name: String,
    pub search_path: Vec<String>,
    pub is_active: bool,
}

#[derive(Debug, Clone, FromRow)]
pub struct ObjectMetadataRow {
    pub object_id: i64,
    pub source_id: i64,
    pub database_name: String,
    pub schema_name: String,
    pub object_name: String,
    pub object_type: String,
    pub owner: Option<String>,
    pub description: Option<String>,
    pub definition: Option<String>,
    pub row_count: Option<i64>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct ColumnMetadataRow {
    pub object_id: i64,
    pub column_name: String,
    pub ordinal_position: i32,
    pub data_type: String,
    pub is_nullable: bool,
    pub default_value: Option<String>,
    pub is_primary_key: bool,
    pub is_unique: bool,
    pub fk_target_schema: Option<String>,
    pub fk_target_table: Option<String>,
    pub fk_target_column: Option<String>,
    pub fk_constraint_name: Option<String>,
    pub description: Option<String>,
}

impl ColumnMetadataRow {
    /// FK target as a (schema, table, column) triple when fully specified.
    pub fn fk_target(&self) -> Option<(&str, &str, &str)> {
        match (
            self.fk_target_schema.as_deref(),
            self.fk_target_table.as_deref(),
            self.fk_target_column.as_deref(),
        ) {
            (Some(schema), Some(table), Some(column)) => Some((schema, table, column)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct FunctionMetadataRow {
    pub function_id: i64,
    pub source_id: i64,
    pub database_name: String,
    pub schema_name: String,
    pub function_name: String,
    pub function_type: String,
    pub return_type: Option<String>,
    pub parameter_types: Vec<String>,
    pub definition: Option<String>,
    pub language: Option<String>,
    pub owner: Option<String>,
    pub description: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips() {
        for status in [
            LlmStatus::Pending,
            LlmStatus::InProgress,
            LlmStatus::CompletedSuccess,
            LlmStatus::CompletedNoLineage,
            LlmStatus::FailedParse,
            LlmStatus::FailedLlm,
        ] {
            assert_eq!(LlmStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(LlmStatus::parse("NOPE"), None);
    }

    #[test]
    fn legal_transitions_form_the_expected_graph() {
        use LlmStatus::*;
        assert!(LlmStatus::can_transition(Pending, InProgress));
        assert!(LlmStatus::can_transition(InProgress, CompletedSuccess));
        assert!(LlmStatus::can_transition(InProgress, CompletedNoLineage));
        assert!(LlmStatus::can_transition(InProgress, FailedParse));
        assert!(LlmStatus::can_transition(InProgress, FailedLlm));
        assert!(LlmStatus::can_transition(FailedParse, Pending));
        assert!(LlmStatus::can_transition(FailedLlm, Pending));
        assert!(LlmStatus::can_transition(InProgress, Pending));

        // No shortcuts.
        assert!(!LlmStatus::can_transition(Pending, CompletedSuccess));
        assert!(!LlmStatus::can_transition(Pending, FailedLlm));
        assert!(!LlmStatus::can_transition(CompletedSuccess, Pending));
        assert!(!LlmStatus::can_transition(CompletedSuccess, InProgress));
        assert!(!LlmStatus::can_transition(CompletedNoLineage, Pending));
    }
}
