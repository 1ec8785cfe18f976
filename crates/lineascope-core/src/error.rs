//! Error types for fingerprinting and document validation.
//!
//! A [`RejectedStatement`] is not a failure of the pipeline: it records that
//! a statement carries no column-level data flow (session settings,
//! transaction control, bare DDL, ...) or could not be parsed, and therefore
//! never becomes a pattern. Callers persist the rejection for review and move
//! on. [`DocumentError`] covers the stricter world of LLM output validation,
//! where a violation sends the extractor into a re-prompt.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a statement was refused a fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectReason {
    /// Input was empty or whitespace/comments only.
    Empty,
    /// `SET` / `RESET` session configuration.
    SessionSetting,
    /// `BEGIN` / `COMMIT` / `ROLLBACK` / savepoints.
    TransactionControl,
    /// `VACUUM` / `ANALYZE` / `TRUNCATE` and friends.
    Maintenance,
    /// `GRANT` / `REVOKE`.
    Permission,
    /// `SHOW` / `EXPLAIN` and other read-only diagnostics.
    Diagnostic,
    /// DDL with no query source (plain `CREATE TABLE`, indexes, drops, ...).
    DdlOnly,
    /// More than one statement in a single log entry.
    MultipleStatements,
    /// The PostgreSQL parser could not produce an AST.
    ParseFailed,
    /// Parsed fine but is not a statement kind we extract lineage from.
    NotDataFlow,
}

impl RejectReason {
    /// Short machine-readable code stored in the error table.
    pub fn code(self) -> &'static str {
        match self {
            RejectReason::Empty => "EMPTY",
            RejectReason::SessionSetting => "SESSION_SETTING",
            RejectReason::TransactionControl => "TRANSACTION_CONTROL",
            RejectReason::Maintenance => "MAINTENANCE",
            RejectReason::Permission => "PERMISSION",
            RejectReason::Diagnostic => "DIAGNOSTIC",
            RejectReason::DdlOnly => "DDL_ONLY",
            RejectReason::MultipleStatements => "MULTIPLE_STATEMENTS",
            RejectReason::ParseFailed => "PARSE_FAILED",
            RejectReason::NotDataFlow => "NOT_DATA_FLOW",
        }
    }
}

/// A statement that will never receive a pattern row.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("statement rejected ({}): {detail}", reason.code())]
pub struct RejectedStatement {
    pub reason: RejectReason,
    /// Human-readable detail, e.g. the parser error message.
    pub detail: String,
}

impl RejectedStatement {
    pub fn new(reason: RejectReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }
}

/// A violation of the lineage document schema or its invariants.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DocumentError {
    #[error("sql_pattern_hash mismatch: expected {expected}, document carries {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("parsing_confidence {0} outside [0, 1]")]
    ConfidenceOutOfRange(f64),

    #[error("lineage entry {index} has an empty target_column")]
    EmptyTargetColumn { index: usize },

    #[error("lineage entry {index} names no target object and the document has none")]
    MissingTargetObject { index: usize },

    #[error("lineage entry {index}, source {source_index}: source object has no name")]
    EmptySourceObject { index: usize, source_index: usize },

    #[error("referenced object {index} has no name")]
    EmptyReferencedObject { index: usize },
}
