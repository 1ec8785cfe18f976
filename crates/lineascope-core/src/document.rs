//! The lineage document — the validated JSON contract with the LLM.
//!
//! The model is asked for exactly this shape and nothing else. Enumerated
//! fields are real Rust enums so an out-of-enum value fails deserialization
//! instead of leaking into the graph; unknown keys are ignored (the model is
//! a best-effort oracle and occasionally invents fields).

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::DocumentError;

/// Below this confidence an extraction is kept for audit but never loaded
/// into the graph.
pub const MIN_LOADABLE_CONFIDENCE: f64 = 0.2;

/// Column-level lineage extracted from one SQL pattern.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LineageDocument {
    /// Must echo the hash of the pattern the prompt was built for.
    pub sql_pattern_hash: String,

    pub source_database_name: String,

    /// The object the statement writes into; absent for pure SELECTs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_object: Option<ObjectRefDoc>,

    #[serde(default)]
    pub column_level_lineage: Vec<ColumnLineage>,

    /// Every object the statement reads or writes.
    #[serde(default)]
    pub referenced_objects: Vec<ReferencedObject>,

    /// Model's own confidence in [0, 1]. Advisory: persisted, and used only
    /// for the no-lineage classification, never to gate loading directly.
    #[serde(default = "default_confidence")]
    pub parsing_confidence: f64,
}

fn default_confidence() -> f64 {
    1.0
}

/// A table/view reference inside the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ObjectRefDoc {
    pub schema: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ObjectKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObjectKind {
    Table,
    View,
    #[serde(alias = "MATERIALIZED VIEW")]
    MaterializedView,
    TempTable,
}

/// How one target column is derived.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ColumnLineage {
    pub target_column: String,

    /// Object the column belongs to; falls back to the document-level
    /// target object when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_object_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_object_schema: Option<String>,

    #[serde(default)]
    pub sources: Vec<LineageSource>,

    pub derivation_type: DerivationType,
}

/// One contribution to a target column.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LineageSource {
    pub source_object: ObjectRefDoc,

    /// `None` for literals and source-less expressions; the flow edge then
    /// starts at the object node instead of a column node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_column: Option<String>,

    /// Expression or short description of the transformation,
    /// e.g. `TO_CHAR(d.d_date, 'YYYY-MM')` or `direct_copy`.
    #[serde(default)]
    pub transformation_logic: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DerivationType {
    DirectMapping,
    FunctionCall,
    Aggregation,
    UnionMerge,
    ConditionalLogic,
    LiteralAssignment,
    Expression,
}

impl DerivationType {
    pub fn as_str(self) -> &'static str {
        match self {
            DerivationType::DirectMapping => "DIRECT_MAPPING",
            DerivationType::FunctionCall => "FUNCTION_CALL",
            DerivationType::Aggregation => "AGGREGATION",
            DerivationType::UnionMerge => "UNION_MERGE",
            DerivationType::ConditionalLogic => "CONDITIONAL_LOGIC",
            DerivationType::LiteralAssignment => "LITERAL_ASSIGNMENT",
            DerivationType::Expression => "EXPRESSION",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ReferencedObject {
    pub schema: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ObjectKind,
    pub access_mode: AccessMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessMode {
    Read,
    Write,
    /// The original prompt contract allowed combined access; expanded into
    /// both edge kinds when building the graph.
    ReadWrite,
}

impl AccessMode {
    pub fn reads(self) -> bool {
        matches!(self, AccessMode::Read | AccessMode::ReadWrite)
    }

    pub fn writes(self) -> bool {
        matches!(self, AccessMode::Write | AccessMode::ReadWrite)
    }
}

impl LineageDocument {
    /// Check the document against its invariants.
    ///
    /// Serde already enforces the enumerations; this covers everything a
    /// type cannot: the hash echo, confidence bounds, and non-empty names
    /// on every endpoint the graph builder would have to materialise.
    pub fn validate(&self, expected_hash: &str) -> Result<(), DocumentError> {
        if self.sql_pattern_hash != expected_hash {
            return Err(DocumentError::HashMismatch {
                expected: expected_hash.to_string(),
                actual: self.sql_pattern_hash.clone(),
            });
        }
        if !(0.0..=1.0).contains(&self.parsing_confidence) {
            return Err(DocumentError::ConfidenceOutOfRange(self.parsing_confidence));
        }
        for (index, entry) in self.column_level_lineage.iter().enumerate() {
            if entry.target_column.trim().is_empty() {
                return Err(DocumentError::EmptyTargetColumn { index });
            }
            if entry.resolved_target(self).is_none() {
                return Err(DocumentError::MissingTargetObject { index });
            }
            for (source_index, source) in entry.sources.iter().enumerate() {
                if source.source_object.name.trim().is_empty() {
                    return Err(DocumentError::EmptySourceObject {
                        index,
                        source_index,
                    });
                }
            }
        }
        for (index, reference) in self.referenced_objects.iter().enumerate() {
            if reference.name.trim().is_empty() {
                return Err(DocumentError::EmptyReferencedObject { index });
            }
        }
        Ok(())
    }

    /// Whether the extraction is a valid document that nevertheless carries
    /// nothing worth loading: low confidence, or a write statement with no
    /// column lineage at all.
    pub fn is_no_lineage(&self, is_write_statement: bool) -> bool {
        self.parsing_confidence < MIN_LOADABLE_CONFIDENCE
            || (is_write_statement && self.column_level_lineage.is_empty())
    }
}

impl ColumnLineage {
    /// Target object for this entry: entry-level override first, then the
    /// document-level target.
    pub fn resolved_target<'a>(&'a self, doc: &'a LineageDocument) -> Option<(&'a str, &'a str)> {
        if let Some(name) = self.target_object_name.as_deref() {
            let schema = self
                .target_object_schema
                .as_deref()
                .or_else(|| doc.target_object.as_ref().map(|t| t.schema.as_str()))
                .unwrap_or("public");
            return Some((schema, name));
        }
        doc.target_object
            .as_ref()
            .map(|t| (t.schema.as_str(), t.name.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json(hash: &str) -> String {
        format!(
            r#"{{
                "sql_pattern_hash": "{hash}",
                "source_database_name": "tpcds",
                "target_object": {{"schema": "public", "name": "monthly_report", "type": "TABLE"}},
                "column_level_lineage": [
                    {{
                        "target_column": "ym",
                        "sources": [
                            {{
                                "source_object": {{"schema": "public", "name": "date_dim", "type": "TABLE"}},
                                "source_column": "d_date",
                                "transformation_logic": "TO_CHAR(d.d_date, 'YYYY-MM')"
                            }}
                        ],
                        "derivation_type": "FUNCTION_CALL"
                    }}
                ],
                "referenced_objects": [
                    {{"schema": "public", "name": "date_dim", "type": "TABLE", "access_mode": "READ"}},
                    {{"schema": "public", "name": "monthly_report", "type": "TABLE", "access_mode": "WRITE"}}
                ],
                "parsing_confidence": 0.95
            }}"#
        )
    }

    #[test]
    fn deserializes_and_validates() {
        let doc: LineageDocument = serde_json::from_str(&sample_json("abc123")).unwrap();
        doc.validate("abc123").unwrap();
        assert_eq!(doc.column_level_lineage.len(), 1);
        assert_eq!(
            doc.column_level_lineage[0].derivation_type,
            DerivationType::FunctionCall
        );
    }

    #[test]
    fn hash_mismatch_is_rejected() {
        let doc: LineageDocument = serde_json::from_str(&sample_json("abc123")).unwrap();
        let err = doc.validate("other").unwrap_err();
        assert!(matches!(err, DocumentError::HashMismatch { .. }));
    }

    #[test]
    fn out_of_enum_derivation_type_fails_deserialization() {
        let json = sample_json("h").replace("FUNCTION_CALL", "MAGIC");
        assert!(serde_json::from_str::<LineageDocument>(&json).is_err());
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let json = sample_json("h").replacen(
            "\"source_database_name\"",
            "\"errors_or_warnings\": [\"none\"], \"source_database_name\"",
            1,
        );
        let doc: LineageDocument = serde_json::from_str(&json).unwrap();
        doc.validate("h").unwrap();
    }

    #[test]
    fn confidence_bounds_are_enforced() {
        let mut doc: LineageDocument = serde_json::from_str(&sample_json("h")).unwrap();
        doc.parsing_confidence = 1.2;
        assert!(matches!(
            doc.validate("h"),
            Err(DocumentError::ConfidenceOutOfRange(_))
        ));
    }

    #[test]
    fn missing_confidence_defaults_to_full() {
        let json = sample_json("h").replace("\"parsing_confidence\": 0.95", "\"parsing_confidence\": 1.0");
        let doc: LineageDocument = serde_json::from_str(&json).unwrap();
        assert_eq!(doc.parsing_confidence, 1.0);
    }

    #[test]
    fn no_lineage_classification() {
        let mut doc: LineageDocument = serde_json::from_str(&sample_json("h")).unwrap();
        assert!(!doc.is_no_lineage(true));

        doc.parsing_confidence = 0.1;
        assert!(doc.is_no_lineage(true));

        doc.parsing_confidence = 0.9;
        doc.column_level_lineage.clear();
        assert!(doc.is_no_lineage(true));
        // A pure SELECT with no lineage entries is still a success.
        assert!(!doc.is_no_lineage(false));
    }

    #[test]
    fn entry_without_any_target_object_fails_validation() {
        let json = sample_json("h").replace(
            r#""target_object": {"schema": "public", "name": "monthly_report", "type": "TABLE"},"#,
            "",
        );
        let doc: LineageDocument = serde_json::from_str(&json).unwrap();
        assert!(matches!(
            doc.validate("h"),
            Err(DocumentError::MissingTargetObject { index: 0 })
        ));
    }

    #[test]
    fn read_write_expands_to_both() {
        assert!(AccessMode::ReadWrite.reads() && AccessMode::ReadWrite.writes());
        assert!(AccessMode::Read.reads() && !AccessMode::Read.writes());
    }

    #[test]
    fn materialized_view_alias_with_space_is_accepted() {
        let json = r#"{"schema": "public", "name": "mv", "type": "MATERIALIZED VIEW"}"#;
        let obj: ObjectRefDoc = serde_json::from_str(json).unwrap();
        assert_eq!(obj.kind, ObjectKind::MaterializedView);
    }
}
