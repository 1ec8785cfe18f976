//! Prompt construction for lineage extraction.
//!
//! The system prompt pins the model to the lineage document contract; the
//! user prompt carries the SQL, the metadata context and the expected JSON
//! Schema (generated from the Rust types, so prompt and validator can never
//! drift apart).

use std::fmt::Write as _;
use std::sync::OnceLock;

use lineascope_core::{LineageDocument, StatementKind};
use schemars::schema_for;

use crate::client::ChatMessage;
use crate::context::PromptContext;

const SYSTEM_PROMPT: &str = "\
You are an expert in column-level SQL data lineage for PostgreSQL.

Given one SQL statement, the metadata of the database objects it touches, \
and the statement's unique pattern hash, determine precisely how data flows \
from source columns, through any transformation, into target columns.

Respond with a single JSON object and nothing else: no prose, no Markdown \
fences. The object must conform to the JSON Schema supplied by the user. \
Echo the provided hash in sql_pattern_hash. Use null for source_column when \
a target column is filled from a literal or a source-less expression. If the \
statement writes nowhere (a pure SELECT), set target_object to null. List \
every table or view the statement reads or writes in referenced_objects with \
its access_mode. Report your confidence in parsing_confidence between 0.0 \
and 1.0.";

/// JSON Schema of [`LineageDocument`], rendered once.
pub fn document_schema_json() -> &'static str {
    static SCHEMA: OnceLock<String> = OnceLock::new();
    SCHEMA.get_or_init(|| {
        let schema = schema_for!(LineageDocument);
        serde_json::to_string_pretty(&schema).unwrap_or_else(|_| "{}".to_string())
    })
}

/// Build the initial message pair for one pattern.
pub fn build_messages(
    sql_hash: &str,
    kind: StatementKind,
    sample_sql: &str,
    context: &PromptContext,
) -> Vec<ChatMessage> {
    let mut user = String::new();
    let _ = writeln!(user, "SQL pattern hash: {sql_hash}");
    let _ = writeln!(user, "Statement kind: {}", kind.as_str());
    let _ = writeln!(user, "\nSQL statement:\n```sql\n{sample_sql}\n```");
    let _ = writeln!(user, "\n{}", render_context(context));
    let _ = writeln!(
        user,
        "\nReturn one JSON object conforming to this JSON Schema:\n{}",
        document_schema_json()
    );

    vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(user)]
}

/// Follow-up message after a validation failure.
pub fn repair_message(validation_error: &str) -> ChatMessage {
    ChatMessage::user(format!(
        "The previous response was not a valid lineage document: {validation_error}. \
         Respond again with a single corrected JSON object and nothing else."
    ))
}

/// Render the metadata context as compact prose the model reads well.
pub fn render_context(context: &PromptContext) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Source database: {}", context.source_database_name);

    if context.objects.is_empty() {
        let _ = writeln!(out, "No catalog metadata was found for the referenced objects.");
    }

    for object in &context.objects {
        let _ = writeln!(
            out,
            "\n{} \"{}.{}\":",
            object.object_type, object.schema, object.name
        );
        if let Some(description) = &object.description {
            let _ = writeln!(out, "  description: {description}");
        }
        if let Some(row_count) = object.row_count {
            let _ = writeln!(out, "  approximate rows: {row_count}");
        }
        if !object.columns.is_empty() {
            let _ = writeln!(out, "  columns:");
            for column in &object.columns {
                let nullability = if column.is_nullable { "NULL" } else { "NOT NULL" };
                let _ = write!(out, "    - {} ({} {})", column.name, column.data_type, nullability);
                if let Some(description) = &column.description {
                    let _ = write!(out, " -- {description}");
                }
                out.push('\n');
            }
        }
        if let Some(definition) = &object.definition {
            let _ = writeln!(out, "  definition:\n```sql\n{definition}\n```");
        }
    }

    if !context.unresolved.is_empty() {
        let _ = writeln!(
            out,
            "\nReferenced but not found in catalog metadata: {}.",
            context.unresolved.join(", ")
        );
    }
    if !context.truncated.is_empty() {
        let _ = writeln!(
            out,
            "Metadata omitted for brevity: {}.",
            context.truncated.join(", ")
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ColumnContext, ObjectContext};

    fn sample_context() -> PromptContext {
        PromptContext {
            source_database_name: "tpcds".to_string(),
            objects: vec![ObjectContext {
                schema: "public".to_string(),
                name: "date_dim".to_string(),
                object_type: "TABLE".to_string(),
                relevance: 1,
                description: None,
                row_count: Some(73_049),
                columns: vec![ColumnContext {
                    name: "d_date".to_string(),
                    data_type: "date".to_string(),
                    is_nullable: true,
                    description: Some("calendar date".to_string()),
                }],
                definition: None,
            }],
            unresolved: vec!["pg_temp.scratch".to_string()],
            truncated: vec![],
        }
    }

    #[test]
    fn schema_json_mentions_the_contract_fields() {
        let schema = document_schema_json();
        for field in [
            "sql_pattern_hash",
            "column_level_lineage",
            "derivation_type",
            "referenced_objects",
            "parsing_confidence",
        ] {
            assert!(schema.contains(field), "schema missing {field}");
        }
    }

    #[test]
    fn messages_carry_hash_sql_and_context() {
        let messages = build_messages(
            "cafe01",
            StatementKind::Insert,
            "INSERT INTO r SELECT 1",
            &sample_context(),
        );
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "system");
        let user = &messages[1].content;
        assert!(user.contains("cafe01"));
        assert!(user.contains("INSERT INTO r SELECT 1"));
        assert!(user.contains("date_dim"));
        assert!(user.contains("pg_temp.scratch"));
        assert!(user.contains("sql_pattern_hash"));
    }

    #[test]
    fn rendered_context_lists_columns_with_types() {
        let rendered = render_context(&sample_context());
        assert!(rendered.contains("d_date (date NULL)"));
        assert!(rendered.contains("TABLE \"public.date_dim\""));
    }
}
