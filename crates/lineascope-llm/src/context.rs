//! Prompt context assembly.
//!
//! For a claimed pattern, gather catalog metadata for every object the
//! sample SQL references: columns with types and descriptions, plus view
//! definitions. Unqualified names resolve through the data source's search
//! path. The assembled context is trimmed to a character budget by dropping
//! the least relevant objects first (write targets outrank FROM/JOIN
//! sources, which outrank subquery-only references).

use lineascope_core::references::{collect_object_refs, ObjectRef};
use lineascope_store::{MetadataStore, SqlPatternRow, StoreError};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use tracing::{debug, warn};

use crate::prompt::render_context;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Even an empty object list blows the budget; operator action needed
    /// (larger model context or a bigger budget).
    #[error("assembled context needs {required} chars, budget is {budget}")]
    TooLarge { budget: usize, required: usize },
}

#[derive(Debug, Clone)]
pub struct ColumnContext {
    pub name: String,
    pub data_type: String,
    pub is_nullable: bool,
    pub description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ObjectContext {
    pub schema: String,
    pub name: String,
    pub object_type: String,
    /// Higher survives trimming longer.
    pub relevance: u8,
    pub description: Option<String>,
    pub row_count: Option<i64>,
    pub columns: Vec<ColumnContext>,
    pub definition: Option<String>,
}

/// Everything the prompt builder needs besides the SQL itself.
#[derive(Debug, Clone, Default)]
pub struct PromptContext {
    pub source_database_name: String,
    pub objects: Vec<ObjectContext>,
    /// References with no catalog metadata (the model may still use them).
    pub unresolved: Vec<String>,
    /// Objects dropped by the budget trim, named so the model knows.
    pub truncated: Vec<String>,
}

pub struct ContextAssembler {
    metadata: MetadataStore,
    /// Rendered-character budget for the whole context block.
    max_chars: usize,
}

impl ContextAssembler {
    pub fn new(metadata: MetadataStore, max_chars: usize) -> Self {
        Self { metadata, max_chars }
    }

    /// Build the context for one pattern.
    pub async fn assemble(&self, pattern: &SqlPatternRow) -> Result<PromptContext, ContextError> {
        let mut context = PromptContext {
            source_database_name: pattern.source_database_name.clone(),
            ..PromptContext::default()
        };

        let references = parse_references(&pattern.sample_raw_sql_text);
        if references.is_empty() {
            return Ok(context);
        }

        let source = self
            .metadata
            .source_by_database_name(&pattern.source_database_name)
            .await?;
        let (source_id, search_path) = match &source {
            Some(source) => (Some(source.source_id), source.search_path.clone()),
            None => {
                warn!(
                    database = %pattern.source_database_name,
                    "no data source configured; all references will be unresolved"
                );
                (None, vec!["public".to_string()])
            }
        };

        for reference in &references {
            let display = match &reference.schema {
                Some(schema) => format!("{schema}.{}", reference.name),
                None => reference.name.clone(),
            };

            let Some(source_id) = source_id else {
                context.unresolved.push(display);
                continue;
            };

            let object = match &reference.schema {
                Some(schema) => {
                    self.metadata
                        .object_by_name(source_id, schema, &reference.name)
                        .await?
                }
                None => {
                    self.metadata
                        .resolve_in_search_path(source_id, &search_path, &reference.name)
                        .await?
                }
            };

            let Some(object) = object else {
                context.unresolved.push(display);
                continue;
            };

            let columns = self.metadata.columns_for_object(object.object_id).await?;
            let is_view = matches!(object.object_type.as_str(), "VIEW" | "MATERIALIZED VIEW");
            context.objects.push(ObjectContext {
                schema: object.schema_name,
                name: object.object_name,
                object_type: object.object_type,
                relevance: reference.role.rank(),
                description: object.description,
                row_count: object.row_count,
                columns: columns
                    .into_iter()
                    .map(|column| ColumnContext {
                        name: column.column_name,
                        data_type: column.data_type,
                        is_nullable: column.is_nullable,
                        description: column.description,
                    })
                    .collect(),
                definition: if is_view { object.definition } else { None },
            });
        }

        fit_to_budget(&mut context, self.max_chars)?;
        debug!(
            objects = context.objects.len(),
            unresolved = context.unresolved.len(),
            truncated = context.truncated.len(),
            "assembled prompt context"
        );
        Ok(context)
    }
}

/// Parse the sample SQL and collect its object references.
///
/// The sample already passed the fingerprinter, so a parse failure here is
/// unexpected — treated as "no references" rather than an error, since the
/// model still receives the raw SQL.
fn parse_references(sample_sql: &str) -> Vec<ObjectRef> {
    match Parser::parse_sql(&PostgreSqlDialect {}, sample_sql) {
        Ok(statements) => statements
            .first()
            .map(collect_object_refs)
            .unwrap_or_default(),
        Err(error) => {
            warn!(%error, "sample SQL failed to re-parse during context assembly");
            Vec::new()
        }
    }
}

/// Drop the least relevant objects until the rendered context fits.
pub(crate) fn fit_to_budget(
    context: &mut PromptContext,
    max_chars: usize,
) -> Result<(), ContextError> {
    loop {
        let rendered_len = render_context(context).len();
        if rendered_len <= max_chars {
            return Ok(());
        }
        // Last object of the lowest relevance rank goes first.
        let victim = context
            .objects
            .iter()
            .enumerate()
            .min_by_key(|(index, object)| (object.relevance, std::cmp::Reverse(*index)))
            .map(|(index, _)| index);
        match victim {
            Some(index) => {
                let dropped = context.objects.remove(index);
                context
                    .truncated
                    .push(format!("{}.{}", dropped.schema, dropped.name));
            }
            None => {
                return Err(ContextError::TooLarge {
                    budget: max_chars,
                    required: rendered_len,
                })
            }
        }
    }
}
