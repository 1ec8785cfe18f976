//! Read access to catalog metadata snapshots.
//!
//! The metadata collector owns these tables; this side only reads them —
//! with one exception: the `normalized_sql_hash` stamp that marks a view or
//! function definition as fingerprinted.

use sqlx::PgPool;

use crate::error::StoreError;
use crate::models::{ColumnMetadataRow, DataSource, FunctionMetadataRow, ObjectMetadataRow};

const OBJECT_COLUMNS: &str = "object_id, source_id, database_name, schema_name, object_name, \
     object_type, owner, description, definition, row_count, updated_at";

const COLUMN_COLUMNS: &str = "object_id, column_name, ordinal_position, data_type, is_nullable, \
     default_value, is_primary_key, is_unique, fk_target_schema, fk_target_table, \
     fk_target_column, fk_constraint_name, description";

const FUNCTION_COLUMNS: &str = "function_id, source_id, database_name, schema_name, function_name, \
     function_type, return_type, parameter_types, definition, language, owner, description, \
     updated_at";

#[derive(Debug, Clone)]
pub struct MetadataStore {
    pool: PgPool,
}

impl MetadataStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn active_sources(&self) -> Result<Vec<DataSource>, StoreError> {
        let rows = sqlx::query_as(
            r#"
            SELECT source_id, source_name, database_name, search_path, is_active
            FROM lineascope.data_sources
            WHERE is_active = TRUE
            ORDER BY source_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn source_by_database_name(
        &self,
        database_name: &str,
    ) -> Result<Option<DataSource>, StoreError> {
        let row = sqlx::query_as(
            r#"
            SELECT source_id, source_name, database_name, search_path, is_active
            FROM lineascope.data_sources
            WHERE database_name = $1 AND is_active = TRUE
            ORDER BY source_id
            LIMIT 1
            "#,
        )
        .bind(database_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Look up one object by its qualified name.
    pub async fn object_by_name(
        &self,
        source_id: i64,
        schema_name: &str,
        object_name: &str,
    ) -> Result<Option<ObjectMetadataRow>, StoreError> {
        let row = sqlx::query_as(&format!(
            r#"
            SELECT {OBJECT_COLUMNS}
            FROM lineascope.objects_metadata
            WHERE source_id = $1 AND schema_name = $2 AND object_name = $3
            LIMIT 1
            "#
        ))
        .bind(source_id)
        .bind(schema_name)
        .bind(object_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Resolve an unqualified object name: first schema in the search path
    /// that contains a matching object wins.
    pub async fn resolve_in_search_path(
        &self,
        source_id: i64,
        search_path: &[String],
        object_name: &str,
    ) -> Result<Option<ObjectMetadataRow>, StoreError> {
        for schema_name in search_path {
            if let Some(row) = self
                .object_by_name(source_id, schema_name, object_name)
                .await?
            {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }

    pub async fn objects_for_source(
        &self,
        source_id: i64,
    ) -> Result<Vec<ObjectMetadataRow>, StoreError> {
        let rows = sqlx::query_as(&format!(
            r#"
            SELECT {OBJECT_COLUMNS}
            FROM lineascope.objects_metadata
            WHERE source_id = $1
            ORDER BY database_name, schema_name, object_name
            "#
        ))
        .bind(source_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn columns_for_object(
        &self,
        object_id: i64,
    ) -> Result<Vec<ColumnMetadataRow>, StoreError> {
        let rows = sqlx::query_as(&format!(
            r#"
            SELECT {COLUMN_COLUMNS}
            FROM lineascope.columns_metadata
            WHERE object_id = $1
            ORDER BY ordinal_position
            "#
        ))
        .bind(object_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn columns_for_objects(
        &self,
        object_ids: &[i64],
    ) -> Result<Vec<ColumnMetadataRow>, StoreError> {
        if object_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query_as(&format!(
            r#"
            SELECT {COLUMN_COLUMNS}
            FROM lineascope.columns_metadata
            WHERE object_id = ANY($1)
            ORDER BY object_id, ordinal_position
            "#
        ))
        .bind(object_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn functions_for_source(
        &self,
        source_id: i64,
    ) -> Result<Vec<FunctionMetadataRow>, StoreError> {
        let rows = sqlx::query_as(&format!(
            r#"
            SELECT {FUNCTION_COLUMNS}
            FROM lineascope.functions_metadata
            WHERE source_id = $1
            ORDER BY database_name, schema_name, function_name
            "#
        ))
        .bind(source_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// View and materialised-view definitions not yet fingerprinted.
    pub async fn unprocessed_view_definitions(
        &self,
    ) -> Result<Vec<ObjectMetadataRow>, StoreError> {
        let rows = sqlx::query_as(&format!(
            r#"
            SELECT {OBJECT_COLUMNS}
            FROM lineascope.objects_metadata
            WHERE object_type IN ('VIEW', 'MATERIALIZED VIEW')
              AND definition IS NOT NULL AND definition <> ''
              AND (normalized_sql_hash IS NULL OR normalized_sql_hash = '')
            ORDER BY object_id
            "#
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn unprocessed_function_definitions(
        &self,
    ) -> Result<Vec<FunctionMetadataRow>, StoreError> {
        let rows = sqlx::query_as(&format!(
            r#"
            SELECT {FUNCTION_COLUMNS}
            FROM lineascope.functions_metadata
            WHERE definition IS NOT NULL AND definition <> ''
              AND (normalized_sql_hash IS NULL OR normalized_sql_hash = '')
            ORDER BY function_id
            "#
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn mark_object_definition_processed(
        &self,
        object_id: i64,
        sql_hash: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE lineascope.objects_metadata
            SET normalized_sql_hash = $2, updated_at = now()
            WHERE object_id = $1
            "#,
        )
        .bind(object_id)
        .bind(sql_hash)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_function_definition_processed(
        &self,
        function_id: i64,
        sql_hash: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE lineascope.functions_metadata
            SET normalized_sql_hash = $2, updated_at = now()
            WHERE function_id = $1
            "#,
        )
        .bind(function_id)
        .bind(sql_hash)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
