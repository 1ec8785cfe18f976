use thiserror::Error;

/// Failures at the control-plane boundary.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("pattern {sql_hash} not found")]
    PatternNotFound { sql_hash: String },

    #[error("stored lineage document for {sql_hash} is not valid JSON: {source}")]
    CorruptDocument {
        sql_hash: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    /// Transient errors worth a bounded retry: connection loss, pool
    /// timeouts, serialization/deadlock rollbacks.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Database(sqlx::Error::Io(_))
            | StoreError::Database(sqlx::Error::PoolTimedOut)
            | StoreError::Database(sqlx::Error::PoolClosed) => true,
            StoreError::Database(sqlx::Error::Database(db)) => {
                // 40001 serialization_failure, 40P01 deadlock_detected,
                // 57P03 cannot_connect_now, 53300 too_many_connections
                matches!(
                    db.code().as_deref(),
                    Some("40001") | Some("40P01") | Some("57P03") | Some("53300")
                )
            }
            _ => false,
        }
    }
}
