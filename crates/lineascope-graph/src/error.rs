use lineascope_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("graph database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("pattern {sql_hash} is marked COMPLETED_SUCCESS but stores no lineage document")]
    MissingDocument { sql_hash: String },

    #[error("graph statement rejected: {detail}")]
    StatementRejected { detail: String },

    #[error("pattern {sql_hash}: transaction still conflicted after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        sql_hash: String,
        attempts: u32,
        last_error: String,
    },
}

impl GraphError {
    /// Serialization failures and dropped connections are worth replaying
    /// the per-pattern transaction; a rejected statement is not.
    pub fn is_transient(&self) -> bool {
        match self {
            GraphError::Database(sqlx::Error::Io(_))
            | GraphError::Database(sqlx::Error::PoolTimedOut) => true,
            GraphError::Database(sqlx::Error::Database(db)) => {
                matches!(db.code().as_deref(), Some("40001") | Some("40P01"))
            }
            GraphError::Store(store) => store.is_transient(),
            _ => false,
        }
    }
}
