//! Relational control plane for the lineage pipeline.
//!
//! Owns the `lineascope` schema: monitored data sources, the captured query
//! log the collector fills, catalog metadata snapshots, the pattern table
//! that carries each fingerprint through the LLM state machine, and the
//! normalization error ledger. Everything speaks `sqlx` against PostgreSQL;
//! batch claiming uses `FOR UPDATE SKIP LOCKED` so any number of workers can
//! run side by side.

pub mod error;
pub mod logs;
pub mod metadata;
pub mod models;
pub mod patterns;
pub mod pool;
pub mod retry;

pub use error::StoreError;
pub use logs::LogStore;
pub use metadata::MetadataStore;
pub use models::{
    CapturedLog, ColumnMetadataRow, DataSource, FunctionMetadataRow, LlmStatus,
    ObjectMetadataRow, SqlPatternRow,
};
pub use patterns::{ClaimedPatterns, PatternStore};
pub use pool::{connect, run_migrations, PoolSettings};
pub use retry::RetryPolicy;
