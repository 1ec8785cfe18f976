//! Apache AGE execution layer.
//!
//! Every cypher statement runs as
//! `SELECT * FROM ag_catalog.cypher('<graph>', $cypher$ ... $cypher$, $1)`
//! with the whole parameter map bound through the host driver as a single
//! agtype argument — statement text and values never mix. Connections load
//! the extension and pin the search path on checkout.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool, Postgres, Row, Transaction};
use tracing::{debug, instrument};

use crate::cypher::{dollar_quote, quote_literal, CypherStatement, UpsertPlan};
use crate::error::GraphError;

#[derive(Debug, Clone)]
pub struct AgeSettings {
    pub database_url: String,
    pub graph_name: String,
    pub max_connections: u32,
    pub statement_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct AgeClient {
    pool: PgPool,
    graph_name: String,
}

impl AgeClient {
    /// Connect and make sure the graph exists.
    pub async fn connect(settings: &AgeSettings) -> Result<Self, GraphError> {
        let statement_timeout_ms = settings.statement_timeout.as_millis() as i64;
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    conn.execute("LOAD 'age'").await?;
                    conn.execute("SET search_path = ag_catalog, \"$user\", public")
                        .await?;
                    conn.execute(
                        format!("SET statement_timeout = {statement_timeout_ms}").as_str(),
                    )
                    .await?;
                    Ok(())
                })
            })
            .connect(&settings.database_url)
            .await?;

        let client = Self {
            pool,
            graph_name: settings.graph_name.clone(),
        };
        client.ensure_graph().await?;
        Ok(client)
    }

    pub fn graph_name(&self) -> &str {
        &self.graph_name
    }

    async fn ensure_graph(&self) -> Result<(), GraphError> {
        let exists: i64 =
            sqlx::query_scalar("SELECT count(*) FROM ag_catalog.ag_graph WHERE name = $1::name")
                .bind(&self.graph_name)
                .fetch_one(&self.pool)
                .await?;
        if exists == 0 {
            sqlx::query("SELECT ag_catalog.create_graph($1::name)")
                .bind(&self.graph_name)
                .execute(&self.pool)
                .await?;
            debug!(graph = %self.graph_name, "created graph");
        }
        Ok(())
    }

    /// Open a transaction; rolls back on drop unless committed.
    pub async fn begin(&self) -> Result<AgeTransaction, GraphError> {
        let tx = self.pool.begin().await?;
        Ok(AgeTransaction {
            tx,
            graph_name: self.graph_name.clone(),
        })
    }
}

/// A transaction scope for a batch of cypher statements.
pub struct AgeTransaction {
    tx: Transaction<'static, Postgres>,
    graph_name: String,
}

impl AgeTransaction {
    /// Run one cypher statement, returning each result row rendered as
    /// agtype text (a JSON superset; strings come back quoted).
    #[instrument(skip_all, fields(graph = %self.graph_name))]
    pub async fn fetch(&mut self, statement: &CypherStatement) -> Result<Vec<String>, GraphError> {
        let sql = format!(
            "SELECT result::text AS result FROM ag_catalog.cypher({}, {}, $1::text::ag_catalog.agtype) AS (result ag_catalog.agtype)",
            quote_literal(&self.graph_name),
            dollar_quote(&statement.text),
        );
        let params = serde_json::Value::Object(statement.params.clone()).to_string();
        let rows = sqlx::query(&sql)
            .bind(params)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|error| classify_execution_error(error, &statement.text))?;
        rows.into_iter()
            .map(|row| row.try_get::<Option<String>, _>(0).map(Option::unwrap_or_default))
            .collect::<Result<Vec<_>, _>>()
            .map_err(GraphError::from)
    }

    /// Run one cypher statement, returning the number of result rows.
    pub async fn execute(&mut self, statement: &CypherStatement) -> Result<u64, GraphError> {
        Ok(self.fetch(statement).await?.len() as u64)
    }

    /// Probe, create when absent, then apply. Returns true when the entity
    /// was created by this call.
    pub async fn apply_upsert(&mut self, plan: &UpsertPlan) -> Result<bool, GraphError> {
        let existing = self.execute(&plan.probe).await?;
        let created = existing == 0;
        if created {
            self.execute(&plan.create).await?;
        }
        self.execute(&plan.apply).await?;
        Ok(created)
    }

    /// Run a group of plans (one logical entity) inside a savepoint; a
    /// failure rolls back just this entity and leaves the surrounding
    /// transaction usable.
    pub async fn apply_isolated(&mut self, plans: &[UpsertPlan]) -> Result<(), GraphError> {
        (&mut *self.tx).execute("SAVEPOINT entity").await?;
        let mut result = Ok(());
        for plan in plans {
            if let Err(error) = self.apply_upsert(plan).await {
                result = Err(error);
                break;
            }
        }
        match result {
            Ok(()) => {
                (&mut *self.tx).execute("RELEASE SAVEPOINT entity").await?;
                Ok(())
            }
            Err(error) => {
                (&mut *self.tx).execute("ROLLBACK TO SAVEPOINT entity").await?;
                (&mut *self.tx).execute("RELEASE SAVEPOINT entity").await?;
                Err(error)
            }
        }
    }

    pub async fn commit(self) -> Result<(), GraphError> {
        self.tx.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> Result<(), GraphError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

/// Engine rejections become [`GraphError::StatementRejected`] carrying the
/// offending statement; conflict/connection errors stay as database errors
/// so the retry classification still sees them.
fn classify_execution_error(error: sqlx::Error, statement_text: &str) -> GraphError {
    match &error {
        sqlx::Error::Database(db)
            if !matches!(db.code().as_deref(), Some("40001") | Some("40P01")) =>
        {
            GraphError::StatementRejected {
                detail: format!("{}; statement: {statement_text}", db.message()),
            }
        }
        _ => GraphError::Database(error),
    }
}
