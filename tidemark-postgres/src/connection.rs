//! PostgreSQL connection wrapper.

use deadpool_postgres::Object;
use tidemark_migrate::{MigrateResult, SqlConnection};
use tokio_postgres::types::ToSql;
use tokio_postgres::{Row, SimpleQueryMessage};
use tracing::debug;

use crate::error::PgResult;

/// A pooled PostgreSQL connection.
///
/// Parameterised helpers serve the bookkeeping stores; the [`SqlConnection`]
/// implementation runs migration statements as plain text.
pub struct PgConnection {
    client: Object,
}

impl PgConnection {
    pub(crate) fn new(client: Object) -> Self {
        Self { client }
    }

    /// Execute a query and return all rows.
    pub async fn query(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> PgResult<Vec<Row>> {
        debug!(sql = %sql, "Executing query");
        let stmt = self.client.prepare_cached(sql).await?;
        Ok(self.client.query(&stmt, params).await?)
    }

    /// Execute a query and return zero or one row.
    pub async fn query_opt(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> PgResult<Option<Row>> {
        debug!(sql = %sql, "Executing query_opt");
        let stmt = self.client.prepare_cached(sql).await?;
        Ok(self.client.query_opt(&stmt, params).await?)
    }

    /// Execute a statement and return the number of affected rows.
    pub async fn execute_params(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> PgResult<u64> {
        debug!(sql = %sql, "Executing statement");
        let stmt = self.client.prepare_cached(sql).await?;
        Ok(self.client.execute(&stmt, params).await?)
    }

    /// Execute a batch of statements in a single round-trip.
    pub async fn batch(&self, sql: &str) -> PgResult<()> {
        debug!(sql = %sql, "Executing batch");
        self.client.batch_execute(sql).await?;
        Ok(())
    }

    /// Run a statement through the simple query protocol.
    ///
    /// Returns the affected row count and the first column of the first row.
    async fn simple(&self, sql: &str) -> PgResult<(u64, Option<String>)> {
        debug!(sql = %sql, "Executing migration statement");
        let messages = self.client.simple_query(sql).await?;

        let mut rows = 0;
        let mut first = None;
        for message in messages {
            match message {
                SimpleQueryMessage::Row(row) if first.is_none() => {
                    first = Some(row.get(0).map(str::to_string));
                }
                SimpleQueryMessage::CommandComplete(count) => rows += count,
                _ => {}
            }
        }
        Ok((rows, first.flatten()))
    }

    /// Get the underlying pooled client.
    pub fn inner(&self) -> &Object {
        &self.client
    }
}

#[async_trait::async_trait]
impl SqlConnection for PgConnection {
    async fn execute(&mut self, sql: &str) -> MigrateResult<u64> {
        Ok(self.simple(sql).await?.0)
    }

    async fn batch_execute(&mut self, sql: &str) -> MigrateResult<()> {
        Ok(self.batch(sql).await?)
    }

    async fn query_scalar(&mut self, sql: &str) -> MigrateResult<Option<String>> {
        Ok(self.simple(sql).await?.1)
    }
}
