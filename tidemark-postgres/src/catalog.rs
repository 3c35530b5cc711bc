//! Catalog reader over `information_schema` and `pg_catalog`.

use tidemark_migrate::introspect::postgres_queries;
use tidemark_migrate::{CatalogReader, ColumnInfo, FunctionInfo, IndexInfo, MigrateResult, TableInfo};
use tokio_postgres::Row;

use crate::error::PgResult;
use crate::pool::PgPool;
use crate::row::PgRow;

/// Reads raw catalog rows for the schema introspector.
#[derive(Clone)]
pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    /// Create a catalog reader.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn table_info(row: &Row) -> PgResult<TableInfo> {
    Ok(TableInfo {
        name: row.get_value("table_name")?,
        schema: row.get_value("table_schema")?,
        table_type: row.get_value("table_type")?,
    })
}

fn column_info(row: &Row) -> PgResult<ColumnInfo> {
    Ok(ColumnInfo {
        name: row.get_value("column_name")?,
        data_type: row.get_value("data_type")?,
        udt_name: row.get_value("udt_name")?,
        character_maximum_length: row.get_opt("character_maximum_length")?,
        numeric_precision: row.get_opt("numeric_precision")?,
        numeric_scale: row.get_opt("numeric_scale")?,
        is_nullable: row.get_value("is_nullable")?,
        column_default: row.get_opt("column_default")?,
        ordinal_position: row.get_value("ordinal_position")?,
    })
}

fn index_info(row: &Row) -> PgResult<IndexInfo> {
    Ok(IndexInfo {
        name: row.get_value("index_name")?,
        table_name: row.get_value("table_name")?,
        columns: row.get_value("columns")?,
        is_unique: row.get_value("is_unique")?,
        is_primary: row.get_value("is_primary")?,
        predicate: row.get_opt("predicate")?,
    })
}

fn function_info(row: &Row) -> PgResult<FunctionInfo> {
    Ok(FunctionInfo {
        name: row.get_value("function_name")?,
        schema: row.get_value("schema_name")?,
        arguments: row.get_value("arguments")?,
        return_type: row.get_opt("return_type")?.unwrap_or_default(),
        body: row.get_opt("body")?.unwrap_or_default(),
        language: row.get_value("language")?,
        volatility: row.get_value("volatility")?,
        is_security_definer: row.get_value("is_security_definer")?,
    })
}

fn collect<T>(rows: &[Row], map: fn(&Row) -> PgResult<T>) -> MigrateResult<Vec<T>> {
    Ok(rows.iter().map(map).collect::<PgResult<Vec<T>>>()?)
}

#[async_trait::async_trait]
impl CatalogReader for PgCatalog {
    async fn tables(&self, schema: &str) -> MigrateResult<Vec<TableInfo>> {
        let conn = self.pool.get().await?;
        let rows = conn.query(postgres_queries::TABLES, &[&schema]).await?;
        collect(&rows, table_info)
    }

    async fn columns(&self, schema: &str, table: &str) -> MigrateResult<Vec<ColumnInfo>> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(postgres_queries::COLUMNS, &[&schema, &table])
            .await?;
        collect(&rows, column_info)
    }

    async fn indexes(&self, schema: &str, table: &str) -> MigrateResult<Vec<IndexInfo>> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(postgres_queries::INDEXES, &[&schema, &table])
            .await?;
        collect(&rows, index_info)
    }

    async fn functions(&self, schema: &str) -> MigrateResult<Vec<FunctionInfo>> {
        let conn = self.pool.get().await?;
        let rows = conn.query(postgres_queries::FUNCTIONS, &[&schema]).await?;
        collect(&rows, function_info)
    }
}
