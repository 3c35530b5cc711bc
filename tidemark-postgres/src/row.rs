//! Typed column access for rows read by the stores and the catalog reader.

use tokio_postgres::Row;

use crate::error::{PgError, PgResult};

/// Extension trait for PostgreSQL rows.
pub trait PgRow {
    /// Get a column value by name.
    fn get_value<T>(&self, column: &str) -> PgResult<T>
    where
        T: for<'a> tokio_postgres::types::FromSql<'a>;

    /// Get a nullable column value by name.
    fn get_opt<T>(&self, column: &str) -> PgResult<Option<T>>
    where
        T: for<'a> tokio_postgres::types::FromSql<'a>,
    {
        self.get_value::<Option<T>>(column)
    }
}

impl PgRow for Row {
    fn get_value<T>(&self, column: &str) -> PgResult<T>
    where
        T: for<'a> tokio_postgres::types::FromSql<'a>,
    {
        self.try_get(column).map_err(|e| {
            PgError::deserialization(format!("failed to get column '{}': {}", column, e))
        })
    }
}
