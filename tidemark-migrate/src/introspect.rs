//! Database introspection into [`SchemaSnapshot`]s.
//!
//! A backend implements [`CatalogReader`] to return raw catalog rows. The
//! [`SchemaBuilder`] turns those rows into a sorted snapshot without touching
//! the database, so the assembly rules are testable on their own.

use std::collections::HashMap;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::args::parse_arguments;
use crate::config::BOOKKEEPING_TABLES;
use crate::error::MigrateResult;
use crate::model::{
    Column, Function, FunctionParameter, Index, SchemaSnapshot, Table, Volatility, normalize_type,
    takes_length, takes_precision,
};

/// Result of introspecting a database.
#[derive(Debug, Clone)]
pub struct IntrospectionResult {
    /// The captured snapshot.
    pub snapshot: SchemaSnapshot,
    /// Tables that were skipped.
    pub skipped_tables: Vec<SkippedTable>,
    /// Warnings generated during introspection.
    pub warnings: Vec<String>,
}

/// A table that was skipped during introspection.
#[derive(Debug, Clone)]
pub struct SkippedTable {
    /// Table name.
    pub name: String,
    /// Reason it was skipped.
    pub reason: String,
}

/// Configuration for introspection.
#[derive(Debug, Clone)]
pub struct IntrospectionConfig {
    /// Schema to introspect (default: "public").
    pub database_schema: String,
    /// Tables to include (empty = all).
    pub include_tables: Vec<String>,
    /// Tables to exclude.
    pub exclude_tables: Vec<String>,
    /// Whether to capture stored functions.
    pub include_functions: bool,
}

impl Default for IntrospectionConfig {
    fn default() -> Self {
        Self {
            database_schema: "public".to_string(),
            include_tables: Vec::new(),
            exclude_tables: BOOKKEEPING_TABLES.iter().map(|t| t.to_string()).collect(),
            include_functions: true,
        }
    }
}

impl IntrospectionConfig {
    /// Create a new introspection config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the database schema to introspect.
    pub fn database_schema(mut self, schema: impl Into<String>) -> Self {
        self.database_schema = schema.into();
        self
    }

    /// Include only these tables.
    pub fn include_tables(mut self, tables: Vec<String>) -> Self {
        self.include_tables = tables;
        self
    }

    /// Exclude these tables in addition to the bookkeeping tables.
    pub fn exclude_tables(mut self, tables: Vec<String>) -> Self {
        for table in tables {
            if !self.exclude_tables.contains(&table) {
                self.exclude_tables.push(table);
            }
        }
        self
    }

    /// Whether to capture stored functions.
    pub fn include_functions(mut self, include: bool) -> Self {
        self.include_functions = include;
        self
    }

    /// Check if a table should be included.
    pub fn should_include_table(&self, name: &str) -> bool {
        if self.exclude_tables.iter().any(|t| t == name) {
            return false;
        }
        self.include_tables.is_empty() || self.include_tables.iter().any(|t| t == name)
    }
}

/// Raw table information from the database.
#[derive(Debug, Clone)]
pub struct TableInfo {
    /// Table name.
    pub name: String,
    /// Table schema (e.g., "public").
    pub schema: String,
    /// Table type ("BASE TABLE" or "VIEW").
    pub table_type: String,
}

/// Raw column information from the database.
#[derive(Debug, Clone)]
pub struct ColumnInfo {
    /// Column name.
    pub name: String,
    /// Data type (e.g., "integer", "character varying", "ARRAY").
    pub data_type: String,
    /// Full UDT name (e.g., "int4", "varchar", "_text").
    pub udt_name: String,
    /// Character maximum length (for varchar, etc.).
    pub character_maximum_length: Option<i32>,
    /// Numeric precision.
    pub numeric_precision: Option<i32>,
    /// Numeric scale.
    pub numeric_scale: Option<i32>,
    /// Whether the column is nullable.
    pub is_nullable: bool,
    /// Default value expression.
    pub column_default: Option<String>,
    /// Ordinal position.
    pub ordinal_position: i32,
}

/// Raw index information from the database.
#[derive(Debug, Clone)]
pub struct IndexInfo {
    /// Index name.
    pub name: String,
    /// Table name.
    pub table_name: String,
    /// Columns in the index, in key order.
    pub columns: Vec<String>,
    /// Whether the index is unique.
    pub is_unique: bool,
    /// Whether this is a primary key index.
    pub is_primary: bool,
    /// Partial index predicate.
    pub predicate: Option<String>,
}

/// Raw function information from the database.
#[derive(Debug, Clone)]
pub struct FunctionInfo {
    /// Function name.
    pub name: String,
    /// Schema the function belongs to.
    pub schema: String,
    /// Free-text argument list as reported by the catalog.
    pub arguments: String,
    /// Result type as reported by the catalog.
    pub return_type: String,
    /// Function body.
    pub body: String,
    /// Language name.
    pub language: String,
    /// `pg_proc.provolatile` code (`i`, `s`, `v`).
    pub volatility: String,
    /// SECURITY DEFINER flag.
    pub is_security_definer: bool,
}

/// Source of raw catalog rows.
#[async_trait::async_trait]
pub trait CatalogReader: Send + Sync {
    /// Get all tables in the schema.
    async fn tables(&self, schema: &str) -> MigrateResult<Vec<TableInfo>>;

    /// Get columns for a table.
    async fn columns(&self, schema: &str, table: &str) -> MigrateResult<Vec<ColumnInfo>>;

    /// Get indexes for a table.
    async fn indexes(&self, schema: &str, table: &str) -> MigrateResult<Vec<IndexInfo>>;

    /// Get stored functions in the schema.
    async fn functions(&self, schema: &str) -> MigrateResult<Vec<FunctionInfo>>;
}

/// Build a snapshot from introspection data.
pub struct SchemaBuilder {
    config: IntrospectionConfig,
    tables: Vec<TableInfo>,
    columns: HashMap<String, Vec<ColumnInfo>>,
    indexes: HashMap<String, Vec<IndexInfo>>,
    functions: Vec<FunctionInfo>,
}

impl SchemaBuilder {
    /// Create a new schema builder.
    pub fn new(config: IntrospectionConfig) -> Self {
        Self {
            config,
            tables: Vec::new(),
            columns: HashMap::new(),
            indexes: HashMap::new(),
            functions: Vec::new(),
        }
    }

    /// Add table information.
    pub fn with_tables(mut self, tables: Vec<TableInfo>) -> Self {
        self.tables = tables;
        self
    }

    /// Add column information for a table.
    pub fn with_columns(mut self, table: &str, columns: Vec<ColumnInfo>) -> Self {
        self.columns.insert(table.to_string(), columns);
        self
    }

    /// Add index information for a table.
    pub fn with_indexes(mut self, table: &str, indexes: Vec<IndexInfo>) -> Self {
        self.indexes.insert(table.to_string(), indexes);
        self
    }

    /// Add function information.
    pub fn with_functions(mut self, functions: Vec<FunctionInfo>) -> Self {
        self.functions = functions;
        self
    }

    /// Build the snapshot from the collected information.
    pub fn build(self) -> IntrospectionResult {
        let mut snapshot = SchemaSnapshot::new(self.config.database_schema.clone());
        let mut skipped_tables = Vec::new();
        let mut warnings = Vec::new();

        for info in &self.tables {
            if !self.config.should_include_table(&info.name) {
                skipped_tables.push(SkippedTable {
                    name: info.name.clone(),
                    reason: "Excluded by configuration".to_string(),
                });
                continue;
            }
            if info.table_type != "BASE TABLE" {
                skipped_tables.push(SkippedTable {
                    name: info.name.clone(),
                    reason: format!("Unsupported relation type '{}'", info.table_type),
                });
                continue;
            }
            snapshot.tables.push(self.build_table(info));
        }

        if self.config.include_functions {
            for info in &self.functions {
                let (function, warning) = build_function(info);
                if let Some(w) = warning {
                    warn!(function = %info.name, "{}", w);
                    warnings.push(w);
                }
                snapshot.functions.push(function);
            }
        }

        snapshot.sort();
        IntrospectionResult {
            snapshot,
            skipped_tables,
            warnings,
        }
    }

    fn build_table(&self, info: &TableInfo) -> Table {
        let mut table = Table::new(&info.schema, &info.name);

        let indexes = self.indexes.get(&info.name).cloned().unwrap_or_default();
        let pk_columns: Vec<&str> = indexes
            .iter()
            .filter(|i| i.is_primary)
            .flat_map(|i| i.columns.iter().map(|c| c.as_str()))
            .collect();

        if let Some(columns) = self.columns.get(&info.name) {
            for col in columns {
                let mut column = build_column(col);
                column.is_primary_key = pk_columns.contains(&col.name.as_str());
                table.columns.push(column);
            }
        }

        for idx in indexes.iter() {
            table.indexes.push(Index {
                name: idx.name.clone(),
                table_name: info.name.clone(),
                columns: idx.columns.clone(),
                is_unique: idx.is_unique,
                is_primary: idx.is_primary,
                where_clause: idx.predicate.clone(),
            });
        }

        table
    }
}

fn build_column(info: &ColumnInfo) -> Column {
    let data_type = match info.data_type.as_str() {
        "ARRAY" => format!("{}[]", normalize_type(info.udt_name.trim_start_matches('_'))),
        "USER-DEFINED" => info.udt_name.clone(),
        other => normalize_type(other),
    };
    let max_length = info.character_maximum_length.filter(|_| takes_length(&data_type));
    let (precision, scale) = if takes_precision(&data_type) {
        (info.numeric_precision, info.numeric_scale)
    } else {
        (None, None)
    };

    Column {
        name: info.name.clone(),
        data_type,
        is_nullable: info.is_nullable,
        default_value: info.column_default.clone(),
        max_length,
        precision,
        scale,
        ordinal_position: info.ordinal_position,
        is_primary_key: false,
    }
}

fn build_function(info: &FunctionInfo) -> (Function, Option<String>) {
    let (parameters, warning) = match parse_arguments(&info.arguments) {
        Ok(params) => (params, None),
        Err(e) => (
            vec![FunctionParameter::unknown(info.arguments.clone())],
            Some(format!(
                "Could not parse arguments of function '{}.{}' ({}); recorded as unknown",
                info.schema, info.name, e
            )),
        ),
    };

    let function = Function {
        name: info.name.clone(),
        schema: info.schema.clone(),
        parameters,
        return_type: info.return_type.clone(),
        body: info.body.clone(),
        language: info.language.clone(),
        volatility: Volatility::from_code(&info.volatility),
        is_security_definer: info.is_security_definer,
    };
    (function, warning)
}

/// Captures snapshots through a [`CatalogReader`].
#[derive(Debug, Clone, Default)]
pub struct SchemaIntrospector {
    config: IntrospectionConfig,
}

impl SchemaIntrospector {
    /// Create an introspector.
    pub fn new(config: IntrospectionConfig) -> Self {
        Self { config }
    }

    /// Get the configuration.
    pub fn config(&self) -> &IntrospectionConfig {
        &self.config
    }

    /// Read the catalog and assemble a snapshot.
    pub async fn capture<R>(&self, reader: &R) -> MigrateResult<IntrospectionResult>
    where
        R: CatalogReader + ?Sized,
    {
        let schema = &self.config.database_schema;
        let tables = reader.tables(schema).await?;
        let mut builder = SchemaBuilder::new(self.config.clone());

        for table in &tables {
            if !self.config.should_include_table(&table.name) {
                continue;
            }
            debug!(table = %table.name, "Introspecting table");
            let columns = reader.columns(schema, &table.name).await?;
            let indexes = reader.indexes(schema, &table.name).await?;
            builder = builder
                .with_columns(&table.name, columns)
                .with_indexes(&table.name, indexes);
        }
        builder = builder.with_tables(tables);

        if self.config.include_functions {
            builder = builder.with_functions(reader.functions(schema).await?);
        }

        let result = builder.build();
        info!(
            schema = %schema,
            tables = result.snapshot.tables.len(),
            functions = result.snapshot.functions.len(),
            warnings = result.warnings.len(),
            captured_at = %Utc::now(),
            "Schema captured"
        );
        Ok(result)
    }
}

/// SQL queries for PostgreSQL introspection.
pub mod postgres_queries {
    /// Query to get all tables and views.
    pub const TABLES: &str = r#"
        SELECT
            table_name,
            table_schema,
            table_type
        FROM information_schema.tables
        WHERE table_schema = $1
        ORDER BY table_name
    "#;

    /// Query to get columns for a table.
    pub const COLUMNS: &str = r#"
        SELECT
            column_name,
            data_type,
            udt_name,
            character_maximum_length,
            numeric_precision,
            numeric_scale,
            is_nullable = 'YES' AS is_nullable,
            column_default,
            ordinal_position
        FROM information_schema.columns
        WHERE table_schema = $1 AND table_name = $2
        ORDER BY ordinal_position
    "#;

    /// Query to get indexes, with key columns in key order.
    pub const INDEXES: &str = r#"
        SELECT
            i.relname AS index_name,
            t.relname AS table_name,
            array_agg(a.attname::text ORDER BY array_position(ix.indkey::int2[], a.attnum)) AS columns,
            ix.indisunique AS is_unique,
            ix.indisprimary AS is_primary,
            pg_get_expr(ix.indpred, ix.indrelid) AS predicate
        FROM pg_index ix
        JOIN pg_class i ON ix.indexrelid = i.oid
        JOIN pg_class t ON ix.indrelid = t.oid
        JOIN pg_namespace n ON t.relnamespace = n.oid
        JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = ANY(ix.indkey)
        WHERE n.nspname = $1 AND t.relname = $2
        GROUP BY i.relname, t.relname, ix.indisunique, ix.indisprimary, ix.indpred, ix.indrelid
        ORDER BY i.relname
    "#;

    /// Query to get plain functions, excluding extension members.
    pub const FUNCTIONS: &str = r#"
        SELECT
            p.proname AS function_name,
            n.nspname AS schema_name,
            pg_get_function_arguments(p.oid) AS arguments,
            pg_get_function_result(p.oid) AS return_type,
            p.prosrc AS body,
            l.lanname AS language,
            p.provolatile::text AS volatility,
            p.prosecdef AS is_security_definer
        FROM pg_proc p
        JOIN pg_namespace n ON p.pronamespace = n.oid
        JOIN pg_language l ON p.prolang = l.oid
        WHERE n.nspname = $1
          AND p.prokind = 'f'
          AND NOT EXISTS (
              SELECT 1 FROM pg_depend d
              WHERE d.objid = p.oid AND d.deptype = 'e'
          )
        ORDER BY p.proname, pg_get_function_arguments(p.oid)
    "#;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryCatalog;
    use crate::model::ParameterMode;
    use pretty_assertions::assert_eq;

    fn column(name: &str, data_type: &str, udt: &str, position: i32) -> ColumnInfo {
        ColumnInfo {
            name: name.to_string(),
            data_type: data_type.to_string(),
            udt_name: udt.to_string(),
            character_maximum_length: None,
            numeric_precision: None,
            numeric_scale: None,
            is_nullable: true,
            column_default: None,
            ordinal_position: position,
        }
    }

    fn table(name: &str) -> TableInfo {
        TableInfo {
            name: name.to_string(),
            schema: "public".to_string(),
            table_type: "BASE TABLE".to_string(),
        }
    }

    fn function(name: &str, arguments: &str) -> FunctionInfo {
        FunctionInfo {
            name: name.to_string(),
            schema: "public".to_string(),
            arguments: arguments.to_string(),
            return_type: "integer".to_string(),
            body: "SELECT 1".to_string(),
            language: "sql".to_string(),
            volatility: "i".to_string(),
            is_security_definer: false,
        }
    }

    #[test]
    fn test_config_should_include_table() {
        let config = IntrospectionConfig::default();
        assert!(config.should_include_table("users"));
        for bookkeeping in BOOKKEEPING_TABLES {
            assert!(!config.should_include_table(bookkeeping));
        }
    }

    #[test]
    fn test_config_include_specific_tables() {
        let config = IntrospectionConfig::new().include_tables(vec!["users".to_string()]);
        assert!(config.should_include_table("users"));
        assert!(!config.should_include_table("posts"));
    }

    #[test]
    fn test_build_columns_and_primary_key() {
        let mut id = column("id", "bigint", "int8", 1);
        id.is_nullable = false;
        id.numeric_precision = Some(64);
        let mut email = column("email", "character varying", "varchar", 2);
        email.character_maximum_length = Some(255);
        let mut price = column("price", "numeric", "numeric", 3);
        price.numeric_precision = Some(10);
        price.numeric_scale = Some(2);
        let tags = column("tags", "ARRAY", "_text", 4);

        let result = SchemaBuilder::new(IntrospectionConfig::default())
            .with_tables(vec![table("items")])
            .with_columns("items", vec![tags, email, id, price])
            .with_indexes(
                "items",
                vec![IndexInfo {
                    name: "items_pkey".to_string(),
                    table_name: "items".to_string(),
                    columns: vec!["id".to_string()],
                    is_unique: true,
                    is_primary: true,
                    predicate: None,
                }],
            )
            .build();

        let items = result.snapshot.table("items").unwrap();
        let names: Vec<_> = items.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["id", "email", "price", "tags"]);
        assert!(items.column("id").unwrap().is_primary_key);
        assert_eq!(items.column("id").unwrap().precision, None);
        assert_eq!(items.column("email").unwrap().sql_type(), "varchar(255)");
        assert_eq!(items.column("price").unwrap().sql_type(), "numeric(10,2)");
        assert_eq!(items.column("tags").unwrap().data_type, "text[]");
    }

    #[test]
    fn test_views_and_excluded_tables_are_skipped() {
        let mut view = table("active_users");
        view.table_type = "VIEW".to_string();

        let result = SchemaBuilder::new(IntrospectionConfig::default())
            .with_tables(vec![table("users"), view, table(BOOKKEEPING_TABLES[0])])
            .build();

        assert_eq!(result.snapshot.tables.len(), 1);
        assert_eq!(result.skipped_tables.len(), 2);
    }

    #[test]
    fn test_unparseable_arguments_degrade_to_unknown() {
        let result = SchemaBuilder::new(IntrospectionConfig::default())
            .with_functions(vec![
                function("good", "a integer, OUT b text"),
                function("bad", "a numeric(10,2"),
            ])
            .build();

        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("public.bad"));

        let bad = &result.snapshot.functions[0];
        assert_eq!(bad.name, "bad");
        assert_eq!(bad.parameters.len(), 1);
        assert_eq!(bad.parameters[0].data_type, "unknown");

        let good = &result.snapshot.functions[1];
        assert_eq!(good.parameters[1].mode, ParameterMode::Out);
        assert_eq!(good.signature(), "public.good(integer)");
        assert_eq!(good.volatility, Volatility::Immutable);
    }

    #[tokio::test]
    async fn test_capture_is_deterministic() {
        let catalog = InMemoryCatalog::new()
            .with_table(table("b_table"), vec![column("x", "integer", "int4", 1)], vec![])
            .with_table(table("a_table"), vec![column("y", "text", "text", 1)], vec![])
            .with_function(function("f", "n integer"));

        let introspector = SchemaIntrospector::default();
        let first = introspector.capture(&catalog).await.unwrap();
        let second = introspector.capture(&catalog).await.unwrap();

        assert_eq!(first.snapshot.tables[0].name, "a_table");
        assert!(first.snapshot.structurally_eq(&second.snapshot));
    }
}
