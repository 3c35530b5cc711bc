//! Schema model: tables, columns, indexes, functions and snapshots.
//!
//! A [`SchemaSnapshot`] is the unit everything else works on. The introspector
//! produces one from a live database, a baseline file stores one on disk, and
//! the change detector compares two of them.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{MigrateResult, MigrationError};

/// Point-in-time structure of one database schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    /// When the snapshot was captured.
    pub captured_at: DateTime<Utc>,
    /// Database schema name (e.g. `public`).
    pub schema_name: String,
    /// Tables in the schema.
    #[serde(default)]
    pub tables: Vec<Table>,
    /// Stored functions in the schema.
    #[serde(default)]
    pub functions: Vec<Function>,
}

impl SchemaSnapshot {
    /// Create an empty snapshot captured now.
    pub fn new(schema_name: impl Into<String>) -> Self {
        Self {
            captured_at: Utc::now(),
            schema_name: schema_name.into(),
            tables: Vec::new(),
            functions: Vec::new(),
        }
    }

    /// Add a table.
    pub fn with_table(mut self, table: Table) -> Self {
        self.tables.push(table);
        self
    }

    /// Add a function.
    pub fn with_function(mut self, function: Function) -> Self {
        self.functions.push(function);
        self
    }

    /// Find a table by name.
    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Find a table by name, mutably.
    pub fn table_mut(&mut self, name: &str) -> Option<&mut Table> {
        self.tables.iter_mut().find(|t| t.name == name)
    }

    /// Find a function by signature.
    pub fn function(&self, signature: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.signature() == signature)
    }

    /// Put tables, columns, indexes and functions into canonical order.
    pub fn sort(&mut self) {
        self.tables.sort_by(|a, b| a.qualified_name().cmp(&b.qualified_name()));
        for table in &mut self.tables {
            table.sort();
        }
        self.functions.sort_by_key(|f| f.signature());
    }

    /// Compare structure, ignoring capture time and element order.
    pub fn structurally_eq(&self, other: &SchemaSnapshot) -> bool {
        let mut a = self.clone();
        let mut b = other.clone();
        a.sort();
        b.sort();
        a.schema_name == b.schema_name && a.tables == b.tables && a.functions == b.functions
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> MigrateResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> MigrateResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Persist the snapshot as a baseline document.
    pub async fn save(&self, path: impl AsRef<Path>) -> MigrateResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(path, self.to_json()?).await?;
        tracing::info!(path = %path.display(), tables = self.tables.len(), "Baseline saved");
        Ok(())
    }

    /// Load a baseline document.
    pub async fn load(path: impl AsRef<Path>) -> MigrateResult<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            MigrationError::Io(std::io::Error::new(
                e.kind(),
                format!("failed to read baseline {}: {}", path.display(), e),
            ))
        })?;
        Self::from_json(&content)
    }
}

/// One relation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    /// Table name.
    pub name: String,
    /// Owning schema.
    pub schema: String,
    /// Columns in ordinal order.
    #[serde(default)]
    pub columns: Vec<Column>,
    /// Indexes on the table.
    #[serde(default)]
    pub indexes: Vec<Index>,
}

impl Table {
    /// Create an empty table in the given schema.
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schema: schema.into(),
            columns: Vec::new(),
            indexes: Vec::new(),
        }
    }

    /// Add a column, assigning the next ordinal position when it has none.
    pub fn with_column(mut self, mut column: Column) -> Self {
        if column.ordinal_position == 0 {
            column.ordinal_position = self.columns.len() as i32 + 1;
        }
        self.columns.push(column);
        self
    }

    /// Add an index, binding it to this table.
    pub fn with_index(mut self, mut index: Index) -> Self {
        index.table_name = self.name.clone();
        self.indexes.push(index);
        self
    }

    /// `schema.name`.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    /// Quoted `"schema"."name"` for SQL.
    pub fn quoted_name(&self) -> String {
        quote_qualified(&self.schema, &self.name)
    }

    /// Find a column by name.
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Find an index by name.
    pub fn index(&self, name: &str) -> Option<&Index> {
        self.indexes.iter().find(|i| i.name == name)
    }

    /// Primary key column names in ordinal order.
    pub fn primary_key(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.is_primary_key)
            .map(|c| c.name.as_str())
            .collect()
    }

    /// Sort columns by ordinal position and indexes by name.
    pub fn sort(&mut self) {
        self.columns
            .sort_by(|a, b| a.ordinal_position.cmp(&b.ordinal_position).then(a.name.cmp(&b.name)));
        self.indexes.sort_by(|a, b| a.name.cmp(&b.name));
    }
}

/// One table attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    /// Column name.
    pub name: String,
    /// Normalized base type name (see [`normalize_type`]).
    #[serde(deserialize_with = "deserialize_type")]
    pub data_type: String,
    /// Whether NULL is allowed.
    pub is_nullable: bool,
    /// Default expression.
    #[serde(default)]
    pub default_value: Option<String>,
    /// Character length bound.
    #[serde(default)]
    pub max_length: Option<i32>,
    /// Numeric precision.
    #[serde(default)]
    pub precision: Option<i32>,
    /// Numeric scale.
    #[serde(default)]
    pub scale: Option<i32>,
    /// 1-based position within the table.
    pub ordinal_position: i32,
    /// Whether the column belongs to the primary key.
    #[serde(default)]
    pub is_primary_key: bool,
}

impl Column {
    /// Create a nullable column with the given type.
    pub fn new(name: impl Into<String>, data_type: impl AsRef<str>) -> Self {
        Self {
            name: name.into(),
            data_type: normalize_type(data_type.as_ref()),
            is_nullable: true,
            default_value: None,
            max_length: None,
            precision: None,
            scale: None,
            ordinal_position: 0,
            is_primary_key: false,
        }
    }

    /// Mark as NOT NULL.
    pub fn not_null(mut self) -> Self {
        self.is_nullable = false;
        self
    }

    /// Mark as primary key (implies NOT NULL).
    pub fn primary_key(mut self) -> Self {
        self.is_primary_key = true;
        self.is_nullable = false;
        self
    }

    /// Set the default expression.
    pub fn default_value(mut self, expr: impl Into<String>) -> Self {
        self.default_value = Some(expr.into());
        self
    }

    /// Set the character length bound.
    pub fn max_length(mut self, length: i32) -> Self {
        self.max_length = Some(length);
        self
    }

    /// Set numeric precision and scale.
    pub fn numeric(mut self, precision: i32, scale: i32) -> Self {
        self.precision = Some(precision);
        self.scale = Some(scale);
        self
    }

    /// Set the ordinal position.
    pub fn position(mut self, position: i32) -> Self {
        self.ordinal_position = position;
        self
    }

    /// Render the full SQL type including modifiers.
    pub fn sql_type(&self) -> String {
        render_type(&self.data_type, self.max_length, self.precision, self.scale)
    }

    /// Column definition as used in CREATE TABLE / ADD COLUMN.
    pub fn definition(&self) -> String {
        let mut parts = vec![quote_ident(&self.name), self.sql_type()];
        if !self.is_nullable {
            parts.push("NOT NULL".to_string());
        }
        if let Some(default) = self.default_value.as_deref().filter(|d| !d.trim().is_empty()) {
            parts.push(format!("DEFAULT {}", default));
        }
        parts.join(" ")
    }
}

/// One index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    /// Index name.
    pub name: String,
    /// Owning table.
    pub table_name: String,
    /// Indexed columns, in key order.
    pub columns: Vec<String>,
    /// UNIQUE index.
    #[serde(default)]
    pub is_unique: bool,
    /// Backs the primary key.
    #[serde(default)]
    pub is_primary: bool,
    /// Partial index predicate.
    #[serde(default)]
    pub where_clause: Option<String>,
}

impl Index {
    /// Create a non-unique index.
    pub fn new(
        name: impl Into<String>,
        table_name: impl Into<String>,
        columns: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            name: name.into(),
            table_name: table_name.into(),
            columns: columns.into_iter().map(Into::into).collect(),
            is_unique: false,
            is_primary: false,
            where_clause: None,
        }
    }

    /// Mark as unique.
    pub fn unique(mut self) -> Self {
        self.is_unique = true;
        self
    }

    /// Mark as the primary key index.
    pub fn primary(mut self) -> Self {
        self.is_primary = true;
        self.is_unique = true;
        self
    }

    /// Set a partial index predicate.
    pub fn where_clause(mut self, predicate: impl Into<String>) -> Self {
        self.where_clause = Some(predicate.into());
        self
    }
}

/// Parameter mode of a function argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ParameterMode {
    /// Input argument.
    #[default]
    In,
    /// Output column; not part of the call signature.
    Out,
    /// Both input and output.
    InOut,
    /// Trailing variadic array.
    Variadic,
}

impl ParameterMode {
    /// SQL keyword for the mode.
    pub fn to_sql(&self) -> &'static str {
        match self {
            Self::In => "IN",
            Self::Out => "OUT",
            Self::InOut => "INOUT",
            Self::Variadic => "VARIADIC",
        }
    }

    /// Whether the parameter contributes to the call signature.
    pub fn is_input(&self) -> bool {
        !matches!(self, Self::Out)
    }
}

/// One function argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionParameter {
    /// Argument name, if declared.
    #[serde(default)]
    pub name: Option<String>,
    /// Argument mode.
    #[serde(default)]
    pub mode: ParameterMode,
    /// Argument type as written in the catalog.
    pub data_type: String,
    /// Default expression.
    #[serde(default)]
    pub default: Option<String>,
}

impl FunctionParameter {
    /// An IN parameter.
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            mode: ParameterMode::In,
            data_type: data_type.into(),
            default: None,
        }
    }

    /// Placeholder used when the catalog argument text cannot be parsed.
    pub fn unknown(raw: impl Into<String>) -> Self {
        Self {
            name: None,
            mode: ParameterMode::In,
            data_type: "unknown".to_string(),
            default: Some(raw.into()),
        }
    }

    /// Set the mode.
    pub fn mode(mut self, mode: ParameterMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the default.
    pub fn default_value(mut self, expr: impl Into<String>) -> Self {
        self.default = Some(expr.into());
        self
    }

    /// Render as a CREATE FUNCTION argument.
    pub fn to_sql(&self) -> String {
        let mut parts = Vec::new();
        if self.mode != ParameterMode::In {
            parts.push(self.mode.to_sql().to_string());
        }
        if let Some(name) = &self.name {
            parts.push(quote_ident(name));
        }
        parts.push(self.data_type.clone());
        if let Some(default) = &self.default {
            parts.push(format!("DEFAULT {}", default));
        }
        parts.join(" ")
    }
}

/// Function volatility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Volatility {
    /// May return different results for the same input.
    #[default]
    Volatile,
    /// Same result within one statement.
    Stable,
    /// Same result forever for the same input.
    Immutable,
}

impl Volatility {
    /// Get SQL volatility string.
    pub fn to_sql(&self) -> &'static str {
        match self {
            Self::Volatile => "VOLATILE",
            Self::Stable => "STABLE",
            Self::Immutable => "IMMUTABLE",
        }
    }

    /// Map the `pg_proc.provolatile` code.
    pub fn from_code(code: &str) -> Self {
        match code {
            "i" => Self::Immutable,
            "s" => Self::Stable,
            _ => Self::Volatile,
        }
    }
}

/// One stored routine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Function {
    /// Function name.
    pub name: String,
    /// Owning schema.
    pub schema: String,
    /// Arguments in declaration order.
    #[serde(default)]
    pub parameters: Vec<FunctionParameter>,
    /// Declared return type (`void`, `trigger`, `SETOF x`, `TABLE(...)`).
    pub return_type: String,
    /// Function body.
    pub body: String,
    /// Implementation language (`sql`, `plpgsql`).
    pub language: String,
    /// Volatility class.
    #[serde(default)]
    pub volatility: Volatility,
    /// Runs with the privileges of the owner.
    #[serde(default)]
    pub is_security_definer: bool,
}

impl Function {
    /// Create a volatile SQL function returning `void` with an empty body.
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schema: schema.into(),
            parameters: Vec::new(),
            return_type: "void".to_string(),
            body: String::new(),
            language: "sql".to_string(),
            volatility: Volatility::Volatile,
            is_security_definer: false,
        }
    }

    /// Add a parameter.
    pub fn param(mut self, parameter: FunctionParameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    /// Set the return type.
    pub fn returns(mut self, return_type: impl Into<String>) -> Self {
        self.return_type = return_type.into();
        self
    }

    /// Set the language.
    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    /// Set the body.
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Set the volatility.
    pub fn volatility(mut self, volatility: Volatility) -> Self {
        self.volatility = volatility;
        self
    }

    /// Mark as SECURITY DEFINER.
    pub fn security_definer(mut self) -> Self {
        self.is_security_definer = true;
        self
    }

    /// Whether the function is VOLATILE.
    pub fn is_volatile(&self) -> bool {
        self.volatility == Volatility::Volatile
    }

    /// Identity used for reconciliation: `schema.name(type, ...)` over input arguments.
    pub fn signature(&self) -> String {
        format!("{}.{}({})", self.schema, self.name, self.argument_types().join(", "))
    }

    /// Quoted call signature for DROP FUNCTION.
    pub fn quoted_signature(&self) -> String {
        format!(
            "{}({})",
            quote_qualified(&self.schema, &self.name),
            self.argument_types().join(", ")
        )
    }

    fn argument_types(&self) -> Vec<&str> {
        self.parameters
            .iter()
            .filter(|p| p.mode.is_input())
            .map(|p| p.data_type.as_str())
            .collect()
    }
}

/// Quote an identifier for PostgreSQL.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a schema-qualified identifier.
pub fn quote_qualified(schema: &str, name: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(name))
}

/// Normalize a PostgreSQL type name to its canonical short spelling.
pub fn normalize_type(raw: &str) -> String {
    let lowered = raw.trim().to_ascii_lowercase();
    let collapsed = lowered.split_whitespace().collect::<Vec<_>>().join(" ");
    let canonical = match collapsed.as_str() {
        "character varying" | "varchar" => "varchar",
        "character" | "char" | "bpchar" => "char",
        "int" | "int4" | "integer" => "integer",
        "int2" | "smallint" => "smallint",
        "int8" | "bigint" => "bigint",
        "float4" | "real" => "real",
        "float8" | "double precision" => "double precision",
        "decimal" | "numeric" => "numeric",
        "bool" | "boolean" => "boolean",
        "timestamp" | "timestamp without time zone" => "timestamp",
        "timestamptz" | "timestamp with time zone" => "timestamptz",
        "time" | "time without time zone" => "time",
        "timetz" | "time with time zone" => "timetz",
        other => other,
    };
    canonical.to_string()
}

fn deserialize_type<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let raw = String::deserialize(deserializer)?;
    Ok(normalize_type(&raw))
}

/// Whether a type accepts a length modifier.
pub fn takes_length(data_type: &str) -> bool {
    matches!(
        normalize_type(data_type).as_str(),
        "varchar" | "char" | "bit" | "varbit"
    )
}

/// Whether a type accepts precision/scale modifiers.
pub fn takes_precision(data_type: &str) -> bool {
    normalize_type(data_type) == "numeric"
}

/// Render a type name with its modifiers.
///
/// Types that carry a modifier are rendered under their canonical name.
pub fn render_type(
    data_type: &str,
    max_length: Option<i32>,
    precision: Option<i32>,
    scale: Option<i32>,
) -> String {
    let base = normalize_type(data_type);
    if takes_length(&base) {
        if let Some(length) = max_length {
            return format!("{}({})", base, length);
        }
    }
    if takes_precision(&base) {
        match (precision, scale) {
            (Some(p), Some(s)) => return format!("{}({},{})", base, p, s),
            (Some(p), None) => return format!("{}({})", base, p),
            _ => {}
        }
    }
    data_type.to_string()
}
