//! SQL generation for migrations.
//!
//! Generation works on [`SchemaOp`]s rather than text. Each op renders to one
//! PostgreSQL statement and can be replayed onto a [`SchemaSnapshot`], which is
//! how the rollback of an additive change is shown to be its exact inverse.

use tracing::{debug, warn};

use crate::alter::{AlterTableGenerator, ColumnAction, GuardCheck};
use crate::diff::{ChangeSet, TableChanges};
use crate::error::{MigrateResult, MigrationError};
use crate::model::{
    Column, Function, Index, SchemaSnapshot, Table, quote_ident, quote_qualified,
};

/// One structured schema operation.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaOp {
    /// Create a table with its columns and primary key.
    CreateTable(Table),
    /// Drop a table.
    DropTable { schema: String, table: String },
    /// Add a column.
    AddColumn {
        schema: String,
        table: String,
        column: Column,
    },
    /// Drop a column.
    DropColumn {
        schema: String,
        table: String,
        column: String,
    },
    /// Alter a column.
    AlterColumn {
        schema: String,
        table: String,
        column: String,
        action: ColumnAction,
    },
    /// Abort when existing rows violate a narrowed bound.
    Guard {
        schema: String,
        table: String,
        column: String,
        check: GuardCheck,
    },
    /// Create an index (or primary key constraint).
    CreateIndex { schema: String, index: Index },
    /// Drop an index (or primary key constraint).
    DropIndex { schema: String, index: Index },
    /// Create a function.
    CreateFunction(Function),
    /// Replace a function body in place.
    ReplaceFunction(Function),
    /// Drop a function.
    DropFunction(Function),
    /// Placeholder for a step that cannot be generated.
    ManualRestore { object: String, reason: String },
}

impl SchemaOp {
    /// Render to PostgreSQL.
    pub fn render(&self) -> String {
        match self {
            Self::CreateTable(table) => create_table(table),
            Self::DropTable { schema, table } => {
                format!("DROP TABLE IF EXISTS {};", quote_qualified(schema, table))
            }
            Self::AddColumn {
                schema,
                table,
                column,
            } => format!(
                "ALTER TABLE {} ADD COLUMN {};",
                quote_qualified(schema, table),
                column.definition()
            ),
            Self::DropColumn {
                schema,
                table,
                column,
            } => format!(
                "ALTER TABLE {} DROP COLUMN IF EXISTS {};",
                quote_qualified(schema, table),
                quote_ident(column)
            ),
            Self::AlterColumn {
                schema,
                table,
                column,
                action,
            } => format!(
                "ALTER TABLE {} {};",
                quote_qualified(schema, table),
                action.render(column)
            ),
            Self::Guard {
                schema,
                table,
                column,
                check,
            } => check.render(schema, table, column),
            Self::CreateIndex { schema, index } => create_index(schema, index),
            Self::DropIndex { schema, index } => {
                if index.is_primary {
                    format!(
                        "ALTER TABLE {} DROP CONSTRAINT IF EXISTS {};",
                        quote_qualified(schema, &index.table_name),
                        quote_ident(&index.name)
                    )
                } else {
                    format!("DROP INDEX IF EXISTS {};", quote_qualified(schema, &index.name))
                }
            }
            Self::CreateFunction(function) => create_function(function, false),
            Self::ReplaceFunction(function) => create_function(function, true),
            Self::DropFunction(function) => {
                format!("DROP FUNCTION IF EXISTS {};", function.quoted_signature())
            }
            Self::ManualRestore { object, reason } => {
                format!("-- MANUAL RESTORATION REQUIRED: {}\n-- {}", object, reason)
            }
        }
    }

    /// Whether the op can lose data or fail against existing rows.
    pub fn is_destructive(&self) -> bool {
        matches!(
            self,
            Self::DropTable { .. }
                | Self::DropColumn { .. }
                | Self::DropFunction(_)
                | Self::ReplaceFunction(_)
        )
    }

    /// Replay the op onto a snapshot.
    pub fn apply(&self, snapshot: &mut SchemaSnapshot) -> MigrateResult<()> {
        match self {
            Self::CreateTable(table) => {
                if find_table(snapshot, &table.schema, &table.name).is_some() {
                    return Err(MigrationError::schema_conflict(format!(
                        "table {} already exists",
                        table.qualified_name()
                    )));
                }
                let mut created = table.clone();
                created.indexes.retain(|i| i.is_primary);
                snapshot.tables.push(created);
            }
            Self::DropTable { schema, table } => {
                let before = snapshot.tables.len();
                snapshot
                    .tables
                    .retain(|t| !(t.schema == *schema && t.name == *table));
                if snapshot.tables.len() == before {
                    return Err(missing_table(schema, table));
                }
            }
            Self::AddColumn {
                schema,
                table,
                column,
            } => {
                let target = table_mut(snapshot, schema, table)?;
                if target.column(&column.name).is_some() {
                    return Err(MigrationError::schema_conflict(format!(
                        "column {}.{} already exists",
                        target.qualified_name(),
                        column.name
                    )));
                }
                target.columns.push(column.clone());
            }
            Self::DropColumn {
                schema,
                table,
                column,
            } => {
                let target = table_mut(snapshot, schema, table)?;
                target.columns.retain(|c| c.name != *column);
            }
            Self::AlterColumn {
                schema,
                table,
                column,
                action,
            } => {
                let target = table_mut(snapshot, schema, table)?;
                let qualified = target.qualified_name();
                let col = target
                    .columns
                    .iter_mut()
                    .find(|c| c.name == *column)
                    .ok_or_else(|| {
                        MigrationError::schema_conflict(format!(
                            "column {}.{} does not exist",
                            qualified, column
                        ))
                    })?;
                action.apply(col);
            }
            Self::CreateIndex { schema, index } => {
                let target = table_mut(snapshot, schema, &index.table_name)?;
                target.indexes.retain(|i| i.name != index.name);
                target.indexes.push(index.clone());
            }
            Self::DropIndex { schema, index } => {
                let target = table_mut(snapshot, schema, &index.table_name)?;
                target.indexes.retain(|i| i.name != index.name);
            }
            Self::CreateFunction(function) | Self::ReplaceFunction(function) => {
                let signature = function.signature();
                snapshot.functions.retain(|f| f.signature() != signature);
                snapshot.functions.push(function.clone());
            }
            Self::DropFunction(function) => {
                let signature = function.signature();
                snapshot.functions.retain(|f| f.signature() != signature);
            }
            Self::Guard { .. } | Self::ManualRestore { .. } => {}
        }
        Ok(())
    }
}

fn find_table<'a>(snapshot: &'a SchemaSnapshot, schema: &str, name: &str) -> Option<&'a Table> {
    snapshot
        .tables
        .iter()
        .find(|t| t.schema == schema && t.name == name)
}

fn table_mut<'a>(
    snapshot: &'a mut SchemaSnapshot,
    schema: &str,
    name: &str,
) -> MigrateResult<&'a mut Table> {
    snapshot
        .tables
        .iter_mut()
        .find(|t| t.schema == schema && t.name == name)
        .ok_or_else(|| missing_table(schema, name))
}

fn missing_table(schema: &str, name: &str) -> MigrationError {
    MigrationError::schema_conflict(format!("table {}.{} does not exist", schema, name))
}

fn create_table(table: &Table) -> String {
    let mut lines: Vec<String> = table.columns.iter().map(|c| c.definition()).collect();

    let primary = table.indexes.iter().find(|i| i.is_primary);
    let pk_columns: Vec<String> = match primary {
        Some(index) => index.columns.clone(),
        None => table.primary_key().iter().map(|c| c.to_string()).collect(),
    };
    if !pk_columns.is_empty() {
        let cols: Vec<String> = pk_columns.iter().map(|c| quote_ident(c)).collect();
        match primary {
            Some(index) => lines.push(format!(
                "CONSTRAINT {} PRIMARY KEY ({})",
                quote_ident(&index.name),
                cols.join(", ")
            )),
            None => lines.push(format!("PRIMARY KEY ({})", cols.join(", "))),
        }
    }

    format!(
        "CREATE TABLE {} (\n    {}\n);",
        table.quoted_name(),
        lines.join(",\n    ")
    )
}

fn create_index(schema: &str, index: &Index) -> String {
    let cols: Vec<String> = index.columns.iter().map(|c| quote_ident(c)).collect();
    let table = quote_qualified(schema, &index.table_name);

    if index.is_primary {
        return format!(
            "ALTER TABLE {} ADD CONSTRAINT {} PRIMARY KEY ({});",
            table,
            quote_ident(&index.name),
            cols.join(", ")
        );
    }

    let mut sql = format!(
        "CREATE {}INDEX {} ON {} ({})",
        if index.is_unique { "UNIQUE " } else { "" },
        quote_ident(&index.name),
        table,
        cols.join(", ")
    );
    if let Some(predicate) = &index.where_clause {
        sql.push_str(&format!(" WHERE {}", predicate));
    }
    sql.push(';');
    sql
}

fn create_function(function: &Function, replace: bool) -> String {
    let params: Vec<String> = function.parameters.iter().map(|p| p.to_sql()).collect();
    let tag = dollar_tag(&function.body);

    let mut sql = format!(
        "CREATE {}FUNCTION {}({})\nRETURNS {}\nLANGUAGE {}\n{}",
        if replace { "OR REPLACE " } else { "" },
        quote_qualified(&function.schema, &function.name),
        params.join(", "),
        function.return_type,
        function.language,
        function.volatility.to_sql()
    );
    if function.is_security_definer {
        sql.push_str("\nSECURITY DEFINER");
    }
    sql.push_str(&format!("\nAS {}{}{};", tag, function.body, tag));
    sql
}

/// Pick a dollar-quote tag that does not occur in the body.
fn dollar_tag(body: &str) -> String {
    let mut tag = "$function$".to_string();
    let mut n = 0;
    while body.contains(&tag) {
        n += 1;
        tag = format!("$function_{}$", n);
    }
    tag
}

/// Result of generating a migration from a change set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeneratedMigration {
    /// Forward operations in execution order.
    pub up_ops: Vec<SchemaOp>,
    /// Rollback operations in execution order.
    pub down_ops: Vec<SchemaOp>,
    /// One entry per destructive or lossy operation.
    pub warnings: Vec<String>,
}

impl GeneratedMigration {
    /// Forward SQL script.
    pub fn up_sql(&self) -> String {
        render_all(&self.up_ops)
    }

    /// Rollback SQL script.
    pub fn down_sql(&self) -> String {
        render_all(&self.down_ops)
    }

    /// Check if the migration is empty.
    pub fn is_empty(&self) -> bool {
        self.up_ops.is_empty()
    }
}

fn render_all(ops: &[SchemaOp]) -> String {
    ops.iter()
        .map(|op| op.render())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// One logical change with its inverse.
struct Step {
    up: Vec<SchemaOp>,
    down: Vec<SchemaOp>,
}

impl Step {
    fn new(up: Vec<SchemaOp>, down: Vec<SchemaOp>) -> Self {
        Self { up, down }
    }
}

/// SQL generator for PostgreSQL.
#[derive(Debug, Clone, Copy, Default)]
pub struct MigrationGenerator;

impl MigrationGenerator {
    /// Generate forward and rollback operations for a change set.
    pub fn generate(&self, changes: &ChangeSet) -> GeneratedMigration {
        let mut steps = Vec::new();
        let mut warnings = Vec::new();

        // Creates
        for table in &changes.new_tables {
            steps.push(self.create_table_step(table));
        }
        for table in &changes.modified_tables {
            for column in &table.added_columns {
                steps.push(Step::new(
                    vec![SchemaOp::AddColumn {
                        schema: table.schema.clone(),
                        table: table.table_name.clone(),
                        column: column.clone(),
                    }],
                    vec![SchemaOp::DropColumn {
                        schema: table.schema.clone(),
                        table: table.table_name.clone(),
                        column: column.name.clone(),
                    }],
                ));
            }
            for index in added_only(table) {
                steps.push(Step::new(
                    vec![create_index_op(&table.schema, index)],
                    vec![drop_index_op(&table.schema, index)],
                ));
            }
        }
        for function in &changes.new_functions {
            steps.push(Step::new(
                vec![SchemaOp::CreateFunction(function.clone())],
                vec![SchemaOp::DropFunction(function.clone())],
            ));
        }

        // Alters
        for table in &changes.modified_tables {
            let generator = AlterTableGenerator::new(&table.schema, &table.table_name);
            for diff in &table.modified_columns {
                for modification in diff.modifications.iter().filter(|m| m.is_destructive) {
                    warnings.push(format!(
                        "Column {}.{}.{}: {} is destructive and may fail or lose data",
                        table.schema, table.table_name, diff.name, modification.change
                    ));
                }
                steps.push(Step::new(
                    generator.forward(&diff.old, &diff.modifications),
                    generator.rollback(&diff.new, &diff.modifications),
                ));
            }
            for (old, new) in rebuilt_indexes(table) {
                steps.push(Step::new(
                    vec![drop_index_op(&table.schema, old), create_index_op(&table.schema, new)],
                    vec![drop_index_op(&table.schema, new), create_index_op(&table.schema, old)],
                ));
            }
        }
        for function in &changes.modified_functions {
            let signature = function.signature();
            warnings.push(format!(
                "Function {} is replaced; its previous definition is not retained and rollback requires manual restoration",
                signature
            ));
            steps.push(Step::new(
                vec![SchemaOp::ReplaceFunction(function.clone())],
                vec![SchemaOp::ManualRestore {
                    object: format!("function {}", signature),
                    reason: "the definition before this migration was not captured; restore it by hand"
                        .to_string(),
                }],
            ));
        }

        // Drops
        for table in &changes.modified_tables {
            for index in dropped_only(table) {
                steps.push(Step::new(
                    vec![drop_index_op(&table.schema, index)],
                    vec![create_index_op(&table.schema, index)],
                ));
            }
        }
        for table in &changes.modified_tables {
            for column in &table.dropped_columns {
                warnings.push(format!(
                    "Dropping column {}.{}.{} deletes its data; rollback recreates it empty",
                    table.schema, table.table_name, column.name
                ));
                steps.push(Step::new(
                    vec![SchemaOp::DropColumn {
                        schema: table.schema.clone(),
                        table: table.table_name.clone(),
                        column: column.name.clone(),
                    }],
                    vec![SchemaOp::AddColumn {
                        schema: table.schema.clone(),
                        table: table.table_name.clone(),
                        column: column.clone(),
                    }],
                ));
            }
        }
        for function in &changes.deleted_functions {
            warnings.push(format!("Dropping function {}", function.signature()));
            steps.push(Step::new(
                vec![SchemaOp::DropFunction(function.clone())],
                vec![SchemaOp::CreateFunction(function.clone())],
            ));
        }
        for table in &changes.deleted_tables {
            warnings.push(format!(
                "Dropping table {} deletes all of its rows; rollback recreates the structure only",
                table.qualified_name()
            ));
            let create = self.create_table_step(table);
            let mut drop: Vec<SchemaOp> = table
                .indexes
                .iter()
                .filter(|i| !i.is_primary)
                .map(|i| drop_index_op(&table.schema, i))
                .collect();
            drop.extend(create.down);
            steps.push(Step::new(drop, create.up));
        }

        let up_ops: Vec<SchemaOp> = steps.iter().flat_map(|s| s.up.iter().cloned()).collect();
        let down_ops: Vec<SchemaOp> = steps
            .iter()
            .rev()
            .flat_map(|s| s.down.iter().cloned())
            .collect();

        for warning in &warnings {
            warn!("{}", warning);
        }
        debug!(
            up = up_ops.len(),
            down = down_ops.len(),
            warnings = warnings.len(),
            "Generated migration"
        );

        GeneratedMigration {
            up_ops,
            down_ops,
            warnings,
        }
    }

    fn create_table_step(&self, table: &Table) -> Step {
        let mut up = vec![SchemaOp::CreateTable(table.clone())];
        for index in table.indexes.iter().filter(|i| !i.is_primary) {
            up.push(create_index_op(&table.schema, index));
        }
        Step::new(
            up,
            vec![SchemaOp::DropTable {
                schema: table.schema.clone(),
                table: table.name.clone(),
            }],
        )
    }
}

fn create_index_op(schema: &str, index: &Index) -> SchemaOp {
    SchemaOp::CreateIndex {
        schema: schema.to_string(),
        index: index.clone(),
    }
}

fn drop_index_op(schema: &str, index: &Index) -> SchemaOp {
    SchemaOp::DropIndex {
        schema: schema.to_string(),
        index: index.clone(),
    }
}

fn added_only(table: &TableChanges) -> impl Iterator<Item = &Index> {
    table
        .added_indexes
        .iter()
        .filter(|i| !table.dropped_indexes.iter().any(|d| d.name == i.name))
}

fn dropped_only(table: &TableChanges) -> impl Iterator<Item = &Index> {
    table
        .dropped_indexes
        .iter()
        .filter(|i| !table.added_indexes.iter().any(|a| a.name == i.name))
}

fn rebuilt_indexes(table: &TableChanges) -> impl Iterator<Item = (&Index, &Index)> {
    table.dropped_indexes.iter().filter_map(|old| {
        table
            .added_indexes
            .iter()
            .find(|new| new.name == old.name)
            .map(|new| (old, new))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::ChangeDetector;
    use crate::model::{FunctionParameter, Volatility};
    use pretty_assertions::assert_eq;

    fn users() -> Table {
        Table::new("public", "users")
            .with_column(Column::new("id", "bigint").primary_key())
            .with_column(Column::new("email", "varchar").max_length(255).not_null())
            .with_index(Index::new("users_pkey", "users", ["id"]).primary())
    }

    fn posts() -> Table {
        Table::new("public", "posts")
            .with_column(Column::new("id", "bigint").primary_key())
            .with_column(Column::new("title", "text").not_null())
            .with_index(Index::new("posts_title_idx", "posts", ["title"]))
    }

    fn snapshot(tables: Vec<Table>, functions: Vec<Function>) -> SchemaSnapshot {
        let mut s = SchemaSnapshot::new("public");
        s.tables = tables;
        s.functions = functions;
        s
    }

    #[test]
    fn test_create_table_render() {
        let sql = SchemaOp::CreateTable(users()).render();
        assert_eq!(
            sql,
            "CREATE TABLE \"public\".\"users\" (\n    \"id\" bigint NOT NULL,\n    \"email\" varchar(255) NOT NULL,\n    CONSTRAINT \"users_pkey\" PRIMARY KEY (\"id\")\n);"
        );
    }

    #[test]
    fn test_function_render() {
        let f = Function::new("public", "add_one")
            .param(FunctionParameter::new("n", "integer"))
            .returns("integer")
            .body("SELECT n + 1")
            .volatility(Volatility::Immutable)
            .security_definer();
        assert_eq!(
            SchemaOp::CreateFunction(f.clone()).render(),
            "CREATE FUNCTION \"public\".\"add_one\"(\"n\" integer)\nRETURNS integer\nLANGUAGE sql\nIMMUTABLE\nSECURITY DEFINER\nAS $function$SELECT n + 1$function$;"
        );
        assert_eq!(
            SchemaOp::DropFunction(f).render(),
            "DROP FUNCTION IF EXISTS \"public\".\"add_one\"(integer);"
        );
    }

    #[test]
    fn test_dollar_tag_avoids_body() {
        assert_eq!(dollar_tag("SELECT 1"), "$function$");
        assert_eq!(dollar_tag("x $function$ y"), "$function_1$");
    }

    #[test]
    fn test_up_order_creates_alters_drops() {
        let mut narrowed = users();
        narrowed.columns[1].max_length = Some(100);
        let narrowed = narrowed.with_column(Column::new("name", "text"));

        let baseline = snapshot(vec![users(), posts()], vec![]);
        let current = snapshot(vec![narrowed, Table::new("public", "tags")], vec![]);

        let migration = MigrationGenerator.generate(&ChangeDetector::detect(&baseline, &current));
        let kinds: Vec<&str> = migration
            .up_ops
            .iter()
            .map(|op| match op {
                SchemaOp::CreateTable(_) => "create_table",
                SchemaOp::AddColumn { .. } => "add_column",
                SchemaOp::Guard { .. } => "guard",
                SchemaOp::AlterColumn { .. } => "alter_column",
                SchemaOp::DropIndex { .. } => "drop_index",
                SchemaOp::DropTable { .. } => "drop_table",
                _ => "other",
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                "create_table",
                "add_column",
                "guard",
                "alter_column",
                "drop_index",
                "drop_table"
            ]
        );
        assert!(migration.up_sql().contains("LENGTH(\"email\") > 100"));
        assert_eq!(migration.warnings.len(), 2);
    }

    #[test]
    fn test_down_is_reverse_of_steps() {
        let baseline = snapshot(vec![users(), posts()], vec![]);
        let current = snapshot(vec![users()], vec![]);

        let migration = MigrationGenerator.generate(&ChangeDetector::detect(&baseline, &current));
        assert_eq!(
            migration.up_sql(),
            "DROP INDEX IF EXISTS \"public\".\"posts_title_idx\";\n\nDROP TABLE IF EXISTS \"public\".\"posts\";"
        );
        assert!(matches!(migration.down_ops[0], SchemaOp::CreateTable(_)));
        assert!(matches!(migration.down_ops[1], SchemaOp::CreateIndex { .. }));
        assert!(migration.warnings[0].contains("public.posts"));
    }

    #[test]
    fn test_function_replacement_needs_manual_restore() {
        let f = Function::new("public", "f").body("SELECT 1");
        let baseline = snapshot(vec![], vec![f.clone()]);
        let current = snapshot(vec![], vec![f.body("SELECT 2")]);

        let migration = MigrationGenerator.generate(&ChangeDetector::detect(&baseline, &current));
        assert!(migration.up_sql().starts_with("CREATE OR REPLACE FUNCTION"));
        assert!(migration.down_sql().starts_with("-- MANUAL RESTORATION REQUIRED"));
        assert_eq!(migration.warnings.len(), 1);
    }

    #[test]
    fn test_changed_index_is_rebuilt_in_place() {
        let mut unique = posts();
        unique.indexes[0].is_unique = true;
        let baseline = snapshot(vec![posts()], vec![]);
        let current = snapshot(vec![unique], vec![]);

        let migration = MigrationGenerator.generate(&ChangeDetector::detect(&baseline, &current));
        let up = migration.up_sql();
        let drop_at = up.find("DROP INDEX").unwrap();
        let create_at = up.find("CREATE UNIQUE INDEX").unwrap();
        assert!(drop_at < create_at);

        let mut replayed = baseline.clone();
        for op in &migration.up_ops {
            op.apply(&mut replayed).unwrap();
        }
        assert!(replayed.structurally_eq(&current));
    }

    #[test]
    fn test_additive_round_trip() {
        let baseline = snapshot(vec![users()], vec![]);
        let extended = users()
            .with_column(Column::new("nickname", "varchar").max_length(40))
            .with_index(Index::new("users_email_key", "users", ["email"]).unique());
        let current = snapshot(
            vec![extended, posts()],
            vec![Function::new("public", "noop")],
        );

        let migration = MigrationGenerator.generate(&ChangeDetector::detect(&baseline, &current));
        assert!(migration.warnings.is_empty());

        let mut forward = baseline.clone();
        for op in &migration.up_ops {
            op.apply(&mut forward).unwrap();
        }
        assert!(forward.structurally_eq(&current));

        for op in &migration.down_ops {
            op.apply(&mut forward).unwrap();
        }
        assert!(forward.structurally_eq(&baseline));
    }

    fn users_json(email_type: &str, length: i32) -> SchemaSnapshot {
        SchemaSnapshot::from_json(&format!(
            r#"{{
                "captured_at": "2024-01-01T00:00:00Z",
                "schema_name": "public",
                "tables": [{{
                    "name": "users",
                    "schema": "public",
                    "columns": [
                        {{"name": "id", "data_type": "bigint", "is_nullable": false, "ordinal_position": 1}},
                        {{"name": "email", "data_type": "{}", "is_nullable": false,
                          "max_length": {}, "ordinal_position": 2}}
                    ]
                }}]
            }}"#,
            email_type, length
        ))
        .unwrap()
    }

    #[test]
    fn test_narrowing_from_long_type_spelling_is_guarded() {
        let baseline = users_json("character varying", 255);
        let current = users_json("character varying", 50);

        let changes = ChangeDetector::detect(&baseline, &current);
        assert!(changes.has_destructive_changes());

        let migration = MigrationGenerator.generate(&changes);
        let up = migration.up_sql();
        assert!(up.contains("LENGTH(\"email\") > 50"));
        assert!(up.contains("ALTER COLUMN \"email\" TYPE varchar(50);"));
        assert!(migration.down_sql().contains("ALTER COLUMN \"email\" TYPE varchar(255);"));
    }

    #[test]
    fn test_apply_reports_missing_table() {
        let mut s = snapshot(vec![], vec![]);
        let err = SchemaOp::DropTable {
            schema: "public".into(),
            table: "nope".into(),
        }
        .apply(&mut s)
        .unwrap_err();
        assert!(matches!(err, MigrationError::SchemaConflict(_)));
    }
}
