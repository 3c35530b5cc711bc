//! Change detection between two schema snapshots.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::{Column, Function, Index, SchemaSnapshot, Table, normalize_type, quote_qualified};

/// Differences between a baseline and a current snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    /// Tables present only in the current snapshot.
    pub new_tables: Vec<Table>,
    /// Tables present only in the baseline, with their full definition.
    pub deleted_tables: Vec<Table>,
    /// Tables present in both with differences.
    pub modified_tables: Vec<TableChanges>,
    /// Functions present only in the current snapshot.
    pub new_functions: Vec<Function>,
    /// Functions present only in the baseline.
    pub deleted_functions: Vec<Function>,
    /// Functions whose definition changed. Only the new definition is kept.
    pub modified_functions: Vec<Function>,
}

impl ChangeSet {
    /// Check if there are any differences.
    pub fn is_empty(&self) -> bool {
        self.new_tables.is_empty()
            && self.deleted_tables.is_empty()
            && self.modified_tables.is_empty()
            && self.new_functions.is_empty()
            && self.deleted_functions.is_empty()
            && self.modified_functions.is_empty()
    }

    /// Whether applying the change set can lose data or fail against existing rows.
    pub fn has_destructive_changes(&self) -> bool {
        !self.deleted_tables.is_empty()
            || !self.deleted_functions.is_empty()
            || !self.modified_functions.is_empty()
            || self.modified_tables.iter().any(|t| t.has_destructive_changes())
    }

    /// Get a human-readable summary of the change set.
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();

        if !self.new_tables.is_empty() {
            parts.push(format!("Create {} tables", self.new_tables.len()));
        }
        if !self.deleted_tables.is_empty() {
            parts.push(format!("Drop {} tables", self.deleted_tables.len()));
        }
        if !self.modified_tables.is_empty() {
            parts.push(format!("Alter {} tables", self.modified_tables.len()));
        }
        if !self.new_functions.is_empty() {
            parts.push(format!("Create {} functions", self.new_functions.len()));
        }
        if !self.deleted_functions.is_empty() {
            parts.push(format!("Drop {} functions", self.deleted_functions.len()));
        }
        if !self.modified_functions.is_empty() {
            parts.push(format!("Replace {} functions", self.modified_functions.len()));
        }

        if parts.is_empty() {
            "No changes".to_string()
        } else {
            parts.join(", ")
        }
    }
}

/// Differences within one table present in both snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableChanges {
    /// Table name.
    pub table_name: String,
    /// Owning schema.
    pub schema: String,
    /// Columns to add.
    pub added_columns: Vec<Column>,
    /// Columns to drop, with their full definition.
    pub dropped_columns: Vec<Column>,
    /// Columns present in both with differences.
    pub modified_columns: Vec<ColumnDiff>,
    /// Indexes to add (including re-adds of changed indexes).
    pub added_indexes: Vec<Index>,
    /// Indexes to drop (including the old side of changed indexes).
    pub dropped_indexes: Vec<Index>,
}

impl TableChanges {
    fn new(schema: &str, table_name: &str) -> Self {
        Self {
            table_name: table_name.to_string(),
            schema: schema.to_string(),
            added_columns: Vec::new(),
            dropped_columns: Vec::new(),
            modified_columns: Vec::new(),
            added_indexes: Vec::new(),
            dropped_indexes: Vec::new(),
        }
    }

    /// Quoted `"schema"."table"`.
    pub fn quoted_name(&self) -> String {
        quote_qualified(&self.schema, &self.table_name)
    }

    /// Check if there are any differences.
    pub fn is_empty(&self) -> bool {
        self.added_columns.is_empty()
            && self.dropped_columns.is_empty()
            && self.modified_columns.is_empty()
            && self.added_indexes.is_empty()
            && self.dropped_indexes.is_empty()
    }

    /// Whether any change here is destructive.
    pub fn has_destructive_changes(&self) -> bool {
        !self.dropped_columns.is_empty()
            || self
                .modified_columns
                .iter()
                .any(|c| c.modifications.iter().any(|m| m.is_destructive))
    }
}

/// A column present in both snapshots with at least one differing attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDiff {
    /// Column name.
    pub name: String,
    /// Baseline definition.
    pub old: Column,
    /// Current definition.
    pub new: Column,
    /// One entry per differing attribute.
    pub modifications: Vec<ColumnModification>,
}

/// One detected attribute change on a column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnModification {
    /// Column name.
    pub column: String,
    /// What changed, with old and new values.
    pub change: ColumnChange,
    /// Whether existing rows may fail or lose data.
    pub is_destructive: bool,
}

/// Kind of column attribute change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ColumnChange {
    /// Normalized base type changed.
    DataType { from: String, to: String },
    /// NULL allowed (`true`) or not.
    Nullability { from: bool, to: bool },
    /// Default expression changed.
    Default { from: Option<String>, to: Option<String> },
    /// Character length bound changed.
    MaxLength { from: Option<i32>, to: Option<i32> },
    /// Numeric precision changed.
    Precision { from: Option<i32>, to: Option<i32> },
    /// Numeric scale changed.
    Scale { from: Option<i32>, to: Option<i32> },
}

impl ColumnChange {
    /// Classify the change under the compatibility policy.
    pub fn is_destructive(&self) -> bool {
        match self {
            Self::DataType { from, to } => !is_safe_widening(from, to),
            Self::Nullability { from, to } => *from && !*to,
            Self::Default { .. } => false,
            Self::MaxLength { from, to } | Self::Precision { from, to } | Self::Scale { from, to } => {
                is_narrowing(*from, *to)
            }
        }
    }
}

impl fmt::Display for ColumnChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn opt<T: fmt::Display>(v: &Option<T>) -> String {
            v.as_ref().map_or_else(|| "none".to_string(), |v| v.to_string())
        }
        match self {
            Self::DataType { from, to } => write!(f, "type {} -> {}", from, to),
            Self::Nullability { from, to } => write!(
                f,
                "{} -> {}",
                if *from { "NULL" } else { "NOT NULL" },
                if *to { "NULL" } else { "NOT NULL" }
            ),
            Self::Default { from, to } => write!(f, "default {} -> {}", opt(from), opt(to)),
            Self::MaxLength { from, to } => write!(f, "length {} -> {}", opt(from), opt(to)),
            Self::Precision { from, to } => write!(f, "precision {} -> {}", opt(from), opt(to)),
            Self::Scale { from, to } => write!(f, "scale {} -> {}", opt(from), opt(to)),
        }
    }
}

/// Type conversions that never lose data or fail.
const SAFE_WIDENINGS: &[(&str, &str)] = &[
    ("varchar", "text"),
    ("char", "varchar"),
    ("char", "text"),
    ("smallint", "integer"),
    ("smallint", "bigint"),
    ("smallint", "numeric"),
    ("integer", "bigint"),
    ("integer", "numeric"),
    ("bigint", "numeric"),
    ("real", "double precision"),
    ("timestamp", "timestamptz"),
    ("json", "jsonb"),
    ("varbit", "bit varying"),
];

/// Whether converting `from` to `to` is on the safe-widening allow-list.
pub fn is_safe_widening(from: &str, to: &str) -> bool {
    let from = normalize_type(from);
    let to = normalize_type(to);
    from == to || SAFE_WIDENINGS.iter().any(|(a, b)| *a == from && *b == to)
}

fn is_narrowing(from: Option<i32>, to: Option<i32>) -> bool {
    match (from, to) {
        (Some(old), Some(new)) => new < old,
        (None, Some(_)) => true,
        _ => false,
    }
}

/// Computes [`ChangeSet`]s.
pub struct ChangeDetector;

impl ChangeDetector {
    /// Diff `baseline` against `current`. Output order depends only on the inputs' content.
    pub fn detect(baseline: &SchemaSnapshot, current: &SchemaSnapshot) -> ChangeSet {
        let mut changes = ChangeSet::default();

        let old_tables: BTreeMap<String, &Table> =
            baseline.tables.iter().map(|t| (t.qualified_name(), t)).collect();
        let new_tables: BTreeMap<String, &Table> =
            current.tables.iter().map(|t| (t.qualified_name(), t)).collect();

        for (key, table) in &new_tables {
            match old_tables.get(key) {
                None => {
                    let mut table = (*table).clone();
                    table.sort();
                    changes.new_tables.push(table);
                }
                Some(old) => {
                    let diff = diff_tables(old, table);
                    if !diff.is_empty() {
                        changes.modified_tables.push(diff);
                    }
                }
            }
        }
        for (key, table) in &old_tables {
            if !new_tables.contains_key(key) {
                let mut table = (*table).clone();
                table.sort();
                changes.deleted_tables.push(table);
            }
        }

        let old_functions: BTreeMap<String, &Function> =
            baseline.functions.iter().map(|f| (f.signature(), f)).collect();
        let new_functions: BTreeMap<String, &Function> =
            current.functions.iter().map(|f| (f.signature(), f)).collect();

        for (signature, function) in &new_functions {
            match old_functions.get(signature) {
                None => changes.new_functions.push((*function).clone()),
                Some(old) if *old != *function => {
                    changes.modified_functions.push((*function).clone())
                }
                Some(_) => {}
            }
        }
        for (signature, function) in &old_functions {
            if !new_functions.contains_key(signature) {
                changes.deleted_functions.push((*function).clone());
            }
        }

        changes
    }
}

fn diff_tables(old: &Table, new: &Table) -> TableChanges {
    let mut changes = TableChanges::new(&new.schema, &new.name);

    let old_columns: BTreeMap<&str, &Column> =
        old.columns.iter().map(|c| (c.name.as_str(), c)).collect();
    let new_columns: BTreeMap<&str, &Column> =
        new.columns.iter().map(|c| (c.name.as_str(), c)).collect();

    for (name, column) in &new_columns {
        match old_columns.get(name) {
            None => changes.added_columns.push((*column).clone()),
            Some(old_column) => {
                let modifications = diff_columns(old_column, column);
                if !modifications.is_empty() {
                    changes.modified_columns.push(ColumnDiff {
                        name: name.to_string(),
                        old: (*old_column).clone(),
                        new: (*column).clone(),
                        modifications,
                    });
                }
            }
        }
    }
    for (name, column) in &old_columns {
        if !new_columns.contains_key(name) {
            changes.dropped_columns.push((*column).clone());
        }
    }
    changes
        .added_columns
        .sort_by(|a, b| a.ordinal_position.cmp(&b.ordinal_position).then(a.name.cmp(&b.name)));
    changes
        .dropped_columns
        .sort_by(|a, b| a.ordinal_position.cmp(&b.ordinal_position).then(a.name.cmp(&b.name)));

    let old_indexes: BTreeMap<&str, &Index> =
        old.indexes.iter().map(|i| (i.name.as_str(), i)).collect();
    let new_indexes: BTreeMap<&str, &Index> =
        new.indexes.iter().map(|i| (i.name.as_str(), i)).collect();

    for (name, index) in &new_indexes {
        match old_indexes.get(name) {
            None => changes.added_indexes.push((*index).clone()),
            Some(old_index) if !same_index(old_index, index) => {
                changes.dropped_indexes.push((*old_index).clone());
                changes.added_indexes.push((*index).clone());
            }
            Some(_) => {}
        }
    }
    for (name, index) in &old_indexes {
        if !new_indexes.contains_key(name) {
            changes.dropped_indexes.push((*index).clone());
        }
    }
    changes.dropped_indexes.sort_by(|a, b| a.name.cmp(&b.name));

    changes
}

fn same_index(a: &Index, b: &Index) -> bool {
    a.columns == b.columns
        && a.is_unique == b.is_unique
        && a.is_primary == b.is_primary
        && a.where_clause == b.where_clause
}

/// One modification per differing attribute, in a fixed attribute order.
fn diff_columns(old: &Column, new: &Column) -> Vec<ColumnModification> {
    let mut changes = Vec::new();

    let old_type = normalize_type(&old.data_type);
    let new_type = normalize_type(&new.data_type);
    if old_type != new_type {
        changes.push(ColumnChange::DataType {
            from: old_type,
            to: new_type,
        });
    }
    if old.is_nullable != new.is_nullable {
        changes.push(ColumnChange::Nullability {
            from: old.is_nullable,
            to: new.is_nullable,
        });
    }
    let old_default = old.default_value.as_deref().map(str::trim);
    let new_default = new.default_value.as_deref().map(str::trim);
    if old_default != new_default {
        changes.push(ColumnChange::Default {
            from: old.default_value.clone(),
            to: new.default_value.clone(),
        });
    }
    if old.max_length != new.max_length {
        changes.push(ColumnChange::MaxLength {
            from: old.max_length,
            to: new.max_length,
        });
    }
    if old.precision != new.precision {
        changes.push(ColumnChange::Precision {
            from: old.precision,
            to: new.precision,
        });
    }
    if old.scale != new.scale {
        changes.push(ColumnChange::Scale {
            from: old.scale,
            to: new.scale,
        });
    }

    changes
        .into_iter()
        .map(|change| ColumnModification {
            column: new.name.clone(),
            is_destructive: change.is_destructive(),
            change,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FunctionParameter, Volatility};
    use pretty_assertions::assert_eq;

    fn users() -> Table {
        Table::new("public", "users")
            .with_column(Column::new("id", "bigint").primary_key())
            .with_column(Column::new("email", "varchar").max_length(255).not_null())
            .with_column(Column::new("bio", "text"))
            .with_index(Index::new("users_email_idx", "users", ["email"]))
    }

    fn snapshot(tables: Vec<Table>) -> SchemaSnapshot {
        let mut s = SchemaSnapshot::new("public");
        s.tables = tables;
        s
    }

    fn modified_column<'a>(changes: &'a ChangeSet, name: &str) -> &'a ColumnDiff {
        changes.modified_tables[0]
            .modified_columns
            .iter()
            .find(|c| c.name == name)
            .unwrap()
    }

    #[test]
    fn test_identical_snapshots_have_no_changes() {
        let s = snapshot(vec![users()]);
        let changes = ChangeDetector::detect(&s, &s);
        assert!(changes.is_empty());
        assert_eq!(changes.summary(), "No changes");
    }

    #[test]
    fn test_new_and_deleted_tables() {
        let baseline = snapshot(vec![users(), Table::new("public", "legacy")]);
        let current = snapshot(vec![users(), Table::new("public", "posts")]);
        let changes = ChangeDetector::detect(&baseline, &current);

        assert_eq!(changes.new_tables[0].name, "posts");
        assert_eq!(changes.deleted_tables[0].name, "legacy");
        assert!(changes.has_destructive_changes());
        assert_eq!(changes.summary(), "Create 1 tables, Drop 1 tables");
    }

    #[test]
    fn test_added_and_dropped_columns() {
        let mut current = users();
        current.columns.retain(|c| c.name != "bio");
        let current = current.with_column(Column::new("age", "integer").position(4));

        let changes = ChangeDetector::detect(&snapshot(vec![users()]), &snapshot(vec![current]));
        let table = &changes.modified_tables[0];
        assert_eq!(table.added_columns[0].name, "age");
        assert_eq!(table.dropped_columns[0].name, "bio");
        assert!(table.has_destructive_changes());
    }

    #[test]
    fn test_narrowing_is_destructive() {
        let mut current = users();
        current.columns[1].max_length = Some(100);

        let changes = ChangeDetector::detect(&snapshot(vec![users()]), &snapshot(vec![current]));
        let diff = modified_column(&changes, "email");
        assert_eq!(
            diff.modifications,
            vec![ColumnModification {
                column: "email".to_string(),
                change: ColumnChange::MaxLength {
                    from: Some(255),
                    to: Some(100)
                },
                is_destructive: true,
            }]
        );
    }

    #[test]
    fn test_widening_to_text_is_safe() {
        let mut current = users();
        current.columns[1].data_type = "text".to_string();
        current.columns[1].max_length = None;

        let changes = ChangeDetector::detect(&snapshot(vec![users()]), &snapshot(vec![current]));
        let diff = modified_column(&changes, "email");
        assert_eq!(diff.modifications.len(), 2);
        assert!(diff.modifications.iter().all(|m| !m.is_destructive));
        assert!(!changes.has_destructive_changes());
    }

    #[test]
    fn test_nullability_and_default_policy() {
        let mut current = users();
        current.columns[2].is_nullable = false;
        current.columns[2].default_value = Some("''".to_string());

        let changes = ChangeDetector::detect(&snapshot(vec![users()]), &snapshot(vec![current]));
        let diff = modified_column(&changes, "bio");
        assert!(matches!(
            diff.modifications[0],
            ColumnModification {
                change: ColumnChange::Nullability { from: true, to: false },
                is_destructive: true,
                ..
            }
        ));
        assert!(matches!(
            diff.modifications[1],
            ColumnModification {
                change: ColumnChange::Default { .. },
                is_destructive: false,
                ..
            }
        ));
    }

    #[test]
    fn test_type_policy() {
        assert!(is_safe_widening("character varying", "text"));
        assert!(is_safe_widening("int4", "bigint"));
        assert!(is_safe_widening("timestamp", "timestamp with time zone"));
        assert!(!is_safe_widening("bigint", "integer"));
        assert!(!is_safe_widening("text", "integer"));
        assert!(ColumnChange::Precision { from: None, to: Some(10) }.is_destructive());
        assert!(!ColumnChange::Scale { from: Some(2), to: None }.is_destructive());
    }

    #[test]
    fn test_changed_index_is_dropped_and_readded() {
        let mut current = users();
        current.indexes[0].is_unique = true;

        let changes = ChangeDetector::detect(&snapshot(vec![users()]), &snapshot(vec![current]));
        let table = &changes.modified_tables[0];
        assert_eq!(table.dropped_indexes.len(), 1);
        assert_eq!(table.added_indexes.len(), 1);
        assert!(table.added_indexes[0].is_unique);
    }

    #[test]
    fn test_function_reconciliation() {
        let f = Function::new("public", "score")
            .param(FunctionParameter::new("n", "integer"))
            .returns("integer")
            .body("SELECT n * 2");
        let mut baseline = snapshot(vec![]);
        baseline.functions = vec![f.clone(), Function::new("public", "gone")];

        let mut current = snapshot(vec![]);
        current.functions = vec![
            f.clone().volatility(Volatility::Immutable),
            Function::new("public", "fresh"),
        ];

        let changes = ChangeDetector::detect(&baseline, &current);
        assert_eq!(changes.new_functions[0].name, "fresh");
        assert_eq!(changes.deleted_functions[0].name, "gone");
        assert_eq!(changes.modified_functions[0].volatility, Volatility::Immutable);
    }

    #[test]
    fn test_detection_is_deterministic() {
        let baseline = snapshot(vec![users(), Table::new("public", "a"), Table::new("public", "b")]);
        let mut reordered = baseline.clone();
        reordered.tables.reverse();
        let current = snapshot(vec![Table::new("public", "c"), Table::new("public", "d")]);

        let first = ChangeDetector::detect(&baseline, &current);
        let second = ChangeDetector::detect(&reordered, &current);
        assert_eq!(first, second);
    }
}
