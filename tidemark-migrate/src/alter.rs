//! Column-level ALTER TABLE generation.
//!
//! Turns the [`ColumnModification`]s of one column into ordered
//! [`SchemaOp`]s. Narrowing changes get a guard block first so that the
//! migration aborts before PostgreSQL would truncate or reject data halfway
//! through.

use crate::diff::{ColumnChange, ColumnModification};
use crate::model::{
    Column, normalize_type, quote_ident, quote_qualified, render_type, takes_length,
    takes_precision,
};
use crate::sql::SchemaOp;

/// Target types that need an explicit `USING col::type` cast.
const CAST_FAMILY: &[&str] = &[
    "numeric",
    "integer",
    "smallint",
    "bigint",
    "real",
    "double precision",
    "date",
    "time",
    "timetz",
    "timestamp",
    "timestamptz",
    "interval",
    "boolean",
    "uuid",
    "json",
    "jsonb",
];

/// One ALTER COLUMN action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnAction {
    /// Change the column type (including length/precision/scale).
    SetType {
        /// Base type name.
        data_type: String,
        /// Length modifier.
        max_length: Option<i32>,
        /// Precision modifier.
        precision: Option<i32>,
        /// Scale modifier.
        scale: Option<i32>,
        /// Convert existing values with `USING col::type`.
        using_cast: bool,
    },
    /// `SET NOT NULL`.
    SetNotNull,
    /// `DROP NOT NULL`.
    DropNotNull,
    /// `SET DEFAULT expr`.
    SetDefault(String),
    /// `DROP DEFAULT`.
    DropDefault,
}

impl ColumnAction {
    fn set_type(target: &Column, using_cast: bool) -> Self {
        Self::SetType {
            data_type: target.data_type.clone(),
            max_length: target.max_length,
            precision: target.precision,
            scale: target.scale,
            using_cast,
        }
    }

    /// Render the `ALTER COLUMN ...` clause.
    pub fn render(&self, column: &str) -> String {
        let col = quote_ident(column);
        match self {
            Self::SetType {
                data_type,
                max_length,
                precision,
                scale,
                using_cast,
            } => {
                let sql_type = render_type(data_type, *max_length, *precision, *scale);
                if *using_cast {
                    format!("ALTER COLUMN {} TYPE {} USING {}::{}", col, sql_type, col, sql_type)
                } else {
                    format!("ALTER COLUMN {} TYPE {}", col, sql_type)
                }
            }
            Self::SetNotNull => format!("ALTER COLUMN {} SET NOT NULL", col),
            Self::DropNotNull => format!("ALTER COLUMN {} DROP NOT NULL", col),
            Self::SetDefault(expr) => format!("ALTER COLUMN {} SET DEFAULT {}", col, expr),
            Self::DropDefault => format!("ALTER COLUMN {} DROP DEFAULT", col),
        }
    }

    /// Apply the action to a column definition.
    pub fn apply(&self, column: &mut Column) {
        match self {
            Self::SetType {
                data_type,
                max_length,
                precision,
                scale,
                ..
            } => {
                column.data_type = data_type.clone();
                column.max_length = *max_length;
                column.precision = *precision;
                column.scale = *scale;
            }
            Self::SetNotNull => column.is_nullable = false,
            Self::DropNotNull => column.is_nullable = true,
            Self::SetDefault(expr) => column.default_value = Some(expr.clone()),
            Self::DropDefault => column.default_value = None,
        }
    }
}

/// Pre-migration data check for a narrowing change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardCheck {
    /// No value may be longer than the new length.
    MaxLength(i32),
    /// No value may need more integer digits than `precision - scale`.
    Precision { precision: i32, scale: i32 },
    /// No value may carry more fractional digits than the new scale.
    Scale(i32),
}

impl GuardCheck {
    /// Row predicate that identifies violating rows.
    pub fn predicate(&self, column: &str) -> String {
        let col = quote_ident(column);
        match self {
            Self::MaxLength(n) => format!("LENGTH({}) > {}", col, n),
            Self::Precision { precision, scale } => {
                format!("ABS({}) >= 10^{}", col, precision - scale)
            }
            Self::Scale(s) => format!("{} <> ROUND({}, {})", col, col, s),
        }
    }

    fn bound(&self) -> String {
        match self {
            Self::MaxLength(n) => format!("length {}", n),
            Self::Precision { precision, scale } => format!("precision ({},{})", precision, scale),
            Self::Scale(s) => format!("scale {}", s),
        }
    }

    /// Render the guard as an anonymous `DO` block.
    pub fn render(&self, schema: &str, table: &str, column: &str) -> String {
        let target = quote_qualified(schema, table);
        let message = format!(
            "Cannot narrow {}.{} to {}: existing rows violate the new bound",
            target,
            quote_ident(column),
            self.bound()
        )
        .replace('\'', "''");
        format!(
            "DO $$\nBEGIN\n    IF EXISTS (SELECT 1 FROM {} WHERE {}) THEN\n        RAISE EXCEPTION '{}';\n    END IF;\nEND $$;",
            target,
            self.predicate(column),
            message
        )
    }
}

/// Generates forward and rollback ALTER statements for one table.
#[derive(Debug, Clone)]
pub struct AlterTableGenerator {
    schema: String,
    table: String,
}

impl AlterTableGenerator {
    /// Create a generator for `schema.table`.
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// Ops that take `old` through every modification in order.
    pub fn forward(&self, old: &Column, modifications: &[ColumnModification]) -> Vec<SchemaOp> {
        let target = replay(old, modifications);
        let mut ops = Vec::new();
        let mut type_emitted = false;

        for modification in modifications {
            match &modification.change {
                ColumnChange::DataType { .. }
                | ColumnChange::MaxLength { .. }
                | ColumnChange::Precision { .. }
                | ColumnChange::Scale { .. } => {
                    if type_emitted {
                        continue;
                    }
                    type_emitted = true;
                    for check in guards(&target, modifications) {
                        ops.push(SchemaOp::Guard {
                            schema: self.schema.clone(),
                            table: self.table.clone(),
                            column: target.name.clone(),
                            check,
                        });
                    }
                    let type_changed = modifications
                        .iter()
                        .any(|m| matches!(m.change, ColumnChange::DataType { .. }));
                    let using_cast = type_changed && needs_cast(&target.data_type);
                    ops.push(self.alter(&target.name, ColumnAction::set_type(&target, using_cast)));
                }
                ColumnChange::Nullability { to, .. } => {
                    let action = if *to {
                        ColumnAction::DropNotNull
                    } else {
                        ColumnAction::SetNotNull
                    };
                    ops.push(self.alter(&target.name, action));
                }
                ColumnChange::Default { to, .. } => {
                    ops.push(self.alter(&target.name, ColumnAction::DropDefault));
                    if let Some(expr) = to.as_deref().filter(|e| !e.trim().is_empty()) {
                        ops.push(self.alter(&target.name, ColumnAction::SetDefault(expr.to_string())));
                    }
                }
            }
        }

        ops
    }

    /// Ops that take `new` back to the pre-change definition.
    ///
    /// The modification list is replayed in reverse with each change inverted.
    pub fn rollback(&self, new: &Column, modifications: &[ColumnModification]) -> Vec<SchemaOp> {
        let inverted: Vec<ColumnModification> = modifications.iter().rev().map(invert).collect();
        self.forward(new, &inverted)
    }

    fn alter(&self, column: &str, action: ColumnAction) -> SchemaOp {
        SchemaOp::AlterColumn {
            schema: self.schema.clone(),
            table: self.table.clone(),
            column: column.to_string(),
            action,
        }
    }
}

/// Apply every modification's new value to a copy of `column`.
pub fn replay(column: &Column, modifications: &[ColumnModification]) -> Column {
    let mut working = column.clone();
    for modification in modifications {
        match &modification.change {
            ColumnChange::DataType { to, .. } => working.data_type = to.clone(),
            ColumnChange::Nullability { to, .. } => working.is_nullable = *to,
            ColumnChange::Default { to, .. } => working.default_value = to.clone(),
            ColumnChange::MaxLength { to, .. } => working.max_length = *to,
            ColumnChange::Precision { to, .. } => working.precision = *to,
            ColumnChange::Scale { to, .. } => working.scale = *to,
        }
    }
    working
}

fn invert(modification: &ColumnModification) -> ColumnModification {
    let change = match &modification.change {
        ColumnChange::DataType { from, to } => ColumnChange::DataType {
            from: to.clone(),
            to: from.clone(),
        },
        ColumnChange::Nullability { from, to } => ColumnChange::Nullability { from: *to, to: *from },
        ColumnChange::Default { from, to } => ColumnChange::Default {
            from: to.clone(),
            to: from.clone(),
        },
        ColumnChange::MaxLength { from, to } => ColumnChange::MaxLength { from: *to, to: *from },
        ColumnChange::Precision { from, to } => ColumnChange::Precision { from: *to, to: *from },
        ColumnChange::Scale { from, to } => ColumnChange::Scale { from: *to, to: *from },
    };
    ColumnModification {
        column: modification.column.clone(),
        is_destructive: change.is_destructive(),
        change,
    }
}

fn guards(target: &Column, modifications: &[ColumnModification]) -> Vec<GuardCheck> {
    let mut checks = Vec::new();
    for modification in modifications.iter().filter(|m| m.is_destructive) {
        match modification.change {
            ColumnChange::MaxLength { to: Some(n), .. } if takes_length(&target.data_type) => {
                checks.push(GuardCheck::MaxLength(n));
            }
            ColumnChange::Precision { to: Some(p), .. } if takes_precision(&target.data_type) => {
                checks.push(GuardCheck::Precision {
                    precision: p,
                    scale: target.scale.unwrap_or(0),
                });
            }
            ColumnChange::Scale { to: Some(s), .. } if takes_precision(&target.data_type) => {
                checks.push(GuardCheck::Scale(s));
            }
            _ => {}
        }
    }
    checks
}

fn needs_cast(data_type: &str) -> bool {
    let normalized = normalize_type(data_type);
    let base = normalized.trim_end_matches("[]");
    CAST_FAMILY.contains(&base)
}
