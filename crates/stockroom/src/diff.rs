//! Schema diffing - compare declared tables against the database.
//!
//! Changes describe how to get from what the database has to what the code
//! declares. [`SchemaDiff::to_sql`] renders them as advisory SQL; nothing here
//! executes anything. Column order can't be changed in place by Postgres, so a
//! reordering is reported as a comment.

use crate::schema::{
    Column, PgType, Schema, Table, create_table_sql, create_touch_function_sql,
    create_touch_trigger_sql, drop_touch_function_sql, quote_ident, touch_function_name,
};
use std::fmt;

/// A diff between two schemas.
#[derive(Debug, Clone, Default)]
pub struct SchemaDiff {
    /// Changes organized by table.
    pub table_diffs: Vec<TableDiff>,
}

impl SchemaDiff {
    /// Returns true if there are no differences.
    pub fn is_empty(&self) -> bool {
        self.table_diffs.is_empty()
    }

    /// Count total number of changes.
    pub fn change_count(&self) -> usize {
        self.table_diffs.iter().map(|t| t.changes.len()).sum()
    }

    /// Generate SQL statements for all changes in this diff.
    pub fn to_sql(&self) -> String {
        let mut sql = String::new();
        for table_diff in &self.table_diffs {
            sql.push_str(&format!("-- Table: {}\n", table_diff.table));
            for change in &table_diff.changes {
                sql.push_str(&change.to_sql(&table_diff.table));
                sql.push('\n');
            }
            sql.push('\n');
        }
        sql
    }
}

/// Changes for a single table.
#[derive(Debug, Clone)]
pub struct TableDiff {
    /// Table name.
    pub table: String,
    /// List of changes.
    pub changes: Vec<Change>,
}

/// A single schema change.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// The table doesn't exist yet.
    AddTable(Table),
    AddColumn(Column),
    DropColumn(String),
    AlterColumnType {
        name: String,
        from: PgType,
        to: PgType,
    },
    AlterColumnNullable {
        name: String,
        from: bool,
        to: bool,
    },
    AlterColumnDefault {
        name: String,
        from: Option<String>,
        to: Option<String>,
    },
    AlterColumnIdentity {
        name: String,
        to: bool,
    },
    AddPrimaryKey(Vec<String>),
    DropPrimaryKey,
    AddUnique(String),
    DropUnique(String),
    /// Same columns, different order.
    ReorderColumns {
        expected: Vec<String>,
        actual: Vec<String>,
    },
    AddTouchTrigger,
    DropTouchTrigger,
}

impl Change {
    /// Generate SQL for this change against `table_name`.
    pub fn to_sql(&self, table_name: &str) -> String {
        let table = quote_ident(table_name);
        match self {
            Change::AddTable(t) => {
                let mut sql = format!("{};", create_table_sql(t));
                if t.touch_updated_at {
                    sql.push_str(&format!(
                        "\n{};\n{};",
                        create_touch_function_sql(t),
                        create_touch_trigger_sql(t)
                    ));
                }
                sql
            }
            Change::AddColumn(col) => format!("ALTER TABLE {} ADD COLUMN {};", table, col.to_sql()),
            Change::DropColumn(name) => {
                format!("ALTER TABLE {} DROP COLUMN {};", table, quote_ident(name))
            }
            Change::AlterColumnType { name, to, .. } => format!(
                "ALTER TABLE {} ALTER COLUMN {} TYPE {};",
                table,
                quote_ident(name),
                to
            ),
            Change::AlterColumnNullable { name, to, .. } => {
                let action = if *to { "DROP NOT NULL" } else { "SET NOT NULL" };
                format!(
                    "ALTER TABLE {} ALTER COLUMN {} {};",
                    table,
                    quote_ident(name),
                    action
                )
            }
            Change::AlterColumnDefault { name, to, .. } => match to {
                Some(default) => format!(
                    "ALTER TABLE {} ALTER COLUMN {} SET DEFAULT {};",
                    table,
                    quote_ident(name),
                    default
                ),
                None => format!(
                    "ALTER TABLE {} ALTER COLUMN {} DROP DEFAULT;",
                    table,
                    quote_ident(name)
                ),
            },
            Change::AlterColumnIdentity { name, to } => {
                let action = if *to {
                    "ADD GENERATED BY DEFAULT AS IDENTITY"
                } else {
                    "DROP IDENTITY"
                };
                format!(
                    "ALTER TABLE {} ALTER COLUMN {} {};",
                    table,
                    quote_ident(name),
                    action
                )
            }
            Change::AddPrimaryKey(cols) => {
                let cols: Vec<String> = cols.iter().map(|c| quote_ident(c)).collect();
                format!("ALTER TABLE {} ADD PRIMARY KEY ({});", table, cols.join(", "))
            }
            Change::DropPrimaryKey => format!(
                "ALTER TABLE {} DROP CONSTRAINT {};",
                table,
                quote_ident(&format!("{}_pkey", table_name))
            ),
            Change::AddUnique(col) => format!(
                "ALTER TABLE {} ADD CONSTRAINT {} UNIQUE ({});",
                table,
                quote_ident(&format!("{}_{}_key", table_name, col)),
                quote_ident(col)
            ),
            Change::DropUnique(col) => format!(
                "ALTER TABLE {} DROP CONSTRAINT {};",
                table,
                quote_ident(&format!("{}_{}_key", table_name, col))
            ),
            Change::ReorderColumns { expected, actual } => format!(
                "-- column order differs: expected ({}), found ({})",
                expected.join(", "),
                actual.join(", ")
            ),
            Change::AddTouchTrigger => {
                let mut t = Table::new(table_name);
                t.touch_updated_at = true;
                format!(
                    "{};\n{};",
                    create_touch_function_sql(&t),
                    create_touch_trigger_sql(&t)
                )
            }
            Change::DropTouchTrigger => format!(
                "DROP TRIGGER {} ON {};\n{};",
                quote_ident(&touch_function_name(table_name)),
                table,
                drop_touch_function_sql(table_name)
            ),
        }
    }
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Change::AddTable(t) => write!(f, "+ table {} ({} columns)", t.name, t.columns.len()),
            Change::AddColumn(col) => write!(f, "+ column {} {}", col.name, col.pg_type),
            Change::DropColumn(name) => write!(f, "- column {}", name),
            Change::AlterColumnType { name, from, to } => {
                write!(f, "~ {}: type {} -> {}", name, from, to)
            }
            Change::AlterColumnNullable { name, to, .. } => {
                let what = if *to { "nullable" } else { "NOT NULL" };
                write!(f, "~ {}: make {}", name, what)
            }
            Change::AlterColumnDefault { name, from, to } => write!(
                f,
                "~ {}: default {} -> {}",
                name,
                from.as_deref().unwrap_or("(none)"),
                to.as_deref().unwrap_or("(none)")
            ),
            Change::AlterColumnIdentity { name, to } => {
                let what = if *to { "add" } else { "drop" };
                write!(f, "~ {}: {} identity", name, what)
            }
            Change::AddPrimaryKey(cols) => write!(f, "+ primary key ({})", cols.join(", ")),
            Change::DropPrimaryKey => write!(f, "- primary key"),
            Change::AddUnique(col) => write!(f, "+ unique ({})", col),
            Change::DropUnique(col) => write!(f, "- unique ({})", col),
            Change::ReorderColumns { expected, .. } => {
                write!(f, "~ column order, expected ({})", expected.join(", "))
            }
            Change::AddTouchTrigger => write!(f, "+ updated_at trigger"),
            Change::DropTouchTrigger => write!(f, "- updated_at trigger"),
        }
    }
}

/// Strip trailing casts Postgres adds to stored defaults, e.g. `'draft'::text`.
fn normalize_default(expr: &str) -> &str {
    let mut expr = expr.trim();
    while let Some(idx) = expr.rfind("::") {
        let cast = &expr[idx + 2..];
        if cast.is_empty()
            || !cast
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ' ')
        {
            break;
        }
        expr = expr[..idx].trim_end();
    }
    expr
}

fn same_default(expected: &Option<String>, actual: &Option<String>) -> bool {
    match (expected, actual) {
        (Some(e), Some(a)) => normalize_default(e).eq_ignore_ascii_case(normalize_default(a)),
        (None, None) => true,
        _ => false,
    }
}

/// Compare a declared table against the database's version of it.
///
/// Returns `None` when they match.
pub fn diff_table(expected: &Table, actual: Option<&Table>) -> Option<TableDiff> {
    let Some(actual) = actual else {
        return Some(TableDiff {
            table: expected.name.clone(),
            changes: vec![Change::AddTable(expected.clone())],
        });
    };

    let mut changes = Vec::new();

    for col in &expected.columns {
        let Some(existing) = actual.get_column(&col.name) else {
            changes.push(Change::AddColumn(col.clone()));
            continue;
        };
        if existing.pg_type != col.pg_type {
            changes.push(Change::AlterColumnType {
                name: col.name.clone(),
                from: existing.pg_type,
                to: col.pg_type,
            });
        }
        if existing.nullable != col.nullable {
            changes.push(Change::AlterColumnNullable {
                name: col.name.clone(),
                from: existing.nullable,
                to: col.nullable,
            });
        }
        if existing.identity != col.identity {
            changes.push(Change::AlterColumnIdentity {
                name: col.name.clone(),
                to: col.identity,
            });
        }
        if !col.identity && !same_default(&col.default, &existing.default) {
            changes.push(Change::AlterColumnDefault {
                name: col.name.clone(),
                from: existing.default.clone(),
                to: col.default.clone(),
            });
        }
        if !col.primary_key && col.unique != existing.unique {
            changes.push(if col.unique {
                Change::AddUnique(col.name.clone())
            } else {
                Change::DropUnique(col.name.clone())
            });
        }
    }

    for col in &actual.columns {
        if expected.get_column(&col.name).is_none() {
            changes.push(Change::DropColumn(col.name.clone()));
        }
    }

    let expected_pk = expected.primary_key();
    let actual_pk = actual.primary_key();
    if expected_pk != actual_pk {
        if !actual_pk.is_empty() {
            changes.push(Change::DropPrimaryKey);
        }
        if !expected_pk.is_empty() {
            changes.push(Change::AddPrimaryKey(
                expected_pk.iter().map(|c| c.to_string()).collect(),
            ));
        }
    }

    let expected_order: Vec<String> = expected
        .columns
        .iter()
        .filter(|c| actual.get_column(&c.name).is_some())
        .map(|c| c.name.clone())
        .collect();
    let actual_order: Vec<String> = actual
        .columns
        .iter()
        .filter(|c| expected.get_column(&c.name).is_some())
        .map(|c| c.name.clone())
        .collect();
    if expected_order != actual_order {
        changes.push(Change::ReorderColumns {
            expected: expected_order,
            actual: actual_order,
        });
    }

    match (expected.touch_updated_at, actual.touch_updated_at) {
        (true, false) => changes.push(Change::AddTouchTrigger),
        (false, true) => changes.push(Change::DropTouchTrigger),
        _ => {}
    }

    if changes.is_empty() {
        None
    } else {
        Some(TableDiff {
            table: expected.name.clone(),
            changes,
        })
    }
}

/// Compare every declared table against the database.
///
/// Tables present only in the database are not reported: a database is
/// usually shared with bookkeeping tables and tables owned by other code.
pub fn diff_schema(expected: &Schema, actual: &Schema) -> SchemaDiff {
    SchemaDiff {
        table_diffs: expected
            .iter_tables()
            .filter_map(|t| diff_table(t, actual.get_table(&t.name)))
            .collect(),
    }
}
