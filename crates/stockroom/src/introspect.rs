//! Read table definitions back out of a live database.

use crate::error::Error;
use crate::schema::{Column, PgType, Schema, Table};
use crate::traced::{Connection, ConnectionExt};
use crate::Result;
use std::collections::HashMap;

// information_schema columns are domains; cast so they decode as plain text.
const COLUMNS_SQL: &str = r#"
SELECT
    column_name::text AS column_name,
    data_type::text AS data_type,
    is_nullable = 'YES' AS nullable,
    column_default::text AS column_default,
    is_identity = 'YES' AS identity
FROM information_schema.columns
WHERE table_schema = current_schema() AND table_name::text = $1::text
ORDER BY ordinal_position
"#;

const CONSTRAINTS_SQL: &str = r#"
SELECT
    tc.constraint_name::text AS constraint_name,
    tc.constraint_type::text AS constraint_type,
    kcu.column_name::text AS column_name
FROM information_schema.table_constraints tc
JOIN information_schema.key_column_usage kcu
    ON tc.constraint_name = kcu.constraint_name
    AND tc.table_schema = kcu.table_schema
    AND tc.table_name = kcu.table_name
WHERE tc.table_schema = current_schema()
    AND tc.table_name::text = $1::text
    AND tc.constraint_type IN ('PRIMARY KEY', 'UNIQUE')
"#;

const TOUCH_TRIGGER_SQL: &str = r#"
SELECT 1
FROM information_schema.triggers
WHERE event_object_schema = current_schema()
    AND event_object_table::text = $1::text
    AND trigger_name::text = $2::text
    AND event_manipulation = 'UPDATE'
LIMIT 1
"#;

/// Read one table from the current schema. `None` if it doesn't exist.
pub async fn table(conn: &dyn Connection, name: &str) -> Result<Option<Table>> {
    let traced = conn.traced();

    let rows = traced.query(COLUMNS_SQL, &[&name]).await?;
    if rows.is_empty() {
        return Ok(None);
    }

    let mut primary_key = Vec::new();
    let mut unique_constraints: HashMap<String, Vec<String>> = HashMap::new();
    for row in traced.query(CONSTRAINTS_SQL, &[&name]).await? {
        let constraint: String = row.try_get("constraint_name")?;
        let kind: String = row.try_get("constraint_type")?;
        let column: String = row.try_get("column_name")?;
        if kind == "PRIMARY KEY" {
            primary_key.push(column);
        } else {
            unique_constraints.entry(constraint).or_default().push(column);
        }
    }
    // Only single-column unique constraints map onto `Column::unique`.
    let unique: Vec<String> = unique_constraints
        .into_values()
        .filter(|cols| cols.len() == 1)
        .flatten()
        .collect();

    let mut table = Table::new(name);
    for row in &rows {
        let column_name: String = row.try_get("column_name")?;
        let data_type: String = row.try_get("data_type")?;
        let pg_type =
            PgType::from_information_schema(&data_type).ok_or_else(|| Error::UnsupportedType {
                table: name.to_string(),
                column: column_name.clone(),
                data_type: data_type.clone(),
            })?;

        table.columns.push(Column {
            primary_key: primary_key.contains(&column_name),
            unique: unique.contains(&column_name),
            nullable: row.try_get("nullable")?,
            default: row.try_get("column_default")?,
            identity: row.try_get("identity")?,
            pg_type,
            name: column_name,
        });
    }

    let trigger = crate::schema::touch_function_name(name);
    table.touch_updated_at = traced
        .query_opt(TOUCH_TRIGGER_SQL, &[&name, &trigger])
        .await?
        .is_some();

    Ok(Some(table))
}

/// Read the named tables; tables missing from the database are left out.
pub async fn schema(conn: &dyn Connection, names: &[&str]) -> Result<Schema> {
    let mut schema = Schema::new();
    for name in names {
        if let Some(table) = table(conn, name).await? {
            schema.tables.insert(table.name.clone(), table);
        }
    }
    Ok(schema)
}

/// Fail with [`Error::SchemaMismatch`] unless every table in `expected`
/// matches the database.
pub async fn verify(conn: &dyn Connection, expected: &Schema) -> Result<()> {
    let names: Vec<&str> = expected.tables.keys().map(String::as_str).collect();
    let actual = schema(conn, &names).await?;
    let diff = crate::diff_schema(expected, &actual);
    if diff.is_empty() {
        return Ok(());
    }

    let changes: Vec<String> = diff
        .table_diffs
        .iter()
        .flat_map(|t| t.changes.iter().map(move |c| format!("{}: {}", t.table, c)))
        .collect();
    Err(Error::SchemaMismatch(changes.join("; ")))
}
