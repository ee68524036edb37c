//! DDL rendering.

use crate::{Table, UPDATED_AT};

/// A PostgreSQL identifier wrapper.
///
/// Display writes the value escaped and quoted with double quotes.
///
/// # Example
/// ```
/// use stockroom_schema::Ident;
/// assert_eq!(format!("{}", Ident("products")), "\"products\"");
/// assert_eq!(format!("{}", Ident("bla\"h")), "\"bla\"\"h\"");
/// ```
pub struct Ident<T: AsRef<str>>(pub T);

impl<T: AsRef<str>> std::fmt::Display for Ident<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "\"")?;
        for c in self.0.as_ref().chars() {
            if c == '"' {
                write!(f, "\"\"")?;
            } else {
                write!(f, "{}", c)?;
            }
        }
        write!(f, "\"")
    }
}

/// Quote a PostgreSQL identifier.
///
/// Always quotes, so reserved words like `user` or `order` are safe as names.
pub fn quote_ident(name: &str) -> String {
    format!("{}", Ident(name))
}

/// Generate the `CREATE TABLE` statement for a table, without a trailing semicolon.
///
/// Only single-column primary keys are rendered inline; composite keys get a
/// table constraint.
pub fn create_table_sql(table: &Table) -> String {
    let pk_columns = table.primary_key();
    let composite_pk = pk_columns.len() > 1;

    let mut parts: Vec<String> = table
        .columns
        .iter()
        .map(|col| {
            if composite_pk && col.primary_key {
                let mut col = col.clone();
                col.primary_key = false;
                format!("    {}", col.to_sql())
            } else {
                format!("    {}", col.to_sql())
            }
        })
        .collect();

    if composite_pk {
        let quoted: Vec<String> = pk_columns.iter().map(|c| quote_ident(c)).collect();
        parts.push(format!("    PRIMARY KEY ({})", quoted.join(", ")));
    }

    format!(
        "CREATE TABLE {} (\n{}\n)",
        quote_ident(&table.name),
        parts.join(",\n")
    )
}

/// Generate the `DROP TABLE` statement for a table.
pub fn drop_table_sql(table_name: &str) -> String {
    format!("DROP TABLE {}", quote_ident(table_name))
}

/// Name shared by the touch trigger and its function.
pub fn touch_function_name(table_name: &str) -> String {
    format!("{}_touch_{}", table_name, UPDATED_AT)
}

/// Generate the trigger function that sets `updated_at` to `now()`.
pub fn create_touch_function_sql(table: &Table) -> String {
    format!(
        "CREATE OR REPLACE FUNCTION {}() RETURNS trigger LANGUAGE plpgsql AS $$\n\
         BEGIN\n\
         \x20   NEW.{} := now();\n\
         \x20   RETURN NEW;\n\
         END;\n\
         $$",
        quote_ident(&touch_function_name(&table.name)),
        quote_ident(UPDATED_AT),
    )
}

/// Generate the `BEFORE UPDATE` trigger that calls the touch function.
pub fn create_touch_trigger_sql(table: &Table) -> String {
    let name = quote_ident(&touch_function_name(&table.name));
    format!(
        "CREATE TRIGGER {} BEFORE UPDATE ON {} FOR EACH ROW EXECUTE FUNCTION {}()",
        name,
        quote_ident(&table.name),
        name
    )
}

/// Drop the touch function. The trigger goes away with its table.
pub fn drop_touch_function_sql(table_name: &str) -> String {
    format!(
        "DROP FUNCTION IF EXISTS {}()",
        quote_ident(&touch_function_name(table_name))
    )
}
