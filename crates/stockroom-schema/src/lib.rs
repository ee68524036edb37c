//! Table descriptions and DDL rendering for stockroom.
//!
//! A [`Table`] is a plain description of what a table should look like: its
//! name, its columns in order, and whether rows get their `updated_at` touched
//! on every update. Migrations render it to SQL, and the runtime compares it
//! against what the database actually has.
//!
//! ```
//! use stockroom_schema::{Column, PgType, Table};
//!
//! let table = Table::new("products")
//!     .id()
//!     .column(Column::new("name", PgType::Text))
//!     .timestamps();
//!
//! assert_eq!(table.columns.len(), 4);
//! assert!(table.touch_updated_at);
//! ```

use indexmap::IndexMap;
use std::fmt;

mod sql;
pub use sql::*;


/// Postgres column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PgType {
    /// SMALLINT (2 bytes)
    SmallInt,
    /// INTEGER (4 bytes)
    Integer,
    /// BIGINT (8 bytes)
    BigInt,
    /// REAL (4 bytes floating point)
    Real,
    /// DOUBLE PRECISION (8 bytes floating point)
    DoublePrecision,
    /// NUMERIC (arbitrary precision)
    Numeric,
    /// BOOLEAN
    Boolean,
    /// TEXT
    Text,
    /// VARCHAR without a length limit
    Varchar,
    /// BYTEA (binary)
    Bytea,
    /// TIMESTAMPTZ
    Timestamptz,
    /// TIMESTAMP (without time zone)
    Timestamp,
    /// DATE
    Date,
    /// TIME
    Time,
    /// UUID
    Uuid,
    /// JSONB
    Jsonb,
}

impl PgType {
    /// Map a `data_type` value from `information_schema.columns` back to a type.
    ///
    /// Returns `None` for types this crate doesn't model (arrays, domains, ...).
    pub fn from_information_schema(data_type: &str) -> Option<Self> {
        let ty = match data_type {
            "smallint" => PgType::SmallInt,
            "integer" => PgType::Integer,
            "bigint" => PgType::BigInt,
            "real" => PgType::Real,
            "double precision" => PgType::DoublePrecision,
            "numeric" => PgType::Numeric,
            "boolean" => PgType::Boolean,
            "text" => PgType::Text,
            "character varying" => PgType::Varchar,
            "bytea" => PgType::Bytea,
            "timestamp with time zone" => PgType::Timestamptz,
            "timestamp without time zone" => PgType::Timestamp,
            "date" => PgType::Date,
            "time without time zone" => PgType::Time,
            "uuid" => PgType::Uuid,
            "jsonb" => PgType::Jsonb,
            _ => return None,
        };
        Some(ty)
    }
}

impl fmt::Display for PgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PgType::SmallInt => write!(f, "SMALLINT"),
            PgType::Integer => write!(f, "INTEGER"),
            PgType::BigInt => write!(f, "BIGINT"),
            PgType::Real => write!(f, "REAL"),
            PgType::DoublePrecision => write!(f, "DOUBLE PRECISION"),
            PgType::Numeric => write!(f, "NUMERIC"),
            PgType::Boolean => write!(f, "BOOLEAN"),
            PgType::Text => write!(f, "TEXT"),
            PgType::Varchar => write!(f, "VARCHAR"),
            PgType::Bytea => write!(f, "BYTEA"),
            PgType::Timestamptz => write!(f, "TIMESTAMPTZ"),
            PgType::Timestamp => write!(f, "TIMESTAMP"),
            PgType::Date => write!(f, "DATE"),
            PgType::Time => write!(f, "TIME"),
            PgType::Uuid => write!(f, "UUID"),
            PgType::Jsonb => write!(f, "JSONB"),
        }
    }
}

/// A database column definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    /// Column name
    pub name: String,
    /// Postgres type
    pub pg_type: PgType,
    /// Whether the column allows NULL
    pub nullable: bool,
    /// Default value expression (if any)
    pub default: Option<String>,
    /// Whether this is the primary key
    pub primary_key: bool,
    /// Whether this has a unique constraint
    pub unique: bool,
    /// Whether values come from `GENERATED BY DEFAULT AS IDENTITY`
    pub identity: bool,
}

impl Column {
    /// A nullable column with no default and no constraints.
    pub fn new(name: impl Into<String>, pg_type: PgType) -> Self {
        Self {
            name: name.into(),
            pg_type,
            nullable: true,
            default: None,
            primary_key: false,
            unique: false,
            identity: false,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Set the default value expression, rendered verbatim.
    pub fn with_default(mut self, expr: impl Into<String>) -> Self {
        self.default = Some(expr.into());
        self
    }

    /// Mark as primary key. Primary keys are never nullable.
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Mark as an identity column (the database assigns values).
    pub fn identity(mut self) -> Self {
        self.identity = true;
        self.nullable = false;
        self
    }

    /// The column's SQL definition as it appears inside `CREATE TABLE`.
    pub fn to_sql(&self) -> String {
        let mut def = format!("{} {}", quote_ident(&self.name), self.pg_type);

        if self.identity {
            def.push_str(" GENERATED BY DEFAULT AS IDENTITY");
        }

        if self.primary_key {
            def.push_str(" PRIMARY KEY");
        } else if !self.nullable {
            // PK columns are implicitly NOT NULL
            def.push_str(" NOT NULL");
        }

        if self.unique && !self.primary_key {
            def.push_str(" UNIQUE");
        }

        if let Some(default) = &self.default {
            def.push_str(&format!(" DEFAULT {}", default));
        }

        def
    }
}

/// The name of the column touched by the update trigger.
pub const UPDATED_AT: &str = "updated_at";

/// The name of the creation timestamp column.
pub const CREATED_AT: &str = "created_at";

/// A database table definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    /// Table name
    pub name: String,
    /// Columns, in declaration order
    pub columns: Vec<Column>,
    /// Whether a `BEFORE UPDATE` trigger keeps `updated_at` current
    pub touch_updated_at: bool,
}

impl Table {
    /// An empty table definition.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            touch_updated_at: false,
        }
    }

    /// Append a column.
    pub fn column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    /// Append the conventional surrogate key: `id BIGINT` identity primary key.
    pub fn id(self) -> Self {
        self.column(Column::new("id", PgType::BigInt).identity().primary_key())
    }

    /// Append `created_at` and `updated_at`, both `TIMESTAMPTZ NOT NULL DEFAULT now()`,
    /// and keep `updated_at` current on every update.
    ///
    /// `now()` is evaluated once per transaction, so both columns are equal
    /// when a row is inserted.
    pub fn timestamps(mut self) -> Self {
        for name in [CREATED_AT, UPDATED_AT] {
            self.columns.push(
                Column::new(name, PgType::Timestamptz)
                    .not_null()
                    .with_default("now()"),
            );
        }
        self.touch_updated_at = true;
        self
    }

    /// Get a column by name.
    pub fn get_column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Names of the primary key columns, in column order.
    pub fn primary_key(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.as_str())
            .collect()
    }

    /// Render the `CREATE TABLE` statement.
    pub fn to_create_table_sql(&self) -> String {
        create_table_sql(self)
    }
}

/// A complete database schema.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    /// Tables in the schema, indexed by name
    pub tables: IndexMap<String, Table>,
}

impl Schema {
    /// Create a new empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect every table registered with [`TableDef`], sorted by name.
    pub fn collect() -> Self {
        let mut tables: Vec<Table> = inventory::iter::<TableDef>
            .into_iter()
            .map(|def| (def.build)())
            .collect();
        tables.sort_by(|a, b| a.name.cmp(&b.name));

        Self {
            tables: tables.into_iter().map(|t| (t.name.clone(), t)).collect(),
        }
    }

    /// Get a table by name.
    pub fn get_table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    /// Iterate over all tables.
    pub fn iter_tables(&self) -> impl Iterator<Item = &Table> {
        self.tables.values()
    }

    /// Render DDL for every table, including touch triggers.
    pub fn to_sql(&self) -> String {
        let mut out = String::new();
        for table in self.iter_tables() {
            out.push_str(&create_table_sql(table));
            out.push_str(";\n");
            if table.touch_updated_at {
                out.push_str(&create_touch_function_sql(table));
                out.push_str(";\n");
                out.push_str(&create_touch_trigger_sql(table));
                out.push_str(";\n");
            }
            out.push('\n');
        }
        out
    }
}

/// A registered table definition.
///
/// Crates that own tables submit one of these per table:
///
/// ```ignore
/// inventory::submit!(stockroom::TableDef::new(products));
/// ```
pub struct TableDef {
    /// Builds the table description.
    pub build: fn() -> Table,
}

impl TableDef {
    pub const fn new(build: fn() -> Table) -> Self {
        Self { build }
    }
}

inventory::collect!(TableDef);
