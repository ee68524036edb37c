use std::panic::Location;
use thiserror::Error;
use tokio_postgres::error::{ErrorPosition, SqlState};

#[derive(Debug, Error)]
pub enum Error {
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] MigrationError),

    #[error("migration {version} has already been applied")]
    AlreadyApplied { version: String },

    #[error("migration {version} has not been applied")]
    NotApplied { version: String },

    #[error("migration {version} has no down function and cannot be rolled back")]
    Irreversible { version: String },

    #[error("migration {version} is recorded in the database but not known to this binary")]
    UnknownMigration { version: String },

    #[error("more than one migration has version {version}")]
    DuplicateVersion { version: String },

    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("column {table}.{column} has unsupported type {data_type}")]
    UnsupportedType {
        table: String,
        column: String,
        data_type: String,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("connection pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),
}

impl Error {
    /// The SQLSTATE code of the underlying database error, if there is one.
    ///
    /// ```ignore
    /// if err.sql_state() == Some(&SqlState::DUPLICATE_TABLE) { ... }
    /// ```
    pub fn sql_state(&self) -> Option<&SqlState> {
        match self {
            Error::Postgres(e) => e.code(),
            Error::Migration(e) => e.sql_state(),
            _ => None,
        }
    }
}

/// Details about the statement that failed inside a migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlErrorContext {
    /// The statement as it was sent.
    pub sql: String,
    /// SQLSTATE code, e.g. `42P07` for a duplicate table.
    pub code: Option<String>,
    pub detail: Option<String>,
    pub hint: Option<String>,
    /// 1-based character offset into `sql`, when Postgres reports one.
    pub position: Option<u32>,
}

impl SqlErrorContext {
    fn from_postgres(sql: &str, err: &tokio_postgres::Error) -> Self {
        let db = err.as_db_error();
        Self {
            sql: sql.to_string(),
            code: err.code().map(|c| c.code().to_string()),
            detail: db.and_then(|d| d.detail()).map(str::to_string),
            hint: db.and_then(|d| d.hint()).map(str::to_string),
            position: db.and_then(|d| match d.position() {
                Some(ErrorPosition::Original(pos)) => Some(*pos),
                _ => None,
            }),
        }
    }

    /// The line of `sql` that `position` points into, if known.
    pub fn failing_line(&self) -> Option<&str> {
        let pos = self.position? as usize;
        let offset = self
            .sql
            .char_indices()
            .nth(pos.saturating_sub(1))
            .map(|(i, _)| i)?;
        let start = self.sql[..offset].rfind('\n').map_or(0, |i| i + 1);
        let end = self.sql[offset..]
            .find('\n')
            .map_or(self.sql.len(), |i| offset + i);
        Some(self.sql[start..end].trim())
    }
}

/// An error raised inside a migration function.
///
/// Carries the source location of the call that failed, captured with
/// `#[track_caller]` by [`MigrationContext`](crate::MigrationContext) and by
/// the `?` conversion from `tokio_postgres::Error`.
#[derive(Debug, Error)]
#[error("{message} (at {location})")]
pub struct MigrationError {
    pub message: String,
    pub location: &'static Location<'static>,
    pub sql: Option<SqlErrorContext>,
    #[source]
    pub source: Option<tokio_postgres::Error>,
}

impl MigrationError {
    /// A free-form failure, e.g. a data check that didn't hold.
    #[track_caller]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            location: Location::caller(),
            sql: None,
            source: None,
        }
    }

    pub(crate) fn from_statement(
        err: tokio_postgres::Error,
        sql: &str,
        location: &'static Location<'static>,
    ) -> Self {
        let message = match err.as_db_error() {
            Some(db) => db.message().to_string(),
            None => err.to_string(),
        };
        Self {
            message,
            location,
            sql: Some(SqlErrorContext::from_postgres(sql, &err)),
            source: Some(err),
        }
    }

    pub fn sql_state(&self) -> Option<&SqlState> {
        self.source.as_ref().and_then(|e| e.code())
    }
}

impl From<tokio_postgres::Error> for MigrationError {
    #[track_caller]
    fn from(err: tokio_postgres::Error) -> Self {
        Self {
            message: err.to_string(),
            location: Location::caller(),
            sql: None,
            source: Some(err),
        }
    }
}
