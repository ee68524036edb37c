//! Postgres migrations as Rust functions.
//!
//! This crate provides:
//! - Migrations registered with `#[stockroom::migration]`, applied and reverted
//!   by [`MigrationRunner`]
//! - Table descriptions ([`schema`]) checked against the live database
//!   ([`introspect`], [`diff_schema`])
//! - A command line front end ([`cli::run`]) for the crate that owns the migrations
//!
//! # Migrations
//!
//! The version and name are derived from the file name:
//!
//! ```ignore
//! // In file: src/migrations/m2018_12_19_123224_create_products.rs
//! #[stockroom::migration(down = revert)]
//! pub async fn migrate(ctx: &mut MigrationContext<'_>) -> MigrationResult<()> {
//!     ctx.execute("CREATE TABLE \"products\" (\"id\" BIGINT PRIMARY KEY)").await?;
//!     Ok(())
//! }
//!
//! pub async fn revert(ctx: &mut MigrationContext<'_>) -> MigrationResult<()> {
//!     ctx.execute("DROP TABLE \"products\"").await?;
//!     Ok(())
//! }
//! ```
//!
//! Use `MigrationResult` instead of `Result` so that errors carry the source
//! location (file:line:column) of the statement that failed.
//!
//! Run migrations with `MigrationRunner`:
//!
//! ```ignore
//! let runner = MigrationRunner::new(&client);
//! runner.migrate().await?;
//! runner.rollback(1).await?;
//! ```

use std::future::Future;
use std::pin::Pin;

pub mod cli;
pub mod config;
mod diff;
mod error;
pub mod introspect;
pub mod meta;
mod migrate;
pub mod pool;
mod traced;

pub use diff::{Change, SchemaDiff, TableDiff, diff_schema, diff_table};
pub use error::{Error, MigrationError, SqlErrorContext};
pub use migrate::{
    AppliedMigration, Direction, Migration, MigrationContext, MigrationRunner, MigrationState,
    MigrationStatus, RanMigration,
};
pub use traced::{Connection, ConnectionExt, TracedConn};

/// Table descriptions and DDL rendering.
pub mod schema {
    pub use stockroom_schema::*;
}

pub use schema::{Schema, Table, TableDef};

// Re-export inventory for the proc macro
pub use inventory;

// Re-export the proc macro
pub use stockroom_macros::migration;

/// Result type for stockroom operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Result type for migration functions, captures caller location on error.
pub type MigrationResult<T> = std::result::Result<T, MigrationError>;

/// Type alias for migration functions.
///
/// Migration functions are async functions that take a mutable reference to a
/// `MigrationContext` and return a `MigrationResult<()>`. The
/// `#[stockroom::migration]` attribute generates the boxing shim.
pub type MigrationFn = for<'a> fn(
    &'a mut MigrationContext<'a>,
)
    -> Pin<Box<dyn Future<Output = MigrationResult<()>> + Send + 'a>>;

// Register Migration with inventory
inventory::collect!(Migration);

/// Derive a migration version from a source path.
///
/// Used by `#[stockroom::migration]`. Directories and the `.rs` extension are
/// dropped, then an optional leading `m` or `m_`. The version is the leading
/// run of digits and underscores, cut at its last underscore when a name
/// follows, so a name may start with a digit.
///
/// `src/migrations/m2018_12_19_123224_create_products.rs` gives `2018_12_19_123224`,
/// `m2019_01_01_000000_2fa_setup.rs` gives `2019_01_01_000000`.
///
/// Fails to compile (const panic) if the file name has no version.
#[doc(hidden)]
pub const fn __migration_version(path: &str) -> &str {
    let stem = migration_stem(path);
    let (version_end, _) = split_version(stem);
    if version_end == 0 {
        panic!(
            "migration file names must start with a version, e.g. m2018_12_19_123224_create_products.rs"
        );
    }
    sub_str(stem, 0, version_end)
}

/// Derive a migration name from a source path: whatever follows the version.
///
/// `src/migrations/m2018_12_19_123224_create_products.rs` gives `create_products`.
#[doc(hidden)]
pub const fn __migration_name(path: &str) -> &str {
    let stem = migration_stem(path);
    let (_, name_start) = split_version(stem);
    sub_str(stem, name_start, stem.len())
}

const fn migration_stem(path: &str) -> &str {
    let bytes = path.as_bytes();

    let mut start = bytes.len();
    while start > 0 && bytes[start - 1] != b'/' && bytes[start - 1] != b'\\' {
        start -= 1;
    }

    let mut end = bytes.len();
    if end >= start + 3 && bytes[end - 3] == b'.' && bytes[end - 2] == b'r' && bytes[end - 1] == b's'
    {
        end -= 3;
    }

    if end > start + 1 && bytes[start] == b'm' {
        if bytes[start + 1] == b'_' {
            start += 2;
        } else if bytes[start + 1].is_ascii_digit() {
            start += 1;
        }
    }

    sub_str(path, start, end)
}

/// `(end of version, start of name)` within a stem.
const fn split_version(stem: &str) -> (usize, usize) {
    let bytes = stem.as_bytes();
    let mut run = 0;
    while run < bytes.len() && (bytes[run].is_ascii_digit() || bytes[run] == b'_') {
        run += 1;
    }

    // A name follows the run without a separator: the run's tail belongs to it.
    let mut name_start = run;
    if run > 0 && run < bytes.len() && bytes[run - 1] != b'_' {
        while name_start > 0 && bytes[name_start - 1] != b'_' {
            name_start -= 1;
        }
    }

    let mut version_end = name_start;
    while version_end > 0 && bytes[version_end - 1] == b'_' {
        version_end -= 1;
    }
    (version_end, name_start)
}

/// Boundaries passed in here always sit next to ASCII bytes.
const fn sub_str(s: &str, start: usize, end: usize) -> &str {
    let (_, tail) = s.as_bytes().split_at(start);
    let (mid, _) = tail.split_at(end - start);
    match std::str::from_utf8(mid) {
        Ok(s) => s,
        Err(_) => panic!("migration path split inside a UTF-8 sequence"),
    }
}
