//! The bookkeeping table that records which migrations have run.

/// Name of the bookkeeping table.
pub const MIGRATIONS_TABLE: &str = "_stockroom_migrations";

/// Key for `pg_advisory_xact_lock`, held while a migration is applied or reverted.
///
/// The bytes spell "stockrm!" so the lock is easy to spot in `pg_locks`.
pub const LOCK_KEY: i64 = i64::from_be_bytes(*b"stockrm!");

/// SQL creating the bookkeeping table if it doesn't exist.
pub fn create_meta_tables_sql() -> String {
    format!(
        r#"CREATE TABLE IF NOT EXISTS "{MIGRATIONS_TABLE}" (
    "version" TEXT PRIMARY KEY,
    "name" TEXT NOT NULL,
    "checksum" TEXT NOT NULL,
    "applied_at" TIMESTAMPTZ NOT NULL DEFAULT now(),
    "execution_time_ms" BIGINT NOT NULL
)"#
    )
}

/// SQL recording an applied migration. Parameters: version, name, checksum, execution time in ms.
pub fn record_migration_sql() -> String {
    format!(
        r#"INSERT INTO "{MIGRATIONS_TABLE}" ("version", "name", "checksum", "execution_time_ms") VALUES ($1, $2, $3, $4)"#
    )
}

/// SQL forgetting a reverted migration. Parameter: version.
pub fn forget_migration_sql() -> String {
    format!(r#"DELETE FROM "{MIGRATIONS_TABLE}" WHERE "version" = $1"#)
}

/// SQL checking whether a version is recorded. Parameter: version.
pub fn is_applied_sql() -> String {
    format!(r#"SELECT 1 FROM "{MIGRATIONS_TABLE}" WHERE "version" = $1"#)
}

/// SQL listing every recorded migration, oldest version first.
pub fn applied_migrations_sql() -> String {
    format!(
        r#"SELECT "version", "name", "checksum", "applied_at", "execution_time_ms" FROM "{MIGRATIONS_TABLE}" ORDER BY "version""#
    )
}
