//! Migration registry and runner.

use crate::error::{Error, MigrationError};
use crate::meta;
use crate::traced::{Connection, ConnectionExt};
use crate::{MigrationFn, MigrationResult, Result};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::panic::Location;
use std::time::{Duration, Instant};

/// A migration registered with `#[stockroom::migration]`.
pub struct Migration {
    /// Ordered identifier, e.g. `2018_12_19_123224`.
    pub version: &'static str,
    /// Human-readable name, e.g. `create_products`.
    pub name: &'static str,
    /// blake3 of the `up` function's tokens, used to spot edited migrations.
    pub checksum: &'static str,
    pub source_file: &'static str,
    pub up: MigrationFn,
    /// `None` for migrations that cannot be rolled back.
    pub down: Option<MigrationFn>,
}

impl Migration {
    /// All registered migrations, sorted by version.
    ///
    /// Fails if two migrations share a version.
    pub fn collect() -> Result<Vec<&'static Migration>> {
        sort_and_check(inventory::iter::<Migration>.into_iter().collect())
    }

    pub fn is_reversible(&self) -> bool {
        self.down.is_some()
    }
}

impl fmt::Debug for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migration")
            .field("version", &self.version)
            .field("name", &self.name)
            .field("checksum", &self.checksum)
            .field("source_file", &self.source_file)
            .field("reversible", &self.is_reversible())
            .finish()
    }
}

fn sort_and_check(mut migrations: Vec<&'static Migration>) -> Result<Vec<&'static Migration>> {
    migrations.sort_by(|a, b| a.version.cmp(b.version));
    if let Some(pair) = migrations
        .windows(2)
        .find(|pair| pair[0].version == pair[1].version)
    {
        return Err(Error::DuplicateVersion {
            version: pair[0].version.to_string(),
        });
    }
    Ok(migrations)
}

/// Handed to migration functions; runs statements inside the migration's transaction.
pub struct MigrationContext<'a> {
    conn: &'a dyn Connection,
    version: &'a str,
}

impl<'a> MigrationContext<'a> {
    pub(crate) fn new(conn: &'a dyn Connection, version: &'a str) -> Self {
        Self { conn, version }
    }

    /// Version of the migration being run.
    pub fn version(&self) -> &str {
        self.version
    }

    /// The underlying connection, for statements that need parameters.
    pub fn connection(&self) -> &'a dyn Connection {
        self.conn
    }

    /// Execute a single statement.
    ///
    /// On failure the error records the statement, its SQLSTATE, and the
    /// location of this call in the migration file.
    #[track_caller]
    pub fn execute<'s>(
        &'s self,
        sql: &'s str,
    ) -> impl Future<Output = MigrationResult<u64>> + Send + 's {
        let location = Location::caller();
        async move {
            self.conn
                .traced()
                .execute(sql, &[])
                .await
                .map_err(|e| MigrationError::from_statement(e, sql, location))
        }
    }

    /// Execute several semicolon-separated statements.
    #[track_caller]
    pub fn batch_execute<'s>(
        &'s self,
        sql: &'s str,
    ) -> impl Future<Output = MigrationResult<()>> + Send + 's {
        let location = Location::caller();
        async move {
            self.conn
                .traced()
                .batch_execute(sql)
                .await
                .map_err(|e| MigrationError::from_statement(e, sql, location))
        }
    }
}

/// A row of the bookkeeping table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMigration {
    pub version: String,
    pub name: String,
    pub checksum: String,
    pub applied_at: DateTime<Utc>,
    pub execution_time_ms: i64,
}

impl AppliedMigration {
    fn from_row(row: &tokio_postgres::Row) -> Result<Self> {
        Ok(Self {
            version: row.try_get("version")?,
            name: row.try_get("name")?,
            checksum: row.try_get("checksum")?,
            applied_at: row.try_get("applied_at")?,
            execution_time_ms: row.try_get("execution_time_ms")?,
        })
    }
}

/// Which way a migration was run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Up => write!(f, "up"),
            Direction::Down => write!(f, "down"),
        }
    }
}

/// A migration that was just applied or reverted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RanMigration {
    pub version: String,
    pub name: String,
    pub direction: Direction,
    pub duration: Duration,
}

/// Where a migration stands relative to the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationState {
    Pending,
    Applied {
        applied_at: DateTime<Utc>,
        /// The recorded checksum differs from the compiled one.
        modified: bool,
    },
    /// Recorded in the database, unknown to this binary.
    Orphaned { applied_at: DateTime<Utc> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStatus {
    pub version: String,
    pub name: String,
    pub state: MigrationState,
}

fn compute_status(
    known: &[&'static Migration],
    applied: &[AppliedMigration],
) -> Vec<MigrationStatus> {
    let mut statuses: Vec<MigrationStatus> = known
        .iter()
        .map(|m| {
            let state = match applied.iter().find(|a| a.version == m.version) {
                Some(a) => MigrationState::Applied {
                    applied_at: a.applied_at,
                    modified: a.checksum != m.checksum,
                },
                None => MigrationState::Pending,
            };
            MigrationStatus {
                version: m.version.to_string(),
                name: m.name.to_string(),
                state,
            }
        })
        .collect();

    let known_versions: HashSet<&str> = known.iter().map(|m| m.version).collect();
    statuses.extend(
        applied
            .iter()
            .filter(|a| !known_versions.contains(a.version.as_str()))
            .map(|a| MigrationStatus {
                version: a.version.clone(),
                name: a.name.clone(),
                state: MigrationState::Orphaned {
                    applied_at: a.applied_at,
                },
            }),
    );

    statuses.sort_by(|a, b| a.version.cmp(&b.version));
    statuses
}

/// Applies and reverts migrations against one connection.
///
/// Every apply or revert runs in its own transaction together with its
/// bookkeeping row, under a transaction-scoped advisory lock so that two
/// runners pointed at the same database take turns.
///
/// ```ignore
/// let runner = MigrationRunner::new(&client);
/// runner.migrate().await?;
/// ```
pub struct MigrationRunner<'a> {
    conn: &'a dyn Connection,
    migrations: Option<Vec<&'static Migration>>,
}

impl<'a> MigrationRunner<'a> {
    /// A runner over every migration registered in this binary.
    pub fn new(conn: &'a dyn Connection) -> Self {
        Self {
            conn,
            migrations: None,
        }
    }

    /// A runner over an explicit set of migrations.
    pub fn with_migrations(
        conn: &'a dyn Connection,
        migrations: impl IntoIterator<Item = &'static Migration>,
    ) -> Self {
        Self {
            conn,
            migrations: Some(migrations.into_iter().collect()),
        }
    }

    /// The migrations this runner knows about, sorted by version.
    pub fn migrations(&self) -> Result<Vec<&'static Migration>> {
        match &self.migrations {
            Some(list) => sort_and_check(list.clone()),
            None => Migration::collect(),
        }
    }

    fn find(&self, version: &str) -> Result<&'static Migration> {
        self.migrations()?
            .into_iter()
            .find(|m| m.version == version)
            .ok_or_else(|| Error::UnknownMigration {
                version: version.to_string(),
            })
    }

    /// Create the bookkeeping table if it doesn't exist yet.
    pub async fn ensure_meta_table(&self) -> Result<()> {
        self.begin().await?;
        let result = async {
            self.lock().await?;
            self.conn
                .traced()
                .batch_execute(&meta::create_meta_tables_sql())
                .await?;
            Ok::<_, Error>(())
        }
        .await;
        self.finish(result).await
    }

    /// Applied migrations, oldest version first.
    pub async fn applied(&self) -> Result<Vec<AppliedMigration>> {
        self.ensure_meta_table().await?;
        let rows = self
            .conn
            .traced()
            .query(&meta::applied_migrations_sql(), &[])
            .await?;
        rows.iter().map(AppliedMigration::from_row).collect()
    }

    /// Known migrations that have not been applied, in the order they would run.
    pub async fn pending(&self) -> Result<Vec<&'static Migration>> {
        let applied: HashSet<String> = self
            .applied()
            .await?
            .into_iter()
            .map(|a| a.version)
            .collect();
        Ok(self
            .migrations()?
            .into_iter()
            .filter(|m| !applied.contains(m.version))
            .collect())
    }

    /// Apply every pending migration, oldest first.
    ///
    /// Stops at the first failure; migrations applied before it stay applied.
    pub async fn migrate(&self) -> Result<Vec<RanMigration>> {
        let pending = self.pending().await?;
        if pending.is_empty() {
            tracing::info!("database is up to date");
            return Ok(Vec::new());
        }

        tracing::info!(count = pending.len(), "applying pending migrations");
        let mut ran = Vec::with_capacity(pending.len());
        for migration in pending {
            match self.apply(migration).await {
                Ok(r) => ran.push(r),
                Err(Error::AlreadyApplied { version }) => {
                    tracing::info!(%version, "migration was applied concurrently, skipping");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(ran)
    }

    /// Apply one migration.
    pub async fn apply(&self, migration: &'static Migration) -> Result<RanMigration> {
        self.ensure_meta_table().await?;
        let start = Instant::now();
        self.begin().await?;
        let result = self.apply_locked(migration, start).await;
        self.finish(result).await
    }

    async fn apply_locked(
        &self,
        migration: &'static Migration,
        start: Instant,
    ) -> Result<RanMigration> {
        self.lock().await?;
        if self.is_applied(migration.version).await? {
            return Err(Error::AlreadyApplied {
                version: migration.version.to_string(),
            });
        }

        let mut ctx = MigrationContext::new(self.conn, migration.version);
        (migration.up)(&mut ctx).await?;

        let duration = start.elapsed();
        let elapsed_ms = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        self.conn
            .traced()
            .execute(
                &meta::record_migration_sql(),
                &[
                    &migration.version,
                    &migration.name,
                    &migration.checksum,
                    &elapsed_ms,
                ],
            )
            .await?;

        tracing::info!(
            version = migration.version,
            name = migration.name,
            elapsed_ms,
            "applied migration"
        );
        Ok(RanMigration {
            version: migration.version.to_string(),
            name: migration.name.to_string(),
            direction: Direction::Up,
            duration,
        })
    }

    /// Revert one migration.
    pub async fn revert(&self, migration: &'static Migration) -> Result<RanMigration> {
        let Some(down) = migration.down else {
            return Err(Error::Irreversible {
                version: migration.version.to_string(),
            });
        };
        self.ensure_meta_table().await?;
        let start = Instant::now();
        self.begin().await?;
        let result = self.revert_locked(migration, down, start).await;
        self.finish(result).await
    }

    async fn revert_locked(
        &self,
        migration: &'static Migration,
        down: MigrationFn,
        start: Instant,
    ) -> Result<RanMigration> {
        self.lock().await?;
        if !self.is_applied(migration.version).await? {
            return Err(Error::NotApplied {
                version: migration.version.to_string(),
            });
        }

        let mut ctx = MigrationContext::new(self.conn, migration.version);
        down(&mut ctx).await?;

        self.conn
            .traced()
            .execute(&meta::forget_migration_sql(), &[&migration.version])
            .await?;

        let duration = start.elapsed();
        tracing::info!(
            version = migration.version,
            name = migration.name,
            elapsed_ms = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX),
            "reverted migration"
        );
        Ok(RanMigration {
            version: migration.version.to_string(),
            name: migration.name.to_string(),
            direction: Direction::Down,
            duration,
        })
    }

    /// Revert the `steps` most recently applied migrations, newest first.
    ///
    /// With nothing applied this does nothing and returns an empty list.
    pub async fn rollback(&self, steps: usize) -> Result<Vec<RanMigration>> {
        let applied = self.applied().await?;
        if applied.is_empty() {
            tracing::info!("nothing to roll back");
            return Ok(Vec::new());
        }

        let mut ran = Vec::new();
        for record in applied.iter().rev().take(steps) {
            let migration = self.find(&record.version)?;
            ran.push(self.revert(migration).await?);
        }
        Ok(ran)
    }

    /// Revert the newest applied migration and apply it again.
    pub async fn redo(&self) -> Result<Vec<RanMigration>> {
        let mut ran = self.rollback(1).await?;
        let Some(reverted) = ran.first() else {
            return Ok(ran);
        };
        let migration = self.find(&reverted.version)?;
        ran.push(self.apply(migration).await?);
        Ok(ran)
    }

    /// Every known or recorded migration and its state, sorted by version.
    pub async fn status(&self) -> Result<Vec<MigrationStatus>> {
        let applied = self.applied().await?;
        let known = self.migrations()?;
        Ok(compute_status(&known, &applied))
    }

    async fn is_applied(&self, version: &str) -> Result<bool> {
        let row = self
            .conn
            .traced()
            .query_opt(&meta::is_applied_sql(), &[&version])
            .await?;
        Ok(row.is_some())
    }

    async fn begin(&self) -> Result<()> {
        self.conn.traced().batch_execute("BEGIN").await?;
        Ok(())
    }

    async fn lock(&self) -> Result<()> {
        self.conn
            .traced()
            .execute("SELECT pg_advisory_xact_lock($1)", &[&meta::LOCK_KEY])
            .await?;
        Ok(())
    }

    /// Commit on success, roll back on failure.
    async fn finish<T>(&self, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => {
                self.conn.traced().batch_execute("COMMIT").await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.conn.traced().batch_execute("ROLLBACK").await {
                    tracing::warn!(error = %rollback_err, "rollback failed");
                }
                Err(err)
            }
        }
    }
}
