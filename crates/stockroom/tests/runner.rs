//! Migration runner tests against real PostgreSQL.
//!
//! Run with: cargo nextest run -p stockroom --test runner
//!
//! Note: Requires Docker to be running. Without it every test returns early.

use dockside::{Container, containers};
use stockroom::{
    Direction, Error, Migration, MigrationContext, MigrationResult, MigrationRunner,
    MigrationState,
};
use std::time::Duration;
use tokio_postgres::{Client, NoTls};

mod create_gadgets {
    use super::*;

    #[stockroom::migration(version = "2020_01_01_000000", name = "create_gadgets", down = revert)]
    pub async fn migrate(ctx: &mut MigrationContext<'_>) -> MigrationResult<()> {
        ctx.execute(r#"CREATE TABLE "gadgets" ("id" BIGINT PRIMARY KEY, "label" TEXT)"#)
            .await?;
        Ok(())
    }

    pub async fn revert(ctx: &mut MigrationContext<'_>) -> MigrationResult<()> {
        ctx.execute(r#"DROP TABLE "gadgets""#).await?;
        Ok(())
    }
}

mod add_gadget_color {
    use super::*;

    #[stockroom::migration(version = "2020_01_02_000000", name = "add_gadget_color", down = revert)]
    pub async fn migrate(ctx: &mut MigrationContext<'_>) -> MigrationResult<()> {
        ctx.execute(r#"ALTER TABLE "gadgets" ADD COLUMN "color" TEXT"#)
            .await?;
        Ok(())
    }

    pub async fn revert(ctx: &mut MigrationContext<'_>) -> MigrationResult<()> {
        ctx.execute(r#"ALTER TABLE "gadgets" DROP COLUMN "color""#)
            .await?;
        Ok(())
    }
}

mod index_gadgets {
    use super::*;

    #[stockroom::migration(version = "2020_01_03_000000", name = "index_gadgets")]
    pub async fn migrate(ctx: &mut MigrationContext<'_>) -> MigrationResult<()> {
        ctx.execute(r#"CREATE INDEX "gadgets_label_idx" ON "gadgets" ("label")"#)
            .await?;
        Ok(())
    }
}

mod half_done {
    use super::*;

    #[stockroom::migration(version = "2020_02_01_000000", name = "half_done")]
    pub async fn migrate(ctx: &mut MigrationContext<'_>) -> MigrationResult<()> {
        ctx.execute(r#"CREATE TABLE "half_done" ("id" BIGINT)"#).await?;
        ctx.execute("SELEC 1").await?;
        Ok(())
    }
}

mod refuses {
    use super::*;

    #[stockroom::migration(version = "2020_02_02_000000", name = "refuses")]
    pub async fn migrate(ctx: &mut MigrationContext<'_>) -> MigrationResult<()> {
        ctx.execute(r#"CREATE TABLE "refused" ("id" BIGINT)"#).await?;
        Err(stockroom::MigrationError::new("refusing to continue"))
    }
}

mod batch_widgets {
    use super::*;

    #[stockroom::migration(version = "2020_03_01_000000", name = "batch_widgets", down = revert)]
    pub async fn migrate(ctx: &mut MigrationContext<'_>) -> MigrationResult<()> {
        ctx.batch_execute(
            r#"CREATE TABLE "widgets" ("id" BIGINT PRIMARY KEY, "label" TEXT);
               CREATE INDEX "widgets_label_idx" ON "widgets" ("label")"#,
        )
        .await?;
        Ok(())
    }

    pub async fn revert(ctx: &mut MigrationContext<'_>) -> MigrationResult<()> {
        ctx.batch_execute(r#"DROP INDEX "widgets_label_idx"; DROP TABLE "widgets""#)
            .await?;
        Ok(())
    }
}

mod batch_half_done {
    use super::*;

    pub const SQL: &str = r#"CREATE TABLE "batch_half" ("id" BIGINT); SELEC 1"#;

    #[stockroom::migration(version = "2020_03_02_000000", name = "batch_half_done")]
    pub async fn migrate(ctx: &mut MigrationContext<'_>) -> MigrationResult<()> {
        ctx.batch_execute(SQL).await?;
        Ok(())
    }
}

const CREATE_GADGETS: &str = "2020_01_01_000000";
const ADD_GADGET_COLOR: &str = "2020_01_02_000000";
const INDEX_GADGETS: &str = "2020_01_03_000000";
const HALF_DONE: &str = "2020_02_01_000000";
const REFUSES: &str = "2020_02_02_000000";
const BATCH_WIDGETS: &str = "2020_03_01_000000";
const BATCH_HALF_DONE: &str = "2020_03_02_000000";

/// The registered migrations with the given versions.
fn migrations(versions: &[&str]) -> Vec<&'static Migration> {
    Migration::collect()
        .unwrap()
        .into_iter()
        .filter(|m| versions.contains(&m.version))
        .collect()
}

async fn connect(port: u16) -> Client {
    let conn_str = format!("host=127.0.0.1 port={} user=postgres password=test", port);

    let mut attempts = 0;
    let max_attempts = 20;
    let (client, connection) = loop {
        attempts += 1;
        match tokio_postgres::connect(&conn_str, NoTls).await {
            Ok(result) => break result,
            Err(e) if attempts < max_attempts => {
                tracing::debug!("Connection attempt {} failed: {}, retrying...", attempts, e);
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            Err(e) => panic!(
                "failed to connect to postgres after {} attempts: {}",
                attempts, e
            ),
        }
    };

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            eprintln!("connection error: {}", e);
        }
    });

    client
}

/// Start PostgreSQL, or `None` when Docker isn't available.
async fn setup_postgres() -> Option<(Container, u16, Client)> {
    if !dockside::is_available() {
        eprintln!("docker is not available, skipping");
        return None;
    }

    let container = Container::run(containers::postgres("16-alpine", "test"))
        .expect("failed to start postgres container");
    container
        .wait_for_log(
            "database system is ready to accept connections",
            Duration::from_secs(30),
        )
        .expect("postgres did not become ready");
    let port = container
        .wait_for_port(5432, Duration::from_secs(10))
        .expect("postgres port not available");

    let client = connect(port).await;
    Some((container, port, client))
}

async fn table_exists(client: &Client, name: &str) -> bool {
    let row = client
        .query_one("SELECT to_regclass($1::text)::text AS t", &[&name])
        .await
        .unwrap();
    row.get::<_, Option<String>>("t").is_some()
}

#[tokio::test]
async fn test_migrate_applies_in_version_order() {
    let Some((_container, _port, client)) = setup_postgres().await else {
        return;
    };
    // Order given here doesn't matter; versions decide.
    let runner = MigrationRunner::with_migrations(
        &client,
        migrations(&[ADD_GADGET_COLOR, CREATE_GADGETS]),
    );

    let ran = runner.migrate().await.unwrap();
    let versions: Vec<&str> = ran.iter().map(|r| r.version.as_str()).collect();
    assert_eq!(versions, [CREATE_GADGETS, ADD_GADGET_COLOR]);
    assert!(ran.iter().all(|r| r.direction == Direction::Up));

    let applied = runner.applied().await.unwrap();
    assert_eq!(applied.len(), 2);
    assert_eq!(applied[0].name, "create_gadgets");
    assert_eq!(applied[1].name, "add_gadget_color");

    // Second run has nothing to do.
    assert!(runner.migrate().await.unwrap().is_empty());
    assert!(runner.pending().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_rollback_reverts_newest_first() {
    let Some((_container, _port, client)) = setup_postgres().await else {
        return;
    };
    let runner = MigrationRunner::with_migrations(
        &client,
        migrations(&[CREATE_GADGETS, ADD_GADGET_COLOR]),
    );
    runner.migrate().await.unwrap();

    let ran = runner.rollback(1).await.unwrap();
    assert_eq!(ran.len(), 1);
    assert_eq!(ran[0].version, ADD_GADGET_COLOR);
    assert_eq!(ran[0].direction, Direction::Down);

    let status = runner.status().await.unwrap();
    assert!(matches!(status[0].state, MigrationState::Applied { .. }));
    assert_eq!(status[1].state, MigrationState::Pending);

    // More steps than applied migrations just reverts everything.
    let ran = runner.rollback(5).await.unwrap();
    assert_eq!(ran.len(), 1);
    assert_eq!(ran[0].version, CREATE_GADGETS);
    assert!(!table_exists(&client, "gadgets").await);

    // Nothing left: a no-op, not an error.
    assert!(runner.rollback(1).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_redo_reverts_and_reapplies() {
    let Some((_container, _port, client)) = setup_postgres().await else {
        return;
    };
    let runner = MigrationRunner::with_migrations(
        &client,
        migrations(&[CREATE_GADGETS, ADD_GADGET_COLOR]),
    );
    runner.migrate().await.unwrap();
    let before = runner.applied().await.unwrap();

    let ran = runner.redo().await.unwrap();
    assert_eq!(ran.len(), 2);
    assert_eq!(ran[0].direction, Direction::Down);
    assert_eq!(ran[1].direction, Direction::Up);
    assert_eq!(ran[1].version, ADD_GADGET_COLOR);

    let after = runner.applied().await.unwrap();
    assert_eq!(after.len(), before.len());
    assert!(after[1].applied_at >= before[1].applied_at);
}

#[tokio::test]
async fn test_irreversible_migration_cannot_be_rolled_back() {
    let Some((_container, _port, client)) = setup_postgres().await else {
        return;
    };
    let runner = MigrationRunner::with_migrations(
        &client,
        migrations(&[CREATE_GADGETS, INDEX_GADGETS]),
    );
    runner.migrate().await.unwrap();

    let err = runner.rollback(1).await.unwrap_err();
    assert!(
        matches!(&err, Error::Irreversible { version } if version == INDEX_GADGETS),
        "unexpected error: {err}"
    );
    // Still recorded.
    assert_eq!(runner.applied().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_failed_migration_leaves_no_trace() {
    let Some((_container, _port, client)) = setup_postgres().await else {
        return;
    };
    let runner = MigrationRunner::with_migrations(&client, migrations(&[HALF_DONE]));

    let err = runner.migrate().await.unwrap_err();
    let Error::Migration(err) = err else {
        panic!("expected a migration error, got {err}");
    };
    assert!(err.location.file().ends_with("runner.rs"));
    let ctx = err.sql.as_ref().expect("statement context");
    assert_eq!(ctx.sql, "SELEC 1");
    assert_eq!(ctx.code.as_deref(), Some("42601"));

    // The CREATE TABLE before the failing statement was rolled back too.
    assert!(!table_exists(&client, "half_done").await);
    assert_eq!(runner.pending().await.unwrap().len(), 1);
    assert!(runner.applied().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_batch_migration_applies_and_reverts() {
    let Some((_container, _port, client)) = setup_postgres().await else {
        return;
    };
    let runner = MigrationRunner::with_migrations(&client, migrations(&[BATCH_WIDGETS]));

    let ran = runner.migrate().await.unwrap();
    assert_eq!(ran.len(), 1);
    assert!(table_exists(&client, "widgets").await);
    assert!(table_exists(&client, "widgets_label_idx").await);

    runner.rollback(1).await.unwrap();
    assert!(!table_exists(&client, "widgets").await);
    assert!(!table_exists(&client, "widgets_label_idx").await);
    assert!(runner.applied().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_batch_reports_whole_batch() {
    let Some((_container, _port, client)) = setup_postgres().await else {
        return;
    };
    let runner = MigrationRunner::with_migrations(&client, migrations(&[BATCH_HALF_DONE]));

    let err = runner.migrate().await.unwrap_err();
    let Error::Migration(err) = err else {
        panic!("expected a migration error, got {err}");
    };
    assert!(err.location.file().ends_with("runner.rs"));
    let ctx = err.sql.as_ref().expect("statement context");
    assert_eq!(ctx.sql, batch_half_done::SQL);
    assert_eq!(ctx.code.as_deref(), Some("42601"));

    assert!(!table_exists(&client, "batch_half").await);
    assert!(runner.applied().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_migration_error_without_sql() {
    let Some((_container, _port, client)) = setup_postgres().await else {
        return;
    };
    let runner = MigrationRunner::with_migrations(&client, migrations(&[REFUSES]));

    let err = runner.migrate().await.unwrap_err();
    let Error::Migration(err) = err else {
        panic!("expected a migration error, got {err}");
    };
    assert_eq!(err.message, "refusing to continue");
    assert!(err.sql.is_none());
    assert!(!table_exists(&client, "refused").await);
}

#[tokio::test]
async fn test_apply_and_revert_check_bookkeeping() {
    let Some((_container, _port, client)) = setup_postgres().await else {
        return;
    };
    let runner = MigrationRunner::with_migrations(&client, migrations(&[CREATE_GADGETS]));
    let migration = migrations(&[CREATE_GADGETS])[0];

    let err = runner.revert(migration).await.unwrap_err();
    assert!(matches!(err, Error::NotApplied { .. }), "unexpected error: {err}");

    runner.apply(migration).await.unwrap();
    let err = runner.apply(migration).await.unwrap_err();
    assert!(matches!(err, Error::AlreadyApplied { .. }), "unexpected error: {err}");
}

#[tokio::test]
async fn test_status_reports_orphaned_and_modified() {
    let Some((_container, _port, client)) = setup_postgres().await else {
        return;
    };
    MigrationRunner::with_migrations(&client, migrations(&[CREATE_GADGETS]))
        .migrate()
        .await
        .unwrap();

    // A binary that doesn't know about create_gadgets.
    let runner = MigrationRunner::with_migrations(&client, migrations(&[ADD_GADGET_COLOR]));
    let status = runner.status().await.unwrap();
    assert_eq!(status.len(), 2);
    assert_eq!(status[0].version, CREATE_GADGETS);
    assert!(matches!(status[0].state, MigrationState::Orphaned { .. }));
    assert_eq!(status[1].state, MigrationState::Pending);

    client
        .execute(
            "UPDATE _stockroom_migrations SET checksum = 'edited' WHERE version = $1",
            &[&CREATE_GADGETS],
        )
        .await
        .unwrap();
    let runner = MigrationRunner::with_migrations(&client, migrations(&[CREATE_GADGETS]));
    let status = runner.status().await.unwrap();
    assert!(matches!(
        status[0].state,
        MigrationState::Applied { modified: true, .. }
    ));
}

#[tokio::test]
async fn test_concurrent_runners_apply_once() {
    let Some((_container, port, client)) = setup_postgres().await else {
        return;
    };
    let other = connect(port).await;
    let set = migrations(&[CREATE_GADGETS, ADD_GADGET_COLOR]);

    let a = MigrationRunner::with_migrations(&client, set.clone());
    let b = MigrationRunner::with_migrations(&other, set);
    let (ran_a, ran_b) = tokio::join!(a.migrate(), b.migrate());
    let total = ran_a.unwrap().len() + ran_b.unwrap().len();

    assert_eq!(total, 2);
    assert_eq!(a.applied().await.unwrap().len(), 2);
}
