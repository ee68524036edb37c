//! The products migration against real PostgreSQL.
//!
//! Run with: cargo nextest run -p storefront-db --test products
//!
//! Note: Requires Docker to be running. Without it every test returns early.

use chrono::{DateTime, Utc};
use dockside::{Container, containers};
use stockroom::schema::PgType;
use stockroom::{Error, MigrationRunner, diff_table, introspect};
use std::time::Duration;
use storefront_db::{PRODUCTS, products};
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, NoTls};

/// Start PostgreSQL and connect, or `None` when Docker isn't available.
async fn setup_postgres() -> Option<(Container, Client)> {
    storefront_db::ensure_linked();
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

    let conn_str = format!("host=127.0.0.1 port={} user=postgres password=test", port);
    let mut attempts = 0;
    let (client, connection) = loop {
        attempts += 1;
        match tokio_postgres::connect(&conn_str, NoTls).await {
            Ok(result) => break result,
            Err(_) if attempts < 20 => tokio::time::sleep(Duration::from_millis(500)).await,
            Err(e) => panic!("failed to connect to postgres after {attempts} attempts: {e}"),
        }
    };
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            eprintln!("connection error: {}", e);
        }
    });

    Some((container, client))
}

async fn relation_exists(client: &Client, name: &str) -> bool {
    let row = client
        .query_one("SELECT to_regclass($1::text)::text AS t", &[&name])
        .await
        .unwrap();
    row.get::<_, Option<String>>("t").is_some()
}

async fn touch_function_exists(client: &Client) -> bool {
    let row = client
        .query_one(
            "SELECT count(*) AS n FROM pg_proc WHERE proname = 'products_touch_updated_at'",
            &[],
        )
        .await
        .unwrap();
    row.get::<_, i64>("n") > 0
}

#[tokio::test]
async fn test_products_table_shape() {
    let Some((_container, client)) = setup_postgres().await else {
        return;
    };
    let ran = MigrationRunner::new(&client).migrate().await.unwrap();
    assert_eq!(ran.len(), 1);
    assert_eq!(ran[0].version, "2018_12_19_123224");
    assert_eq!(ran[0].name, "create_products");

    let table = introspect::table(&client, PRODUCTS)
        .await
        .unwrap()
        .expect("products exists");

    let columns: Vec<(&str, PgType, bool)> = table
        .columns
        .iter()
        .map(|c| (c.name.as_str(), c.pg_type, c.nullable))
        .collect();
    assert_eq!(
        columns,
        [
            ("id", PgType::BigInt, false),
            ("name", PgType::Text, true),
            ("price", PgType::Integer, true),
            ("image", PgType::Text, true),
            ("created_at", PgType::Timestamptz, false),
            ("updated_at", PgType::Timestamptz, false),
        ]
    );
    assert_eq!(table.primary_key(), ["id"]);
    assert!(table.touch_updated_at);

    // What the migration built is what the descriptor says.
    let diff = diff_table(&products(), Some(&table));
    assert!(diff.is_none(), "unexpected changes: {diff:?}");
    introspect::verify(&client, &stockroom::Schema::collect())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_verify_reports_drift() {
    let Some((_container, client)) = setup_postgres().await else {
        return;
    };
    MigrationRunner::new(&client).migrate().await.unwrap();
    client
        .execute(r#"ALTER TABLE "products" ALTER COLUMN "name" SET NOT NULL"#, &[])
        .await
        .unwrap();

    let err = introspect::verify(&client, &stockroom::Schema::collect())
        .await
        .unwrap_err();
    let Error::SchemaMismatch(message) = err else {
        panic!("expected a schema mismatch, got {err}");
    };
    assert!(message.contains("products"), "{message}");
}

#[tokio::test]
async fn test_applying_twice_fails_with_duplicate_table() {
    let Some((_container, client)) = setup_postgres().await else {
        return;
    };
    let runner = MigrationRunner::new(&client);
    runner.migrate().await.unwrap();

    // Forget the migration without undoing it.
    client
        .execute("DELETE FROM _stockroom_migrations", &[])
        .await
        .unwrap();

    let err = runner.migrate().await.unwrap_err();
    let Error::Migration(err) = err else {
        panic!("expected a migration error, got {err}");
    };
    assert_eq!(err.sql_state(), Some(&SqlState::DUPLICATE_TABLE));
    assert!(
        err.location
            .file()
            .ends_with("m2018_12_19_123224_create_products.rs")
    );

    // The table from the first run is untouched.
    assert!(relation_exists(&client, PRODUCTS).await);
}

#[tokio::test]
async fn test_rollback_removes_table_and_function() {
    let Some((_container, client)) = setup_postgres().await else {
        return;
    };
    let runner = MigrationRunner::new(&client);
    runner.migrate().await.unwrap();
    assert!(touch_function_exists(&client).await);

    let ran = runner.rollback(1).await.unwrap();
    assert_eq!(ran.len(), 1);
    assert!(!relation_exists(&client, PRODUCTS).await);
    assert!(!touch_function_exists(&client).await);

    // Rolling back an empty history is a no-op.
    assert!(runner.rollback(1).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_migrate_rollback_cycles_are_stable() {
    let Some((_container, client)) = setup_postgres().await else {
        return;
    };
    let runner = MigrationRunner::new(&client);

    let mut first = None;
    for _ in 0..3 {
        runner.migrate().await.unwrap();
        let table = introspect::table(&client, PRODUCTS)
            .await
            .unwrap()
            .expect("products exists");
        match &first {
            None => first = Some(table),
            Some(first) => assert_eq!(&table, first),
        }
        runner.rollback(1).await.unwrap();
        assert!(!relation_exists(&client, PRODUCTS).await);
    }
}

#[tokio::test]
async fn test_timestamps_are_maintained() {
    let Some((_container, client)) = setup_postgres().await else {
        return;
    };
    MigrationRunner::new(&client).migrate().await.unwrap();

    let row = client
        .query_one(
            r#"INSERT INTO "products" ("name", "price", "image")
               VALUES ('Widget', 100, 'widget.png')
               RETURNING "id", "created_at", "updated_at""#,
            &[],
        )
        .await
        .unwrap();
    let id: i64 = row.get("id");
    let created_at: DateTime<Utc> = row.get("created_at");
    let updated_at: DateTime<Utc> = row.get("updated_at");
    assert_eq!(id, 1);
    assert_eq!(created_at, updated_at);

    tokio::time::sleep(Duration::from_millis(20)).await;

    let row = client
        .query_one(
            r#"UPDATE "products" SET "price" = 150 WHERE "id" = $1
               RETURNING "created_at", "updated_at""#,
            &[&id],
        )
        .await
        .unwrap();
    let created_after: DateTime<Utc> = row.get("created_at");
    let updated_after: DateTime<Utc> = row.get("updated_at");
    assert_eq!(created_after, created_at);
    assert!(updated_after > updated_at);
}

#[tokio::test]
async fn test_business_columns_accept_nulls() {
    let Some((_container, client)) = setup_postgres().await else {
        return;
    };
    MigrationRunner::new(&client).migrate().await.unwrap();

    let row = client
        .query_one(
            r#"INSERT INTO "products" DEFAULT VALUES RETURNING "name", "price", "image""#,
            &[],
        )
        .await
        .unwrap();
    assert_eq!(row.get::<_, Option<String>>("name"), None);
    assert_eq!(row.get::<_, Option<i32>>("price"), None);
    assert_eq!(row.get::<_, Option<String>>("image"), None);

    let err = client
        .execute(
            r#"INSERT INTO "products" ("created_at") VALUES (NULL)"#,
            &[],
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::NOT_NULL_VIOLATION));
}
