//! Migration: create-products
//! Created: 2018-12-19 12:32:24 UTC

use stockroom::{MigrationContext, MigrationResult};

const CREATE_PRODUCTS: &str = r#"CREATE TABLE "products" (
    "id" BIGINT GENERATED BY DEFAULT AS IDENTITY PRIMARY KEY,
    "name" TEXT,
    "price" INTEGER,
    "image" TEXT,
    "created_at" TIMESTAMPTZ NOT NULL DEFAULT now(),
    "updated_at" TIMESTAMPTZ NOT NULL DEFAULT now()
)"#;

const CREATE_TOUCH_FUNCTION: &str = r#"CREATE OR REPLACE FUNCTION "products_touch_updated_at"() RETURNS trigger LANGUAGE plpgsql AS $$
BEGIN
    NEW."updated_at" := now();
    RETURN NEW;
END;
$$"#;

const CREATE_TOUCH_TRIGGER: &str = r#"CREATE TRIGGER "products_touch_updated_at" BEFORE UPDATE ON "products" FOR EACH ROW EXECUTE FUNCTION "products_touch_updated_at"()"#;

const DROP_PRODUCTS: &str = r#"DROP TABLE "products""#;

const DROP_TOUCH_FUNCTION: &str = r#"DROP FUNCTION IF EXISTS "products_touch_updated_at"()"#;

#[stockroom::migration(down = revert)]
pub async fn migrate(ctx: &mut MigrationContext<'_>) -> MigrationResult<()> {
    ctx.execute(CREATE_PRODUCTS).await?;
    ctx.execute(CREATE_TOUCH_FUNCTION).await?;
    ctx.execute(CREATE_TOUCH_TRIGGER).await?;
    Ok(())
}

pub async fn revert(ctx: &mut MigrationContext<'_>) -> MigrationResult<()> {
    // Dropping the table takes its trigger with it.
    ctx.execute(DROP_PRODUCTS).await?;
    ctx.execute(DROP_TOUCH_FUNCTION).await?;
    Ok(())
}
