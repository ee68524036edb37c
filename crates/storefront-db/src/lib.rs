//! Storefront database: the `products` table and the migrations that build it.
//!
//! The binary in this crate is the migration tool:
//!
//! ```text
//! storefront-db migrate
//! storefront-db rollback --steps 1
//! storefront-db status
//! ```

use stockroom::schema::{Column, PgType, Table, TableDef};

mod migrations;

/// Name of the products table.
pub const PRODUCTS: &str = "products";

/// The `products` table as the application expects it.
///
/// `name`, `price` and `image` are optional. `price` is a plain integer; no
/// unit or scale is implied.
pub fn products() -> Table {
    Table::new(PRODUCTS)
        .id()
        .column(Column::new("name", PgType::Text))
        .column(Column::new("price", PgType::Integer))
        .column(Column::new("image", PgType::Text))
        .timestamps()
}

stockroom::inventory::submit!(TableDef::new(products));

/// Call from binaries and tests so the linker keeps this crate's registrations.
pub fn ensure_linked() {}
