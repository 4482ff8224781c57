//! PostgreSQL implementations of the document store and audit log

mod append_log;
mod document_store;

pub use append_log::*;
pub use document_store::*;

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

/// Open a connection pool.
pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(url)
        .await
}
