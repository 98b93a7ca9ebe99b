//! Database pool initialization.
//!
//! SYSTEM CONTEXT
//! ==============
//! The board schema belongs to the CRUD service; this process only opens a
//! pool against it and never runs migrations.

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Open the `PostgreSQL` connection pool.
///
/// # Errors
///
/// Returns an error if the initial connection fails.
pub async fn init_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect(database_url)
        .await
}
