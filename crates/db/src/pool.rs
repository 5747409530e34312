//! SQLite connection pool.

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use crate::DbError;

/// Type alias for the shared SQLite pool used across the whole application.
pub type DbPool = SqlitePool;

/// Create a new connection pool from the given `database_url`, creating the
/// database file if it does not exist.
///
/// In-memory databases are private to one connection, so the pool is capped
/// at a single connection for them.
pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<DbPool, DbError> {
    let in_memory = database_url.contains(":memory:");
    let max_connections = if in_memory { 1 } else { max_connections };
    info!(max_connections, in_memory, "Connecting to database");

    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Run embedded SQLx migrations located in `./migrations` (relative to the
/// workspace root at build time).
pub async fn run_migrations(pool: &DbPool) -> Result<(), DbError> {
    info!("Running database migrations");
    sqlx::migrate!("../../migrations").run(pool).await?;
    Ok(())
}
