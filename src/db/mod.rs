pub mod models;
pub mod queries;

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

/// Maximum number of connections in the database pool.
const DB_POOL_MAX_CONNECTIONS: u32 = 5;

/// Open the forecast store and apply pending migrations.
pub async fn connect(database_url: &str) -> Result<SqlitePool, crate::errors::IngestError> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(DB_POOL_MAX_CONNECTIONS)
        .connect_with(options)
        .await?;

    sqlx::migrate!().run(&pool).await?;
    tracing::debug!("Database migrations completed");

    Ok(pool)
}

/// Migrated in-memory database. One connection that never expires, so the
/// schema lives as long as the pool.
#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .unwrap()
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .unwrap();
    sqlx::migrate!().run(&pool).await.unwrap();
    pool
}
