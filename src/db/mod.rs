//! Database connection pool and migration utilities.

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{ConnectOptions, SqlitePool};

use crate::errors::AppError;

/// Create a SQLite connection pool, creating the database file if missing.
pub async fn create_pool(database_url: &str, echo: bool) -> Result<SqlitePool, AppError> {
    let mut options = SqliteConnectOptions::from_str(database_url)
        .map_err(|e| AppError::Config(format!("invalid database URL {database_url}: {e}")))?
        .create_if_missing(true)
        .foreign_keys(true);

    if !echo {
        options = options.disable_statement_logging();
    }

    // Single connection: ingestion is one logical worker, and an in-memory
    // database only exists on the connection that opened it.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Apply the embedded migrations.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), AppError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
