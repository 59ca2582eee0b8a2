//! Embedded schema migrations.

use super::DbError;
use sqlx::SqlitePool;
use tracing::info;

/// Brings the database schema up to date.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), DbError> {
    info!("Running SQLite migrations");
    sqlx::migrate!("src/db/migrations/sqlite").run(pool).await?;
    info!("Migrations completed successfully");
    Ok(())
}
