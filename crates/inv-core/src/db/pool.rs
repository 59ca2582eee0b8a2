//! SQLite pool setup.

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use super::DbError;

/// Pool sizing and wait limits.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolOptions {
    pub max_connections: u32,
    pub min_connections: u32,
    /// Wait for a free connection before failing with `PoolExhausted`.
    pub acquire_timeout: Duration,
    /// Wait on a locked database file before failing with `Busy`.
    pub busy_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(30),
            busy_timeout: Duration::from_secs(5),
        }
    }
}

impl PoolOptions {
    /// Defaults overridden by `INVENTORY_DB_MAX_CONNECTIONS`,
    /// `INVENTORY_DB_MIN_CONNECTIONS` and `INVENTORY_DB_ACQUIRE_TIMEOUT_SECS`.
    /// Unparseable values are ignored.
    pub fn from_env() -> Self {
        fn var<T: FromStr>(key: &str) -> Option<T> {
            std::env::var(key).ok()?.parse().ok()
        }

        let mut options = Self::default();
        if let Some(max) = var("INVENTORY_DB_MAX_CONNECTIONS") {
            options.max_connections = max;
        }
        if let Some(min) = var("INVENTORY_DB_MIN_CONNECTIONS") {
            options.min_connections = min;
        }
        if let Some(secs) = var::<u64>("INVENTORY_DB_ACQUIRE_TIMEOUT_SECS") {
            options.acquire_timeout = Duration::from_secs(secs);
        }
        options
    }

    fn validate(&self) -> Result<(), DbError> {
        if self.max_connections == 0 || self.min_connections > self.max_connections {
            return Err(DbError::Configuration(format!(
                "pool needs 0 < min ({}) <= max ({}) connections",
                self.min_connections, self.max_connections
            )));
        }
        Ok(())
    }
}

fn connect_options(database_url: &str, busy_timeout: Duration) -> Result<SqliteConnectOptions, DbError> {
    if !database_url.starts_with("sqlite:") {
        return Err(DbError::Configuration(format!(
            "expected a sqlite: URL, got '{}'",
            database_url
        )));
    }

    Ok(SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(busy_timeout))
}

/// Opens a pool for a `sqlite:` URL with [`PoolOptions::from_env`], creating
/// the database file if it does not exist.
pub async fn create_pool(database_url: &str) -> Result<SqlitePool, DbError> {
    create_pool_with_options(database_url, PoolOptions::from_env()).await
}

pub async fn create_pool_with_options(
    database_url: &str,
    options: PoolOptions,
) -> Result<SqlitePool, DbError> {
    options.validate()?;
    let connect = connect_options(database_url, options.busy_timeout)?;

    info!(
        max_connections = options.max_connections,
        busy_timeout_ms = options.busy_timeout.as_millis() as u64,
        "Opening inventory database"
    );
    Ok(SqlitePoolOptions::new()
        .max_connections(options.max_connections)
        .min_connections(options.min_connections)
        .acquire_timeout(options.acquire_timeout)
        .connect_with(connect)
        .await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rejects_other_schemes() {
        let err = create_pool("postgres://localhost/inventory").await.unwrap_err();
        assert!(matches!(err, DbError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_rejects_inverted_sizes() {
        let options = PoolOptions {
            min_connections: 4,
            max_connections: 2,
            ..Default::default()
        };
        let err = create_pool_with_options("sqlite::memory:", options)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Configuration(_)));
    }
}
