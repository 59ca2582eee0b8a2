//! Persistence errors.

use thiserror::Error;

/// Failure of a repository or store call.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("Cannot reach the inventory database: {0}")]
    Connection(String),

    #[error("Inventory query failed: {0}")]
    Query(String),

    /// The database is busy or a table is locked by another writer.
    #[error("Inventory database is busy: {0}")]
    Busy(String),

    #[error("{entity} {id} does not exist")]
    NotFound { entity: &'static str, id: i64 },

    /// A unique name or foreign key rejected the write.
    #[error("Constraint violation: {0}")]
    Constraint(String),

    /// A stored value (variables, timestamp, run status) could not be read back.
    #[error("Cannot decode stored value: {0}")]
    Decode(String),

    #[error("Schema migration failed: {0}")]
    Migration(String),

    #[error("Connection pool exhausted")]
    PoolExhausted,

    #[error("Invalid database configuration: {0}")]
    Configuration(String),
}

impl DbError {
    pub(crate) fn not_found(entity: &'static str, id: i64) -> Self {
        DbError::NotFound { entity, id }
    }

    /// Returns `true` if repeating the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            DbError::PoolExhausted | DbError::Busy(_) => true,
            DbError::Connection(message) => {
                let message = message.to_lowercase();
                ["timed out", "timeout", "connection reset", "connection refused", "broken pipe"]
                    .iter()
                    .any(|needle| message.contains(needle))
            }
            _ => false,
        }
    }
}

// SQLITE_BUSY and SQLITE_LOCKED; extended codes keep the primary code in the low byte.
#[cfg(feature = "database")]
fn is_busy_code(code: Option<&str>) -> bool {
    code.and_then(|c| c.parse::<i32>().ok())
        .map(|c| matches!(c & 0xff, 5 | 6))
        .unwrap_or(false)
}

/// Returns `true` if `err` is SQLite reporting a busy or locked database.
#[cfg(feature = "database")]
pub(crate) fn is_busy(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => is_busy_code(db_err.code().as_deref()),
        _ => false,
    }
}

#[cfg(feature = "database")]
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(ref db_err) => {
                let message = db_err.message().to_string();
                if is_busy_code(db_err.code().as_deref()) {
                    DbError::Busy(message)
                } else if db_err.is_unique_violation() || db_err.is_foreign_key_violation() {
                    DbError::Constraint(message)
                } else {
                    DbError::Query(message)
                }
            }
            sqlx::Error::PoolTimedOut => DbError::PoolExhausted,
            sqlx::Error::PoolClosed | sqlx::Error::Io(_) | sqlx::Error::Tls(_) => {
                DbError::Connection(err.to_string())
            }
            sqlx::Error::Configuration(ref e) => DbError::Configuration(e.to_string()),
            sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::Decode(_)
            | sqlx::Error::ColumnNotFound(_) => DbError::Decode(err.to_string()),
            _ => DbError::Query(err.to_string()),
        }
    }
}

#[cfg(feature = "database")]
impl From<sqlx::migrate::MigrateError> for DbError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DbError::Migration(err.to_string())
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::Decode(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(DbError::PoolExhausted.is_transient());
        assert!(DbError::Busy("database is locked".to_string()).is_transient());
        assert!(DbError::Connection("connection reset by peer".to_string()).is_transient());
        assert!(!DbError::Connection("no such file".to_string()).is_transient());
        assert!(!DbError::Constraint("UNIQUE constraint failed".to_string()).is_transient());
        assert!(!DbError::not_found("Host", 3).is_transient());
    }

    #[test]
    fn test_not_found_message() {
        assert_eq!(DbError::not_found("Inventory", 12).to_string(), "Inventory 12 does not exist");
    }

    #[cfg(feature = "database")]
    #[test]
    fn test_busy_codes() {
        assert!(is_busy_code(Some("5")));
        assert!(is_busy_code(Some("517")));
        assert!(is_busy_code(Some("6")));
        assert!(!is_busy_code(Some("2067")));
        assert!(!is_busy_code(None));
    }
}
