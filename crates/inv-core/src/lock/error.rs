//! Lock failures.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum LockError {
    /// Another run kept the inventory for the whole bounded wait.
    #[error("Inventory lock '{key}' still held after waiting {waited:?}")]
    Timeout { key: String, waited: Duration },

    /// The lease expired and the key has since been taken by someone else.
    #[error("Lease on '{key}' no longer belongs to '{holder}'")]
    NotHolder { key: String, holder: String },

    /// The lease lapsed while its holder was still working.
    #[error("Lease on '{key}' held by '{holder}' expired before the work finished")]
    Lost { key: String, holder: String },

    #[error("Lock backend failed: {0}")]
    Backend(String),

    #[error("Invalid lock settings: {0}")]
    InvalidSettings(String),
}

impl LockError {
    pub fn timeout(key: &str, waited: Duration) -> Self {
        LockError::Timeout {
            key: key.to_string(),
            waited,
        }
    }

    pub fn not_holder(key: &str, holder: &str) -> Self {
        LockError::NotHolder {
            key: key.to_string(),
            holder: holder.to_string(),
        }
    }

    pub fn lost(key: &str, holder: &str) -> Self {
        LockError::Lost {
            key: key.to_string(),
            holder: holder.to_string(),
        }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        LockError::Backend(message.into())
    }

    pub fn invalid_settings(message: impl Into<String>) -> Self {
        LockError::InvalidSettings(message.into())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, LockError::Timeout { .. })
    }

    pub fn is_not_holder(&self) -> bool {
        matches!(self, LockError::NotHolder { .. })
    }

    pub fn is_lost(&self) -> bool {
        matches!(self, LockError::Lost { .. })
    }
}

#[cfg(feature = "database")]
impl From<sqlx::Error> for LockError {
    fn from(err: sqlx::Error) -> Self {
        LockError::Backend(err.to_string())
    }
}
