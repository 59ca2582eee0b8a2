//! Run-level error taxonomy and the outcome reported to callers.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::capacity::{CapacityError, CapacityExceeded, CapacityKind};
use crate::db::{DbError, FailureKind};
use crate::lock::LockError;
use crate::reconcile::ImportSummary;

/// Why an import run did not complete.
#[derive(Error, Debug)]
pub enum ImportError {
    /// The document cannot be read as an inventory at all.
    #[error("Malformed inventory source: {0}")]
    MalformedSource(String),

    /// Two hosts in one document resolve to the same instance ID.
    #[error("Instance ID '{instance_id}' is claimed by both '{first}' and '{second}'")]
    IdentityConflict {
        instance_id: String,
        first: String,
        second: String,
    },

    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(#[from] CapacityExceeded),

    /// The inventory lock was not granted within the bounded wait.
    #[error("Timed out after {waited:?} waiting for lock '{key}'")]
    LockTimeout { key: String, waited: Duration },

    /// The inventory lock lapsed before the import could commit.
    #[error("Lost lock '{key}' before commit")]
    LockLost { key: String },

    #[error("Persistence error: {0}")]
    Persistence(#[from] DbError),
}

impl ImportError {
    /// The failure kind recorded for this error, or `None` when no run
    /// record is written.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            ImportError::MalformedSource(_) | ImportError::IdentityConflict { .. } => {
                Some(FailureKind::MalformedSource)
            }
            ImportError::CapacityExceeded(_) => Some(FailureKind::CapacityExceeded),
            ImportError::Persistence(_) | ImportError::LockLost { .. } => {
                Some(FailureKind::PersistenceError)
            }
            ImportError::LockTimeout { .. } => None,
        }
    }

    /// Returns `true` if running again later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ImportError::LockTimeout { .. } | ImportError::LockLost { .. }
        )
    }
}

impl From<CapacityError> for ImportError {
    fn from(err: CapacityError) -> Self {
        match err {
            CapacityError::Exceeded(e) => ImportError::CapacityExceeded(e),
            CapacityError::Database(e) => ImportError::Persistence(e),
        }
    }
}

impl From<LockError> for ImportError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Timeout { key, waited } => ImportError::LockTimeout { key, waited },
            LockError::Lost { key, .. } => ImportError::LockLost { key },
            other => ImportError::Persistence(DbError::Connection(other.to_string())),
        }
    }
}

/// Terminal result of a run as seen by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum RunOutcome {
    Success(ImportSummary),
    CapacityExceeded(CapacityKind),
    LockTimeout,
    PersistenceError(String),
    MalformedSource(String),
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Success(_))
    }

    /// Short label used for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            RunOutcome::Success(_) => "success",
            RunOutcome::CapacityExceeded(_) => "capacity_exceeded",
            RunOutcome::LockTimeout => "lock_timeout",
            RunOutcome::PersistenceError(_) => "persistence_error",
            RunOutcome::MalformedSource(_) => "malformed_source",
        }
    }
}

impl From<Result<ImportSummary, ImportError>> for RunOutcome {
    fn from(result: Result<ImportSummary, ImportError>) -> Self {
        match result {
            Ok(summary) => RunOutcome::Success(summary),
            Err(err) => err.into(),
        }
    }
}

impl From<ImportError> for RunOutcome {
    fn from(err: ImportError) -> Self {
        match err {
            ImportError::CapacityExceeded(e) => RunOutcome::CapacityExceeded(e.kind),
            ImportError::LockTimeout { .. } => RunOutcome::LockTimeout,
            ImportError::Persistence(e) => RunOutcome::PersistenceError(e.to_string()),
            err @ ImportError::LockLost { .. } => RunOutcome::PersistenceError(err.to_string()),
            err @ (ImportError::MalformedSource(_) | ImportError::IdentityConflict { .. }) => {
                RunOutcome::MalformedSource(err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_mapping() {
        let err = ImportError::from(LockError::timeout("inventory:1", Duration::from_secs(1)));
        assert!(err.is_retryable());
        assert_eq!(err.failure_kind(), None);
        assert_eq!(RunOutcome::from(err), RunOutcome::LockTimeout);

        let err = ImportError::IdentityConflict {
            instance_id: "i-1".to_string(),
            first: "a".to_string(),
            second: "b".to_string(),
        };
        assert_eq!(err.failure_kind(), Some(FailureKind::MalformedSource));
        assert!(matches!(RunOutcome::from(err), RunOutcome::MalformedSource(d) if d.contains("i-1")));

        let outcome = RunOutcome::from(ImportError::Persistence(DbError::PoolExhausted));
        assert_eq!(outcome.label(), "persistence_error");
    }

    #[test]
    fn test_lost_lock_is_a_recorded_persistence_failure() {
        let err = ImportError::from(LockError::lost("inventory:4", "run-a"));
        assert!(matches!(err, ImportError::LockLost { ref key } if key == "inventory:4"));
        assert!(err.is_retryable());
        assert_eq!(err.failure_kind(), Some(FailureKind::PersistenceError));
        assert!(matches!(
            RunOutcome::from(err),
            RunOutcome::PersistenceError(d) if d.contains("inventory:4")
        ));
    }

    #[test]
    fn test_outcome_serializes_tagged() {
        let json = serde_json::to_value(RunOutcome::CapacityExceeded(CapacityKind::LicenseCount))
            .unwrap();
        assert_eq!(json["outcome"], "capacity_exceeded");
        assert_eq!(json["detail"], "license_count");
    }
}
