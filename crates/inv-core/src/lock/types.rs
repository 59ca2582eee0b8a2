//! Lease and settings types for the inventory exclusion lock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::LockError;

fn to_chrono(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(30))
}

/// A granted lock.
///
/// The fencing token increases with every grant of the same key, so a holder
/// whose lease expired and was re-granted to someone else can be told apart
/// from the current holder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockLease {
    /// The lock key, e.g. `inventory:42`.
    pub key: String,
    /// Who holds the lease. One run, not one process.
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub fencing_token: u64,
}

impl LockLease {
    /// Creates a lease starting at `now`.
    pub fn new(
        key: impl Into<String>,
        holder: impl Into<String>,
        now: DateTime<Utc>,
        ttl: Duration,
        fencing_token: u64,
    ) -> Self {
        Self {
            key: key.into(),
            holder: holder.into(),
            acquired_at: now,
            expires_at: now + to_chrono(ttl),
            fencing_token,
        }
    }

    /// Returns `true` if the lease has expired at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Returns the remaining time before the lease expires.
    pub fn time_remaining(&self) -> Option<Duration> {
        let remaining = self.expires_at - Utc::now();
        if remaining.num_milliseconds() <= 0 {
            None
        } else {
            remaining.to_std().ok()
        }
    }
}

/// Read-only view of the current holder of a lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockInfo {
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub fencing_token: u64,
}

impl LockInfo {
    pub fn from_lease(lease: &LockLease) -> Self {
        Self {
            holder: lease.holder.clone(),
            acquired_at: lease.acquired_at,
            expires_at: lease.expires_at,
            fencing_token: lease.fencing_token,
        }
    }
}

/// How long to wait for, hold, and poll an inventory lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    /// Upper bound on the wait for the lock.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Lease lifetime. A crashed holder blocks others for at most this long.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Delay between acquisition attempts.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            ttl: Duration::from_secs(3600),
            poll_interval: Duration::from_millis(500),
        }
    }
}

impl LockSettings {
    /// Checks that every duration is usable.
    pub fn validate(&self) -> Result<(), LockError> {
        if self.ttl.is_zero() {
            return Err(LockError::invalid_settings("ttl must be greater than zero"));
        }
        if self.poll_interval.is_zero() {
            return Err(LockError::invalid_settings(
                "poll_interval must be greater than zero",
            ));
        }
        if self.timeout > self.ttl {
            return Err(LockError::invalid_settings(format!(
                "timeout ({:?}) should not exceed ttl ({:?})",
                self.timeout, self.ttl
            )));
        }
        Ok(())
    }
}
