//! Per-inventory exclusion lock.
//!
//! At most one import run mutates a given inventory at a time. A run asks for
//! the lock under its own holder name (the run id), so two runs inside one
//! process exclude each other just like runs in different processes.
//!
//! ```text
//!  acquire_with_timeout ──▶ try_acquire ──▶ granted ──▶ LockGuard
//!          │                    │                          │
//!          │              held by other                release()
//!          │                    ▼                    (or Drop: spawned)
//!          └──── sleep(poll) ◀──┘
//!          └──── waited >= timeout ──▶ LockError::Timeout
//! ```
//!
//! Leases expire after their TTL so a crashed holder cannot block an
//! inventory forever.

mod error;
mod memory;
#[cfg(feature = "database")]
mod sqlite;
mod types;

pub use error::LockError;
pub use memory::MemoryInventoryLock;
#[cfg(feature = "database")]
pub use sqlite::SqliteInventoryLock;
pub use types::{LockInfo, LockLease, LockSettings};

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

/// Lock key for an inventory.
pub fn inventory_lock_key(inventory_id: i64) -> String {
    format!("inventory:{}", inventory_id)
}

/// Backend for the exclusion lock.
#[async_trait]
pub trait InventoryLock: Send + Sync + 'static {
    /// Tries once to obtain the lock.
    ///
    /// Returns `Ok(None)` while any unexpired lease exists for `key`, even one
    /// granted to the same holder.
    async fn try_acquire(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<Option<LockLease>, LockError>;

    /// Releases a lease.
    ///
    /// Fails with [`LockError::NotHolder`] if the lease expired and the key
    /// was granted again.
    async fn release(&self, lease: &LockLease) -> Result<(), LockError>;

    /// Returns the current holder of `key`, if its lease has not expired.
    async fn holder(&self, key: &str) -> Result<Option<LockInfo>, LockError>;
}

/// A held lock. Release it with [`LockGuard::release`]; a guard dropped while
/// still holding its lease schedules the release on the current runtime.
pub struct LockGuard {
    lock: Arc<dyn InventoryLock>,
    lease: Option<LockLease>,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").field("lease", &self.lease).finish()
    }
}

impl LockGuard {
    fn new(lock: Arc<dyn InventoryLock>, lease: LockLease) -> Self {
        Self {
            lock,
            lease: Some(lease),
        }
    }

    /// The lease this guard holds, or `None` once released.
    pub fn lease(&self) -> Option<&LockLease> {
        self.lease.as_ref()
    }

    /// Fails with [`LockError::Lost`] unless this guard's lease is still the
    /// unexpired lease of its key. Call before making work done under the
    /// lock durable.
    pub async fn verify(&self) -> Result<(), LockError> {
        let lease = self
            .lease
            .as_ref()
            .ok_or_else(|| LockError::backend("lock guard already released"))?;
        match self.lock.holder(&lease.key).await? {
            Some(current)
                if current.holder == lease.holder
                    && current.fencing_token == lease.fencing_token =>
            {
                Ok(())
            }
            current => {
                warn!(
                    key = %lease.key,
                    holder = %lease.holder,
                    fencing_token = lease.fencing_token,
                    current_holder = current.as_ref().map(|c| c.holder.as_str()),
                    "Inventory lock lost"
                );
                Err(LockError::lost(&lease.key, &lease.holder))
            }
        }
    }

    /// Releases the lock.
    pub async fn release(mut self) -> Result<(), LockError> {
        match self.lease.take() {
            Some(lease) => {
                self.lock.release(&lease).await?;
                debug!(key = %lease.key, holder = %lease.holder, "Released inventory lock");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };
        let lock = self.lock.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = lock.release(&lease).await {
                        warn!(key = %lease.key, error = %e, "Failed to release dropped inventory lock");
                    }
                });
            }
            Err(_) => {
                warn!(key = %lease.key, "Inventory lock dropped outside a runtime; it will expire");
            }
        }
    }
}

/// Polls `lock` until `key` is granted to `holder` or `settings.timeout`
/// has elapsed.
pub async fn acquire_with_timeout(
    lock: Arc<dyn InventoryLock>,
    key: &str,
    holder: &str,
    settings: &LockSettings,
) -> Result<LockGuard, LockError> {
    let started = Instant::now();
    loop {
        if let Some(lease) = lock.try_acquire(key, holder, settings.ttl).await? {
            debug!(
                key = %key,
                holder = %holder,
                fencing_token = lease.fencing_token,
                "Acquired inventory lock"
            );
            return Ok(LockGuard::new(lock, lease));
        }

        let waited = started.elapsed();
        if waited >= settings.timeout {
            return Err(LockError::timeout(key, waited));
        }
        debug!(key = %key, holder = %holder, "Inventory lock busy, waiting");
        sleep(settings.poll_interval.min(settings.timeout - waited)).await;
    }
}
