//! In-process implementation of [`InventoryLock`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use super::{InventoryLock, LockError, LockInfo, LockLease};

#[derive(Debug, Default)]
struct LockTable {
    leases: HashMap<String, LockLease>,
    fencing_tokens: HashMap<String, u64>,
}

/// Lock table shared by every clone, with an optional clock override so
/// tests can expire leases without waiting.
#[derive(Debug, Clone, Default)]
pub struct MemoryInventoryLock {
    table: Arc<RwLock<LockTable>>,
    time_override: Arc<RwLock<Option<DateTime<Utc>>>>,
}

impl MemoryInventoryLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves the lock's clock forward by `duration`.
    pub async fn advance_time(&self, duration: Duration) {
        let mut current = self.time_override.write().await;
        let now = current.unwrap_or_else(Utc::now);
        *current =
            Some(now + chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero()));
    }

    async fn now(&self) -> DateTime<Utc> {
        self.time_override.read().await.unwrap_or_else(Utc::now)
    }

    /// Returns every lease currently recorded, expired or not.
    pub async fn leases(&self) -> Vec<LockLease> {
        self.table.read().await.leases.values().cloned().collect()
    }
}

#[async_trait]
impl InventoryLock for MemoryInventoryLock {
    async fn try_acquire(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<Option<LockLease>, LockError> {
        let now = self.now().await;
        let mut table = self.table.write().await;

        if let Some(existing) = table.leases.get(key) {
            if !existing.is_expired_at(now) {
                return Ok(None);
            }
        }

        let token = table.fencing_tokens.entry(key.to_string()).or_insert(0);
        *token += 1;
        let lease = LockLease::new(key, holder, now, ttl, *token);
        table.leases.insert(key.to_string(), lease.clone());
        Ok(Some(lease))
    }

    async fn release(&self, lease: &LockLease) -> Result<(), LockError> {
        let mut table = self.table.write().await;
        match table.leases.get(&lease.key) {
            Some(current)
                if current.holder == lease.holder
                    && current.fencing_token == lease.fencing_token =>
            {
                table.leases.remove(&lease.key);
                Ok(())
            }
            _ => Err(LockError::not_holder(&lease.key, &lease.holder)),
        }
    }

    async fn holder(&self, key: &str) -> Result<Option<LockInfo>, LockError> {
        let now = self.now().await;
        let table = self.table.read().await;
        Ok(table
            .leases
            .get(key)
            .filter(|lease| !lease.is_expired_at(now))
            .map(LockInfo::from_lease))
    }
}
