//! SQLite-backed [`InventoryLock`] using a lease row per key.
//!
//! A lease row is taken over only when its `expires_at` is in the past, in a
//! single upsert, so concurrent processes sharing the database file cannot
//! both win. Timestamps are stored as fixed-width UTC RFC 3339 strings and
//! compared as text.
//!
//! The lock table shares the database file with imports, so a grant can find
//! the file write-locked by another inventory's import transaction. That is
//! reported as "not granted yet" and the caller keeps polling within its
//! bounded wait.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::SqlitePool;
use std::time::Duration;
use tracing::debug;

use super::{InventoryLock, LockError, LockInfo, LockLease};
use crate::db::is_busy;

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, LockError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| LockError::backend(format!("invalid lock timestamp: {}", e)))
}

/// Lock table in the inventory database.
#[derive(Clone)]
pub struct SqliteInventoryLock {
    pool: SqlitePool,
}

impl SqliteInventoryLock {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Takes over `key` if its lease row is missing or expired.
    async fn grant(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<Option<LockLease>, sqlx::Error> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let token: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO inventory_lock_tokens (lock_key, last_token) VALUES (?, 1)
            ON CONFLICT(lock_key) DO UPDATE SET last_token = last_token + 1
            RETURNING last_token
            "#,
        )
        .bind(key)
        .fetch_one(&mut *tx)
        .await?;

        let lease = LockLease::new(key, holder, now, ttl, token.max(0) as u64);
        let result = sqlx::query(
            r#"
            INSERT INTO inventory_locks (lock_key, holder, fencing_token, acquired_at, expires_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(lock_key) DO UPDATE SET
                holder = excluded.holder,
                fencing_token = excluded.fencing_token,
                acquired_at = excluded.acquired_at,
                expires_at = excluded.expires_at
            WHERE inventory_locks.expires_at <= ?
            "#,
        )
        .bind(key)
        .bind(holder)
        .bind(token)
        .bind(timestamp(lease.acquired_at))
        .bind(timestamp(lease.expires_at))
        .bind(timestamp(now))
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }
        tx.commit().await?;
        Ok(Some(lease))
    }
}

#[async_trait]
impl InventoryLock for SqliteInventoryLock {
    async fn try_acquire(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<Option<LockLease>, LockError> {
        match self.grant(key, holder, ttl).await {
            Ok(lease) => Ok(lease),
            Err(err) if is_busy(&err) => {
                debug!(key = %key, holder = %holder, error = %err, "Lock table busy");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn release(&self, lease: &LockLease) -> Result<(), LockError> {
        let result = sqlx::query(
            "DELETE FROM inventory_locks WHERE lock_key = ? AND holder = ? AND fencing_token = ?",
        )
        .bind(&lease.key)
        .bind(&lease.holder)
        .bind(lease.fencing_token as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LockError::not_holder(&lease.key, &lease.holder));
        }
        Ok(())
    }

    async fn holder(&self, key: &str) -> Result<Option<LockInfo>, LockError> {
        let row: Option<(String, i64, String, String)> = sqlx::query_as(
            r#"
            SELECT holder, fencing_token, acquired_at, expires_at
            FROM inventory_locks
            WHERE lock_key = ? AND expires_at > ?
            "#,
        )
        .bind(key)
        .bind(timestamp(Utc::now()))
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(holder, token, acquired_at, expires_at)| {
            Ok(LockInfo {
                holder,
                acquired_at: parse_timestamp(&acquired_at)?,
                expires_at: parse_timestamp(&expires_at)?,
                fencing_token: token.max(0) as u64,
            })
        })
        .transpose()
    }
}
