//! License and organization host ceilings.
//!
//! The gate reads counts through the run's own repository, so inside an open
//! transaction it sees the rows the reconciler has just written.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::db::{DbError, InventoryRepository};

/// Kind of license the platform runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LicenseType {
    /// No host ceiling and no expiry.
    #[default]
    Open,
    Enterprise,
    Trial,
}

/// The license the gate enforces.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LicenseInfo {
    pub license_type: LicenseType,
    /// Number of distinct hosts the license covers.
    pub instance_count: u64,
    pub expires_at: Option<DateTime<Utc>>,
}

impl LicenseInfo {
    /// An open license.
    pub fn open() -> Self {
        Self::default()
    }

    pub fn enterprise(instance_count: u64) -> Self {
        Self {
            license_type: LicenseType::Enterprise,
            instance_count,
            expires_at: None,
        }
    }

    pub fn trial(instance_count: u64, expires_at: DateTime<Utc>) -> Self {
        Self {
            license_type: LicenseType::Trial,
            instance_count,
            expires_at: Some(expires_at),
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

/// Which ceiling was breached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityKind {
    LicenseExpired,
    LicenseCount,
    OrganizationHostLimit,
}

impl CapacityKind {
    /// Returns `true` for the license checks, `false` for the organization limit.
    pub fn is_license(&self) -> bool {
        matches!(self, CapacityKind::LicenseExpired | CapacityKind::LicenseCount)
    }
}

/// A breached ceiling.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct CapacityExceeded {
    pub kind: CapacityKind,
    pub message: String,
}

impl CapacityExceeded {
    fn new(kind: CapacityKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Failure of a capacity check.
#[derive(Error, Debug)]
pub enum CapacityError {
    #[error(transparent)]
    Exceeded(#[from] CapacityExceeded),

    #[error(transparent)]
    Database(#[from] DbError),
}

/// Validates host counts against the license and the organization limit.
#[derive(Debug, Clone, Default)]
pub struct CapacityGate {
    license: LicenseInfo,
}

impl CapacityGate {
    pub fn new(license: LicenseInfo) -> Self {
        Self { license }
    }

    pub fn license(&self) -> &LicenseInfo {
        &self.license
    }

    /// Runs the license check, then the organization check.
    pub async fn check<R>(&self, repo: &R) -> Result<(), CapacityError>
    where
        R: InventoryRepository + ?Sized,
    {
        self.check_license(repo, Utc::now()).await?;
        self.check_org_host_limit(repo).await?;
        Ok(())
    }

    /// Checks the license itself, without counting hosts. Only an expired
    /// trial license fails; any other expired license is logged.
    pub fn check_license_validity(&self, now: DateTime<Utc>) -> Result<(), CapacityExceeded> {
        let license = &self.license;
        if license.license_type == LicenseType::Open || !license.is_expired_at(now) {
            return Ok(());
        }
        if license.license_type == LicenseType::Trial {
            return Err(CapacityExceeded::new(
                CapacityKind::LicenseExpired,
                "License has expired",
            ));
        }
        warn!("License has expired");
        Ok(())
    }

    /// Checks expiry and the licensed host count as of `now`.
    pub async fn check_license<R>(&self, repo: &R, now: DateTime<Utc>) -> Result<(), CapacityError>
    where
        R: InventoryRepository + ?Sized,
    {
        let license = &self.license;
        if license.license_type == LicenseType::Open {
            return Ok(());
        }
        self.check_license_validity(now)?;

        let active = repo.active_host_count().await?;
        let free = license.instance_count as i64 - active as i64;
        debug!(active, licensed = license.instance_count, free, "Checked license host count");
        if free < 0 {
            return Err(CapacityExceeded::new(
                CapacityKind::LicenseCount,
                format!(
                    "Number of licensed instances exceeded, would bring available instances to {}, system is licensed for {}",
                    free, license.instance_count
                ),
            )
            .into());
        }
        Ok(())
    }

    /// Checks the host count of the inventory's organization against its
    /// `max_hosts`. Zero means unlimited.
    pub async fn check_org_host_limit<R>(&self, repo: &R) -> Result<(), CapacityError>
    where
        R: InventoryRepository + ?Sized,
    {
        let inventory = repo.inventory().await?;
        let Some(organization_id) = inventory.organization_id else {
            return Ok(());
        };
        let Some(organization) = repo.organization(organization_id).await? else {
            return Ok(());
        };
        if organization.max_hosts == 0 {
            return Ok(());
        }

        let count = repo.organization_host_count(organization_id).await?;
        if count > u64::from(organization.max_hosts) {
            return Err(CapacityExceeded::new(
                CapacityKind::OrganizationHostLimit,
                format!(
                    "Number of hosts in organization {} ({}) is more than allowed ({})",
                    organization.name, count, organization.max_hosts
                ),
            )
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{InventoryStore, MemoryInventoryStore, NewHost, OrganizationRecord};

    async fn store_with_hosts(count: usize, max_hosts: u32) -> (MemoryInventoryStore, i64) {
        let store = MemoryInventoryStore::new();
        store
            .add_organization(OrganizationRecord {
                id: 100,
                name: "acme".to_string(),
                max_hosts,
            })
            .await;
        let inv = store.add_inventory("inv", Some(100)).await;
        let tx = store.begin(inv).await.unwrap();
        for i in 0..count {
            tx.get_or_create_host(&NewHost::named(format!("h{}", i)))
                .await
                .unwrap();
        }
        tx.commit().await.unwrap();
        (store, inv)
    }

    fn unwrap_exceeded(err: CapacityError) -> CapacityExceeded {
        match err {
            CapacityError::Exceeded(e) => e,
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_open_license_skips_checks() {
        let (store, inv) = store_with_hosts(5, 0).await;
        let tx = store.begin(inv).await.unwrap();
        CapacityGate::new(LicenseInfo::open())
            .check(tx.as_ref())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_license_count_exceeded() {
        let (store, inv) = store_with_hosts(3, 0).await;
        let tx = store.begin(inv).await.unwrap();
        let gate = CapacityGate::new(LicenseInfo::enterprise(2));
        let err = unwrap_exceeded(gate.check(tx.as_ref()).await.unwrap_err());
        assert_eq!(err.kind, CapacityKind::LicenseCount);
        assert!(err.message.contains("-1"));

        CapacityGate::new(LicenseInfo::enterprise(3))
            .check(tx.as_ref())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_expired_trial_is_fatal() {
        let (store, inv) = store_with_hosts(0, 0).await;
        let tx = store.begin(inv).await.unwrap();
        let now = Utc::now();
        let expired = now - chrono::Duration::days(1);

        let err = CapacityGate::new(LicenseInfo::trial(10, expired))
            .check_license(tx.as_ref(), now)
            .await
            .unwrap_err();
        assert_eq!(unwrap_exceeded(err).kind, CapacityKind::LicenseExpired);

        let mut enterprise = LicenseInfo::enterprise(10);
        enterprise.expires_at = Some(expired);
        CapacityGate::new(enterprise)
            .check_license(tx.as_ref(), now)
            .await
            .unwrap();
    }

    #[test]
    fn test_license_validity_ignores_host_counts() {
        let now = Utc::now();
        let expired = now - chrono::Duration::days(1);

        CapacityGate::new(LicenseInfo::enterprise(0))
            .check_license_validity(now)
            .unwrap();
        let err = CapacityGate::new(LicenseInfo::trial(1000, expired))
            .check_license_validity(now)
            .unwrap_err();
        assert_eq!(err.kind, CapacityKind::LicenseExpired);
    }

    #[tokio::test]
    async fn test_org_host_limit() {
        let (store, inv) = store_with_hosts(3, 2).await;
        let tx = store.begin(inv).await.unwrap();
        let err = CapacityGate::default()
            .check(tx.as_ref())
            .await
            .unwrap_err();
        let err = unwrap_exceeded(err);
        assert_eq!(err.kind, CapacityKind::OrganizationHostLimit);
        assert!(!err.kind.is_license());
    }

    #[tokio::test]
    async fn test_zero_max_hosts_is_unlimited() {
        let (store, inv) = store_with_hosts(3, 0).await;
        let tx = store.begin(inv).await.unwrap();
        CapacityGate::default().check_org_host_limit(tx.as_ref()).await.unwrap();
    }

    #[test]
    fn test_license_from_yaml() {
        let license: LicenseInfo =
            serde_yaml::from_str("license_type: trial\ninstance_count: 10\n").unwrap();
        assert_eq!(license.license_type, LicenseType::Trial);
        assert_eq!(license.instance_count, 10);
        assert!(!license.is_expired_at(Utc::now()));
    }
}
