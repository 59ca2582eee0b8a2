//! Integration tests for the run coordinator.
//!
//! ```bash
//! cargo test --package inv-core --test coordinator_integration_tests
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use inv_core::db::{Claim, FailureKind, NewHost, OrganizationRecord, RetryConfig, RunStatus};
use inv_core::lock::{inventory_lock_key, LockInfo, LockLease};
use inv_core::{
    CapacityKind, ImportConfig, InventoryDocument, InventoryLock, InventoryRepository,
    InventoryStore, LicenseInfo, LockError, LockSettings, MemoryInventoryLock,
    MemoryInventoryStore, ReconcileOptions, Reconciler, RunCoordinator, RunOutcome, RunState,
};

fn fast_lock() -> LockSettings {
    LockSettings {
        timeout: Duration::from_secs(5),
        ttl: Duration::from_secs(60),
        poll_interval: Duration::from_millis(10),
    }
}

fn coordinator(store: &MemoryInventoryStore, lock: &MemoryInventoryLock) -> RunCoordinator {
    let options = ReconcileOptions {
        overwrite: true,
        ..Default::default()
    };
    RunCoordinator::new(
        Arc::new(store.clone()),
        Arc::new(lock.clone()),
        Reconciler::new(options),
    )
    .with_lock_settings(fast_lock())
}

fn three_hosts() -> Value {
    json!({"web": ["web1", "web2"], "db": ["db1"]})
}

#[tokio::test]
async fn test_successful_run_records_status() {
    let store = MemoryInventoryStore::new();
    let lock = MemoryInventoryLock::new();
    let inv = store.add_inventory("inv", None).await;

    let report = coordinator(&store, &lock).run_value(inv, 1, three_hosts()).await;

    assert!(report.outcome.is_success(), "outcome: {:?}", report.outcome);
    assert_eq!(
        report.transitions,
        vec![
            RunState::Idle,
            RunState::LockAcquired,
            RunState::Applying,
            RunState::Committed,
            RunState::StatusRecorded,
            RunState::Idle,
        ]
    );

    let record = store.get_run(report.run_id).await.unwrap().unwrap();
    assert_eq!(record.status, RunStatus::Successful);
    assert_eq!(record.failure, None);
    assert_eq!(record.summary.unwrap().hosts_created, 3);
    assert!(lock.holder(&inventory_lock_key(inv)).await.unwrap().is_none());
    assert_eq!(store.snapshot(inv).await.unwrap().hosts.len(), 3);
}

#[tokio::test]
async fn test_license_count_rolls_back() {
    let store = MemoryInventoryStore::new();
    let lock = MemoryInventoryLock::new();
    let inv = store.add_inventory("inv", None).await;

    let report = coordinator(&store, &lock)
        .with_license(LicenseInfo::enterprise(1))
        .run_value(inv, 1, three_hosts())
        .await;

    assert_eq!(
        report.outcome,
        RunOutcome::CapacityExceeded(CapacityKind::LicenseCount)
    );
    assert!(report.transitions.contains(&RunState::RolledBack));
    assert!(!report.transitions.contains(&RunState::Committed));
    assert!(store.snapshot(inv).await.unwrap().hosts.is_empty());

    let record = store.get_run(report.run_id).await.unwrap().unwrap();
    assert_eq!(record.status, RunStatus::Failed);
    assert_eq!(record.failure, Some(FailureKind::CapacityExceeded));
    assert!(record.license_error);
    assert!(!record.org_host_limit_error);
}

#[tokio::test]
async fn test_organization_limit_flagged() {
    let store = MemoryInventoryStore::new();
    let lock = MemoryInventoryLock::new();
    store
        .add_organization(OrganizationRecord {
            id: 100,
            name: "acme".to_string(),
            max_hosts: 2,
        })
        .await;
    let inv = store.add_inventory("inv", Some(100)).await;

    let report = coordinator(&store, &lock).run_value(inv, 1, three_hosts()).await;

    assert_eq!(
        report.outcome,
        RunOutcome::CapacityExceeded(CapacityKind::OrganizationHostLimit)
    );
    let record = store.get_run(report.run_id).await.unwrap().unwrap();
    assert!(record.org_host_limit_error);
    assert!(!record.license_error);
    assert!(store.snapshot(inv).await.unwrap().hosts.is_empty());
}

#[tokio::test]
async fn test_import_may_shrink_an_over_limit_inventory() {
    let store = MemoryInventoryStore::new();
    let lock = MemoryInventoryLock::new();
    store
        .add_organization(OrganizationRecord {
            id: 100,
            name: "acme".to_string(),
            max_hosts: 2,
        })
        .await;
    let inv = store.add_inventory("inv", Some(100)).await;

    let tx = store.begin(inv).await.unwrap();
    for name in ["web1", "web2", "db1"] {
        let (host, _) = tx.get_or_create_host(&NewHost::named(name)).await.unwrap();
        tx.claim_ownership(1, &[Claim::Host(host.id)]).await.unwrap();
    }
    tx.commit().await.unwrap();

    let report = coordinator(&store, &lock)
        .with_license(LicenseInfo::enterprise(2))
        .run_value(inv, 1, json!({"web": ["web1", "web2"]}))
        .await;

    let RunOutcome::Success(summary) = report.outcome else {
        panic!("unexpected outcome: {:?}", report.outcome);
    };
    assert_eq!(summary.hosts_deleted, 1);
    assert_eq!(store.snapshot(inv).await.unwrap().hosts.len(), 2);
}

#[tokio::test]
async fn test_expired_license_fails_before_applying_changes() {
    let store = MemoryInventoryStore::new();
    let lock = MemoryInventoryLock::new();
    let inv = store.add_inventory("inv", None).await;
    let expired = LicenseInfo::trial(100, chrono::Utc::now() - chrono::Duration::days(1));

    let report = coordinator(&store, &lock)
        .with_license(expired)
        .run_value(inv, 1, three_hosts())
        .await;

    assert_eq!(
        report.outcome,
        RunOutcome::CapacityExceeded(CapacityKind::LicenseExpired)
    );
    assert!(report.status_recorded());
    assert!(store.snapshot(inv).await.unwrap().hosts.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_lock_timeout_records_nothing() {
    let store = MemoryInventoryStore::new();
    let lock = MemoryInventoryLock::new();
    let inv = store.add_inventory("inv", None).await;
    lock.try_acquire(&inventory_lock_key(inv), "another-run", Duration::from_secs(3600))
        .await
        .unwrap()
        .unwrap();

    let report = coordinator(&store, &lock).run_value(inv, 1, three_hosts()).await;

    assert_eq!(report.outcome, RunOutcome::LockTimeout);
    assert_eq!(report.transitions, vec![RunState::Idle, RunState::Idle]);
    assert!(store.runs().await.is_empty());
    assert!(store.snapshot(inv).await.unwrap().hosts.is_empty());
}

/// Grants every lease, then lets it lapse at once and hands the key to
/// `next_holder`, as if the run had stalled past its TTL.
struct LapsingLock {
    inner: MemoryInventoryLock,
    next_holder: &'static str,
}

#[async_trait]
impl InventoryLock for LapsingLock {
    async fn try_acquire(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<Option<LockLease>, LockError> {
        let lease = self.inner.try_acquire(key, holder, ttl).await?;
        if lease.is_some() {
            self.inner.advance_time(ttl + Duration::from_secs(1)).await;
            self.inner.try_acquire(key, self.next_holder, ttl).await?;
        }
        Ok(lease)
    }

    async fn release(&self, lease: &LockLease) -> Result<(), LockError> {
        self.inner.release(lease).await
    }

    async fn holder(&self, key: &str) -> Result<Option<LockInfo>, LockError> {
        self.inner.holder(key).await
    }
}

#[tokio::test]
async fn test_lapsed_lease_rolls_back() {
    let store = MemoryInventoryStore::new();
    let inner = MemoryInventoryLock::new();
    let inv = store.add_inventory("inv", None).await;
    let lock = LapsingLock {
        inner: inner.clone(),
        next_holder: "next-run",
    };
    let coordinator = RunCoordinator::new(
        Arc::new(store.clone()),
        Arc::new(lock),
        Reconciler::new(ReconcileOptions::default()),
    )
    .with_lock_settings(fast_lock());

    let report = coordinator.run_value(inv, 1, three_hosts()).await;

    assert!(
        matches!(report.outcome, RunOutcome::PersistenceError(ref d) if d.contains("Lost lock")),
        "outcome: {:?}",
        report.outcome
    );
    assert!(report.transitions.contains(&RunState::RolledBack));
    assert!(!report.transitions.contains(&RunState::Committed));
    assert!(store.snapshot(inv).await.unwrap().hosts.is_empty());

    let record = store.get_run(report.run_id).await.unwrap().unwrap();
    assert_eq!(record.failure, Some(FailureKind::PersistenceError));
    let current = inner.holder(&inventory_lock_key(inv)).await.unwrap().unwrap();
    assert_eq!(current.holder, "next-run");
}

#[tokio::test]
async fn test_persistence_failure_rolls_back() {
    let store = MemoryInventoryStore::new().with_failing_operation("add_edge");
    let lock = MemoryInventoryLock::new();
    let inv = store.add_inventory("inv", None).await;

    let report = coordinator(&store, &lock).run_value(inv, 1, three_hosts()).await;

    assert!(matches!(report.outcome, RunOutcome::PersistenceError(ref d) if d.contains("add_edge")));
    assert!(report.transitions.contains(&RunState::RolledBack));
    assert!(store.snapshot(inv).await.unwrap().hosts.is_empty());

    let record = store.get_run(report.run_id).await.unwrap().unwrap();
    assert_eq!(record.failure, Some(FailureKind::PersistenceError));
    assert!(lock.holder(&inventory_lock_key(inv)).await.unwrap().is_none());
}

#[tokio::test]
async fn test_status_write_retried() {
    let store = MemoryInventoryStore::new();
    let lock = MemoryInventoryLock::new();
    let inv = store.add_inventory("inv", None).await;
    store.fail_next_run_records(2).await;

    let retry = RetryConfig {
        max_retries: 3,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        backoff_multiplier: 2.0,
        jitter: false,
    };
    let report = coordinator(&store, &lock)
        .with_status_retry(retry)
        .run_value(inv, 1, three_hosts())
        .await;

    assert!(report.outcome.is_success());
    assert!(report.status_recorded());
    assert_eq!(store.runs().await.len(), 1);
}

#[tokio::test]
async fn test_status_write_failure_keeps_outcome() {
    let store = MemoryInventoryStore::new();
    let lock = MemoryInventoryLock::new();
    let inv = store.add_inventory("inv", None).await;
    store.fail_next_run_records(5).await;

    let report = coordinator(&store, &lock)
        .with_status_retry(RetryConfig::no_retry())
        .run_value(inv, 1, three_hosts())
        .await;

    assert!(report.outcome.is_success());
    assert!(!report.status_recorded());
    assert_eq!(store.snapshot(inv).await.unwrap().hosts.len(), 3);
}

#[tokio::test]
async fn test_malformed_document_recorded() {
    let store = MemoryInventoryStore::new();
    let lock = MemoryInventoryLock::new();
    let inv = store.add_inventory("inv", None).await;

    let report = coordinator(&store, &lock).run_value(inv, 1, json!([1])).await;

    assert!(matches!(report.outcome, RunOutcome::MalformedSource(_)));
    assert!(!report.transitions.contains(&RunState::LockAcquired));
    let record = store.get_run(report.run_id).await.unwrap().unwrap();
    assert_eq!(record.failure, Some(FailureKind::MalformedSource));
}

#[tokio::test]
async fn test_skipped_fragments_reported() {
    let store = MemoryInventoryStore::new();
    let lock = MemoryInventoryLock::new();
    let inv = store.add_inventory("inv", None).await;

    let report = coordinator(&store, &lock)
        .run_value(inv, 1, json!({"web": {"hosts": ["web1", 7]}, "bad": 3}))
        .await;

    assert!(report.outcome.is_success());
    assert_eq!(report.skipped_fragments, 2);
    assert!(store.snapshot(inv).await.unwrap().host("web1").is_some());
}

#[tokio::test]
async fn test_duplicate_instance_ids_rejected() {
    let store = MemoryInventoryStore::new();
    let lock = MemoryInventoryLock::new();
    let inv = store.add_inventory("inv", None).await;
    let config = ImportConfig::from_yaml(
        "instance_id_path: ec2_id\nreject_duplicate_instance_ids: true\nlock_poll_interval: 10ms\n",
    )
    .unwrap();
    let coordinator =
        RunCoordinator::from_config(Arc::new(store.clone()), Arc::new(lock.clone()), &config)
            .unwrap();

    let report = coordinator
        .run_value(
            inv,
            1,
            json!({"_meta": {"hostvars": {"a": {"ec2_id": "i-1"}, "b": {"ec2_id": "i-1"}}},
                   "ungrouped": ["a", "b"]}),
        )
        .await;

    assert!(matches!(report.outcome, RunOutcome::MalformedSource(ref d) if d.contains("i-1")));
    assert!(report.transitions.contains(&RunState::RolledBack));
    assert!(store.snapshot(inv).await.unwrap().hosts.is_empty());
}

#[tokio::test]
async fn test_concurrent_runs_are_serialized() {
    let store = MemoryInventoryStore::new();
    let lock = MemoryInventoryLock::new();
    let inv = store.add_inventory("inv", None).await;
    let coordinator = coordinator(&store, &lock);

    let (first, second) = tokio::join!(
        coordinator.run_value(inv, 1, json!({"web": ["web1", "shared"]})),
        coordinator.run_value(inv, 2, json!({"db": ["db1", "shared"]})),
    );

    assert!(first.outcome.is_success());
    assert!(second.outcome.is_success());
    let snapshot = store.snapshot(inv).await.unwrap();
    let mut names: Vec<&str> = snapshot.hosts.iter().map(|h| h.name.as_str()).collect();
    names.sort();
    assert_eq!(names, vec!["db1", "shared", "web1"]);
    assert_eq!(store.runs().await.len(), 2);
}

#[tokio::test]
async fn test_configured_filters_applied() {
    let store = MemoryInventoryStore::new();
    let lock = MemoryInventoryLock::new();
    let inv = store.add_inventory("inv", None).await;
    let config = ImportConfig::from_yaml(
        "host_filter: \"^web\"\nexclude_empty_groups: true\nlock_poll_interval: 10ms\n",
    )
    .unwrap();
    let coordinator =
        RunCoordinator::from_config(Arc::new(store.clone()), Arc::new(lock.clone()), &config)
            .unwrap();

    let document =
        InventoryDocument::from_value(json!({"web": ["web1", "web2"], "db": ["db1"]})).unwrap();
    let report = coordinator.run_document(inv, 1, &document).await;

    assert!(report.outcome.is_success());
    let snapshot = store.snapshot(inv).await.unwrap();
    assert_eq!(snapshot.hosts.len(), 2);
    assert!(snapshot.group("web").is_some());
    assert!(snapshot.group("db").is_none());
}
