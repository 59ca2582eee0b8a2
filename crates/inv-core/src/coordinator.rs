//! Run coordination: lock, transaction, reconcile, capacity check, status.
//!
//! ```text
//! Idle ──▶ LockAcquired ──▶ Applying ──▶ Committed ──┐
//!   │                           │                   ├──▶ StatusRecorded ──▶ Idle
//!   │                           └──────▶ RolledBack ─┘
//!   └── lock wait timed out ──▶ Idle (nothing recorded)
//! ```
//!
//! The run record is written through the store's own transaction after the
//! import transaction has been committed or rolled back, so a rollback never
//! erases the failure it is reporting. The lock is released last.

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::capacity::{CapacityGate, LicenseInfo};
use crate::codec::InventoryDocument;
use crate::config::{ConfigError, ImportConfig};
use crate::db::{with_retry, InventoryStore, RetryConfig, RunRecord, RunStatus};
use crate::error::{ImportError, RunOutcome};
use crate::graph::InventoryGraph;
use crate::lock::{
    acquire_with_timeout, inventory_lock_key, InventoryLock, LockGuard, LockSettings,
};
use crate::reconcile::{ImportSummary, Reconciler};

/// States a run passes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    LockAcquired,
    Applying,
    Committed,
    RolledBack,
    StatusRecorded,
}

/// What a run did.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub run_id: Uuid,
    pub outcome: RunOutcome,
    /// Every state entered, in order.
    pub transitions: Vec<RunState>,
    /// Document fragments skipped while decoding.
    pub skipped_fragments: usize,
}

impl RunReport {
    /// Returns `true` if the run record was written.
    pub fn status_recorded(&self) -> bool {
        self.transitions.contains(&RunState::StatusRecorded)
    }
}

struct Transitions(Vec<RunState>);

impl Transitions {
    fn new() -> Self {
        Self(vec![RunState::Idle])
    }

    fn enter(&mut self, state: RunState) {
        debug!(state = ?state, "Import run state");
        self.0.push(state);
    }
}

/// Runs imports against one store and lock.
pub struct RunCoordinator {
    store: Arc<dyn InventoryStore>,
    lock: Arc<dyn InventoryLock>,
    reconciler: Reconciler,
    gate: CapacityGate,
    lock_settings: LockSettings,
    status_retry: RetryConfig,
    graph_template: InventoryGraph,
    exclude_empty_groups: bool,
}

impl RunCoordinator {
    /// Creates a coordinator with default settings and an open license.
    pub fn new(
        store: Arc<dyn InventoryStore>,
        lock: Arc<dyn InventoryLock>,
        reconciler: Reconciler,
    ) -> Self {
        Self {
            store,
            lock,
            reconciler,
            gate: CapacityGate::default(),
            lock_settings: LockSettings::default(),
            status_retry: RetryConfig::default(),
            graph_template: InventoryGraph::new(),
            exclude_empty_groups: false,
        }
    }

    /// Creates a coordinator from a validated configuration.
    pub fn from_config(
        store: Arc<dyn InventoryStore>,
        lock: Arc<dyn InventoryLock>,
        config: &ImportConfig,
    ) -> Result<Self, ConfigError> {
        let mut coordinator = Self::new(store, lock, Reconciler::new(config.reconcile_options()))
            .with_license(config.license.clone())
            .with_lock_settings(config.lock_settings())
            .with_status_retry(config.status_retry.clone());
        coordinator.graph_template = config.graph()?;
        coordinator.exclude_empty_groups = config.exclude_empty_groups;
        Ok(coordinator)
    }

    pub fn with_license(mut self, license: LicenseInfo) -> Self {
        self.gate = CapacityGate::new(license);
        self
    }

    pub fn with_lock_settings(mut self, settings: LockSettings) -> Self {
        self.lock_settings = settings;
        self
    }

    pub fn with_status_retry(mut self, retry: RetryConfig) -> Self {
        self.status_retry = retry;
        self
    }

    /// Drop empty groups after decoding.
    pub fn with_exclude_empty_groups(mut self, exclude: bool) -> Self {
        self.exclude_empty_groups = exclude;
        self
    }

    /// Imports a raw document value.
    ///
    /// A value that is not an object is recorded as a malformed-source
    /// failure without taking the lock.
    pub async fn run_value(
        &self,
        inventory_id: i64,
        source_id: i64,
        value: serde_json::Value,
    ) -> RunReport {
        match InventoryDocument::from_value(value) {
            Ok(document) => self.run_document(inventory_id, source_id, &document).await,
            Err(err) => {
                let run_id = Uuid::new_v4();
                let span = info_span!("inventory_import", %run_id, inventory_id, source_id);
                async {
                    let started_at = Utc::now();
                    let mut transitions = Transitions::new();
                    let result = Err(ImportError::MalformedSource(err.to_string()));
                    let outcome = self
                        .conclude(run_id, inventory_id, source_id, started_at, result, &mut transitions)
                        .await;
                    transitions.enter(RunState::Idle);
                    RunReport {
                        run_id,
                        outcome,
                        transitions: transitions.0,
                        skipped_fragments: 0,
                    }
                }
                .instrument(span)
                .await
            }
        }
    }

    /// Decodes `document` into a graph carrying the configured filters and
    /// imports it.
    pub async fn run_document(
        &self,
        inventory_id: i64,
        source_id: i64,
        document: &InventoryDocument,
    ) -> RunReport {
        let decoded = document.decode(self.graph_template.clone());
        let mut graph = decoded.graph;
        if self.exclude_empty_groups {
            let removed = graph.delete_empty_groups();
            if !removed.is_empty() {
                info!(count = removed.len(), "Removed empty groups");
            }
        }
        let mut report = self.run(inventory_id, source_id, graph).await;
        report.skipped_fragments = decoded.skipped.len();
        report
    }

    /// Imports `graph` into `inventory_id` on behalf of `source_id`.
    pub async fn run(&self, inventory_id: i64, source_id: i64, graph: InventoryGraph) -> RunReport {
        let run_id = Uuid::new_v4();
        let span = info_span!("inventory_import", %run_id, inventory_id, source_id);
        self.run_inner(run_id, inventory_id, source_id, graph)
            .instrument(span)
            .await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        inventory_id: i64,
        source_id: i64,
        mut graph: InventoryGraph,
    ) -> RunReport {
        let started_at = Utc::now();
        let timer = Instant::now();
        let mut transitions = Transitions::new();

        let key = inventory_lock_key(inventory_id);
        let holder = run_id.to_string();
        let guard =
            match acquire_with_timeout(self.lock.clone(), &key, &holder, &self.lock_settings).await {
                Ok(guard) => guard,
                Err(err) => {
                    let outcome = self
                        .conclude(
                            run_id,
                            inventory_id,
                            source_id,
                            started_at,
                            Err(err.into()),
                            &mut transitions,
                        )
                        .await;
                    transitions.enter(RunState::Idle);
                    return self.report(run_id, outcome, transitions, timer);
                }
            };
        transitions.enter(RunState::LockAcquired);

        transitions.enter(RunState::Applying);
        let result = self
            .apply_in_transaction(inventory_id, source_id, &mut graph, &guard)
            .await;
        transitions.enter(if result.is_ok() {
            RunState::Committed
        } else {
            RunState::RolledBack
        });

        let outcome = self
            .conclude(run_id, inventory_id, source_id, started_at, result, &mut transitions)
            .await;

        if let Err(e) = guard.release().await {
            warn!(error = %e, "Failed to release inventory lock");
        }
        transitions.enter(RunState::Idle);
        self.report(run_id, outcome, transitions, timer)
    }

    /// Checks the license, then reconciles and re-checks capacity in one
    /// transaction. Host limits are only judged against the applied state, so
    /// an import that shrinks an over-limit inventory is accepted. The
    /// transaction commits only while `guard` still holds the inventory lock.
    /// Returns `Ok` only if it committed.
    async fn apply_in_transaction(
        &self,
        inventory_id: i64,
        source_id: i64,
        graph: &mut InventoryGraph,
        guard: &LockGuard,
    ) -> Result<ImportSummary, ImportError> {
        if let Err(err) = self.gate.check_license_validity(Utc::now()) {
            info!(error = %err, "License check failed before applying changes");
            return Err(err.into());
        }

        let tx = self.store.begin(inventory_id).await?;
        let applied = async {
            let summary = self.reconciler.apply(graph, source_id, tx.as_ref()).await?;
            self.gate.check(tx.as_ref()).await?;
            guard.verify().await?;
            Ok::<_, ImportError>(summary)
        }
        .await;

        match applied {
            Ok(summary) => {
                tx.commit().await?;
                debug!("Import transaction committed");
                Ok(summary)
            }
            Err(err) => {
                if let Err(e) = tx.rollback().await {
                    warn!(error = %e, "Failed to roll back import transaction");
                }
                debug!("Import transaction rolled back");
                Err(err)
            }
        }
    }

    /// Logs the result, writes the run record unless the error kind leaves no
    /// trace, and converts the result into an outcome.
    async fn conclude(
        &self,
        run_id: Uuid,
        inventory_id: i64,
        source_id: i64,
        started_at: DateTime<Utc>,
        result: Result<ImportSummary, ImportError>,
        transitions: &mut Transitions,
    ) -> RunOutcome {
        let record = match &result {
            Ok(summary) => {
                info!(
                    hosts_created = summary.hosts_created,
                    hosts_deleted = summary.hosts_deleted,
                    "Import run succeeded"
                );
                Some(RunRecord {
                    run_id,
                    inventory_id,
                    source_id,
                    status: RunStatus::Successful,
                    failure: None,
                    license_error: false,
                    org_host_limit_error: false,
                    detail: None,
                    summary: Some(summary.clone()),
                    started_at,
                    finished_at: Utc::now(),
                })
            }
            Err(err) => {
                if matches!(err, ImportError::LockTimeout { .. }) {
                    warn!(error = %err, "Import run did not start");
                } else {
                    error!(error = %err, "Import run failed");
                }
                let (license_error, org_host_limit_error) = match err {
                    ImportError::CapacityExceeded(e) => (e.kind.is_license(), !e.kind.is_license()),
                    _ => (false, false),
                };
                err.failure_kind().map(|failure| RunRecord {
                    run_id,
                    inventory_id,
                    source_id,
                    status: RunStatus::Failed,
                    failure: Some(failure),
                    license_error,
                    org_host_limit_error,
                    detail: Some(err.to_string()),
                    summary: None,
                    started_at,
                    finished_at: Utc::now(),
                })
            }
        };

        if let Some(record) = record {
            let store = &self.store;
            match with_retry(&self.status_retry, "record_run", || store.record_run(&record)).await {
                Ok(()) => transitions.enter(RunState::StatusRecorded),
                Err(e) => error!(error = %e, "Failed to record import run status"),
            }
        }
        result.into()
    }

    fn report(
        &self,
        run_id: Uuid,
        outcome: RunOutcome,
        transitions: Transitions,
        timer: Instant,
    ) -> RunReport {
        counter!("inventory_import_runs_total", "outcome" => outcome.label()).increment(1);
        histogram!("inventory_import_run_duration_seconds").record(timer.elapsed().as_secs_f64());
        RunReport {
            run_id,
            outcome,
            transitions: transitions.0,
            skipped_fragments: 0,
        }
    }
}
