//! Diff-merge-apply reconciliation of an import graph against persisted rows.
//!
//! [`Reconciler::apply`] runs six phases in a fixed order; each one relies on
//! the identities and rows settled by the ones before it:
//!
//! 1. identity maps and row matching
//! 2. scoped deletion of stale rows and relationships (`overwrite` only)
//! 3. root variable merge onto the inventory
//! 4. group upsert
//! 5. host upsert
//! 6. relationship materialization
//!
//! Every call goes through the caller's [`InventoryRepository`]; the caller
//! owns the transaction and decides whether to commit.

mod batch;
mod matcher;
mod prune;
mod relations;
mod upsert;

use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::db::InventoryRepository;
use crate::error::ImportError;
use crate::graph::{InventoryGraph, Variables};
use crate::identity::{value_to_string, IdentityResolver};

use matcher::{build_identity_maps, HostMatcher};

/// Default chunk size for set operations.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Largest chunk size. One chunk binds up to twice this many parameters in a
/// single SQLite statement, which stays below its 32766 variable limit.
pub const MAX_BATCH_SIZE: usize = 10_000;

/// Variable whose value becomes the row description instead of a variable.
pub const DESCRIPTION_VARIABLE: &str = "_awx_description";

/// Settings for one reconciliation.
#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    /// Delete rows and relationships this source owns but no longer reports.
    pub overwrite: bool,
    /// Replace variables instead of merging them.
    pub overwrite_vars: bool,
    /// Upper bound on identifiers passed to one set operation.
    pub batch_size: usize,
    /// Fail instead of warning when two hosts share an instance ID.
    pub reject_duplicate_instance_ids: bool,
    pub identity: IdentityResolver,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            overwrite: false,
            overwrite_vars: false,
            batch_size: DEFAULT_BATCH_SIZE,
            reject_duplicate_instance_ids: false,
            identity: IdentityResolver::default(),
        }
    }
}

/// Counts of what a reconciliation changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSummary {
    pub hosts_created: u64,
    pub hosts_updated: u64,
    pub hosts_deleted: u64,
    pub groups_created: u64,
    pub groups_updated: u64,
    pub groups_deleted: u64,
    pub edges_added: u64,
    pub edges_removed: u64,
    /// Stale rows or relationships left in place because another source
    /// still claims them; only this source's claim was dropped.
    pub claims_released: u64,
    pub inventory_variables_updated: bool,
}

impl ImportSummary {
    /// Returns `true` if no row, relationship or variable changed.
    pub fn is_unchanged(&self) -> bool {
        *self == Self::default()
    }

    fn record_metrics(&self) {
        let rows = [
            ("host", "created", self.hosts_created),
            ("host", "updated", self.hosts_updated),
            ("host", "deleted", self.hosts_deleted),
            ("group", "created", self.groups_created),
            ("group", "updated", self.groups_updated),
            ("group", "deleted", self.groups_deleted),
        ];
        for (kind, action, count) in rows {
            if count > 0 {
                counter!("inventory_import_rows_total", "kind" => kind, "action" => action)
                    .increment(count);
            }
        }
        if self.edges_added > 0 {
            counter!("inventory_import_edges_total", "action" => "added")
                .increment(self.edges_added);
        }
        if self.edges_removed > 0 {
            counter!("inventory_import_edges_total", "action" => "removed")
                .increment(self.edges_removed);
        }
    }
}

/// Merges `incoming` onto `existing`, or replaces it when `overwrite` is set.
pub fn merge_variables(existing: &Variables, incoming: &Variables, overwrite: bool) -> Variables {
    if overwrite {
        return incoming.clone();
    }
    let mut merged = existing.clone();
    for (key, value) in incoming {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Removes the description variable, returning the rest and the description.
pub(crate) fn split_description(variables: &Variables) -> (Variables, Option<String>) {
    let mut variables = variables.clone();
    let description = variables
        .remove(DESCRIPTION_VARIABLE)
        .map(|value| value_to_string(&value));
    (variables, description)
}

/// Applies import graphs to persisted state.
#[derive(Debug, Clone, Default)]
pub struct Reconciler {
    options: ReconcileOptions,
}

impl Reconciler {
    pub fn new(options: ReconcileOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ReconcileOptions {
        &self.options
    }

    /// Synchronizes persisted state with `graph` on behalf of `source_id`.
    ///
    /// Resolved instance IDs are written back into the graph. Any repository
    /// error aborts the run; the caller rolls back.
    pub async fn apply<R>(
        &self,
        graph: &mut InventoryGraph,
        source_id: i64,
        repo: &R,
    ) -> Result<ImportSummary, ImportError>
    where
        R: InventoryRepository + ?Sized,
    {
        let options = &self.options;
        let batch_size = options.batch_size.clamp(1, MAX_BATCH_SIZE);
        info!(
            inventory_id = repo.inventory_id(),
            source_id,
            hosts = graph.host_count(),
            groups = graph.group_count(),
            overwrite = options.overwrite,
            overwrite_vars = options.overwrite_vars,
            "Reconciling inventory"
        );

        let maps = build_identity_maps(graph, repo, source_id, options).await?;
        let graph = &*graph;
        let matches = HostMatcher::new(graph, &maps, batch_size).resolve(repo).await?;

        let mut summary = ImportSummary::default();
        if options.overwrite {
            prune::delete_stale(graph, &matches, repo, source_id, batch_size, &mut summary).await?;
        }

        summary.inventory_variables_updated =
            upsert::merge_root_variables(graph, repo, options.overwrite_vars).await?;
        let group_pks =
            upsert::upsert_groups(graph, &matches, repo, source_id, options, &mut summary).await?;
        let host_pks =
            upsert::upsert_hosts(graph, &matches, repo, source_id, options, &mut summary).await?;
        relations::materialize_edges(
            graph,
            &group_pks,
            &host_pks,
            repo,
            source_id,
            batch_size,
            &mut summary,
        )
        .await?;

        summary.record_metrics();
        info!(
            hosts_created = summary.hosts_created,
            hosts_updated = summary.hosts_updated,
            hosts_deleted = summary.hosts_deleted,
            groups_created = summary.groups_created,
            groups_updated = summary.groups_updated,
            groups_deleted = summary.groups_deleted,
            edges_added = summary.edges_added,
            edges_removed = summary.edges_removed,
            "Inventory reconciled"
        );
        Ok(summary)
    }
}
