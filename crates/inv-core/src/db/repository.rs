//! Repository ports used by the reconciler and the run coordinator.

use async_trait::async_trait;
use uuid::Uuid;

use super::models::{
    Claim, Edge, GroupRecord, GroupUpdate, HostRecord, HostUpdate, InventoryRecord, NewGroup,
    NewHost, OrganizationRecord, RunRecord,
};
use super::DbError;
use crate::graph::Variables;

/// Access to the persisted state of one inventory.
///
/// Every call runs inside the transaction the repository was opened with.
/// Batch lookups take at most one chunk of identifiers; callers do the
/// chunking.
#[async_trait]
pub trait InventoryRepository: Send + Sync {
    /// The inventory this repository is scoped to.
    fn inventory_id(&self) -> i64;

    /// Loads the inventory row.
    async fn inventory(&self) -> Result<InventoryRecord, DbError>;

    /// Replaces the inventory's root variables.
    async fn update_inventory_variables(&self, variables: &Variables) -> Result<(), DbError>;

    /// Loads an organization.
    async fn organization(&self, id: i64) -> Result<Option<OrganizationRecord>, DbError>;

    /// Number of distinct host names across all inventories.
    async fn active_host_count(&self) -> Result<u64, DbError>;

    /// Number of distinct host names across one organization's inventories.
    async fn organization_host_count(&self, organization_id: i64) -> Result<u64, DbError>;

    /// Hosts claimed by the source.
    async fn owned_hosts(&self, source_id: i64) -> Result<Vec<HostRecord>, DbError>;

    /// Groups claimed by the source.
    async fn owned_groups(&self, source_id: i64) -> Result<Vec<GroupRecord>, DbError>;

    /// Relationships claimed by the source.
    async fn owned_edges(&self, source_id: i64) -> Result<Vec<Edge>, DbError>;

    /// Hosts with the given primary keys.
    async fn find_hosts_by_pks(&self, pks: &[i64]) -> Result<Vec<HostRecord>, DbError>;

    /// Hosts whose instance ID is one of `instance_ids`.
    async fn find_hosts_by_instance_ids(
        &self,
        instance_ids: &[String],
    ) -> Result<Vec<HostRecord>, DbError>;

    /// Hosts whose name is one of `names`.
    async fn find_hosts_by_names(&self, names: &[String]) -> Result<Vec<HostRecord>, DbError>;

    /// Groups whose name is one of `names`.
    async fn find_groups_by_names(&self, names: &[String]) -> Result<Vec<GroupRecord>, DbError>;

    /// Looks up one host by primary key.
    async fn find_host_by_pk(&self, pk: i64) -> Result<Option<HostRecord>, DbError> {
        Ok(self.find_hosts_by_pks(&[pk]).await?.into_iter().next())
    }

    /// Looks up one host by instance ID.
    async fn find_host_by_instance_id(
        &self,
        instance_id: &str,
    ) -> Result<Option<HostRecord>, DbError> {
        Ok(self
            .find_hosts_by_instance_ids(&[instance_id.to_string()])
            .await?
            .into_iter()
            .next())
    }

    /// Returns the group named `group.name`, creating it from `group` if
    /// missing. The flag is `true` when the row was created.
    async fn get_or_create_group(&self, group: &NewGroup) -> Result<(GroupRecord, bool), DbError>;

    /// Returns the host named `host.name`, creating it from `host` if
    /// missing. The flag is `true` when the row was created.
    async fn get_or_create_host(&self, host: &NewHost) -> Result<(HostRecord, bool), DbError>;

    async fn update_group(&self, pk: i64, update: &GroupUpdate) -> Result<GroupRecord, DbError>;

    async fn update_host(&self, pk: i64, update: &HostUpdate) -> Result<HostRecord, DbError>;

    /// Deletes hosts one row at a time, along with their relationships and
    /// claims. Returns the number of rows deleted.
    async fn delete_hosts(&self, pks: &[i64]) -> Result<usize, DbError>;

    /// Deletes groups one row at a time, along with their relationships and
    /// claims. Returns the number of rows deleted.
    async fn delete_groups(&self, pks: &[i64]) -> Result<usize, DbError>;

    /// All relationships starting from the given groups.
    async fn edges_from(&self, groups: &[i64]) -> Result<Vec<Edge>, DbError>;

    /// The subset of `edges` that exists.
    async fn existing_edges(&self, edges: &[Edge]) -> Result<Vec<Edge>, DbError>;

    /// Adds a relationship. Returns `false` if it already existed.
    async fn add_edge(&self, edge: Edge) -> Result<bool, DbError>;

    /// Removes a relationship and every claim on it. Returns `false` if it
    /// did not exist.
    async fn remove_edge(&self, edge: Edge) -> Result<bool, DbError>;

    /// Records that the source claims each of `claims`.
    async fn claim_ownership(&self, source_id: i64, claims: &[Claim]) -> Result<(), DbError>;

    /// Drops the source's claim on each of `claims`.
    async fn release_ownership(&self, source_id: i64, claims: &[Claim]) -> Result<(), DbError>;

    /// The subset of `claims` that some other source also claims.
    async fn claimed_by_others(
        &self,
        source_id: i64,
        claims: &[Claim],
    ) -> Result<Vec<Claim>, DbError>;

    /// Relationships attached to any of `hosts` or `groups` that some other
    /// source claims.
    async fn edges_claimed_by_others(
        &self,
        source_id: i64,
        hosts: &[i64],
        groups: &[i64],
    ) -> Result<Vec<Edge>, DbError>;
}

/// A repository bound to an open transaction.
#[async_trait]
pub trait InventoryTransaction: InventoryRepository {
    /// Makes every change visible.
    async fn commit(self: Box<Self>) -> Result<(), DbError>;

    /// Discards every change.
    async fn rollback(self: Box<Self>) -> Result<(), DbError>;
}

/// Entry point to a persistence backend.
#[async_trait]
pub trait InventoryStore: Send + Sync {
    /// Opens a transaction scoped to one inventory.
    async fn begin(&self, inventory_id: i64) -> Result<Box<dyn InventoryTransaction>, DbError>;

    /// Writes a run record in its own transaction.
    async fn record_run(&self, record: &RunRecord) -> Result<(), DbError>;

    /// Loads a run record.
    async fn get_run(&self, run_id: Uuid) -> Result<Option<RunRecord>, DbError>;
}
