//! In-memory inventory store.
//!
//! Each transaction works on a private copy of one inventory's rows and
//! replaces the committed copy on commit, so a rollback simply drops the copy.
//! Primary keys come from a store-wide sequence and are never reused.
//! Concurrent transactions on the same inventory are not merged; callers hold
//! the inventory lock for the duration of a transaction.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

use super::models::{
    Claim, Edge, GroupRecord, GroupUpdate, HostRecord, HostUpdate, InventoryRecord, NewGroup,
    NewHost, OrganizationRecord, RunRecord,
};
use super::{DbError, InventoryRepository, InventoryStore, InventoryTransaction};
use crate::graph::Variables;

#[derive(Debug, Clone)]
struct InventoryData {
    record: InventoryRecord,
    hosts: BTreeMap<i64, HostRecord>,
    groups: BTreeMap<i64, GroupRecord>,
    edges: BTreeSet<Edge>,
    claims: BTreeMap<Claim, BTreeSet<i64>>,
}

impl InventoryData {
    fn new(record: InventoryRecord) -> Self {
        Self {
            record,
            hosts: BTreeMap::new(),
            groups: BTreeMap::new(),
            edges: BTreeSet::new(),
            claims: BTreeMap::new(),
        }
    }

    fn host_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.hosts.values().map(|h| h.name.as_str())
    }

    fn claimed_by(&self, source_id: i64) -> impl Iterator<Item = Claim> + '_ {
        self.claims
            .iter()
            .filter(move |(_, sources)| sources.contains(&source_id))
            .map(|(claim, _)| *claim)
    }
}

#[derive(Debug, Default)]
struct StoreState {
    organizations: BTreeMap<i64, OrganizationRecord>,
    inventories: BTreeMap<i64, InventoryData>,
    runs: Vec<RunRecord>,
    record_failures: u32,
}

/// Committed rows of one inventory, for inspection.
#[derive(Debug, Clone)]
pub struct InventorySnapshot {
    pub inventory: InventoryRecord,
    pub hosts: Vec<HostRecord>,
    pub groups: Vec<GroupRecord>,
    pub edges: Vec<Edge>,
    pub claims: Vec<(Claim, Vec<i64>)>,
}

impl InventorySnapshot {
    /// Finds a host by name.
    pub fn host(&self, name: &str) -> Option<&HostRecord> {
        self.hosts.iter().find(|h| h.name == name)
    }

    /// Finds a group by name.
    pub fn group(&self, name: &str) -> Option<&GroupRecord> {
        self.groups.iter().find(|g| g.name == name)
    }

    /// Relationships as `(parent, member)` names, hosts and groups mixed.
    pub fn edge_names(&self) -> BTreeSet<(String, String)> {
        let group_name = |id: i64| {
            self.groups
                .iter()
                .find(|g| g.id == id)
                .map(|g| g.name.clone())
                .unwrap_or_default()
        };
        let host_name = |id: i64| {
            self.hosts
                .iter()
                .find(|h| h.id == id)
                .map(|h| h.name.clone())
                .unwrap_or_default()
        };
        self.edges
            .iter()
            .map(|edge| match edge {
                Edge::GroupChild { parent, child } => (group_name(*parent), group_name(*child)),
                Edge::GroupHost { group, host } => (group_name(*group), host_name(*host)),
            })
            .collect()
    }

    /// Sources claiming `claim`.
    pub fn claimants(&self, claim: Claim) -> Vec<i64> {
        self.claims
            .iter()
            .find(|(c, _)| *c == claim)
            .map(|(_, sources)| sources.clone())
            .unwrap_or_default()
    }
}

/// In-memory implementation of [`InventoryStore`].
#[derive(Clone)]
pub struct MemoryInventoryStore {
    state: Arc<RwLock<StoreState>>,
    next_id: Arc<AtomicI64>,
    failing_operation: Option<&'static str>,
}

impl Default for MemoryInventoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryInventoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(StoreState::default())),
            next_id: Arc::new(AtomicI64::new(1)),
            failing_operation: None,
        }
    }

    /// Makes every call of the named repository operation fail with a query
    /// error.
    pub fn with_failing_operation(mut self, operation: &'static str) -> Self {
        self.failing_operation = Some(operation);
        self
    }

    /// Makes the next `count` run-record writes fail with a transient error.
    pub async fn fail_next_run_records(&self, count: u32) {
        self.state.write().await.record_failures = count;
    }

    fn reserve(&self, id: i64) {
        self.next_id.fetch_max(id + 1, Ordering::SeqCst);
    }

    /// Adds an organization.
    pub async fn add_organization(&self, organization: OrganizationRecord) {
        self.reserve(organization.id);
        self.state
            .write()
            .await
            .organizations
            .insert(organization.id, organization);
    }

    /// Adds an empty inventory and returns its id.
    pub async fn add_inventory(&self, name: &str, organization_id: Option<i64>) -> i64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let record = InventoryRecord {
            id,
            name: name.to_string(),
            organization_id,
            variables: Variables::new(),
        };
        self.state
            .write()
            .await
            .inventories
            .insert(id, InventoryData::new(record));
        id
    }

    /// Inserts a host row as is, keeping its primary key.
    pub async fn insert_host(&self, host: HostRecord) -> Result<(), DbError> {
        self.reserve(host.id);
        let mut state = self.state.write().await;
        let data = state
            .inventories
            .get_mut(&host.inventory_id)
            .ok_or_else(|| DbError::not_found("Inventory", host.inventory_id))?;
        data.hosts.insert(host.id, host);
        Ok(())
    }

    /// Inserts a group row as is, keeping its primary key.
    pub async fn insert_group(&self, group: GroupRecord) -> Result<(), DbError> {
        self.reserve(group.id);
        let mut state = self.state.write().await;
        let data = state
            .inventories
            .get_mut(&group.inventory_id)
            .ok_or_else(|| DbError::not_found("Inventory", group.inventory_id))?;
        data.groups.insert(group.id, group);
        Ok(())
    }

    /// Inserts a relationship.
    pub async fn insert_edge(&self, inventory_id: i64, edge: Edge) -> Result<(), DbError> {
        let mut state = self.state.write().await;
        let data = state
            .inventories
            .get_mut(&inventory_id)
            .ok_or_else(|| DbError::not_found("Inventory", inventory_id))?;
        data.edges.insert(edge);
        Ok(())
    }

    /// Records a claim.
    pub async fn insert_claim(
        &self,
        inventory_id: i64,
        source_id: i64,
        claim: Claim,
    ) -> Result<(), DbError> {
        let mut state = self.state.write().await;
        let data = state
            .inventories
            .get_mut(&inventory_id)
            .ok_or_else(|| DbError::not_found("Inventory", inventory_id))?;
        data.claims.entry(claim).or_default().insert(source_id);
        Ok(())
    }

    /// Returns the committed rows of an inventory.
    pub async fn snapshot(&self, inventory_id: i64) -> Option<InventorySnapshot> {
        let state = self.state.read().await;
        let data = state.inventories.get(&inventory_id)?;
        Some(InventorySnapshot {
            inventory: data.record.clone(),
            hosts: data.hosts.values().cloned().collect(),
            groups: data.groups.values().cloned().collect(),
            edges: data.edges.iter().copied().collect(),
            claims: data
                .claims
                .iter()
                .map(|(claim, sources)| (*claim, sources.iter().copied().collect()))
                .collect(),
        })
    }

    /// Returns every recorded run, oldest first.
    pub async fn runs(&self) -> Vec<RunRecord> {
        self.state.read().await.runs.clone()
    }
}

#[async_trait]
impl InventoryStore for MemoryInventoryStore {
    async fn begin(&self, inventory_id: i64) -> Result<Box<dyn InventoryTransaction>, DbError> {
        let data = self
            .state
            .read()
            .await
            .inventories
            .get(&inventory_id)
            .cloned()
            .ok_or_else(|| DbError::not_found("Inventory", inventory_id))?;
        Ok(Box::new(MemoryInventoryTransaction {
            inventory_id,
            working: Mutex::new(data),
            state: self.state.clone(),
            next_id: self.next_id.clone(),
            failing_operation: self.failing_operation,
        }))
    }

    async fn record_run(&self, record: &RunRecord) -> Result<(), DbError> {
        let mut state = self.state.write().await;
        if state.record_failures > 0 {
            state.record_failures -= 1;
            return Err(DbError::PoolExhausted);
        }
        state.runs.retain(|run| run.run_id != record.run_id);
        state.runs.push(record.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<RunRecord>, DbError> {
        let state = self.state.read().await;
        Ok(state.runs.iter().find(|run| run.run_id == run_id).cloned())
    }
}

/// A transaction on a [`MemoryInventoryStore`].
pub struct MemoryInventoryTransaction {
    inventory_id: i64,
    working: Mutex<InventoryData>,
    state: Arc<RwLock<StoreState>>,
    next_id: Arc<AtomicI64>,
    failing_operation: Option<&'static str>,
}

impl MemoryInventoryTransaction {
    fn check(&self, operation: &'static str) -> Result<(), DbError> {
        match self.failing_operation {
            Some(failing) if failing == operation => Err(DbError::Query(format!(
                "injected failure in {}",
                operation
            ))),
            _ => Ok(()),
        }
    }

    fn allocate_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn distinct_host_names(&self, organization_id: Option<i64>) -> u64 {
        let state = self.state.read().await;
        let working = self.working.lock().await;
        let in_scope = |record: &InventoryRecord| {
            organization_id.is_none() || record.organization_id == organization_id
        };

        let mut names: BTreeSet<&str> = BTreeSet::new();
        for (id, data) in &state.inventories {
            if *id != self.inventory_id && in_scope(&data.record) {
                names.extend(data.host_names());
            }
        }
        if in_scope(&working.record) {
            names.extend(working.host_names());
        }
        names.len() as u64
    }
}

#[async_trait]
impl InventoryRepository for MemoryInventoryTransaction {
    fn inventory_id(&self) -> i64 {
        self.inventory_id
    }

    async fn inventory(&self) -> Result<InventoryRecord, DbError> {
        self.check("inventory")?;
        Ok(self.working.lock().await.record.clone())
    }

    async fn update_inventory_variables(&self, variables: &Variables) -> Result<(), DbError> {
        self.check("update_inventory_variables")?;
        self.working.lock().await.record.variables = variables.clone();
        Ok(())
    }

    async fn organization(&self, id: i64) -> Result<Option<OrganizationRecord>, DbError> {
        self.check("organization")?;
        Ok(self.state.read().await.organizations.get(&id).cloned())
    }

    async fn active_host_count(&self) -> Result<u64, DbError> {
        self.check("active_host_count")?;
        Ok(self.distinct_host_names(None).await)
    }

    async fn organization_host_count(&self, organization_id: i64) -> Result<u64, DbError> {
        self.check("organization_host_count")?;
        Ok(self.distinct_host_names(Some(organization_id)).await)
    }

    async fn owned_hosts(&self, source_id: i64) -> Result<Vec<HostRecord>, DbError> {
        self.check("owned_hosts")?;
        let working = self.working.lock().await;
        Ok(working
            .claimed_by(source_id)
            .filter_map(|claim| match claim {
                Claim::Host(id) => working.hosts.get(&id).cloned(),
                _ => None,
            })
            .collect())
    }

    async fn owned_groups(&self, source_id: i64) -> Result<Vec<GroupRecord>, DbError> {
        self.check("owned_groups")?;
        let working = self.working.lock().await;
        Ok(working
            .claimed_by(source_id)
            .filter_map(|claim| match claim {
                Claim::Group(id) => working.groups.get(&id).cloned(),
                _ => None,
            })
            .collect())
    }

    async fn owned_edges(&self, source_id: i64) -> Result<Vec<Edge>, DbError> {
        self.check("owned_edges")?;
        let working = self.working.lock().await;
        Ok(working
            .claimed_by(source_id)
            .filter_map(|claim| match claim {
                Claim::Edge(edge) if working.edges.contains(&edge) => Some(edge),
                _ => None,
            })
            .collect())
    }

    async fn find_hosts_by_pks(&self, pks: &[i64]) -> Result<Vec<HostRecord>, DbError> {
        self.check("find_hosts_by_pks")?;
        let working = self.working.lock().await;
        Ok(pks
            .iter()
            .filter_map(|pk| working.hosts.get(pk).cloned())
            .collect())
    }

    async fn find_hosts_by_instance_ids(
        &self,
        instance_ids: &[String],
    ) -> Result<Vec<HostRecord>, DbError> {
        self.check("find_hosts_by_instance_ids")?;
        let wanted: BTreeSet<&str> = instance_ids.iter().map(String::as_str).collect();
        let working = self.working.lock().await;
        Ok(working
            .hosts
            .values()
            .filter(|h| {
                h.instance_id
                    .as_deref()
                    .map(|id| wanted.contains(id))
                    .unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn find_hosts_by_names(&self, names: &[String]) -> Result<Vec<HostRecord>, DbError> {
        self.check("find_hosts_by_names")?;
        let wanted: BTreeSet<&str> = names.iter().map(String::as_str).collect();
        let working = self.working.lock().await;
        Ok(working
            .hosts
            .values()
            .filter(|h| wanted.contains(h.name.as_str()))
            .cloned()
            .collect())
    }

    async fn find_groups_by_names(&self, names: &[String]) -> Result<Vec<GroupRecord>, DbError> {
        self.check("find_groups_by_names")?;
        let wanted: BTreeSet<&str> = names.iter().map(String::as_str).collect();
        let working = self.working.lock().await;
        Ok(working
            .groups
            .values()
            .filter(|g| wanted.contains(g.name.as_str()))
            .cloned()
            .collect())
    }

    async fn get_or_create_group(&self, group: &NewGroup) -> Result<(GroupRecord, bool), DbError> {
        self.check("get_or_create_group")?;
        let mut working = self.working.lock().await;
        if let Some(existing) = working.groups.values().find(|g| g.name == group.name) {
            return Ok((existing.clone(), false));
        }
        let record = GroupRecord {
            id: self.allocate_id(),
            inventory_id: self.inventory_id,
            name: group.name.clone(),
            description: group.description.clone(),
            variables: group.variables.clone(),
        };
        working.groups.insert(record.id, record.clone());
        Ok((record, true))
    }

    async fn get_or_create_host(&self, host: &NewHost) -> Result<(HostRecord, bool), DbError> {
        self.check("get_or_create_host")?;
        let mut working = self.working.lock().await;
        if let Some(existing) = working.hosts.values().find(|h| h.name == host.name) {
            return Ok((existing.clone(), false));
        }
        let record = HostRecord {
            id: self.allocate_id(),
            inventory_id: self.inventory_id,
            name: host.name.clone(),
            description: host.description.clone(),
            variables: host.variables.clone(),
            enabled: host.enabled,
            instance_id: host.instance_id.clone(),
        };
        working.hosts.insert(record.id, record.clone());
        Ok((record, true))
    }

    async fn update_group(&self, pk: i64, update: &GroupUpdate) -> Result<GroupRecord, DbError> {
        self.check("update_group")?;
        let mut working = self.working.lock().await;
        let group = working
            .groups
            .get_mut(&pk)
            .ok_or_else(|| DbError::not_found("Group", pk))?;
        update.apply_to(group);
        Ok(group.clone())
    }

    async fn update_host(&self, pk: i64, update: &HostUpdate) -> Result<HostRecord, DbError> {
        self.check("update_host")?;
        let mut working = self.working.lock().await;
        if let Some(name) = &update.name {
            if working.hosts.values().any(|h| h.id != pk && &h.name == name) {
                return Err(DbError::Constraint(format!(
                    "Host with name '{}' already exists in inventory {}",
                    name, self.inventory_id
                )));
            }
        }
        let host = working
            .hosts
            .get_mut(&pk)
            .ok_or_else(|| DbError::not_found("Host", pk))?;
        update.apply_to(host);
        Ok(host.clone())
    }

    async fn delete_hosts(&self, pks: &[i64]) -> Result<usize, DbError> {
        self.check("delete_hosts")?;
        let mut working = self.working.lock().await;
        let mut deleted = 0;
        for pk in pks {
            let Some(host) = working.hosts.remove(pk) else {
                continue;
            };
            working.edges.retain(|edge| !matches!(edge, Edge::GroupHost { host, .. } if host == pk));
            working.claims.retain(|claim, _| !claim.involves_host(*pk));
            debug!(host = %host.name, pk = *pk, "Host row deleted");
            deleted += 1;
        }
        Ok(deleted)
    }

    async fn delete_groups(&self, pks: &[i64]) -> Result<usize, DbError> {
        self.check("delete_groups")?;
        let mut working = self.working.lock().await;
        let mut deleted = 0;
        for pk in pks {
            let Some(group) = working.groups.remove(pk) else {
                continue;
            };
            working.edges.retain(|edge| match edge {
                Edge::GroupChild { parent, child } => parent != pk && child != pk,
                Edge::GroupHost { group, .. } => group != pk,
            });
            working.claims.retain(|claim, _| !claim.involves_group(*pk));
            debug!(group = %group.name, pk = *pk, "Group row deleted");
            deleted += 1;
        }
        Ok(deleted)
    }

    async fn edges_from(&self, groups: &[i64]) -> Result<Vec<Edge>, DbError> {
        self.check("edges_from")?;
        let wanted: BTreeSet<i64> = groups.iter().copied().collect();
        let working = self.working.lock().await;
        Ok(working
            .edges
            .iter()
            .filter(|edge| wanted.contains(&edge.parent()))
            .copied()
            .collect())
    }

    async fn existing_edges(&self, edges: &[Edge]) -> Result<Vec<Edge>, DbError> {
        self.check("existing_edges")?;
        let working = self.working.lock().await;
        Ok(edges
            .iter()
            .filter(|edge| working.edges.contains(edge))
            .copied()
            .collect())
    }

    async fn add_edge(&self, edge: Edge) -> Result<bool, DbError> {
        self.check("add_edge")?;
        let mut working = self.working.lock().await;
        let (parent, member_exists) = match edge {
            Edge::GroupChild { parent, child } => (parent, working.groups.contains_key(&child)),
            Edge::GroupHost { group, host } => (group, working.hosts.contains_key(&host)),
        };
        if !working.groups.contains_key(&parent) || !member_exists {
            return Err(DbError::Constraint(format!(
                "Relationship {:?} references a missing row",
                edge
            )));
        }
        Ok(working.edges.insert(edge))
    }

    async fn remove_edge(&self, edge: Edge) -> Result<bool, DbError> {
        self.check("remove_edge")?;
        let mut working = self.working.lock().await;
        working.claims.remove(&Claim::Edge(edge));
        Ok(working.edges.remove(&edge))
    }

    async fn claim_ownership(&self, source_id: i64, claims: &[Claim]) -> Result<(), DbError> {
        self.check("claim_ownership")?;
        let mut working = self.working.lock().await;
        for claim in claims {
            working.claims.entry(*claim).or_default().insert(source_id);
        }
        Ok(())
    }

    async fn release_ownership(&self, source_id: i64, claims: &[Claim]) -> Result<(), DbError> {
        self.check("release_ownership")?;
        let mut working = self.working.lock().await;
        for claim in claims {
            if let Some(sources) = working.claims.get_mut(claim) {
                sources.remove(&source_id);
                if sources.is_empty() {
                    working.claims.remove(claim);
                }
            }
        }
        Ok(())
    }

    async fn claimed_by_others(
        &self,
        source_id: i64,
        claims: &[Claim],
    ) -> Result<Vec<Claim>, DbError> {
        self.check("claimed_by_others")?;
        let working = self.working.lock().await;
        Ok(claims
            .iter()
            .filter(|claim| {
                working
                    .claims
                    .get(claim)
                    .map(|sources| sources.iter().any(|s| *s != source_id))
                    .unwrap_or(false)
            })
            .copied()
            .collect())
    }

    async fn edges_claimed_by_others(
        &self,
        source_id: i64,
        hosts: &[i64],
        groups: &[i64],
    ) -> Result<Vec<Edge>, DbError> {
        self.check("edges_claimed_by_others")?;
        let working = self.working.lock().await;
        Ok(working
            .claims
            .iter()
            .filter(|(_, sources)| sources.iter().any(|s| *s != source_id))
            .filter(|(claim, _)| {
                hosts.iter().any(|pk| claim.involves_host(*pk))
                    || groups.iter().any(|pk| claim.involves_group(*pk))
            })
            .filter_map(|(claim, _)| match claim {
                Claim::Edge(edge) => Some(*edge),
                _ => None,
            })
            .collect())
    }
}

#[async_trait]
impl InventoryTransaction for MemoryInventoryTransaction {
    async fn commit(self: Box<Self>) -> Result<(), DbError> {
        let MemoryInventoryTransaction {
            inventory_id,
            working,
            state,
            ..
        } = *self;
        let data = working.into_inner();
        state
            .write()
            .await
            .inventories
            .insert(inventory_id, data);
        debug!(inventory_id, "Committed inventory transaction");
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), DbError> {
        debug!(inventory_id = self.inventory_id, "Rolled back inventory transaction");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::DEFAULT_DESCRIPTION;

    async fn store_with_inventory() -> (MemoryInventoryStore, i64) {
        let store = MemoryInventoryStore::new();
        let id = store.add_inventory("inv", None).await;
        (store, id)
    }

    #[tokio::test]
    async fn test_rollback_discards_changes() {
        let (store, inv) = store_with_inventory().await;
        let tx = store.begin(inv).await.unwrap();
        let (host, created) = tx.get_or_create_host(&NewHost::named("h1")).await.unwrap();
        assert!(created);
        assert_eq!(host.description, DEFAULT_DESCRIPTION);
        tx.rollback().await.unwrap();

        assert!(store.snapshot(inv).await.unwrap().hosts.is_empty());
    }

    #[tokio::test]
    async fn test_commit_publishes_changes() {
        let (store, inv) = store_with_inventory().await;
        let tx = store.begin(inv).await.unwrap();
        tx.get_or_create_group(&NewGroup::named("web")).await.unwrap();
        let (again, created) = tx.get_or_create_group(&NewGroup::named("web")).await.unwrap();
        assert!(!created);
        tx.commit().await.unwrap();

        let snapshot = store.snapshot(inv).await.unwrap();
        assert_eq!(snapshot.groups.len(), 1);
        assert_eq!(snapshot.group("web").unwrap().id, again.id);
    }

    #[tokio::test]
    async fn test_delete_host_drops_edges_and_claims() {
        let (store, inv) = store_with_inventory().await;
        let tx = store.begin(inv).await.unwrap();
        let (group, _) = tx.get_or_create_group(&NewGroup::named("g")).await.unwrap();
        let (host, _) = tx.get_or_create_host(&NewHost::named("h")).await.unwrap();
        let edge = Edge::GroupHost {
            group: group.id,
            host: host.id,
        };
        assert!(tx.add_edge(edge).await.unwrap());
        assert!(!tx.add_edge(edge).await.unwrap());
        tx.claim_ownership(1, &[Claim::Host(host.id), Claim::Edge(edge)])
            .await
            .unwrap();

        assert_eq!(tx.delete_hosts(&[host.id, 999]).await.unwrap(), 1);
        assert!(tx.edges_from(&[group.id]).await.unwrap().is_empty());
        assert!(tx.owned_hosts(1).await.unwrap().is_empty());
        assert!(tx.owned_edges(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_claims_shared_between_sources() {
        let (store, inv) = store_with_inventory().await;
        let tx = store.begin(inv).await.unwrap();
        let (host, _) = tx.get_or_create_host(&NewHost::named("h")).await.unwrap();
        let claim = Claim::Host(host.id);
        tx.claim_ownership(1, &[claim]).await.unwrap();
        tx.claim_ownership(2, &[claim]).await.unwrap();

        assert_eq!(tx.claimed_by_others(1, &[claim]).await.unwrap(), vec![claim]);
        tx.release_ownership(2, &[claim]).await.unwrap();
        assert!(tx.claimed_by_others(1, &[claim]).await.unwrap().is_empty());
        assert_eq!(tx.owned_hosts(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_existing_edges_subset() {
        let (store, inv) = store_with_inventory().await;
        let tx = store.begin(inv).await.unwrap();
        let (group, _) = tx.get_or_create_group(&NewGroup::named("g")).await.unwrap();
        let (host, _) = tx.get_or_create_host(&NewHost::named("h")).await.unwrap();
        let member = Edge::GroupHost {
            group: group.id,
            host: host.id,
        };
        let nested = Edge::GroupChild {
            parent: group.id,
            child: group.id + 100,
        };
        tx.add_edge(member).await.unwrap();

        assert_eq!(tx.existing_edges(&[nested, member]).await.unwrap(), vec![member]);
        assert!(tx.existing_edges(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_single_host_lookups() {
        let (store, inv) = store_with_inventory().await;
        let tx = store.begin(inv).await.unwrap();
        let mut new = NewHost::named("web1");
        new.instance_id = Some("i-123".to_string());
        let (host, _) = tx.get_or_create_host(&new).await.unwrap();

        let by_pk = tx.find_host_by_pk(host.id).await.unwrap().unwrap();
        assert_eq!(by_pk.name, "web1");
        let by_instance = tx.find_host_by_instance_id("i-123").await.unwrap().unwrap();
        assert_eq!(by_instance.id, host.id);
        assert!(tx.find_host_by_instance_id("i-404").await.unwrap().is_none());
        assert!(tx.find_host_by_pk(host.id + 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rename_collision_is_a_constraint_error() {
        let (store, inv) = store_with_inventory().await;
        let tx = store.begin(inv).await.unwrap();
        let (a, _) = tx.get_or_create_host(&NewHost::named("a")).await.unwrap();
        tx.get_or_create_host(&NewHost::named("b")).await.unwrap();
        let update = HostUpdate {
            name: Some("b".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            tx.update_host(a.id, &update).await,
            Err(DbError::Constraint(_))
        ));
    }

    #[tokio::test]
    async fn test_active_host_count_spans_inventories() {
        let store = MemoryInventoryStore::new();
        let first = store.add_inventory("first", Some(100)).await;
        let second = store.add_inventory("second", None).await;

        let tx = store.begin(first).await.unwrap();
        tx.get_or_create_host(&NewHost::named("shared")).await.unwrap();
        tx.get_or_create_host(&NewHost::named("only-first")).await.unwrap();
        tx.commit().await.unwrap();

        let tx = store.begin(second).await.unwrap();
        tx.get_or_create_host(&NewHost::named("shared")).await.unwrap();
        assert_eq!(tx.active_host_count().await.unwrap(), 2);
        assert_eq!(tx.organization_host_count(100).await.unwrap(), 2);
        tx.get_or_create_host(&NewHost::named("new")).await.unwrap();
        assert_eq!(tx.active_host_count().await.unwrap(), 3);
        assert_eq!(tx.organization_host_count(100).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_injected_failure_and_record_retries() {
        let store = MemoryInventoryStore::new().with_failing_operation("delete_groups");
        let inv = store.add_inventory("inv", None).await;
        let tx = store.begin(inv).await.unwrap();
        assert!(matches!(tx.delete_groups(&[1]).await, Err(DbError::Query(_))));

        store.fail_next_run_records(1).await;
        let run = RunRecord {
            run_id: Uuid::new_v4(),
            inventory_id: inv,
            source_id: 1,
            status: crate::db::RunStatus::Successful,
            failure: None,
            license_error: false,
            org_host_limit_error: false,
            detail: None,
            summary: None,
            started_at: chrono::Utc::now(),
            finished_at: chrono::Utc::now(),
        };
        assert!(matches!(store.record_run(&run).await, Err(DbError::PoolExhausted)));
        store.record_run(&run).await.unwrap();
        assert_eq!(store.get_run(run.run_id).await.unwrap(), Some(run));
    }
}
