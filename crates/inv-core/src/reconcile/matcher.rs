//! Identity resolution between graph nodes and persisted rows.
//!
//! Hosts are matched in priority order: by primary key recovered from the
//! variables of previously imported rows, by recorded instance ID, then by
//! name. A row matched once is not offered to a later host.

use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, warn};

use super::ReconcileOptions;
use crate::db::{DbError, GroupRecord, HostRecord, InventoryRepository};
use crate::error::ImportError;
use crate::graph::{GroupId, HostId, InventoryGraph};

/// Instance ID lookups built before any mutation.
#[derive(Debug, Default)]
pub(crate) struct IdentityMaps {
    /// Instance IDs recovered from owned rows that never had one recorded.
    pub db_instance_ids: HashMap<String, i64>,
    /// The graph host holding each instance ID.
    pub mem_instance_ids: BTreeMap<String, HostId>,
}

/// Resolves every host's instance ID into the graph and builds both maps.
///
/// Two hosts resolving to the same instance ID is a conflict: the host
/// processed last keeps it, unless the options ask for a hard failure.
pub(crate) async fn build_identity_maps<R>(
    graph: &mut InventoryGraph,
    repo: &R,
    source_id: i64,
    options: &ReconcileOptions,
) -> Result<IdentityMaps, ImportError>
where
    R: InventoryRepository + ?Sized,
{
    let resolver = &options.identity;
    let mut maps = IdentityMaps::default();
    if !resolver.tracks_instance_ids() {
        return Ok(maps);
    }

    let resolved: Vec<(HostId, String, Option<String>)> = graph
        .hosts()
        .map(|(id, host)| {
            (
                id,
                host.name().to_string(),
                resolver.instance_id(host.variables()),
            )
        })
        .collect();

    for (id, name, instance_id) in resolved {
        let Some(instance_id) = instance_id else {
            graph.set_instance_id(id, None);
            continue;
        };
        if let Some(previous) = maps.mem_instance_ids.insert(instance_id.clone(), id) {
            let first = graph.host(previous).name().to_string();
            if options.reject_duplicate_instance_ids {
                return Err(ImportError::IdentityConflict {
                    instance_id,
                    first,
                    second: name,
                });
            }
            warn!(
                instance_id = %instance_id,
                first = %first,
                second = %name,
                "Duplicate instance ID in source, later host keeps it"
            );
            graph.set_instance_id(previous, None);
        }
        graph.set_instance_id(id, Some(instance_id));
    }

    let root_keys = resolver.instance_id_root_keys();
    for row in repo.owned_hosts(source_id).await? {
        if row.instance_id.is_some() {
            continue;
        }
        if !root_keys.iter().any(|key| row.variables.contains_key(key)) {
            continue;
        }
        if let Some(instance_id) = resolver.instance_id(&row.variables) {
            maps.db_instance_ids.insert(instance_id, row.id);
        }
    }

    debug!(
        mem = maps.mem_instance_ids.len(),
        db = maps.db_instance_ids.len(),
        "Built instance ID maps"
    );
    Ok(maps)
}

/// Persisted rows matched to graph nodes.
#[derive(Debug, Default)]
pub(crate) struct Matches {
    pub hosts: HashMap<HostId, HostRecord>,
    pub groups: HashMap<GroupId, GroupRecord>,
    taken: HashSet<i64>,
}

impl Matches {
    fn accept(&mut self, host: HostId, row: &HostRecord) {
        if self.hosts.contains_key(&host) || !self.taken.insert(row.id) {
            return;
        }
        self.hosts.insert(host, row.clone());
    }

    /// Primary keys of every matched host row.
    pub fn host_pks(&self) -> HashSet<i64> {
        self.hosts.values().map(|row| row.id).collect()
    }

    /// Primary keys of every matched group row.
    pub fn group_pks(&self) -> HashSet<i64> {
        self.groups.values().map(|row| row.id).collect()
    }
}

/// Matches graph hosts and groups against persisted rows.
pub(crate) struct HostMatcher<'a> {
    graph: &'a InventoryGraph,
    maps: &'a IdentityMaps,
    batch_size: usize,
}

impl<'a> HostMatcher<'a> {
    pub(crate) fn new(graph: &'a InventoryGraph, maps: &'a IdentityMaps, batch_size: usize) -> Self {
        Self {
            graph,
            maps,
            batch_size: batch_size.max(1),
        }
    }

    pub(crate) async fn resolve<R>(&self, repo: &R) -> Result<Matches, DbError>
    where
        R: InventoryRepository + ?Sized,
    {
        let mut matches = Matches::default();
        self.match_by_pk(repo, &mut matches).await?;
        self.match_by_instance_id(repo, &mut matches).await?;
        self.match_by_name(repo, &mut matches).await?;
        self.match_groups(repo, &mut matches).await?;
        debug!(
            hosts = matches.hosts.len(),
            groups = matches.groups.len(),
            "Matched persisted rows"
        );
        Ok(matches)
    }

    async fn match_by_pk<R>(&self, repo: &R, matches: &mut Matches) -> Result<(), DbError>
    where
        R: InventoryRepository + ?Sized,
    {
        let wanted: Vec<(HostId, i64)> = self
            .graph
            .hosts()
            .filter_map(|(id, host)| {
                let instance_id = host.instance_id()?;
                self.maps.db_instance_ids.get(instance_id).map(|pk| (id, *pk))
            })
            .collect();

        for chunk in wanted.chunks(self.batch_size) {
            let pks: Vec<i64> = chunk.iter().map(|(_, pk)| *pk).collect();
            let rows: HashMap<i64, HostRecord> = repo
                .find_hosts_by_pks(&pks)
                .await?
                .into_iter()
                .map(|row| (row.id, row))
                .collect();
            for (id, pk) in chunk {
                if let Some(row) = rows.get(pk) {
                    matches.accept(*id, row);
                }
            }
        }
        Ok(())
    }

    async fn match_by_instance_id<R>(&self, repo: &R, matches: &mut Matches) -> Result<(), DbError>
    where
        R: InventoryRepository + ?Sized,
    {
        let wanted: Vec<(HostId, String)> = self
            .graph
            .hosts()
            .filter(|(id, _)| !matches.hosts.contains_key(id))
            .filter_map(|(id, host)| host.instance_id().map(|iid| (id, iid.to_string())))
            .collect();

        for chunk in wanted.chunks(self.batch_size) {
            let ids: Vec<String> = chunk.iter().map(|(_, iid)| iid.clone()).collect();
            let mut rows = repo.find_hosts_by_instance_ids(&ids).await?;
            rows.sort_by_key(|row| row.id);
            for (id, instance_id) in chunk {
                let candidate = rows.iter().find(|row| {
                    row.instance_id.as_deref() == Some(instance_id.as_str())
                        && !matches.taken.contains(&row.id)
                });
                if let Some(row) = candidate {
                    matches.accept(*id, row);
                }
            }
        }
        Ok(())
    }

    async fn match_by_name<R>(&self, repo: &R, matches: &mut Matches) -> Result<(), DbError>
    where
        R: InventoryRepository + ?Sized,
    {
        let wanted: Vec<(HostId, String)> = self
            .graph
            .hosts()
            .filter(|(id, _)| !matches.hosts.contains_key(id))
            .map(|(id, host)| (id, host.name().to_string()))
            .collect();

        for chunk in wanted.chunks(self.batch_size) {
            let names: Vec<String> = chunk.iter().map(|(_, name)| name.clone()).collect();
            let rows: HashMap<String, HostRecord> = repo
                .find_hosts_by_names(&names)
                .await?
                .into_iter()
                .map(|row| (row.name.clone(), row))
                .collect();
            for (id, name) in chunk {
                if let Some(row) = rows.get(name) {
                    matches.accept(*id, row);
                }
            }
        }
        Ok(())
    }

    async fn match_groups<R>(&self, repo: &R, matches: &mut Matches) -> Result<(), DbError>
    where
        R: InventoryRepository + ?Sized,
    {
        let wanted: Vec<(GroupId, String)> = self
            .graph
            .groups()
            .map(|(id, group)| (id, group.name().to_string()))
            .collect();

        for chunk in wanted.chunks(self.batch_size) {
            let names: Vec<String> = chunk.iter().map(|(_, name)| name.clone()).collect();
            let rows: HashMap<String, GroupRecord> = repo
                .find_groups_by_names(&names)
                .await?
                .into_iter()
                .map(|row| (row.name.clone(), row))
                .collect();
            for (id, name) in chunk {
                if let Some(row) = rows.get(name) {
                    matches.groups.insert(*id, row.clone());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{InventoryStore, MemoryInventoryStore, DEFAULT_DESCRIPTION};
    use crate::identity::IdentityResolver;
    use crate::graph::Variables;
    use serde_json::json;

    fn options(reject: bool) -> ReconcileOptions {
        ReconcileOptions {
            identity: IdentityResolver::new(Some("ec2_id".to_string()), None, None),
            reject_duplicate_instance_ids: reject,
            ..Default::default()
        }
    }

    fn host_row(id: i64, inventory_id: i64, name: &str, instance_id: Option<&str>) -> HostRecord {
        HostRecord {
            id,
            inventory_id,
            name: name.to_string(),
            description: DEFAULT_DESCRIPTION.to_string(),
            variables: Variables::new(),
            enabled: true,
            instance_id: instance_id.map(str::to_string),
        }
    }

    fn graph_with(hosts: &[(&str, &str)]) -> InventoryGraph {
        let mut graph = InventoryGraph::new();
        for (name, instance_id) in hosts {
            let id = graph.get_or_create_host(name).unwrap();
            graph
                .host_mut(id)
                .variables_mut()
                .insert("ec2_id".to_string(), json!(instance_id));
        }
        graph
    }

    #[tokio::test]
    async fn test_duplicate_instance_id_last_wins() {
        let store = MemoryInventoryStore::new();
        let inv = store.add_inventory("inv", None).await;
        let tx = store.begin(inv).await.unwrap();
        let mut graph = graph_with(&[("a", "i-1"), ("b", "i-1")]);

        let maps = build_identity_maps(&mut graph, tx.as_ref(), 1, &options(false))
            .await
            .unwrap();
        let b = graph.host_id("b").unwrap();
        assert_eq!(maps.mem_instance_ids.get("i-1"), Some(&b));
        assert_eq!(graph.host(graph.host_id("a").unwrap()).instance_id(), None);
        assert_eq!(graph.host(b).instance_id(), Some("i-1"));
    }

    #[tokio::test]
    async fn test_duplicate_instance_id_rejected() {
        let store = MemoryInventoryStore::new();
        let inv = store.add_inventory("inv", None).await;
        let tx = store.begin(inv).await.unwrap();
        let mut graph = graph_with(&[("a", "i-1"), ("b", "i-1")]);

        let err = build_identity_maps(&mut graph, tx.as_ref(), 1, &options(true))
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::IdentityConflict { ref first, .. } if first == "a"));
    }

    #[tokio::test]
    async fn test_match_priority_and_single_use() {
        let store = MemoryInventoryStore::new();
        let inv = store.add_inventory("inv", None).await;
        store.insert_host(host_row(7, inv, "old", Some("i-123"))).await.unwrap();
        store.insert_host(host_row(8, inv, "other", None)).await.unwrap();
        let tx = store.begin(inv).await.unwrap();

        let mut graph = graph_with(&[("new", "i-123")]);
        graph.get_or_create_host("other").unwrap();
        graph.get_or_create_host("old").unwrap();
        let maps = build_identity_maps(&mut graph, tx.as_ref(), 1, &options(false))
            .await
            .unwrap();
        let matches = HostMatcher::new(&graph, &maps, 1)
            .resolve(tx.as_ref())
            .await
            .unwrap();

        assert_eq!(matches.hosts[&graph.host_id("new").unwrap()].id, 7);
        assert_eq!(matches.hosts[&graph.host_id("other").unwrap()].id, 8);
        assert!(!matches.hosts.contains_key(&graph.host_id("old").unwrap()));
    }

    #[tokio::test]
    async fn test_recovers_instance_id_from_owned_row_variables() {
        let store = MemoryInventoryStore::new();
        let inv = store.add_inventory("inv", None).await;
        let mut row = host_row(5, inv, "legacy", None);
        row.variables = json!({"ec2_id": "i-9"}).as_object().cloned().unwrap();
        store.insert_host(row).await.unwrap();
        store.insert_claim(inv, 1, crate::db::Claim::Host(5)).await.unwrap();
        let tx = store.begin(inv).await.unwrap();

        let mut graph = graph_with(&[("renamed", "i-9")]);
        let maps = build_identity_maps(&mut graph, tx.as_ref(), 1, &options(false))
            .await
            .unwrap();
        assert_eq!(maps.db_instance_ids.get("i-9"), Some(&5));

        let matches = HostMatcher::new(&graph, &maps, 500)
            .resolve(tx.as_ref())
            .await
            .unwrap();
        assert_eq!(matches.hosts[&graph.host_id("renamed").unwrap()].id, 5);
    }
}
