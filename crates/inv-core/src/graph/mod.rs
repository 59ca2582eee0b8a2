//! In-memory model of a single inventory import.
//!
//! Hosts and groups live in arenas owned by [`InventoryGraph`] and refer to
//! each other through [`HostId`] and [`GroupId`] indices. Group nesting forms a
//! DAG: a group may have several parents, and the parent back-references exist
//! for traversal only. The root group answers to both `all` and `ungrouped`.
//!
//! Lookups that are rejected by a configured name filter return `None`; callers
//! treat that as "skip this entry", never as an error.

mod filter;

pub use filter::NameFilter;

use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Variables attached to a host, a group or the inventory itself.
pub type Variables = Map<String, Value>;

/// Name of the root group.
pub const ROOT_GROUP_NAME: &str = "all";

/// Alias of the root group used for hosts that belong to no declared group.
pub const UNGROUPED_GROUP_NAME: &str = "ungrouped";

/// Variable set on a host referenced as `name:port`.
pub const PORT_VARIABLE: &str = "ansible_ssh_port";

/// Index of a host inside its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostId(usize);

/// Index of a group inside its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(usize);

/// A host discovered by the inventory source.
#[derive(Debug, Clone)]
pub struct Host {
    name: String,
    variables: Variables,
    instance_id: Option<String>,
}

impl Host {
    fn new(name: String, port: Option<u16>) -> Self {
        let mut variables = Variables::new();
        if let Some(port) = port {
            variables.insert(PORT_VARIABLE.to_string(), Value::from(port));
        }
        Self {
            name,
            variables,
            instance_id: None,
        }
    }

    /// Returns the host name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the host variables.
    pub fn variables(&self) -> &Variables {
        &self.variables
    }

    /// Returns the host variables for modification.
    pub fn variables_mut(&mut self) -> &mut Variables {
        &mut self.variables
    }

    /// Returns the resolved instance ID, if one was assigned.
    pub fn instance_id(&self) -> Option<&str> {
        self.instance_id.as_deref()
    }
}

/// A group of hosts and child groups.
#[derive(Debug, Clone)]
pub struct Group {
    name: String,
    variables: Variables,
    children: BTreeSet<GroupId>,
    parents: BTreeSet<GroupId>,
    hosts: BTreeSet<HostId>,
}

impl Group {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            variables: Variables::new(),
            children: BTreeSet::new(),
            parents: BTreeSet::new(),
            hosts: BTreeSet::new(),
        }
    }

    /// Returns the group name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the group variables.
    pub fn variables(&self) -> &Variables {
        &self.variables
    }

    /// Returns the group variables for modification.
    pub fn variables_mut(&mut self) -> &mut Variables {
        &mut self.variables
    }

    /// Returns the child groups.
    pub fn children(&self) -> impl Iterator<Item = GroupId> + '_ {
        self.children.iter().copied()
    }

    /// Returns the parent groups.
    pub fn parents(&self) -> impl Iterator<Item = GroupId> + '_ {
        self.parents.iter().copied()
    }

    /// Returns the member hosts.
    pub fn hosts(&self) -> impl Iterator<Item = HostId> + '_ {
        self.hosts.iter().copied()
    }

    /// Returns `true` if the group contains the host directly.
    pub fn contains_host(&self, host: HostId) -> bool {
        self.hosts.contains(&host)
    }

    /// Returns `true` if the group has the given direct child.
    pub fn has_child(&self, child: GroupId) -> bool {
        self.children.contains(&child)
    }

    /// Returns `true` if the group has no children, no hosts and no variables.
    pub fn is_empty(&self) -> bool {
        self.children.is_empty() && self.hosts.is_empty() && self.variables.is_empty()
    }
}

/// The host/group graph for one import run.
#[derive(Debug, Clone)]
pub struct InventoryGraph {
    hosts: Vec<Host>,
    groups: Vec<Group>,
    all_hosts: BTreeMap<String, HostId>,
    all_groups: BTreeMap<String, GroupId>,
    group_filter: Option<NameFilter>,
    host_filter: Option<NameFilter>,
}

impl Default for InventoryGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl InventoryGraph {
    const ROOT: GroupId = GroupId(0);

    /// Creates an empty graph containing only the root group.
    pub fn new() -> Self {
        Self {
            hosts: Vec::new(),
            groups: vec![Group::new(ROOT_GROUP_NAME)],
            all_hosts: BTreeMap::new(),
            all_groups: BTreeMap::new(),
            group_filter: None,
            host_filter: None,
        }
    }

    /// Sets the filter applied to group names on first reference.
    pub fn with_group_filter(mut self, filter: NameFilter) -> Self {
        self.group_filter = Some(filter);
        self
    }

    /// Sets the filter applied to host names on first reference.
    pub fn with_host_filter(mut self, filter: NameFilter) -> Self {
        self.host_filter = Some(filter);
        self
    }

    /// Returns the root group.
    pub fn root(&self) -> GroupId {
        Self::ROOT
    }

    /// Returns a host by index.
    ///
    /// Indices are only valid for the graph that issued them.
    pub fn host(&self, id: HostId) -> &Host {
        &self.hosts[id.0]
    }

    /// Returns a host by index for modification.
    pub fn host_mut(&mut self, id: HostId) -> &mut Host {
        &mut self.hosts[id.0]
    }

    /// Returns a group by index.
    pub fn group(&self, id: GroupId) -> &Group {
        &self.groups[id.0]
    }

    /// Returns a group by index for modification.
    pub fn group_mut(&mut self, id: GroupId) -> &mut Group {
        &mut self.groups[id.0]
    }

    /// Looks up a host by name without creating it.
    pub fn host_id(&self, name: &str) -> Option<HostId> {
        self.all_hosts.get(name).copied()
    }

    /// Looks up a group by name without creating it.
    ///
    /// The reserved names resolve to the root group.
    pub fn group_id(&self, name: &str) -> Option<GroupId> {
        if is_root_alias(name) {
            return Some(Self::ROOT);
        }
        self.all_groups.get(name).copied()
    }

    /// Iterates over all hosts, ordered by name.
    pub fn hosts(&self) -> impl Iterator<Item = (HostId, &Host)> + '_ {
        self.all_hosts.values().map(|id| (*id, &self.hosts[id.0]))
    }

    /// Iterates over all groups except the root, ordered by name.
    pub fn groups(&self) -> impl Iterator<Item = (GroupId, &Group)> + '_ {
        self.all_groups.values().map(|id| (*id, &self.groups[id.0]))
    }

    /// Number of hosts in the graph.
    pub fn host_count(&self) -> usize {
        self.all_hosts.len()
    }

    /// Number of groups in the graph, excluding the root.
    pub fn group_count(&self) -> usize {
        self.all_groups.len()
    }

    /// Returns the host with the given name, creating it on first reference.
    ///
    /// A reference of the form `name:port` or `[ipv6]:port` creates host
    /// `name` and records the port in its variables. Returns `None` when the
    /// host filter rejects the name.
    pub fn get_or_create_host(&mut self, reference: &str) -> Option<HostId> {
        let (name, port) = split_host_port(reference);
        if let Some(filter) = &self.host_filter {
            if !filter.matches(&name) {
                debug!(host = %name, "Filtering host");
                return None;
            }
        }
        if let Some(id) = self.all_hosts.get(&name) {
            return Some(*id);
        }
        let id = HostId(self.hosts.len());
        self.hosts.push(Host::new(name.clone(), port));
        self.all_hosts.insert(name, id);
        Some(id)
    }

    /// Returns the group with the given name, creating it on first reference.
    ///
    /// `all` and `ungrouped` always resolve to the root. A newly created group
    /// is linked under `parent` when one is given; an existing group is
    /// returned unchanged. Returns `None` when the group filter rejects the
    /// name.
    pub fn get_or_create_group(&mut self, name: &str, parent: Option<GroupId>) -> Option<GroupId> {
        if is_root_alias(name) {
            return Some(Self::ROOT);
        }
        if let Some(filter) = &self.group_filter {
            if !filter.matches(name) {
                debug!(group = %name, "Filtering group");
                return None;
            }
        }
        if let Some(id) = self.all_groups.get(name) {
            return Some(*id);
        }
        let id = GroupId(self.groups.len());
        self.groups.push(Group::new(name));
        self.all_groups.insert(name.to_string(), id);
        if let Some(parent) = parent {
            self.add_child_group(parent, id);
        }
        Some(id)
    }

    /// Links `child` under `parent`. Self links are ignored.
    ///
    /// Returns `true` if a new link was made.
    pub fn add_child_group(&mut self, parent: GroupId, child: GroupId) -> bool {
        if parent == child {
            return false;
        }
        let added = self.groups[parent.0].children.insert(child);
        self.groups[child.0].parents.insert(parent);
        added
    }

    /// Adds a host to a group. Returns `true` if it was not already a member.
    pub fn add_host(&mut self, group: GroupId, host: HostId) -> bool {
        self.groups[group.0].hosts.insert(host)
    }

    /// Records the resolved instance ID of a host.
    pub fn set_instance_id(&mut self, host: HostId, instance_id: Option<String>) {
        self.hosts[host.0].instance_id = instance_id;
    }

    /// Returns `true` if the host is a member of at least one declared group.
    pub fn is_grouped(&self, host: HostId) -> bool {
        self.groups().any(|(_, group)| group.contains_host(host))
    }

    /// Removes every group with no children, no hosts and no variables.
    ///
    /// Runs as a single pass: a parent that becomes empty because its only
    /// child was removed is kept. Returns the removed names.
    pub fn delete_empty_groups(&mut self) -> Vec<String> {
        let empty: Vec<(String, GroupId)> = self
            .groups()
            .filter(|(_, group)| group.is_empty())
            .map(|(id, group)| (group.name.clone(), id))
            .collect();

        for (name, id) in &empty {
            debug!(group = %name, "Removing empty group");
            let parents: Vec<GroupId> = self.groups[id.0].parents.iter().copied().collect();
            for parent in parents {
                self.groups[parent.0].children.remove(id);
            }
            self.groups[id.0].parents.clear();
            self.all_groups.remove(name);
        }

        empty.into_iter().map(|(name, _)| name).collect()
    }

    /// Returns the names along a group cycle, if the graph contains one.
    ///
    /// The first and last entries of the returned path are the same group.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }

        let mut marks = vec![Mark::Unvisited; self.groups.len()];
        let mut starts: Vec<GroupId> = vec![Self::ROOT];
        starts.extend(self.all_groups.values().copied());

        for start in starts {
            if marks[start.0] != Mark::Unvisited {
                continue;
            }
            // Iterative DFS; the stack holds the path from `start`.
            let mut path: Vec<(GroupId, Vec<GroupId>)> =
                vec![(start, self.groups[start.0].children.iter().copied().collect())];
            marks[start.0] = Mark::InProgress;

            while let Some((node, pending)) = path.last_mut() {
                let node = *node;
                match pending.pop() {
                    Some(child) => match marks[child.0] {
                        Mark::InProgress => {
                            let from = path
                                .iter()
                                .position(|(id, _)| *id == child)
                                .unwrap_or(0);
                            let mut names: Vec<String> = path[from..]
                                .iter()
                                .map(|(id, _)| self.groups[id.0].name.clone())
                                .collect();
                            names.push(self.groups[child.0].name.clone());
                            return Some(names);
                        }
                        Mark::Unvisited => {
                            marks[child.0] = Mark::InProgress;
                            let next = self.groups[child.0].children.iter().copied().collect();
                            path.push((child, next));
                        }
                        Mark::Done => {}
                    },
                    None => {
                        marks[node.0] = Mark::Done;
                        path.pop();
                    }
                }
            }
        }
        None
    }
}

fn is_root_alias(name: &str) -> bool {
    name == ROOT_GROUP_NAME || name == UNGROUPED_GROUP_NAME
}

/// Splits a host reference into its name and optional port.
fn split_host_port(reference: &str) -> (String, Option<u16>) {
    if let Some(rest) = reference.strip_prefix('[') {
        if let Some((address, port)) = rest.split_once("]:") {
            let is_ipv6 = address.len() >= 3
                && address.chars().all(|c| c.is_ascii_hexdigit() || c == ':');
            if is_ipv6 && !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) {
                if let Ok(port) = port.parse::<u16>() {
                    return (address.to_string(), Some(port));
                }
            }
        }
        return (reference.to_string(), None);
    }

    if reference.matches(':').count() == 1 {
        if let Some((name, port)) = reference.split_once(':') {
            return match port.parse::<u16>() {
                Ok(port) => (name.to_string(), Some(port)),
                Err(_) => {
                    warn!(host = %name, port = %port, "Invalid port for host");
                    (name.to_string(), None)
                }
            };
        }
    }

    (reference.to_string(), None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reserved_names_alias_root() {
        let mut graph = InventoryGraph::new();
        let root = graph.root();
        assert_eq!(graph.get_or_create_group("all", None), Some(root));
        assert_eq!(graph.get_or_create_group("ungrouped", None), Some(root));
        assert_eq!(graph.group_count(), 0);
        assert_eq!(graph.group(root).name(), "all");
    }

    #[test]
    fn test_group_lookup_is_idempotent() {
        let mut graph = InventoryGraph::new();
        let root = graph.root();
        let web = graph.get_or_create_group("web", Some(root)).unwrap();
        let again = graph.get_or_create_group("web", None).unwrap();
        assert_eq!(web, again);
        assert_eq!(graph.group_count(), 1);
        assert!(graph.group(root).has_child(web));
    }

    #[test]
    fn test_group_created_without_parent_is_detached() {
        let mut graph = InventoryGraph::new();
        let child = graph.get_or_create_group("child", None).unwrap();
        assert!(!graph.group(graph.root()).has_child(child));
        assert_eq!(graph.group(child).parents().count(), 0);
    }

    #[test]
    fn test_group_with_multiple_parents() {
        let mut graph = InventoryGraph::new();
        let a = graph.get_or_create_group("a", None).unwrap();
        let b = graph.get_or_create_group("b", None).unwrap();
        let shared = graph.get_or_create_group("shared", None).unwrap();
        assert!(graph.add_child_group(a, shared));
        assert!(graph.add_child_group(b, shared));
        assert!(!graph.add_child_group(a, shared));
        let parents: Vec<GroupId> = graph.group(shared).parents().collect();
        assert_eq!(parents, vec![a, b]);
    }

    #[test]
    fn test_self_link_is_ignored() {
        let mut graph = InventoryGraph::new();
        let a = graph.get_or_create_group("a", None).unwrap();
        assert!(!graph.add_child_group(a, a));
        assert!(!graph.group(a).has_child(a));
    }

    #[test]
    fn test_host_filter_yields_none() {
        let mut graph = InventoryGraph::new().with_host_filter(NameFilter::new("web").unwrap());
        assert!(graph.get_or_create_host("web01").is_some());
        assert!(graph.get_or_create_host("db01").is_none());
        assert_eq!(graph.host_count(), 1);
    }

    #[test]
    fn test_group_filter_yields_none_but_root_passes() {
        let mut graph = InventoryGraph::new().with_group_filter(NameFilter::new("prod").unwrap());
        assert!(graph.get_or_create_group("prod-web", None).is_some());
        assert!(graph.get_or_create_group("dev-web", None).is_none());
        assert_eq!(graph.get_or_create_group("all", None), Some(graph.root()));
    }

    #[test]
    fn test_host_port_reference() {
        let mut graph = InventoryGraph::new();
        let id = graph.get_or_create_host("web01:2222").unwrap();
        let host = graph.host(id);
        assert_eq!(host.name(), "web01");
        assert_eq!(host.variables().get(PORT_VARIABLE), Some(&json!(2222)));
        assert_eq!(graph.get_or_create_host("web01"), Some(id));
    }

    #[test]
    fn test_host_ipv6_port_reference() {
        let mut graph = InventoryGraph::new();
        let id = graph.get_or_create_host("[fe80::1]:22").unwrap();
        assert_eq!(graph.host(id).name(), "fe80::1");
        assert_eq!(graph.host(id).variables().get(PORT_VARIABLE), Some(&json!(22)));
    }

    #[test]
    fn test_host_invalid_port_is_dropped() {
        let mut graph = InventoryGraph::new();
        let id = graph.get_or_create_host("web01:ssh").unwrap();
        assert_eq!(graph.host(id).name(), "web01");
        assert!(graph.host(id).variables().is_empty());
    }

    #[test]
    fn test_bare_ipv6_is_kept_whole() {
        let mut graph = InventoryGraph::new();
        let id = graph.get_or_create_host("fe80::1").unwrap();
        assert_eq!(graph.host(id).name(), "fe80::1");
    }

    #[test]
    fn test_delete_empty_groups_unlinks_from_parents() {
        let mut graph = InventoryGraph::new();
        let root = graph.root();
        let parent = graph.get_or_create_group("parent", Some(root)).unwrap();
        let empty = graph.get_or_create_group("empty", None).unwrap();
        let full = graph.get_or_create_group("full", None).unwrap();
        graph.add_child_group(parent, empty);
        graph.add_child_group(parent, full);
        let host = graph.get_or_create_host("h1").unwrap();
        graph.add_host(full, host);
        let with_vars = graph.get_or_create_group("with_vars", Some(root)).unwrap();
        graph
            .group_mut(with_vars)
            .variables_mut()
            .insert("a".to_string(), json!(1));

        let removed = graph.delete_empty_groups();

        assert_eq!(removed, vec!["empty".to_string()]);
        assert!(graph.group_id("empty").is_none());
        assert!(!graph.group(parent).has_child(empty));
        assert!(graph.group(parent).has_child(full));
        assert!(graph.group_id("with_vars").is_some());
    }

    #[test]
    fn test_delete_empty_groups_single_pass() {
        let mut graph = InventoryGraph::new();
        let root = graph.root();
        let outer = graph.get_or_create_group("outer", Some(root)).unwrap();
        let inner = graph.get_or_create_group("inner", None).unwrap();
        graph.add_child_group(outer, inner);

        let removed = graph.delete_empty_groups();

        assert_eq!(removed, vec!["inner".to_string()]);
        assert!(graph.group_id("outer").is_some());
    }

    #[test]
    fn test_is_grouped() {
        let mut graph = InventoryGraph::new();
        let root = graph.root();
        let g = graph.get_or_create_group("g", Some(root)).unwrap();
        let h1 = graph.get_or_create_host("h1").unwrap();
        let h2 = graph.get_or_create_host("h2").unwrap();
        graph.add_host(g, h1);
        graph.add_host(root, h2);
        assert!(graph.is_grouped(h1));
        assert!(!graph.is_grouped(h2));
    }

    #[test]
    fn test_find_cycle() {
        let mut graph = InventoryGraph::new();
        let root = graph.root();
        let a = graph.get_or_create_group("a", Some(root)).unwrap();
        let b = graph.get_or_create_group("b", None).unwrap();
        graph.add_child_group(a, b);
        assert!(graph.find_cycle().is_none());

        graph.add_child_group(b, a);
        let cycle = graph.find_cycle().unwrap();
        assert_eq!(cycle.first(), cycle.last());
        assert!(cycle.contains(&"a".to_string()));
        assert!(cycle.contains(&"b".to_string()));
    }

    #[test]
    fn test_diamond_is_not_a_cycle() {
        let mut graph = InventoryGraph::new();
        let root = graph.root();
        let a = graph.get_or_create_group("a", Some(root)).unwrap();
        let b = graph.get_or_create_group("b", Some(root)).unwrap();
        let c = graph.get_or_create_group("c", None).unwrap();
        graph.add_child_group(a, c);
        graph.add_child_group(b, c);
        assert!(graph.find_cycle().is_none());
    }

    #[test]
    fn test_hosts_iterate_by_name() {
        let mut graph = InventoryGraph::new();
        graph.get_or_create_host("zeta");
        graph.get_or_create_host("alpha");
        let names: Vec<&str> = graph.hosts().map(|(_, h)| h.name()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }
}
