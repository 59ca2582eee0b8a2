//! Conversion between [`InventoryGraph`] and the nested inventory document.
//!
//! ```text
//! {"_meta": {"hostvars": {"h1": {"x": 1}}},
//!  "all": {"children": ["g1", "ungrouped"], "vars": {...}},
//!  "g1": {"hosts": ["h1"], "vars": {"a": 1}, "children": [...]},
//!  "ungrouped": {"hosts": ["h2"]}}
//! ```
//!
//! Decoding is lenient: sections with an unexpected shape are logged and
//! skipped. Only a document that is not an object at all is rejected.

mod fragment;

pub use fragment::{GroupBody, GroupSection, HostsField, SkippedFragment};

use crate::graph::{GroupId, InventoryGraph, Variables, ROOT_GROUP_NAME, UNGROUPED_GROUP_NAME};
use fragment::type_name;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Key holding per-host variables.
pub const META_KEY: &str = "_meta";

/// Errors that make a whole document unusable.
#[derive(Error, Debug)]
pub enum CodecError {
    /// The document is not a JSON object.
    #[error("Expected inventory document to be a dict, got {0}")]
    NotAnObject(&'static str),

    /// The document is not valid JSON.
    #[error("Invalid inventory JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result of decoding a document.
#[derive(Debug, Clone)]
pub struct DecodedInventory {
    /// The populated graph.
    pub graph: InventoryGraph,
    /// Sections that were ignored.
    pub skipped: Vec<SkippedFragment>,
}

/// An inventory document as produced by an inventory source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InventoryDocument(Map<String, Value>);

impl InventoryDocument {
    /// Wraps a JSON value, which must be an object.
    pub fn from_value(value: Value) -> Result<Self, CodecError> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(CodecError::NotAnObject(type_name(&other))),
        }
    }

    /// Parses a JSON string.
    pub fn from_json_str(input: &str) -> Result<Self, CodecError> {
        Self::from_value(serde_json::from_str(input)?)
    }

    /// Returns the top-level sections.
    pub fn sections(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Returns one top-level section.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Converts the document into a JSON value.
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// Decodes the document into `graph`, which carries any name filters.
    ///
    /// Groups are created detached while the sections are read; afterwards
    /// every declared group without a parent is linked under the root, so the
    /// result does not depend on section order. `_meta.hostvars` is applied
    /// last and merges over variables given inline in group host maps.
    pub fn decode(&self, mut graph: InventoryGraph) -> DecodedInventory {
        let mut skipped = Vec::new();
        let root = graph.root();

        for (name, section) in &self.0 {
            if name == META_KEY {
                continue;
            }
            let Some(group) = graph.get_or_create_group(name, None) else {
                continue;
            };
            let Some(section) = GroupSection::parse(name, section, &mut skipped) else {
                continue;
            };
            match section {
                GroupSection::Body(body) => apply_group_body(&mut graph, group, body),
                GroupSection::HostList(hosts) => {
                    for reference in &hosts {
                        if let Some(host) = graph.get_or_create_host(reference) {
                            graph.add_host(group, host);
                        }
                    }
                }
            }
        }

        let orphans: Vec<GroupId> = graph
            .groups()
            .filter(|(_, group)| group.parents().next().is_none())
            .map(|(id, _)| id)
            .collect();
        for group in orphans {
            graph.add_child_group(root, group);
        }

        if let Some(meta) = self.0.get(META_KEY) {
            apply_meta(&mut graph, meta, &mut skipped);
        }

        if let Some(cycle) = graph.find_cycle() {
            warn!(cycle = %cycle.join(" -> "), "Inventory contains a group cycle");
        }

        info!(
            groups = graph.group_count(),
            hosts = graph.host_count(),
            skipped = skipped.len(),
            "Loaded inventory document"
        );

        DecodedInventory { graph, skipped }
    }

    /// Encodes a graph.
    ///
    /// The `ungrouped` section lists exactly the hosts that belong to no
    /// declared group.
    pub fn encode(graph: &InventoryGraph) -> Self {
        let mut doc = Map::new();
        let root = graph.group(graph.root());

        let ungrouped: Vec<String> = graph
            .hosts()
            .filter(|(id, _)| !graph.is_grouped(*id))
            .map(|(_, host)| host.name().to_string())
            .collect();

        let mut all = Map::new();
        let mut top: BTreeSet<String> = root
            .children()
            .map(|id| graph.group(id).name().to_string())
            .collect();
        if !ungrouped.is_empty() {
            top.insert(UNGROUPED_GROUP_NAME.to_string());
        }
        if !top.is_empty() {
            all.insert("children".to_string(), json!(top));
        }
        if !root.variables().is_empty() {
            all.insert("vars".to_string(), Value::Object(root.variables().clone()));
        }
        doc.insert(ROOT_GROUP_NAME.to_string(), Value::Object(all));

        for (_, group) in graph.groups() {
            let mut section = Map::new();
            let hosts: BTreeSet<&str> = group.hosts().map(|id| graph.host(id).name()).collect();
            if !hosts.is_empty() {
                section.insert("hosts".to_string(), json!(hosts));
            }
            let children: BTreeSet<&str> =
                group.children().map(|id| graph.group(id).name()).collect();
            if !children.is_empty() {
                section.insert("children".to_string(), json!(children));
            }
            if !group.variables().is_empty() {
                section.insert("vars".to_string(), Value::Object(group.variables().clone()));
            }
            doc.insert(group.name().to_string(), Value::Object(section));
        }

        if !ungrouped.is_empty() {
            doc.insert(
                UNGROUPED_GROUP_NAME.to_string(),
                json!({ "hosts": ungrouped }),
            );
        }

        let hostvars: Map<String, Value> = graph
            .hosts()
            .filter(|(_, host)| !host.variables().is_empty())
            .map(|(_, host)| (host.name().to_string(), Value::Object(host.variables().clone())))
            .collect();
        doc.insert(META_KEY.to_string(), json!({ "hostvars": hostvars }));

        Self(doc)
    }
}

fn apply_group_body(graph: &mut InventoryGraph, group: GroupId, body: GroupBody) {
    match body.hosts {
        Some(HostsField::NameList(names)) => {
            for reference in &names {
                if let Some(host) = graph.get_or_create_host(reference) {
                    graph.add_host(group, host);
                }
            }
        }
        Some(HostsField::NameVarMap(entries)) => {
            for (reference, vars) in entries {
                let Some(host) = graph.get_or_create_host(&reference) else {
                    continue;
                };
                if let Some(vars) = vars {
                    merge_into(graph.host_mut(host).variables_mut(), vars);
                }
                graph.add_host(group, host);
            }
        }
        None => {}
    }

    merge_into(graph.group_mut(group).variables_mut(), body.vars);

    for child_name in &body.children {
        if child_name == UNGROUPED_GROUP_NAME || child_name == ROOT_GROUP_NAME {
            continue;
        }
        if let Some(child) = graph.get_or_create_group(child_name, None) {
            graph.add_child_group(group, child);
        }
    }
}

fn apply_meta(graph: &mut InventoryGraph, meta: &Value, skipped: &mut Vec<SkippedFragment>) {
    let Value::Object(meta) = meta else {
        SkippedFragment::record(
            skipped,
            META_KEY,
            format!("expected dict, got {}", type_name(meta)),
        );
        return;
    };
    let hostvars = match meta.get("hostvars") {
        None | Some(Value::Null) => return,
        Some(Value::Object(hostvars)) => hostvars,
        Some(other) => {
            SkippedFragment::record(
                skipped,
                "_meta.hostvars",
                format!("expected dict, got {}", type_name(other)),
            );
            return;
        }
    };

    for (reference, vars) in hostvars {
        let Value::Object(vars) = vars else {
            SkippedFragment::record(
                skipped,
                format!("_meta.hostvars.{}", reference),
                format!("expected dict of vars, got {}", type_name(vars)),
            );
            continue;
        };
        match graph.get_or_create_host(reference) {
            Some(host) => merge_into(graph.host_mut(host).variables_mut(), vars.clone()),
            None => debug!(host = %reference, "Skipping hostvars for filtered host"),
        }
    }
}

fn merge_into(target: &mut Variables, source: Variables) {
    for (key, value) in source {
        target.insert(key, value);
    }
}
