//! Typed views of the pieces of an inventory document.
//!
//! Each section is validated on its own. A section with an unexpected shape is
//! reported as a [`SkippedFragment`] and left out; the rest of the document is
//! still decoded.

use crate::graph::Variables;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

/// A part of the document that was ignored because of its shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedFragment {
    /// Where the fragment was found, e.g. `web.hosts` or `_meta.hostvars.h1`.
    pub location: String,
    /// Why it was skipped.
    pub reason: String,
}

impl SkippedFragment {
    pub(crate) fn record(
        skipped: &mut Vec<SkippedFragment>,
        location: impl Into<String>,
        reason: impl Into<String>,
    ) {
        let fragment = SkippedFragment {
            location: location.into(),
            reason: reason.into(),
        };
        warn!(location = %fragment.location, reason = %fragment.reason, "Skipping malformed inventory fragment");
        skipped.push(fragment);
    }
}

/// Name of the JSON type of a value, for diagnostics.
pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}

/// The `hosts` field of a group: a list of names, or a map of name to variables.
#[derive(Debug, Clone, PartialEq)]
pub enum HostsField {
    /// `"hosts": ["h1", "h2"]`
    NameList(Vec<String>),
    /// `"hosts": {"h1": {"var": 1}, "h2": {}}`; `None` marks unusable variables.
    NameVarMap(Vec<(String, Option<Variables>)>),
}

impl HostsField {
    /// Validates a `hosts` value. Returns `None` if the whole field is unusable.
    pub fn parse(group: &str, value: &Value, skipped: &mut Vec<SkippedFragment>) -> Option<Self> {
        match value {
            Value::Array(items) => Some(HostsField::NameList(string_items(
                &format!("{}.hosts", group),
                items,
                skipped,
            ))),
            Value::Object(entries) => {
                let hosts = entries
                    .iter()
                    .map(|(name, vars)| {
                        let vars = match vars {
                            Value::Object(map) => Some(map.clone()),
                            Value::Null => Some(Variables::new()),
                            other => {
                                SkippedFragment::record(
                                    skipped,
                                    format!("{}.hosts.{}", group, name),
                                    format!("expected dict of vars, got {}", type_name(other)),
                                );
                                None
                            }
                        };
                        (name.clone(), vars)
                    })
                    .collect();
                Some(HostsField::NameVarMap(hosts))
            }
            other => {
                SkippedFragment::record(
                    skipped,
                    format!("{}.hosts", group),
                    format!("expected dict or list of hosts, got {}", type_name(other)),
                );
                None
            }
        }
    }

    /// Host names in document order.
    pub fn names(&self) -> Vec<&str> {
        match self {
            HostsField::NameList(names) => names.iter().map(String::as_str).collect(),
            HostsField::NameVarMap(entries) => entries.iter().map(|(n, _)| n.as_str()).collect(),
        }
    }
}

/// The detailed form of a group section.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupBody {
    pub hosts: Option<HostsField>,
    pub vars: Variables,
    pub children: Vec<String>,
}

/// A top-level group entry of the document.
#[derive(Debug, Clone, PartialEq)]
pub enum GroupSection {
    /// `"group": {"hosts": ..., "vars": {...}, "children": [...]}`
    Body(GroupBody),
    /// `"group": ["h1", "h2"]`
    HostList(Vec<String>),
}

impl GroupSection {
    /// Validates a group entry. Returns `None` if the entry is unusable.
    pub fn parse(group: &str, value: &Value, skipped: &mut Vec<SkippedFragment>) -> Option<Self> {
        match value {
            Value::Object(body) => {
                let hosts = match body.get("hosts") {
                    None | Some(Value::Null) => None,
                    Some(value) => HostsField::parse(group, value, skipped),
                };

                let vars = match body.get("vars") {
                    None | Some(Value::Null) => Variables::new(),
                    Some(Value::Object(vars)) => vars.clone(),
                    Some(other) => {
                        SkippedFragment::record(
                            skipped,
                            format!("{}.vars", group),
                            format!("expected dict of vars, got {}", type_name(other)),
                        );
                        Variables::new()
                    }
                };

                let children = match body.get("children") {
                    None | Some(Value::Null) => Vec::new(),
                    Some(Value::Array(items)) => {
                        string_items(&format!("{}.children", group), items, skipped)
                    }
                    Some(other) => {
                        SkippedFragment::record(
                            skipped,
                            format!("{}.children", group),
                            format!("expected list of children, got {}", type_name(other)),
                        );
                        Vec::new()
                    }
                };

                Some(GroupSection::Body(GroupBody {
                    hosts,
                    vars,
                    children,
                }))
            }
            Value::Array(items) => Some(GroupSection::HostList(string_items(group, items, skipped))),
            other => {
                SkippedFragment::record(
                    skipped,
                    group,
                    format!("expected dict or list for group, got {}", type_name(other)),
                );
                None
            }
        }
    }
}

/// Keeps the string items of a list, reporting the rest.
fn string_items(location: &str, items: &[Value], skipped: &mut Vec<SkippedFragment>) -> Vec<String> {
    items
        .iter()
        .enumerate()
        .filter_map(|(index, item)| match item {
            Value::String(s) => Some(s.clone()),
            other => {
                SkippedFragment::record(
                    skipped,
                    format!("{}[{}]", location, index),
                    format!("expected name, got {}", type_name(other)),
                );
                None
            }
        })
        .collect()
}
