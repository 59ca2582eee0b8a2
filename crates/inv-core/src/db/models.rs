//! Persisted inventory records.

use crate::graph::Variables;
use crate::reconcile::ImportSummary;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Description given to rows that do not carry one.
pub const DEFAULT_DESCRIPTION: &str = "imported";

/// An organization and its host ceiling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrganizationRecord {
    pub id: i64,
    pub name: String,
    /// Maximum number of distinct host names across the organization's
    /// inventories. Zero means unlimited.
    pub max_hosts: u32,
}

/// An inventory and its root variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryRecord {
    pub id: i64,
    pub name: String,
    pub organization_id: Option<i64>,
    pub variables: Variables,
}

/// A persisted host row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostRecord {
    pub id: i64,
    pub inventory_id: i64,
    pub name: String,
    pub description: String,
    pub variables: Variables,
    pub enabled: bool,
    /// Durable external identity; `None` for rows imported without one.
    pub instance_id: Option<String>,
}

/// A persisted group row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupRecord {
    pub id: i64,
    pub inventory_id: i64,
    pub name: String,
    pub description: String,
    pub variables: Variables,
}

/// Values for a host row created by an import.
#[derive(Debug, Clone, PartialEq)]
pub struct NewHost {
    pub name: String,
    pub description: String,
    pub variables: Variables,
    pub enabled: bool,
    pub instance_id: Option<String>,
}

impl NewHost {
    /// A host with default fields.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: DEFAULT_DESCRIPTION.to_string(),
            variables: Variables::new(),
            enabled: true,
            instance_id: None,
        }
    }
}

/// Values for a group row created by an import.
#[derive(Debug, Clone, PartialEq)]
pub struct NewGroup {
    pub name: String,
    pub description: String,
    pub variables: Variables,
}

impl NewGroup {
    /// A group with default fields.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: DEFAULT_DESCRIPTION.to_string(),
            variables: Variables::new(),
        }
    }
}

/// Partial update for a host row. `None` leaves the field unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub variables: Option<Variables>,
    pub enabled: Option<bool>,
    pub instance_id: Option<String>,
}

impl HostUpdate {
    /// Returns `true` if no field would change.
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.variables.is_none()
            && self.enabled.is_none()
            && self.instance_id.is_none()
    }

    /// Names of the fields this update sets, for logging.
    pub fn changed_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.name.is_some() {
            fields.push("name");
        }
        if self.description.is_some() {
            fields.push("description");
        }
        if self.variables.is_some() {
            fields.push("variables");
        }
        if self.enabled.is_some() {
            fields.push("enabled");
        }
        if self.instance_id.is_some() {
            fields.push("instance_id");
        }
        fields
    }

    pub(crate) fn apply_to(&self, host: &mut HostRecord) {
        if let Some(name) = &self.name {
            host.name = name.clone();
        }
        if let Some(description) = &self.description {
            host.description = description.clone();
        }
        if let Some(variables) = &self.variables {
            host.variables = variables.clone();
        }
        if let Some(enabled) = self.enabled {
            host.enabled = enabled;
        }
        if let Some(instance_id) = &self.instance_id {
            host.instance_id = Some(instance_id.clone());
        }
    }
}

/// Partial update for a group row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupUpdate {
    pub description: Option<String>,
    pub variables: Option<Variables>,
}

impl GroupUpdate {
    pub fn is_empty(&self) -> bool {
        self.description.is_none() && self.variables.is_none()
    }

    pub(crate) fn apply_to(&self, group: &mut GroupRecord) {
        if let Some(description) = &self.description {
            group.description = description.clone();
        }
        if let Some(variables) = &self.variables {
            group.variables = variables.clone();
        }
    }
}

/// A persisted relationship between rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Edge {
    /// `child` is nested under `parent`.
    GroupChild { parent: i64, child: i64 },
    /// `host` is a member of `group`.
    GroupHost { group: i64, host: i64 },
}

impl Edge {
    /// The group the edge starts from.
    pub fn parent(&self) -> i64 {
        match self {
            Edge::GroupChild { parent, .. } => *parent,
            Edge::GroupHost { group, .. } => *group,
        }
    }
}

/// A row or relationship an import source is responsible for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Claim {
    Host(i64),
    Group(i64),
    Edge(Edge),
}

impl Claim {
    /// Storage form: kind plus two keys, the second zero for rows.
    pub fn as_db_parts(&self) -> (&'static str, i64, i64) {
        match self {
            Claim::Host(id) => ("host", *id, 0),
            Claim::Group(id) => ("group", *id, 0),
            Claim::Edge(Edge::GroupChild { parent, child }) => ("group_child", *parent, *child),
            Claim::Edge(Edge::GroupHost { group, host }) => ("group_host", *group, *host),
        }
    }

    pub fn from_db_parts(kind: &str, first: i64, second: i64) -> Option<Self> {
        match kind {
            "host" => Some(Claim::Host(first)),
            "group" => Some(Claim::Group(first)),
            "group_child" => Some(Claim::Edge(Edge::GroupChild {
                parent: first,
                child: second,
            })),
            "group_host" => Some(Claim::Edge(Edge::GroupHost {
                group: first,
                host: second,
            })),
            _ => None,
        }
    }

    /// Returns `true` if the claim refers to `host` directly or through an edge.
    pub fn involves_host(&self, host: i64) -> bool {
        match self {
            Claim::Host(id) => *id == host,
            Claim::Edge(Edge::GroupHost { host: h, .. }) => *h == host,
            _ => false,
        }
    }

    /// Returns `true` if the claim refers to `group` directly or through an edge.
    pub fn involves_group(&self, group: i64) -> bool {
        match self {
            Claim::Group(id) => *id == group,
            Claim::Edge(Edge::GroupChild { parent, child }) => *parent == group || *child == group,
            Claim::Edge(Edge::GroupHost { group: g, .. }) => *g == group,
            Claim::Host(_) => false,
        }
    }
}

/// Terminal status of an import run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Successful,
    Failed,
}

impl RunStatus {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            RunStatus::Successful => "successful",
            RunStatus::Failed => "failed",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "successful" => Some(RunStatus::Successful),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

/// Why a recorded run failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    CapacityExceeded,
    PersistenceError,
    MalformedSource,
}

impl FailureKind {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            FailureKind::CapacityExceeded => "capacity_exceeded",
            FailureKind::PersistenceError => "persistence_error",
            FailureKind::MalformedSource => "malformed_source",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "capacity_exceeded" => Some(FailureKind::CapacityExceeded),
            "persistence_error" => Some(FailureKind::PersistenceError),
            "malformed_source" => Some(FailureKind::MalformedSource),
            _ => None,
        }
    }
}

/// Durable record of one import run, written outside the import transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub inventory_id: i64,
    pub source_id: i64,
    pub status: RunStatus,
    pub failure: Option<FailureKind>,
    /// Set when the license host count or expiry check failed.
    pub license_error: bool,
    /// Set when the organization host limit check failed.
    pub org_host_limit_error: bool,
    pub detail: Option<String>,
    pub summary: Option<ImportSummary>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_claim_db_parts() {
        let claims = [
            Claim::Host(3),
            Claim::Group(4),
            Claim::Edge(Edge::GroupChild {
                parent: 1,
                child: 2,
            }),
            Claim::Edge(Edge::GroupHost { group: 1, host: 9 }),
        ];
        for claim in claims {
            let (kind, a, b) = claim.as_db_parts();
            assert_eq!(Claim::from_db_parts(kind, a, b), Some(claim));
        }
        assert_eq!(Claim::from_db_parts("inventory", 1, 0), None);
    }

    #[test]
    fn test_claim_involvement() {
        let edge = Claim::Edge(Edge::GroupHost { group: 1, host: 9 });
        assert!(edge.involves_host(9));
        assert!(edge.involves_group(1));
        assert!(!edge.involves_group(9));
        assert!(!Claim::Group(9).involves_host(9));
    }

    #[test]
    fn test_host_update_apply() {
        let mut host = HostRecord {
            id: 1,
            inventory_id: 1,
            name: "old".to_string(),
            description: DEFAULT_DESCRIPTION.to_string(),
            variables: Variables::new(),
            enabled: true,
            instance_id: None,
        };
        let update = HostUpdate {
            name: Some("new".to_string()),
            variables: json!({"a": 1}).as_object().cloned(),
            enabled: Some(false),
            ..Default::default()
        };
        assert_eq!(update.changed_fields(), vec!["name", "variables", "enabled"]);
        update.apply_to(&mut host);
        assert_eq!(host.name, "new");
        assert!(!host.enabled);
        assert_eq!(host.variables.get("a"), Some(&json!(1)));
        assert!(HostUpdate::default().is_empty());
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(RunStatus::from_db_str("failed"), Some(RunStatus::Failed));
        assert_eq!(
            FailureKind::from_db_str(FailureKind::CapacityExceeded.as_db_str()),
            Some(FailureKind::CapacityExceeded)
        );
    }
}
