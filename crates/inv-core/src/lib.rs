//! # inv-core
//!
//! Inventory import reconciliation.
//!
//! This crate turns an inventory document produced by a dynamic source into
//! an in-memory host/group graph and reconciles that graph against the
//! persisted inventory: identity resolution across renames, deletion scoped
//! to what the source owns, batched relational writes, and a capacity check
//! before commit. A run coordinator holds the per-inventory lock and records
//! the terminal status of every run outside the import transaction.

pub mod capacity;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod graph;
pub mod identity;
pub mod lock;
pub mod reconcile;

pub use capacity::{
    CapacityError, CapacityExceeded, CapacityGate, CapacityKind, LicenseInfo, LicenseType,
};
pub use codec::{CodecError, DecodedInventory, InventoryDocument, SkippedFragment};
pub use config::{load_config, ConfigError, ImportConfig};
pub use coordinator::{RunCoordinator, RunReport, RunState};
pub use db::{
    DbError, InventoryRepository, InventoryStore, InventoryTransaction, MemoryInventoryStore,
};
pub use error::{ImportError, RunOutcome};
pub use graph::{Group, GroupId, Host, HostId, InventoryGraph, NameFilter, Variables};
pub use identity::{resolve_enabled, resolve_instance_id, IdentityResolver};
pub use lock::{InventoryLock, LockError, LockGuard, LockSettings, MemoryInventoryLock};
pub use reconcile::{merge_variables, ImportSummary, ReconcileOptions, Reconciler};

#[cfg(feature = "database")]
pub use db::SqliteInventoryStore;
#[cfg(feature = "database")]
pub use lock::SqliteInventoryLock;
