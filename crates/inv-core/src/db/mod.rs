//! Persistence layer for inventory imports.
//!
//! The reconciler only sees [`InventoryRepository`]; the run coordinator opens
//! transactions and records run outcomes through [`InventoryStore`]. Two
//! backends are provided: [`MemoryInventoryStore`] and, with the `database`
//! feature, `SqliteInventoryStore` built on SQLx.

mod error;
mod memory;
pub mod models;
mod repository;
pub mod retry;

#[cfg(feature = "database")]
mod pool;
#[cfg(feature = "database")]
mod schema;
#[cfg(feature = "database")]
mod sqlite;

pub use error::DbError;
#[cfg(feature = "database")]
pub(crate) use error::is_busy;
pub use memory::{InventorySnapshot, MemoryInventoryStore, MemoryInventoryTransaction};
pub use models::{
    Claim, Edge, FailureKind, GroupRecord, GroupUpdate, HostRecord, HostUpdate, InventoryRecord,
    NewGroup, NewHost, OrganizationRecord, RunRecord, RunStatus, DEFAULT_DESCRIPTION,
};
pub use repository::{InventoryRepository, InventoryStore, InventoryTransaction};
pub use retry::{with_retry, RetryConfig};

#[cfg(feature = "database")]
pub use pool::{create_pool, create_pool_with_options, PoolOptions};
#[cfg(feature = "database")]
pub use schema::run_migrations;
#[cfg(feature = "database")]
pub use sqlite::{SqliteInventoryStore, SqliteInventoryTransaction};
