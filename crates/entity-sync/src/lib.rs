//! # entity-sync
//!
//! Record-level synchronization between two relational stores.
//!
//! For every registered record type, each source record is loaded together
//! with the records it references, looked up at the destination by primary
//! key, and then either inserted or fully overwritten. Each batch commits
//! atomically.
//!
//! - **Static schema**: record types, keys and references are declared data
//! - **Eager reference loading** with cycle-safe include plans
//! - **Change tracking** owned per run, with explicit detach and placeholders
//! - **Commit policies**: once per record type (default) or once per run
//! - **Adapters** for PostgreSQL, SQL Server (source) and an in-memory store
//!
//! ## Example
//!
//! ```rust,no_run
//! use entity_sync::{Config, Orchestrator};
//!
//! #[tokio::main]
//! async fn main() -> entity_sync::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let orchestrator = Orchestrator::from_config(&config).await?;
//!     let result = orchestrator.run_all().await?;
//!     println!("Saved {} rows", result.rows_saved);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod core;
pub mod drivers;
pub mod error;
pub mod orchestrator;
pub mod relation;
pub mod store;
pub mod sync;
pub mod tracking;

// Re-exports for convenient access
pub use config::{Config, MigrationConfig, MigrationEntry, SourceConfig, TargetConfig};
pub use context::{DestinationContext, SourceContext};
pub use crate::core::{
    PkValue, Record, RecordKey, RecordType, ReferenceKind, Related, ScalarType, Schema, SqlValue,
};
pub use error::{ErrorKind, MigrateError, Result};
pub use orchestrator::{
    CommitPolicy, HealthCheckResult, MigrationResult, Orchestrator, OrchestratorOptions,
};
pub use relation::{IncludePlan, RelationResolver};
pub use store::memory::MemoryStore;
pub use store::{DestinationStore, SourceStore};
pub use sync::{EntityMigrator, SyncEngine, SyncMode, SyncOptions, SyncResult};
pub use tracking::{ChangeTracker, EntityState};
