//! Database-backed store adapters.
//!
//! - [`postgres`]: PostgreSQL, usable as source and destination
//! - [`mssql`]: Microsoft SQL Server, source only
//! - [`tls`]: rustls setup for PostgreSQL connections

pub mod mssql;
pub mod postgres;
pub mod tls;

pub use mssql::MssqlStore;
pub use postgres::{PgEndpoint, PgStore, StoreRole};
pub use tls::SslMode;

use crate::config::{MigrationConfig, SourceConfig, TargetConfig};
use crate::error::{MigrateError, Result};
use crate::store::{DestinationStore, SourceStore};

/// Connect the configured source store.
pub async fn connect_source(
    config: &SourceConfig,
    migration: &MigrationConfig,
) -> Result<Box<dyn SourceStore>> {
    match config.r#type.as_str() {
        "mssql" => {
            let store = MssqlStore::connect(
                config,
                migration.max_source_connections as u32,
                migration.fetch_batch_size,
            )
            .await?;
            Ok(Box::new(store))
        }
        "postgres" => {
            let endpoint = PgEndpoint::from_source(config)?;
            let store = PgStore::connect(
                &endpoint,
                migration.max_source_connections,
                migration.fetch_batch_size,
                StoreRole::Source,
            )
            .await?;
            Ok(Box::new(store))
        }
        other => Err(MigrateError::Config(format!(
            "unsupported source type '{}'",
            other
        ))),
    }
}

/// Connect the configured destination store.
pub async fn connect_target(
    config: &TargetConfig,
    migration: &MigrationConfig,
) -> Result<Box<dyn DestinationStore>> {
    let endpoint = PgEndpoint::from_target(config)?;
    let store = PgStore::connect(
        &endpoint,
        migration.max_target_connections,
        migration.fetch_batch_size,
        StoreRole::Target,
    )
    .await?;
    Ok(Box::new(store))
}
