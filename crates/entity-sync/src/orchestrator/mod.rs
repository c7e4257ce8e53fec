//! Migration orchestrator - runs registered migrators in order.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::Config;
use crate::context::{DestinationContext, SourceContext};
use crate::core::Schema;
use crate::drivers;
use crate::error::{MigrateError, Result};
use crate::store::{DestinationStore, SourceStore};
use crate::sync::{EntityMigrator, SyncEngine, SyncOptions, SyncResult};

/// When staged changes are committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitPolicy {
    /// One commit after each record type.
    #[default]
    PerRecordType,
    /// One commit at the end of the run.
    PerRun,
}

impl std::str::FromStr for CommitPolicy {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "per_record_type" => Ok(CommitPolicy::PerRecordType),
            "per_run" => Ok(CommitPolicy::PerRun),
            other => Err(MigrateError::Config(format!(
                "Invalid commit policy '{}'. Valid values: per-record-type, per-run",
                other
            ))),
        }
    }
}

impl std::fmt::Display for CommitPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommitPolicy::PerRecordType => write!(f, "per-record-type"),
            CommitPolicy::PerRun => write!(f, "per-run"),
        }
    }
}

/// Run-wide settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrchestratorOptions {
    pub commit_policy: CommitPolicy,
    pub sync: SyncOptions,
}

/// Result of a migration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationResult {
    /// Unique run identifier.
    pub run_id: String,

    /// Final status.
    pub status: String,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    /// When the run started.
    pub started_at: DateTime<Utc>,

    /// When the run completed.
    pub completed_at: DateTime<Utc>,

    /// Commit policy in effect.
    pub commit_policy: CommitPolicy,

    /// Staged changes were discarded.
    pub dry_run: bool,

    /// Record types processed.
    pub record_types_total: usize,

    /// Rows written across all commits.
    pub rows_saved: u64,

    /// Per record type outcome, in run order.
    pub results: Vec<SyncResult>,
}

impl MigrationResult {
    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Connectivity report for both stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub source_connected: bool,
    pub source_latency_ms: u64,
    pub source_error: Option<String>,
    pub target_connected: bool,
    pub target_latency_ms: u64,
    pub target_error: Option<String>,
    pub healthy: bool,
}

/// Owns the run's stores and the ordered migrator list.
pub struct Orchestrator {
    schema: Arc<Schema>,
    options: OrchestratorOptions,
    source: Box<dyn SourceStore>,
    target: Box<dyn DestinationStore>,
    migrators: Vec<EntityMigrator>,
}

impl Orchestrator {
    /// Create an orchestrator over already connected stores.
    pub fn new(
        schema: Arc<Schema>,
        source: Box<dyn SourceStore>,
        target: Box<dyn DestinationStore>,
    ) -> Self {
        Self {
            schema,
            options: OrchestratorOptions::default(),
            source,
            target,
            migrators: Vec::new(),
        }
    }

    /// Connect the configured stores and register the configured migrations.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let schema = Arc::new(config.schema()?);
        let source = drivers::connect_source(&config.source, &config.migration).await?;
        let target = match drivers::connect_target(&config.target, &config.migration).await {
            Ok(target) => target,
            Err(e) => {
                source.close().await;
                return Err(e);
            }
        };

        let mut orchestrator =
            Self::new(schema, source, target).with_options(config.orchestrator_options());
        for entry in &config.migrations {
            if let Err(e) = orchestrator.register_migration(
                &entry.record_type,
                entry.source_table.as_deref(),
                entry.target_table.as_deref(),
            ) {
                orchestrator.close().await;
                return Err(e);
            }
        }
        Ok(orchestrator)
    }

    pub fn with_options(mut self, options: OrchestratorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &OrchestratorOptions {
        &self.options
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Append a migrator for `record_type`. Tables default to the record
    /// type's own table.
    pub fn register_migration(
        &mut self,
        record_type: &str,
        source_table: Option<&str>,
        target_table: Option<&str>,
    ) -> Result<&mut Self> {
        let rt = self.schema.get(record_type)?.clone();
        let mut migrator = EntityMigrator::new(rt);
        if let Some(table) = source_table {
            migrator = migrator.with_source_table(table);
        }
        if let Some(table) = target_table {
            migrator = migrator.with_target_table(table);
        }
        self.migrators.push(migrator);
        Ok(self)
    }

    /// Append a migrator reading and writing the record type's own table.
    pub fn register(mut self, record_type: &str) -> Result<Self> {
        self.register_migration(record_type, None, None)?;
        Ok(self)
    }

    /// Registered migrators in run order.
    pub fn migrations(&self) -> &[EntityMigrator] {
        &self.migrators
    }

    /// Run every registered migrator in order, stopping at the first error.
    /// Both stores are closed before returning.
    pub async fn run_all(self) -> Result<MigrationResult> {
        let started_at = Utc::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        info!("Starting migration run: {}", run_id);

        let outcome = self.run_migrators().await;
        self.close().await;
        let (results, rows_saved) = outcome?;

        let completed_at = Utc::now();
        let duration = (completed_at - started_at).num_milliseconds() as f64 / 1000.0;
        let dry_run = self.options.sync.dry_run;

        info!(
            "Migration run {} finished: {} record type(s), {} row(s) saved in {:.2}s",
            run_id,
            results.len(),
            rows_saved,
            duration
        );

        Ok(MigrationResult {
            run_id,
            status: if dry_run { "dry_run" } else { "completed" }.to_string(),
            duration_seconds: duration,
            started_at,
            completed_at,
            commit_policy: self.options.commit_policy,
            dry_run,
            record_types_total: results.len(),
            rows_saved,
            results,
        })
    }

    async fn run_migrators(&self) -> Result<(Vec<SyncResult>, u64)> {
        if self.migrators.is_empty() {
            warn!("No migration units configured.");
            return Ok((Vec::new(), 0));
        }

        let engine = SyncEngine::new(&self.schema, self.options.sync.clone());
        let mut source = SourceContext::new(self.source.as_ref());
        let mut destination = DestinationContext::new(self.target.as_ref());
        let mut results = Vec::with_capacity(self.migrators.len());

        match self.options.commit_policy {
            CommitPolicy::PerRecordType => {
                for migrator in &self.migrators {
                    let result = engine
                        .synchronize(&mut source, &mut destination, migrator)
                        .await?;
                    results.push(result);
                }
                let saved = results.iter().map(|r| r.saved).sum();
                Ok((results, saved))
            }
            CommitPolicy::PerRun => {
                for migrator in &self.migrators {
                    info!("Migrating {}...", migrator.name());
                    let start = Instant::now();
                    let mut result = engine
                        .stage(&mut source, &mut destination, migrator)
                        .await
                        .map_err(|e| {
                            crate::sync::log_failure(migrator.name(), &e);
                            e
                        })?;
                    result.dry_run = self.options.sync.dry_run;
                    result.duration_ms = start.elapsed().as_millis() as u64;
                    results.push(result);
                }

                if self.options.sync.dry_run {
                    let discarded = destination.discard();
                    info!("Dry run: discarded {} staged change(s)", discarded);
                    return Ok((results, 0));
                }
                let saved = engine.commit(&mut destination, "migration run").await?;
                Ok((results, saved))
            }
        }
    }

    /// Ping both stores concurrently.
    pub async fn health_check(&self) -> Result<HealthCheckResult> {
        let ((source, source_latency_ms), (target, target_latency_ms)) =
            futures::join!(timed(self.source.ping()), timed(self.target.ping()));

        let result = HealthCheckResult {
            source_connected: source.is_ok(),
            source_latency_ms,
            source_error: source.err().map(|e| e.to_string()),
            target_connected: target.is_ok(),
            target_latency_ms,
            target_error: target.err().map(|e| e.to_string()),
            healthy: false,
        };
        Ok(HealthCheckResult {
            healthy: result.source_connected && result.target_connected,
            ..result
        })
    }

    /// Close both stores.
    pub async fn close(&self) {
        self.source.close().await;
        self.target.close().await;
    }
}

async fn timed(ping: impl std::future::Future<Output = Result<()>>) -> (Result<()>, u64) {
    let start = Instant::now();
    let outcome = ping.await;
    (outcome, start.elapsed().as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Record, RecordType, ScalarType};
    use crate::store::memory::MemoryStore;
    use crate::sync::SyncMode;

    fn schema() -> Arc<Schema> {
        Arc::new(
            Schema::new(vec![RecordType::new("Item")
                .with_table("items")
                .with_field("id", ScalarType::I32)
                .with_field("name", ScalarType::Text)
                .with_primary_key(&["id"])])
            .unwrap(),
        )
    }

    fn orchestrator(schema: &Arc<Schema>, src: &MemoryStore, dst: &MemoryStore) -> Orchestrator {
        Orchestrator::new(schema.clone(), Box::new(src.clone()), Box::new(dst.clone()))
    }

    #[test]
    fn test_commit_policy_parse() {
        assert_eq!(
            "per-record-type".parse::<CommitPolicy>().unwrap(),
            CommitPolicy::PerRecordType
        );
        assert_eq!("per_run".parse::<CommitPolicy>().unwrap(), CommitPolicy::PerRun);
        assert_eq!("PER-RUN".parse::<CommitPolicy>().unwrap(), CommitPolicy::PerRun);
        assert!("sometimes".parse::<CommitPolicy>().is_err());
        assert_eq!(CommitPolicy::PerRun.to_string(), "per-run");
    }

    #[test]
    fn test_register_unknown_type() {
        let schema = schema();
        let store = MemoryStore::from_schema(&schema);
        let mut orch = orchestrator(&schema, &store, &store);
        let err = orch.register_migration("Ghost", None, None).err().unwrap();
        assert_eq!(err.exit_code(), 2);
        assert!(orch.migrations().is_empty());
    }

    #[test]
    fn test_register_keeps_order_and_tables() {
        let schema = schema();
        let store = MemoryStore::from_schema(&schema);
        let mut orch = orchestrator(&schema, &store, &store);
        orch.register_migration("Item", Some("legacy"), None)
            .unwrap()
            .register_migration("Item", None, Some("archive"))
            .unwrap();

        let tables: Vec<_> = orch
            .migrations()
            .iter()
            .map(|m| (m.source_table(), m.target_table()))
            .collect();
        assert_eq!(tables, vec![("legacy", "items"), ("items", "archive")]);
    }

    #[tokio::test]
    async fn test_run_all_result() {
        let schema = schema();
        let src = MemoryStore::from_schema(&schema);
        let dst = MemoryStore::from_schema(&schema);
        src.insert_row("items", Record::new().with("id", 1).with("name", "a"))
            .await
            .unwrap();

        let result = orchestrator(&schema, &src, &dst)
            .register("Item")
            .unwrap()
            .run_all()
            .await
            .unwrap();

        assert_eq!(result.status, "completed");
        assert_eq!(result.record_types_total, 1);
        assert_eq!(result.rows_saved, 1);
        assert_eq!(uuid::Uuid::parse_str(&result.run_id).unwrap().get_version_num(), 4);
        let json = result.to_json().unwrap();
        assert!(json.contains("\"commit_policy\": \"per_record_type\""));
    }

    #[tokio::test]
    async fn test_per_run_dry_run() {
        let schema = schema();
        let src = MemoryStore::from_schema(&schema);
        let dst = MemoryStore::from_schema(&schema);
        src.insert_row("items", Record::new().with("id", 1).with("name", "a"))
            .await
            .unwrap();

        let options = OrchestratorOptions {
            commit_policy: CommitPolicy::PerRun,
            sync: SyncOptions {
                mode: SyncMode::Upsert,
                dry_run: true,
                ..Default::default()
            },
        };
        let result = orchestrator(&schema, &src, &dst)
            .with_options(options)
            .register("Item")
            .unwrap()
            .run_all()
            .await
            .unwrap();

        assert_eq!(result.status, "dry_run");
        assert_eq!(result.rows_saved, 0);
        assert_eq!(result.results[0].inserted, 1);
        assert_eq!(dst.count("items").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_health_check_memory() {
        let schema = schema();
        let store = MemoryStore::from_schema(&schema);
        let result = orchestrator(&schema, &store, &store)
            .health_check()
            .await
            .unwrap();
        assert!(result.healthy);
        assert!(result.source_error.is_none());
    }
}
