//! Record synchronization engine.
//!
//! For one registered record type the engine loads every source record with
//! its references, looks each one up at the destination by primary key and
//! stages either an insert or a full overwrite. The staged batch is then
//! committed atomically.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::context::{DestinationContext, SourceContext};
use crate::core::{RecordType, Schema};
use crate::error::{ErrorKind, MigrateError, Result};
use crate::relation::{RelationResolver, DEFAULT_MAX_DEPTH};
use crate::tracking::EntityState;

/// Binds one record type to its source and destination tables.
#[derive(Debug, Clone)]
pub struct EntityMigrator {
    record_type: Arc<RecordType>,
    source_table: String,
    target_table: String,
}

impl EntityMigrator {
    /// Migrator reading and writing the record type's default table.
    pub fn new(record_type: Arc<RecordType>) -> Self {
        let table = record_type.table_name().to_string();
        Self {
            record_type,
            source_table: table.clone(),
            target_table: table,
        }
    }

    pub fn with_source_table(mut self, table: impl Into<String>) -> Self {
        self.source_table = table.into();
        self
    }

    pub fn with_target_table(mut self, table: impl Into<String>) -> Self {
        self.target_table = table.into();
        self
    }

    pub fn record_type(&self) -> &Arc<RecordType> {
        &self.record_type
    }

    pub fn name(&self) -> &str {
        &self.record_type.name
    }

    pub fn source_table(&self) -> &str {
        &self.source_table
    }

    pub fn target_table(&self) -> &str {
        &self.target_table
    }
}

/// How existing destination data is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Insert missing records, overwrite existing ones.
    #[default]
    Upsert,
    /// Skip the record type entirely if the destination table has any row.
    SkipIfPopulated,
}

impl std::str::FromStr for SyncMode {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "upsert" => Ok(SyncMode::Upsert),
            "skip_if_populated" => Ok(SyncMode::SkipIfPopulated),
            other => Err(MigrateError::Config(format!(
                "Invalid sync mode '{}'. Valid values: upsert, skip_if_populated",
                other
            ))),
        }
    }
}

/// Engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOptions {
    pub mode: SyncMode,
    pub max_relation_depth: usize,
    pub dry_run: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            mode: SyncMode::Upsert,
            max_relation_depth: DEFAULT_MAX_DEPTH,
            dry_run: false,
        }
    }
}

/// Outcome of synchronizing one record type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    /// Record type name.
    pub record_type: String,

    /// Distinct records loaded from the source.
    pub source_records: usize,

    /// Records staged as inserts.
    pub inserted: usize,

    /// Records staged as overwrites whose values differed.
    pub updated: usize,

    /// Records staged as overwrites whose values already matched.
    pub unchanged: usize,

    /// Rows affected by the commit (0 for dry runs and shared commits).
    pub saved: u64,

    /// The record type was skipped because the destination had data.
    pub skipped: bool,

    /// Staged changes were discarded instead of committed.
    pub dry_run: bool,

    /// Wall time in milliseconds.
    pub duration_ms: u64,
}

impl SyncResult {
    fn new(record_type: &str) -> Self {
        Self {
            record_type: record_type.to_string(),
            ..Default::default()
        }
    }

    /// Records staged for writing.
    pub fn staged(&self) -> usize {
        self.inserted + self.updated + self.unchanged
    }
}

/// Runs synchronization for registered record types.
pub struct SyncEngine<'a> {
    schema: &'a Schema,
    options: SyncOptions,
}

impl<'a> SyncEngine<'a> {
    pub fn new(schema: &'a Schema, options: SyncOptions) -> Self {
        Self { schema, options }
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// Stage, then commit (or discard on dry run) one record type.
    pub async fn synchronize(
        &self,
        source: &mut SourceContext<'_>,
        destination: &mut DestinationContext<'_>,
        migrator: &EntityMigrator,
    ) -> Result<SyncResult> {
        let start = Instant::now();
        info!("Migrating {}...", migrator.name());

        let mut result = match self.stage(source, destination, migrator).await {
            Ok(result) => result,
            Err(e) => {
                log_failure(migrator.name(), &e);
                destination.discard();
                return Err(e);
            }
        };

        if !result.skipped {
            if self.options.dry_run {
                let discarded = destination.discard();
                info!(
                    "Dry run: discarded {} staged change(s) for {}",
                    discarded,
                    migrator.name()
                );
                result.dry_run = true;
            } else {
                result.saved = self.commit(destination, migrator.name()).await?;
            }
        }

        result.duration_ms = start.elapsed().as_millis() as u64;
        Ok(result)
    }

    /// Commit everything staged in `destination`, logging the outcome under
    /// `label`.
    pub async fn commit(&self, destination: &mut DestinationContext<'_>, label: &str) -> Result<u64> {
        let start = Instant::now();
        match destination.commit().await {
            Ok(saved) => {
                info!(
                    "Saved {} items in {} ms",
                    saved,
                    start.elapsed().as_millis()
                );
                Ok(saved)
            }
            Err(e) => {
                log_failure(label, &e);
                Err(e)
            }
        }
    }

    /// Load and stage one record type without committing.
    ///
    /// Automatic change detection is switched off on both contexts for the
    /// duration of the call and restored afterwards.
    pub async fn stage(
        &self,
        source: &mut SourceContext<'_>,
        destination: &mut DestinationContext<'_>,
        migrator: &EntityMigrator,
    ) -> Result<SyncResult> {
        let source_auto = source.auto_detect_changes();
        let destination_auto = destination.auto_detect_changes();
        source.set_auto_detect_changes(false);
        destination.set_auto_detect_changes(false);

        let result = self.stage_records(source, destination, migrator).await;

        source.set_auto_detect_changes(source_auto);
        destination.set_auto_detect_changes(destination_auto);
        result
    }

    async fn stage_records(
        &self,
        source: &mut SourceContext<'_>,
        destination: &mut DestinationContext<'_>,
        migrator: &EntityMigrator,
    ) -> Result<SyncResult> {
        let start = Instant::now();
        let rt = migrator.record_type();
        let table = migrator.target_table();
        let mut result = SyncResult::new(&rt.name);

        if self.options.mode == SyncMode::SkipIfPopulated && destination.any(table).await? {
            info!("{} already contains data, skipping {}", table, rt.name);
            result.skipped = true;
            result.duration_ms = start.elapsed().as_millis() as u64;
            return Ok(result);
        }

        let resolver = RelationResolver::new(self.schema, self.options.max_relation_depth);
        let plan = resolver.plan(rt)?;
        let records = source
            .load(&resolver, rt, migrator.source_table(), &plan)
            .await?;
        result.source_records = records.len();

        let targets: Vec<&RecordType> = rt
            .references
            .iter()
            .filter_map(|r| self.schema.get(&r.target).ok().map(|t| &**t))
            .collect();

        for record in records {
            let key = rt.key_of(&record)?;
            match destination.find(rt, table, &key).await? {
                None => {
                    let staged = record.normalized(rt);
                    destination.add(rt.clone(), table, staged)?;
                    resolver.attach_references(destination, rt, &record)?;
                    result.inserted += 1;
                }
                Some(existing) => {
                    let was_added = destination.state(table, &key) == EntityState::Added;
                    let original = destination
                        .tracker()
                        .entry(table, &key)
                        .and_then(|e| e.original.clone())
                        .unwrap_or_else(|| existing.clone());
                    let merged = existing.overwritten_by(&record, rt, &targets);
                    let unchanged = merged.scalars_equal(&original, rt);

                    destination.detach(table, &key);
                    if was_added {
                        destination.add(rt.clone(), table, merged)?;
                    } else {
                        destination.update(rt.clone(), table, merged, original)?;
                    }
                    resolver.attach_references(destination, rt, &record)?;

                    if unchanged {
                        result.unchanged += 1;
                    } else {
                        result.updated += 1;
                    }
                }
            }
        }

        info!(
            "{}: {} loaded, {} to insert, {} to update, {} unchanged",
            rt.name, result.source_records, result.inserted, result.updated, result.unchanged
        );
        result.duration_ms = start.elapsed().as_millis() as u64;
        Ok(result)
    }
}

pub(crate) fn log_failure(label: &str, e: &MigrateError) {
    match e.kind() {
        ErrorKind::Conflict => error!("Concurrency error while saving {}: {}", label, e),
        ErrorKind::StoreUpdate => error!("Database update error while saving {}: {}", label, e),
        ErrorKind::Configuration | ErrorKind::Unexpected => {
            error!("Unexpected error while saving {}: {}", label, e)
        }
    }
}
