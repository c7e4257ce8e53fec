//! Store contexts.
//!
//! A context pairs a store adapter with the [`ChangeTracker`] it exclusively
//! owns. Contexts live for one migration run and borrow the run's stores.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::core::{Record, RecordKey, RecordType};
use crate::error::Result;
use crate::relation::{IncludePlan, RelationResolver};
use crate::store::{DestinationStore, SourceStore};
use crate::tracking::{ChangeTracker, EntityState};

/// Read context over a [`SourceStore`].
pub struct SourceContext<'a> {
    store: &'a dyn SourceStore,
    tracker: ChangeTracker,
}

impl<'a> SourceContext<'a> {
    pub fn new(store: &'a dyn SourceStore) -> Self {
        Self {
            store,
            tracker: ChangeTracker::new(),
        }
    }

    pub fn store(&self) -> &'a dyn SourceStore {
        self.store
    }

    pub fn auto_detect_changes(&self) -> bool {
        self.tracker.auto_detect_changes()
    }

    pub fn set_auto_detect_changes(&mut self, enabled: bool) {
        self.tracker.set_auto_detect_changes(enabled);
    }

    /// Load all records of `table` with the plan's references materialized.
    ///
    /// Loading resolves identity: rows sharing a primary key collapse into
    /// the first one read. Tracked state from a previous load is dropped.
    pub async fn load(
        &mut self,
        resolver: &RelationResolver<'_>,
        record_type: &Arc<RecordType>,
        table: &str,
        plan: &IncludePlan,
    ) -> Result<Vec<Record>> {
        self.tracker.clear();

        let loaded = resolver.load(self.store, record_type, table, plan).await?;
        let total = loaded.len();
        let mut records = Vec::with_capacity(total);
        for record in loaded {
            let key = record_type.key_of(&record)?;
            if self.tracker.state(table, &key) != EntityState::Detached {
                warn!(
                    "Duplicate {} key {} in source table {}; keeping the first row",
                    record_type.name, key, table
                );
                continue;
            }
            self.tracker.attach(record_type.clone(), table, record.scalars())?;
            records.push(record);
        }

        debug!(
            "Loaded {} {} record(s) from {} ({} distinct)",
            total,
            record_type.name,
            table,
            records.len()
        );
        Ok(records)
    }
}

/// Change-tracking context over a [`DestinationStore`].
pub struct DestinationContext<'a> {
    store: &'a dyn DestinationStore,
    tracker: ChangeTracker,
}

impl<'a> DestinationContext<'a> {
    pub fn new(store: &'a dyn DestinationStore) -> Self {
        Self {
            store,
            tracker: ChangeTracker::new(),
        }
    }

    pub fn store(&self) -> &'a dyn DestinationStore {
        self.store
    }

    pub fn tracker(&self) -> &ChangeTracker {
        &self.tracker
    }

    pub fn auto_detect_changes(&self) -> bool {
        self.tracker.auto_detect_changes()
    }

    pub fn set_auto_detect_changes(&mut self, enabled: bool) {
        self.tracker.set_auto_detect_changes(enabled);
    }

    pub fn state(&self, table: &str, key: &RecordKey) -> EntityState {
        self.tracker.state(table, key)
    }

    /// Find a row by key.
    ///
    /// Tracked instances are returned first. Reference placeholders do not
    /// count as found; the store decides. A row loaded from the store is
    /// tracked as unchanged.
    pub async fn find(
        &mut self,
        record_type: &Arc<RecordType>,
        table: &str,
        key: &RecordKey,
    ) -> Result<Option<Record>> {
        if let Some(entry) = self.tracker.entry(table, key) {
            if !entry.placeholder {
                return Ok(Some(entry.record.clone()));
            }
        }

        let found = self.store.find(record_type, table, key).await?;
        if let Some(record) = &found {
            if let Some(placeholder) = self.tracker.detach(table, key) {
                debug!("Replacing reference placeholder {} {}", placeholder.record_type.name, key);
            }
            self.tracker.attach(record_type.clone(), table, record.clone())?;
        }
        Ok(found)
    }

    pub async fn any(&self, table: &str) -> Result<bool> {
        self.store.any(table).await
    }

    /// Stage an insert.
    pub fn add(&mut self, record_type: Arc<RecordType>, table: &str, record: Record) -> Result<()> {
        self.tracker.add(record_type, table, record)
    }

    /// Stage a full overwrite.
    pub fn update(
        &mut self,
        record_type: Arc<RecordType>,
        table: &str,
        record: Record,
        original: Record,
    ) -> Result<()> {
        self.tracker.update(record_type, table, record, original)
    }

    /// Stop tracking the instance for `key`, if any.
    pub fn detach(&mut self, table: &str, key: &RecordKey) -> bool {
        self.tracker.detach(table, key).is_some()
    }

    /// Mark a referenced record as already present.
    pub fn attach_reference(
        &mut self,
        record_type: Arc<RecordType>,
        table: &str,
        record: Record,
    ) -> Result<bool> {
        self.tracker.attach_reference(record_type, table, record)
    }

    /// Number of entries a commit would write.
    pub fn pending(&self) -> usize {
        self.tracker.count(EntityState::Added) + self.tracker.count(EntityState::Modified)
    }

    /// Persist staged changes atomically and return the affected row count.
    ///
    /// Tracked state is cleared whether or not the store accepts the batch.
    pub async fn commit(&mut self) -> Result<u64> {
        let changes = self.tracker.pending_changes();
        if changes.is_empty() {
            self.tracker.clear();
            return Ok(0);
        }

        debug!(
            "Committing {} insert(s), {} update(s) to {}",
            changes.inserts(),
            changes.updates(),
            self.store.store_type()
        );
        let result = self.store.apply(changes).await;
        self.tracker.clear();
        result
    }

    /// Drop staged changes without writing. Returns how many were pending.
    pub fn discard(&mut self) -> usize {
        let pending = self.pending();
        self.tracker.clear();
        pending
    }
}
