//! Change tracking for one store context.
//!
//! A [`ChangeTracker`] is an identity map keyed by `(table, primary key)`.
//! Each entry carries an [`EntityState`] that decides what the next commit
//! writes. Entries attached as references are placeholders: they stand for
//! rows that already exist at the destination and are never written.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::core::{Record, RecordKey, RecordType};
use crate::error::{MigrateError, Result};
use crate::store::{Change, ChangeKind, ChangeSet};

/// Tracking state of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    /// Staged for insert.
    Added,
    /// Staged for update.
    Modified,
    /// Tracked, nothing to write.
    Unchanged,
    /// Not tracked.
    Detached,
}

/// One tracked instance.
#[derive(Debug, Clone)]
pub struct TrackedEntry {
    pub record_type: Arc<RecordType>,
    pub table: String,
    pub key: RecordKey,
    pub record: Record,
    /// Values as loaded from the store, for change detection and
    /// concurrency checks.
    pub original: Option<Record>,
    pub state: EntityState,
    /// Attached only because another record references it.
    pub placeholder: bool,
}

type EntryId = (String, RecordKey);

/// Identity map plus pending changes, in insertion order.
#[derive(Debug)]
pub struct ChangeTracker {
    entries: Vec<Option<TrackedEntry>>,
    index: HashMap<EntryId, usize>,
    auto_detect_changes: bool,
}

impl Default for ChangeTracker {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
            auto_detect_changes: true,
        }
    }
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn auto_detect_changes(&self) -> bool {
        self.auto_detect_changes
    }

    /// When enabled, [`pending_changes`](Self::pending_changes) first scans
    /// unchanged entries for in-place edits.
    pub fn set_auto_detect_changes(&mut self, enabled: bool) {
        self.auto_detect_changes = enabled;
    }

    /// Number of tracked entries.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn entry(&self, table: &str, key: &RecordKey) -> Option<&TrackedEntry> {
        self.index
            .get(&(table.to_string(), key.clone()))
            .and_then(|&i| self.entries[i].as_ref())
    }

    pub fn state(&self, table: &str, key: &RecordKey) -> EntityState {
        self.entry(table, key)
            .map_or(EntityState::Detached, |e| e.state)
    }

    /// Mutable access to a tracked record. Edits are picked up by change
    /// detection.
    pub fn record_mut(&mut self, table: &str, key: &RecordKey) -> Option<&mut Record> {
        let i = *self.index.get(&(table.to_string(), key.clone()))?;
        self.entries[i].as_mut().map(|e| &mut e.record)
    }

    /// Count entries in `state`, placeholders excluded.
    pub fn count(&self, state: EntityState) -> usize {
        self.entries
            .iter()
            .flatten()
            .filter(|e| e.state == state && !e.placeholder)
            .count()
    }

    /// Track a row loaded from the store as unchanged.
    ///
    /// Replaces a placeholder for the same key.
    pub fn attach(&mut self, record_type: Arc<RecordType>, table: &str, record: Record) -> Result<()> {
        let key = record_type.key_of(&record)?;
        self.ensure_replaceable(table, &key, "attach")?;
        self.insert(TrackedEntry {
            record_type,
            table: table.to_string(),
            key,
            original: Some(record.clone()),
            record,
            state: EntityState::Unchanged,
            placeholder: false,
        });
        Ok(())
    }

    /// Track a referenced record as already present. Returns `false` when
    /// the key is tracked already, in which case nothing changes.
    pub fn attach_reference(
        &mut self,
        record_type: Arc<RecordType>,
        table: &str,
        record: Record,
    ) -> Result<bool> {
        let key = record_type.key_of(&record)?;
        if self.state(table, &key) != EntityState::Detached {
            return Ok(false);
        }
        self.insert(TrackedEntry {
            record_type,
            table: table.to_string(),
            key,
            record,
            original: None,
            state: EntityState::Unchanged,
            placeholder: true,
        });
        Ok(true)
    }

    /// Stage an insert.
    pub fn add(&mut self, record_type: Arc<RecordType>, table: &str, record: Record) -> Result<()> {
        let key = record_type.key_of(&record)?;
        self.ensure_replaceable(table, &key, "add")?;
        self.insert(TrackedEntry {
            record_type,
            table: table.to_string(),
            key,
            record,
            original: None,
            state: EntityState::Added,
            placeholder: false,
        });
        Ok(())
    }

    /// Stage a full overwrite of an existing row.
    pub fn update(
        &mut self,
        record_type: Arc<RecordType>,
        table: &str,
        record: Record,
        original: Record,
    ) -> Result<()> {
        let key = record_type.key_of(&record)?;
        self.ensure_replaceable(table, &key, "update")?;
        self.insert(TrackedEntry {
            record_type,
            table: table.to_string(),
            key,
            record,
            original: Some(original),
            state: EntityState::Modified,
            placeholder: false,
        });
        Ok(())
    }

    /// Stop tracking an entry.
    pub fn detach(&mut self, table: &str, key: &RecordKey) -> Option<TrackedEntry> {
        let i = self.index.remove(&(table.to_string(), key.clone()))?;
        self.entries[i].take()
    }

    /// Promote unchanged entries whose values differ from their originals.
    pub fn detect_changes(&mut self) -> usize {
        let mut detected = 0;
        for entry in self.entries.iter_mut().flatten() {
            if entry.state != EntityState::Unchanged || entry.placeholder {
                continue;
            }
            let Some(original) = &entry.original else {
                continue;
            };
            if !entry.record.scalars_equal(original, &entry.record_type) {
                entry.state = EntityState::Modified;
                detected += 1;
            }
        }
        if detected > 0 {
            debug!("Detected {} modified entries", detected);
        }
        detected
    }

    /// Changes a commit would write, in the order they were staged.
    pub fn pending_changes(&mut self) -> ChangeSet {
        if self.auto_detect_changes {
            self.detect_changes();
        }

        let mut set = ChangeSet::new();
        for entry in self.entries.iter().flatten() {
            let kind = match entry.state {
                EntityState::Added => ChangeKind::Insert(entry.record.clone()),
                EntityState::Modified => ChangeKind::Update {
                    record: entry.record.clone(),
                    original: entry
                        .original
                        .clone()
                        .unwrap_or_else(|| entry.record.clone()),
                },
                EntityState::Unchanged | EntityState::Detached => continue,
            };
            set.push(Change {
                record_type: entry.record_type.clone(),
                table: entry.table.clone(),
                kind,
            });
        }
        set
    }

    /// Forget every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }

    fn ensure_replaceable(&self, table: &str, key: &RecordKey, op: &str) -> Result<()> {
        match self.entry(table, key) {
            Some(existing) if !existing.placeholder => Err(MigrateError::Tracking(format!(
                "cannot {} {} {}: another instance with the same key is already tracked ({:?})",
                op, existing.record_type.name, key, existing.state
            ))),
            _ => Ok(()),
        }
    }

    fn insert(&mut self, entry: TrackedEntry) {
        let id = (entry.table.clone(), entry.key.clone());
        if let Some(i) = self.index.remove(&id) {
            self.entries[i] = None;
        }
        self.index.insert(id, self.entries.len());
        self.entries.push(Some(entry));
    }
}
