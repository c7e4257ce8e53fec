//! Store adapter traits and the change set handed to a destination commit.
//!
//! - [`SourceStore`]: reads record sets and batched key lookups
//! - [`DestinationStore`]: key lookups and atomic application of a [`ChangeSet`]
//!
//! [`memory::MemoryStore`] implements both and is what the test suite runs
//! against. Database-backed implementations live in [`crate::drivers`].

pub mod memory;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::core::{Record, RecordKey, RecordType, ReferenceKind};
use crate::error::Result;

/// Read side of a migration.
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Read every row of `table` as records of `record_type`.
    async fn fetch_all(&self, record_type: &RecordType, table: &str) -> Result<Vec<Record>>;

    /// Read rows of `table` whose `columns` tuple is one of `keys`.
    async fn fetch_where_in(
        &self,
        record_type: &RecordType,
        table: &str,
        columns: &[String],
        keys: &[RecordKey],
    ) -> Result<Vec<Record>>;

    /// Round-trip check used by health checks.
    async fn ping(&self) -> Result<()>;

    /// Get the store type.
    fn store_type(&self) -> &str;

    /// Close all connections.
    async fn close(&self);
}

/// Write side of a migration.
#[async_trait]
pub trait DestinationStore: Send + Sync {
    /// Look up one row by primary key.
    async fn find(
        &self,
        record_type: &RecordType,
        table: &str,
        key: &RecordKey,
    ) -> Result<Option<Record>>;

    /// Whether `table` holds any row.
    async fn any(&self, table: &str) -> Result<bool>;

    /// Apply all changes atomically, returning the number of affected rows.
    ///
    /// Either every change is persisted or none is.
    async fn apply(&self, changes: ChangeSet) -> Result<u64>;

    /// Round-trip check used by health checks.
    async fn ping(&self) -> Result<()>;

    /// Get the store type.
    fn store_type(&self) -> &str;

    /// Close all connections.
    async fn close(&self);
}

/// What a staged change does.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeKind {
    /// New row.
    Insert(Record),
    /// Full overwrite of an existing row. `original` holds the values loaded
    /// from the store and is used for concurrency checks.
    Update { record: Record, original: Record },
}

/// A single staged change.
#[derive(Debug, Clone)]
pub struct Change {
    pub record_type: Arc<RecordType>,
    pub table: String,
    pub kind: ChangeKind,
}

impl Change {
    /// The record that will be written.
    pub fn record(&self) -> &Record {
        match &self.kind {
            ChangeKind::Insert(record) => record,
            ChangeKind::Update { record, .. } => record,
        }
    }

    pub fn is_insert(&self) -> bool {
        matches!(self.kind, ChangeKind::Insert(_))
    }
}

/// Ordered batch of changes for one commit.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    changes: Vec<Change>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, change: Change) {
        self.changes.push(change);
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Change> {
        self.changes.iter()
    }

    pub fn inserts(&self) -> usize {
        self.changes.iter().filter(|c| c.is_insert()).count()
    }

    pub fn updates(&self) -> usize {
        self.changes.len() - self.inserts()
    }

    /// Changes ordered so that referenced record types are written before
    /// the types referring to them. Within a self-referencing type a parent
    /// row is written before the rows pointing at it; otherwise order within
    /// a type is preserved.
    pub fn into_dependency_order(self) -> Vec<Change> {
        let mut types: HashMap<String, Arc<RecordType>> = HashMap::new();
        for change in &self.changes {
            types
                .entry(change.record_type.name.clone())
                .or_insert_with(|| change.record_type.clone());
        }

        let mut ranks: HashMap<String, usize> = HashMap::new();
        for name in types.keys() {
            let mut path = Vec::new();
            dependency_rank(name, &types, &mut ranks, &mut path);
        }

        let mut changes = self.changes;
        changes.sort_by_key(|c| ranks.get(&c.record_type.name).copied().unwrap_or(0));
        for rt in types.values() {
            order_self_references(&mut changes, rt);
        }
        changes
    }
}

impl IntoIterator for ChangeSet {
    type Item = Change;
    type IntoIter = std::vec::IntoIter<Change>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.into_iter()
    }
}

/// Longest chain of `one` references among the types in the change set.
fn dependency_rank(
    name: &str,
    types: &HashMap<String, Arc<RecordType>>,
    ranks: &mut HashMap<String, usize>,
    path: &mut Vec<String>,
) -> usize {
    if let Some(rank) = ranks.get(name) {
        return *rank;
    }
    if path.iter().any(|p| p == name) {
        return 0;
    }
    let Some(rt) = types.get(name) else {
        return 0;
    };

    path.push(name.to_string());
    let mut rank = 0;
    for reference in rt.references.iter().filter(|r| r.kind == ReferenceKind::One) {
        if reference.target == name || !types.contains_key(&reference.target) {
            continue;
        }
        rank = rank.max(dependency_rank(&reference.target, types, ranks, path) + 1);
    }
    path.pop();

    ranks.insert(name.to_string(), rank);
    rank
}

/// Reorder the changes of `rt` in place so every row follows the row its
/// self-references point at, when that row is part of the same batch. The
/// slots occupied by `rt` stay the same. A cycle is broken at the row the
/// walk enters it from.
fn order_self_references(changes: &mut [Change], rt: &RecordType) {
    let self_refs: Vec<&[String]> = rt
        .references
        .iter()
        .filter(|r| r.kind == ReferenceKind::One && r.target == rt.name)
        .map(|r| r.columns.as_slice())
        .collect();
    if self_refs.is_empty() {
        return;
    }

    let slots: Vec<usize> = changes
        .iter()
        .enumerate()
        .filter(|(_, c)| c.record_type.name == rt.name)
        .map(|(i, _)| i)
        .collect();
    if slots.len() < 2 {
        return;
    }

    let mut by_key: HashMap<RecordKey, usize> = HashMap::new();
    for (pos, &slot) in slots.iter().enumerate() {
        if let Ok(key) = rt.key_of(changes[slot].record()) {
            by_key.entry(key).or_insert(pos);
        }
    }
    let parents: Vec<Vec<usize>> = slots
        .iter()
        .enumerate()
        .map(|(pos, &slot)| {
            let record = changes[slot].record();
            self_refs
                .iter()
                .filter_map(|columns| record.key_tuple(columns))
                .filter_map(|key| by_key.get(&key).copied())
                .filter(|&parent| parent != pos)
                .collect()
        })
        .collect();

    let order = parents_first(&parents);

    let mut taken: Vec<Option<Change>> = slots
        .iter()
        .map(|&slot| Some(changes[slot].clone()))
        .collect();
    for (&slot, pos) in slots.iter().zip(order) {
        if let Some(change) = taken[pos].take() {
            changes[slot] = change;
        }
    }
}

/// Depth-first post-order over `parents`, iterative so long parent chains
/// cannot exhaust the stack. Edges back into an unfinished node are ignored.
fn parents_first(parents: &[Vec<usize>]) -> Vec<usize> {
    let mut order = Vec::with_capacity(parents.len());
    let mut entered = vec![false; parents.len()];
    let mut stack: Vec<(usize, usize)> = Vec::new();

    for root in 0..parents.len() {
        if entered[root] {
            continue;
        }
        entered[root] = true;
        stack.push((root, 0));
        while let Some((node, next)) = stack.pop() {
            match parents[node].get(next) {
                Some(&parent) => {
                    stack.push((node, next + 1));
                    if !entered[parent] {
                        entered[parent] = true;
                        stack.push((parent, 0));
                    }
                }
                None => order.push(node),
            }
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ScalarType, SqlValue};

    fn change(rt: &Arc<RecordType>, id: i32) -> Change {
        Change {
            record_type: rt.clone(),
            table: rt.table_name().to_string(),
            kind: ChangeKind::Insert(Record::new().with("id", id)),
        }
    }

    #[test]
    fn test_dependency_order_puts_referenced_types_first() {
        let book = Arc::new(
            RecordType::new("Book")
                .with_field("id", ScalarType::I32)
                .with_primary_key(&["id"]),
        );
        let rental = Arc::new(
            RecordType::new("Rental")
                .with_field("id", ScalarType::I32)
                .with_field("book_id", ScalarType::I32)
                .with_primary_key(&["id"])
                .with_reference("book", "Book", ReferenceKind::One, &["book_id"]),
        );

        let mut set = ChangeSet::new();
        set.push(change(&rental, 10));
        set.push(change(&book, 1));
        set.push(change(&rental, 11));

        let ordered = set.into_dependency_order();
        let names: Vec<_> = ordered.iter().map(|c| c.record_type.name.as_str()).collect();
        assert_eq!(names, vec!["Book", "Rental", "Rental"]);
        assert_eq!(ordered[1].record().get("id"), Some(&SqlValue::I32(10)));
    }

    #[test]
    fn test_dependency_order_survives_cycles() {
        let a = Arc::new(
            RecordType::new("A")
                .with_field("id", ScalarType::I32)
                .with_field("b_id", ScalarType::I32)
                .with_primary_key(&["id"])
                .with_reference("b", "B", ReferenceKind::One, &["b_id"]),
        );
        let b = Arc::new(
            RecordType::new("B")
                .with_field("id", ScalarType::I32)
                .with_field("a_id", ScalarType::I32)
                .with_primary_key(&["id"])
                .with_reference("a", "A", ReferenceKind::One, &["a_id"]),
        );
        let mut set = ChangeSet::new();
        set.push(change(&a, 1));
        set.push(change(&b, 2));
        assert_eq!(set.into_dependency_order().len(), 2);
    }

    fn category() -> Arc<RecordType> {
        Arc::new(
            RecordType::new("Category")
                .with_field("id", ScalarType::I32)
                .with_nullable_field("parent_id", ScalarType::I32)
                .with_primary_key(&["id"])
                .with_reference("parent", "Category", ReferenceKind::One, &["parent_id"]),
        )
    }

    fn category_insert(rt: &Arc<RecordType>, id: i32, parent: Option<i32>) -> Change {
        let mut record = Record::new().with("id", id);
        if let Some(parent) = parent {
            record.set("parent_id", parent);
        }
        Change {
            record_type: rt.clone(),
            table: rt.table_name().to_string(),
            kind: ChangeKind::Insert(record),
        }
    }

    fn ids(changes: &[Change]) -> Vec<Option<SqlValue>> {
        changes.iter().map(|c| c.record().get("id").cloned()).collect()
    }

    #[test]
    fn test_dependency_order_puts_parent_row_before_child() {
        let rt = category();
        let mut set = ChangeSet::new();
        set.push(category_insert(&rt, 1, Some(5)));
        set.push(category_insert(&rt, 5, None));

        let ordered = set.into_dependency_order();
        assert_eq!(
            ids(&ordered),
            vec![Some(SqlValue::I32(5)), Some(SqlValue::I32(1))]
        );
    }

    #[test]
    fn test_dependency_order_follows_self_reference_chains() {
        let rt = category();
        let item = Arc::new(
            RecordType::new("Item")
                .with_field("id", ScalarType::I32)
                .with_primary_key(&["id"]),
        );
        let mut set = ChangeSet::new();
        set.push(category_insert(&rt, 1, Some(2)));
        set.push(change(&item, 100));
        set.push(category_insert(&rt, 2, Some(3)));
        set.push(category_insert(&rt, 3, None));
        set.push(category_insert(&rt, 4, Some(99)));

        let ordered = set.into_dependency_order();
        assert_eq!(
            ids(&ordered),
            vec![
                Some(SqlValue::I32(3)),
                Some(SqlValue::I32(100)),
                Some(SqlValue::I32(2)),
                Some(SqlValue::I32(1)),
                Some(SqlValue::I32(4)),
            ]
        );
    }

    #[test]
    fn test_dependency_order_keeps_self_reference_cycles() {
        let rt = category();
        let mut set = ChangeSet::new();
        set.push(category_insert(&rt, 1, Some(2)));
        set.push(category_insert(&rt, 2, Some(1)));
        assert_eq!(set.into_dependency_order().len(), 2);
    }

    #[test]
    fn test_counts() {
        let rt = Arc::new(
            RecordType::new("Book")
                .with_field("id", ScalarType::I32)
                .with_primary_key(&["id"]),
        );
        let mut set = ChangeSet::new();
        set.push(change(&rt, 1));
        set.push(Change {
            record_type: rt.clone(),
            table: "Book".into(),
            kind: ChangeKind::Update {
                record: Record::new().with("id", 2),
                original: Record::new().with("id", 2),
            },
        });
        assert_eq!(set.inserts(), 1);
        assert_eq!(set.updates(), 1);
    }
}
