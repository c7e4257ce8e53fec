//! In-memory relational store.
//!
//! Tables are built from a [`Schema`]: one table per record type, keyed by
//! primary key, with the foreign keys the schema implies. Commits are applied
//! to a copy of the database and swapped in only when every change and every
//! constraint check succeeds. Clones share the same database, so a test can
//! hand one clone to an orchestrator and keep another for assertions.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::core::{ForeignKey, Record, RecordKey, RecordType, Schema};
use crate::error::{MigrateError, Result};

use super::{ChangeKind, ChangeSet, DestinationStore, SourceStore};

#[derive(Debug, Clone)]
struct TableFk {
    name: String,
    columns: Vec<String>,
    ref_table: String,
}

#[derive(Debug, Clone)]
struct MemoryTable {
    record_type: Arc<RecordType>,
    rows: BTreeMap<RecordKey, Record>,
    foreign_keys: Vec<TableFk>,
}

#[derive(Debug, Clone, Default)]
struct MemoryDb {
    tables: BTreeMap<String, MemoryTable>,
}

impl MemoryDb {
    fn table(&self, name: &str) -> Result<&MemoryTable> {
        self.tables
            .get(name)
            .ok_or_else(|| MigrateError::store(name, "table does not exist"))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut MemoryTable> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| MigrateError::store(name, "table does not exist"))
    }

    fn check_not_null(table: &str, rt: &RecordType, record: &Record) -> Result<()> {
        for field in rt.fields.iter().filter(|f| !f.nullable) {
            if record.get(&field.name).map_or(true, |v| v.is_null()) {
                return Err(MigrateError::constraint(
                    table,
                    format!("NOT NULL violation on column '{}'", field.name),
                ));
            }
        }
        Ok(())
    }

    fn check_foreign_keys(&self, table: &str, key: &RecordKey) -> Result<()> {
        let t = self.table(table)?;
        let Some(row) = t.rows.get(key) else {
            return Ok(());
        };
        for fk in &t.foreign_keys {
            let Some(fk_key) = row.key_tuple(&fk.columns) else {
                continue;
            };
            let present = self
                .tables
                .get(&fk.ref_table)
                .map_or(false, |r| r.rows.contains_key(&fk_key));
            if !present {
                return Err(MigrateError::constraint(
                    table,
                    format!(
                        "{}: row {} references missing {} row {}",
                        fk.name, key, fk.ref_table, fk_key
                    ),
                ));
            }
        }
        Ok(())
    }
}

/// Shared in-memory database implementing both store traits.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<MemoryDb>>,
    immediate_foreign_keys: bool,
}

impl MemoryStore {
    /// Empty store with no tables.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store with one table per record type of `schema`, named by
    /// [`RecordType::table_name`], carrying the schema's foreign keys.
    pub fn from_schema(schema: &Schema) -> Self {
        let mut db = MemoryDb::default();
        for rt in schema.record_types() {
            db.tables.insert(
                rt.table_name().to_string(),
                MemoryTable {
                    record_type: rt.clone(),
                    rows: BTreeMap::new(),
                    foreign_keys: Vec::new(),
                },
            );
        }

        for fk in schema.foreign_keys() {
            attach_fk(&mut db, schema, &fk);
        }

        Self {
            inner: Arc::new(RwLock::new(db)),
            immediate_foreign_keys: false,
        }
    }

    /// Check foreign keys after every change of a commit, in apply order,
    /// instead of once at the end. A child written before its parent in the
    /// same commit is then rejected, as a database with non-deferrable
    /// constraints would.
    pub fn with_immediate_foreign_keys(mut self) -> Self {
        self.immediate_foreign_keys = true;
        self
    }

    /// Add (or replace) a table for `record_type` without foreign keys.
    pub async fn create_table(&self, record_type: Arc<RecordType>, table: &str) {
        let mut db = self.inner.write().await;
        db.tables.insert(
            table.to_string(),
            MemoryTable {
                record_type,
                rows: BTreeMap::new(),
                foreign_keys: Vec::new(),
            },
        );
    }

    /// Insert a row directly, enforcing the same constraints as a commit.
    pub async fn insert_row(&self, table: &str, record: Record) -> Result<()> {
        let mut db = self.inner.write().await;
        let t = db.table_mut(table)?;
        let rt = t.record_type.clone();
        let row = record.normalized(&rt).scalars();
        MemoryDb::check_not_null(table, &rt, &row)?;
        let key = rt.key_of(&row)?;
        if t.rows.contains_key(&key) {
            return Err(MigrateError::constraint(
                table,
                format!("duplicate primary key {}", key),
            ));
        }
        t.rows.insert(key.clone(), row);
        if let Err(e) = db.check_foreign_keys(table, &key) {
            db.table_mut(table)?.rows.remove(&key);
            return Err(e);
        }
        Ok(())
    }

    /// All rows of `table` in key order.
    pub async fn rows(&self, table: &str) -> Result<Vec<Record>> {
        let db = self.inner.read().await;
        Ok(db.table(table)?.rows.values().cloned().collect())
    }

    /// One row by key.
    pub async fn row(&self, table: &str, key: &RecordKey) -> Result<Option<Record>> {
        let db = self.inner.read().await;
        Ok(db.table(table)?.rows.get(key).cloned())
    }

    /// Number of rows in `table`.
    pub async fn count(&self, table: &str) -> Result<usize> {
        let db = self.inner.read().await;
        Ok(db.table(table)?.rows.len())
    }

    /// Remove a row, returning whether it existed.
    pub async fn delete_row(&self, table: &str, key: &RecordKey) -> Result<bool> {
        let mut db = self.inner.write().await;
        Ok(db.table_mut(table)?.rows.remove(key).is_some())
    }

    /// Overwrite one column of a stored row, bypassing constraints.
    pub async fn set_value(
        &self,
        table: &str,
        key: &RecordKey,
        field: &str,
        value: impl Into<crate::core::SqlValue>,
    ) -> Result<bool> {
        let mut db = self.inner.write().await;
        match db.table_mut(table)?.rows.get_mut(key) {
            Some(row) => {
                row.set(field, value);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

fn attach_fk(db: &mut MemoryDb, schema: &Schema, fk: &ForeignKey) {
    let (Ok(holder), Ok(referenced)) = (
        schema.get(&fk.record_type),
        schema.get(&fk.ref_record_type),
    ) else {
        return;
    };
    let ref_table = referenced.table_name().to_string();
    if let Some(t) = db.tables.get_mut(holder.table_name()) {
        t.foreign_keys.push(TableFk {
            name: fk.name.clone(),
            columns: fk.columns.clone(),
            ref_table,
        });
    }
}

#[async_trait]
impl SourceStore for MemoryStore {
    async fn fetch_all(&self, record_type: &RecordType, table: &str) -> Result<Vec<Record>> {
        let db = self.inner.read().await;
        let rows: Vec<Record> = db
            .table(table)?
            .rows
            .values()
            .map(|r| r.normalized(record_type).scalars())
            .collect();
        debug!("Fetched {} rows from {}", rows.len(), table);
        Ok(rows)
    }

    async fn fetch_where_in(
        &self,
        record_type: &RecordType,
        table: &str,
        columns: &[String],
        keys: &[RecordKey],
    ) -> Result<Vec<Record>> {
        let wanted: std::collections::HashSet<&RecordKey> = keys.iter().collect();
        let db = self.inner.read().await;
        Ok(db
            .table(table)?
            .rows
            .values()
            .filter(|r| r.key_tuple(columns).map_or(false, |k| wanted.contains(&k)))
            .map(|r| r.normalized(record_type).scalars())
            .collect())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn store_type(&self) -> &str {
        "memory"
    }

    async fn close(&self) {}
}

#[async_trait]
impl DestinationStore for MemoryStore {
    async fn find(
        &self,
        record_type: &RecordType,
        table: &str,
        key: &RecordKey,
    ) -> Result<Option<Record>> {
        let db = self.inner.read().await;
        Ok(db
            .table(table)?
            .rows
            .get(key)
            .map(|r| r.normalized(record_type).scalars()))
    }

    async fn any(&self, table: &str) -> Result<bool> {
        let db = self.inner.read().await;
        Ok(!db.table(table)?.rows.is_empty())
    }

    async fn apply(&self, changes: ChangeSet) -> Result<u64> {
        let mut db = self.inner.write().await;
        let mut staged = db.clone();
        let mut touched = Vec::with_capacity(changes.len());
        let mut affected = 0u64;

        for change in changes.into_dependency_order() {
            let rt = change.record_type.clone();
            let table = change.table.clone();
            let t = staged.table_mut(&table)?;

            match change.kind {
                ChangeKind::Insert(record) => {
                    let row = record.normalized(&rt).scalars();
                    MemoryDb::check_not_null(&table, &rt, &row)?;
                    let key = rt.key_of(&row)?;
                    if t.rows.contains_key(&key) {
                        return Err(MigrateError::constraint(
                            &table,
                            format!("duplicate primary key {}", key),
                        ));
                    }
                    t.rows.insert(key.clone(), row);
                    if self.immediate_foreign_keys {
                        staged.check_foreign_keys(&table, &key)?;
                    }
                    touched.push((table, key));
                }
                ChangeKind::Update { record, original } => {
                    let row = record.normalized(&rt).scalars();
                    MemoryDb::check_not_null(&table, &rt, &row)?;
                    let key = rt.key_of(&row)?;
                    let current = t.rows.get(&key).ok_or_else(|| {
                        MigrateError::conflict(
                            &table,
                            format!("row {} was deleted after it was loaded", key),
                        )
                    })?;
                    for token in rt.concurrency_tokens() {
                        if current.get(&token.name) != original.get(&token.name) {
                            return Err(MigrateError::conflict(
                                &table,
                                format!(
                                    "row {} changed after it was loaded ({} differs)",
                                    key, token.name
                                ),
                            ));
                        }
                    }
                    t.rows.insert(key.clone(), row);
                    if self.immediate_foreign_keys {
                        staged.check_foreign_keys(&table, &key)?;
                    }
                    touched.push((table, key));
                }
            }
            affected += 1;
        }

        for (table, key) in &touched {
            staged.check_foreign_keys(table, key)?;
        }

        *db = staged;
        debug!("Applied {} changes", affected);
        Ok(affected)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn store_type(&self) -> &str {
        "memory"
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ReferenceKind, ScalarType, SqlValue};
    use crate::store::Change;

    fn schema() -> Schema {
        Schema::new(vec![
            RecordType::new("Book")
                .with_table("books")
                .with_field("id", ScalarType::I32)
                .with_field("title", ScalarType::Text)
                .with_concurrency_token("version", ScalarType::I64)
                .with_primary_key(&["id"]),
            RecordType::new("Rental")
                .with_table("rentals")
                .with_field("id", ScalarType::I32)
                .with_field("book_id", ScalarType::I32)
                .with_primary_key(&["id"])
                .with_reference("book", "Book", ReferenceKind::One, &["book_id"]),
        ])
        .unwrap()
    }

    fn book(id: i32, title: &str) -> Record {
        Record::new()
            .with("id", id)
            .with("title", title)
            .with("version", 1i64)
    }

    fn insert(schema: &Schema, name: &str, record: Record) -> Change {
        let rt = schema.get(name).unwrap().clone();
        Change {
            table: rt.table_name().to_string(),
            record_type: rt,
            kind: ChangeKind::Insert(record),
        }
    }

    #[tokio::test]
    async fn test_insert_and_find() {
        let schema = schema();
        let store = MemoryStore::from_schema(&schema);
        let mut set = ChangeSet::new();
        set.push(insert(&schema, "Book", book(1, "Dune")));
        assert_eq!(store.apply(set).await.unwrap(), 1);

        let rt = schema.get("Book").unwrap();
        let found = store.find(rt, "books", &RecordKey::from(1)).await.unwrap();
        assert_eq!(found.unwrap().get("title"), Some(&SqlValue::from("Dune")));
        assert!(store.any("books").await.unwrap());
        assert!(!store.any("rentals").await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_key_is_constraint_error() {
        let schema = schema();
        let store = MemoryStore::from_schema(&schema);
        store.insert_row("books", book(1, "Dune")).await.unwrap();

        let mut set = ChangeSet::new();
        set.push(insert(&schema, "Book", book(1, "Dune again")));
        let err = store.apply(set).await.unwrap_err();
        assert!(matches!(err, MigrateError::Constraint { .. }));
    }

    #[tokio::test]
    async fn test_missing_fk_target_rolls_back_whole_commit() {
        let schema = schema();
        let store = MemoryStore::from_schema(&schema);

        let mut set = ChangeSet::new();
        set.push(insert(&schema, "Book", book(1, "Dune")));
        set.push(insert(
            &schema,
            "Rental",
            Record::new().with("id", 10).with("book_id", 99),
        ));
        let err = store.apply(set).await.unwrap_err();
        assert!(matches!(err, MigrateError::Constraint { ref table, .. } if table == "rentals"));
        assert_eq!(store.count("books").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_child_before_parent_in_one_commit() {
        let schema = schema();
        let store = MemoryStore::from_schema(&schema);

        let mut set = ChangeSet::new();
        set.push(insert(
            &schema,
            "Rental",
            Record::new().with("id", 10).with("book_id", 1),
        ));
        set.push(insert(&schema, "Book", book(1, "Dune")));
        assert_eq!(store.apply(set).await.unwrap(), 2);
    }

    fn category_schema() -> Schema {
        Schema::new(vec![RecordType::new("Category")
            .with_table("categories")
            .with_field("id", ScalarType::I32)
            .with_nullable_field("parent_id", ScalarType::I32)
            .with_primary_key(&["id"])
            .with_reference("parent", "Category", ReferenceKind::One, &["parent_id"])])
        .unwrap()
    }

    fn category(id: i32, parent: Option<i32>) -> Record {
        let mut record = Record::new().with("id", id);
        if let Some(parent) = parent {
            record.set("parent_id", parent);
        }
        record
    }

    #[tokio::test]
    async fn test_immediate_fks_accept_child_staged_before_parent() {
        let schema = category_schema();
        let store = MemoryStore::from_schema(&schema).with_immediate_foreign_keys();

        let mut set = ChangeSet::new();
        set.push(insert(&schema, "Category", category(1, Some(5))));
        set.push(insert(&schema, "Category", category(5, None)));
        assert_eq!(store.apply(set).await.unwrap(), 2);
        assert_eq!(store.count("categories").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_immediate_fks_reject_what_deferred_checks_accept() {
        let schema = category_schema();
        let cycle = || {
            let mut set = ChangeSet::new();
            set.push(insert(&schema, "Category", category(1, Some(2))));
            set.push(insert(&schema, "Category", category(2, Some(1))));
            set
        };

        let deferred = MemoryStore::from_schema(&schema);
        assert_eq!(deferred.apply(cycle()).await.unwrap(), 2);

        let immediate = MemoryStore::from_schema(&schema).with_immediate_foreign_keys();
        let err = immediate.apply(cycle()).await.unwrap_err();
        assert!(matches!(err, MigrateError::Constraint { .. }));
        assert_eq!(immediate.count("categories").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_update_of_deleted_row_conflicts() {
        let schema = schema();
        let store = MemoryStore::from_schema(&schema);
        let rt = schema.get("Book").unwrap().clone();

        let mut set = ChangeSet::new();
        set.push(Change {
            record_type: rt,
            table: "books".into(),
            kind: ChangeKind::Update {
                record: book(1, "Dune"),
                original: book(1, "Dune"),
            },
        });
        let err = store.apply(set).await.unwrap_err();
        assert!(matches!(err, MigrateError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_concurrency_token_mismatch_conflicts() {
        let schema = schema();
        let store = MemoryStore::from_schema(&schema);
        store.insert_row("books", book(1, "Dune")).await.unwrap();
        store
            .set_value("books", &RecordKey::from(1), "version", 2i64)
            .await
            .unwrap();

        let rt = schema.get("Book").unwrap().clone();
        let mut set = ChangeSet::new();
        set.push(Change {
            record_type: rt,
            table: "books".into(),
            kind: ChangeKind::Update {
                record: book(1, "Dune Messiah"),
                original: book(1, "Dune"),
            },
        });
        assert!(matches!(
            store.apply(set).await,
            Err(MigrateError::Conflict { .. })
        ));
        let row = store.row("books", &RecordKey::from(1)).await.unwrap().unwrap();
        assert_eq!(row.get("title"), Some(&SqlValue::from("Dune")));
    }

    #[tokio::test]
    async fn test_not_null_enforced() {
        let schema = schema();
        let store = MemoryStore::from_schema(&schema);
        let err = store
            .insert_row("books", Record::new().with("id", 1).with("version", 1i64))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("NOT NULL"));
    }

    #[tokio::test]
    async fn test_fetch_where_in_by_fk_columns() {
        let schema = schema();
        let store = MemoryStore::from_schema(&schema);
        store.insert_row("books", book(1, "Dune")).await.unwrap();
        store.insert_row("books", book(2, "Emma")).await.unwrap();
        for (id, book_id) in [(10, 1), (11, 2), (12, 1)] {
            store
                .insert_row("rentals", Record::new().with("id", id).with("book_id", book_id))
                .await
                .unwrap();
        }

        let rt = schema.get("Rental").unwrap();
        let rows = store
            .fetch_where_in(rt, "rentals", &["book_id".to_string()], &[RecordKey::from(1)])
            .await
            .unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r.get("id").cloned()).collect();
        assert_eq!(ids, vec![Some(SqlValue::I32(10)), Some(SqlValue::I32(12))]);
    }

    #[tokio::test]
    async fn test_unknown_table_is_store_error() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.any("nope").await,
            Err(MigrateError::Store { .. })
        ));
    }
}
