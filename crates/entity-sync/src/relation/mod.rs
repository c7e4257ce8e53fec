//! Relation resolution: eager loading of referenced records.
//!
//! For a record type the resolver builds an [`IncludePlan`], a tree of every
//! reference reachable from the type. Loading runs the plan level by level
//! with one batched key lookup per include. The resolver also attaches every
//! materialized referenced record to a destination context as an existing,
//! unchanged row so a commit never tries to insert it.
//!
//! Cycles terminate: an include whose target is already on the current path
//! is materialized but not expanded further, so a self-reference is loaded
//! exactly one level deep. Depth is additionally capped by `max_depth`.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use async_recursion::async_recursion;
use tracing::debug;

use crate::context::DestinationContext;
use crate::core::{Record, RecordKey, RecordType, ReferenceDef, ReferenceKind, Related, Schema};
use crate::error::Result;
use crate::store::SourceStore;

/// Default include depth.
pub const DEFAULT_MAX_DEPTH: usize = 3;

/// One reference to load, with the references to load beneath it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Include {
    pub reference: String,
    pub target: String,
    pub kind: ReferenceKind,
    pub columns: Vec<String>,
    pub nested: Vec<Include>,
}

/// Eager-load plan for one record type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncludePlan {
    pub root: String,
    pub includes: Vec<Include>,
}

impl IncludePlan {
    /// Total number of includes in the tree.
    pub fn len(&self) -> usize {
        fn count(includes: &[Include]) -> usize {
            includes.iter().map(|i| 1 + count(&i.nested)).sum()
        }
        count(&self.includes)
    }

    pub fn is_empty(&self) -> bool {
        self.includes.is_empty()
    }

    /// Deepest include level (0 when there are no includes).
    pub fn depth(&self) -> usize {
        fn depth(includes: &[Include]) -> usize {
            includes
                .iter()
                .map(|i| 1 + depth(&i.nested))
                .max()
                .unwrap_or(0)
        }
        depth(&self.includes)
    }
}

impl fmt::Display for IncludePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn write_level(f: &mut fmt::Formatter<'_>, includes: &[Include], indent: usize) -> fmt::Result {
            for include in includes {
                writeln!(
                    f,
                    "{:indent$}- {} -> {} ({})",
                    "",
                    include.reference,
                    include.target,
                    include.kind,
                    indent = indent
                )?;
                write_level(f, &include.nested, indent + 2)?;
            }
            Ok(())
        }

        writeln!(f, "{}", self.root)?;
        write_level(f, &self.includes, 2)
    }
}

/// Builds and executes include plans against a schema.
#[derive(Debug, Clone, Copy)]
pub struct RelationResolver<'a> {
    schema: &'a Schema,
    max_depth: usize,
}

impl<'a> RelationResolver<'a> {
    pub fn new(schema: &'a Schema, max_depth: usize) -> Self {
        Self { schema, max_depth }
    }

    pub fn schema(&self) -> &'a Schema {
        self.schema
    }

    /// The reference fields of `record_type`, single and collection alike.
    pub fn reference_fields<'r>(&self, record_type: &'r RecordType) -> Vec<&'r ReferenceDef> {
        record_type.references.iter().collect()
    }

    /// Build the include tree for `record_type`.
    pub fn plan(&self, record_type: &RecordType) -> Result<IncludePlan> {
        let mut path = vec![record_type.name.clone()];
        let includes = self.plan_level(record_type, &mut path, 0)?;
        Ok(IncludePlan {
            root: record_type.name.clone(),
            includes,
        })
    }

    fn plan_level(
        &self,
        owner: &RecordType,
        path: &mut Vec<String>,
        depth: usize,
    ) -> Result<Vec<Include>> {
        if depth >= self.max_depth {
            return Ok(Vec::new());
        }

        let mut includes = Vec::new();
        for reference in self.reference_fields(owner) {
            let target = self.schema.get(&reference.target)?;
            let nested = if path.contains(&target.name) {
                Vec::new()
            } else {
                path.push(target.name.clone());
                let nested = self.plan_level(target, path, depth + 1)?;
                path.pop();
                nested
            };
            includes.push(Include {
                reference: reference.name.clone(),
                target: target.name.clone(),
                kind: reference.kind,
                columns: reference.columns.clone(),
                nested,
            });
        }
        Ok(includes)
    }

    /// Load every row of `table` and materialize the plan's references.
    pub async fn load(
        &self,
        source: &dyn SourceStore,
        record_type: &RecordType,
        table: &str,
        plan: &IncludePlan,
    ) -> Result<Vec<Record>> {
        let mut records = source.fetch_all(record_type, table).await?;
        self.materialize(source, record_type, &mut records, &plan.includes)
            .await?;
        Ok(records)
    }

    #[async_recursion]
    async fn materialize(
        &self,
        source: &dyn SourceStore,
        owner: &RecordType,
        records: &mut [Record],
        includes: &[Include],
    ) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        for include in includes {
            let target = self.schema.get(&include.target)?;
            match include.kind {
                ReferenceKind::One => {
                    let keys: BTreeSet<RecordKey> = records
                        .iter()
                        .filter_map(|r| r.key_tuple(&include.columns))
                        .collect();
                    let keys: Vec<RecordKey> = keys.into_iter().collect();

                    let mut fetched = if keys.is_empty() {
                        Vec::new()
                    } else {
                        source
                            .fetch_where_in(target, target.table_name(), &target.primary_key, &keys)
                            .await?
                    };
                    debug!(
                        "Include {}.{}: {} key(s), {} row(s)",
                        owner.name,
                        include.reference,
                        keys.len(),
                        fetched.len()
                    );
                    self.materialize(source, target, &mut fetched, &include.nested)
                        .await?;

                    let mut by_key = HashMap::with_capacity(fetched.len());
                    for row in fetched {
                        by_key.insert(target.key_of(&row)?, row);
                    }
                    for record in records.iter_mut() {
                        let related = record
                            .key_tuple(&include.columns)
                            .and_then(|k| by_key.get(&k).cloned())
                            .map(Box::new);
                        record.set_related(include.reference.clone(), Related::One(related));
                    }
                }
                ReferenceKind::Many => {
                    let mut keys = Vec::with_capacity(records.len());
                    for record in records.iter() {
                        keys.push(owner.key_of(record)?);
                    }

                    let mut children = source
                        .fetch_where_in(target, target.table_name(), &include.columns, &keys)
                        .await?;
                    debug!(
                        "Include {}.{}: {} owner(s), {} row(s)",
                        owner.name,
                        include.reference,
                        keys.len(),
                        children.len()
                    );
                    self.materialize(source, target, &mut children, &include.nested)
                        .await?;

                    let mut groups: HashMap<RecordKey, Vec<Record>> = HashMap::new();
                    for child in children {
                        if let Some(k) = child.key_tuple(&include.columns) {
                            groups.entry(k).or_default().push(child);
                        }
                    }
                    for (record, key) in records.iter_mut().zip(keys) {
                        let group = groups.get(&key).cloned().unwrap_or_default();
                        record.set_related(include.reference.clone(), Related::Many(group));
                    }
                }
            }
        }
        Ok(())
    }

    /// Attach every materialized referenced record of `record` to `ctx` as
    /// an existing row. Returns how many placeholders were added.
    pub fn attach_references(
        &self,
        ctx: &mut DestinationContext<'_>,
        record_type: &RecordType,
        record: &Record,
    ) -> Result<usize> {
        let mut attached = 0;
        for reference in &record_type.references {
            let Some(related) = record.related(&reference.name) else {
                continue;
            };
            let target = self.schema.get(&reference.target)?;
            let referenced: Vec<&Record> = match related {
                Related::One(Some(r)) => vec![r.as_ref()],
                Related::One(None) => Vec::new(),
                Related::Many(rs) => rs.iter().collect(),
            };
            for r in referenced {
                if ctx.attach_reference(target.clone(), target.table_name(), r.scalars())? {
                    attached += 1;
                }
                attached += self.attach_references(ctx, target, r)?;
            }
        }
        Ok(attached)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ScalarType, SqlValue};
    use crate::store::memory::MemoryStore;

    fn library() -> Schema {
        Schema::new(vec![
            RecordType::new("Book")
                .with_table("books")
                .with_field("id", ScalarType::I32)
                .with_field("title", ScalarType::Text)
                .with_primary_key(&["id"])
                .with_reference("rentals", "Rental", ReferenceKind::Many, &["book_id"]),
            RecordType::new("User")
                .with_table("users")
                .with_field("id", ScalarType::I32)
                .with_field("login", ScalarType::Text)
                .with_primary_key(&["id"]),
            RecordType::new("Rental")
                .with_table("rentals")
                .with_field("id", ScalarType::I32)
                .with_field("book_id", ScalarType::I32)
                .with_nullable_field("user_id", ScalarType::I32)
                .with_primary_key(&["id"])
                .with_reference("book", "Book", ReferenceKind::One, &["book_id"])
                .with_reference("user", "User", ReferenceKind::One, &["user_id"]),
            RecordType::new("Category")
                .with_table("categories")
                .with_field("id", ScalarType::I32)
                .with_nullable_field("parent_id", ScalarType::I32)
                .with_primary_key(&["id"])
                .with_reference("parent", "Category", ReferenceKind::One, &["parent_id"]),
        ])
        .unwrap()
    }

    #[test]
    fn test_reference_fields() {
        let schema = library();
        let resolver = RelationResolver::new(&schema, DEFAULT_MAX_DEPTH);
        let rental = schema.get("Rental").unwrap();
        let names: Vec<_> = resolver
            .reference_fields(rental)
            .iter()
            .map(|r| r.name.as_str())
            .collect();
        assert_eq!(names, vec!["book", "user"]);
        assert!(resolver.reference_fields(schema.get("User").unwrap()).is_empty());
    }

    #[test]
    fn test_plan_stops_at_types_on_path() {
        let schema = library();
        let resolver = RelationResolver::new(&schema, DEFAULT_MAX_DEPTH);
        let plan = resolver.plan(schema.get("Rental").unwrap()).unwrap();

        // Rental -> book -> rentals (Rental is on the path, not expanded)
        assert_eq!(plan.includes[0].target, "Book");
        assert_eq!(plan.includes[0].nested[0].target, "Rental");
        assert!(plan.includes[0].nested[0].nested.is_empty());
        assert_eq!(plan.depth(), 2);
        assert_eq!(plan.len(), 3);
    }

    #[test]
    fn test_self_reference_is_one_level() {
        let schema = library();
        let resolver = RelationResolver::new(&schema, 10);
        let plan = resolver.plan(schema.get("Category").unwrap()).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.includes[0].reference, "parent");
    }

    #[test]
    fn test_max_depth_caps_plan() {
        let schema = library();
        let plan = RelationResolver::new(&schema, 1)
            .plan(schema.get("Rental").unwrap())
            .unwrap();
        assert_eq!(plan.depth(), 1);
        let flat = RelationResolver::new(&schema, 0)
            .plan(schema.get("Rental").unwrap())
            .unwrap();
        assert!(flat.is_empty());
    }

    #[test]
    fn test_plan_display() {
        let schema = library();
        let plan = RelationResolver::new(&schema, 1)
            .plan(schema.get("Rental").unwrap())
            .unwrap();
        assert_eq!(
            plan.to_string(),
            "Rental\n  - book -> Book (one)\n  - user -> User (one)\n"
        );
    }

    #[tokio::test]
    async fn test_load_materializes_one_and_many() {
        let schema = library();
        let store = MemoryStore::from_schema(&schema);
        store
            .insert_row("books", Record::new().with("id", 1).with("title", "Dune"))
            .await
            .unwrap();
        store
            .insert_row("users", Record::new().with("id", 5).with("login", "ada"))
            .await
            .unwrap();
        store
            .insert_row(
                "rentals",
                Record::new().with("id", 10).with("book_id", 1).with("user_id", 5),
            )
            .await
            .unwrap();
        store
            .insert_row(
                "rentals",
                Record::new()
                    .with("id", 11)
                    .with("book_id", 1)
                    .with("user_id", SqlValue::Null(ScalarType::I32)),
            )
            .await
            .unwrap();

        let resolver = RelationResolver::new(&schema, DEFAULT_MAX_DEPTH);
        let book_type = schema.get("Book").unwrap();
        let plan = resolver.plan(book_type).unwrap();
        let books = resolver.load(&store, book_type, "books", &plan).await.unwrap();

        assert_eq!(books.len(), 1);
        let Some(Related::Many(rentals)) = books[0].related("rentals") else {
            panic!("rentals not materialized");
        };
        assert_eq!(rentals.len(), 2);
        assert!(matches!(rentals[0].related("user"), Some(Related::One(Some(_)))));
        assert!(matches!(rentals[1].related("user"), Some(Related::One(None))));
    }

    #[tokio::test]
    async fn test_self_reference_loads_parent() {
        let schema = library();
        let store = MemoryStore::from_schema(&schema);
        store
            .insert_row(
                "categories",
                Record::new()
                    .with("id", 1)
                    .with("parent_id", SqlValue::Null(ScalarType::I32)),
            )
            .await
            .unwrap();
        store
            .insert_row("categories", Record::new().with("id", 2).with("parent_id", 1))
            .await
            .unwrap();

        let resolver = RelationResolver::new(&schema, DEFAULT_MAX_DEPTH);
        let rt = schema.get("Category").unwrap();
        let plan = resolver.plan(rt).unwrap();
        let rows = resolver.load(&store, rt, "categories", &plan).await.unwrap();
        let child = rows.iter().find(|r| r.get("id") == Some(&SqlValue::I32(2))).unwrap();
        let Some(Related::One(Some(parent))) = child.related("parent") else {
            panic!("parent not materialized");
        };
        assert_eq!(parent.get("id"), Some(&SqlValue::I32(1)));
        assert!(parent.related("parent").is_none());
    }
}
