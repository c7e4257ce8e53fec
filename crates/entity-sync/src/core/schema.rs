//! Record type metadata.
//!
//! Record types are declared up front (in YAML or in code) instead of being
//! discovered at runtime. Each type lists its scalar fields, its primary key
//! and its references to other record types. A [`Schema`] validates the set
//! as a whole so that every reference resolves and every foreign key has the
//! right arity.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{MigrateError, Result};

use super::key::RecordKey;
use super::record::Record;

/// Declared type of a scalar field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalarType {
    Bool,
    I16,
    I32,
    I64,
    F32,
    F64,
    Text,
    Bytes,
    Uuid,
    Decimal,
    DateTime,
    DateTimeOffset,
    Date,
    Time,
}

impl ScalarType {
    /// Whether values of this type can be part of a primary key.
    pub fn is_key_capable(&self) -> bool {
        matches!(
            self,
            ScalarType::I16 | ScalarType::I32 | ScalarType::I64 | ScalarType::Uuid | ScalarType::Text
        )
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScalarType::Bool => "bool",
            ScalarType::I16 => "i16",
            ScalarType::I32 => "i32",
            ScalarType::I64 => "i64",
            ScalarType::F32 => "f32",
            ScalarType::F64 => "f64",
            ScalarType::Text => "text",
            ScalarType::Bytes => "bytes",
            ScalarType::Uuid => "uuid",
            ScalarType::Decimal => "decimal",
            ScalarType::DateTime => "date_time",
            ScalarType::DateTimeOffset => "date_time_offset",
            ScalarType::Date => "date",
            ScalarType::Time => "time",
        };
        f.write_str(s)
    }
}

/// A scalar field of a record type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    /// Column name.
    pub name: String,

    /// Declared scalar type.
    #[serde(rename = "type")]
    pub ty: ScalarType,

    /// Whether NULL is allowed.
    #[serde(default)]
    pub nullable: bool,

    /// Value must still match the loaded original when an update commits.
    #[serde(default)]
    pub concurrency_token: bool,
}

/// Cardinality of a reference field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    /// Single reference. FK columns live on the owning type.
    One,
    /// Collection reference. FK columns live on the target type.
    Many,
}

impl fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReferenceKind::One => f.write_str("one"),
            ReferenceKind::Many => f.write_str("many"),
        }
    }
}

/// A reference from one record type to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceDef {
    /// Reference name, e.g. `book`.
    pub name: String,

    /// Name of the referenced record type.
    pub target: String,

    /// Single or collection.
    pub kind: ReferenceKind,

    /// Foreign key columns, in the order of the referenced primary key.
    pub columns: Vec<String>,
}

/// Metadata for one migratable record type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordType {
    /// Record type name.
    pub name: String,

    /// Default table name (defaults to the type name).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,

    /// Primary key field names.
    pub primary_key: Vec<String>,

    /// Scalar fields in column order.
    pub fields: Vec<FieldDef>,

    /// References to other record types.
    #[serde(default)]
    pub references: Vec<ReferenceDef>,
}

impl RecordType {
    /// Start a record type declaration.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: None,
            primary_key: Vec::new(),
            fields: Vec::new(),
            references: Vec::new(),
        }
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, ty: ScalarType) -> Self {
        self.fields.push(FieldDef {
            name: name.into(),
            ty,
            nullable: false,
            concurrency_token: false,
        });
        self
    }

    pub fn with_nullable_field(mut self, name: impl Into<String>, ty: ScalarType) -> Self {
        self.fields.push(FieldDef {
            name: name.into(),
            ty,
            nullable: true,
            concurrency_token: false,
        });
        self
    }

    pub fn with_concurrency_token(mut self, name: impl Into<String>, ty: ScalarType) -> Self {
        self.fields.push(FieldDef {
            name: name.into(),
            ty,
            nullable: false,
            concurrency_token: true,
        });
        self
    }

    pub fn with_primary_key(mut self, fields: &[&str]) -> Self {
        self.primary_key = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn with_reference(
        mut self,
        name: impl Into<String>,
        target: impl Into<String>,
        kind: ReferenceKind,
        columns: &[&str],
    ) -> Self {
        self.references.push(ReferenceDef {
            name: name.into(),
            target: target.into(),
            kind,
            columns: columns.iter().map(|c| c.to_string()).collect(),
        });
        self
    }

    /// Table name used when no explicit accessor is registered.
    pub fn table_name(&self) -> &str {
        self.table.as_deref().unwrap_or(&self.name)
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn reference(&self, name: &str) -> Option<&ReferenceDef> {
        self.references.iter().find(|r| r.name == name)
    }

    /// Fields whose loaded value guards updates.
    pub fn concurrency_tokens(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|f| f.concurrency_token)
    }

    pub fn is_key_field(&self, name: &str) -> bool {
        self.primary_key.iter().any(|k| k == name)
    }

    /// Declared types of the primary key fields, in key order.
    pub fn key_types(&self) -> Vec<ScalarType> {
        self.primary_key
            .iter()
            .filter_map(|k| self.field(k).map(|f| f.ty))
            .collect()
    }

    /// Compute the primary key tuple of a record of this type.
    pub fn key_of(&self, record: &Record) -> Result<RecordKey> {
        let mut parts = Vec::with_capacity(self.primary_key.len());
        for field in &self.primary_key {
            let value = record.get(field).ok_or_else(|| {
                MigrateError::invalid_key(&self.name, format!("missing key field '{}'", field))
            })?;
            let part = value.to_pk_value().ok_or_else(|| {
                MigrateError::invalid_key(
                    &self.name,
                    format!("key field '{}' is NULL or not a key type ({:?})", field, value),
                )
            })?;
            parts.push(part);
        }
        Ok(RecordKey::new(parts))
    }
}

/// Foreign key constraint implied by a reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    /// Constraint name.
    pub name: String,

    /// Record type holding the FK columns.
    pub record_type: String,

    /// FK column names.
    pub columns: Vec<String>,

    /// Referenced record type.
    pub ref_record_type: String,

    /// Referenced primary key columns.
    pub ref_columns: Vec<String>,
}

/// Validated registry of record types.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    types: BTreeMap<String, Arc<RecordType>>,
}

impl Schema {
    /// Build and validate a schema.
    pub fn new(record_types: Vec<RecordType>) -> Result<Self> {
        let mut types = BTreeMap::new();
        for rt in record_types {
            if types.contains_key(&rt.name) {
                return Err(MigrateError::Schema(format!(
                    "record type '{}' is declared more than once",
                    rt.name
                )));
            }
            types.insert(rt.name.clone(), Arc::new(rt));
        }

        let schema = Self { types };
        schema.validate()?;
        Ok(schema)
    }

    /// Look up a record type by name.
    pub fn get(&self, name: &str) -> Result<&Arc<RecordType>> {
        self.types
            .get(name)
            .ok_or_else(|| MigrateError::Schema(format!("unknown record type '{}'", name)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    pub fn record_types(&self) -> impl Iterator<Item = &Arc<RecordType>> {
        self.types.values()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Foreign key constraints implied by all references, deduplicated.
    ///
    /// A `one` reference constrains the owning type; a `many` reference
    /// constrains the target type back to the owner.
    pub fn foreign_keys(&self) -> Vec<ForeignKey> {
        let mut seen = HashSet::new();
        let mut fks = Vec::new();

        for rt in self.types.values() {
            for reference in &rt.references {
                let Some(target) = self.types.get(&reference.target) else {
                    continue;
                };
                let (holder, referenced) = match reference.kind {
                    ReferenceKind::One => (rt.as_ref(), target.as_ref()),
                    ReferenceKind::Many => (target.as_ref(), rt.as_ref()),
                };
                let id = (
                    holder.name.clone(),
                    reference.columns.clone(),
                    referenced.name.clone(),
                );
                if !seen.insert(id) {
                    continue;
                }
                fks.push(ForeignKey {
                    name: format!(
                        "fk_{}_{}",
                        holder.table_name().to_lowercase(),
                        reference.columns.join("_")
                    ),
                    record_type: holder.name.clone(),
                    columns: reference.columns.clone(),
                    ref_record_type: referenced.name.clone(),
                    ref_columns: referenced.primary_key.clone(),
                });
            }
        }

        fks
    }

    fn validate(&self) -> Result<()> {
        for rt in self.types.values() {
            validate_record_type(rt)?;

            for reference in &rt.references {
                let target = self.types.get(&reference.target).ok_or_else(|| {
                    MigrateError::Schema(format!(
                        "{}.{} references unknown record type '{}'",
                        rt.name, reference.name, reference.target
                    ))
                })?;

                let (holder, referenced) = match reference.kind {
                    ReferenceKind::One => (rt.as_ref(), target.as_ref()),
                    ReferenceKind::Many => (target.as_ref(), rt.as_ref()),
                };

                if reference.columns.len() != referenced.primary_key.len() {
                    return Err(MigrateError::Schema(format!(
                        "{}.{} has {} FK column(s) but {} has a {}-column primary key",
                        rt.name,
                        reference.name,
                        reference.columns.len(),
                        referenced.name,
                        referenced.primary_key.len()
                    )));
                }

                for column in &reference.columns {
                    let field = holder.field(column).ok_or_else(|| {
                        MigrateError::Schema(format!(
                            "{}.{}: FK column '{}' is not a field of {}",
                            rt.name, reference.name, column, holder.name
                        ))
                    })?;
                    if !field.ty.is_key_capable() {
                        return Err(MigrateError::Schema(format!(
                            "{}.{}: FK column '{}' has non-key type {}",
                            rt.name, reference.name, column, field.ty
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

fn validate_record_type(rt: &RecordType) -> Result<()> {
    if rt.name.is_empty() {
        return Err(MigrateError::Schema("record type name is empty".into()));
    }
    if rt.fields.is_empty() {
        return Err(MigrateError::Schema(format!("{} declares no fields", rt.name)));
    }
    if rt.primary_key.is_empty() {
        return Err(MigrateError::Schema(format!(
            "{} declares no primary key",
            rt.name
        )));
    }

    let mut names = HashSet::new();
    for field in &rt.fields {
        if !names.insert(field.name.as_str()) {
            return Err(MigrateError::Schema(format!(
                "{}.{} is declared more than once",
                rt.name, field.name
            )));
        }
    }

    for key in &rt.primary_key {
        let field = rt.field(key).ok_or_else(|| {
            MigrateError::Schema(format!(
                "{}: primary key field '{}' is not declared",
                rt.name, key
            ))
        })?;
        if !field.ty.is_key_capable() {
            return Err(MigrateError::Schema(format!(
                "{}: primary key field '{}' has non-key type {}",
                rt.name, key, field.ty
            )));
        }
        if field.nullable {
            return Err(MigrateError::Schema(format!(
                "{}: primary key field '{}' cannot be nullable",
                rt.name, key
            )));
        }
    }

    let mut refs = HashSet::new();
    for reference in &rt.references {
        if names.contains(reference.name.as_str()) || !refs.insert(reference.name.as_str()) {
            return Err(MigrateError::Schema(format!(
                "{}.{} clashes with another field or reference",
                rt.name, reference.name
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::key::PkValue;

    fn library() -> Vec<RecordType> {
        vec![
            RecordType::new("Book")
                .with_table("books")
                .with_field("id", ScalarType::I32)
                .with_field("title", ScalarType::Text)
                .with_primary_key(&["id"])
                .with_reference("rentals", "Rental", ReferenceKind::Many, &["book_id"]),
            RecordType::new("Rental")
                .with_table("rentals")
                .with_field("id", ScalarType::I32)
                .with_field("book_id", ScalarType::I32)
                .with_primary_key(&["id"])
                .with_reference("book", "Book", ReferenceKind::One, &["book_id"]),
        ]
    }

    #[test]
    fn test_valid_schema() {
        let schema = Schema::new(library()).unwrap();
        assert_eq!(schema.len(), 2);
        assert_eq!(schema.get("Book").unwrap().table_name(), "books");
        assert!(schema.get("Member").is_err());
    }

    #[test]
    fn test_table_name_defaults_to_type_name() {
        let rt = RecordType::new("Tag")
            .with_field("id", ScalarType::I64)
            .with_primary_key(&["id"]);
        assert_eq!(rt.table_name(), "Tag");
    }

    #[test]
    fn test_duplicate_type_rejected() {
        let mut types = library();
        types.push(types[0].clone());
        assert!(Schema::new(types).is_err());
    }

    #[test]
    fn test_unknown_reference_target_rejected() {
        let types = vec![RecordType::new("Rental")
            .with_field("id", ScalarType::I32)
            .with_field("member_id", ScalarType::I32)
            .with_primary_key(&["id"])
            .with_reference("member", "Member", ReferenceKind::One, &["member_id"])];
        let err = Schema::new(types).unwrap_err();
        assert!(err.to_string().contains("unknown record type 'Member'"));
    }

    #[test]
    fn test_fk_arity_must_match_primary_key() {
        let types = vec![
            RecordType::new("Shelf")
                .with_field("room", ScalarType::Text)
                .with_field("slot", ScalarType::I32)
                .with_primary_key(&["room", "slot"]),
            RecordType::new("Book")
                .with_field("id", ScalarType::I32)
                .with_field("shelf_room", ScalarType::Text)
                .with_primary_key(&["id"])
                .with_reference("shelf", "Shelf", ReferenceKind::One, &["shelf_room"]),
        ];
        assert!(Schema::new(types).is_err());
    }

    #[test]
    fn test_many_reference_columns_live_on_target() {
        let mut types = library();
        types[0].references[0].columns = vec!["missing".into()];
        let err = Schema::new(types).unwrap_err();
        assert!(err.to_string().contains("not a field of Rental"));
    }

    #[test]
    fn test_non_key_primary_key_type_rejected() {
        let types = vec![RecordType::new("Reading")
            .with_field("value", ScalarType::F64)
            .with_primary_key(&["value"])];
        assert!(Schema::new(types).is_err());
    }

    #[test]
    fn test_foreign_keys_deduplicated() {
        let schema = Schema::new(library()).unwrap();
        let fks = schema.foreign_keys();
        assert_eq!(fks.len(), 1);
        assert_eq!(fks[0].record_type, "Rental");
        assert_eq!(fks[0].columns, vec!["book_id".to_string()]);
        assert_eq!(fks[0].ref_record_type, "Book");
        assert_eq!(fks[0].ref_columns, vec!["id".to_string()]);
    }

    #[test]
    fn test_key_of_composite() {
        let rt = RecordType::new("Shelf")
            .with_field("room", ScalarType::Text)
            .with_field("slot", ScalarType::I32)
            .with_primary_key(&["room", "slot"]);
        let record = Record::new().with("room", "north").with("slot", 4);
        let key = rt.key_of(&record).unwrap();
        assert_eq!(
            key.parts(),
            &[PkValue::String("north".into()), PkValue::Int(4)]
        );
    }

    #[test]
    fn test_key_of_null_is_invalid() {
        let rt = RecordType::new("Book")
            .with_field("id", ScalarType::I32)
            .with_primary_key(&["id"]);
        let record = Record::new().with("id", crate::core::SqlValue::Null(ScalarType::I32));
        assert!(matches!(
            rt.key_of(&record),
            Err(MigrateError::InvalidKey { .. })
        ));
    }

    #[test]
    fn test_yaml_declaration() {
        let yaml = r#"
name: Rental
table: rentals
primary_key: [id]
fields:
  - { name: id, type: i32 }
  - { name: return_date, type: date_time, nullable: true }
  - { name: version, type: i64, concurrency_token: true }
references:
  - { name: book, target: Book, kind: one, columns: [book_id] }
"#;
        let rt: RecordType = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(rt.table_name(), "rentals");
        assert!(rt.field("return_date").unwrap().nullable);
        assert_eq!(rt.concurrency_tokens().count(), 1);
        assert_eq!(rt.references[0].kind, ReferenceKind::One);
    }
}
