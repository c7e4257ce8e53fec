//! Record instances.

use std::collections::BTreeMap;

use super::key::RecordKey;
use super::schema::{RecordType, ReferenceKind};
use super::value::SqlValue;

/// Materialized value of a reference field.
#[derive(Debug, Clone, PartialEq)]
pub enum Related {
    /// Single reference; `None` when the FK is NULL or dangling.
    One(Option<Box<Record>>),
    /// Collection reference.
    Many(Vec<Record>),
}

/// One row of a record type.
///
/// Scalar values are keyed by field name. References are only present once
/// the relation resolver has materialized them.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    pub values: BTreeMap<String, SqlValue>,
    pub related: BTreeMap<String, Related>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.values.insert(field.into(), value.into());
        self
    }

    pub fn get(&self, field: &str) -> Option<&SqlValue> {
        self.values.get(field)
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<SqlValue>) {
        self.values.insert(field.into(), value.into());
    }

    pub fn related(&self, reference: &str) -> Option<&Related> {
        self.related.get(reference)
    }

    pub fn set_related(&mut self, reference: impl Into<String>, related: Related) {
        self.related.insert(reference.into(), related);
    }

    /// Key tuple formed by `columns`, or `None` if any column is NULL or missing.
    pub fn key_tuple(&self, columns: &[String]) -> Option<RecordKey> {
        columns
            .iter()
            .map(|c| self.values.get(c).and_then(SqlValue::to_pk_value))
            .collect::<Option<Vec<_>>>()
            .map(RecordKey::new)
    }

    /// Copy without materialized references.
    pub fn scalars(&self) -> Record {
        Record {
            values: self.values.clone(),
            related: BTreeMap::new(),
        }
    }

    /// Whether every declared field of `rt` holds the same value in both.
    pub fn scalars_equal(&self, other: &Record, rt: &RecordType) -> bool {
        rt.fields
            .iter()
            .all(|f| self.values.get(&f.name) == other.values.get(&f.name))
    }

    /// Restrict to the declared fields of `rt`, filling gaps with typed NULLs.
    pub fn normalized(&self, rt: &RecordType) -> Record {
        let values = rt
            .fields
            .iter()
            .map(|f| {
                let value = self
                    .values
                    .get(&f.name)
                    .cloned()
                    .unwrap_or(SqlValue::Null(f.ty));
                (f.name.clone(), value)
            })
            .collect();
        Record {
            values,
            related: self.related.clone(),
        }
    }

    /// Build the instance that overwrites `self` (the destination copy) with
    /// `source`.
    ///
    /// Every declared scalar field takes the source value. Single reference
    /// FK columns are taken from the materialized referenced record when one
    /// was loaded, and the source's materialized references are carried over.
    pub fn overwritten_by(&self, source: &Record, rt: &RecordType, targets: &[&RecordType]) -> Record {
        let mut merged = source.normalized(rt);

        for reference in rt.references.iter().filter(|r| r.kind == ReferenceKind::One) {
            let Some(Related::One(Some(referenced))) = source.related.get(&reference.name) else {
                continue;
            };
            let Some(target) = targets.iter().find(|t| t.name == reference.target) else {
                continue;
            };
            for (column, pk_field) in reference.columns.iter().zip(&target.primary_key) {
                let Some(ty) = rt.field(column).map(|f| f.ty) else {
                    continue;
                };
                let value = referenced
                    .get(pk_field)
                    .and_then(SqlValue::to_pk_value)
                    .and_then(|pk| SqlValue::from_pk_value(&pk, ty));
                if let Some(value) = value {
                    merged.values.insert(column.clone(), value);
                }
            }
        }

        merged
    }
}
