//! Core data model: record type metadata, values, keys and records.

pub mod key;
pub mod record;
pub mod schema;
pub mod value;

pub use key::{PkValue, RecordKey};
pub use record::{Record, Related};
pub use schema::{FieldDef, ForeignKey, RecordType, ReferenceDef, ReferenceKind, ScalarType, Schema};
pub use value::SqlValue;
