//! SQL value types carried between stores.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use uuid::Uuid;

use super::key::PkValue;
use super::schema::ScalarType;

/// A single typed column value.
///
/// NULL carries its declared type so writers can emit a correctly typed
/// parameter even when no value is present.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// NULL with type hint.
    Null(ScalarType),

    /// Boolean value.
    Bool(bool),

    /// 16-bit signed integer (smallint).
    I16(i16),

    /// 32-bit signed integer (int).
    I32(i32),

    /// 64-bit signed integer (bigint).
    I64(i64),

    /// 32-bit floating point (real/float4).
    F32(f32),

    /// 64-bit floating point (double precision/float8).
    F64(f64),

    /// Text data.
    Text(String),

    /// Binary data.
    Bytes(Vec<u8>),

    /// UUID/GUID value.
    Uuid(Uuid),

    /// Decimal value with arbitrary precision.
    Decimal(Decimal),

    /// Timestamp without timezone.
    DateTime(NaiveDateTime),

    /// Timestamp with timezone offset.
    DateTimeOffset(DateTime<FixedOffset>),

    /// Date without time component.
    Date(NaiveDate),

    /// Time without date component.
    Time(NaiveTime),
}

impl SqlValue {
    /// Check if this value is NULL.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null(_))
    }

    /// The scalar type of this value (the hint for NULL).
    #[must_use]
    pub fn scalar_type(&self) -> ScalarType {
        match self {
            SqlValue::Null(t) => *t,
            SqlValue::Bool(_) => ScalarType::Bool,
            SqlValue::I16(_) => ScalarType::I16,
            SqlValue::I32(_) => ScalarType::I32,
            SqlValue::I64(_) => ScalarType::I64,
            SqlValue::F32(_) => ScalarType::F32,
            SqlValue::F64(_) => ScalarType::F64,
            SqlValue::Text(_) => ScalarType::Text,
            SqlValue::Bytes(_) => ScalarType::Bytes,
            SqlValue::Uuid(_) => ScalarType::Uuid,
            SqlValue::Decimal(_) => ScalarType::Decimal,
            SqlValue::DateTime(_) => ScalarType::DateTime,
            SqlValue::DateTimeOffset(_) => ScalarType::DateTimeOffset,
            SqlValue::Date(_) => ScalarType::Date,
            SqlValue::Time(_) => ScalarType::Time,
        }
    }

    /// Convert to a primary key component.
    ///
    /// Integers of any width collapse to [`PkValue::Int`] so a `bigint`
    /// foreign key matches an `int` primary key. Returns `None` for NULL and
    /// for types that cannot be part of a key.
    #[must_use]
    pub fn to_pk_value(&self) -> Option<PkValue> {
        match self {
            SqlValue::I16(v) => Some(PkValue::Int(i64::from(*v))),
            SqlValue::I32(v) => Some(PkValue::Int(i64::from(*v))),
            SqlValue::I64(v) => Some(PkValue::Int(*v)),
            SqlValue::Uuid(v) => Some(PkValue::Uuid(*v)),
            SqlValue::Text(v) => Some(PkValue::String(v.clone())),
            _ => None,
        }
    }

    /// Build a value of `ty` from a key component.
    ///
    /// Used when a key has to be written back into typed columns, e.g. a
    /// foreign key filled from a referenced record.
    pub fn from_pk_value(value: &PkValue, ty: ScalarType) -> Option<SqlValue> {
        match (value, ty) {
            (PkValue::Int(v), ScalarType::I16) => i16::try_from(*v).ok().map(SqlValue::I16),
            (PkValue::Int(v), ScalarType::I32) => i32::try_from(*v).ok().map(SqlValue::I32),
            (PkValue::Int(v), ScalarType::I64) => Some(SqlValue::I64(*v)),
            (PkValue::Uuid(v), ScalarType::Uuid) => Some(SqlValue::Uuid(*v)),
            (PkValue::String(v), ScalarType::Text) => Some(SqlValue::Text(v.clone())),
            _ => None,
        }
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl From<i16> for SqlValue {
    fn from(v: i16) -> Self {
        SqlValue::I16(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::I32(v)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::I64(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::F64(v)
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        SqlValue::Bytes(v)
    }
}

impl From<Uuid> for SqlValue {
    fn from(v: Uuid) -> Self {
        SqlValue::Uuid(v)
    }
}

impl From<Decimal> for SqlValue {
    fn from(v: Decimal) -> Self {
        SqlValue::Decimal(v)
    }
}

impl From<NaiveDateTime> for SqlValue {
    fn from(v: NaiveDateTime) -> Self {
        SqlValue::DateTime(v)
    }
}

impl From<DateTime<FixedOffset>> for SqlValue {
    fn from(v: DateTime<FixedOffset>) -> Self {
        SqlValue::DateTimeOffset(v)
    }
}

impl From<NaiveDate> for SqlValue {
    fn from(v: NaiveDate) -> Self {
        SqlValue::Date(v)
    }
}

impl From<NaiveTime> for SqlValue {
    fn from(v: NaiveTime) -> Self {
        SqlValue::Time(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_keeps_type_hint() {
        let v = SqlValue::Null(ScalarType::Decimal);
        assert!(v.is_null());
        assert_eq!(v.scalar_type(), ScalarType::Decimal);
        assert!(!SqlValue::I32(42).is_null());
    }

    #[test]
    fn test_integer_widths_share_key_space() {
        assert_eq!(SqlValue::I16(7).to_pk_value(), Some(PkValue::Int(7)));
        assert_eq!(SqlValue::I32(7).to_pk_value(), Some(PkValue::Int(7)));
        assert_eq!(SqlValue::I64(7).to_pk_value(), Some(PkValue::Int(7)));
    }

    #[test]
    fn test_non_key_values() {
        assert_eq!(SqlValue::Null(ScalarType::I32).to_pk_value(), None);
        assert_eq!(SqlValue::F64(1.5).to_pk_value(), None);
        assert_eq!(SqlValue::Bool(true).to_pk_value(), None);
    }

    #[test]
    fn test_from_pk_value_respects_width() {
        assert_eq!(
            SqlValue::from_pk_value(&PkValue::Int(5), ScalarType::I32),
            Some(SqlValue::I32(5))
        );
        assert_eq!(
            SqlValue::from_pk_value(&PkValue::Int(i64::MAX), ScalarType::I32),
            None
        );
        assert_eq!(
            SqlValue::from_pk_value(&PkValue::String("a".into()), ScalarType::I64),
            None
        );
    }
}
