//! Primary key values and key tuples.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Represents a primary key value of various types.
///
/// This enum allows handling different PK types uniformly for lookups,
/// identity maps and batched fetches.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PkValue {
    /// Integer primary key (covers int, bigint, smallint).
    Int(i64),
    /// UUID/GUID primary key.
    Uuid(Uuid),
    /// String primary key (varchar, nvarchar, text).
    String(String),
}

impl PkValue {
    /// Convert to a SQL literal string for use in queries.
    ///
    /// Single quotes are doubled. This is only used for key values when
    /// building `IN` lists for batched fetches.
    pub fn to_sql_literal(&self) -> String {
        match self {
            PkValue::Int(v) => v.to_string(),
            PkValue::Uuid(v) => format!("'{}'", v),
            PkValue::String(v) => format!("'{}'", v.replace('\'', "''")),
        }
    }

    /// Convert to a SQL literal for MSSQL (with N prefix for Unicode strings).
    pub fn to_mssql_literal(&self) -> String {
        match self {
            PkValue::Int(v) => v.to_string(),
            PkValue::Uuid(v) => format!("'{}'", v),
            PkValue::String(v) => format!("N'{}'", v.replace('\'', "''")),
        }
    }
}

impl fmt::Display for PkValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PkValue::Int(v) => write!(f, "{}", v),
            PkValue::Uuid(v) => write!(f, "{}", v),
            PkValue::String(v) => write!(f, "{:?}", v),
        }
    }
}

impl From<i64> for PkValue {
    fn from(v: i64) -> Self {
        PkValue::Int(v)
    }
}

impl From<i32> for PkValue {
    fn from(v: i32) -> Self {
        PkValue::Int(v as i64)
    }
}

impl From<Uuid> for PkValue {
    fn from(v: Uuid) -> Self {
        PkValue::Uuid(v)
    }
}

impl From<String> for PkValue {
    fn from(v: String) -> Self {
        PkValue::String(v)
    }
}

impl From<&str> for PkValue {
    fn from(v: &str) -> Self {
        PkValue::String(v.to_string())
    }
}

/// An ordered primary key tuple.
///
/// Single-column keys are a tuple of one. Components are in the order the
/// record type declares its primary key fields.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordKey(Vec<PkValue>);

impl RecordKey {
    pub fn new(parts: Vec<PkValue>) -> Self {
        Self(parts)
    }

    pub fn parts(&self) -> &[PkValue] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<PkValue> for RecordKey {
    fn from(v: PkValue) -> Self {
        RecordKey(vec![v])
    }
}

impl From<i32> for RecordKey {
    fn from(v: i32) -> Self {
        RecordKey(vec![PkValue::from(v)])
    }
}

impl From<i64> for RecordKey {
    fn from(v: i64) -> Self {
        RecordKey(vec![PkValue::from(v)])
    }
}

impl From<&str> for RecordKey {
    fn from(v: &str) -> Self {
        RecordKey(vec![PkValue::from(v)])
    }
}

impl From<Uuid> for RecordKey {
    fn from(v: Uuid) -> Self {
        RecordKey(vec![PkValue::from(v)])
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.len() == 1 {
            return write!(f, "{}", self.0[0]);
        }
        write!(f, "(")?;
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", part)?;
        }
        write!(f, ")")
    }
}
