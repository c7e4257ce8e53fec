//! Error types for the synchronization library.

use std::fmt;

use thiserror::Error;

/// Main error type for synchronization operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Record type metadata is inconsistent
    #[error("Schema error: {0}")]
    Schema(String),

    /// A record did not yield a usable primary key
    #[error("Invalid key for {record_type}: {message}")]
    InvalidKey {
        record_type: String,
        message: String,
    },

    /// The destination row changed between load and commit
    #[error("Concurrency conflict on table {table}: {message}")]
    Conflict { table: String, message: String },

    /// The destination store rejected a change (PK, FK, NOT NULL)
    #[error("Constraint violation on table {table}: {message}")]
    Constraint { table: String, message: String },

    /// Store-level failure that is not a constraint or conflict
    #[error("Store error on table {table}: {message}")]
    Store { table: String, message: String },

    /// Change tracker misuse (double tracking, unknown entries)
    #[error("Change tracking error: {0}")]
    Tracking(String),

    /// Source database connection or query error
    #[error("Source database error: {0}")]
    Source(#[from] tiberius::error::Error),

    /// Target database connection or query error
    #[error("Target database error: {0}")]
    Target(#[from] tokio_postgres::Error),

    /// PostgreSQL source connection or query error
    #[error("Source database error: {0}")]
    PgSource(tokio_postgres::Error),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Coarse classification used for logging and exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Conflict,
    StoreUpdate,
    Unexpected,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Conflict => "conflict",
            ErrorKind::StoreUpdate => "store update",
            ErrorKind::Unexpected => "unexpected",
        };
        f.write_str(s)
    }
}

impl MigrateError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl ToString, context: impl Into<String>) -> Self {
        MigrateError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create a Conflict error
    pub fn conflict(table: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Conflict {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a Constraint error
    pub fn constraint(table: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Constraint {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a Store error
    pub fn store(table: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Store {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create an InvalidKey error
    pub fn invalid_key(record_type: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::InvalidKey {
            record_type: record_type.into(),
            message: message.into(),
        }
    }

    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MigrateError::Config(_) | MigrateError::Schema(_) | MigrateError::Yaml(_) => {
                ErrorKind::Configuration
            }
            MigrateError::Conflict { .. } => ErrorKind::Conflict,
            MigrateError::Constraint { .. }
            | MigrateError::Store { .. }
            | MigrateError::Source(_)
            | MigrateError::Target(_)
            | MigrateError::PgSource(_)
            | MigrateError::Pool { .. } => ErrorKind::StoreUpdate,
            MigrateError::InvalidKey { .. }
            | MigrateError::Tracking(_)
            | MigrateError::Io(_)
            | MigrateError::Json(_) => ErrorKind::Unexpected,
        }
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self.kind() {
            ErrorKind::Configuration => 2,
            ErrorKind::Conflict => 3,
            ErrorKind::StoreUpdate => 4,
            ErrorKind::Unexpected => 1,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for synchronization operations.
pub type Result<T> = std::result::Result<T, MigrateError>;
