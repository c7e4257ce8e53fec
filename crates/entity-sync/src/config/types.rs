//! Configuration type definitions.

use serde::{Deserialize, Serialize};

use crate::core::RecordType;
use crate::orchestrator::CommitPolicy;
use crate::relation::DEFAULT_MAX_DEPTH;
use crate::sync::SyncMode;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Source store connection.
    pub source: SourceConfig,

    /// Destination store connection (PostgreSQL).
    pub target: TargetConfig,

    /// Migration behavior configuration.
    #[serde(default)]
    pub migration: MigrationConfig,

    /// Record type declarations.
    #[serde(default)]
    pub record_types: Vec<RecordType>,

    /// Migrations to run, in order. Referenced types go first.
    #[serde(default)]
    pub migrations: Vec<MigrationEntry>,
}

/// Source store configuration (SQL Server or PostgreSQL).
#[derive(Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Database type: "mssql" or "postgres".
    #[serde(default = "default_mssql")]
    pub r#type: String,

    /// Database host.
    pub host: String,

    /// Database port (default: 1433 for mssql, 5432 for postgres).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// Schema that unqualified table names resolve in (default: "dbo" for
    /// mssql, "public" for postgres).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// Encrypt the SQL Server connection (default: true).
    #[serde(default = "default_true")]
    pub encrypt: bool,

    /// Trust the SQL Server certificate (default: false).
    #[serde(default)]
    pub trust_server_cert: bool,

    /// SSL mode for a PostgreSQL source (default: "require").
    #[serde(default = "default_require")]
    pub ssl_mode: String,
}

impl SourceConfig {
    pub fn is_mssql(&self) -> bool {
        self.r#type == "mssql"
    }

    /// Effective port.
    pub fn port(&self) -> u16 {
        self.port
            .unwrap_or(if self.is_mssql() { 1433 } else { 5432 })
    }

    /// Effective schema.
    pub fn schema_name(&self) -> &str {
        match &self.schema {
            Some(schema) => schema,
            None if self.is_mssql() => "dbo",
            None => "public",
        }
    }
}

impl std::fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceConfig")
            .field("type", &self.r#type)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("schema", &self.schema)
            .field("encrypt", &self.encrypt)
            .field("trust_server_cert", &self.trust_server_cert)
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}

/// Destination store (PostgreSQL) configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Database type (always "postgres" for now).
    #[serde(default = "default_postgres")]
    pub r#type: String,

    /// Database host.
    pub host: String,

    /// Database port (default: 5432).
    #[serde(default = "default_pg_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// Target schema (default: "public").
    #[serde(default = "default_public_schema")]
    pub schema: String,

    /// SSL mode (default: "require").
    #[serde(default = "default_require")]
    pub ssl_mode: String,
}

impl std::fmt::Debug for TargetConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetConfig")
            .field("type", &self.r#type)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("schema", &self.schema)
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}

/// Migration behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// When staged changes are committed (default: per_record_type).
    #[serde(default)]
    pub commit_policy: CommitPolicy,

    /// Treatment of existing destination data (default: upsert).
    #[serde(default)]
    pub mode: SyncMode,

    /// How many reference levels are loaded eagerly (default: 3).
    #[serde(default = "default_max_relation_depth")]
    pub max_relation_depth: usize,

    /// Stage everything, commit nothing (default: false).
    #[serde(default)]
    pub dry_run: bool,

    /// Source pool size (default: 4).
    #[serde(default = "default_connections")]
    pub max_source_connections: usize,

    /// Destination pool size (default: 4).
    #[serde(default = "default_connections")]
    pub max_target_connections: usize,

    /// Keys per lookup statement when loading references (default: 500).
    #[serde(default = "default_fetch_batch_size")]
    pub fetch_batch_size: usize,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            commit_policy: CommitPolicy::default(),
            mode: SyncMode::default(),
            max_relation_depth: default_max_relation_depth(),
            dry_run: false,
            max_source_connections: default_connections(),
            max_target_connections: default_connections(),
            fetch_batch_size: default_fetch_batch_size(),
        }
    }
}

/// One entry of the ordered migration list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationEntry {
    /// Record type name.
    pub record_type: String,

    /// Source table (default: the record type's table).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_table: Option<String>,

    /// Destination table (default: the record type's table).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_table: Option<String>,
}

// Default value functions for serde
fn default_mssql() -> String {
    "mssql".to_string()
}

fn default_postgres() -> String {
    "postgres".to_string()
}

fn default_pg_port() -> u16 {
    5432
}

fn default_public_schema() -> String {
    "public".to_string()
}

fn default_require() -> String {
    "require".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_relation_depth() -> usize {
    DEFAULT_MAX_DEPTH
}

fn default_connections() -> usize {
    4
}

fn default_fetch_batch_size() -> usize {
    500
}
