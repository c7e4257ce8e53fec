//! PostgreSQL store adapter.
//!
//! Reads cast every declared field to its PostgreSQL type so rows decode by
//! the record type alone. Writes pass every value as text and cast it in SQL
//! (`$n::text::integer`), which keeps parameter binding independent of the
//! column types.

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use tokio_postgres::types::ToSql;
use tokio_postgres::Config as PgConfig;
use tracing::{debug, info, warn};

use crate::config::{SourceConfig, TargetConfig};
use crate::core::{Record, RecordKey, RecordType, ScalarType, SqlValue};
use crate::error::{MigrateError, Result};
use crate::store::{ChangeKind, ChangeSet, DestinationStore, SourceStore};

use super::tls::{make_connector, SslMode};

/// Connection settings shared by the source and destination roles.
#[derive(Clone)]
pub struct PgEndpoint {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub schema: String,
    pub ssl_mode: SslMode,
}

impl PgEndpoint {
    pub fn from_source(config: &SourceConfig) -> Result<Self> {
        Ok(Self {
            host: config.host.clone(),
            port: config.port(),
            database: config.database.clone(),
            user: config.user.clone(),
            password: config.password.clone(),
            schema: config.schema_name().to_string(),
            ssl_mode: SslMode::parse(&config.ssl_mode)?,
        })
    }

    pub fn from_target(config: &TargetConfig) -> Result<Self> {
        Ok(Self {
            host: config.host.clone(),
            port: config.port,
            database: config.database.clone(),
            user: config.user.clone(),
            password: config.password.clone(),
            schema: config.schema.clone(),
            ssl_mode: SslMode::parse(&config.ssl_mode)?,
        })
    }
}

impl std::fmt::Debug for PgEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgEndpoint")
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

/// Which side of the migration a [`PgStore`] serves. Decides how driver
/// errors are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreRole {
    Source,
    Target,
}

impl StoreRole {
    /// Wrap a driver error for this side.
    pub fn error(self, e: tokio_postgres::Error) -> MigrateError {
        match self {
            StoreRole::Source => MigrateError::PgSource(e),
            StoreRole::Target => MigrateError::Target(e),
        }
    }
}

impl std::fmt::Display for StoreRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreRole::Source => write!(f, "source"),
            StoreRole::Target => write!(f, "target"),
        }
    }
}

/// Pooled PostgreSQL store. Usable as source and destination.
pub struct PgStore {
    pool: Pool,
    schema: String,
    fetch_batch_size: usize,
    role: StoreRole,
}

impl PgStore {
    /// Build the pool and verify it with a test query.
    pub async fn connect(
        endpoint: &PgEndpoint,
        max_conns: usize,
        fetch_batch_size: usize,
        role: StoreRole,
    ) -> Result<Self> {
        let mut pg_config = PgConfig::new();
        pg_config.host(&endpoint.host);
        pg_config.port(endpoint.port);
        pg_config.dbname(&endpoint.database);
        pg_config.user(&endpoint.user);
        pg_config.password(&endpoint.password);

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };

        let mgr = match make_connector(endpoint.ssl_mode)? {
            Some(tls) => Manager::from_config(pg_config, tls, mgr_config),
            None => {
                warn!("PostgreSQL TLS is disabled. Credentials will be transmitted in plaintext.");
                Manager::from_config(pg_config, tokio_postgres::NoTls, mgr_config)
            }
        };
        let pool = Pool::builder(mgr)
            .max_size(max_conns)
            .build()
            .map_err(|e| MigrateError::pool(e, format!("creating PostgreSQL {} pool", role)))?;

        // Test connection
        let client = pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e, format!("testing PostgreSQL {} connection", role)))?;
        client
            .simple_query("SELECT 1")
            .await
            .map_err(|e| role.error(e))?;

        info!(
            "Connected to PostgreSQL {}: {}:{}/{}",
            role, endpoint.host, endpoint.port, endpoint.database
        );

        Ok(Self {
            pool,
            schema: endpoint.schema.clone(),
            fetch_batch_size: fetch_batch_size.max(1),
            role,
        })
    }

    async fn client(&self, context: &str) -> Result<deadpool_postgres::Object> {
        self.pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e, context))
    }

    async fn query_records(&self, rt: &RecordType, table: &str, sql: &str) -> Result<Vec<Record>> {
        let client = self.client("getting connection for query").await?;
        let rows = client
            .query(sql, &[])
            .await
            .map_err(|e| classify(self.role, table, e))?;
        rows.iter()
            .map(|row| decode_row(row, rt).map_err(|e| self.role.error(e)))
            .collect()
    }
}

#[async_trait]
impl SourceStore for PgStore {
    async fn fetch_all(&self, record_type: &RecordType, table: &str) -> Result<Vec<Record>> {
        let sql = build_select(&self.schema, record_type, table, None);
        let records = self.query_records(record_type, table, &sql).await?;
        debug!("Fetched {} rows from {}", records.len(), table);
        Ok(records)
    }

    async fn fetch_where_in(
        &self,
        record_type: &RecordType,
        table: &str,
        columns: &[String],
        keys: &[RecordKey],
    ) -> Result<Vec<Record>> {
        let mut records = Vec::new();
        for chunk in keys.chunks(self.fetch_batch_size) {
            let predicate = key_predicate(columns, chunk);
            let sql = build_select(&self.schema, record_type, table, Some(&predicate));
            records.extend(self.query_records(record_type, table, &sql).await?);
        }
        Ok(records)
    }

    async fn ping(&self) -> Result<()> {
        let client = self.client("health check").await?;
        client
            .simple_query("SELECT 1")
            .await
            .map_err(|e| self.role.error(e))?;
        Ok(())
    }

    fn store_type(&self) -> &str {
        "postgres"
    }

    async fn close(&self) {
        self.pool.close();
    }
}

#[async_trait]
impl DestinationStore for PgStore {
    async fn find(
        &self,
        record_type: &RecordType,
        table: &str,
        key: &RecordKey,
    ) -> Result<Option<Record>> {
        let predicate = key_predicate(&record_type.primary_key, std::slice::from_ref(key));
        let sql = build_select(&self.schema, record_type, table, Some(&predicate));
        Ok(self
            .query_records(record_type, table, &sql)
            .await?
            .into_iter()
            .next())
    }

    async fn any(&self, table: &str) -> Result<bool> {
        let client = self.client("getting connection for any").await?;
        let sql = format!(
            "SELECT EXISTS (SELECT 1 FROM {})",
            qualify(&self.schema, table)
        );
        let row = client
            .query_one(sql.as_str(), &[])
            .await
            .map_err(|e| classify(self.role, table, e))?;
        row.try_get::<_, bool>(0).map_err(|e| self.role.error(e))
    }

    async fn apply(&self, changes: ChangeSet) -> Result<u64> {
        let mut client = self.client("getting connection for commit").await?;
        let tx = client
            .transaction()
            .await
            .map_err(|e| self.role.error(e))?;
        let mut affected = 0u64;

        for change in changes.into_dependency_order() {
            let rt = &change.record_type;
            let table = &change.table;
            match change.kind {
                ChangeKind::Insert(record) => {
                    let (sql, params) = build_insert(&self.schema, rt, table, &record);
                    let n = tx
                        .execute(sql.as_str(), &param_refs(&params))
                        .await
                        .map_err(|e| classify(self.role, table, e))?;
                    affected += n;
                }
                ChangeKind::Update { record, original } => {
                    let (sql, params) = build_update(&self.schema, rt, table, &record, &original);
                    let n = tx
                        .execute(sql.as_str(), &param_refs(&params))
                        .await
                        .map_err(|e| classify(self.role, table, e))?;
                    if n == 0 {
                        let key = rt.key_of(&record)?;
                        return Err(MigrateError::conflict(
                            table.as_str(),
                            format!("row {} was deleted or changed after it was loaded", key),
                        ));
                    }
                    affected += n;
                }
            }
        }

        tx.commit()
            .await
            .map_err(|e| classify(self.role, "commit", e))?;
        debug!("Applied {} changes", affected);
        Ok(affected)
    }

    async fn ping(&self) -> Result<()> {
        SourceStore::ping(self).await
    }

    fn store_type(&self) -> &str {
        "postgres"
    }

    async fn close(&self) {
        self.pool.close();
    }
}

/// Quote a PostgreSQL identifier.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `schema.table`, honoring an explicit schema in `table`.
fn qualify(default_schema: &str, table: &str) -> String {
    match table.split_once('.') {
        Some((schema, name)) => format!("{}.{}", quote_ident(schema), quote_ident(name)),
        None => format!("{}.{}", quote_ident(default_schema), quote_ident(table)),
    }
}

fn pg_type(ty: ScalarType) -> &'static str {
    match ty {
        ScalarType::Bool => "boolean",
        ScalarType::I16 => "smallint",
        ScalarType::I32 => "integer",
        ScalarType::I64 => "bigint",
        ScalarType::F32 => "real",
        ScalarType::F64 => "double precision",
        ScalarType::Text => "text",
        ScalarType::Bytes => "bytea",
        ScalarType::Uuid => "uuid",
        ScalarType::Decimal => "numeric",
        ScalarType::DateTime => "timestamp",
        ScalarType::DateTimeOffset => "timestamptz",
        ScalarType::Date => "date",
        ScalarType::Time => "time",
    }
}

fn build_select(schema: &str, rt: &RecordType, table: &str, predicate: Option<&str>) -> String {
    let columns: Vec<String> = rt
        .fields
        .iter()
        .map(|f| {
            let col = quote_ident(&f.name);
            format!("{}::{} AS {}", col, pg_type(f.ty), col)
        })
        .collect();
    let order: Vec<String> = rt.primary_key.iter().map(|c| quote_ident(c)).collect();

    let mut sql = format!("SELECT {} FROM {}", columns.join(", "), qualify(schema, table));
    if let Some(predicate) = predicate {
        sql.push_str(" WHERE ");
        sql.push_str(predicate);
    }
    sql.push_str(" ORDER BY ");
    sql.push_str(&order.join(", "));
    sql
}

/// `"a" IN (1, 2)` or `("a", "b") IN ((1, 'x'), (2, 'y'))`.
fn key_predicate(columns: &[String], keys: &[RecordKey]) -> String {
    if keys.is_empty() {
        return "FALSE".to_string();
    }
    let tuple = |key: &RecordKey| -> String {
        let parts: Vec<String> = key.parts().iter().map(|p| p.to_sql_literal()).collect();
        if parts.len() == 1 {
            parts.join("")
        } else {
            format!("({})", parts.join(", "))
        }
    };
    let lhs: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    let lhs = if lhs.len() == 1 {
        lhs.join("")
    } else {
        format!("({})", lhs.join(", "))
    };
    let values: Vec<String> = keys.iter().map(tuple).collect();
    format!("{} IN ({})", lhs, values.join(", "))
}

fn build_insert(
    schema: &str,
    rt: &RecordType,
    table: &str,
    record: &Record,
) -> (String, Vec<Option<String>>) {
    let mut columns = Vec::with_capacity(rt.fields.len());
    let mut placeholders = Vec::with_capacity(rt.fields.len());
    let mut params = Vec::with_capacity(rt.fields.len());

    for (i, field) in rt.fields.iter().enumerate() {
        columns.push(quote_ident(&field.name));
        placeholders.push(format!("${}::text::{}", i + 1, pg_type(field.ty)));
        params.push(record.get(&field.name).and_then(value_to_text));
    }

    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        qualify(schema, table),
        columns.join(", "),
        placeholders.join(", ")
    );
    (sql, params)
}

/// Full overwrite guarded by primary key and concurrency tokens.
fn build_update(
    schema: &str,
    rt: &RecordType,
    table: &str,
    record: &Record,
    original: &Record,
) -> (String, Vec<Option<String>>) {
    let mut params = Vec::new();
    let mut param = |value: Option<String>, ty: ScalarType| {
        params.push(value);
        format!("${}::text::{}", params.len(), pg_type(ty))
    };

    let mut sets = Vec::new();
    for field in rt.fields.iter().filter(|f| !rt.is_key_field(&f.name)) {
        let value = record.get(&field.name).and_then(value_to_text);
        sets.push(format!("{} = {}", quote_ident(&field.name), param(value, field.ty)));
    }
    if sets.is_empty() {
        // Key-only type: touch the row so the affected count still reports it.
        let first = quote_ident(&rt.primary_key[0]);
        sets.push(format!("{} = {}", first, first));
    }

    let mut conditions = Vec::new();
    for name in &rt.primary_key {
        let ty = rt.field(name).map_or(ScalarType::Text, |f| f.ty);
        let value = record.get(name).and_then(value_to_text);
        conditions.push(format!("{} = {}", quote_ident(name), param(value, ty)));
    }
    for token in rt.concurrency_tokens() {
        let value = original.get(&token.name).and_then(value_to_text);
        conditions.push(format!(
            "{} IS NOT DISTINCT FROM {}",
            quote_ident(&token.name),
            param(value, token.ty)
        ));
    }

    let sql = format!(
        "UPDATE {} SET {} WHERE {}",
        qualify(schema, table),
        sets.join(", "),
        conditions.join(" AND ")
    );
    (sql, params)
}

fn param_refs(params: &[Option<String>]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
}

/// Text form of a value for a `$n::text::type` parameter. NULL maps to `None`.
fn value_to_text(value: &SqlValue) -> Option<String> {
    let text = match value {
        SqlValue::Null(_) => return None,
        SqlValue::Bool(b) => if *b { "t" } else { "f" }.to_string(),
        SqlValue::I16(n) => n.to_string(),
        SqlValue::I32(n) => n.to_string(),
        SqlValue::I64(n) => n.to_string(),
        SqlValue::F32(n) => n.to_string(),
        SqlValue::F64(n) => n.to_string(),
        SqlValue::Text(s) => s.clone(),
        SqlValue::Bytes(b) => format!("\\x{}", hex::encode(b)),
        SqlValue::Uuid(u) => u.to_string(),
        SqlValue::Decimal(d) => d.to_string(),
        SqlValue::DateTime(dt) => dt.format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
        SqlValue::DateTimeOffset(dt) => dt.to_rfc3339(),
        SqlValue::Date(d) => d.to_string(),
        SqlValue::Time(t) => t.to_string(),
    };
    Some(text)
}

fn decode_row(
    row: &tokio_postgres::Row,
    rt: &RecordType,
) -> std::result::Result<Record, tokio_postgres::Error> {
    let mut record = Record::new();
    for (idx, field) in rt.fields.iter().enumerate() {
        let value = decode_value(row, idx, field.ty)?;
        record.values.insert(field.name.clone(), value);
    }
    Ok(record)
}

fn decode_value(
    row: &tokio_postgres::Row,
    idx: usize,
    ty: ScalarType,
) -> std::result::Result<SqlValue, tokio_postgres::Error> {
    let value = match ty {
        ScalarType::Bool => row.try_get::<_, Option<bool>>(idx)?.map(SqlValue::Bool),
        ScalarType::I16 => row.try_get::<_, Option<i16>>(idx)?.map(SqlValue::I16),
        ScalarType::I32 => row.try_get::<_, Option<i32>>(idx)?.map(SqlValue::I32),
        ScalarType::I64 => row.try_get::<_, Option<i64>>(idx)?.map(SqlValue::I64),
        ScalarType::F32 => row.try_get::<_, Option<f32>>(idx)?.map(SqlValue::F32),
        ScalarType::F64 => row.try_get::<_, Option<f64>>(idx)?.map(SqlValue::F64),
        ScalarType::Text => row.try_get::<_, Option<String>>(idx)?.map(SqlValue::Text),
        ScalarType::Bytes => row.try_get::<_, Option<Vec<u8>>>(idx)?.map(SqlValue::Bytes),
        ScalarType::Uuid => row.try_get::<_, Option<uuid::Uuid>>(idx)?.map(SqlValue::Uuid),
        ScalarType::Decimal => row
            .try_get::<_, Option<rust_decimal::Decimal>>(idx)?
            .map(SqlValue::Decimal),
        ScalarType::DateTime => row
            .try_get::<_, Option<chrono::NaiveDateTime>>(idx)?
            .map(SqlValue::DateTime),
        ScalarType::DateTimeOffset => row
            .try_get::<_, Option<chrono::DateTime<chrono::FixedOffset>>>(idx)?
            .map(SqlValue::DateTimeOffset),
        ScalarType::Date => row
            .try_get::<_, Option<chrono::NaiveDate>>(idx)?
            .map(SqlValue::Date),
        ScalarType::Time => row
            .try_get::<_, Option<chrono::NaiveTime>>(idx)?
            .map(SqlValue::Time),
    };
    Ok(value.unwrap_or(SqlValue::Null(ty)))
}

/// Map SQLSTATE class 23 to a constraint violation and serialization
/// failures to a conflict. Anything else is reported for `role`.
fn classify(role: StoreRole, table: &str, e: tokio_postgres::Error) -> MigrateError {
    let Some(db) = e.as_db_error() else {
        return role.error(e);
    };
    let code = db.code().code();
    if code.starts_with("23") {
        let message = match db.constraint() {
            Some(name) => format!("{} ({}) [{}]", db.message(), name, code),
            None => format!("{} [{}]", db.message(), code),
        };
        MigrateError::constraint(table, message)
    } else if code == "40001" {
        MigrateError::conflict(table, db.message().to_string())
    } else {
        role.error(e)
    }
}
