//! SQL Server source adapter.
//!
//! Read-only: SQL Server is supported as a migration source. Connections are
//! pooled with bb8 over tiberius.

use std::time::Duration;

use async_trait::async_trait;
use bb8::{Pool, PooledConnection};
use tiberius::{AuthMethod, Client, Config, EncryptionLevel, Row};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info, warn};

use crate::config::SourceConfig;
use crate::core::{Record, RecordKey, RecordType, ScalarType, SqlValue};
use crate::error::{MigrateError, Result};
use crate::store::SourceStore;

/// Connection acquisition timeout from pool.
const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection manager for bb8 pool with Tiberius.
#[derive(Clone)]
struct TiberiusConnectionManager {
    config: SourceConfig,
}

impl TiberiusConnectionManager {
    fn build_config(&self) -> Config {
        let mut config = Config::new();
        config.host(&self.config.host);
        config.port(self.config.port());
        config.database(&self.config.database);
        config.authentication(AuthMethod::sql_server(
            &self.config.user,
            &self.config.password,
        ));

        if self.config.encrypt {
            if self.config.trust_server_cert {
                config.trust_cert();
            }
            config.encryption(EncryptionLevel::Required);
        } else {
            warn!("SQL Server encryption is disabled. Credentials will be transmitted in plaintext.");
            config.encryption(EncryptionLevel::NotSupported);
        }
        config
    }
}

#[async_trait]
impl bb8::ManageConnection for TiberiusConnectionManager {
    type Connection = Client<Compat<TcpStream>>;
    type Error = tiberius::error::Error;

    async fn connect(&self) -> std::result::Result<Self::Connection, Self::Error> {
        let config = self.build_config();
        let tcp = TcpStream::connect(config.get_addr()).await.map_err(|e| {
            tiberius::error::Error::Io {
                kind: e.kind(),
                message: e.to_string(),
            }
        })?;
        tcp.set_nodelay(true).ok();
        Client::connect(config, tcp.compat_write()).await
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> std::result::Result<(), Self::Error> {
        conn.simple_query("SELECT 1").await?.into_row().await?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

/// Pooled SQL Server source.
pub struct MssqlStore {
    pool: Pool<TiberiusConnectionManager>,
    schema: String,
    fetch_batch_size: usize,
}

impl MssqlStore {
    /// Build the pool and verify it with a test query.
    pub async fn connect(config: &SourceConfig, max_size: u32, fetch_batch_size: usize) -> Result<Self> {
        let manager = TiberiusConnectionManager {
            config: config.clone(),
        };
        let pool = Pool::builder()
            .max_size(max_size.max(1))
            .connection_timeout(POOL_CONNECTION_TIMEOUT)
            .build(manager)
            .await
            .map_err(|e| MigrateError::pool(e, "creating MSSQL connection pool"))?;

        // Test connection
        {
            let mut conn = pool
                .get()
                .await
                .map_err(|e| MigrateError::pool(e, "testing MSSQL connection"))?;
            conn.simple_query("SELECT 1").await?.into_row().await?;
        }

        info!(
            "Connected to MSSQL: {}:{}/{} (pool_size={})",
            config.host,
            config.port(),
            config.database,
            max_size
        );

        Ok(Self {
            pool,
            schema: config.schema_name().to_string(),
            fetch_batch_size: fetch_batch_size.max(1),
        })
    }

    async fn get_client(&self) -> Result<PooledConnection<'_, TiberiusConnectionManager>> {
        self.pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e, "getting MSSQL connection from pool"))
    }

    async fn query_records(&self, rt: &RecordType, sql: &str) -> Result<Vec<Record>> {
        let mut conn = self.get_client().await?;
        let rows = conn.simple_query(sql).await?.into_first_result().await?;
        rows.iter().map(|row| decode_row(row, rt)).collect()
    }
}

#[async_trait]
impl SourceStore for MssqlStore {
    async fn fetch_all(&self, record_type: &RecordType, table: &str) -> Result<Vec<Record>> {
        let sql = build_select(&self.schema, record_type, table, None);
        let records = self.query_records(record_type, &sql).await?;
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
            records.extend(self.query_records(record_type, &sql).await?);
        }
        Ok(records)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.get_client().await?;
        conn.simple_query("SELECT 1").await?.into_row().await?;
        Ok(())
    }

    fn store_type(&self) -> &str {
        "mssql"
    }

    async fn close(&self) {
        // bb8 drops idle connections with the pool.
        debug!("Closing MSSQL pool");
    }
}

fn quote_ident(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

fn qualify(default_schema: &str, table: &str) -> String {
    match table.split_once('.') {
        Some((schema, name)) => format!("{}.{}", quote_ident(schema), quote_ident(name)),
        None => format!("{}.{}", quote_ident(default_schema), quote_ident(table)),
    }
}

/// Column expression normalized to the tiberius type `ty` decodes as.
fn select_expr(name: &str, ty: ScalarType) -> String {
    let col = quote_ident(name);
    let target = match ty {
        ScalarType::Bool => "BIT",
        ScalarType::I16 => "SMALLINT",
        ScalarType::I32 => "INT",
        ScalarType::I64 => "BIGINT",
        ScalarType::F32 => "REAL",
        ScalarType::F64 => "FLOAT",
        ScalarType::Text => "NVARCHAR(MAX)",
        ScalarType::Bytes => "VARBINARY(MAX)",
        ScalarType::Uuid => "UNIQUEIDENTIFIER",
        // Keep the declared precision and scale.
        ScalarType::Decimal => return col,
        ScalarType::DateTime => "DATETIME2",
        ScalarType::DateTimeOffset => "DATETIMEOFFSET",
        ScalarType::Date => "DATE",
        ScalarType::Time => "TIME",
    };
    format!("CAST({} AS {}) AS {}", col, target, col)
}

fn build_select(schema: &str, rt: &RecordType, table: &str, predicate: Option<&str>) -> String {
    let columns: Vec<String> = rt.fields.iter().map(|f| select_expr(&f.name, f.ty)).collect();
    let order: Vec<String> = rt.primary_key.iter().map(|c| quote_ident(c)).collect();

    let mut sql = format!(
        "SELECT {} FROM {}",
        columns.join(", "),
        qualify(schema, table)
    );
    if let Some(predicate) = predicate {
        sql.push_str(" WHERE ");
        sql.push_str(predicate);
    }
    sql.push_str(" ORDER BY ");
    sql.push_str(&order.join(", "));
    sql
}

/// `[id] IN (1, 2)` for single columns, `([a] = 1 AND [b] = N'x') OR ...`
/// for composite ones.
fn key_predicate(columns: &[String], keys: &[RecordKey]) -> String {
    if keys.is_empty() {
        return "1 = 0".to_string();
    }
    if let [column] = columns {
        let values: Vec<String> = keys
            .iter()
            .filter_map(|k| k.parts().first())
            .map(|p| p.to_mssql_literal())
            .collect();
        return format!("{} IN ({})", quote_ident(column), values.join(", "));
    }

    let disjuncts: Vec<String> = keys
        .iter()
        .map(|key| {
            let conjuncts: Vec<String> = columns
                .iter()
                .zip(key.parts())
                .map(|(c, p)| format!("{} = {}", quote_ident(c), p.to_mssql_literal()))
                .collect();
            format!("({})", conjuncts.join(" AND "))
        })
        .collect();
    disjuncts.join(" OR ")
}

fn decode_row(row: &Row, rt: &RecordType) -> Result<Record> {
    let mut record = Record::new();
    for (idx, field) in rt.fields.iter().enumerate() {
        let value = decode_value(row, idx, field.ty)?;
        record.values.insert(field.name.clone(), value);
    }
    Ok(record)
}

fn decode_value(row: &Row, idx: usize, ty: ScalarType) -> Result<SqlValue> {
    let value = match ty {
        ScalarType::Bool => row.try_get::<bool, _>(idx)?.map(SqlValue::Bool),
        ScalarType::I16 => row.try_get::<i16, _>(idx)?.map(SqlValue::I16),
        ScalarType::I32 => row.try_get::<i32, _>(idx)?.map(SqlValue::I32),
        ScalarType::I64 => row.try_get::<i64, _>(idx)?.map(SqlValue::I64),
        ScalarType::F32 => row.try_get::<f32, _>(idx)?.map(SqlValue::F32),
        ScalarType::F64 => row.try_get::<f64, _>(idx)?.map(SqlValue::F64),
        ScalarType::Text => row
            .try_get::<&str, _>(idx)?
            .map(|s| SqlValue::Text(s.to_string())),
        ScalarType::Bytes => row
            .try_get::<&[u8], _>(idx)?
            .map(|b| SqlValue::Bytes(b.to_vec())),
        ScalarType::Uuid => row.try_get::<uuid::Uuid, _>(idx)?.map(SqlValue::Uuid),
        ScalarType::Decimal => row
            .try_get::<rust_decimal::Decimal, _>(idx)?
            .map(SqlValue::Decimal),
        ScalarType::DateTime => row
            .try_get::<chrono::NaiveDateTime, _>(idx)?
            .map(SqlValue::DateTime),
        ScalarType::DateTimeOffset => row
            .try_get::<chrono::DateTime<chrono::FixedOffset>, _>(idx)?
            .map(SqlValue::DateTimeOffset),
        ScalarType::Date => row
            .try_get::<chrono::NaiveDate, _>(idx)?
            .map(SqlValue::Date),
        ScalarType::Time => row
            .try_get::<chrono::NaiveTime, _>(idx)?
            .map(SqlValue::Time),
    };
    Ok(value.unwrap_or(SqlValue::Null(ty)))
}
