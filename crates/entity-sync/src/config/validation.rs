//! Configuration validation.

use super::Config;
use crate::drivers::tls::SslMode;
use crate::error::{MigrateError, Result};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    // Source validation
    if config.source.host.is_empty() {
        return Err(MigrateError::Config("source.host is required".into()));
    }
    if config.source.database.is_empty() {
        return Err(MigrateError::Config("source.database is required".into()));
    }
    if config.source.user.is_empty() {
        return Err(MigrateError::Config("source.user is required".into()));
    }
    match config.source.r#type.as_str() {
        "mssql" => {}
        "postgres" => {
            SslMode::parse(&config.source.ssl_mode)?;
        }
        other => {
            return Err(MigrateError::Config(format!(
                "source.type must be 'mssql' or 'postgres', got '{}'",
                other
            )))
        }
    }

    // Target validation
    if config.target.host.is_empty() {
        return Err(MigrateError::Config("target.host is required".into()));
    }
    if config.target.database.is_empty() {
        return Err(MigrateError::Config("target.database is required".into()));
    }
    if config.target.user.is_empty() {
        return Err(MigrateError::Config("target.user is required".into()));
    }
    if config.target.r#type != "postgres" {
        return Err(MigrateError::Config(format!(
            "target.type must be 'postgres', got '{}'",
            config.target.r#type
        )));
    }
    SslMode::parse(&config.target.ssl_mode)?;

    // Cannot migrate to the same database
    if config.source.host == config.target.host
        && config.source.port() == config.target.port
        && config.source.database == config.target.database
    {
        return Err(MigrateError::Config(
            "source and target cannot be the same database".into(),
        ));
    }

    if config.migration.max_source_connections == 0 {
        return Err(MigrateError::Config(
            "migration.max_source_connections must be at least 1".into(),
        ));
    }
    if config.migration.max_target_connections == 0 {
        return Err(MigrateError::Config(
            "migration.max_target_connections must be at least 1".into(),
        ));
    }
    if config.migration.fetch_batch_size == 0 {
        return Err(MigrateError::Config(
            "migration.fetch_batch_size must be at least 1".into(),
        ));
    }

    // Schema and migration list
    let schema = config.schema()?;
    for (i, entry) in config.migrations.iter().enumerate() {
        if !schema.contains(&entry.record_type) {
            return Err(MigrateError::Config(format!(
                "migrations[{}]: unknown record type '{}'",
                i, entry.record_type
            )));
        }
        let tables = [&entry.source_table, &entry.target_table];
        if tables.iter().any(|t| t.as_deref() == Some("")) {
            return Err(MigrateError::Config(format!(
                "migrations[{}]: table names cannot be empty",
                i
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MigrationConfig, MigrationEntry, SourceConfig, TargetConfig};
    use crate::core::{RecordType, ScalarType};

    fn valid_config() -> Config {
        Config {
            source: SourceConfig {
                r#type: "mssql".to_string(),
                host: "legacy".to_string(),
                port: None,
                database: "source_db".to_string(),
                user: "sa".to_string(),
                password: "password".to_string(),
                schema: None,
                encrypt: false,
                trust_server_cert: true,
                ssl_mode: "require".to_string(),
            },
            target: TargetConfig {
                r#type: "postgres".to_string(),
                host: "localhost".to_string(),
                port: 5432,
                database: "target_db".to_string(),
                user: "postgres".to_string(),
                password: "password".to_string(),
                schema: "public".to_string(),
                ssl_mode: "disable".to_string(),
            },
            migration: MigrationConfig::default(),
            record_types: vec![RecordType::new("Item")
                .with_field("id", ScalarType::I32)
                .with_primary_key(&["id"])],
            migrations: vec![MigrationEntry {
                record_type: "Item".to_string(),
                source_table: None,
                target_table: None,
            }],
        }
    }

    #[test]
    fn test_valid_config() {
        let config = valid_config();
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_missing_source_host() {
        let mut config = valid_config();
        config.source.host = "".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_postgres_source_is_accepted() {
        let mut config = valid_config();
        config.source.r#type = "postgres".to_string();
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_wrong_source_type() {
        let mut config = valid_config();
        config.source.r#type = "oracle".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_wrong_target_type() {
        let mut config = valid_config();
        config.target.r#type = "mssql".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_invalid_ssl_mode() {
        let mut config = valid_config();
        config.target.ssl_mode = "sometimes".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_same_database_rejected() {
        let mut config = valid_config();
        config.source.r#type = "postgres".to_string();
        config.source.host = "localhost".to_string();
        config.source.database = "target_db".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_zero_batch_size() {
        let mut config = valid_config();
        config.migration.fetch_batch_size = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_unknown_migration_type() {
        let mut config = valid_config();
        config.migrations[0].record_type = "Ghost".to_string();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("Ghost"));
    }

    #[test]
    fn test_invalid_schema() {
        let mut config = valid_config();
        config.record_types[0].primary_key = vec!["missing".to_string()];
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_empty_migration_list_is_valid() {
        let mut config = valid_config();
        config.migrations.clear();
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_source_config_debug_redacts_password() {
        let mut config = valid_config();
        config.source.password = "super_secret_password_123".to_string();
        let debug_output = format!("{:?}", config.source);
        assert!(
            debug_output.contains("[REDACTED]"),
            "Debug output should contain [REDACTED]"
        );
        assert!(
            !debug_output.contains("super_secret_password_123"),
            "Debug output should not contain actual password value"
        );
    }

    #[test]
    fn test_target_config_debug_redacts_password() {
        let mut config = valid_config();
        config.target.password = "super_secret_password_456".to_string();
        let debug_output = format!("{:?}", config.target);
        assert!(
            debug_output.contains("[REDACTED]"),
            "Debug output should contain [REDACTED]"
        );
        assert!(
            !debug_output.contains("super_secret_password_456"),
            "Debug output should not contain actual password value"
        );
    }
}
