//! entity-sync CLI - record-level synchronization between relational stores.

use clap::{Parser, Subcommand};
use entity_sync::{
    CommitPolicy, Config, EntityMigrator, MigrateError, Orchestrator, RelationResolver,
};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Parser)]
#[command(name = "entity-sync")]
#[command(about = "Primary-key reconciling record synchronization between relational stores")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured migrations in order
    Run {
        /// Dry run: stage every change and commit nothing
        #[arg(long)]
        dry_run: bool,

        /// Override commit policy: per-record-type or per-run
        #[arg(long)]
        commit_policy: Option<String>,
    },

    /// Show registrations and their eager-load plans without connecting
    Plan,

    /// Test database connections
    HealthCheck,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), MigrateError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format)
        .map_err(|e| MigrateError::Config(e.to_string()))?;

    let mut config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    match cli.command {
        Commands::Run {
            dry_run,
            commit_policy,
        } => {
            if dry_run {
                config.migration.dry_run = true;
            }
            if let Some(policy) = commit_policy {
                config.migration.commit_policy = policy.parse::<CommitPolicy>()?;
            }

            let orchestrator = Orchestrator::from_config(&config).await?;
            let result = orchestrator.run_all().await?;

            if cli.output_json {
                println!("{}", result.to_json()?);
            } else {
                let status_msg = if result.dry_run {
                    "Dry run completed!"
                } else {
                    "Migration completed!"
                };
                println!("\n{}", status_msg);
                println!("  Run ID: {}", result.run_id);
                println!("  Duration: {:.2}s", result.duration_seconds);
                println!("  Commit policy: {}", result.commit_policy);
                println!("  Record types: {}", result.record_types_total);
                println!("  Rows saved: {}", result.rows_saved);
                for r in &result.results {
                    if r.skipped {
                        println!("    {}: skipped (destination already populated)", r.record_type);
                    } else {
                        println!(
                            "    {}: {} inserted, {} updated, {} unchanged",
                            r.record_type, r.inserted, r.updated, r.unchanged
                        );
                    }
                }
            }
        }

        Commands::Plan => print_plan(&config, cli.output_json)?,

        Commands::HealthCheck => {
            let orchestrator = Orchestrator::from_config(&config).await?;
            let result = orchestrator.health_check().await;
            orchestrator.close().await;
            let result = result?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("Health Check Results:");
                println!(
                    "  Source ({}): {} ({}ms)",
                    store_label(&config.source.r#type),
                    if result.source_connected { "OK" } else { "FAILED" },
                    result.source_latency_ms
                );
                if let Some(ref err) = result.source_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "  Target (PostgreSQL): {} ({}ms)",
                    if result.target_connected { "OK" } else { "FAILED" },
                    result.target_latency_ms
                );
                if let Some(ref err) = result.target_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "\n  Overall: {}",
                    if result.healthy { "HEALTHY" } else { "UNHEALTHY" }
                );
            }

            if !result.healthy {
                return Err(MigrateError::Config("Health check failed".to_string()));
            }
        }
    }

    Ok(())
}

/// Print the configured migrations and what each one loads eagerly.
fn print_plan(config: &Config, as_json: bool) -> Result<(), MigrateError> {
    let schema = config.schema()?;
    let resolver = RelationResolver::new(&schema, config.migration.max_relation_depth);

    let mut entries = Vec::with_capacity(config.migrations.len());
    for entry in &config.migrations {
        let mut migrator = EntityMigrator::new(schema.get(&entry.record_type)?.clone());
        if let Some(ref table) = entry.source_table {
            migrator = migrator.with_source_table(table);
        }
        if let Some(ref table) = entry.target_table {
            migrator = migrator.with_target_table(table);
        }
        let plan = resolver.plan(migrator.record_type())?;
        entries.push((migrator, plan));
    }

    if as_json {
        let migrations: Vec<_> = entries
            .iter()
            .map(|(m, plan)| {
                serde_json::json!({
                    "record_type": m.name(),
                    "source_table": m.source_table(),
                    "target_table": m.target_table(),
                    "includes": plan.len(),
                    "depth": plan.depth(),
                })
            })
            .collect();
        let out = serde_json::json!({
            "commit_policy": config.migration.commit_policy,
            "mode": config.migration.mode,
            "migrations": migrations,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("No migration units configured.");
        return Ok(());
    }

    println!("Migration plan ({}):", config.migration.commit_policy);
    for (i, (m, plan)) in entries.iter().enumerate() {
        println!(
            "  {}. {} ({} -> {})",
            i + 1,
            m.name(),
            m.source_table(),
            m.target_table()
        );
        for line in plan.to_string().lines().skip(1) {
            println!("     {}", line);
        }
    }
    Ok(())
}

fn store_label(store_type: &str) -> &str {
    match store_type {
        "mssql" => "SQL Server",
        "postgres" => "PostgreSQL",
        other => other,
    }
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}
