//! Logly agent binary.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use logly::config::LoglyConfig;
use logly::scheduler::Scheduler;
use logly::store::{metadata, Store};

#[derive(Parser)]
#[command(name = "logly", version, about = "Single-host metrics and log intelligence agent")]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "/etc/logly/logly.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the agent until interrupted.
    Run,
    /// Create or migrate the database, then exit.
    InitDb,
    /// Print row counts and engine checkpoints.
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("LOGLY_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = LoglyConfig::load(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;

    match cli.command {
        Command::Run => run(config).await,
        Command::InitDb => init_db(config),
        Command::Stats => stats(config),
    }
}

async fn run(config: LoglyConfig) -> Result<()> {
    let db_path = config.database.path.clone();
    let store = Arc::new(
        Store::open(&db_path)
            .with_context(|| format!("failed to open database at {}", db_path.display()))?,
    );
    tracing::info!(database = %db_path.display(), "logly agent starting");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = Scheduler::new(config, store);
    let run = tokio::spawn(scheduler.run(shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
    run.await.context("scheduler task panicked")??;
    Ok(())
}

fn init_db(config: LoglyConfig) -> Result<()> {
    let store = Store::open(&config.database.path)?;
    let version = store
        .with_retry(|conn| metadata::get(conn, "schema_version"))?
        .unwrap_or_default();
    println!(
        "database ready at {} (schema {version})",
        config.database.path.display()
    );
    Ok(())
}

fn stats(config: LoglyConfig) -> Result<()> {
    let store = Store::open(&config.database.path)?;
    let tables = [
        "system_metrics",
        "network_metrics",
        "log_events",
        "event_traces",
        "process_traces",
        "network_traces",
        "error_traces",
        "ip_reputation",
        "trace_patterns",
        "hourly_aggregates",
        "daily_aggregates",
    ];
    println!("database: {}", config.database.path.display());
    for table in tables {
        let count: i64 = store.with_retry(|conn| {
            Ok(conn.query_row(&format!("SELECT count(*) FROM {table}"), [], |row| {
                row.get(0)
            })?)
        })?;
        println!("{table:>20}: {count}");
    }
    for task in ["correlation", "aggregation:hourly", "aggregation:daily", "retention"] {
        let last = store
            .with_retry(|conn| metadata::get(conn, &format!("last_run:{task}")))?
            .unwrap_or_else(|| "never".to_string());
        println!("{:>20}: {last}", format!("last {task}"));
    }
    Ok(())
}
