use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use crs_adapters::HttpSheetApi;
use crs_storage::PgStore;
use crs_sync::{maybe_build_scheduler, sheet_api_config, ReconcilePipeline, SyncConfig};

#[derive(Debug, Parser)]
#[command(name = "crs-cli")]
#[command(about = "Curriculum reconciliation command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one reconciliation pass from the sheet into the store.
    Reconcile,
    /// Run the push-back service, plus the cron scheduler when enabled.
    Watch,
    /// Apply the SQL migrations.
    Migrate,
    /// Probe store connectivity.
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Reconcile) {
        Commands::Reconcile => {
            let summary = crs_sync::run_reconcile_once_from_env().await?;
            println!(
                "reconcile complete: run_id={} rows={} versions_created={} versions_skipped={}",
                summary.run_id,
                summary.rows_fetched,
                summary.versions_created,
                summary.versions_skipped
            );
        }
        Commands::Watch => {
            let config = SyncConfig::from_env();
            let source = HttpSheetApi::new(sheet_api_config(&config))?;
            let store = Arc::new(PgStore::connect(&config.database_url).await?);
            let pipeline = Arc::new(
                ReconcilePipeline::new(Arc::new(source), store)
                    .with_reports_dir(config.reports_dir.clone()),
            );
            if let Some(sched) = maybe_build_scheduler(&config, pipeline).await? {
                sched.start().await?;
                println!("scheduled reconciliation enabled: {}", config.sync_cron);
            }
            tokio::select! {
                result = crs_sync::run_pushback_from_env() => result?,
                _ = tokio::signal::ctrl_c() => {
                    println!("stopping watch");
                }
            }
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let store = PgStore::connect(&config.database_url).await?;
            store.run_migrations().await?;
            println!("migrations applied");
        }
        Commands::Check => {
            let config = SyncConfig::from_env();
            let store = PgStore::connect(&config.database_url).await?;
            let clients = store.count_clients().await?;
            println!("store reachable: {clients} clients");
            for programme in store.list_programmes(10).await? {
                println!(
                    "  programme {} ({})",
                    programme.programme_name, programme.programme_type
                );
            }
        }
    }

    Ok(())
}
