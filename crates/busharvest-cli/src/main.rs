use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use busharvest_storage::FsSnapshotSink;
use busharvest_sync::{
    build_scheduler, invoke, invoke_pipeline, migrate, RunOutcome, SyncConfig, SyncPipeline,
};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "busharvest")]
#[command(about = "Bus listing harvester: crawl, reconcile, export")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one crawl-and-reconcile pass and print the run outcome as JSON.
    Run {
        /// Write the snapshot under this directory instead of the S3 bucket.
        #[arg(long)]
        snapshot_dir: Option<PathBuf>,
    },
    /// Apply database migrations.
    Migrate,
    /// Run on the configured cron schedule until interrupted.
    Schedule,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(snapshot_dir: Option<PathBuf>) -> RunOutcome {
    let config = match SyncConfig::from_env() {
        Ok(config) => config,
        Err(err) => return RunOutcome::failure(err),
    };
    let Some(dir) = snapshot_dir else {
        return invoke(config).await;
    };

    match SyncPipeline::from_config(&config).await {
        Ok(pipeline) => {
            // Same wiring as `invoke`, with the snapshot redirected to disk.
            let pipeline = pipeline.with_snapshot_sink(Arc::new(FsSnapshotSink::new(dir)));
            invoke_pipeline(Arc::new(pipeline)).await
        }
        Err(err) => RunOutcome::failure(format!("{err:#}")),
    }
}

async fn schedule() -> Result<()> {
    let config = SyncConfig::from_env()?;
    info!(cron = %config.sync_cron, "starting scheduler");
    let mut sched = build_scheduler(config).await?;
    sched.start().await.context("starting scheduler")?;
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutting down scheduler");
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_logging();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run { snapshot_dir: None }) {
        Commands::Run { snapshot_dir } => {
            let outcome = run(snapshot_dir).await;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if !outcome.is_success() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env()?;
            migrate(&config).await?;
        }
        Commands::Schedule => schedule().await?,
    }

    Ok(ExitCode::SUCCESS)
}
