use std::sync::Arc;
use std::time::Duration;

use allgigs_store::{BackoffPolicy, RestStore, RestStoreConfig};
use allgigs_sync::{maybe_build_scheduler, PublishOutcome, SyncConfig, SyncPipeline};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "allgigs-cli")]
#[command(about = "allGigs aggregation engine command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one aggregation + publish cycle and exit.
    Run,
    /// Start the cron scheduler and run until interrupted.
    Schedule,
    /// Print the effective configuration and exit.
    Config,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_pipeline(config: SyncConfig) -> Result<Arc<SyncPipeline>> {
    if config.api_key.is_empty() {
        bail!("ALLGIGS_SERVICE_ROLE_KEY is not set");
    }
    let store = RestStore::new(RestStoreConfig {
        base_url: config.store_url.clone(),
        api_key: config.api_key.clone(),
        timeout: Duration::from_secs(config.http_timeout_secs),
        backoff: BackoffPolicy::default(),
    })
    .context("building row store")?;
    let pipeline = SyncPipeline::new(config, Arc::new(store)).context("building pipeline")?;
    Ok(Arc::new(pipeline))
}

fn print_summary(summary: &allgigs_sync::RunSummary) {
    println!(
        "run complete: run_id={} sources={} records={} snapshot={}",
        summary.run_id,
        summary.sources.len(),
        summary.total_records,
        summary.snapshot.snapshot_path.display()
    );
    match &summary.publish {
        PublishOutcome::Published { live, historical } => {
            println!("published: live={live:?} historical={historical:?}");
        }
        PublishOutcome::Refused { reason } => {
            println!("publish refused: {reason}");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let pipeline = build_pipeline(config)?;
            let summary = pipeline.run_once().await?;
            print_summary(&summary);
        }
        Commands::Schedule => {
            let mut config = config;
            config.scheduler_enabled = true;
            let pipeline = build_pipeline(config)?;
            let scheduler = maybe_build_scheduler(Arc::clone(&pipeline))
                .await?
                .context("scheduler was not built")?;
            scheduler.start().await.context("starting scheduler")?;
            info!(cron = %pipeline.config().sync_cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            info!("shutting down");
        }
        Commands::Config => {
            println!("store_url          = {}", config.store_url);
            println!("live_table         = {}", config.live_table);
            println!("historical_table   = {}", config.historical_table);
            println!("workspace_root     = {}", config.workspace_root.display());
            println!("output_dir         = {}", config.output_dir.display());
            println!("scheduler_enabled  = {}", config.scheduler_enabled);
            println!("sync_cron          = {}", config.sync_cron);
            println!("page_size          = {}", config.page_size);
            println!("upsert_batch_size  = {}", config.upsert_batch_size);
        }
    }

    Ok(())
}
