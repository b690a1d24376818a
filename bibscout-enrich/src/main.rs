//! bibscout-enrich - batch enrichment runner
//!
//! Reads an id list, runs the enrichment pipeline against the configured
//! catalog search and detail API, and prints the run summary as JSON.

use anyhow::{Context, Result};
use bibscout_common::config::{resolve_database_path, PipelineConfig};
use bibscout_common::events::EventBus;
use bibscout_enrich::models::RunOptions;
use bibscout_enrich::services::{PipelineOrchestrator, StdinPrompt};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for bibscout-enrich
#[derive(Parser, Debug)]
#[command(name = "bibscout-enrich")]
#[command(about = "Resumable catalog record enrichment")]
#[command(version)]
struct Args {
    /// Input list: `id,secondary_key[,title[,classification]]` per line
    #[arg(short, long)]
    input: PathBuf,

    /// SQLite database file
    #[arg(long, env = "BIBSCOUT_DB")]
    db: Option<PathBuf>,

    /// TOML configuration file
    #[arg(short, long, env = "BIBSCOUT_CONFIG")]
    config: Option<PathBuf>,

    /// Do not classify stored records
    #[arg(long)]
    skip_dedup: bool,

    /// Do not resolve links
    #[arg(long)]
    skip_links: bool,

    /// Do not fetch detail
    #[arg(long)]
    skip_detail: bool,

    /// Trust the batch checkpoint instead of re-classifying
    #[arg(long)]
    light_resume: bool,

    /// Always run full classification
    #[arg(long)]
    force: bool,

    /// Reset every record in the batch and resolve again
    #[arg(long)]
    refresh: bool,

    /// Classify and filter only: no network calls, no writes
    #[arg(long)]
    dry_run: bool,

    /// Ask before fetching detail
    #[arg(long)]
    interactive: bool,
}

impl Args {
    fn run_options(&self) -> RunOptions {
        RunOptions {
            skip_dedup: self.skip_dedup,
            skip_links: self.skip_links,
            skip_detail: self.skip_detail,
            light_resume: self.light_resume,
            force: self.force,
            refresh: self.refresh,
            dry_run: self.dry_run,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = PipelineConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    info!(
        "Starting bibscout-enrich {} ({}, {})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_PROFILE")
    );

    let inputs = bibscout_enrich::input::read_input_file(&args.input)
        .with_context(|| format!("Failed to read input {}", args.input.display()))?;

    let db_path = resolve_database_path(args.db.as_deref(), &config);
    info!("Database: {}", db_path.display());
    let db_pool = bibscout_enrich::db::init_database_pool(&db_path).await?;

    let event_bus = EventBus::default();
    let mut orchestrator = PipelineOrchestrator::from_config(db_pool, config, event_bus)?;
    if args.interactive {
        orchestrator = orchestrator.with_continuation(Arc::new(StdinPrompt));
    }

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, cancelling run");
            signal_cancel.cancel();
        }
    });

    let summary = orchestrator.run(inputs, args.run_options(), cancel).await?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
