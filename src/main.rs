//! Microclimate - Urban Micro-Climate Monitor
//!
//! A CLI tool that fetches snapshots from public webcams, estimates
//! sun exposure and wetness with deterministic pixel heuristics, and
//! serves the latest per-location signal and a city-wide aggregate
//! from a TTL cache. Each cycle's full result set is persisted as a
//! durable JSON batch.
//!
//! Exit codes:
//!   0 - Success
//!   1 - Runtime error (config, persistence, etc.)

mod analyzer;
mod cache;
mod cli;
mod config;
mod error;
mod fetcher;
mod models;
mod pipeline;
mod storage;

use anyhow::{Context, Result};
use cli::Args;
use config::Config;
use models::RunMode;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse_args();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Handle --init-config early (no logging needed)
    if args.init_config {
        return handle_init_config();
    }

    // Initialize logging
    init_logging(&args);

    info!("Microclimate v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args);

    match run(args).await {
        Ok(()) => Ok(()),
        Err(e) => {
            error!("Monitor failed: {:#}", e);
            eprintln!("\nError: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Handle --init-config: generate a default .microclimate.toml.
fn handle_init_config() -> Result<()> {
    let path = Path::new(".microclimate.toml");

    if path.exists() {
        eprintln!(".microclimate.toml already exists. Remove it first or edit it manually.");
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content).context("Failed to write .microclimate.toml")?;

    println!("Created .microclimate.toml with default settings.");
    println!("Edit it to register locations and tune fetcher/analyzer/cache settings.");
    Ok(())
}

/// Initialize logging based on verbosity settings.
fn init_logging(args: &Args) {
    let level = args.log_level();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

/// Build the pipeline from config and run it in the requested mode.
async fn run(args: Args) -> Result<()> {
    let mut config = load_config(&args)?;
    config.merge_with_args(&args);

    config
        .analyzer
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid analyzer configuration: {}", e))?;

    let locations = config.effective_locations();
    info!("Registered {} monitored locations", locations.len());

    // Handle --dry-run: show the location registry and exit.
    if args.dry_run {
        println!("\nDry run: {} configured locations:\n", locations.len());
        for location in &locations {
            println!("  {} - {} ({})", location.id, location.name, location.url);
        }
        println!("\nDry run complete. No snapshots were fetched.");
        return Ok(());
    }

    let data_dir = PathBuf::from(&config.general.data_dir);
    let assets = storage::AssetStore::new(data_dir.join("webcam_images"))
        .context("Failed to create images directory")?;
    let batches = storage::BatchWriter::new(data_dir.join("analysis_results"))
        .context("Failed to create results directory")?;

    let transport = Arc::new(fetcher::HttpTransport::new(config.fetcher.timeout_seconds)?);
    let fetch = fetcher::Fetcher::new(transport, assets, &config.fetcher);

    let cache = cache::ClimateCache::new(
        Arc::new(cache::MemoryTtlStore::new()),
        Duration::from_secs(config.cache.ttl_seconds),
    );

    let pipeline = Arc::new(pipeline::Pipeline::new(
        locations,
        fetch,
        config.analyzer.clone(),
        cache,
        batches,
    ));

    if args.once {
        let report = pipeline.run_cycle(RunMode::Single).await?;
        print_cycle_summary(&report);
        return Ok(());
    }

    // Continuous mode: cancel at the cycle boundary on Ctrl-C.
    let interval = Duration::from_secs(config.pipeline.interval_seconds);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested; stopping after the current cycle");
            let _ = shutdown_tx.send(true);
        }
    });

    let mut scheduler = pipeline::Scheduler::new(pipeline, interval, shutdown_rx);
    scheduler.run().await;

    Ok(())
}

/// Print a human-readable summary of one cycle.
fn print_cycle_summary(report: &pipeline::CycleReport) {
    println!("\nCycle summary:");
    println!("   Locations analyzed: {}", report.records.len());
    println!("   Fetch failures: {}", report.failed_fetches);
    println!(
        "   Average sun exposure: {:.1}%",
        report.stats.avg_sun_exposure * 100.0
    );
    println!(
        "   Average wetness: {:.1}% ({} wet locations)",
        report.stats.avg_wetness * 100.0,
        report.stats.wet_location_count
    );
    println!("\nResults saved to: {}", report.batch_path.display());
}

/// Load configuration from file or use defaults.
fn load_config(args: &Args) -> Result<Config> {
    // Try explicit config path
    if let Some(ref config_path) = args.config {
        info!("Loading config from: {}", config_path.display());
        return Config::load(config_path);
    }

    // Try default location
    match Config::load_default() {
        Ok(Some(config)) => {
            info!("Loaded default config from .microclimate.toml");
            Ok(config)
        }
        Ok(None) => {
            debug!("No config file found, using defaults");
            Ok(Config::default())
        }
        Err(e) => {
            warn!("Failed to load config: {}", e);
            Ok(Config::default())
        }
    }
}
