//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation and default values.

use clap::Parser;
use std::path::PathBuf;

/// Microclimate - urban micro-climate monitor
///
/// Estimates sun exposure and wetness for a set of monitored webcam
/// locations from periodic snapshots, caches the latest per-location
/// signal, and persists one result batch per cycle.
///
/// Examples:
///   microclimate --once
///   microclimate --interval 300
///   microclimate --config ./city.toml --data-dir ./var
///   microclimate --dry-run
///   microclimate --init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// Run exactly one pipeline cycle, then exit
    #[arg(long, conflicts_with = "interval")]
    pub once: bool,

    /// Run continuously with this many seconds between cycles
    ///
    /// If neither --once nor --interval is given, the interval from the
    /// config file is used (default 300s).
    #[arg(short, long, value_name = "SECS", env = "MICROCLIMATE_INTERVAL")]
    pub interval: Option<u64>,

    /// Root directory for images and result batches
    #[arg(long, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// Cache TTL in seconds for per-location results and city stats
    #[arg(long, value_name = "SECS")]
    pub cache_ttl: Option<u64>,

    /// Per-attempt fetch timeout in seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Total fetch attempts per location (first try included)
    #[arg(long, value_name = "COUNT")]
    pub max_retries: Option<u32>,

    /// Path to configuration file
    ///
    /// If not specified, looks for .microclimate.toml in the current directory
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging output
    #[arg(short, long)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(short, long)]
    pub quiet: bool,

    /// Dry run: list the configured locations without fetching anything
    #[arg(long)]
    pub dry_run: bool,

    /// Generate a default .microclimate.toml configuration file
    #[arg(long)]
    pub init_config: bool,
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        // Skip validation for --init-config
        if self.init_config {
            return Ok(());
        }

        if let Some(interval) = self.interval {
            if interval == 0 {
                return Err("Interval must be at least 1 second".to_string());
            }
        }

        if let Some(timeout) = self.timeout {
            if timeout == 0 {
                return Err("Timeout must be at least 1 second".to_string());
            }
        }

        if let Some(max_retries) = self.max_retries {
            if max_retries == 0 {
                return Err("Max retries must be at least 1".to_string());
            }
        }

        if let Some(ttl) = self.cache_ttl {
            if ttl == 0 {
                return Err("Cache TTL must be at least 1 second".to_string());
            }
        }

        // Check for conflicting options
        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        Ok(())
    }

    /// Returns the log level based on verbosity settings.
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}
