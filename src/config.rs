//! Configuration file handling.
//!
//! This module handles loading and merging configuration from
//! `.microclimate.toml` files.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::models::Location;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Snapshot retrieval settings.
    #[serde(default)]
    pub fetcher: FetcherConfig,

    /// Image analysis settings.
    #[serde(default)]
    pub analyzer: AnalyzerConfig,

    /// Cache settings.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Pipeline scheduling settings.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Monitored locations. Falls back to the built-in demo set when empty.
    #[serde(default)]
    pub locations: Vec<Location>,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Root directory for images and result batches.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Enable verbose logging by default.
    #[serde(default)]
    pub verbose: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            verbose: false,
        }
    }
}

fn default_data_dir() -> String {
    "data".to_string()
}

/// Snapshot retrieval settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetcherConfig {
    /// Per-attempt request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Total attempts per location (first try included).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base backoff in milliseconds; attempt N waits N times this.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
        }
    }
}

fn default_timeout() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

/// Image analysis settings.
///
/// The four fusion weights must sum to 1.0; `validate` enforces this.
/// The pixel thresholds mirror the tuned values of the reference
/// detection heuristics and rarely need changing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    /// Fusion weight for the reflection indicator.
    #[serde(default = "default_reflection_weight")]
    pub reflection_weight: f64,

    /// Fusion weight for the dark-surface indicator.
    #[serde(default = "default_dark_surface_weight")]
    pub dark_surface_weight: f64,

    /// Fusion weight for the low-saturation indicator.
    #[serde(default = "default_low_saturation_weight")]
    pub low_saturation_weight: f64,

    /// Fusion weight for the edge-density indicator.
    #[serde(default = "default_edge_density_weight")]
    pub edge_density_weight: f64,

    /// Minimum HSV value for a pixel to count as a specular highlight.
    #[serde(default = "default_bright_value_min")]
    pub bright_value_min: u8,

    /// Maximum saturation for a pixel to count as a specular highlight.
    #[serde(default = "default_reflection_saturation_max")]
    pub reflection_saturation_max: u8,

    /// Luminance below this counts as dark surface.
    #[serde(default = "default_dark_luma_max")]
    pub dark_luma_max: u8,

    /// Saturation below this counts as desaturated.
    #[serde(default = "default_low_saturation_max")]
    pub low_saturation_max: u8,

    /// Gradient magnitude above this flags an edge pixel.
    #[serde(default = "default_edge_threshold")]
    pub edge_threshold: f64,

    /// Side length of the local neighborhood for adaptive thresholding (odd).
    #[serde(default = "default_adaptive_block_size")]
    pub adaptive_block_size: u32,

    /// Constant subtracted from the local mean in adaptive thresholding.
    #[serde(default = "default_adaptive_constant")]
    pub adaptive_constant: f64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            reflection_weight: default_reflection_weight(),
            dark_surface_weight: default_dark_surface_weight(),
            low_saturation_weight: default_low_saturation_weight(),
            edge_density_weight: default_edge_density_weight(),
            bright_value_min: default_bright_value_min(),
            reflection_saturation_max: default_reflection_saturation_max(),
            dark_luma_max: default_dark_luma_max(),
            low_saturation_max: default_low_saturation_max(),
            edge_threshold: default_edge_threshold(),
            adaptive_block_size: default_adaptive_block_size(),
            adaptive_constant: default_adaptive_constant(),
        }
    }
}

fn default_reflection_weight() -> f64 {
    0.35
}

fn default_dark_surface_weight() -> f64 {
    0.25
}

fn default_low_saturation_weight() -> f64 {
    0.20
}

fn default_edge_density_weight() -> f64 {
    0.20
}

fn default_bright_value_min() -> u8 {
    200
}

fn default_reflection_saturation_max() -> u8 {
    50
}

fn default_dark_luma_max() -> u8 {
    60
}

fn default_low_saturation_max() -> u8 {
    40
}

fn default_edge_threshold() -> f64 {
    150.0
}

fn default_adaptive_block_size() -> u32 {
    11
}

fn default_adaptive_constant() -> f64 {
    2.0
}

impl AnalyzerConfig {
    /// Checks that the fusion weights form a valid convex combination.
    pub fn validate(&self) -> Result<(), String> {
        let weights = [
            self.reflection_weight,
            self.dark_surface_weight,
            self.low_saturation_weight,
            self.edge_density_weight,
        ];

        if weights.iter().any(|w| *w < 0.0) {
            return Err("Indicator weights must be non-negative".to_string());
        }

        let sum: f64 = weights.iter().sum();
        if (sum - 1.0).abs() > 1e-6 {
            return Err(format!("Indicator weights must sum to 1.0 (got {})", sum));
        }

        if self.adaptive_block_size < 3 || self.adaptive_block_size % 2 == 0 {
            return Err("adaptive_block_size must be an odd number >= 3".to_string());
        }

        Ok(())
    }
}

/// Cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// TTL in seconds for per-location results and city stats.
    #[serde(default = "default_cache_ttl")]
    pub ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_cache_ttl(),
        }
    }
}

fn default_cache_ttl() -> u64 {
    300
}

/// Pipeline scheduling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Seconds between cycles in continuous mode.
    #[serde(default = "default_interval")]
    pub interval_seconds: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval(),
        }
    }
}

fn default_interval() -> u64 {
    300
}

/// Built-in demo set of monitored locations, used when the config lists none.
pub fn default_locations() -> Vec<Location> {
    let cams = [
        ("cam-1", "Downtown Plaza", 40.7589, -73.9851),
        ("cam-2", "Central Park North", 40.7967, -73.9496),
        ("cam-3", "Brooklyn Bridge", 40.7061, -73.9969),
        ("cam-4", "Times Square", 40.758, -73.9855),
        ("cam-5", "Hudson Yards", 40.7536, -74.0014),
    ];

    cams.iter()
        .enumerate()
        .map(|(i, (id, name, lat, lng))| Location {
            id: id.to_string(),
            name: name.to_string(),
            lat: Some(*lat),
            lng: Some(*lng),
            url: format!("https://example.com/cam{}/image.jpg", i + 1),
        })
        .collect()
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        let default_path = Path::new(".microclimate.toml");

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// The effective location registry: configured locations or the demo set.
    pub fn effective_locations(&self) -> Vec<Location> {
        if self.locations.is_empty() {
            default_locations()
        } else {
            self.locations.clone()
        }
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// CLI arguments take precedence over config file settings.
    /// This method only overrides config when CLI provides explicit values.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(ref data_dir) = args.data_dir {
            self.general.data_dir = data_dir.display().to_string();
        }

        if let Some(timeout) = args.timeout {
            self.fetcher.timeout_seconds = timeout;
        }
        if let Some(max_retries) = args.max_retries {
            self.fetcher.max_retries = max_retries;
        }

        if let Some(ttl) = args.cache_ttl {
            self.cache.ttl_seconds = ttl;
        }

        if let Some(interval) = args.interval {
            self.pipeline.interval_seconds = interval;
        }

        // Flags always override
        if args.verbose {
            self.general.verbose = true;
        }
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let mut config = Config::default();
        config.locations = default_locations();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}
