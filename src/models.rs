//! Data models for the micro-climate monitor.
//!
//! This module contains all the core data structures used throughout
//! the application for representing locations, fetch outcomes, analysis
//! results, and city-wide aggregates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Wetness above this value counts a location as "wet" in the city aggregate.
pub const WET_THRESHOLD: f64 = 0.5;

/// A monitored webcam location. Registered once at startup, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Location {
    /// Unique location identifier (e.g., "cam-1").
    pub id: String,
    /// Human-readable display name.
    pub name: String,
    /// Latitude, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    /// Longitude, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lng: Option<f64>,
    /// Snapshot endpoint URL.
    pub url: String,
}

/// A raw snapshot stored on disk after a successful fetch.
///
/// The orchestrator passes the storage path around, not the bytes,
/// to keep outcome records small.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawImageAsset {
    /// Location the snapshot belongs to.
    pub location_id: String,
    /// When the snapshot was retrieved.
    pub fetched_at: DateTime<Utc>,
    /// Size of the stored image in bytes.
    pub byte_len: u64,
    /// Hex-encoded blake3 hash of the image content.
    pub content_hash: String,
    /// Where the raw bytes live on disk.
    pub path: PathBuf,
}

/// Terminal status of one location's retrieval in one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchStatus {
    Success,
    Failure,
}

impl fmt::Display for FetchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchStatus::Success => write!(f, "success"),
            FetchStatus::Failure => write!(f, "failure"),
        }
    }
}

/// The result of retrieving one location's snapshot, success or failure.
///
/// Exactly one outcome exists per location per cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchOutcome {
    /// Location this outcome belongs to.
    pub location_id: String,
    /// Terminal status.
    pub status: FetchStatus,
    /// Number of attempts made (1-based; at most the configured max).
    pub attempts: u32,
    /// Detail of the last error, present on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Stored asset, present on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asset: Option<RawImageAsset>,
}

impl FetchOutcome {
    /// Creates a successful outcome carrying the stored asset.
    pub fn success(location_id: String, attempts: u32, asset: RawImageAsset) -> Self {
        Self {
            location_id,
            status: FetchStatus::Success,
            attempts,
            error: None,
            asset: Some(asset),
        }
    }

    /// Creates a terminal failure outcome carrying the last error detail.
    pub fn failure(location_id: String, attempts: u32, error: String) -> Self {
        Self {
            location_id,
            status: FetchStatus::Failure,
            attempts,
            error: Some(error),
            asset: None,
        }
    }

    /// Whether this outcome is a success.
    pub fn is_success(&self) -> bool {
        self.status == FetchStatus::Success
    }
}

/// Per-heuristic wetness indicator scores, each in [0, 1].
///
/// Ephemeral within one analyzer invocation, but serialized into the
/// result record as the indicator breakdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct IndicatorScores {
    /// Specular highlight signature: high brightness, low saturation.
    pub reflection: f64,
    /// Low-luminance wet pavement.
    pub dark_surface: f64,
    /// Desaturation from water sheen.
    pub low_saturation: f64,
    /// Fraction of pixels flagged by the edge filter.
    pub edge_density: f64,
}

impl IndicatorScores {
    /// Returns the four scores as a fixed array, in fusion-weight order.
    pub fn as_array(&self) -> [f64; 4] {
        [
            self.reflection,
            self.dark_surface,
            self.low_saturation,
            self.edge_density,
        ]
    }
}

/// The analyzer's verdict for one image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// Location the analyzed image belongs to.
    pub location_id: String,
    /// Fraction of pixels classified bright, in [0, 1].
    pub sun_exposure: f64,
    /// Weighted fusion of the wetness indicators, in [0, 1].
    pub wetness: f64,
    /// Agreement between indicators, in [0, 1].
    pub wetness_confidence: f64,
    /// Per-indicator breakdown.
    pub indicators: IndicatorScores,
    /// When the analysis ran.
    pub analyzed_at: DateTime<Utc>,
}

impl AnalysisResult {
    /// A zero-valued result for an image that could not be decoded or read.
    pub fn degraded(location_id: String) -> Self {
        Self {
            location_id,
            sun_exposure: 0.0,
            wetness: 0.0,
            wetness_confidence: 0.0,
            indicators: IndicatorScores::default(),
            analyzed_at: Utc::now(),
        }
    }
}

/// One canonical per-location record in a persisted cycle batch.
///
/// Fetch results historically arrived in more than one shape (`id` vs
/// `name` identifiers, `filepath` vs `file_path`); the aliases below let
/// older batch files deserialize into the single canonical form, so no
/// downstream code ever does ad-hoc field lookups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CombinedRecord {
    /// Location identifier.
    #[serde(alias = "webcam_id", alias = "id")]
    pub location_id: String,
    /// Location display name.
    #[serde(alias = "webcam_name", alias = "name")]
    pub location_name: String,
    /// Path to the stored snapshot.
    #[serde(alias = "filepath", alias = "file_path")]
    pub image_path: PathBuf,
    /// When the snapshot was retrieved.
    #[serde(alias = "timestamp")]
    pub fetch_timestamp: DateTime<Utc>,
    pub sun_exposure: f64,
    pub wetness: f64,
    pub wetness_confidence: f64,
    pub indicators: IndicatorScores,
}

impl CombinedRecord {
    /// Builds the canonical record from a successful outcome and its analysis.
    ///
    /// This is the single normalization boundary between the fetch/analysis
    /// stages and everything downstream.
    pub fn combine(location: &Location, asset: &RawImageAsset, analysis: &AnalysisResult) -> Self {
        Self {
            location_id: location.id.clone(),
            location_name: location.name.clone(),
            image_path: asset.path.clone(),
            fetch_timestamp: asset.fetched_at,
            sun_exposure: analysis.sun_exposure,
            wetness: analysis.wetness,
            wetness_confidence: analysis.wetness_confidence,
            indicators: analysis.indicators,
        }
    }
}

/// City-wide aggregate over one cycle's successfully analyzed locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CityStats {
    /// Mean sun exposure across the sample.
    pub avg_sun_exposure: f64,
    /// Mean wetness across the sample.
    pub avg_wetness: f64,
    /// Locations with wetness above [`WET_THRESHOLD`].
    pub wet_location_count: usize,
    /// Number of locations in the sample.
    pub sample_count: usize,
    /// When the aggregate was computed.
    pub generated_at: DateTime<Utc>,
}

impl CityStats {
    /// Computes the aggregate. An empty batch yields zeroed stats, never an error.
    pub fn from_records(records: &[CombinedRecord]) -> Self {
        if records.is_empty() {
            return Self {
                avg_sun_exposure: 0.0,
                avg_wetness: 0.0,
                wet_location_count: 0,
                sample_count: 0,
                generated_at: Utc::now(),
            };
        }

        let n = records.len() as f64;
        let sun_sum: f64 = records.iter().map(|r| r.sun_exposure).sum();
        let wet_sum: f64 = records.iter().map(|r| r.wetness).sum();
        let wet_count = records.iter().filter(|r| r.wetness > WET_THRESHOLD).count();

        Self {
            avg_sun_exposure: sun_sum / n,
            avg_wetness: wet_sum / n,
            wet_location_count: wet_count,
            sample_count: records.len(),
            generated_at: Utc::now(),
        }
    }
}

/// How the pipeline was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// One cycle, then exit.
    Single,
    /// Repeating cycles on an interval.
    Continuous,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Single => write!(f, "single"),
            RunMode::Continuous => write!(f, "continuous"),
        }
    }
}

/// The durable per-cycle batch written to disk.
///
/// Every outcome of the cycle appears here: analyzed records for the
/// successes, fetch outcomes for the failures. Nothing is silently dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleBatch {
    /// When the cycle ran.
    pub cycle_timestamp: DateTime<Utc>,
    /// Canonical records for successfully analyzed locations.
    pub records: Vec<CombinedRecord>,
    /// Outcomes for locations whose fetch failed.
    pub failures: Vec<FetchOutcome>,
    /// Number of records analyzed this cycle.
    pub count_analyzed: usize,
    /// Trigger mode tag.
    pub mode: RunMode,
}

/// Payload pushed into the broadcast channel after each persisted cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleUpdate {
    pub records: Vec<CombinedRecord>,
    pub stats: CityStats,
}
