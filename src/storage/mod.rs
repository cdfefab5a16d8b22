//! Durable storage: raw snapshots and per-cycle result batches.
//!
//! The fetcher writes each raw snapshot to the images directory and
//! passes the asset reference downstream; the orchestrator writes one
//! JSON batch file per cycle to the results directory.

use chrono::{DateTime, Utc};
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info};

use crate::error::PersistError;
use crate::models::{CycleBatch, RawImageAsset};

/// Writes raw snapshot bytes to disk and hands back asset references.
#[derive(Debug, Clone)]
pub struct AssetStore {
    images_dir: PathBuf,
}

impl AssetStore {
    /// Create the store, making the images directory if needed.
    pub fn new(images_dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let images_dir = images_dir.into();
        fs::create_dir_all(&images_dir)?;
        Ok(Self { images_dir })
    }

    /// Store one snapshot and return its asset reference.
    ///
    /// Filenames carry the location id and fetch timestamp; each cycle's
    /// snapshot supersedes nothing on disk, it just gets its own file.
    pub fn store(&self, location_id: &str, bytes: &[u8]) -> std::io::Result<RawImageAsset> {
        let fetched_at = Utc::now();
        let filename = format!(
            "{}_{}.jpg",
            safe_filename(location_id),
            fetched_at.format("%Y%m%d_%H%M%S")
        );
        let path = self.images_dir.join(filename);

        fs::write(&path, bytes)?;
        let content_hash = blake3::hash(bytes).to_hex().to_string();

        debug!(
            "Stored {} bytes for {} at {}",
            bytes.len(),
            location_id,
            path.display()
        );

        Ok(RawImageAsset {
            location_id: location_id.to_string(),
            fetched_at,
            byte_len: bytes.len() as u64,
            content_hash,
            path,
        })
    }
}

/// Writes one durable batch file per pipeline cycle.
#[derive(Debug, Clone)]
pub struct BatchWriter {
    results_dir: PathBuf,
}

impl BatchWriter {
    /// Create the writer, making the results directory if needed.
    pub fn new(results_dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let results_dir = results_dir.into();
        fs::create_dir_all(&results_dir)?;
        Ok(Self { results_dir })
    }

    /// Persist the cycle batch as a timestamped JSON file.
    pub fn write(&self, batch: &CycleBatch) -> Result<PathBuf, PersistError> {
        let path = self.batch_path(batch.cycle_timestamp);
        let content = serde_json::to_string_pretty(batch)?;

        fs::write(&path, content).map_err(|source| PersistError::Io {
            path: path.clone(),
            source,
        })?;

        info!(
            "Persisted batch with {} records to {}",
            batch.records.len(),
            path.display()
        );
        Ok(path)
    }

    fn batch_path(&self, timestamp: DateTime<Utc>) -> PathBuf {
        self.results_dir
            .join(format!("analysis_{}.json", timestamp.format("%Y%m%d_%H%M%S")))
    }
}

/// Replace anything outside [A-Za-z0-9-._] so location ids can't escape
/// the images directory or produce unusable filenames.
fn safe_filename(name: &str) -> String {
    let safe: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let trimmed = safe.trim_matches('_');
    if trimmed.is_empty() {
        "webcam".to_string()
    } else {
        trimmed.to_string()
    }
}
