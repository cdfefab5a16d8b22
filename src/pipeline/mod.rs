//! Pipeline orchestration: fetch, analyze, aggregate, persist.
//!
//! One cycle walks FETCHING -> ANALYZING -> AGGREGATING -> PERSISTED.
//! Per-location failures never abort the batch; the persisted batch
//! carries every outcome, success or failure. Continuous mode re-enters
//! the cycle on an interval and honors cancellation only at the
//! inter-cycle boundary so a batch is never half-written.

use anyhow::Result;
use chrono::Utc;
use futures::future::join_all;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::analyzer;
use crate::cache::ClimateCache;
use crate::config::AnalyzerConfig;
use crate::fetcher::Fetcher;
use crate::models::{
    AnalysisResult, CityStats, CombinedRecord, CycleBatch, CycleUpdate, FetchOutcome, Location,
    RunMode,
};
use crate::storage::BatchWriter;

/// Capacity of the subscriber broadcast channel; slow consumers lag
/// rather than block the pipeline.
const BROADCAST_CAPACITY: usize = 16;

/// What one completed cycle produced.
#[derive(Debug)]
pub struct CycleReport {
    /// Where the durable batch landed.
    pub batch_path: PathBuf,
    /// Canonical records for analyzed locations.
    pub records: Vec<CombinedRecord>,
    /// This cycle's city aggregate.
    pub stats: CityStats,
    /// Count of locations whose fetch failed.
    pub failed_fetches: usize,
}

/// Drives one pipeline cycle end to end.
pub struct Pipeline {
    locations: Vec<Location>,
    fetcher: Fetcher,
    analyzer_config: AnalyzerConfig,
    cache: ClimateCache,
    batches: BatchWriter,
    updates: broadcast::Sender<CycleUpdate>,
}

impl Pipeline {
    pub fn new(
        locations: Vec<Location>,
        fetcher: Fetcher,
        analyzer_config: AnalyzerConfig,
        cache: ClimateCache,
        batches: BatchWriter,
    ) -> Self {
        let (updates, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            locations,
            fetcher,
            analyzer_config,
            cache,
            batches,
            updates,
        }
    }

    /// Subscribe to per-cycle updates. Zero subscribers is fine; the
    /// pipeline never learns about individual consumers.
    pub fn subscribe(&self) -> broadcast::Receiver<CycleUpdate> {
        self.updates.subscribe()
    }

    /// The registered location set.
    pub fn locations(&self) -> &[Location] {
        &self.locations
    }

    /// Run one cycle. Persistence failure is the only error surfaced;
    /// everything location-scoped degrades in place.
    pub async fn run_cycle(&self, mode: RunMode) -> Result<CycleReport> {
        let cycle_timestamp = Utc::now();
        info!("Cycle starting for {} locations", self.locations.len());

        // FETCHING: fan-out one task per location, fan-in all outcomes.
        let outcomes = self.fetcher.fetch_all(&self.locations).await;

        // ANALYZING: successful fetches only; decode failures degrade.
        let analyses = self.analyze_outcomes(&outcomes).await;

        // AGGREGATING: normalize into canonical records, then the city view.
        let records = self.combine(&outcomes, &analyses);
        let failures: Vec<FetchOutcome> = outcomes
            .iter()
            .filter(|o| !o.is_success())
            .cloned()
            .collect();
        let stats = CityStats::from_records(&records);

        debug!(
            "Aggregated {} records, {} failures, avg sun {:.3}, avg wetness {:.3}",
            records.len(),
            failures.len(),
            stats.avg_sun_exposure,
            stats.avg_wetness
        );

        // PERSISTED: durable batch first, then cache and subscribers.
        let failed_fetches = failures.len();
        let batch = CycleBatch {
            cycle_timestamp,
            records: records.clone(),
            failures,
            count_analyzed: records.len(),
            mode,
        };
        let batch_path = self.batches.write(&batch)?;

        for analysis in analyses.values() {
            self.cache.set_location_result(analysis).await;
        }
        self.cache.set_city_stats(&stats).await;

        // Send errors only mean nobody is listening right now.
        let _ = self.updates.send(CycleUpdate {
            records: records.clone(),
            stats: stats.clone(),
        });

        info!(
            "Cycle complete: {} analyzed, {} failed, batch at {}",
            records.len(),
            failed_fetches,
            batch_path.display()
        );

        Ok(CycleReport {
            batch_path,
            records,
            stats,
            failed_fetches,
        })
    }

    /// Analyze every successfully fetched asset on the blocking pool.
    ///
    /// Analyses share no mutable state, so they run in parallel; results
    /// are correlated by location id, never by completion order.
    async fn analyze_outcomes(
        &self,
        outcomes: &[FetchOutcome],
    ) -> HashMap<String, AnalysisResult> {
        let tasks = outcomes.iter().filter(|o| o.is_success()).map(|outcome| {
            let location_id = outcome.location_id.clone();
            // One outcome per location and success implies an asset.
            let path = outcome
                .asset
                .as_ref()
                .map(|a| a.path.clone())
                .unwrap_or_default();
            let config = self.analyzer_config.clone();

            tokio::task::spawn_blocking(move || {
                let result = match std::fs::read(&path) {
                    Ok(bytes) => analyzer::analyze(&location_id, &bytes, &config),
                    Err(e) => {
                        warn!(
                            "Could not read stored asset {} for {}: {}",
                            path.display(),
                            location_id,
                            e
                        );
                        AnalysisResult::degraded(location_id.clone())
                    }
                };
                (location_id, result)
            })
        });

        join_all(tasks)
            .await
            .into_iter()
            .filter_map(|joined| match joined {
                Ok(pair) => Some(pair),
                Err(e) => {
                    error!("Analysis task panicked: {}", e);
                    None
                }
            })
            .collect()
    }

    /// The single normalization boundary: fold outcome and analysis into
    /// one canonical record per successfully analyzed location.
    fn combine(
        &self,
        outcomes: &[FetchOutcome],
        analyses: &HashMap<String, AnalysisResult>,
    ) -> Vec<CombinedRecord> {
        self.locations
            .iter()
            .filter_map(|location| {
                let outcome = outcomes.iter().find(|o| o.location_id == location.id)?;
                let asset = outcome.asset.as_ref()?;
                let analysis = analyses.get(&location.id)?;
                Some(CombinedRecord::combine(location, asset, analysis))
            })
            .collect()
    }
}

/// Repeats pipeline cycles on a fixed interval.
///
/// The cancellation signal is checked only between cycles; mid-cycle
/// work always runs to completion.
pub struct Scheduler {
    pipeline: Arc<Pipeline>,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl Scheduler {
    pub fn new(pipeline: Arc<Pipeline>, interval: Duration, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            pipeline,
            interval,
            shutdown,
        }
    }

    /// Run until cancelled. A failed cycle is logged and the loop
    /// continues; a long-running monitor should not die because one
    /// batch could not be written.
    pub async fn run(&mut self) {
        info!(
            "Starting continuous pipeline (interval: {}s)",
            self.interval.as_secs()
        );

        loop {
            match self.pipeline.run_cycle(RunMode::Continuous).await {
                Ok(report) => info!(
                    "Cycle persisted {} records ({} fetch failures)",
                    report.records.len(),
                    report.failed_fetches
                ),
                Err(e) => error!("Cycle failed: {:#}", e),
            }

            if *self.shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Scheduler stopped at cycle boundary");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{ClimateCache, MemoryTtlStore};
    use crate::config::FetcherConfig;
    use crate::error::FetchError;
    use crate::fetcher::{FetchedBody, ImageTransport};
    use crate::storage::AssetStore;
    use async_trait::async_trait;
    use image::{Rgb, RgbImage};
    use std::io::Cursor;

    /// Transport that serves a fixed PNG for some URLs and a canned
    /// failure for the rest.
    struct FixedTransport {
        image: Vec<u8>,
        failing_suffixes: Vec<String>,
    }

    #[async_trait]
    impl ImageTransport for FixedTransport {
        async fn get(&self, url: &str) -> Result<FetchedBody, FetchError> {
            if self.failing_suffixes.iter().any(|s| url.ends_with(s)) {
                return Ok(FetchedBody {
                    status: 404,
                    bytes: Vec::new(),
                });
            }
            Ok(FetchedBody {
                status: 200,
                bytes: self.image.clone(),
            })
        }
    }

    fn png_bytes() -> Vec<u8> {
        let img = RgbImage::from_pixel(16, 16, Rgb([200, 200, 210]));
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn make_location(id: &str) -> Location {
        Location {
            id: id.to_string(),
            name: format!("Location {}", id),
            lat: None,
            lng: None,
            url: format!("https://example.com/{}.jpg", id),
        }
    }

    fn make_pipeline(dir: &std::path::Path, failing: Vec<String>) -> Pipeline {
        let transport = Arc::new(FixedTransport {
            image: png_bytes(),
            failing_suffixes: failing,
        });
        let fetcher_config = FetcherConfig {
            timeout_seconds: 5,
            max_retries: 2,
            backoff_base_ms: 0,
        };
        let fetcher = Fetcher::new(
            transport,
            AssetStore::new(dir.join("images")).unwrap(),
            &fetcher_config,
        );
        let cache = ClimateCache::new(Arc::new(MemoryTtlStore::new()), Duration::from_secs(60));
        let batches = BatchWriter::new(dir.join("results")).unwrap();

        Pipeline::new(
            vec![make_location("cam-1"), make_location("cam-2")],
            fetcher,
            AnalyzerConfig::default(),
            cache,
            batches,
        )
    }

    #[tokio::test]
    async fn test_cycle_persists_batch_and_updates_cache() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = make_pipeline(dir.path(), vec![]);

        let report = pipeline.run_cycle(RunMode::Single).await.unwrap();

        assert_eq!(report.records.len(), 2);
        assert_eq!(report.failed_fetches, 0);
        assert_eq!(report.stats.sample_count, 2);
        assert!(report.batch_path.exists());

        let cached = pipeline.cache.get_location_result("cam-1").await.unwrap();
        assert_eq!(cached.location_id, "cam-1");
        assert!(pipeline.cache.get_city_stats().await.is_some());
    }

    #[tokio::test]
    async fn test_fetch_failure_recorded_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = make_pipeline(dir.path(), vec!["cam-2.jpg".to_string()]);

        let report = pipeline.run_cycle(RunMode::Single).await.unwrap();

        assert_eq!(report.records.len(), 1);
        assert_eq!(report.failed_fetches, 1);
        assert_eq!(report.stats.sample_count, 1);

        // The failed location appears in the persisted batch.
        let content = std::fs::read_to_string(&report.batch_path).unwrap();
        let batch: CycleBatch = serde_json::from_str(&content).unwrap();
        assert_eq!(batch.failures.len(), 1);
        assert_eq!(batch.failures[0].location_id, "cam-2");
        assert_eq!(batch.count_analyzed, 1);
    }

    #[tokio::test]
    async fn test_all_fetches_failing_yields_empty_stats() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = make_pipeline(
            dir.path(),
            vec!["cam-1.jpg".to_string(), "cam-2.jpg".to_string()],
        );

        let report = pipeline.run_cycle(RunMode::Single).await.unwrap();

        assert!(report.records.is_empty());
        assert_eq!(report.stats.sample_count, 0);
        assert_eq!(report.stats.avg_sun_exposure, 0.0);
    }

    #[tokio::test]
    async fn test_subscribers_receive_cycle_update() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = make_pipeline(dir.path(), vec![]);
        let mut updates = pipeline.subscribe();

        pipeline.run_cycle(RunMode::Single).await.unwrap();

        let update = updates.recv().await.unwrap();
        assert_eq!(update.records.len(), 2);
        assert_eq!(update.stats.sample_count, 2);
    }

    #[tokio::test]
    async fn test_scheduler_stops_on_shutdown_signal() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Arc::new(make_pipeline(dir.path(), vec![]));
        let (tx, rx) = watch::channel(false);

        let mut scheduler = Scheduler::new(pipeline, Duration::from_secs(3600), rx);
        let handle = tokio::spawn(async move { scheduler.run().await });

        // Let the first cycle finish, then cancel at the boundary.
        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("scheduler did not stop after cancellation")
            .unwrap();
    }
}
