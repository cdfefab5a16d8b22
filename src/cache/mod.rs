//! TTL cache for the latest per-location results and city stats.
//!
//! The store itself is a swappable port: anything offering
//! set-with-expiry/get/prefix-scan satisfies the contract. The bundled
//! backend is an in-process map; the `ClimateCache` wrapper owns the key
//! namespace and converts store failures into logged misses so cache
//! trouble never reaches the orchestrator's critical path.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::CacheError;
use crate::models::{AnalysisResult, CityStats};

/// Key prefix for per-location results.
const LOCATION_PREFIX: &str = "location:";
/// Key for the city-wide aggregate.
const CITY_STATS_KEY: &str = "city:stats";

/// A key-value store with per-entry expiry.
///
/// An entry past its deadline must be indistinguishable from one never
/// written, whether or not the backend ever physically deletes it.
#[async_trait]
pub trait TtlStore: Send + Sync {
    /// Write a value under `key`, expiring after `ttl`.
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;

    /// Read a live value, or `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// All live entries whose key starts with `prefix`, keyed by the
    /// remainder of the key after the prefix.
    async fn scan_prefix(&self, prefix: &str) -> Result<HashMap<String, String>, CacheError>;
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    deadline: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}

/// In-process TTL store backed by a mutex-guarded map.
///
/// Expired entries are dropped lazily on read.
#[derive(Default)]
pub struct MemoryTtlStore {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryTtlStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TtlStore for MemoryTtlStore {
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;

        entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                deadline: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;

        let now = Instant::now();
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<HashMap<String, String>, CacheError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;

        let now = Instant::now();
        entries.retain(|_, entry| !entry.is_expired(now));

        Ok(entries
            .iter()
            .filter_map(|(key, entry)| {
                key.strip_prefix(prefix)
                    .map(|suffix| (suffix.to_string(), entry.value.clone()))
            })
            .collect())
    }
}

/// Domain-level cache for climate signals.
///
/// All operations degrade to no-ops or misses on store failure; the
/// durable batch remains the source of truth.
pub struct ClimateCache {
    store: Arc<dyn TtlStore>,
    ttl: Duration,
}

impl ClimateCache {
    pub fn new(store: Arc<dyn TtlStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Cache the latest result for a location. Returns whether the write landed.
    pub async fn set_location_result(&self, result: &AnalysisResult) -> bool {
        let key = format!("{}{}", LOCATION_PREFIX, result.location_id);
        self.set_json(&key, result).await
    }

    /// Latest cached result for a location, if present and fresh.
    pub async fn get_location_result(&self, location_id: &str) -> Option<AnalysisResult> {
        let key = format!("{}{}", LOCATION_PREFIX, location_id);
        self.get_json(&key).await
    }

    /// All fresh per-location results, keyed by location id.
    pub async fn get_all_location_results(&self) -> HashMap<String, AnalysisResult> {
        let raw = match self.store.scan_prefix(LOCATION_PREFIX).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Cache scan failed, returning empty set: {}", e);
                return HashMap::new();
            }
        };

        raw.into_iter()
            .filter_map(|(id, value)| match serde_json::from_str(&value) {
                Ok(result) => Some((id, result)),
                Err(e) => {
                    warn!("Discarding unreadable cache entry for {}: {}", id, e);
                    None
                }
            })
            .collect()
    }

    /// Cache the latest city aggregate. Returns whether the write landed.
    pub async fn set_city_stats(&self, stats: &CityStats) -> bool {
        self.set_json(CITY_STATS_KEY, stats).await
    }

    /// Latest cached city aggregate, if present and fresh.
    pub async fn get_city_stats(&self) -> Option<CityStats> {
        self.get_json(CITY_STATS_KEY).await
    }

    async fn set_json<T: Serialize>(&self, key: &str, value: &T) -> bool {
        let serialized = match serde_json::to_string(value) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to serialize cache value for {}: {}", key, e);
                return false;
            }
        };

        match self.store.set(key, serialized, self.ttl).await {
            Ok(()) => {
                debug!("Cached {}", key);
                true
            }
            Err(e) => {
                warn!("Cache write for {} failed, continuing without: {}", key, e);
                false
            }
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = match self.store.get(key).await {
            Ok(value) => value?,
            Err(e) => {
                warn!("Cache read for {} failed, treating as miss: {}", key, e);
                return None;
            }
        };

        match serde_json::from_str(&value) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                warn!("Discarding unreadable cache entry {}: {}", key, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::IndicatorScores;
    use chrono::Utc;

    fn make_result(id: &str) -> AnalysisResult {
        AnalysisResult {
            location_id: id.to_string(),
            sun_exposure: 0.7,
            wetness: 0.2,
            wetness_confidence: 0.9,
            indicators: IndicatorScores::default(),
            analyzed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_set_and_get_location_result() {
        let cache = ClimateCache::new(Arc::new(MemoryTtlStore::new()), Duration::from_secs(60));

        assert!(cache.set_location_result(&make_result("cam-1")).await);

        let cached = cache.get_location_result("cam-1").await.unwrap();
        assert_eq!(cached.location_id, "cam-1");
        assert_eq!(cached.sun_exposure, 0.7);

        assert!(cache.get_location_result("cam-2").await.is_none());
    }

    #[tokio::test]
    async fn test_entry_expires_after_ttl() {
        let store = MemoryTtlStore::new();
        store
            .set("location:cam-1", "{}".to_string(), Duration::from_millis(20))
            .await
            .unwrap();

        assert!(store.get("location:cam-1").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.get("location:cam-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_prefix_scan_skips_expired_and_foreign_keys() {
        let store = MemoryTtlStore::new();
        store
            .set("location:cam-1", "a".to_string(), Duration::from_secs(60))
            .await
            .unwrap();
        store
            .set("location:cam-2", "b".to_string(), Duration::from_millis(10))
            .await
            .unwrap();
        store
            .set("city:stats", "c".to_string(), Duration::from_secs(60))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;

        let live = store.scan_prefix("location:").await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live.get("cam-1"), Some(&"a".to_string()));
    }

    #[tokio::test]
    async fn test_city_stats_roundtrip() {
        let cache = ClimateCache::new(Arc::new(MemoryTtlStore::new()), Duration::from_secs(60));
        let stats = CityStats::from_records(&[]);

        assert!(cache.set_city_stats(&stats).await);
        let cached = cache.get_city_stats().await.unwrap();
        assert_eq!(cached.sample_count, 0);
    }

    #[tokio::test]
    async fn test_get_all_location_results() {
        let cache = ClimateCache::new(Arc::new(MemoryTtlStore::new()), Duration::from_secs(60));
        cache.set_location_result(&make_result("cam-1")).await;
        cache.set_location_result(&make_result("cam-2")).await;
        cache.set_city_stats(&CityStats::from_records(&[])).await;

        let all = cache.get_all_location_results().await;
        assert_eq!(all.len(), 2);
        assert!(all.contains_key("cam-1"));
        assert!(all.contains_key("cam-2"));
    }

    #[test]
    fn test_memory_store_from_sync_context() {
        tokio_test::block_on(async {
            let store = MemoryTtlStore::new();
            store
                .set("k", "v".to_string(), Duration::from_secs(5))
                .await
                .unwrap();
            assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
        });
    }

    /// A store that always fails, for exercising the degrade path.
    struct BrokenStore;

    #[async_trait]
    impl TtlStore for BrokenStore {
        async fn set(&self, _: &str, _: String, _: Duration) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("down".to_string()))
        }

        async fn get(&self, _: &str) -> Result<Option<String>, CacheError> {
            Err(CacheError::Unavailable("down".to_string()))
        }

        async fn scan_prefix(&self, _: &str) -> Result<HashMap<String, String>, CacheError> {
            Err(CacheError::Unavailable("down".to_string()))
        }
    }

    #[tokio::test]
    async fn test_unavailable_store_degrades_to_miss() {
        let cache = ClimateCache::new(Arc::new(BrokenStore), Duration::from_secs(60));

        assert!(!cache.set_location_result(&make_result("cam-1")).await);
        assert!(cache.get_location_result("cam-1").await.is_none());
        assert!(cache.get_city_stats().await.is_none());
        assert!(cache.get_all_location_results().await.is_empty());
    }
}
