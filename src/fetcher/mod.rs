//! Concurrent snapshot retrieval with bounded retry.
//!
//! One task per location, fan-out/fan-in: total cycle latency is bounded
//! by the slowest single retrieval chain, not the sum of them all.
//! Failures classify into retryable (connection/timeout/5xx) and
//! terminal (4xx), so a bad URL or auth failure never burns retries
//! while transient server trouble gets a bounded number of chances.

use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::FetcherConfig;
use crate::error::FetchError;
use crate::models::{FetchOutcome, Location, RawImageAsset};
use crate::storage::AssetStore;

/// Response of one retrieval attempt: HTTP status plus body bytes.
#[derive(Debug, Clone)]
pub struct FetchedBody {
    pub status: u16,
    pub bytes: Vec<u8>,
}

/// Transport seam for snapshot retrieval.
///
/// Network-level failures surface as `FetchError`; any HTTP response,
/// error status included, comes back as a `FetchedBody` and is
/// classified by the fetcher.
#[async_trait]
pub trait ImageTransport: Send + Sync {
    async fn get(&self, url: &str) -> Result<FetchedBody, FetchError>;
}

/// Production transport over reqwest with a per-attempt timeout.
pub struct HttpTransport {
    client: reqwest::Client,
    timeout_seconds: u64,
}

impl HttpTransport {
    pub fn new(timeout_seconds: u64) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()?;

        Ok(Self {
            client,
            timeout_seconds,
        })
    }

    fn classify(&self, e: reqwest::Error) -> FetchError {
        if e.is_timeout() {
            FetchError::Timeout {
                seconds: self.timeout_seconds,
            }
        } else if e.is_connect() {
            FetchError::Connect {
                detail: e.to_string(),
            }
        } else {
            FetchError::Transport {
                detail: e.to_string(),
            }
        }
    }
}

#[async_trait]
impl ImageTransport for HttpTransport {
    async fn get(&self, url: &str) -> Result<FetchedBody, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| self.classify(e))?
            .to_vec();

        Ok(FetchedBody { status, bytes })
    }
}

/// Retrieves one snapshot per location, concurrently, with retry.
pub struct Fetcher {
    transport: Arc<dyn ImageTransport>,
    assets: AssetStore,
    max_retries: u32,
    backoff_base: Duration,
}

impl Fetcher {
    pub fn new(transport: Arc<dyn ImageTransport>, assets: AssetStore, config: &FetcherConfig) -> Self {
        Self {
            transport,
            assets,
            max_retries: config.max_retries.max(1),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
        }
    }

    /// Fetch every location concurrently. Returns exactly one outcome per
    /// input location; completion order is unspecified.
    pub async fn fetch_all(&self, locations: &[Location]) -> Vec<FetchOutcome> {
        let outcomes = join_all(locations.iter().map(|loc| self.fetch_one(loc))).await;

        let successes = outcomes.iter().filter(|o| o.is_success()).count();
        info!("Fetch complete: {}/{} successful", successes, outcomes.len());

        outcomes
    }

    /// Retrieve one location's snapshot with bounded retry and backoff.
    async fn fetch_one(&self, location: &Location) -> FetchOutcome {
        let mut last_error = String::from("no attempt made");

        for attempt in 1..=self.max_retries {
            match self.attempt(location).await {
                Ok(asset) => {
                    debug!(
                        "Fetched {} on attempt {}: {}",
                        location.name,
                        attempt,
                        asset.path.display()
                    );
                    return FetchOutcome::success(location.id.clone(), attempt, asset);
                }
                Err(e) => {
                    last_error = e.to_string();

                    if !e.is_retryable() {
                        warn!(
                            "Terminal failure for {} on attempt {}: {}",
                            location.name, attempt, e
                        );
                        return FetchOutcome::failure(location.id.clone(), attempt, last_error);
                    }

                    debug!(
                        "Retryable failure for {} on attempt {}: {}",
                        location.name, attempt, e
                    );

                    if attempt < self.max_retries {
                        tokio::time::sleep(self.backoff_base * attempt).await;
                    }
                }
            }
        }

        warn!(
            "Exhausted {} attempts for {}: {}",
            self.max_retries, location.name, last_error
        );
        FetchOutcome::failure(location.id.clone(), self.max_retries, last_error)
    }

    /// One retrieval attempt: request, status classification, durable store.
    async fn attempt(&self, location: &Location) -> Result<RawImageAsset, FetchError> {
        let body = self.transport.get(&location.url).await?;

        match body.status {
            200..=299 => Ok(self.assets.store(&location.id, &body.bytes)?),
            400..=499 => Err(FetchError::ClientStatus {
                status: body.status,
                url: location.url.clone(),
            }),
            status => Err(FetchError::ServerStatus {
                status,
                url: location.url.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FetchStatus;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Scripted transport: each URL gets a queue of canned responses,
    /// consumed one per attempt. Tracks per-URL call counts.
    struct ScriptedTransport {
        scripts: Mutex<HashMap<String, Vec<Result<FetchedBody, FetchError>>>>,
        calls: Mutex<HashMap<String, u32>>,
    }

    impl ScriptedTransport {
        fn new() -> Self {
            Self {
                scripts: Mutex::new(HashMap::new()),
                calls: Mutex::new(HashMap::new()),
            }
        }

        fn script(&self, url: &str, responses: Vec<Result<FetchedBody, FetchError>>) {
            self.scripts
                .lock()
                .unwrap()
                .insert(url.to_string(), responses);
        }

        fn calls_for(&self, url: &str) -> u32 {
            *self.calls.lock().unwrap().get(url).unwrap_or(&0)
        }
    }

    fn ok_body() -> Result<FetchedBody, FetchError> {
        Ok(FetchedBody {
            status: 200,
            bytes: b"image".to_vec(),
        })
    }

    fn status_body(status: u16) -> Result<FetchedBody, FetchError> {
        Ok(FetchedBody {
            status,
            bytes: Vec::new(),
        })
    }

    fn timeout_err() -> Result<FetchedBody, FetchError> {
        Err(FetchError::Timeout { seconds: 10 })
    }

    #[async_trait]
    impl ImageTransport for ScriptedTransport {
        async fn get(&self, url: &str) -> Result<FetchedBody, FetchError> {
            *self
                .calls
                .lock()
                .unwrap()
                .entry(url.to_string())
                .or_insert(0) += 1;

            let mut scripts = self.scripts.lock().unwrap();
            let queue = scripts
                .get_mut(url)
                .unwrap_or_else(|| panic!("no script for {}", url));

            if queue.len() > 1 {
                queue.remove(0)
            } else {
                // Last response repeats for any further attempts.
                queue[0].as_ref().map(Clone::clone).map_err(|e| match e {
                    FetchError::Timeout { seconds } => FetchError::Timeout { seconds: *seconds },
                    other => FetchError::Transport {
                        detail: other.to_string(),
                    },
                })
            }
        }
    }

    fn make_location(id: &str) -> Location {
        Location {
            id: id.to_string(),
            name: format!("Location {}", id),
            lat: None,
            lng: None,
            url: format!("https://example.com/{}/image.jpg", id),
        }
    }

    fn make_fetcher(transport: Arc<ScriptedTransport>, dir: &std::path::Path) -> Fetcher {
        let config = FetcherConfig {
            timeout_seconds: 10,
            max_retries: 3,
            backoff_base_ms: 0,
        };
        Fetcher::new(transport, AssetStore::new(dir).unwrap(), &config)
    }

    #[tokio::test]
    async fn test_success_first_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        let loc = make_location("cam-1");
        transport.script(&loc.url, vec![ok_body()]);

        let fetcher = make_fetcher(transport.clone(), dir.path());
        let outcome = fetcher.fetch_one(&loc).await;

        assert!(outcome.is_success());
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.asset.unwrap().path.exists());
        assert_eq!(transport.calls_for(&loc.url), 1);
    }

    #[tokio::test]
    async fn test_client_error_never_retried() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        let loc = make_location("cam-1");
        transport.script(&loc.url, vec![status_body(404)]);

        let fetcher = make_fetcher(transport.clone(), dir.path());
        let outcome = fetcher.fetch_one(&loc).await;

        assert_eq!(outcome.status, FetchStatus::Failure);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(transport.calls_for(&loc.url), 1);
        assert!(outcome.error.unwrap().contains("404"));
    }

    #[tokio::test]
    async fn test_server_error_retried_then_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        let loc = make_location("cam-1");
        transport.script(&loc.url, vec![status_body(500), ok_body()]);

        let fetcher = make_fetcher(transport.clone(), dir.path());
        let outcome = fetcher.fetch_one(&loc).await;

        assert!(outcome.is_success());
        assert_eq!(outcome.attempts, 2);
        assert_eq!(transport.calls_for(&loc.url), 2);
    }

    #[tokio::test]
    async fn test_timeout_exhausts_retries() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        let loc = make_location("cam-1");
        transport.script(&loc.url, vec![timeout_err()]);

        let fetcher = make_fetcher(transport.clone(), dir.path());
        let outcome = fetcher.fetch_one(&loc).await;

        assert_eq!(outcome.status, FetchStatus::Failure);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(transport.calls_for(&loc.url), 3);
    }

    #[tokio::test]
    async fn test_mixed_batch_one_outcome_per_location() {
        // 2 succeed first try, 1 succeeds after a 500, 1 terminal 404,
        // 1 times out on every attempt.
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new());

        let locations: Vec<Location> = (1..=5).map(|i| make_location(&format!("cam-{}", i))).collect();
        transport.script(&locations[0].url, vec![ok_body()]);
        transport.script(&locations[1].url, vec![ok_body()]);
        transport.script(&locations[2].url, vec![status_body(500), ok_body()]);
        transport.script(&locations[3].url, vec![status_body(404)]);
        transport.script(&locations[4].url, vec![timeout_err()]);

        let fetcher = make_fetcher(transport.clone(), dir.path());
        let outcomes = fetcher.fetch_all(&locations).await;

        assert_eq!(outcomes.len(), 5);
        let successes = outcomes.iter().filter(|o| o.is_success()).count();
        assert_eq!(successes, 3);

        let by_id = |id: &str| outcomes.iter().find(|o| o.location_id == id).unwrap();
        assert_eq!(by_id("cam-3").attempts, 2);
        assert_eq!(by_id("cam-4").attempts, 1);
        assert!(!by_id("cam-4").is_success());
        assert_eq!(by_id("cam-5").attempts, 3);
        assert!(!by_id("cam-5").is_success());
    }
}
