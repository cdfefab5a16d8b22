//! Error taxonomy for the pipeline.
//!
//! Fetch errors split into retryable (transient network/server trouble)
//! and terminal (client errors that will never succeed). Cache errors
//! never reach the orchestrator's critical path; persistence errors do.

use std::path::PathBuf;
use thiserror::Error;

/// Failure modes of a single snapshot retrieval attempt.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Remote returned a 4xx status. Never retried.
    #[error("HTTP {status} from {url}")]
    ClientStatus { status: u16, url: String },

    /// Remote returned a 5xx status. Retried up to the configured limit.
    #[error("HTTP {status} from {url}")]
    ServerStatus { status: u16, url: String },

    /// The request exceeded the per-attempt timeout.
    #[error("request timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// Could not establish a connection.
    #[error("connection failed: {detail}")]
    Connect { detail: String },

    /// Any other transport-level failure (DNS, TLS, body read).
    #[error("transport error: {detail}")]
    Transport { detail: String },

    /// The fetched bytes could not be written to the asset store.
    #[error("failed to store snapshot: {0}")]
    Store(#[from] std::io::Error),
}

impl FetchError {
    /// Whether a later attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::ServerStatus { .. }
                | FetchError::Timeout { .. }
                | FetchError::Connect { .. }
                | FetchError::Transport { .. }
        )
    }
}

/// Cache layer failures. Degraded to logged no-ops by the cache wrapper.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache store unavailable: {0}")]
    Unavailable(String),

    #[error("cache value serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Failure to write the durable cycle batch.
///
/// Surfaced to the cycle's caller; in continuous mode the scheduler logs
/// it and moves on to the next cycle.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("failed to write batch file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode cycle batch: {0}")]
    Encode(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_status_is_terminal() {
        let err = FetchError::ClientStatus {
            status: 404,
            url: "https://example.com/cam1".to_string(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_server_status_is_retryable() {
        let err = FetchError::ServerStatus {
            status: 503,
            url: "https://example.com/cam1".to_string(),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn test_timeout_and_connect_are_retryable() {
        assert!(FetchError::Timeout { seconds: 10 }.is_retryable());
        assert!(FetchError::Connect {
            detail: "refused".to_string()
        }
        .is_retryable());
    }

    #[test]
    fn test_store_failure_is_terminal() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert!(!FetchError::Store(io).is_retryable());
    }
}
