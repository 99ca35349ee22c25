//! Error types shared by every layer of the crate.

use thiserror::Error;

/// Errors raised by the storage, cache and network layers.
#[derive(Debug, Error)]
pub enum CompanionError {
    /// The structured engine could not be opened on this host.
    ///
    /// Callers treat this as non-fatal and continue on the flat store.
    #[error("Structured storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A flat store write did not fit in the configured quota, even after cleanup.
    #[error("Storage quota exceeded: {0}")]
    QuotaExceeded(String),

    /// A requested local entity does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The request never produced an HTTP response (DNS, connect, timeout).
    #[error("Transport error: {0}")]
    Transport(String),

    /// The host reports no connectivity, so no request was attempted.
    #[error("Offline: {0}")]
    Offline(String),

    /// The upstream answered 404 for a specific resource.
    #[error("Upstream resource not found: {0}")]
    UpstreamNotFound(String),

    /// The upstream answered with a non-success status other than 404.
    #[error("Upstream returned HTTP {status} for {path}")]
    Upstream { status: u16, path: String },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CompanionError {
    /// Whether a failed request should be parked in the retry queue.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CompanionError::Transport(_) | CompanionError::Offline(_))
    }
}

impl From<lmdb::Error> for CompanionError {
    fn from(err: lmdb::Error) -> Self {
        match err {
            lmdb::Error::NotFound => CompanionError::NotFound("LMDB key not found".to_string()),
            lmdb::Error::MapFull => {
                CompanionError::Database("LMDB map is full; raise map_size".to_string())
            }
            other => CompanionError::Database(format!("LMDB error: {other}")),
        }
    }
}

impl From<serde_json::Error> for CompanionError {
    fn from(err: serde_json::Error) -> Self {
        CompanionError::Serialization(format!("JSON serialization error: {err}"))
    }
}

impl From<reqwest::Error> for CompanionError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            CompanionError::Transport(format!("request timed out: {err}"))
        } else if err.is_decode() {
            CompanionError::Serialization(format!("invalid upstream body: {err}"))
        } else {
            CompanionError::Transport(err.to_string())
        }
    }
}

/// Result type for every fallible operation in the crate.
pub type Result<T> = std::result::Result<T, CompanionError>;
