use std::sync::Arc;

use reqwest::StatusCode;

/// Errors produced by the cache tiers and the cache manager.
///
/// A cache miss is not an error; lookups report it as `Ok(None)` or with
/// [`CacheTier::None`](crate::cache::CacheTier::None).
#[derive(Debug, thiserror::Error, Clone)]
pub enum CacheError {
    #[error("Entry {key} has cost {cost} which exceeds the memory cost limit {limit}")]
    CostExceeded { key: String, cost: u64, limit: u64 },

    #[error("Entry {key} has size {size} which exceeds the disk size limit {limit}")]
    EntryTooLarge { key: String, size: u64, limit: u64 },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: Arc<std::io::Error>,
    },

    #[error("Disk index is corrupt: {0}")]
    CorruptIndex(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Background task failed: {0}")]
    TaskJoin(String),
}

// Manual implementation because of the Arc wrapping.
impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Io {
            source: Arc::new(err),
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Serialization(err.to_string())
    }
}

impl From<tokio::task::JoinError> for CacheError {
    fn from(err: tokio::task::JoinError) -> Self {
        CacheError::TaskJoin(err.to_string())
    }
}

/// Errors delivered through a download operation's completion callback.
///
/// Cloneable so the same failure can be handed to every coalesced observer.
#[derive(Debug, thiserror::Error, Clone)]
pub enum DownloadError {
    #[error("HTTP error: {source}")]
    Http {
        #[from]
        source: Arc<reqwest::Error>,
    },

    #[error("Server returned status code {0}")]
    Status(StatusCode),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: Arc<std::io::Error>,
    },

    #[error("Download timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Download cancelled")]
    Cancelled,

    #[error("No tokio runtime available to drive downloads")]
    NoRuntime,
}

impl From<reqwest::Error> for DownloadError {
    fn from(err: reqwest::Error) -> Self {
        DownloadError::Http {
            source: Arc::new(err),
        }
    }
}

impl From<std::io::Error> for DownloadError {
    fn from(err: std::io::Error) -> Self {
        DownloadError::Io {
            source: Arc::new(err),
        }
    }
}

/// Errors from [`WebDataLoader`](crate::loader::WebDataLoader), which spans
/// both subsystems.
#[derive(Debug, thiserror::Error, Clone)]
pub enum LoadError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Download(#[from] DownloadError),
}
