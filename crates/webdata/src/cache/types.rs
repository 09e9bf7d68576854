//! # Cache Types
//!
//! This module defines common types used across the caching system.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::CacheError;

/// Opaque identifier of a logical resource.
///
/// Usually derived from a canonical URL with [`CacheKey::from_url`], but any
/// caller-supplied identifier works as long as it is stable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Create a cache key from any caller-supplied identifier
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Derive a cache key from a URL.
    ///
    /// Parsable URLs are normalised (scheme and host lowercased, default port
    /// dropped); anything else is used verbatim.
    pub fn from_url(url: &str) -> Self {
        match url::Url::parse(url) {
            Ok(parsed) => Self(parsed.to_string()),
            Err(_) => Self(url.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Convert to a filename-safe digest
    pub fn to_filename(&self) -> String {
        use sha2::{Digest, Sha256};

        let mut hasher = Sha256::new();
        hasher.update(self.0.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for CacheKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Anything that can be stored in the memory tier.
///
/// The cost is caller-defined (decoded byte size, pixel count, ...) and is
/// what the memory tier's cost limit is measured in.
pub trait Cacheable {
    fn cache_key(&self) -> CacheKey;
    fn cache_cost(&self) -> u64;
}

/// Which tier satisfied a lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheTier {
    /// Neither tier had the key
    None,
    /// Served from the in-memory tier
    Memory,
    /// Served from the on-disk tier
    Disk,
}

/// A single memory-tier entry.
///
/// Entries are replaced wholesale on store; callers only ever receive clones
/// of the payload handle.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub payload: Bytes,
    pub cost: u64,
    /// Milliseconds since the Unix epoch of the most recent lookup
    pub last_access: u64,
    /// Milliseconds since the Unix epoch when the entry was stored
    pub stored_at: u64,
}

impl CacheEntry {
    pub fn new(key: CacheKey, payload: Bytes, cost: u64, now: u64) -> Self {
        Self {
            key,
            payload,
            cost,
            last_access: now,
            stored_at: now,
        }
    }
}

impl Cacheable for CacheEntry {
    fn cache_key(&self) -> CacheKey {
        self.key.clone()
    }

    fn cache_cost(&self) -> u64 {
        self.cost
    }
}

/// Configuration for the cache system
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Aggregate cost allowed in memory, 0 for no limit
    pub memory_cost_limit: u64,
    /// Number of entries allowed in memory, 0 for no limit
    pub memory_count_limit: usize,
    /// Path for disk cache storage
    pub disk_cache_path: Option<PathBuf>,
    /// Entries older than this are never returned from disk, zero disables ageing
    pub max_disk_age: Duration,
    /// Maximum size of disk cache in bytes, 0 for no limit
    pub max_disk_size: u64,
    /// Promote disk hits into memory during asynchronous queries
    pub synchronize_in_memory: bool,
    /// Interval of the background disk sweep
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_cost_limit: 30 * 1024 * 1024, // 30MB
            memory_count_limit: 0,
            disk_cache_path: None, // If None, we'll use system temp dir
            max_disk_age: Duration::from_secs(7 * 24 * 3600), // 1 week
            max_disk_size: 0,
            synchronize_in_memory: true,
            sweep_interval: Duration::from_secs(10 * 60),
        }
    }
}

impl CacheConfig {
    /// Disk root, falling back to the system temp directory
    pub fn resolved_disk_path(&self) -> PathBuf {
        self.disk_cache_path
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("webdata-cache"))
    }
}

/// Result of a cache operation
pub type CacheResult<T> = std::result::Result<T, CacheError>;
