//! # Cache Provider
//!
//! This module defines the cache provider trait that both cache tiers implement.
//!
//! Calls are synchronous. The memory tier never blocks on I/O; the disk tier
//! does, so async callers go through [`CacheManager`](crate::CacheManager),
//! which moves disk work onto the blocking pool.

use bytes::Bytes;

use crate::cache::types::{CacheKey, CacheResult};

/// A trait for cache tiers that can store and retrieve cached data
pub trait CacheProvider: Send + Sync {
    /// Check if the tier holds a live entry for the given key
    fn contains(&self, key: &CacheKey) -> CacheResult<bool>;

    /// Get an entry's payload from the tier
    fn get(&self, key: &CacheKey) -> CacheResult<Option<Bytes>>;

    /// Put an entry into the tier, replacing any previous entry for the key
    fn put(&self, key: CacheKey, data: Bytes) -> CacheResult<()>;

    /// Remove an entry from the tier
    fn remove(&self, key: &CacheKey) -> CacheResult<()>;

    /// Clear all entries from the tier
    fn clear(&self) -> CacheResult<()>;

    /// Drop entries that are no longer eligible to be returned
    fn sweep(&self) -> CacheResult<()>;
}
