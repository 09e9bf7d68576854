//! # Cache Manager
//!
//! This module provides the main cache manager that coordinates between the
//! memory and disk tiers.
//!
//! Memory lookups run inline. Anything touching the disk tier is moved onto
//! tokio's blocking pool, so async callers are never stalled by file I/O.
//! When `synchronize_in_memory` is on, a disk hit found by [`CacheManager::query`]
//! is decoded and promoted into memory before it is returned.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use tokio::task::{JoinHandle, spawn_blocking};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::clock::{Clock, SystemClock};
use crate::cache::providers::{CacheProvider, DiskCache, MemoryCache};
use crate::cache::types::{CacheConfig, CacheKey, CacheResult, CacheTier, Cacheable};
use crate::codec::{Decoder, PassthroughDecoder};

static SHARED: OnceLock<CacheManager> = OnceLock::new();

/// Cache manager handling both memory and disk caching
#[derive(Clone)]
pub struct CacheManager {
    memory_cache: Arc<MemoryCache>,
    disk_cache: Arc<DiskCache>,
    decoder: Arc<dyn Decoder>,
    synchronize_in_memory: Arc<AtomicBool>,
    config: Arc<CacheConfig>,
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("config", &self.config)
            .field("memory_entries", &self.memory_cache.len())
            .field("disk_cache", &self.disk_cache)
            .finish_non_exhaustive()
    }
}

impl CacheManager {
    /// Create a new cache manager with the specified configuration
    pub fn new(config: CacheConfig) -> CacheResult<Self> {
        Self::with_parts(config, Arc::new(PassthroughDecoder), Arc::new(SystemClock))
    }

    /// Create a cache manager that decodes disk hits with `decoder`
    pub fn with_decoder(config: CacheConfig, decoder: Arc<dyn Decoder>) -> CacheResult<Self> {
        Self::with_parts(config, decoder, Arc::new(SystemClock))
    }

    pub fn with_parts(
        config: CacheConfig,
        decoder: Arc<dyn Decoder>,
        clock: Arc<dyn Clock>,
    ) -> CacheResult<Self> {
        let memory_cache = Arc::new(MemoryCache::with_clock(
            config.memory_cost_limit,
            config.memory_count_limit,
            clock.clone(),
        ));
        let disk_cache = Arc::new(DiskCache::open_with_clock(
            config.resolved_disk_path(),
            config.max_disk_age,
            config.max_disk_size,
            clock,
        )?);

        Ok(Self {
            memory_cache,
            disk_cache,
            decoder,
            synchronize_in_memory: Arc::new(AtomicBool::new(config.synchronize_in_memory)),
            config: Arc::new(config),
        })
    }

    /// Process-wide instance with the default configuration.
    ///
    /// Tests and embedders that need isolation should use [`CacheManager::new`].
    pub fn shared() -> CacheResult<&'static CacheManager> {
        if let Some(manager) = SHARED.get() {
            return Ok(manager);
        }
        let manager = Self::new(CacheConfig::default())?;
        Ok(SHARED.get_or_init(|| manager))
    }

    /// Get configuration reference
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn memory(&self) -> &MemoryCache {
        &self.memory_cache
    }

    pub fn disk(&self) -> &DiskCache {
        &self.disk_cache
    }

    pub fn synchronize_in_memory(&self) -> bool {
        self.synchronize_in_memory.load(Ordering::Relaxed)
    }

    pub fn set_synchronize_in_memory(&self, enabled: bool) {
        self.synchronize_in_memory.store(enabled, Ordering::Relaxed);
    }

    /// Store a payload, costed by its length
    pub async fn store(&self, key: CacheKey, payload: Bytes, persist_to_disk: bool) -> CacheResult<()> {
        let cost = payload.len() as u64;
        self.store_with_cost(key, payload, cost, persist_to_disk).await
    }

    /// Store a [`Cacheable`] item's payload under its own key and cost
    pub async fn store_cacheable<C: Cacheable>(
        &self,
        item: &C,
        payload: Bytes,
        persist_to_disk: bool,
    ) -> CacheResult<()> {
        self.store_with_cost(item.cache_key(), payload, item.cache_cost(), persist_to_disk)
            .await
    }

    /// Store a payload with an explicit memory cost.
    ///
    /// The disk write is attempted even when the memory tier rejects the
    /// entry as too costly; the rejection is still reported.
    pub async fn store_with_cost(
        &self,
        key: CacheKey,
        payload: Bytes,
        cost: u64,
        persist_to_disk: bool,
    ) -> CacheResult<()> {
        let memory_result = self.memory_cache.insert(key.clone(), payload.clone(), cost);

        if persist_to_disk {
            let disk = Arc::clone(&self.disk_cache);
            spawn_blocking(move || disk.store(&key, &payload)).await??;
        }

        memory_result
    }

    /// Decode freshly fetched bytes, keep the decoded form in memory and the
    /// raw bytes on disk. Returns the decoded payload.
    ///
    /// A memory rejection is logged, not returned; the asset is still usable.
    pub async fn store_downloaded(
        &self,
        key: CacheKey,
        data: Bytes,
        persist_to_disk: bool,
    ) -> CacheResult<Bytes> {
        let decoder = Arc::clone(&self.decoder);
        let decode_key = key.clone();
        let raw = data.clone();
        let asset = spawn_blocking(move || decoder.decode(&decode_key, raw)).await??;

        if let Err(e) = self
            .memory_cache
            .insert_cacheable(&asset, asset.payload.clone())
        {
            debug!(key = %key, error = %e, "Downloaded asset not kept in memory");
        }

        if persist_to_disk {
            let disk = Arc::clone(&self.disk_cache);
            spawn_blocking(move || disk.store(&key, &data)).await??;
        }

        Ok(asset.payload)
    }

    /// Query both tiers.
    ///
    /// Memory is checked inline; on a miss the disk lookup and decode run on
    /// the blocking pool. A `CacheTier::None` result is a normal miss.
    pub async fn query(&self, key: &CacheKey) -> CacheResult<(Option<Bytes>, CacheTier)> {
        if let Some(entry) = self.memory_cache.lookup(key) {
            return Ok((Some(entry.payload), CacheTier::Memory));
        }

        let this = self.clone();
        let key = key.clone();
        spawn_blocking(move || this.query_disk_promoting(&key)).await?
    }

    /// Callback flavour of [`CacheManager::query`].
    ///
    /// A memory hit invokes `completion` before returning; otherwise it runs
    /// from a spawned task. Either way it fires exactly once, unless the
    /// returned handle is aborted first.
    pub fn query_with<F>(&self, key: &CacheKey, completion: F) -> Option<JoinHandle<()>>
    where
        F: FnOnce(CacheResult<(Option<Bytes>, CacheTier)>) + Send + 'static,
    {
        if let Some(entry) = self.memory_cache.lookup(key) {
            completion(Ok((Some(entry.payload), CacheTier::Memory)));
            return None;
        }

        let this = self.clone();
        let key = key.clone();
        Some(tokio::spawn(async move {
            let result = match spawn_blocking(move || this.query_disk_promoting(&key)).await {
                Ok(result) => result,
                Err(e) => Err(e.into()),
            };
            completion(result);
        }))
    }

    fn query_disk_promoting(&self, key: &CacheKey) -> CacheResult<(Option<Bytes>, CacheTier)> {
        let Some(data) = self.disk_cache.lookup(key)? else {
            return Ok((None, CacheTier::None));
        };
        let asset = self.decoder.decode(key, data)?;

        if self.synchronize_in_memory() {
            if let Err(e) = self
                .memory_cache
                .insert_cacheable(&asset, asset.payload.clone())
            {
                debug!(key = %key, error = %e, "Disk hit not promoted to memory");
            }
        }

        Ok((Some(asset.payload), CacheTier::Disk))
    }

    /// Memory-only lookup
    pub fn query_memory(&self, key: &CacheKey) -> Option<Bytes> {
        self.memory_cache.lookup(key).map(|entry| entry.payload)
    }

    /// Blocking disk-only lookup, passed through the decoder.
    ///
    /// Never promotes into memory; call from a blocking context.
    pub fn query_disk(&self, key: &CacheKey) -> CacheResult<Option<Bytes>> {
        match self.disk_cache.lookup(key)? {
            Some(data) => Ok(Some(self.decoder.decode(key, data)?.payload)),
            None => Ok(None),
        }
    }

    /// Remove a key from memory and, optionally, from disk
    pub async fn remove(&self, key: &CacheKey, from_disk: bool) -> CacheResult<()> {
        self.memory_cache.remove(key)?;

        if from_disk {
            let disk = Arc::clone(&self.disk_cache);
            let key = key.clone();
            spawn_blocking(move || disk.delete(&key)).await??;
        }
        Ok(())
    }

    /// Check memory first, then disk. Blocks on disk I/O when memory misses.
    pub fn exists(&self, key: &CacheKey) -> CacheResult<bool> {
        if self.memory_cache.contains(key)? {
            return Ok(true);
        }
        self.disk_cache.exists(key)
    }

    pub async fn exists_async(&self, key: &CacheKey) -> CacheResult<bool> {
        if self.memory_cache.contains(key)? {
            return Ok(true);
        }
        self.contains_on_disk_async(key).await
    }

    pub fn contains_in_memory(&self, key: &CacheKey) -> bool {
        self.memory_cache.contains(key).unwrap_or(false)
    }

    pub fn contains_on_disk(&self, key: &CacheKey) -> CacheResult<bool> {
        self.disk_cache.exists(key)
    }

    pub async fn contains_on_disk_async(&self, key: &CacheKey) -> CacheResult<bool> {
        let disk = Arc::clone(&self.disk_cache);
        let key = key.clone();
        spawn_blocking(move || disk.exists(&key)).await?
    }

    pub fn clear_memory(&self) {
        // Memory clearing cannot fail
        let _ = self.memory_cache.clear();
    }

    pub async fn clear_disk(&self) -> CacheResult<()> {
        let disk = Arc::clone(&self.disk_cache);
        spawn_blocking(move || disk.clear()).await?
    }

    /// Clear all entries
    pub async fn clear(&self) -> CacheResult<()> {
        self.clear_memory();
        self.clear_disk().await
    }

    /// Total bytes and entry count of the disk tier
    pub async fn disk_size(&self) -> CacheResult<(u64, usize)> {
        let disk = Arc::clone(&self.disk_cache);
        Ok(spawn_blocking(move || (disk.total_size(), disk.entry_count())).await?)
    }

    /// Drop expired disk entries and enforce both tiers' limits
    pub async fn sweep(&self) -> CacheResult<()> {
        self.memory_cache.sweep()?;
        let disk = Arc::clone(&self.disk_cache);
        spawn_blocking(move || disk.sweep()).await?
    }

    /// Start a background maintenance task that sweeps every `interval`
    /// until `cancel` fires
    pub fn start_maintenance_task(
        &self,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            info!(interval = ?interval, "Cache maintenance task started");
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = this.sweep().await {
                            warn!(error = %e, "Cache maintenance error");
                        }
                    }
                }
            }
            debug!("Cache maintenance task stopped");
        })
    }
}
