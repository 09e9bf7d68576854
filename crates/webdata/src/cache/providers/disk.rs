//! # Disk Cache
//!
//! This module implements the persistent tier: one file per entry, named by
//! the SHA-256 digest of its key, plus an index used for age and size
//! accounting.
//!
//! Payloads are written to a temporary file in the cache root and renamed
//! into place, so readers and a crash mid-write only ever observe complete
//! files. Age eviction is applied eagerly on `get`/`contains` and in bulk by
//! `sweep`; size eviction removes the oldest stored entries first.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::cache::clock::{Clock, SystemClock, duration_millis};
use crate::cache::providers::CacheProvider;
use crate::cache::providers::index::{DiskIndex, TEMP_PREFIX, is_expired};
use crate::cache::types::{CacheKey, CacheResult};
use crate::error::CacheError;

pub struct DiskCache {
    cache_dir: PathBuf,
    index: Mutex<DiskIndex>,
    /// 0 disables ageing
    max_age_ms: AtomicU64,
    /// 0 disables size eviction
    max_size: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for DiskCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskCache")
            .field("cache_dir", &self.cache_dir)
            .field("max_age_ms", &self.max_age_ms)
            .field("max_size", &self.max_size)
            .finish()
    }
}

impl DiskCache {
    /// Open (or create) a disk cache rooted at `cache_dir`
    pub fn open(cache_dir: impl Into<PathBuf>, max_age: Duration, max_size: u64) -> CacheResult<Self> {
        Self::open_with_clock(cache_dir, max_age, max_size, Arc::new(SystemClock))
    }

    pub fn open_with_clock(
        cache_dir: impl Into<PathBuf>,
        max_age: Duration,
        max_size: u64,
        clock: Arc<dyn Clock>,
    ) -> CacheResult<Self> {
        let cache_dir = cache_dir.into();
        std::fs::create_dir_all(&cache_dir)?;

        let mut index = match DiskIndex::load(&cache_dir) {
            Ok(index) => index,
            Err(e) => {
                warn!(dir = ?cache_dir, error = %e, "Disk cache index unusable, rebuilding from directory");
                DiskIndex::rebuild(&cache_dir)?
            }
        };
        if index.reconcile(&cache_dir)? {
            index.save(&cache_dir)?;
        }

        info!(
            dir = ?cache_dir,
            entries = index.len(),
            size = index.total_size(),
            "Disk cache opened"
        );

        Ok(Self {
            cache_dir,
            index: Mutex::new(index),
            max_age_ms: AtomicU64::new(duration_millis(max_age)),
            max_size: AtomicU64::new(max_size),
            clock,
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn set_max_age(&self, max_age: Duration) {
        self.max_age_ms
            .store(duration_millis(max_age), Ordering::Relaxed);
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_millis(self.max_age_ms.load(Ordering::Relaxed))
    }

    pub fn set_max_size(&self, max_size: u64) {
        self.max_size.store(max_size, Ordering::Relaxed);
    }

    pub fn max_size(&self) -> u64 {
        self.max_size.load(Ordering::Relaxed)
    }

    /// Total bytes of all indexed entries
    pub fn total_size(&self) -> u64 {
        self.index.lock().total_size()
    }

    pub fn entry_count(&self) -> usize {
        self.index.lock().len()
    }

    fn entry_path(&self, digest: &str) -> PathBuf {
        self.cache_dir.join(digest)
    }

    /// Delete an entry's file, tolerating files that are already gone.
    fn discard_file(&self, digest: &str) -> io::Result<()> {
        let path = self.entry_path(digest);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!(path = ?path, error = %e, "Failed to remove cache file");
                Err(e)
            }
        }
    }

    /// Remove an entry from the index and disk. The row is dropped even when
    /// the file cannot be deleted; the file is cleaned up by the next open.
    fn evict_locked(&self, index: &mut DiskIndex, digest: &str) -> io::Result<()> {
        index.remove(digest);
        self.discard_file(digest)
    }

    fn evict_expired_locked(&self, index: &mut DiskIndex) -> usize {
        let max_age_ms = self.max_age_ms.load(Ordering::Relaxed);
        if max_age_ms == 0 {
            return 0;
        }
        let expired = index.expired(self.clock.now_millis(), max_age_ms);
        for digest in &expired {
            let _ = self.evict_locked(index, digest);
        }
        expired.len()
    }

    fn evict_oversize_locked(&self, index: &mut DiskIndex) -> usize {
        let max_size = self.max_size.load(Ordering::Relaxed);
        if max_size == 0 {
            return 0;
        }
        let mut evicted = 0;
        while index.total_size() > max_size {
            let Some(digest) = index.oldest() else {
                break;
            };
            let _ = self.evict_locked(index, &digest);
            evicted += 1;
        }
        evicted
    }

    /// Look up a live index row for `key`, evicting it if it has aged out.
    ///
    /// Returns the digest when the row exists, belongs to `key` and is fresh.
    fn live_digest_locked(
        &self,
        index: &mut DiskIndex,
        key: &CacheKey,
    ) -> CacheResult<Option<String>> {
        let digest = key.to_filename();
        let Some(entry) = index.get(&digest) else {
            return Ok(None);
        };

        if let Some(stored_key) = &entry.key {
            if stored_key != key {
                warn!(key = %key, stored = %stored_key, "Digest collision in disk cache, treating as miss");
                return Ok(None);
            }
        }

        if is_expired(
            entry,
            self.clock.now_millis(),
            self.max_age_ms.load(Ordering::Relaxed),
        ) {
            debug!(key = %key, "Disk cache entry expired");
            let _ = self.evict_locked(index, &digest);
            index.save(&self.cache_dir)?;
            return Ok(None);
        }

        index.claim(&digest, key);
        Ok(Some(digest))
    }

    /// Store `data` under `key`, replacing any previous entry
    pub fn store(&self, key: &CacheKey, data: &[u8]) -> CacheResult<()> {
        let size = data.len() as u64;
        let max_size = self.max_size.load(Ordering::Relaxed);
        if max_size > 0 && size > max_size {
            warn!(key = %key, size, limit = max_size, "Entry too large for disk cache, rejecting");
            return Err(CacheError::EntryTooLarge {
                key: key.to_string(),
                size,
                limit: max_size,
            });
        }

        // Write the payload outside the lock; only the rename is serialised
        let mut tmp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(&self.cache_dir)?;
        if let Err(e) = tmp.write_all(data).and_then(|_| tmp.as_file().sync_all()) {
            warn!(key = %key, error = %e, "Failed to write cache data file");
            return Err(e.into());
        }

        let digest = key.to_filename();
        let mut index = self.index.lock();

        if let Err(e) = tmp.persist(self.entry_path(&digest)) {
            warn!(key = %key, error = %e.error, "Failed to rename temporary data file");
            return Err(e.error.into());
        }

        index.insert(digest, key.clone(), size, self.clock.now_millis());
        let evicted = self.evict_oversize_locked(&mut index);
        if evicted > 0 {
            debug!(evicted, total = index.total_size(), "Disk cache evicted oldest entries");
        }
        index.save(&self.cache_dir)?;

        debug!(key = %key, size, "Cached entry to disk");
        Ok(())
    }

    /// Read the payload stored under `key`
    pub fn lookup(&self, key: &CacheKey) -> CacheResult<Option<Bytes>> {
        let digest = {
            let mut index = self.index.lock();
            match self.live_digest_locked(&mut index, key)? {
                Some(digest) => digest,
                None => return Ok(None),
            }
        };

        match std::fs::read(self.entry_path(&digest)) {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // Removed underneath us, by a concurrent remove or externally
                let mut index = self.index.lock();
                if !self.entry_path(&digest).exists() && index.remove(&digest).is_some() {
                    index.save(&self.cache_dir)?;
                }
                Ok(None)
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to read cache data file");
                Err(e.into())
            }
        }
    }

    /// Whether a fresh entry for `key` exists
    pub fn exists(&self, key: &CacheKey) -> CacheResult<bool> {
        let mut index = self.index.lock();
        let Some(digest) = self.live_digest_locked(&mut index, key)? else {
            return Ok(false);
        };
        if self.entry_path(&digest).is_file() {
            return Ok(true);
        }
        index.remove(&digest);
        index.save(&self.cache_dir)?;
        Ok(false)
    }

    /// Remove the entry for `key`, if any
    pub fn delete(&self, key: &CacheKey) -> CacheResult<()> {
        let digest = key.to_filename();
        let mut index = self.index.lock();
        let had_row = index.get(&digest).is_some();
        let result = self.evict_locked(&mut index, &digest);
        if had_row {
            index.save(&self.cache_dir)?;
        }
        result?;
        Ok(())
    }

    /// Remove every file under the cache root
    pub fn purge(&self) -> CacheResult<()> {
        let mut index = self.index.lock();
        index.reset();

        let mut first_error = None;
        let mut removed = 0;
        for dir_entry in std::fs::read_dir(&self.cache_dir)? {
            let path = match dir_entry {
                Ok(entry) => entry.path(),
                Err(e) => {
                    warn!(dir = ?self.cache_dir, error = %e, "Failed to read cache directory entry");
                    first_error.get_or_insert(e);
                    continue;
                }
            };
            let result = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            match result {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = ?path, error = %e, "Failed to remove cache file");
                    first_error.get_or_insert(e);
                }
            }
        }

        debug!(count = removed, "Cleared disk cache entries");
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Drop expired entries, then trim to the size budget
    pub fn clean(&self) -> CacheResult<()> {
        let mut index = self.index.lock();
        let expired = self.evict_expired_locked(&mut index);
        let oversize = self.evict_oversize_locked(&mut index);
        if expired > 0 || oversize > 0 {
            index.save(&self.cache_dir)?;
            info!(
                expired,
                oversize,
                remaining = index.len(),
                size = index.total_size(),
                "Disk cache sweep finished"
            );
        }
        Ok(())
    }
}

impl CacheProvider for DiskCache {
    fn contains(&self, key: &CacheKey) -> CacheResult<bool> {
        self.exists(key)
    }

    fn get(&self, key: &CacheKey) -> CacheResult<Option<Bytes>> {
        self.lookup(key)
    }

    fn put(&self, key: CacheKey, data: Bytes) -> CacheResult<()> {
        self.store(&key, &data)
    }

    fn remove(&self, key: &CacheKey) -> CacheResult<()> {
        self.delete(key)
    }

    fn clear(&self) -> CacheResult<()> {
        self.purge()
    }

    fn sweep(&self) -> CacheResult<()> {
        self.clean()
    }
}
