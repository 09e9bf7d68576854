//! Persisted accounting for the disk tier.
//!
//! The index maps each digest file name to the logical key, its size and the
//! time it was stored. It is written with write-then-rename so a crash leaves
//! either the old or the new index on disk, and it is reconciled against the
//! directory on open so files renamed into place just before a crash are
//! adopted rather than orphaned.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::clock::duration_millis;
use crate::cache::types::{CacheKey, CacheResult};
use crate::error::CacheError;

pub(crate) const INDEX_FILE: &str = "index.json";
pub(crate) const TEMP_PREFIX: &str = ".tmp";
const INDEX_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct IndexEntry {
    /// Logical key; unknown for files adopted from a directory scan
    pub key: Option<CacheKey>,
    pub size: u64,
    /// Milliseconds since the Unix epoch
    pub stored_at: u64,
    /// Store order, breaks ties between equal timestamps
    pub seq: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct DiskIndex {
    version: u32,
    next_seq: u64,
    entries: HashMap<String, IndexEntry>,
    #[serde(skip)]
    total_size: u64,
}

/// Digest file names are 64 lowercase hex characters
pub(crate) fn is_digest_name(name: &str) -> bool {
    name.len() == 64 && name.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

impl DiskIndex {
    pub fn new() -> Self {
        Self {
            version: INDEX_VERSION,
            ..Default::default()
        }
    }

    /// Read the index from `root`.
    ///
    /// A missing index is an empty one; an unreadable one is `CorruptIndex`.
    pub fn load(root: &Path) -> CacheResult<Self> {
        let bytes = match fs::read(root.join(INDEX_FILE)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(e) => return Err(CacheError::CorruptIndex(e.to_string())),
        };

        let mut index: DiskIndex = serde_json::from_slice(&bytes)
            .map_err(|e| CacheError::CorruptIndex(e.to_string()))?;
        if index.version != INDEX_VERSION {
            return Err(CacheError::CorruptIndex(format!(
                "unsupported index version {}",
                index.version
            )));
        }
        index.recompute_total();
        Ok(index)
    }

    /// Build an index from the files present in `root`
    pub fn rebuild(root: &Path) -> CacheResult<Self> {
        let mut index = Self::new();
        index.adopt_untracked(root)?;
        debug!(entries = index.entries.len(), "Rebuilt disk cache index from directory scan");
        Ok(index)
    }

    /// Bring the index in line with the directory contents.
    ///
    /// Removes stale temporary files, drops rows whose file is gone and adopts
    /// digest-named files the index does not know about. Returns whether the
    /// index changed.
    pub fn reconcile(&mut self, root: &Path) -> CacheResult<bool> {
        let before = self.entries.len();
        self.entries
            .retain(|digest, _| root.join(digest).is_file());
        let dropped = before - self.entries.len();

        let adopted = self.adopt_untracked(root)?;
        self.recompute_total();

        if dropped > 0 || adopted > 0 {
            debug!(dropped, adopted, "Reconciled disk cache index");
        }
        Ok(dropped > 0 || adopted > 0)
    }

    fn adopt_untracked(&mut self, root: &Path) -> CacheResult<usize> {
        let mut found = Vec::new();

        for dir_entry in fs::read_dir(root)? {
            let dir_entry = dir_entry?;
            let name = dir_entry.file_name().to_string_lossy().into_owned();

            if name.starts_with(TEMP_PREFIX) {
                // Left behind by a write interrupted before its rename
                if let Err(e) = fs::remove_file(dir_entry.path()) {
                    warn!(path = ?dir_entry.path(), error = %e, "Failed to remove stale temporary file");
                }
                continue;
            }
            if !is_digest_name(&name) || self.entries.contains_key(&name) {
                continue;
            }

            let metadata = match dir_entry.metadata() {
                Ok(m) if m.is_file() => m,
                Ok(_) => continue,
                Err(e) => {
                    warn!(path = ?dir_entry.path(), error = %e, "Failed to stat cache file");
                    continue;
                }
            };
            let stored_at = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(duration_millis)
                .unwrap_or_default();
            found.push((name, metadata.len(), stored_at));
        }

        // Oldest files get the lowest sequence numbers
        found.sort_by(|a, b| a.2.cmp(&b.2).then_with(|| a.0.cmp(&b.0)));
        let adopted = found.len();
        for (digest, size, stored_at) in found {
            let seq = self.bump_seq();
            self.total_size += size;
            self.entries.insert(
                digest,
                IndexEntry {
                    key: None,
                    size,
                    stored_at,
                    seq,
                },
            );
        }
        Ok(adopted)
    }

    /// Persist the index atomically
    pub fn save(&self, root: &Path) -> CacheResult<()> {
        let json = serde_json::to_vec(self)?;
        let mut tmp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(root)?;
        tmp.write_all(&json)?;
        tmp.as_file().sync_all()?;
        tmp.persist(root.join(INDEX_FILE))
            .map_err(|e| CacheError::from(e.error))?;
        Ok(())
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn recompute_total(&mut self) {
        self.total_size = self.entries.values().map(|e| e.size).sum();
    }

    pub fn get(&self, digest: &str) -> Option<&IndexEntry> {
        self.entries.get(digest)
    }

    pub fn insert(&mut self, digest: String, key: CacheKey, size: u64, stored_at: u64) {
        let seq = self.bump_seq();
        let entry = IndexEntry {
            key: Some(key),
            size,
            stored_at,
            seq,
        };
        if let Some(previous) = self.entries.insert(digest, entry) {
            self.total_size -= previous.size;
        }
        self.total_size += size;
    }

    /// Record the logical key of an adopted entry once a lookup names it
    pub fn claim(&mut self, digest: &str, key: &CacheKey) {
        if let Some(entry) = self.entries.get_mut(digest) {
            if entry.key.is_none() {
                entry.key = Some(key.clone());
            }
        }
    }

    pub fn remove(&mut self, digest: &str) -> Option<IndexEntry> {
        let removed = self.entries.remove(digest)?;
        self.total_size -= removed.size;
        Some(removed)
    }

    /// Digest of the entry stored first
    pub fn oldest(&self) -> Option<String> {
        self.entries
            .iter()
            .min_by_key(|(_, e)| (e.stored_at, e.seq))
            .map(|(digest, _)| digest.clone())
    }

    /// Digests of entries stored more than `max_age_ms` before `now`
    pub fn expired(&self, now: u64, max_age_ms: u64) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, e)| is_expired(e, now, max_age_ms))
            .map(|(digest, _)| digest.clone())
            .collect()
    }

    /// Forget every entry while keeping the sequence counter monotonic
    pub fn reset(&mut self) {
        self.entries.clear();
        self.total_size = 0;
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Zero `max_age_ms` disables ageing
pub(crate) fn is_expired(entry: &IndexEntry, now: u64, max_age_ms: u64) -> bool {
    max_age_ms > 0 && now.saturating_sub(entry.stored_at) > max_age_ms
}
