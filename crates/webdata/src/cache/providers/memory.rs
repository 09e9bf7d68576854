//! # Memory Cache Provider
//!
//! In-process tier with cost- and count-bounded least-recently-used eviction.
//!
//! Every mutation, including the recency bump done by a lookup, happens under
//! one lock together with the aggregate cost counter, so concurrent stores
//! can never leave the tier above its limits.

use std::sync::Arc;

use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::cache::clock::{Clock, SystemClock};
use crate::cache::providers::CacheProvider;
use crate::cache::types::{CacheEntry, CacheKey, CacheResult, Cacheable};
use crate::error::CacheError;

struct MemoryState {
    /// Entries ordered from least to most recently used
    entries: LruCache<CacheKey, CacheEntry>,
    /// Sum of the costs of all entries
    total_cost: u64,
    /// 0 means unbounded
    cost_limit: u64,
    /// 0 means unbounded
    count_limit: usize,
}

impl MemoryState {
    fn over_limits(&self) -> bool {
        (self.cost_limit > 0 && self.total_cost > self.cost_limit)
            || (self.count_limit > 0 && self.entries.len() > self.count_limit)
    }

    fn evict_to_limits(&mut self) -> usize {
        let mut evicted = 0;
        while self.over_limits() {
            let Some((key, entry)) = self.entries.pop_lru() else {
                break;
            };
            self.total_cost -= entry.cost;
            evicted += 1;
            debug!(key = %key, cost = entry.cost, "Evicted entry from memory cache");
        }
        evicted
    }
}

/// Memory cache provider implementation
pub struct MemoryCache {
    state: Mutex<MemoryState>,
    clock: Arc<dyn Clock>,
}

impl MemoryCache {
    /// Create a new memory cache with the given limits, 0 meaning unbounded
    pub fn new(cost_limit: u64, count_limit: usize) -> Self {
        Self::with_clock(cost_limit, count_limit, Arc::new(SystemClock))
    }

    pub fn with_clock(cost_limit: u64, count_limit: usize, clock: Arc<dyn Clock>) -> Self {
        debug!(cost_limit, count_limit, "Memory cache created");

        Self {
            state: Mutex::new(MemoryState {
                entries: LruCache::unbounded(),
                total_cost: 0,
                cost_limit,
                count_limit,
            }),
            clock,
        }
    }

    /// Store a payload with an explicit cost.
    ///
    /// A payload whose cost alone exceeds the cost limit is rejected with
    /// [`CacheError::CostExceeded`] and the tier is left untouched.
    pub fn insert(&self, key: CacheKey, payload: Bytes, cost: u64) -> CacheResult<()> {
        let mut state = self.state.lock();

        if state.cost_limit > 0 && cost > state.cost_limit {
            warn!(
                key = %key,
                cost,
                limit = state.cost_limit,
                "Entry too costly for memory cache, rejecting"
            );
            return Err(CacheError::CostExceeded {
                key: key.to_string(),
                cost,
                limit: state.cost_limit,
            });
        }

        let entry = CacheEntry::new(key.clone(), payload, cost, self.clock.now_millis());
        if let Some(previous) = state.entries.put(key, entry) {
            state.total_cost -= previous.cost;
        }
        state.total_cost += cost;
        state.evict_to_limits();

        Ok(())
    }

    /// Store any [`Cacheable`] value together with its payload
    pub fn insert_cacheable<C: Cacheable>(&self, item: &C, payload: Bytes) -> CacheResult<()> {
        self.insert(item.cache_key(), payload, item.cache_cost())
    }

    /// Look up an entry, marking it as the most recently used
    pub fn lookup(&self, key: &CacheKey) -> Option<CacheEntry> {
        let now = self.clock.now_millis();
        let mut state = self.state.lock();
        let entry = state.entries.get_mut(key)?;
        entry.last_access = now;
        Some(entry.clone())
    }

    /// Change the cost limit, evicting immediately if the tier is now over it
    pub fn set_cost_limit(&self, limit: u64) {
        let mut state = self.state.lock();
        state.cost_limit = limit;
        state.evict_to_limits();
    }

    /// Change the count limit, evicting immediately if the tier is now over it
    pub fn set_count_limit(&self, limit: usize) {
        let mut state = self.state.lock();
        state.count_limit = limit;
        state.evict_to_limits();
    }

    pub fn cost_limit(&self) -> u64 {
        self.state.lock().cost_limit
    }

    pub fn count_limit(&self) -> usize {
        self.state.lock().count_limit
    }

    pub fn total_cost(&self) -> u64 {
        self.state.lock().total_cost
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheProvider for MemoryCache {
    fn contains(&self, key: &CacheKey) -> CacheResult<bool> {
        Ok(self.state.lock().entries.contains(key))
    }

    fn get(&self, key: &CacheKey) -> CacheResult<Option<Bytes>> {
        Ok(self.lookup(key).map(|entry| entry.payload))
    }

    fn put(&self, key: CacheKey, data: Bytes) -> CacheResult<()> {
        let cost = data.len() as u64;
        self.insert(key, data, cost)
    }

    fn remove(&self, key: &CacheKey) -> CacheResult<()> {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.pop(key) {
            state.total_cost -= entry.cost;
            debug!(key = %key, "Removed entry from memory cache");
        }
        Ok(())
    }

    fn clear(&self) -> CacheResult<()> {
        let mut state = self.state.lock();
        state.entries.clear();
        state.total_cost = 0;

        debug!("Memory cache cleared");
        Ok(())
    }

    fn sweep(&self) -> CacheResult<()> {
        // Limits are enforced on every store; nothing ages out of memory.
        let evicted = self.state.lock().evict_to_limits();
        if evicted > 0 {
            debug!(evicted, "Memory cache sweep evicted entries");
        }
        Ok(())
    }
}
