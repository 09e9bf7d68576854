//! # Cache System
//!
//! Two-tier cache for downloaded assets: a bounded in-memory tier with
//! least-recently-used eviction in front of a persistent disk tier with age
//! and size eviction. [`CacheManager`] ties them together.

pub mod clock;
mod manager;
pub mod providers;
mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use manager::CacheManager;
pub use types::{CacheConfig, CacheEntry, CacheKey, CacheResult, CacheTier, Cacheable};

pub use providers::{CacheProvider, DiskCache, MemoryCache};
