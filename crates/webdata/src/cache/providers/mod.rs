//! # Cache Providers
//!
//! This module contains the memory and disk tier implementations.

pub use self::disk::DiskCache;
pub use self::memory::MemoryCache;
pub use self::provider::CacheProvider;

// Provider interface
pub mod provider;

// Individual tiers
pub mod disk;
mod index;
pub mod memory;
