//! # WebData Engine
//!
//! A client-side asset cache paired with a concurrency-bounded download
//! scheduler, for applications that repeatedly fetch remote binary resources.
//!
//! ## Features
//!
//! - Two-tier cache: cost-bounded LRU memory tier over an age and size bounded disk tier
//! - Crash-consistent disk index with write-then-rename publishing
//! - Download scheduling with a concurrency cap, FIFO/LIFO order and priority lanes
//! - Coalescing of duplicate in-flight requests with observer-counted cancellation
//! - Pluggable transport (reqwest by default) and decoder

pub mod builder;
pub mod cache;
pub mod codec;
pub mod config;
pub mod download;
pub mod error;
pub mod loader;
#[doc(hidden)]
pub mod test_utils;

pub use builder::DownloaderConfigBuilder;
pub use cache::{CacheConfig, CacheKey, CacheManager, CacheTier, Cacheable};
pub use codec::{DecodedAsset, Decoder, PassthroughDecoder};
pub use config::{Credentials, DownloaderConfig};
pub use download::{
    DownloadEvent, DownloadObserver, DownloadOptions, DownloadOrder, DownloadOutcome,
    DownloadProgress, DownloadTicket, Downloader, HttpTransport, ObserverHandle, OperationState,
    Transport,
};
pub use error::{CacheError, DownloadError, LoadError};
pub use loader::{LoadedAsset, WebDataLoader};
