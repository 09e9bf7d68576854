//! # Loader
//!
//! Sequences a cache lookup, a download on miss, and the store of the
//! decoded result. The cache and the downloader stay independent; this type
//! only wires them together.

use bytes::Bytes;
use tracing::{debug, warn};

use crate::cache::{CacheKey, CacheManager, CacheTier};
use crate::download::{DownloadOptions, DownloadOutcome, DownloadProgress, Downloader};
use crate::error::{DownloadError, LoadError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedAsset {
    pub key: CacheKey,
    /// `None` when the transport answered from its own cache and the request
    /// asked to ignore such answers
    pub payload: Option<Bytes>,
    /// Where the payload came from; [`CacheTier::None`] means the network
    pub tier: CacheTier,
}

#[derive(Debug, Clone)]
pub struct WebDataLoader {
    cache: CacheManager,
    downloader: Downloader,
    persist_to_disk: bool,
}

impl WebDataLoader {
    pub fn new(cache: CacheManager, downloader: Downloader) -> Self {
        Self {
            cache,
            downloader,
            persist_to_disk: true,
        }
    }

    /// Keep downloaded assets in memory only
    pub fn memory_only(mut self) -> Self {
        self.persist_to_disk = false;
        self
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    pub fn downloader(&self) -> &Downloader {
        &self.downloader
    }

    pub async fn load(&self, url: &str, options: DownloadOptions) -> Result<LoadedAsset, LoadError> {
        self.load_with_progress(url, options, |_| {}).await
    }

    pub async fn load_with_progress(
        &self,
        url: &str,
        options: DownloadOptions,
        progress: impl Fn(DownloadProgress) + Send + Sync + 'static,
    ) -> Result<LoadedAsset, LoadError> {
        let key = CacheKey::from_url(url);

        match self.cache.query(&key).await {
            Ok((Some(payload), tier)) => {
                debug!(%key, ?tier, "Served from cache");
                return Ok(LoadedAsset {
                    key,
                    payload: Some(payload),
                    tier,
                });
            }
            Ok((None, _)) => {}
            Err(e) => warn!(%key, error = %e, "Cache lookup failed, fetching from network"),
        }

        let ticket = self
            .downloader
            .download_with_progress(url, options, progress)?;
        let data = match ticket.outcome().await {
            DownloadOutcome::Finished {
                data,
                error: None,
            } => data,
            DownloadOutcome::Finished {
                error: Some(e), ..
            }
            | DownloadOutcome::Failed(e) => return Err(e.into()),
            DownloadOutcome::Cancelled => return Err(DownloadError::Cancelled.into()),
        };

        let payload = match data {
            Some(data) if !data.is_empty() => Some(
                self.cache
                    .store_downloaded(key.clone(), data, self.persist_to_disk)
                    .await?,
            ),
            // Empty bodies are passed through but never cached
            other => {
                debug!(%key, "Nothing to cache for empty download");
                other
            }
        };

        Ok(LoadedAsset {
            key,
            payload,
            tier: CacheTier::None,
        })
    }
}
