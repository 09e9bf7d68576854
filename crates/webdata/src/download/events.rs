use crate::cache::CacheKey;

/// Lifecycle notifications broadcast by the downloader.
///
/// `Stopped` is sent whenever a started transfer ends for any reason;
/// `Finished` only when it ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadEvent {
    Started(CacheKey),
    ResponseReceived(CacheKey),
    Stopped(CacheKey),
    Finished(CacheKey),
}

impl DownloadEvent {
    pub fn key(&self) -> &CacheKey {
        match self {
            DownloadEvent::Started(key)
            | DownloadEvent::ResponseReceived(key)
            | DownloadEvent::Stopped(key)
            | DownloadEvent::Finished(key) => key,
        }
    }
}
