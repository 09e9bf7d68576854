//! # Transport
//!
//! The seam between the scheduler and the network. [`crate::download::HttpTransport`]
//! is the production implementation; tests plug in scripted ones.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::DownloadError;
use crate::config::Credentials;
use crate::download::options::DownloadOptions;

/// Everything a transport needs to perform one fetch
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub url: Url,
    pub options: DownloadOptions,
    pub headers: HeaderMap,
    pub credentials: Option<Credentials>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub data: Bytes,
    pub status: StatusCode,
    /// Content length announced by the server, if any
    pub expected_len: Option<u64>,
    /// The body was served from a transport-level cache
    pub from_cache: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportSignal {
    ResponseReceived { expected: Option<u64> },
    Progress { received: u64, expected: Option<u64> },
}

/// Sink for transport progress, handed to every fetch
#[derive(Clone)]
pub struct ProgressReporter {
    sink: Arc<dyn Fn(TransportSignal) + Send + Sync>,
}

impl ProgressReporter {
    pub fn new(sink: impl Fn(TransportSignal) + Send + Sync + 'static) -> Self {
        Self {
            sink: Arc::new(sink),
        }
    }

    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    pub fn response_received(&self, expected: Option<u64>) {
        (self.sink)(TransportSignal::ResponseReceived { expected });
    }

    pub fn progress(&self, received: u64, expected: Option<u64>) {
        (self.sink)(TransportSignal::Progress { received, expected });
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter").finish_non_exhaustive()
    }
}

/// Performs the actual network fetch for a download.
///
/// Implementations must return promptly with [`DownloadError::Cancelled`]
/// once `cancel` fires.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch(
        &self,
        request: TransportRequest,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> Result<TransportResponse, DownloadError>;
}
