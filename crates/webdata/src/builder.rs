//! Chained construction of [`DownloaderConfig`].
//!
//! Every setter consumes and returns the builder; unset fields keep the
//! values from [`DownloaderConfig::default`].
//!
//!
//! ```
//! use std::time::Duration;
//! use webdata_engine::{DownloadOrder, DownloaderConfig};
//!
//! let config = DownloaderConfig::builder()
//!     .with_max_concurrent(4)
//!     .with_order(DownloadOrder::Lifo)
//!     .with_timeout(Duration::from_secs(30))
//!     .with_user_agent("gallery/2.3")
//!     .with_header("X-Tenant", "north")
//!     .with_credentials("user", "pass")
//!     .build();
//!
//! assert_eq!(config.max_concurrent, 4);
//! ```

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::trace;

use crate::config::Credentials;
use crate::download::DownloadOrder;
use crate::DownloaderConfig;

/// Accumulates overrides on top of the default downloader settings
#[derive(Debug, Clone)]
pub struct DownloaderConfigBuilder {
    config: DownloaderConfig,
}

impl DownloaderConfigBuilder {
    /// Starts from [`DownloaderConfig::default`]
    pub fn new() -> Self {
        Self {
            config: DownloaderConfig::default(),
        }
    }

    /// Set the maximum number of concurrent downloads, at least one
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.config.max_concurrent = max_concurrent.max(1);
        self
    }

    /// Set the admission order of queued downloads
    pub fn with_order(mut self, order: DownloadOrder) -> Self {
        self.config.order = order;
        self
    }

    /// Limit for a whole transfer; zero disables it
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Limit for establishing the TCP/TLS connection; zero disables it
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Follow up to ten redirects when enabled
    pub fn with_follow_redirects(mut self, follow: bool) -> Self {
        self.config.follow_redirects = follow;
        self
    }

    /// Honor proxy environment variables
    pub fn with_system_proxy(mut self, use_system_proxy: bool) -> Self {
        self.config.use_system_proxy = use_system_proxy;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    /// Insert one default header. Names or values that fail to parse are
    /// dropped silently.
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        let parsed = HeaderName::try_from(name.as_ref())
            .ok()
            .zip(HeaderValue::try_from(value.as_ref()).ok());
        match parsed {
            Some((name, value)) => {
                self.config.headers.insert(name, value);
            }
            None => trace!(name = name.as_ref(), "Ignoring unparsable header"),
        }
        self
    }

    /// Replace the whole default header map
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.config.headers = headers;
        self
    }

    /// Send basic auth credentials with every request
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.credentials = Some(Credentials::new(username, password));
        self
    }

    /// Set the buffer size of the lifecycle event channel
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity.max(1);
        self
    }

    pub fn build(self) -> DownloaderConfig {
        self.config
    }
}

impl Default for DownloaderConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
