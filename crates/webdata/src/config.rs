use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

use crate::download::DownloadOrder;

const DEFAULT_USER_AGENT: &str = concat!("webdata-engine/", env!("CARGO_PKG_VERSION"));

/// Username and password sent as HTTP basic auth
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Settings shared by every request the downloader issues
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// Maximum number of downloads running at once
    pub max_concurrent: usize,

    /// Order in which queued downloads are admitted
    pub order: DownloadOrder,

    /// Overall timeout for a single download, zero for none
    pub timeout: Duration,

    /// Limit for establishing a connection; zero disables it
    pub connect_timeout: Duration,

    /// Follow redirects (at most ten hops)
    pub follow_redirects: bool,

    /// Whether to honour the system proxy settings
    pub use_system_proxy: bool,

    /// Value of the `User-Agent` header
    pub user_agent: String,

    /// Headers sent with every request
    pub headers: HeaderMap,

    /// Basic auth credentials sent with every request
    pub credentials: Option<Credentials>,

    /// Buffer size of the lifecycle event channel
    pub event_capacity: usize,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 6,
            order: DownloadOrder::Fifo,
            timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(10),
            follow_redirects: true,
            use_system_proxy: true,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: DownloaderConfig::get_default_headers(),
            credentials: None,
            event_capacity: 64,
        }
    }
}

impl DownloaderConfig {
    pub fn builder() -> crate::builder::DownloaderConfigBuilder {
        crate::builder::DownloaderConfigBuilder::new()
    }

    pub fn get_default_headers() -> HeaderMap {
        let mut default_headers = HeaderMap::new();

        default_headers.insert(
            reqwest::header::ACCEPT,
            HeaderValue::from_static("image/*,*/*;q=0.8"),
        );

        default_headers
    }
}
