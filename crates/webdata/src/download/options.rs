//! Per-request download options and queue ordering.

/// Flags controlling how a single download is scheduled and performed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadOptions {
    /// Queue behind normal-priority work
    pub low_priority: bool,
    /// Jump ahead of everything queued. Wins over `low_priority`.
    pub high_priority: bool,
    /// Report byte progress while the body streams in
    pub progressive: bool,
    /// Ask intermediaries not to serve a cached copy
    pub bypass_transport_cache: bool,
    /// Complete with no data when the response came from a transport cache
    pub ignore_cached_response: bool,
    /// Keep running when the host signals it is going to the background
    pub run_in_background: bool,
    /// Store and send cookies for this request
    pub handle_cookies: bool,
    /// Skip TLS certificate validation
    pub allow_invalid_certificates: bool,
}

impl DownloadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn low_priority(mut self) -> Self {
        self.low_priority = true;
        self
    }

    pub fn high_priority(mut self) -> Self {
        self.high_priority = true;
        self
    }

    pub fn progressive(mut self) -> Self {
        self.progressive = true;
        self
    }

    pub fn bypass_transport_cache(mut self) -> Self {
        self.bypass_transport_cache = true;
        self
    }

    pub fn ignore_cached_response(mut self) -> Self {
        self.ignore_cached_response = true;
        self
    }

    pub fn run_in_background(mut self) -> Self {
        self.run_in_background = true;
        self
    }

    pub fn handle_cookies(mut self) -> Self {
        self.handle_cookies = true;
        self
    }

    pub fn allow_invalid_certificates(mut self) -> Self {
        self.allow_invalid_certificates = true;
        self
    }

    /// The queue lane this request lands in
    pub fn priority(&self) -> QueuePriority {
        if self.high_priority {
            QueuePriority::High
        } else if self.low_priority {
            QueuePriority::Low
        } else {
            QueuePriority::Normal
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum QueuePriority {
    High,
    Normal,
    Low,
}

/// Order in which queued downloads of the same priority are admitted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DownloadOrder {
    /// Oldest request first
    #[default]
    Fifo,
    /// Newest request first
    Lifo,
}
