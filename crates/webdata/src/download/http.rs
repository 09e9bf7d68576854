//! # HTTP Transport
//!
//! [`Transport`] backed by reqwest. One client is built per combination of
//! cookie handling and certificate policy, then reused so connections pool.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::BytesMut;
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::header::{CACHE_CONTROL, HeaderValue, PRAGMA};
use reqwest::{Client, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::DownloadError;
use crate::DownloaderConfig;
use crate::download::options::DownloadOptions;
use crate::download::transport::{
    ProgressReporter, Transport, TransportRequest, TransportResponse,
};

/// Upper bound on the buffer reserved from a `Content-Length` header
const MAX_PREALLOCATION: u64 = 8 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ClientFlavor {
    handle_cookies: bool,
    allow_invalid_certificates: bool,
}

impl From<&DownloadOptions> for ClientFlavor {
    fn from(options: &DownloadOptions) -> Self {
        Self {
            handle_cookies: options.handle_cookies,
            allow_invalid_certificates: options.allow_invalid_certificates,
        }
    }
}

/// Create a reqwest Client with the provided configuration
fn create_client(config: &DownloaderConfig, flavor: ClientFlavor) -> Result<Client, DownloadError> {
    let mut client_builder = Client::builder()
        .pool_max_idle_per_host(5)
        .user_agent(&config.user_agent)
        .cookie_store(flavor.handle_cookies)
        .danger_accept_invalid_certs(flavor.allow_invalid_certificates)
        .redirect(if config.follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        });

    if !config.connect_timeout.is_zero() {
        client_builder = client_builder.connect_timeout(config.connect_timeout);
    }

    if !config.use_system_proxy {
        client_builder = client_builder.no_proxy();
        debug!("Proxy disabled for downloads");
    }

    if flavor.allow_invalid_certificates {
        warn!("TLS certificate validation disabled for this client");
    }

    client_builder.build().map_err(DownloadError::from)
}

pub struct HttpTransport {
    config: DownloaderConfig,
    clients: Mutex<HashMap<ClientFlavor, Client>>,
}

impl HttpTransport {
    pub fn new(config: DownloaderConfig) -> Self {
        Self {
            config,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client_for(&self, options: &DownloadOptions) -> Result<Client, DownloadError> {
        let flavor = ClientFlavor::from(options);
        let mut clients = self.clients.lock();
        if let Some(client) = clients.get(&flavor) {
            return Ok(client.clone());
        }
        let client = create_client(&self.config, flavor)?;
        debug!(?flavor, "Created HTTP client");
        clients.insert(flavor, client.clone());
        Ok(client)
    }
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(
        &self,
        request: TransportRequest,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> Result<TransportResponse, DownloadError> {
        let client = self.client_for(&request.options)?;

        let mut builder = client.get(request.url.clone()).headers(request.headers);
        if !request.timeout.is_zero() {
            builder = builder.timeout(request.timeout);
        }
        if let Some(credentials) = &request.credentials {
            builder = builder.basic_auth(&credentials.username, Some(&credentials.password));
        }
        if request.options.bypass_transport_cache {
            builder = builder
                .header(CACHE_CONTROL, HeaderValue::from_static("no-cache"))
                .header(PRAGMA, HeaderValue::from_static("no-cache"));
        }

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            response = builder.send() => response?,
        };

        let status = response.status();
        let expected_len = response.content_length();
        debug!(url = %request.url, %status, ?expected_len, "Response received");
        progress.response_received(expected_len);

        let mut buffer =
            BytesMut::with_capacity(expected_len.unwrap_or(0).min(MAX_PREALLOCATION) as usize);
        let mut stream = response.bytes_stream();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                chunk = stream.next() => match chunk {
                    Some(Ok(chunk)) => {
                        buffer.extend_from_slice(&chunk);
                        trace!(received = buffer.len(), "Body chunk");
                        progress.progress(buffer.len() as u64, expected_len);
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => break,
                },
            }
        }

        Ok(TransportResponse {
            data: buffer.freeze(),
            status,
            expected_len,
            from_cache: status == StatusCode::NOT_MODIFIED,
        })
    }
}
