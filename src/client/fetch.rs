//! Request gateway: single HTTP exchanges against the server.
//!
//! [`Gateway`] is the seam between the CouchDB-level code and the network.
//! [`HttpGateway`] implements it with `reqwest`; tests substitute their own.
//!
//! Two kinds of exchange are offered:
//!
//! - **request**: one request, one fully read JSON response. 200 and 201 are
//!   success, any other status is [`CouchError::Status`] carrying the raw body.
//! - **stream**: returns as soon as the response headers arrive, handing the
//!   body over as a live stream of chunks. Used by the changes feed.
//!
//! # Examples
//!
//! ```ignore
//! use couch_http::client::{Gateway, HttpGateway};
//! use http::Method;
//! use url::Url;
//!
//! let gateway = HttpGateway::new()?;
//! let url = Url::parse("http://localhost:5984/")?;
//! let welcome = gateway.request(Method::GET, url, None, None).await?;
//! println!("{}", welcome["couchdb"]);
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use http::Method;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, trace, warn};
use url::Url;

use crate::client::config::ClientConfig;
use crate::client::utils::{exponential_backoff, is_success_status};
use crate::error::{CouchError, Result};
use crate::protocol::{constants::headers, format_basic_auth};
use crate::types::Credentials;

/// Live response body: chunks in arrival order, ending when the peer closes.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// A response whose body is still streaming.
///
/// Dropping it aborts the underlying connection.
pub struct StreamResponse {
    /// HTTP status code
    pub status: u16,
    /// Response headers, keys lowercased
    pub headers: BTreeMap<String, String>,
    /// Body chunks
    pub body: ByteStream,
}

impl StreamResponse {
    /// Value of the `Server` header.
    pub fn server(&self) -> Option<&str> {
        self.headers.get(headers::SERVER.as_str()).map(String::as_str)
    }
}

impl std::fmt::Debug for StreamResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Performs HTTP exchanges on behalf of the CouchDB facades and the changes feed.
#[async_trait]
pub trait Gateway: Send + Sync + 'static {
    /// Perform one request and decode the JSON response body.
    async fn request(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
        credentials: Option<&Credentials>,
    ) -> Result<Value>;

    /// Open a streaming `GET` and return once headers are received.
    async fn stream(&self, url: Url, credentials: Option<&Credentials>) -> Result<StreamResponse>;
}

/// `reqwest`-backed [`Gateway`].
///
/// Cheap to clone; clones share the connection pools.
#[derive(Clone)]
pub struct HttpGateway {
    client: reqwest::Client,
    stream_client: reqwest::Client,
    config: Arc<ClientConfig>,
}

impl HttpGateway {
    /// Create a new gateway with default configuration
    pub fn new() -> Result<Self> {
        Self::with_config(ClientConfig::default())
    }

    /// Create a new gateway with custom configuration
    ///
    /// # Errors
    ///
    /// [`CouchError::Config`] when `proxy_url` is not a valid proxy or the
    /// HTTP client cannot be built.
    pub fn with_config(config: ClientConfig) -> Result<Self> {
        let proxy = if config.proxy_url.is_empty() {
            None
        } else {
            let proxy = reqwest::Proxy::all(&config.proxy_url).map_err(|e| {
                CouchError::config(format!("invalid proxy url {:?}: {}", config.proxy_url, e))
            })?;
            Some(proxy)
        };

        let client = build_client(
            &config,
            Some(Duration::from_millis(config.connect_timeout_ms)),
            proxy.clone(),
        )?;
        // Feed connects only get a deadline when one is asked for.
        let stream_client = build_client(
            &config,
            config.stream_connect_timeout_ms.map(Duration::from_millis),
            proxy,
        )?;

        Ok(HttpGateway {
            client,
            stream_client,
            config: Arc::new(config),
        })
    }

    /// Get the gateway configuration
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn build(
        client: &reqwest::Client,
        method: Method,
        url: Url,
        credentials: Option<&Credentials>,
    ) -> reqwest::RequestBuilder {
        let mut req_builder = client.request(method, url);
        if let Some(credentials) = credentials {
            req_builder = req_builder.header(headers::AUTHORIZATION, format_basic_auth(credentials));
        }
        req_builder
    }

    async fn request_once(
        &self,
        method: Method,
        url: &Url,
        body: Option<&Value>,
        credentials: Option<&Credentials>,
    ) -> Result<Value> {
        let mut req_builder = Self::build(&self.client, method.clone(), url.clone(), credentials)
            .timeout(Duration::from_millis(self.config.request_timeout_ms));

        if let Some(body) = body {
            req_builder = req_builder.json(body);
        }

        let response = req_builder.send().await?;
        let status = response.status().as_u16();
        let text = response.text().await?;

        debug!(%method, %url, status, len = text.len(), "request complete");
        trace!(body = %text, "response body");

        if is_success_status(status) {
            Ok(serde_json::from_str(&text)?)
        } else {
            Err(CouchError::Status { status, body: text })
        }
    }
}

#[async_trait]
impl Gateway for HttpGateway {
    async fn request(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
        credentials: Option<&Credentials>,
    ) -> Result<Value> {
        // Only reads are replayed; a retried write could apply twice.
        let idempotent = method == Method::GET;
        let mut attempt = 0;

        loop {
            match self.request_once(method.clone(), &url, body, credentials).await {
                Ok(value) => return Ok(value),
                Err(e) if idempotent && e.is_retryable() && attempt < self.config.max_retries => {
                    let delay = exponential_backoff(attempt, self.config.retry_delay_ms);
                    if self.config.enable_logging {
                        warn!(
                            "Request failed (attempt {}), retrying after {:?}: {}",
                            attempt + 1,
                            delay,
                            e
                        );
                    }
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn stream(&self, url: Url, credentials: Option<&Credentials>) -> Result<StreamResponse> {
        let response = Self::build(&self.stream_client, Method::GET, url, credentials)
            .send()
            .await?;

        let status = response.status().as_u16();
        let mut headers = BTreeMap::new();
        for (k, v) in response.headers() {
            if let Ok(val) = v.to_str() {
                headers.insert(k.as_str().to_string(), val.to_string());
            }
        }

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(CouchError::from))
            .boxed();

        Ok(StreamResponse {
            status,
            headers,
            body,
        })
    }
}

// No client-wide total timeout: it would also cut the endless feed body.
fn build_client(
    config: &ClientConfig,
    connect_timeout: Option<Duration>,
    proxy: Option<reqwest::Proxy>,
) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(config.max_total_connections as usize);

    if let Some(timeout) = connect_timeout {
        builder = builder.connect_timeout(timeout);
    }
    if let Some(proxy) = proxy {
        builder = builder.proxy(proxy);
    }

    builder
        .build()
        .map_err(|e| CouchError::config(format!("cannot build http client: {}", e)))
}
