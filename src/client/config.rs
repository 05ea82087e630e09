//! Client and feed configuration.

use std::time::Duration;
use url::Url;

use crate::error::{CouchError, Result};
use crate::protocol::{self, constants};
use crate::types::{Credentials, Scheme};

/// Transport configuration shared by every request the [`HttpGateway`](super::HttpGateway) makes.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Retries for failed idempotent point requests (0 = single shot)
    pub max_retries: u32,
    /// Base delay for the exponential retry backoff
    pub retry_delay_ms: u64,
    /// Total timeout of a point request; the streaming feed request is exempt
    pub request_timeout_ms: u64,
    /// TCP connect timeout of point requests
    pub connect_timeout_ms: u64,
    /// TCP connect timeout of changes feed requests (`None` = wait for the OS)
    pub stream_connect_timeout_ms: Option<u64>,
    /// Idle pooled connections kept per host
    pub max_total_connections: u32,
    /// Proxy for all traffic, empty for none
    pub proxy_url: String,
    /// Log retry attempts at `warn` level
    pub enable_logging: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            retry_delay_ms: 1000,
            request_timeout_ms: 30_000,
            connect_timeout_ms: 10_000,
            stream_connect_timeout_ms: None,
            max_total_connections: 16,
            proxy_url: String::new(),
            enable_logging: true,
        }
    }
}

/// Connection parameters of one changes feed.
///
/// Created once and reused unchanged for every (re)connect attempt.
///
/// # Examples
///
/// ```
/// use couch_http::client::FeedConfig;
/// use couch_http::Credentials;
/// use std::time::Duration;
///
/// let config = FeedConfig::new("127.0.0.1", 5984, "testdb")
///     .with_credentials(Credentials::new("admin", "secret"))
///     .with_reconnect_delay(Duration::from_secs(2));
///
/// assert!(config.validate().is_ok());
/// assert_eq!(
///     config.url().unwrap().as_str(),
///     "http://127.0.0.1:5984/testdb/_changes?feed=continuous&heartbeat=30000"
/// );
/// ```
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// `http` or `https`
    pub scheme: Scheme,
    /// Server host name or address
    pub host: String,
    /// Server port
    pub port: u16,
    /// Database whose changes are followed
    pub db_name: String,
    /// Basic-auth credentials, if any
    pub credentials: Option<Credentials>,
    /// Keep-alive interval requested from the server
    pub heartbeat: Duration,
    /// Fixed pause before an automatic reconnect
    pub reconnect_delay: Duration,
    /// Tear a session down when it stays silent this long (`None` = never)
    pub idle_timeout: Option<Duration>,
    /// Prefix the `Server` response header must start with
    pub expected_server: String,
}

impl FeedConfig {
    /// Create a feed configuration with default heartbeat and reconnect delay.
    pub fn new(host: impl Into<String>, port: u16, db_name: impl Into<String>) -> Self {
        Self {
            scheme: Scheme::Http,
            host: host.into(),
            port,
            db_name: db_name.into(),
            credentials: None,
            heartbeat: constants::DEFAULT_HEARTBEAT,
            reconnect_delay: constants::DEFAULT_RECONNECT_DELAY,
            idle_timeout: None,
            expected_server: constants::EXPECTED_SERVER.to_string(),
        }
    }

    /// Set the scheme.
    pub fn with_scheme(mut self, scheme: Scheme) -> Self {
        self.scheme = scheme;
        self
    }

    /// Attach Basic-auth credentials.
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Set the heartbeat interval.
    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Set the automatic reconnect delay.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Enable client-side idle detection.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Reject configurations the feed cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(CouchError::config("missing host"));
        }
        if self.port == 0 {
            return Err(CouchError::config("port must be non-zero"));
        }
        if self.db_name.is_empty() {
            return Err(CouchError::config("missing database name"));
        }
        if self.heartbeat.is_zero() {
            return Err(CouchError::config("heartbeat must be non-zero"));
        }
        if self.reconnect_delay.is_zero() {
            return Err(CouchError::config("reconnect delay must be non-zero"));
        }
        if self.idle_timeout.is_some_and(|t| t.is_zero()) {
            return Err(CouchError::config("idle timeout must be non-zero"));
        }
        if self.expected_server.is_empty() {
            return Err(CouchError::config("expected server signature is empty"));
        }
        Ok(())
    }

    /// The continuous changes URL this feed connects to.
    pub fn url(&self) -> Result<Url> {
        protocol::changes_url(self.scheme, &self.host, self.port, &self.db_name, self.heartbeat)
    }
}
