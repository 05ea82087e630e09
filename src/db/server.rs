use http::Method;
use serde_json::Value;
use std::sync::Arc;
use url::Url;

use crate::client::{Gateway, HttpGateway};
use crate::db::database::{Database, DatabaseConfig};
use crate::error::{CouchError, Result};
use crate::protocol::constants::{DEFAULT_HOST, DEFAULT_PORT};
use crate::types::{Credentials, Scheme};

/// Where the server lives and who to authenticate as.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host name or address
    pub hostname: String,
    /// TCP port
    pub port: u16,
    /// `http` or `https`
    pub scheme: Scheme,
    /// Default user for every database of this server
    pub username: Option<String>,
    /// Password of `username`
    pub password: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            scheme: Scheme::Http,
            username: None,
            password: None,
        }
    }
}

/// Handle to a CouchDB server.
///
/// Cheap to clone; clones share the gateway.
#[derive(Clone)]
pub struct Server {
    config: Arc<ServerConfig>,
    gateway: Arc<dyn Gateway>,
}

impl Server {
    /// Create a server handle backed by a default [`HttpGateway`].
    ///
    /// Fails with [`CouchError::Config`] on an invalid configuration.
    pub fn new(config: ServerConfig) -> Result<Self> {
        Self::with_gateway(config, Arc::new(HttpGateway::new()?))
    }

    /// Create a server handle backed by a custom gateway.
    pub fn with_gateway(config: ServerConfig, gateway: Arc<dyn Gateway>) -> Result<Self> {
        if config.hostname.trim().is_empty() {
            return Err(CouchError::config("missing hostname"));
        }
        if config.port == 0 {
            return Err(CouchError::config("port must be non-zero"));
        }

        Ok(Server {
            config: Arc::new(config),
            gateway,
        })
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// `<scheme>://<host>:<port>`, without trailing slash.
    pub fn base_url(&self) -> String {
        format!(
            "{}://{}:{}",
            self.config.scheme, self.config.hostname, self.config.port
        )
    }

    /// Server-level credentials, when both user and password are set.
    pub fn credentials(&self) -> Option<Credentials> {
        Credentials::from_parts(
            self.config.username.as_deref(),
            self.config.password.as_deref(),
        )
    }

    /// `GET <base>/<path>`, e.g. `get("/")` for the welcome document.
    pub async fn get(&self, path: &str) -> Result<Value> {
        self.send(Method::GET, path, None).await
    }

    /// `POST <base>/<path>` with a JSON body.
    pub async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        self.send(Method::POST, path, Some(body)).await
    }

    /// Open a database on this server.
    pub fn db(&self, config: DatabaseConfig) -> Result<Database> {
        Database::new(self.clone(), config)
    }

    pub(crate) fn gateway(&self) -> Arc<dyn Gateway> {
        Arc::clone(&self.gateway)
    }

    fn url(&self, path: &str) -> Result<Url> {
        Ok(Url::parse(&format!(
            "{}/{}",
            self.base_url(),
            path.trim_start_matches('/')
        ))?)
    }

    async fn send(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value> {
        let url = self.url(path)?;
        let credentials = self.credentials();
        self.gateway
            .request(method, url, body, credentials.as_ref())
            .await
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("base_url", &self.base_url())
            .finish_non_exhaustive()
    }
}
