use chrono::{SecondsFormat, Utc};
use http::Method;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::client::{ChangesFeed, FeedConfig};
use crate::db::server::Server;
use crate::error::{CouchError, Result};
use crate::types::{Credentials, RevInfo};

/// Which database to open and, optionally, who to authenticate as.
#[derive(Debug, Clone, Default)]
pub struct DatabaseConfig {
    /// Database name
    pub name: String,
    /// User overriding the server's
    pub username: Option<String>,
    /// Password of `username`
    pub password: Option<String>,
}

impl DatabaseConfig {
    /// Open `name` with the server's credentials.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Use database-specific credentials.
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }
}

/// Options for [`Database::changes`]. Unset fields fall back to the database
/// credentials and the feed defaults.
#[derive(Debug, Clone, Default)]
pub struct ChangesOptions {
    /// User overriding the database's
    pub username: Option<String>,
    /// Password of `username`
    pub password: Option<String>,
    /// Keep-alive interval requested from the server
    pub heartbeat: Option<Duration>,
    /// Pause before each automatic reconnect
    pub reconnect_delay: Option<Duration>,
    /// Client-side idle detection
    pub idle_timeout: Option<Duration>,
}

/// Handle to one database on a [`Server`].
#[derive(Debug, Clone)]
pub struct Database {
    server: Server,
    name: String,
    credentials: Option<Credentials>,
}

impl Database {
    pub(crate) fn new(server: Server, config: DatabaseConfig) -> Result<Self> {
        if config.name.is_empty() {
            return Err(CouchError::config("missing database name"));
        }

        let credentials =
            Credentials::from_parts(config.username.as_deref(), config.password.as_deref())
                .or_else(|| server.credentials());

        Ok(Database {
            server,
            name: config.name,
            credentials,
        })
    }

    /// Database name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Credentials used for this database's requests.
    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    /// `GET <base>/<db>/<path>`; `path` may carry a query string.
    pub async fn get(&self, path: &str) -> Result<Value> {
        self.send(Method::GET, path, None).await
    }

    /// `POST <base>/<db>/<path>` with a JSON body.
    pub async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        self.send(Method::POST, path, Some(body)).await
    }

    /// `PUT <base>/<db>/<path>` with a JSON body.
    pub async fn put(&self, path: &str, body: &Value) -> Result<Value> {
        self.send(Method::PUT, path, Some(body)).await
    }

    /// Write several documents in one `_bulk_docs` request.
    pub async fn bulk_docs(&self, docs: &[Value]) -> Result<Value> {
        self.post("_bulk_docs", &json!({ "docs": docs })).await
    }

    /// Permanently remove every available revision of a document.
    ///
    /// Reads the revision list with `?meta=true`, then posts the available
    /// revisions to `_purge`.
    pub async fn purge(&self, id: &str) -> Result<Value> {
        let url = self.doc_url(id, Some(("meta", "true")))?;
        let doc = self.send_url(Method::GET, url, None).await?;

        let revs_info = doc
            .get("_revs_info")
            .cloned()
            .ok_or_else(|| CouchError::UnexpectedResponse(format!("{} has no _revs_info", id)))?;
        let revs: Vec<String> = serde_json::from_value::<Vec<RevInfo>>(revs_info)?
            .into_iter()
            .filter(RevInfo::is_available)
            .map(|info| info.rev)
            .collect();

        debug!(db = %self.name, id, revs = revs.len(), "purging document");

        let mut request = Map::new();
        request.insert(id.to_string(), json!(revs));
        self.post("_purge", &Value::Object(request)).await
    }

    /// Mark a document deleted while keeping its body.
    ///
    /// Stamps `deleted_time` (RFC 3339, UTC) and `_deleted: true`, writes the
    /// document, and returns the stored revision as read back from the server.
    pub async fn soft_delete(&self, mut doc: Value) -> Result<Value> {
        let fields = doc
            .as_object_mut()
            .ok_or_else(|| CouchError::config("document must be a JSON object"))?;
        let id = fields
            .get("_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| CouchError::config("document has no string _id"))?;

        fields.insert(
            "deleted_time".to_string(),
            json!(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        fields.insert("_deleted".to_string(), Value::Bool(true));

        let info = self
            .send_url(Method::PUT, self.doc_url(&id, None)?, Some(&doc))
            .await?;
        let rev = info
            .get("rev")
            .and_then(Value::as_str)
            .ok_or_else(|| CouchError::UnexpectedResponse(format!("no rev in response for {}", id)))?;

        let url = self.doc_url(&id, Some(("rev", rev)))?;
        self.send_url(Method::GET, url, None).await
    }

    /// Follow this database's continuous changes feed.
    ///
    /// The returned feed is already connecting.
    pub fn changes(&self, options: ChangesOptions) -> Result<ChangesFeed> {
        let server = self.server.config();
        let mut config = FeedConfig::new(server.hostname.clone(), server.port, self.name.clone())
            .with_scheme(server.scheme);

        if let Some(credentials) =
            Credentials::from_parts(options.username.as_deref(), options.password.as_deref())
                .or_else(|| self.credentials.clone())
        {
            config = config.with_credentials(credentials);
        }
        if let Some(heartbeat) = options.heartbeat {
            config = config.with_heartbeat(heartbeat);
        }
        if let Some(delay) = options.reconnect_delay {
            config = config.with_reconnect_delay(delay);
        }
        if let Some(idle) = options.idle_timeout {
            config = config.with_idle_timeout(idle);
        }

        ChangesFeed::spawn(config, self.server.gateway())
    }

    /// `<base>/<db>`, the name encoded as one path segment.
    fn db_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.server.base_url())?;
        url.path_segments_mut()
            .map_err(|_| CouchError::config("server url cannot carry a path"))?
            .clear()
            .push(&self.name);
        Ok(url)
    }

    /// `<base>/<db>/<path>`; `path` is used as given and may carry a query string.
    fn url(&self, path: &str) -> Result<Url> {
        Ok(Url::parse(&format!(
            "{}/{}",
            self.db_url()?,
            path.trim_start_matches('/')
        ))?)
    }

    /// URL of one document. The id is percent-encoded as a single path
    /// segment, except that a `_design/` or `_local/` prefix stays literal.
    fn doc_url(&self, id: &str, query: Option<(&str, &str)>) -> Result<Url> {
        if id.is_empty() {
            return Err(CouchError::config("missing document id"));
        }

        let mut url = self.db_url()?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| CouchError::config("server url cannot carry a path"))?;
            match split_doc_id(id) {
                (Some(prefix), rest) => segments.push(prefix).push(rest),
                (None, id) => segments.push(id),
            };
        }
        if let Some((key, value)) = query {
            url.query_pairs_mut().append_pair(key, value);
        }
        Ok(url)
    }

    async fn send(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value> {
        let url = self.url(path)?;
        self.send_url(method, url, body).await
    }

    async fn send_url(&self, method: Method, url: Url, body: Option<&Value>) -> Result<Value> {
        self.server
            .gateway()
            .request(method, url, body, self.credentials.as_ref())
            .await
    }
}

fn split_doc_id(id: &str) -> (Option<&str>, &str) {
    for prefix in ["_design", "_local"] {
        if let Some(rest) = id.strip_prefix(prefix).and_then(|r| r.strip_prefix('/')) {
            return (Some(prefix), rest);
        }
    }
    (None, id)
}
