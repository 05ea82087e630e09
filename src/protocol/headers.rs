//! Header parsing and formatting for CouchDB requests.
//!
//! | Header / value | Format | Example |
//! |--------|--------|---------|
//! | Server | product token, checked by prefix | `CouchDB/3.2.0 (Erlang OTP/24)` |
//! | Authorization | `Basic base64(user:pass)` | `Basic YWRtaW46c2VjcmV0` |
//! | `heartbeat` query | milliseconds | `30000` |
//!
//! # Examples
//!
//! ```
//! use couch_http::protocol::{format_basic_auth, format_heartbeat, ServerMatcher};
//! use couch_http::Credentials;
//! use std::time::Duration;
//!
//! let couch = ServerMatcher::new("CouchDB").unwrap();
//! assert!(couch.matches(Some("CouchDB/3.2.0")));
//! assert!(!couch.matches(Some("nginx")));
//!
//! let auth = format_basic_auth(&Credentials::new("admin", "secret"));
//! assert_eq!(auth, "Basic YWRtaW46c2VjcmV0");
//!
//! assert_eq!(format_heartbeat(Duration::from_secs(30)), "30000");
//! ```

use base64::{engine::general_purpose::STANDARD, Engine as _};
use regex::{Regex, RegexBuilder};
use std::time::Duration;
use url::Url;

use crate::error::{CouchError, Result};
use crate::protocol::constants::{CHANGES_PATH, FEED_CONTINUOUS};
use crate::types::{Credentials, Scheme};

/// Checks `Server` header values against an expected product name.
///
/// Matches when the header starts with the product name, ignoring case. A
/// missing header never matches. Built once per feed and reused for every
/// connect.
#[derive(Debug, Clone)]
pub struct ServerMatcher {
    pattern: Regex,
}

impl ServerMatcher {
    /// Compile a matcher for `expected`, taken literally.
    pub fn new(expected: &str) -> Result<Self> {
        if expected.is_empty() {
            return Err(CouchError::config("expected server signature is empty"));
        }
        let pattern = RegexBuilder::new(&format!("^{}", regex::escape(expected)))
            .case_insensitive(true)
            .build()
            .map_err(|e| CouchError::config(format!("invalid server signature: {}", e)))?;
        Ok(ServerMatcher { pattern })
    }

    /// Whether a `Server` header value identifies the expected product.
    pub fn matches(&self, server: Option<&str>) -> bool {
        server.is_some_and(|s| self.pattern.is_match(s.trim_start()))
    }
}

/// Format an `Authorization` header value for Basic auth.
pub fn format_basic_auth(credentials: &Credentials) -> String {
    let raw = format!("{}:{}", credentials.username, credentials.password);
    format!("Basic {}", STANDARD.encode(raw))
}

/// Format a heartbeat interval the way the `heartbeat` query parameter expects it.
#[inline]
pub fn format_heartbeat(interval: Duration) -> String {
    interval.as_millis().to_string()
}

/// Build the continuous changes URL for a database.
///
/// `<scheme>://<host>:<port>/<db>/_changes?feed=continuous&heartbeat=<ms>`
pub fn changes_url(
    scheme: Scheme,
    host: &str,
    port: u16,
    db_name: &str,
    heartbeat: Duration,
) -> Result<Url> {
    let mut url = Url::parse(&format!("{}://{}:{}/", scheme, host, port))?;
    url.path_segments_mut()
        .map_err(|_| CouchError::config(format!("host cannot carry a path: {}", host)))?
        .clear()
        .push(db_name)
        .push(CHANGES_PATH);
    url.query_pairs_mut()
        .append_pair("feed", FEED_CONTINUOUS)
        .append_pair("heartbeat", &format_heartbeat(heartbeat));
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn couch() -> ServerMatcher {
        ServerMatcher::new("CouchDB").unwrap()
    }

    #[test]
    fn test_expected_server_prefix_case_insensitive() {
        let couch = couch();
        assert!(couch.matches(Some("CouchDB/3.2.0")));
        assert!(couch.matches(Some("couchdb/1.6.1 (Erlang OTP/R16B03)")));
        assert!(couch.matches(Some("COUCHDB")));
    }

    #[test]
    fn test_expected_server_rejects_others() {
        let couch = couch();
        assert!(!couch.matches(None));
        assert!(!couch.matches(Some("")));
        assert!(!couch.matches(Some("nginx/1.25")));
        assert!(!couch.matches(Some("NotCouchDB")));
    }

    #[test]
    fn test_expected_server_escapes_pattern() {
        let dot = ServerMatcher::new(".ouch").unwrap();
        assert!(!dot.matches(Some("Xouch")));
        assert!(dot.matches(Some(".ouch/1")));
    }

    #[test]
    fn test_empty_signature_rejected() {
        assert!(matches!(ServerMatcher::new(""), Err(CouchError::Config(_))));
    }

    #[test]
    fn test_format_basic_auth() {
        let creds = Credentials::new("testuser2", "testpass2");
        let header = format_basic_auth(&creds);
        let encoded = header.strip_prefix("Basic ").unwrap();
        let decoded = STANDARD.decode(encoded).unwrap();
        assert_eq!(decoded, b"testuser2:testpass2");
    }

    #[test]
    fn test_changes_url() {
        let url = changes_url(Scheme::Http, "127.0.0.1", 5984, "testdb", Duration::from_secs(30))
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://127.0.0.1:5984/testdb/_changes?feed=continuous&heartbeat=30000"
        );
    }

    #[test]
    fn test_changes_url_encodes_db_name() {
        let url = changes_url(Scheme::Https, "db.local", 6984, "a/b", Duration::from_millis(500))
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://db.local:6984/a%2Fb/_changes?feed=continuous&heartbeat=500"
        );
    }
}
