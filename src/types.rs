//! Core data types shared by the point-operation client and the changes feed.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::error::CouchError;

/// URL scheme used to reach the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scheme {
    /// Plain HTTP
    #[default]
    Http,
    /// HTTP over TLS
    Https,
}

impl Scheme {
    /// Scheme as it appears in a URL.
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scheme {
    type Err = CouchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Scheme::Http),
            "https" => Ok(Scheme::Https),
            other => Err(CouchError::config(format!("unsupported protocol: {}", other))),
        }
    }
}

/// Basic-auth credentials.
///
/// `Debug` redacts the password so credentials can sit inside configs that
/// get logged.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// User name
    pub username: String,
    /// Password
    pub password: String,
}

impl Credentials {
    /// Create credentials from a user name and password.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Build credentials only when both halves are present and non-empty.
    pub fn from_parts(username: Option<&str>, password: Option<&str>) -> Option<Self> {
        match (username, password) {
            (Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => Some(Self::new(u, p)),
            _ => None,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// One revision entry inside a change record's `changes` array.
///
/// Entries without `rev` still decode; every member is kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRev {
    /// Revision identifier, e.g. `1-967a00dff5e02add41819138abb3284d`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    /// Any other members of the entry
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A single decoded record from the continuous changes feed.
///
/// Only `seq` is interpreted by the feed itself (tracked as the last seen
/// sequence). All other members are forwarded untouched; unknown keys land
/// in `extra`, so a `{"last_seq": ..}` trailer decodes too.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Opaque sequence token (string on CouchDB 2+, integer on 1.x)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<Value>,
    /// Id of the changed document
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Leaf revisions of the changed document
    #[serde(default)]
    pub changes: Vec<ChangeRev>,
    /// Whether the change is a deletion
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
    /// Document body, when the feed was requested with `include_docs`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<Value>,
    /// Any other members of the record
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChangeEvent {
    /// Decode one complete feed line.
    ///
    /// The line must hold a JSON object; surrounding whitespace (including
    /// stray `\r` heartbeat bytes) is tolerated.
    pub fn from_line(line: &[u8]) -> Result<Self, CouchError> {
        serde_json::from_slice::<ChangeEvent>(line).map_err(|e| CouchError::Decode {
            line: String::from_utf8_lossy(line).into_owned(),
            message: e.to_string(),
        })
    }

    /// Sequence token rendered as a string, whatever its JSON type.
    pub fn seq_string(&self) -> Option<String> {
        self.seq.as_ref().map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

/// Entry of a document's `_revs_info` list (returned by `GET <doc>?meta=true`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevInfo {
    /// Revision identifier
    pub rev: String,
    /// `available`, `missing` or `deleted`
    pub status: String,
}

impl RevInfo {
    /// Whether the revision body is still stored on the server.
    pub fn is_available(&self) -> bool {
        self.status == "available"
    }
}
