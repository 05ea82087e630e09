//! Error types for CouchDB client operations.
//!
//! Every failure the client can observe is a [`CouchError`]. Point operations
//! return it directly; the changes feed reports it through
//! [`FeedEvent::Error`](crate::client::FeedEvent::Error) and keeps running.
//!
//! | Variant | Raised by | Fatal for the feed? |
//! |---------|-----------|---------------------|
//! | `Transport` | refused / reset / DNS / body read failures | no, reconnects |
//! | `Status` | any response other than 200 or 201 | no, reconnects |
//! | `NotCouchDb` | peer identity check | no, reconnects |
//! | `Decode` | one malformed feed line | no, session continues |
//! | `IdleTimeout` | optional idle detection | no, reconnects |
//! | `Config` / `Url` | constructors | returned synchronously |

use std::error::Error as StdError;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, CouchError>;

/// Coarse classification of a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// The peer actively refused the TCP connection (`ECONNREFUSED`).
    ConnectionRefused,
    /// The connection was reset or aborted by the peer (`ECONNRESET`).
    ConnectionReset,
    /// A transport-level timeout fired.
    Timeout,
    /// Any other failure while establishing the connection (DNS, TLS, ...).
    Connect,
    /// The connection broke while reading the response body.
    Body,
    /// Anything else.
    Other,
}

impl TransportKind {
    /// Short errno-like code, mirroring what socket libraries report.
    pub fn code(&self) -> &'static str {
        match self {
            TransportKind::ConnectionRefused => "ECONNREFUSED",
            TransportKind::ConnectionReset => "ECONNRESET",
            TransportKind::Timeout => "ETIMEDOUT",
            TransportKind::Connect => "ECONNECT",
            TransportKind::Body => "EBODY",
            TransportKind::Other => "EOTHER",
        }
    }
}

/// Primary error type.
#[derive(Error, Debug)]
pub enum CouchError {
    /// Network-level failure: nothing (or not everything) came back from the peer.
    #[error("transport error ({}): {message}", .kind.code())]
    Transport {
        /// Classified failure kind
        kind: TransportKind,
        /// Underlying error text
        message: String,
    },

    /// The server answered with a status other than 200 or 201.
    #[error("request failed: {status}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Raw response body
        body: String,
    },

    /// The peer answered but does not identify itself as CouchDB.
    #[error("Not CouchDB (server: {})", .server.as_deref().unwrap_or("<none>"))]
    NotCouchDb {
        /// Value of the `Server` header, if any
        server: Option<String>,
    },

    /// A single feed line could not be decoded.
    #[error("malformed change record: {message}")]
    Decode {
        /// The offending line, lossily decoded
        line: String,
        /// Decoder message
        message: String,
    },

    /// No bytes arrived on a live feed session within the configured window.
    #[error("no data received for {0:?}")]
    IdleTimeout(Duration),

    /// Invalid configuration or input, detected at call time.
    #[error("configuration error: {0}")]
    Config(String),

    /// A URL could not be built.
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    /// A JSON body could not be (de)serialized.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The server answered successfully but the payload lacks a required field.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl CouchError {
    /// Create a transport error of a given kind.
    pub fn transport(kind: TransportKind, message: impl Into<String>) -> Self {
        Self::Transport {
            kind,
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Transport kind, when this is a transport error.
    pub fn transport_kind(&self) -> Option<TransportKind> {
        match self {
            Self::Transport { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// HTTP status, when this is a status error.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Check if the failure is worth retrying as-is.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } | Self::IdleTimeout(_) => true,
            Self::Status { status, .. } => crate::client::is_retryable_status(*status),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for CouchError {
    fn from(err: reqwest::Error) -> Self {
        let kind = classify(&err);
        Self::Transport {
            kind,
            message: error_chain(&err),
        }
    }
}

fn classify(err: &reqwest::Error) -> TransportKind {
    let mut source: Option<&(dyn StdError + 'static)> = err.source();
    while let Some(cause) = source {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            match io_err.kind() {
                io::ErrorKind::ConnectionRefused => return TransportKind::ConnectionRefused,
                io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
                    return TransportKind::ConnectionReset
                }
                io::ErrorKind::TimedOut => return TransportKind::Timeout,
                _ => {}
            }
        }
        source = cause.source();
    }

    if err.is_timeout() {
        TransportKind::Timeout
    } else if err.is_connect() {
        TransportKind::Connect
    } else if err.is_body() || err.is_decode() {
        TransportKind::Body
    } else {
        TransportKind::Other
    }
}

// reqwest's Display only shows the outermost layer
fn error_chain(err: &dyn StdError) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}
