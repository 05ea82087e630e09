//! CouchDB HTTP client implementation.
//!
//! This module provides the transport layer and the changes feed consumer:
//!
//! - **Perform point requests** with JSON bodies and Basic auth
//! - **Stream responses** without buffering them
//! - **Decode the continuous changes feed** line by line, across arbitrary chunk splits
//! - **Follow a database's changes** with automatic reconnection until cancelled
//!
//! # Module Organization
//!
//! ```text
//! client/
//! ├── fetch    - Gateway trait and the reqwest-backed HttpGateway
//! ├── parser   - Incremental change record parser
//! ├── changes  - ChangesFeed consumer and its events
//! ├── config   - Client and feed configuration
//! └── utils    - Utility functions
//! ```
//!
//! # Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Gateway`] | Seam for HTTP exchanges (point and streaming) |
//! | [`HttpGateway`] | `reqwest` implementation of [`Gateway`] |
//! | [`ChangeParser`] | Chunk-boundary-safe record parser |
//! | [`ChangesFeed`] | Self-reconnecting changes subscription |
//! | [`FeedConfig`] | Connection parameters of one feed |
//! | [`ClientConfig`] | Transport configuration |
//!
//! # Examples
//!
//! ## Creating a Gateway
//!
//! ```
//! use couch_http::client::{ClientConfig, HttpGateway};
//!
//! // Default configuration
//! let gateway = HttpGateway::new()?;
//!
//! // Custom configuration
//! let config = ClientConfig {
//!     max_retries: 2,
//!     retry_delay_ms: 500,
//!     ..Default::default()
//! };
//! let gateway = HttpGateway::with_config(config)?;
//!
//! // A bad proxy fails right away
//! let bad = ClientConfig {
//!     proxy_url: "::not a url".into(),
//!     ..Default::default()
//! };
//! assert!(HttpGateway::with_config(bad).is_err());
//! # Ok::<(), couch_http::CouchError>(())
//! ```
//!
//! ## Parsing Feed Chunks
//!
//! ```
//! use couch_http::client::ChangeParser;
//!
//! let mut parser = ChangeParser::new();
//! let records = parser.feed(b"{\"seq\":\"1\",\"id\":\"a\",\"changes\":[]}\n\n");
//! assert_eq!(records.len(), 1);
//! ```
//!
//! ## Utility Functions
//!
//! ```
//! use couch_http::client::{exponential_backoff, is_success_status};
//! use std::time::Duration;
//!
//! assert!(is_success_status(201));
//! assert!(!is_success_status(202));
//! assert_eq!(exponential_backoff(2, 100), Duration::from_millis(400));
//! ```

mod changes;
mod config;
mod fetch;
mod parser;
mod utils;

pub use changes::{ChangesFeed, ConsumerState, FeedEvent, FeedHandle};
pub use config::{ClientConfig, FeedConfig};
pub use fetch::{ByteStream, Gateway, HttpGateway, StreamResponse};
pub use parser::ChangeParser;
pub use utils::*;
