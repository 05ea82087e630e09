#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

//! # couch_http: CouchDB over HTTP
//!
//! This crate talks to a CouchDB server over plain HTTP/1.1. Its core is a
//! self-healing consumer of the *continuous changes feed*
//! (`GET /<db>/_changes?feed=continuous`), an endless newline-delimited JSON
//! stream that reports every document change as it happens.
//!
//! ## Key Features
//!
//! - **Chunk-safe parsing**: records split across network chunks are reassembled
//! - **Keep-alive tolerance**: heartbeat blank lines are ignored
//! - **Automatic reconnection**: transport failures, foreign servers, bad
//!   statuses and peer closes all lead to a delayed reconnect
//! - **Server identity check**: the `Server` header must name CouchDB
//! - **Clean cancellation**: one `Cancelled` event, nothing after it
//! - **Point operations**: `GET`/`POST`/`PUT` with JSON bodies, plus purge,
//!   soft delete and bulk writes
//!
//! ## Following Changes
//!
//! ```ignore
//! use couch_http::{DatabaseConfig, FeedEvent, Server, ServerConfig};
//! use couch_http::db::ChangesOptions;
//!
//! #[tokio::main]
//! async fn main() -> couch_http::Result<()> {
//!     let server = Server::new(ServerConfig {
//!         username: Some("admin".into()),
//!         password: Some("secret".into()),
//!         ..Default::default()
//!     })?;
//!     let db = server.db(DatabaseConfig::new("orders"))?;
//!
//!     let mut feed = db.changes(ChangesOptions::default())?;
//!     while let Some(event) = feed.next().await {
//!         match event {
//!             FeedEvent::Change(change) => println!("{:?} -> {:?}", change.id, change.seq),
//!             FeedEvent::Error(e) => eprintln!("feed error: {}", e),
//!             FeedEvent::Reconnect => println!("reconnecting"),
//!             FeedEvent::Cancelled => break,
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Module Structure
//!
//! - **[types]** - Wire-level data types (ChangeEvent, Credentials, Scheme)
//! - **[error]** - Error types and result handling
//! - **[client]** - HTTP gateway, feed parser and changes feed consumer
//! - **[db]** - Server and database facades
//! - **[protocol]** - Protocol constants and header helpers

pub mod client;
pub mod db;
pub mod error;
pub mod protocol;
pub mod types;

pub use client::{ChangesFeed, FeedConfig, FeedEvent, FeedHandle, HttpGateway};
pub use db::{Database, DatabaseConfig, Server, ServerConfig};
pub use error::{CouchError, Result, TransportKind};
pub use types::{ChangeEvent, ChangeRev, Credentials, RevInfo, Scheme};

#[cfg(test)]
mod tests;
