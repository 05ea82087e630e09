//! Server and database facades.
//!
//! These build URLs and pick credentials, then hand every exchange to a
//! [`Gateway`](crate::client::Gateway). Credentials cascade: a feed's own
//! credentials beat the database's, which beat the server's.
//!
//! ```ignore
//! use couch_http::db::{DatabaseConfig, Server, ServerConfig};
//!
//! let server = Server::new(ServerConfig {
//!     username: Some("admin".into()),
//!     password: Some("secret".into()),
//!     ..Default::default()
//! })?;
//! let orders = server.db(DatabaseConfig::new("orders"))?;
//!
//! orders.put("order-1", &serde_json::json!({"total": 12})).await?;
//! let mut feed = orders.changes(Default::default())?;
//! ```

mod database;
mod server;

pub use database::{ChangesOptions, Database, DatabaseConfig};
pub use server::{Server, ServerConfig};
