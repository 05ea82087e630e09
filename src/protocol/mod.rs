//! CouchDB wire-protocol constants and header helpers.
//!
//! # Module Structure
//!
//! - **[constants]** - header names, the expected server signature, feed query parameters, defaults
//! - **headers** - server identity matcher, Basic auth and heartbeat formatting, changes URL construction

pub mod constants;
mod headers;

pub use headers::{
    changes_url, format_basic_auth, format_heartbeat, ServerMatcher,
};
