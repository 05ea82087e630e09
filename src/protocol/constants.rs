//! Protocol constants.

use std::time::Duration;

/// Header names the client reads or writes.
pub mod headers {
    use http::header::HeaderName;

    /// Identifies the serving software; checked before a feed session is accepted.
    pub const SERVER: HeaderName = http::header::SERVER;
    /// Carries Basic credentials.
    pub const AUTHORIZATION: HeaderName = http::header::AUTHORIZATION;
}

/// Prefix the `Server` header must carry (case-insensitive), e.g. `CouchDB/3.2.0`.
pub const EXPECTED_SERVER: &str = "CouchDB";

/// Path segment of the changes endpoint.
pub const CHANGES_PATH: &str = "_changes";

/// `feed` query parameter value selecting the streaming mode.
pub const FEED_CONTINUOUS: &str = "continuous";

/// Port CouchDB listens on out of the box.
pub const DEFAULT_PORT: u16 = 5984;

/// Host used when none is configured.
pub const DEFAULT_HOST: &str = "localhost";

/// Interval at which the server is asked to write a keep-alive newline.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_millis(30_000);

/// Pause between a failed or closed feed session and the next connect attempt.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(10);
