//! Utility functions for the CouchDB HTTP client.
//!
//! - Status code classification
//! - Retry backoff calculation
//! - Keep-alive line detection

use std::time::Duration;

/// Check if a point-operation status counts as success.
///
/// CouchDB answers reads with 200 and writes with 201; anything else,
/// 202 Accepted included, is treated as a failure.
pub fn is_success_status(status: u16) -> bool {
    matches!(status, 200 | 201)
}

/// Check if status code indicates retryable error
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 425 | 429 | 502 | 503 | 504)
}

/// Check if status code indicates access denied
pub fn is_access_denied_status(status: u16) -> bool {
    matches!(status, 401 | 403)
}

/// Exponential backoff delay calculation
///
/// Returns delay in milliseconds
pub fn exponential_backoff(attempt: u32, base_ms: u64) -> Duration {
    let delay_ms = base_ms.saturating_mul(2_u64.pow(attempt.min(10)));
    Duration::from_millis(delay_ms)
}

/// Whether a feed line carries no payload.
///
/// Heartbeats arrive as bare newlines, sometimes preceded by carriage
/// returns or other control bytes.
pub fn is_keepalive_line(line: &[u8]) -> bool {
    line.iter()
        .all(|b| b.is_ascii_whitespace() || b.is_ascii_control())
}
