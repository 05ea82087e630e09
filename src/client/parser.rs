//! Line parser for the continuous changes feed.
//!
//! Turns arbitrarily sized body chunks into complete change records. A
//! chunk boundary may fall anywhere: in the middle of a record, between
//! several records, or inside a run of heartbeat bytes.
//!
//! # Parsing Flow
//!
//! 1. Append the chunk to the pending buffer
//! 2. Cut the buffer after its last `\n`; everything before is complete lines
//! 3. Whatever follows the last `\n` stays pending for the next chunk
//! 4. Drop keep-alive lines (only whitespace/control bytes)
//! 5. Decode each remaining line independently
//!
//! Splitting happens on bytes, so a multi-byte UTF-8 sequence cut by a chunk
//! boundary is reassembled before it is ever decoded.
//!
//! # Examples
//!
//! ```
//! use couch_http::client::ChangeParser;
//!
//! let mut parser = ChangeParser::new();
//!
//! let first = parser.feed(b"{\"seq\":\"1\",\"id\":\"a\",\"changes\":[]}\n{\"seq\":\"2\",");
//! assert_eq!(first.len(), 1);
//!
//! let second = parser.feed(b"\"id\":\"b\",\"changes\":[]}\n");
//! assert_eq!(second[0].as_ref().unwrap().id.as_deref(), Some("b"));
//! assert!(parser.pending().is_empty());
//! ```

use bytes::{Bytes, BytesMut};
use serde_json::Value;

use crate::client::utils::is_keepalive_line;
use crate::error::Result;
use crate::types::ChangeEvent;

const LINE_TERMINATOR: u8 = b'\n';

/// Incremental change record parser.
///
/// The pending buffer always holds exactly the bytes after the last line
/// terminator seen so far. A malformed line only affects itself.
#[derive(Debug)]
pub struct ChangeParser {
    /// Unterminated tail of the stream
    buffer: BytesMut,
    /// Sequence token of the most recent decoded record
    last_seq: Option<Value>,
}

impl ChangeParser {
    /// Create a new parser with an empty buffer
    pub fn new() -> Self {
        ChangeParser {
            buffer: BytesMut::with_capacity(8192),
            last_seq: None,
        }
    }

    /// Feed a chunk and decode every record it completes, in wire order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Result<ChangeEvent>> {
        self.split_records(chunk)
            .iter()
            .map(|line| {
                let change = ChangeEvent::from_line(line)?;
                if let Some(seq) = &change.seq {
                    self.last_seq = Some(seq.clone());
                }
                Ok(change)
            })
            .collect()
    }

    /// Feed a chunk and return the raw records it completes, without decoding.
    ///
    /// Keep-alive lines are filtered out.
    pub fn split_records(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(chunk);

        let Some(last) = self.buffer.iter().rposition(|&b| b == LINE_TERMINATOR) else {
            return Vec::new();
        };

        let complete = self.buffer.split_to(last + 1).freeze();
        let mut records = Vec::new();
        let mut start = 0;
        for (pos, &byte) in complete.iter().enumerate() {
            if byte != LINE_TERMINATOR {
                continue;
            }
            let line = complete.slice(start..pos);
            if !is_keepalive_line(&line) {
                records.push(line);
            }
            start = pos + 1;
        }
        records
    }

    /// Drop any pending partial line; called when a new session starts.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Bytes received after the last line terminator.
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    /// Sequence token of the last record decoded, across sessions.
    pub fn last_seq(&self) -> Option<&Value> {
        self.last_seq.as_ref()
    }
}

impl Default for ChangeParser {
    fn default() -> Self {
        Self::new()
    }
}
