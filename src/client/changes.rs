//! Continuous changes feed consumer.
//!
//! A [`ChangesFeed`] keeps one streaming `GET /<db>/_changes?feed=continuous`
//! open, decodes the newline-delimited records it carries and reconnects
//! after every failure until it is cancelled.
//!
//! # Lifecycle
//!
//! ```text
//! Idle -> Connecting -> Streaming -> Reconnecting -> Connecting -> ...
//!                  \________________________________/
//!                           any state -> Cancelled (terminal)
//! ```
//!
//! Connecting is eager: the worker task starts as soon as the feed is built.
//! Every session failure (transport error, foreign server, bad status, peer
//! close) is reported and followed by a fixed pause, a [`FeedEvent::Reconnect`]
//! notice, and a fresh connect. A malformed line is reported but does not end
//! the session.
//!
//! # Events
//!
//! | Event | When |
//! |-------|------|
//! | `Change` | one per decoded record, in wire order |
//! | `Error` | transport/protocol/status failure, or one undecodable line |
//! | `Reconnect` | a new connect attempt is scheduled |
//! | `Cancelled` | exactly once, last event of the stream |
//!
//! # Examples
//!
//! ```ignore
//! use couch_http::client::{ChangesFeed, FeedConfig, FeedEvent, HttpGateway};
//! use std::sync::Arc;
//!
//! let config = FeedConfig::new("localhost", 5984, "orders");
//! let mut feed = ChangesFeed::spawn(config, Arc::new(HttpGateway::new()?))?;
//!
//! while let Some(event) = feed.next().await {
//!     match event {
//!         FeedEvent::Change(change) => println!("{:?} changed", change.id),
//!         FeedEvent::Error(e) => eprintln!("feed error: {}", e),
//!         FeedEvent::Reconnect => {}
//!         FeedEvent::Cancelled => break,
//!     }
//! }
//! ```

use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn, Instrument};
use url::Url;
use uuid::Uuid;

use crate::client::config::FeedConfig;
use crate::client::fetch::{ByteStream, Gateway, StreamResponse};
use crate::client::parser::ChangeParser;
use crate::client::utils::is_access_denied_status;
use crate::error::{CouchError, Result};
use crate::protocol::ServerMatcher;
use crate::types::ChangeEvent;

/// Upper bound on how much of an error response body is kept.
const MAX_ERROR_BODY: usize = 64 * 1024;

/// Notification delivered by a [`ChangesFeed`].
#[derive(Debug)]
pub enum FeedEvent {
    /// One decoded change record
    Change(ChangeEvent),
    /// A non-fatal failure; the feed keeps going
    Error(CouchError),
    /// A new connect attempt has been scheduled
    Reconnect,
    /// The feed was cancelled; nothing follows
    Cancelled,
}

/// Observable state of the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Constructed, worker not yet running
    Idle,
    /// Waiting for response headers
    Connecting,
    /// Session live, decoding chunks
    Streaming,
    /// Waiting out the reconnect delay
    Reconnecting,
    /// Terminal
    Cancelled,
}

#[derive(Debug)]
enum FeedCommand {
    Reconnect,
    Cancel,
}

#[derive(Debug)]
struct Shared {
    cancelled: AtomicBool,
    state: Mutex<ConsumerState>,
    last_seq: Mutex<Option<Value>>,
}

/// Cloneable control handle for a running feed.
#[derive(Debug, Clone)]
pub struct FeedHandle {
    commands: mpsc::UnboundedSender<FeedCommand>,
    shared: Arc<Shared>,
}

impl FeedHandle {
    /// Stop the feed.
    ///
    /// Aborts the live session or pending reconnect. The event stream then
    /// yields [`FeedEvent::Cancelled`] once and ends. Calling it again has no
    /// further effect.
    pub fn cancel(&self) {
        if !self.shared.cancelled.swap(true, Ordering::SeqCst) {
            let _ = self.commands.send(FeedCommand::Cancel);
        }
    }

    /// Drop the current session and connect again right away, skipping the delay.
    pub fn reconnect(&self) {
        if !self.is_cancelled() {
            let _ = self.commands.send(FeedCommand::Reconnect);
        }
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }

    /// Current consumer state.
    pub fn state(&self) -> ConsumerState {
        *self.shared.state.lock()
    }

    /// Sequence token of the last record received, for diagnostics.
    ///
    /// Reconnects do not resume from it; each session starts at the
    /// server's default position.
    pub fn last_seq(&self) -> Option<Value> {
        self.shared.last_seq.lock().clone()
    }
}

/// A self-healing subscription to a database's continuous changes feed.
///
/// Yields [`FeedEvent`]s through [`next`](Self::next) or the [`Stream`] impl.
/// Dropping the feed stops its worker task.
#[derive(Debug)]
pub struct ChangesFeed {
    events: UnboundedReceiverStream<FeedEvent>,
    handle: FeedHandle,
}

impl ChangesFeed {
    /// Validate `config` and start following the feed on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// [`CouchError::Config`] for an invalid configuration or when called
    /// outside a tokio runtime; [`CouchError::Url`] when no URL can be built.
    pub fn spawn(config: FeedConfig, gateway: Arc<dyn Gateway>) -> Result<Self> {
        config.validate()?;
        let url = config.url()?;
        let server_matcher = ServerMatcher::new(&config.expected_server)?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| CouchError::config("changes feed requires a tokio runtime"))?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            cancelled: AtomicBool::new(false),
            state: Mutex::new(ConsumerState::Idle),
            last_seq: Mutex::new(None),
        });

        let span = tracing::info_span!(
            "changes_feed",
            feed_id = %Uuid::new_v4(),
            db = %config.db_name,
        );

        let worker = FeedWorker {
            config,
            url,
            server_matcher,
            gateway,
            parser: ChangeParser::new(),
            events: event_tx,
            commands: command_rx,
            shared: shared.clone(),
        };
        runtime.spawn(worker.run().instrument(span));

        Ok(ChangesFeed {
            events: UnboundedReceiverStream::new(event_rx),
            handle: FeedHandle {
                commands: command_tx,
                shared,
            },
        })
    }

    /// Receive the next event; `None` once the feed has finished.
    pub async fn next(&mut self) -> Option<FeedEvent> {
        self.events.next().await
    }

    /// See [`FeedHandle::cancel`].
    pub fn cancel(&self) {
        self.handle.cancel();
    }

    /// See [`FeedHandle::reconnect`].
    pub fn reconnect(&self) {
        self.handle.reconnect();
    }

    /// A control handle that can outlive borrows of the feed.
    pub fn handle(&self) -> FeedHandle {
        self.handle.clone()
    }

    /// Current consumer state.
    pub fn state(&self) -> ConsumerState {
        self.handle.state()
    }

    /// Sequence token of the last record received.
    pub fn last_seq(&self) -> Option<Value> {
        self.handle.last_seq()
    }
}

impl Stream for ChangesFeed {
    type Item = FeedEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.events).poll_next(cx)
    }
}

/// How a connect attempt or session ended.
#[derive(Debug)]
enum SessionEnd {
    /// Peer closed the body normally
    Closed,
    /// Failure to report before reconnecting
    Failed(CouchError),
    /// Explicit reconnect request
    Reconnect,
    /// Cancel requested, or nobody is listening any more
    Stop,
}

impl From<Option<FeedCommand>> for SessionEnd {
    fn from(command: Option<FeedCommand>) -> Self {
        match command {
            Some(FeedCommand::Reconnect) => SessionEnd::Reconnect,
            Some(FeedCommand::Cancel) | None => SessionEnd::Stop,
        }
    }
}

struct FeedWorker {
    config: FeedConfig,
    url: Url,
    server_matcher: ServerMatcher,
    gateway: Arc<dyn Gateway>,
    parser: ChangeParser,
    events: mpsc::UnboundedSender<FeedEvent>,
    commands: mpsc::UnboundedReceiver<FeedCommand>,
    shared: Arc<Shared>,
}

impl FeedWorker {
    async fn run(mut self) {
        debug!(url = %self.url, "changes feed started");

        loop {
            if self.should_stop() {
                break;
            }

            match self.session().await {
                SessionEnd::Stop => break,
                SessionEnd::Reconnect => {
                    info!("explicit reconnect");
                    self.emit(FeedEvent::Reconnect);
                    continue;
                }
                SessionEnd::Closed => info!("feed closed by peer"),
                SessionEnd::Failed(err) => {
                    warn!(error = %err, "feed session failed");
                    self.emit(FeedEvent::Error(err));
                }
            }

            if self.should_stop() {
                break;
            }

            self.set_state(ConsumerState::Reconnecting);
            self.emit(FeedEvent::Reconnect);
            debug!(delay = ?self.config.reconnect_delay, "reconnect scheduled");

            let delay = sleep(self.config.reconnect_delay);
            tokio::select! {
                biased;
                command = self.commands.recv() => match SessionEnd::from(command) {
                    SessionEnd::Reconnect => {
                        info!("explicit reconnect");
                        self.emit(FeedEvent::Reconnect);
                    }
                    _ => break,
                },
                _ = delay => {}
            }
        }

        self.set_state(ConsumerState::Cancelled);
        if self.shared.cancelled.load(Ordering::SeqCst) {
            info!("changes feed cancelled");
            let _ = self.events.send(FeedEvent::Cancelled);
        } else {
            debug!("event receiver dropped, changes feed stopped");
        }
    }

    /// One connect attempt and, if it succeeds, the session that follows.
    async fn session(&mut self) -> SessionEnd {
        self.set_state(ConsumerState::Connecting);
        debug!("connecting");

        let gateway = Arc::clone(&self.gateway);
        let connect = gateway.stream(self.url.clone(), self.config.credentials.as_ref());
        let response = tokio::select! {
            biased;
            command = self.commands.recv() => return command.into(),
            result = connect => match result {
                Ok(response) => response,
                Err(err) => return SessionEnd::Failed(err),
            },
        };

        if let Err(err) = self.accept(&response) {
            if let CouchError::Status { status, .. } = &err {
                if is_access_denied_status(*status) {
                    warn!(status, "changes feed rejected credentials");
                }
                return match self.read_error_body(response.body).await {
                    Ok(body) => SessionEnd::Failed(CouchError::Status {
                        status: *status,
                        body,
                    }),
                    Err(end) => end,
                };
            }
            return SessionEnd::Failed(err);
        }

        self.parser.reset();
        self.set_state(ConsumerState::Streaming);
        info!(server = response.server().unwrap_or_default(), "feed session established");

        self.stream_body(response.body).await
    }

    /// Identity and status checks on a fresh response.
    fn accept(&self, response: &StreamResponse) -> Result<()> {
        let server = response.server();
        if !self.server_matcher.matches(server) {
            return Err(CouchError::NotCouchDb {
                server: server.map(str::to_string),
            });
        }
        if !(200..300).contains(&response.status) {
            return Err(CouchError::Status {
                status: response.status,
                body: String::new(),
            });
        }
        Ok(())
    }

    async fn stream_body(&mut self, mut body: ByteStream) -> SessionEnd {
        let idle = self.config.idle_timeout;

        loop {
            let chunk = tokio::select! {
                biased;
                command = self.commands.recv() => return command.into(),
                chunk = next_chunk(&mut body, idle) => chunk,
            };

            match chunk {
                Some(Ok(bytes)) => {
                    for record in self.parser.feed(&bytes) {
                        match record {
                            Ok(change) => self.emit(FeedEvent::Change(change)),
                            Err(err) => {
                                warn!(error = %err, "skipping malformed change record");
                                self.emit(FeedEvent::Error(err));
                            }
                        }
                    }
                    if let Some(seq) = self.parser.last_seq() {
                        *self.shared.last_seq.lock() = Some(seq.clone());
                    }
                    if self.should_stop() {
                        return SessionEnd::Stop;
                    }
                }
                Some(Err(err)) => return SessionEnd::Failed(err),
                None => return SessionEnd::Closed,
            }
        }
    }

    /// Collect a bounded prefix of an error response body.
    async fn read_error_body(&mut self, mut body: ByteStream) -> std::result::Result<String, SessionEnd> {
        let mut collected = Vec::new();
        loop {
            let chunk = tokio::select! {
                biased;
                command = self.commands.recv() => return Err(command.into()),
                chunk = body.next() => chunk,
            };
            match chunk {
                Some(Ok(bytes)) => {
                    let room = MAX_ERROR_BODY.saturating_sub(collected.len());
                    collected.extend_from_slice(&bytes[..bytes.len().min(room)]);
                    if collected.len() >= MAX_ERROR_BODY {
                        break;
                    }
                }
                Some(Err(_)) | None => break,
            }
        }
        Ok(String::from_utf8_lossy(&collected).into_owned())
    }

    /// Deliver an event unless cancellation has been requested since.
    fn emit(&self, event: FeedEvent) {
        if self.shared.cancelled.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.events.send(event);
    }

    fn should_stop(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst) || self.events.is_closed()
    }

    fn set_state(&self, state: ConsumerState) {
        *self.shared.state.lock() = state;
    }
}

/// Next body chunk, or an idle-timeout failure when one is configured.
async fn next_chunk(body: &mut ByteStream, idle: Option<Duration>) -> Option<Result<bytes::Bytes>> {
    match idle {
        None => body.next().await,
        Some(limit) => match timeout(limit, body.next()).await {
            Ok(chunk) => chunk,
            Err(_) => Some(Err(CouchError::IdleTimeout(limit))),
        },
    }
}
