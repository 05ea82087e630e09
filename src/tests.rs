//! Changes feed consumer tests against a scripted in-memory gateway.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use http::Method;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tokio_test::{assert_err, assert_ok};
use url::Url;

use crate::client::{ChangesFeed, ConsumerState, FeedConfig, FeedEvent, Gateway, StreamResponse};
use crate::error::{CouchError, Result, TransportKind};
use crate::types::Credentials;

const DELAY: Duration = Duration::from_secs(10);

/// What one connect attempt produces.
enum Step {
    Fail(CouchError),
    Respond {
        status: u16,
        server: Option<&'static str>,
        chunks: Vec<&'static str>,
        /// Keep the body open after the last chunk
        hang: bool,
    },
}

impl Step {
    fn couch(chunks: Vec<&'static str>) -> Self {
        Step::Respond {
            status: 200,
            server: Some("CouchDB/3.2.0 (Erlang OTP/24)"),
            chunks,
            hang: true,
        }
    }

    fn closing(chunks: Vec<&'static str>) -> Self {
        Step::Respond {
            status: 200,
            server: Some("CouchDB/3.2.0 (Erlang OTP/24)"),
            chunks,
            hang: false,
        }
    }

    fn refused() -> Self {
        Step::Fail(CouchError::transport(
            TransportKind::ConnectionRefused,
            "connect ECONNREFUSED 127.0.0.1:5984",
        ))
    }
}

/// Plays back one [`Step`] per connect; once the script runs out, connects never complete.
struct ScriptedGateway {
    script: Mutex<VecDeque<Step>>,
    users: Mutex<Vec<Option<String>>>,
}

impl ScriptedGateway {
    fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(ScriptedGateway {
            script: Mutex::new(steps.into()),
            users: Mutex::new(Vec::new()),
        })
    }

    fn connects(&self) -> usize {
        self.users.lock().len()
    }
}

#[async_trait]
impl Gateway for ScriptedGateway {
    async fn request(
        &self,
        _method: Method,
        _url: Url,
        _body: Option<&Value>,
        _credentials: Option<&Credentials>,
    ) -> Result<Value> {
        Err(CouchError::UnexpectedResponse("point requests are not scripted".into()))
    }

    async fn stream(&self, _url: Url, credentials: Option<&Credentials>) -> Result<StreamResponse> {
        self.users
            .lock()
            .push(credentials.map(|c| c.username.clone()));

        let step = self.script.lock().pop_front();
        match step {
            None => futures::future::pending().await,
            Some(Step::Fail(err)) => Err(err),
            Some(Step::Respond {
                status,
                server,
                chunks,
                hang,
            }) => {
                let mut headers = BTreeMap::new();
                if let Some(server) = server {
                    headers.insert("server".to_string(), server.to_string());
                }
                let chunks = stream::iter(
                    chunks
                        .into_iter()
                        .map(|c| Ok(Bytes::from_static(c.as_bytes())))
                        .collect::<Vec<_>>(),
                );
                let body = if hang {
                    chunks.chain(stream::pending()).boxed()
                } else {
                    chunks.boxed()
                };
                Ok(StreamResponse {
                    status,
                    headers,
                    body,
                })
            }
        }
    }
}

fn spawn(gateway: &Arc<ScriptedGateway>) -> ChangesFeed {
    spawn_with(gateway, feed_config())
}

fn spawn_with(gateway: &Arc<ScriptedGateway>, config: FeedConfig) -> ChangesFeed {
    assert_ok!(ChangesFeed::spawn(config, gateway.clone()))
}

fn feed_config() -> FeedConfig {
    FeedConfig::new("127.0.0.1", 5984, "testdb").with_reconnect_delay(DELAY)
}

async fn next_event(feed: &mut ChangesFeed) -> FeedEvent {
    match timeout(Duration::from_secs(60), feed.next()).await {
        Ok(Some(event)) => event,
        Ok(None) => panic!("feed ended unexpectedly"),
        Err(_) => panic!("no event within 60s"),
    }
}

async fn next_change(feed: &mut ChangesFeed) -> crate::types::ChangeEvent {
    match next_event(feed).await {
        FeedEvent::Change(change) => change,
        other => panic!("expected change, got {:?}", other),
    }
}

async fn expect_reconnect(feed: &mut ChangesFeed) {
    let event = next_event(feed).await;
    assert!(matches!(event, FeedEvent::Reconnect), "got {:?}", event);
}

/// Cancel and check that exactly one `Cancelled` ends the stream.
async fn cancel_and_drain(mut feed: ChangesFeed) {
    feed.cancel();
    let rest: Vec<FeedEvent> = timeout(Duration::from_secs(60), (&mut feed).collect())
        .await
        .expect("feed did not finish after cancel");
    assert_eq!(rest.len(), 1, "events after cancel: {:?}", rest);
    assert!(matches!(rest[0], FeedEvent::Cancelled));
    assert_eq!(feed.state(), ConsumerState::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn test_records_split_across_chunks() {
    let gateway = ScriptedGateway::new(vec![Step::couch(vec![
        "{\"seq\":\"1\",\"id\":\"a\",\"changes\":[{\"rev\":\"1-x\"}]}\n{\"seq\":\"2\",\"id\":\"b\",\"changes\":[]}\n{\"se",
        "q\":\"3\",\"id\":\"c\",\"changes\":[]}",
        "\n\n",
    ])]);
    let mut feed = spawn(&gateway);

    let ids: Vec<String> = [
        next_change(&mut feed).await,
        next_change(&mut feed).await,
        next_change(&mut feed).await,
    ]
    .into_iter()
    .filter_map(|c| c.id)
    .collect();
    assert_eq!(ids, ["a", "b", "c"]);
    assert_eq!(feed.last_seq(), Some(json!("3")));
    assert_eq!(feed.state(), ConsumerState::Streaming);

    cancel_and_drain(feed).await;
}

#[tokio::test(start_paused = true)]
async fn test_malformed_line_does_not_end_session() {
    let gateway = ScriptedGateway::new(vec![Step::closing(vec![
        "{\"seq\":1,\"id\":\"d1\",\"changes\":[]}\n{\"seq\":2,\"id\":\"d2\",\"changes\":[]}\n{\"seq\":3,\"id\":\"d3\",\"changes\":[]}\n",
        "{\"seq\":4,\"id\":\"d4\",\"changes\":[]}\n{\"seq\":5,\"id\":\"d5\",\"changes\":[]}\n{\"seq\":6,\"id\":\"d6\",\"changes\":[]}\n",
        "{\"seq\":7,\"id\":\"d7\",\"changes\":[]}\n{\"seq\":8,\"id\":\"d8\",\"changes\":[]}\n{\"seq\":9,\"id\":\"d9\",\"changes\":[]}\n",
        "{\"seq\":10,\"id\":\n",
        "{\"seq\":11,\"id\":\"d11\",\"changes\":[]}\n",
    ])]);
    let mut feed = spawn(&gateway);

    let mut changes = Vec::new();
    let mut errors = Vec::new();
    loop {
        match next_event(&mut feed).await {
            FeedEvent::Change(change) => changes.push(change),
            FeedEvent::Error(err) => errors.push(err),
            FeedEvent::Reconnect => break,
            FeedEvent::Cancelled => panic!("unexpected cancel"),
        }
    }

    assert_eq!(changes.len(), 10);
    assert_eq!(changes[9].id.as_deref(), Some("d11"));
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], CouchError::Decode { .. }));
    assert_eq!(feed.state(), ConsumerState::Reconnecting);

    cancel_and_drain(feed).await;
}

#[tokio::test(start_paused = true)]
async fn test_foreign_server_rejected() {
    let gateway = ScriptedGateway::new(vec![Step::Respond {
        status: 200,
        server: Some("nginx/1.25"),
        chunks: vec!["{\"seq\":\"1\",\"id\":\"a\",\"changes\":[]}\n"],
        hang: true,
    }]);
    let mut feed = spawn(&gateway);

    match next_event(&mut feed).await {
        FeedEvent::Error(CouchError::NotCouchDb { server }) => {
            assert_eq!(server.as_deref(), Some("nginx/1.25"));
        }
        other => panic!("expected NotCouchDb, got {:?}", other),
    }
    expect_reconnect(&mut feed).await;
    assert_eq!(feed.last_seq(), None);

    cancel_and_drain(feed).await;
}

#[tokio::test(start_paused = true)]
async fn test_custom_server_signature_checked_on_every_connect() {
    let gateway = ScriptedGateway::new(vec![
        Step::Respond {
            status: 200,
            server: Some("pouchdb-server/4.2"),
            chunks: vec!["{\"seq\":\"1\",\"id\":\"a\",\"changes\":[]}\n"],
            hang: false,
        },
        Step::couch(vec!["{\"seq\":\"2\",\"id\":\"b\",\"changes\":[]}\n"]),
    ]);
    let mut config = feed_config();
    config.expected_server = "PouchDB".into();
    let mut feed = spawn_with(&gateway, config);

    assert_eq!(next_change(&mut feed).await.id.as_deref(), Some("a"));
    expect_reconnect(&mut feed).await;
    let event = next_event(&mut feed).await;
    assert!(
        matches!(event, FeedEvent::Error(CouchError::NotCouchDb { .. })),
        "got {:?}",
        event
    );
    expect_reconnect(&mut feed).await;

    cancel_and_drain(feed).await;
}

#[tokio::test(start_paused = true)]
async fn test_missing_server_header_rejected() {
    let gateway = ScriptedGateway::new(vec![Step::Respond {
        status: 200,
        server: None,
        chunks: vec![],
        hang: true,
    }]);
    let mut feed = spawn(&gateway);

    let event = next_event(&mut feed).await;
    assert!(
        matches!(event, FeedEvent::Error(CouchError::NotCouchDb { server: None })),
        "got {:?}",
        event
    );
    expect_reconnect(&mut feed).await;

    cancel_and_drain(feed).await;
}

#[tokio::test(start_paused = true)]
async fn test_error_status_reported_with_body() {
    let gateway = ScriptedGateway::new(vec![Step::Respond {
        status: 401,
        server: Some("CouchDB/3.2.0"),
        chunks: vec!["{\"error\":\"unauthorized\",", "\"reason\":\"Name or password is incorrect.\"}\n"],
        hang: false,
    }]);
    let mut feed = spawn(&gateway);

    match next_event(&mut feed).await {
        FeedEvent::Error(CouchError::Status { status, body }) => {
            assert_eq!(status, 401);
            assert!(body.contains("unauthorized"));
        }
        other => panic!("expected status error, got {:?}", other),
    }
    expect_reconnect(&mut feed).await;

    cancel_and_drain(feed).await;
}

#[tokio::test(start_paused = true)]
async fn test_connection_refused_reconnects_after_delay() {
    let gateway = ScriptedGateway::new(vec![Step::refused(), Step::refused()]);
    let mut feed = spawn(&gateway);
    let start = Instant::now();

    let event = next_event(&mut feed).await;
    match &event {
        FeedEvent::Error(err) => {
            assert_eq!(err.transport_kind(), Some(TransportKind::ConnectionRefused));
            assert!(err.to_string().contains("ECONNREFUSED"));
        }
        other => panic!("expected transport error, got {:?}", other),
    }
    expect_reconnect(&mut feed).await;
    assert_eq!(gateway.connects(), 1);

    assert!(matches!(next_event(&mut feed).await, FeedEvent::Error(_)));
    assert!(start.elapsed() >= DELAY);
    assert_eq!(gateway.connects(), 2);
    expect_reconnect(&mut feed).await;

    cancel_and_drain(feed).await;
}

#[tokio::test(start_paused = true)]
async fn test_peer_close_triggers_reconnect() {
    let gateway = ScriptedGateway::new(vec![
        Step::closing(vec!["{\"seq\":\"1\",\"id\":\"a\",\"changes\":[]}\n"]),
        Step::couch(vec!["{\"seq\":\"1\",\"id\":\"a\",\"changes\":[]}\n"]),
    ]);
    let mut feed = spawn(&gateway);

    assert_eq!(next_change(&mut feed).await.id.as_deref(), Some("a"));
    expect_reconnect(&mut feed).await;
    // No resume: the next session replays from the start.
    assert_eq!(next_change(&mut feed).await.id.as_deref(), Some("a"));
    assert_eq!(gateway.connects(), 2);

    cancel_and_drain(feed).await;
}

#[tokio::test(start_paused = true)]
async fn test_cancel_before_connect() {
    let gateway = ScriptedGateway::new(vec![Step::couch(vec![
        "{\"seq\":\"1\",\"id\":\"a\",\"changes\":[]}\n",
    ])]);
    let feed = spawn(&gateway);
    assert_eq!(feed.state(), ConsumerState::Idle);

    cancel_and_drain(feed).await;
    assert_eq!(gateway.connects(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_while_connecting() {
    let gateway = ScriptedGateway::new(vec![]);
    let feed = spawn(&gateway);

    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(feed.state(), ConsumerState::Connecting);

    cancel_and_drain(feed).await;
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_reconnect_delay() {
    let gateway = ScriptedGateway::new(vec![Step::refused(), Step::refused()]);
    let mut feed = spawn(&gateway);

    assert!(matches!(next_event(&mut feed).await, FeedEvent::Error(_)));
    expect_reconnect(&mut feed).await;

    cancel_and_drain(feed).await;
    assert_eq!(gateway.connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_is_idempotent() {
    let gateway = ScriptedGateway::new(vec![Step::couch(vec![
        "{\"seq\":\"1\",\"id\":\"a\",\"changes\":[]}\n",
    ])]);
    let mut feed = spawn(&gateway);
    let handle = feed.handle();

    next_change(&mut feed).await;
    handle.cancel();
    handle.cancel();
    assert!(feed.handle().is_cancelled());

    // A third cancel through the feed itself is also a no-op.
    cancel_and_drain(feed).await;
}

#[tokio::test(start_paused = true)]
async fn test_no_change_after_cancel() {
    let gateway = ScriptedGateway::new(vec![Step::couch(vec![
        "{\"seq\":\"1\",\"id\":\"a\",\"changes\":[]}\n",
        "{\"seq\":\"2\",\"id\":\"b\",\"changes\":[]}\n",
    ])]);
    let mut feed = spawn(&gateway);
    tokio::time::sleep(Duration::from_millis(1)).await;

    // Records delivered before the cancel stay queued; Cancelled is last.
    feed.cancel();
    let mut seen_cancelled = false;
    while let Some(event) = feed.next().await {
        assert!(!seen_cancelled, "event after Cancelled: {:?}", event);
        if matches!(event, FeedEvent::Cancelled) {
            seen_cancelled = true;
        }
    }
    assert!(seen_cancelled);
}

#[tokio::test(start_paused = true)]
async fn test_explicit_reconnect_while_streaming() {
    let gateway = ScriptedGateway::new(vec![
        Step::couch(vec!["{\"seq\":\"1\",\"id\":\"a\",\"changes\":[]}\n"]),
        Step::couch(vec!["{\"seq\":\"9\",\"id\":\"b\",\"changes\":[]}\n"]),
    ]);
    let mut feed = spawn(&gateway);
    let start = Instant::now();

    assert_eq!(next_change(&mut feed).await.id.as_deref(), Some("a"));
    feed.reconnect();
    expect_reconnect(&mut feed).await;
    assert_eq!(next_change(&mut feed).await.id.as_deref(), Some("b"));

    assert!(start.elapsed() < DELAY);
    assert_eq!(gateway.connects(), 2);
    assert_eq!(feed.last_seq(), Some(json!("9")));

    cancel_and_drain(feed).await;
}

#[tokio::test(start_paused = true)]
async fn test_explicit_reconnect_skips_delay() {
    let gateway = ScriptedGateway::new(vec![
        Step::refused(),
        Step::couch(vec!["{\"seq\":\"1\",\"id\":\"a\",\"changes\":[]}\n"]),
    ]);
    let mut feed = spawn(&gateway);
    let start = Instant::now();

    assert!(matches!(next_event(&mut feed).await, FeedEvent::Error(_)));
    expect_reconnect(&mut feed).await;
    feed.reconnect();
    expect_reconnect(&mut feed).await;
    assert_eq!(next_change(&mut feed).await.id.as_deref(), Some("a"));
    assert!(start.elapsed() < DELAY);

    cancel_and_drain(feed).await;
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_after_cancel_is_ignored() {
    let gateway = ScriptedGateway::new(vec![]);
    let feed = spawn(&gateway);
    feed.cancel();
    feed.reconnect();

    let events: Vec<FeedEvent> = feed.collect().await;
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], FeedEvent::Cancelled));
}

#[tokio::test(start_paused = true)]
async fn test_idle_timeout_tears_session_down() {
    let gateway = ScriptedGateway::new(vec![Step::couch(vec![
        "{\"seq\":\"1\",\"id\":\"a\",\"changes\":[]}\n",
    ])]);
    let config = feed_config().with_idle_timeout(Duration::from_secs(45));
    let mut feed = spawn_with(&gateway, config);

    next_change(&mut feed).await;
    let event = next_event(&mut feed).await;
    assert!(
        matches!(event, FeedEvent::Error(CouchError::IdleTimeout(d)) if d == Duration::from_secs(45)),
        "got {:?}",
        event
    );
    expect_reconnect(&mut feed).await;

    cancel_and_drain(feed).await;
}

#[tokio::test(start_paused = true)]
async fn test_silent_session_without_idle_timeout() {
    let gateway = ScriptedGateway::new(vec![Step::couch(vec!["\n"])]);
    let mut feed = spawn(&gateway);

    assert_err!(timeout(Duration::from_secs(3600), feed.next()).await);
    assert_eq!(feed.state(), ConsumerState::Streaming);

    cancel_and_drain(feed).await;
}

#[tokio::test(start_paused = true)]
async fn test_credentials_sent_on_every_connect() {
    let gateway = ScriptedGateway::new(vec![Step::refused()]);
    let config = feed_config().with_credentials(Credentials::new("testuser", "testpass"));
    let mut feed = spawn_with(&gateway, config);

    assert!(matches!(next_event(&mut feed).await, FeedEvent::Error(_)));
    expect_reconnect(&mut feed).await;
    tokio::time::sleep(DELAY + Duration::from_millis(1)).await;

    assert_eq!(
        *gateway.users.lock(),
        vec![Some("testuser".to_string()), Some("testuser".to_string())]
    );
    cancel_and_drain(feed).await;
}

#[tokio::test(start_paused = true)]
async fn test_dropping_feed_stops_worker() {
    let gateway = ScriptedGateway::new(vec![]);
    let feed = spawn(&gateway);
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert!(Arc::strong_count(&gateway) > 1);

    drop(feed);
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(Arc::strong_count(&gateway), 1);
}

#[test]
fn test_spawn_requires_runtime() {
    let gateway = ScriptedGateway::new(vec![]);
    let result = ChangesFeed::spawn(feed_config(), gateway);
    assert!(matches!(result, Err(CouchError::Config(_))));
}

#[tokio::test]
async fn test_spawn_rejects_invalid_config() {
    let gateway = ScriptedGateway::new(vec![]);
    let result = ChangesFeed::spawn(FeedConfig::new("127.0.0.1", 5984, ""), gateway.clone());
    assert!(matches!(result, Err(CouchError::Config(_))));
    assert_eq!(gateway.connects(), 0);
}
