//! End-to-end tests: mock Kraken feed → cache → orchestrator → WebSocket server → client.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, connect_async};
use tokio_util::sync::CancellationToken;

use ticker_relay::cache::InstrumentCache;
use ticker_relay::error::{Error, Result};
use ticker_relay::feed::directory::{KrakenDirectory, PairDirectory, SubscriptionRequest};
use ticker_relay::feed::{FeedConnection, FeedSettings};
use ticker_relay::hub::SubscriberHub;
use ticker_relay::metrics::{self, Metrics};
use ticker_relay::names::NameResolver;
use ticker_relay::orchestrator::Orchestrator;
use ticker_relay::server::{self, AppState, LIVE_PATH};
use ticker_relay::types::{ConnectionState, Snapshot};

const XBT_TICK: &str = r#"[340,{"a":["97250.1","1","1.000"],"b":["97250.0","3","3.000"]},"ticker","XBT/USD"]"#;
const ETH_TICK: &str = r#"[341,{"a":["2650.12","10","10.000"],"b":["2650.00","2","2.000"]},"ticker","ETH/USD"]"#;

/// Directory stub returning a fixed pair list.
struct StaticPairs(Vec<&'static str>);

impl PairDirectory for StaticPairs {
    async fn fetch_pairs(&self) -> Result<SubscriptionRequest> {
        Ok(SubscriptionRequest::new(self.0.iter().copied()))
    }
}

struct Relay {
    cache: Arc<InstrumentCache>,
    hub: Arc<SubscriberHub>,
    metrics: Arc<Metrics>,
    state: watch::Receiver<ConnectionState>,
    ws_addr: std::net::SocketAddr,
    cancel: CancellationToken,
}

/// Wire the full pipeline against `feed_url` with ephemeral downstream ports.
async fn start_relay(feed_url: String, reconnect_delay: Duration) -> Relay {
    let cancel = CancellationToken::new();
    let metrics = Arc::new(Metrics::default());
    let cache = Arc::new(InstrumentCache::new());
    let hub = Arc::new(SubscriberHub::new(16));
    let (updates_tx, updates_rx) = watch::channel(0u64);

    let orchestrator = Arc::new(Orchestrator::new(cache.clone(), hub.clone(), metrics.clone()));
    tokio::spawn(orchestrator.clone().run(updates_rx, cancel.clone()));

    let feed = FeedConnection::new(
        FeedSettings {
            url: feed_url,
            reconnect_delay,
            handshake_timeout: Duration::from_secs(2),
            idle_timeout: Duration::from_secs(5),
        },
        StaticPairs(vec!["XBT/USD", "ETH/USD"]),
        cache.clone(),
        Arc::new(NameResolver::default()),
        updates_tx,
        metrics.clone(),
    );
    let state = feed.state();
    tokio::spawn(feed.run(cancel.clone()));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ws_addr = listener.local_addr().unwrap();
    let app = AppState {
        hub: hub.clone(),
        orchestrator,
        metrics: metrics.clone(),
    };
    tokio::spawn(server::serve(listener, app, cancel.clone()));

    Relay {
        cache,
        hub,
        metrics,
        state,
        ws_addr,
        cancel,
    }
}

/// Next downstream snapshot satisfying `pred`.
async fn next_snapshot<S>(ws: &mut S, pred: impl Fn(&Snapshot) -> bool) -> Snapshot
where
    S: futures_util::Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                let snapshot: Snapshot = serde_json::from_str(&text).unwrap();
                if pred(&snapshot) {
                    return snapshot;
                }
            }
        }
    })
    .await
    .expect("timed out waiting for snapshot")
}

async fn wait_for_state(state: &mut watch::Receiver<ConnectionState>, want: ConnectionState) {
    tokio::time::timeout(Duration::from_secs(3), state.wait_for(|s| *s == want))
        .await
        .expect("state reached in time")
        .unwrap();
}

#[tokio::test]
async fn feed_ticks_reach_downstream_subscribers_ranked() {
    // Mock upstream: expect one subscribe frame, answer with two tickers, stay open.
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();
    let (subscribe_tx, subscribe_rx) = tokio::sync::oneshot::channel::<String>();
    tokio::spawn(async move {
        let (tcp, _) = upstream.accept().await.unwrap();
        let mut ws = accept_async(tcp).await.unwrap();
        if let Some(Ok(Message::Text(frame))) = ws.next().await {
            let _ = subscribe_tx.send(frame);
        }
        ws.send(Message::Text(r#"{"event":"heartbeat"}"#.into())).await.unwrap();
        ws.send(Message::Text(ETH_TICK.into())).await.unwrap();
        ws.send(Message::Text(XBT_TICK.into())).await.unwrap();
        while let Some(Ok(_)) = ws.next().await {}
    });

    let mut relay = start_relay(format!("ws://{upstream_addr}"), Duration::from_secs(5)).await;

    let frame = tokio::time::timeout(Duration::from_secs(3), subscribe_rx)
        .await
        .unwrap()
        .unwrap();
    let frame: serde_json::Value = serde_json::from_str(&frame).unwrap();
    assert_eq!(frame["event"], "subscribe");
    assert_eq!(frame["subscription"]["name"], "ticker");
    assert_eq!(frame["pair"], serde_json::json!(["ETH/USD", "XBT/USD"]));
    wait_for_state(&mut relay.state, ConnectionState::Subscribed).await;

    let url = format!("ws://{}{LIVE_PATH}", relay.ws_addr);
    let (mut client, _) = connect_async(url.as_str()).await.unwrap();
    let snapshot = next_snapshot(&mut client, |s| s.len() == 2).await;

    assert_eq!(snapshot.0[0].pair, "XBT/USD");
    assert_eq!(snapshot.0[0].name, "Bitcoin");
    assert_eq!(snapshot.0[0].price.to_string(), "97250.1");
    assert_eq!(snapshot.0[1].pair, "ETH/USD");
    assert_eq!(snapshot.0[1].name, "Ethereum");
    assert_eq!(relay.cache.len(), 2);

    // A late subscriber gets the current ranking immediately.
    let (mut late, _) = connect_async(url.as_str()).await.unwrap();
    let initial = next_snapshot(&mut late, |_| true).await;
    assert_eq!(initial, snapshot);

    // Disconnecting unregisters the subscriber.
    late.close(None).await.unwrap();
    drop(late);
    tokio::time::timeout(Duration::from_secs(3), async {
        while relay.hub.len() != 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("closed subscriber unregistered");

    relay.cancel.cancel();
    wait_for_state(&mut relay.state, ConnectionState::Closing).await;
}

#[tokio::test]
async fn new_subscriber_gets_empty_snapshot_before_any_tick() {
    // Upstream that never answers the handshake.
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();
    let relay = start_relay(format!("ws://{upstream_addr}"), Duration::from_secs(5)).await;

    let (mut client, _) = connect_async(format!("ws://{}{LIVE_PATH}", relay.ws_addr).as_str())
        .await
        .unwrap();
    let initial = next_snapshot(&mut client, |_| true).await;
    assert!(initial.is_empty());

    relay.cancel.cancel();
    drop(upstream);
}

#[tokio::test]
async fn closed_upstream_is_retried_one_connection_at_a_time() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let active = Arc::new(AtomicUsize::new(0));
    let max_active = Arc::new(AtomicUsize::new(0));

    // Mock upstream: accept, read the subscribe frame, close.
    tokio::spawn({
        let (accepted, active, max_active) = (accepted.clone(), active.clone(), max_active.clone());
        async move {
            loop {
                let Ok((tcp, _)) = upstream.accept().await else { return };
                accepted.fetch_add(1, Ordering::SeqCst);
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_active.fetch_max(now, Ordering::SeqCst);
                let active = active.clone();
                tokio::spawn(async move {
                    if let Ok(mut ws) = accept_async(tcp).await {
                        let _ = ws.next().await;
                        let _ = ws.close(None).await;
                        while let Some(Ok(_)) = ws.next().await {}
                    }
                    active.fetch_sub(1, Ordering::SeqCst);
                });
            }
        }
    });

    let mut relay = start_relay(format!("ws://{upstream_addr}"), Duration::from_millis(100)).await;

    tokio::time::sleep(Duration::from_millis(250)).await;
    let attempts = accepted.load(Ordering::SeqCst);
    assert!((2..=4).contains(&attempts), "attempts = {attempts}");
    assert_eq!(max_active.load(Ordering::SeqCst), 1);
    assert!(relay.metrics.reconnections.load(Ordering::Relaxed) >= 2);

    relay.cancel.cancel();
    wait_for_state(&mut relay.state, ConnectionState::Closing).await;

    // No attempts after shutdown.
    let settled = accepted.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(accepted.load(Ordering::SeqCst), settled);
}

#[tokio::test]
async fn health_follows_feed_connection() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();
    tokio::spawn(async move {
        let (tcp, _) = upstream.accept().await.unwrap();
        let mut ws = accept_async(tcp).await.unwrap();
        while let Some(Ok(_)) = ws.next().await {}
    });

    let metrics_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let metrics_addr = metrics_listener.local_addr().unwrap();
    let mut relay = start_relay(format!("ws://{upstream_addr}"), Duration::from_secs(5)).await;
    tokio::spawn(metrics::serve_http(metrics_listener, relay.metrics.clone(), relay.cancel.clone()));

    wait_for_state(&mut relay.state, ConnectionState::Subscribed).await;
    let resp = reqwest::get(format!("http://{metrics_addr}/health")).await.unwrap();
    assert_eq!(resp.status().as_u16(), StatusCode::OK.as_u16());

    let body = reqwest::get(format!("http://{metrics_addr}/metrics"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(body.contains("relay_feed_up 1\n"));

    relay.cancel.cancel();
    wait_for_state(&mut relay.state, ConnectionState::Closing).await;
    assert!(!relay.metrics.feed_up.load(Ordering::Relaxed));
}

// ---------------------------------------------------------------------------
// Feed connection failure paths
// ---------------------------------------------------------------------------

/// Directory with no matching pairs.
struct NoPairs;

impl PairDirectory for NoPairs {
    async fn fetch_pairs(&self) -> Result<SubscriptionRequest> {
        Ok(SubscriptionRequest::default())
    }
}

/// Directory whose lookup always fails.
struct BrokenDirectory;

impl PairDirectory for BrokenDirectory {
    async fn fetch_pairs(&self) -> Result<SubscriptionRequest> {
        Err(Error::Directory("EService:Unavailable".to_string()))
    }
}

struct Feed {
    metrics: Arc<Metrics>,
    state: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
}

fn spawn_feed<D: PairDirectory>(settings: FeedSettings, directory: D) -> Feed {
    let metrics = Arc::new(Metrics::default());
    let (updates_tx, _) = watch::channel(0u64);
    let feed = FeedConnection::new(
        settings,
        directory,
        Arc::new(InstrumentCache::new()),
        Arc::new(NameResolver::default()),
        updates_tx,
        metrics.clone(),
    );
    let state = feed.state();
    let cancel = CancellationToken::new();
    tokio::spawn(feed.run(cancel.clone()));
    Feed { metrics, state, cancel }
}

fn fast_settings(url: String) -> FeedSettings {
    FeedSettings {
        url,
        reconnect_delay: Duration::from_millis(100),
        handshake_timeout: Duration::from_secs(2),
        idle_timeout: Duration::from_secs(5),
    }
}

#[derive(Clone, Default)]
struct UpstreamCounts {
    connections: Arc<AtomicUsize>,
    text_frames: Arc<AtomicUsize>,
}

/// Mock upstream that upgrades every connection, counts inbound text frames
/// and never closes. With `heartbeat` set it sends one at that interval.
async fn counting_upstream(heartbeat: Option<Duration>) -> (String, UpstreamCounts) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let counts = UpstreamCounts::default();
    tokio::spawn({
        let counts = counts.clone();
        async move {
            loop {
                let Ok((tcp, _)) = listener.accept().await else { return };
                counts.connections.fetch_add(1, Ordering::SeqCst);
                let counts = counts.clone();
                tokio::spawn(async move {
                    let Ok(mut ws) = accept_async(tcp).await else { return };
                    let mut beat = tokio::time::interval(heartbeat.unwrap_or(Duration::from_secs(3600)));
                    loop {
                        let inbound = tokio::select! {
                            msg = ws.next() => Some(msg),
                            _ = beat.tick(), if heartbeat.is_some() => None,
                        };
                        match inbound {
                            Some(Some(Ok(Message::Text(_)))) => {
                                counts.text_frames.fetch_add(1, Ordering::SeqCst);
                            }
                            Some(Some(Ok(_))) => {}
                            Some(_) => break,
                            None => {
                                let beat = Message::Text(r#"{"event":"heartbeat"}"#.into());
                                if ws.send(beat).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        }
    });
    (url, counts)
}

#[tokio::test]
async fn empty_directory_stays_connected_without_subscribing() {
    let (url, counts) = counting_upstream(None).await;
    let settings = FeedSettings {
        // Silence is expected with nothing subscribed, so the idle limit must not apply.
        idle_timeout: Duration::from_millis(100),
        ..fast_settings(url)
    };
    let mut feed = spawn_feed(settings, NoPairs);

    wait_for_state(&mut feed.state, ConnectionState::Subscribed).await;
    tokio::time::sleep(Duration::from_millis(350)).await;

    assert_eq!(counts.connections.load(Ordering::SeqCst), 1);
    assert_eq!(counts.text_frames.load(Ordering::SeqCst), 0);
    assert_eq!(*feed.state.borrow(), ConnectionState::Subscribed);
    assert_eq!(feed.metrics.reconnections.load(Ordering::Relaxed), 0);
    assert_eq!(feed.metrics.feed_errors.load(Ordering::Relaxed), 0);

    feed.cancel.cancel();
    wait_for_state(&mut feed.state, ConnectionState::Closing).await;
}

#[tokio::test]
async fn directory_failure_reconnects() {
    let (url, counts) = counting_upstream(None).await;
    let mut feed = spawn_feed(fast_settings(url), BrokenDirectory);

    tokio::time::sleep(Duration::from_millis(350)).await;

    let connections = counts.connections.load(Ordering::SeqCst);
    assert!(connections >= 2, "connections = {connections}");
    assert_eq!(counts.text_frames.load(Ordering::SeqCst), 0);
    assert!(feed.metrics.feed_errors.load(Ordering::Relaxed) >= 2);
    assert!(feed.metrics.reconnections.load(Ordering::Relaxed) >= 2);

    feed.cancel.cancel();
    wait_for_state(&mut feed.state, ConnectionState::Closing).await;
}

#[tokio::test]
async fn handshake_timeout_reconnects() {
    // Accepts TCP but never answers the upgrade request.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let accepted = Arc::new(AtomicUsize::new(0));
    tokio::spawn({
        let accepted = accepted.clone();
        async move {
            let mut held = Vec::new();
            while let Ok((tcp, _)) = listener.accept().await {
                accepted.fetch_add(1, Ordering::SeqCst);
                held.push(tcp);
            }
        }
    });

    let settings = FeedSettings {
        reconnect_delay: Duration::from_millis(50),
        handshake_timeout: Duration::from_millis(100),
        ..fast_settings(url)
    };
    let mut feed = spawn_feed(settings, StaticPairs(vec!["XBT/USD"]));

    wait_for_state(&mut feed.state, ConnectionState::Connecting).await;
    wait_for_state(&mut feed.state, ConnectionState::Disconnected).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let attempts = accepted.load(Ordering::SeqCst);
    assert!(attempts >= 2, "attempts = {attempts}");
    assert!(feed.metrics.feed_errors.load(Ordering::Relaxed) >= 2);
    assert!(!feed.metrics.feed_up.load(Ordering::Relaxed));

    feed.cancel.cancel();
    wait_for_state(&mut feed.state, ConnectionState::Closing).await;
}

#[tokio::test]
async fn silent_upstream_is_dropped_after_idle_timeout() {
    let (url, counts) = counting_upstream(None).await;
    let settings = FeedSettings {
        reconnect_delay: Duration::from_millis(50),
        idle_timeout: Duration::from_millis(100),
        ..fast_settings(url)
    };
    let mut feed = spawn_feed(settings, StaticPairs(vec!["XBT/USD"]));

    tokio::time::sleep(Duration::from_millis(400)).await;

    let connections = counts.connections.load(Ordering::SeqCst);
    assert!(connections >= 2, "connections = {connections}");
    // Every new connection subscribes again.
    assert!(counts.text_frames.load(Ordering::SeqCst) >= 2);
    assert!(feed.metrics.feed_errors.load(Ordering::Relaxed) >= 1);

    feed.cancel.cancel();
    wait_for_state(&mut feed.state, ConnectionState::Closing).await;
}

#[tokio::test]
async fn heartbeats_keep_subscribed_connection_alive() {
    let (url, counts) = counting_upstream(Some(Duration::from_millis(30))).await;
    let settings = FeedSettings {
        idle_timeout: Duration::from_millis(150),
        ..fast_settings(url)
    };
    let mut feed = spawn_feed(settings, StaticPairs(vec!["XBT/USD"]));

    wait_for_state(&mut feed.state, ConnectionState::Subscribed).await;
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(counts.connections.load(Ordering::SeqCst), 1);
    assert_eq!(*feed.state.borrow(), ConnectionState::Subscribed);
    assert_eq!(feed.metrics.feed_errors.load(Ordering::Relaxed), 0);

    feed.cancel.cancel();
    wait_for_state(&mut feed.state, ConnectionState::Closing).await;
}

// ---------------------------------------------------------------------------
// Pair directory over HTTP
// ---------------------------------------------------------------------------

async fn serve_pairs(status: StatusCode, body: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new().route("/0/public/AssetPairs", get(move || async move { (status, body) }));
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    format!("http://{addr}/0/public/AssetPairs")
}

#[tokio::test]
async fn kraken_directory_filters_usd_pairs() {
    let url = serve_pairs(
        StatusCode::OK,
        r#"{"error":[],"result":{"XXBTZUSD":{"wsname":"XBT/USD"},"XETHZEUR":{"wsname":"ETH/EUR"},"SOLUSD":{"wsname":"SOL/USD"},"XXBTZUSD.d":{}}}"#,
    )
    .await;
    let directory = KrakenDirectory::new(reqwest::Client::new(), url, "/USD");
    let request = directory.fetch_pairs().await.unwrap();
    assert_eq!(request.pairs(), ["SOL/USD", "XBT/USD"]);
}

#[tokio::test]
async fn kraken_directory_surfaces_api_and_http_errors() {
    let api_error = serve_pairs(StatusCode::OK, r#"{"error":["EGeneral:Internal error"]}"#).await;
    let directory = KrakenDirectory::new(reqwest::Client::new(), api_error, "/USD");
    assert!(directory.fetch_pairs().await.is_err());

    let http_error = serve_pairs(StatusCode::SERVICE_UNAVAILABLE, "busy").await;
    let directory = KrakenDirectory::new(reqwest::Client::new(), http_error, "/USD");
    assert!(directory.fetch_pairs().await.is_err());
}
