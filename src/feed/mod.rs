//! Upstream Kraken ticker connection.
//!
//! A single task owns the whole lifecycle: connect (with a handshake timeout),
//! fetch the pair directory and subscribe, read frames until the stream ends,
//! wait the fixed reconnect delay, repeat. Every socket outcome is turned into a
//! [`FeedEvent`] and fed through [`FeedConnection::dispatch`], the only place the
//! [`ConnectionState`] changes. Because the retry loop lives in that one task,
//! reconnect attempts cannot stack.
//!
//! Shutdown goes through the cancellation token: the state moves to `Closing`
//! before the close frame is sent, and `Closing` never schedules a reconnect.

pub mod directory;
pub mod parser;

use std::sync::Arc;
use std::sync::atomic::Ordering::Relaxed;
use std::time::{Duration, Instant};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async_tls_with_config};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::cache::InstrumentCache;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::names::NameResolver;
use crate::types::{ConnectionState, InstrumentQuote};

use directory::PairDirectory;
use parser::{ControlEvent, ControlKind, ParsedEvent, TickerUpdate};

pub const KRAKEN_WS_URL: &str = "wss://ws.kraken.com";

/// Longest payload prefix logged for an unrecognized frame.
const PAYLOAD_HEAD_CHARS: usize = 200;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

#[derive(Debug, Clone)]
pub struct FeedSettings {
    pub url: String,
    /// Fixed wait between losing a connection and the next attempt.
    pub reconnect_delay: Duration,
    /// Upper bound on TCP connect + TLS + WebSocket upgrade.
    pub handshake_timeout: Duration,
    /// Longest silence tolerated once subscribed. Kraken heartbeats every second.
    pub idle_timeout: Duration,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            url: KRAKEN_WS_URL.to_string(),
            reconnect_delay: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(10),
        }
    }
}

/// Everything that can happen to the upstream connection.
#[derive(Debug)]
enum FeedEvent {
    /// WebSocket handshake completed.
    Opened,
    Frame(Message),
    /// Connect, handshake, directory, or socket error.
    Failed(Error),
    /// Peer closed or the stream ended.
    Closed,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Continue,
    Reconnect,
    Stop,
}

pub struct FeedConnection<D> {
    settings: FeedSettings,
    directory: D,
    cache: Arc<InstrumentCache>,
    names: Arc<NameResolver>,
    /// Bumped after every accepted cache write.
    updates: watch::Sender<u64>,
    state: watch::Sender<ConnectionState>,
    metrics: Arc<Metrics>,
}

impl<D: PairDirectory> FeedConnection<D> {
    pub fn new(
        settings: FeedSettings,
        directory: D,
        cache: Arc<InstrumentCache>,
        names: Arc<NameResolver>,
        updates: watch::Sender<u64>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            settings,
            directory,
            cache,
            names,
            updates,
            state,
            metrics,
        }
    }

    /// Observe state transitions. Take this before calling [`Self::run`].
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Connect and keep reconnecting until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                self.dispatch(FeedEvent::Shutdown);
                break;
            }

            self.transition(ConnectionState::Connecting);
            info!(url = %self.settings.url, "connecting");

            let connected = tokio::select! {
                _ = cancel.cancelled() => None,
                connected = self.connect() => Some(connected),
            };
            let step = match connected {
                None => self.dispatch(FeedEvent::Shutdown),
                Some(Ok(ws)) => self.session(ws, &cancel).await,
                Some(Err(e)) => self.dispatch(FeedEvent::Failed(e)),
            };
            if step == Step::Stop {
                break;
            }

            self.metrics.reconnections.fetch_add(1, Relaxed);
            warn!(
                delay_ms = self.settings.reconnect_delay.as_millis() as u64,
                "reconnecting"
            );
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.dispatch(FeedEvent::Shutdown);
                    break;
                }
                _ = tokio::time::sleep(self.settings.reconnect_delay) => {}
            }
        }
        info!("feed connection stopped");
    }

    async fn connect(&self) -> Result<WsStream> {
        let handshake = connect_async_tls_with_config(
            self.settings.url.as_str(),
            None,
            true, // TCP_NODELAY
            None,
        );
        match tokio::time::timeout(self.settings.handshake_timeout, handshake).await {
            Err(_) => Err(Error::HandshakeTimeout(self.settings.handshake_timeout)),
            Ok(result) => Ok(result?.0),
        }
    }

    /// One connected session: subscribe, then read until it ends.
    async fn session(&self, ws: WsStream, cancel: &CancellationToken) -> Step {
        let (mut write, mut read) = ws.split();
        self.dispatch(FeedEvent::Opened);

        let subscribed = tokio::select! {
            _ = cancel.cancelled() => None,
            subscribed = self.subscribe(&mut write) => Some(subscribed),
        };
        // Without subscriptions the feed may legitimately stay silent.
        let idle = match subscribed {
            None => return self.shutdown(&mut write).await,
            Some(Err(e)) => return self.dispatch(FeedEvent::Failed(e)),
            Some(Ok(true)) => Some(self.settings.idle_timeout),
            Some(Ok(false)) => None,
        };

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => None,
                event = next_event(&mut read, idle) => Some(event),
            };
            let step = match event {
                None => return self.shutdown(&mut write).await,
                Some(event) => self.dispatch(event),
            };
            if step != Step::Continue {
                return step;
            }
        }
    }

    /// Fetch the directory and send one subscribe frame for every matching pair.
    /// Returns whether anything was subscribed.
    async fn subscribe(&self, write: &mut WsSink) -> Result<bool> {
        let request = self.directory.fetch_pairs().await?;
        if request.is_empty() {
            warn!("pair directory matched nothing, connected without subscriptions");
            return Ok(false);
        }
        write.send(Message::Text(request.to_frame())).await?;
        info!(pairs = request.pairs().len(), "ticker subscription sent");
        Ok(true)
    }

    /// Enter `Closing` first, then close the socket.
    async fn shutdown(&self, write: &mut WsSink) -> Step {
        let step = self.dispatch(FeedEvent::Shutdown);
        if let Err(e) = write.send(Message::Close(None)).await {
            debug!(error = %e, "close frame not sent");
        }
        step
    }

    /// Apply one event to the state machine and decide what the loop does next.
    fn dispatch(&self, event: FeedEvent) -> Step {
        let current = *self.state.borrow();
        match event {
            FeedEvent::Opened => {
                info!("connected");
                self.transition(ConnectionState::Subscribed);
                Step::Continue
            }
            FeedEvent::Frame(msg) => {
                self.on_frame(&msg);
                Step::Continue
            }
            FeedEvent::Failed(e) => {
                self.metrics.feed_errors.fetch_add(1, Relaxed);
                match current {
                    ConnectionState::Closing => return Step::Stop,
                    ConnectionState::Connecting => error!(error = %e, "connection failed"),
                    _ => warn!(error = %e, "feed connection lost"),
                }
                self.transition(ConnectionState::Disconnected);
                Step::Reconnect
            }
            FeedEvent::Closed => {
                if current == ConnectionState::Closing {
                    return Step::Stop;
                }
                warn!("stream ended");
                self.transition(ConnectionState::Disconnected);
                Step::Reconnect
            }
            FeedEvent::Shutdown => {
                if current != ConnectionState::Closing {
                    info!("shutting down");
                }
                self.transition(ConnectionState::Closing);
                Step::Stop
            }
        }
    }

    fn transition(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        self.metrics
            .feed_up
            .store(next == ConnectionState::Subscribed, Relaxed);
        if prev != next {
            debug!(from = %prev, to = %next, "feed state");
        }
    }

    fn on_frame(&self, msg: &Message) {
        let t0 = Instant::now();
        let parsed = match msg {
            Message::Text(text) => parser::parse(text),
            Message::Binary(bytes) => parser::parse_bytes(bytes),
            // Ping/pong replies are handled by tungstenite.
            _ => return,
        };
        self.metrics.feed_messages.fetch_add(1, Relaxed);

        match parsed {
            ParsedEvent::Ticker(update) => self.apply(update),
            ParsedEvent::Control(event) => log_control(&event),
            ParsedEvent::Unrecognized => {
                self.metrics.feed_unrecognized.fetch_add(1, Relaxed);
                let payload_head = msg
                    .to_text()
                    .map_or("<binary>", |t| head(t, PAYLOAD_HEAD_CHARS));
                warn!(payload_head, "unrecognized frame");
            }
        }
        self.metrics.frame_latency.record(t0.elapsed());
    }

    fn apply(&self, update: TickerUpdate) {
        let name = self.names.resolve_pair(&update.pair);
        let quote = InstrumentQuote {
            pair: update.pair,
            name,
            price: update.ask,
        };
        trace!(pair = %quote.pair, price = %quote.price, "ticker");
        if self.cache.upsert(quote) {
            self.metrics.feed_tickers.fetch_add(1, Relaxed);
            self.metrics
                .cached_instruments
                .store(self.cache.len() as u64, Relaxed);
            self.updates.send_modify(|seq| *seq = seq.wrapping_add(1));
        }
    }
}

/// Next socket outcome as a [`FeedEvent`]; silence longer than `idle` is a failure.
async fn next_event(read: &mut WsRead, idle: Option<Duration>) -> FeedEvent {
    let msg = match idle {
        Some(limit) => match tokio::time::timeout(limit, read.next()).await {
            Ok(msg) => msg,
            Err(_) => return FeedEvent::Failed(Error::IdleTimeout(limit)),
        },
        None => read.next().await,
    };
    match msg {
        Some(Ok(Message::Close(frame))) => {
            debug!(?frame, "close frame received");
            FeedEvent::Closed
        }
        Some(Ok(msg)) => FeedEvent::Frame(msg),
        Some(Err(e)) => FeedEvent::Failed(e.into()),
        None => FeedEvent::Closed,
    }
}

fn log_control(event: &ControlEvent) {
    let detail = event.detail.as_deref().unwrap_or("");
    match event.kind {
        ControlKind::SubscriptionStatus => info!(pair = detail, "subscription acknowledged"),
        ControlKind::SystemStatus => info!(status = detail, "system status"),
        ControlKind::Error => warn!(message = detail, "feed error event"),
        ControlKind::Heartbeat | ControlKind::Pong => trace!(kind = ?event.kind, "control event"),
    }
}

/// At most `max` chars of `s`, cut on a char boundary.
fn head(s: &str, max: usize) -> &str {
    s.char_indices().nth(max).map_or(s, |(i, _)| &s[..i])
}
