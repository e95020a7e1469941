//! Relay metrics in Prometheus text format, plus `/health`.
//!
//! Counters and gauges are plain atomics written from the feed, orchestrator
//! and subscriber tasks. No external metrics crate: everything is rendered by
//! hand on each scrape.

use std::fmt::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering::Relaxed};
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

// ---------------------------------------------------------------------------
// Histogram
// ---------------------------------------------------------------------------

const NUM_BUCKETS: usize = 10;

/// Upper bounds in nanoseconds + `le` labels, 10μs to 100ms. Frame handling
/// sits at the low end, broadcast serialization plus fan-out higher up.
const BUCKETS: [(u64, &str); NUM_BUCKETS] = [
    (10_000, "0.00001"),
    (50_000, "0.00005"),
    (100_000, "0.0001"),
    (500_000, "0.0005"),
    (1_000_000, "0.001"),
    (5_000_000, "0.005"),
    (10_000_000, "0.01"),
    (25_000_000, "0.025"),
    (50_000_000, "0.05"),
    (100_000_000, "0.1"),
];

pub struct LatencyHistogram {
    /// Non-cumulative per-bucket counts; summed on render.
    buckets: [AtomicU64; NUM_BUCKETS],
    sum_ns: AtomicU64,
    count: AtomicU64,
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            sum_ns: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }
}

impl LatencyHistogram {
    pub fn record(&self, elapsed: Duration) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        if let Some(i) = BUCKETS.iter().position(|&(bound, _)| nanos <= bound) {
            self.buckets[i].fetch_add(1, Relaxed);
        }
        self.sum_ns.fetch_add(nanos, Relaxed);
        self.count.fetch_add(1, Relaxed);
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.count.load(Relaxed)
    }

    fn render(&self, name: &str, out: &mut String) {
        let mut cumulative = 0;
        for (bucket, &(_, le)) in self.buckets.iter().zip(BUCKETS.iter()) {
            cumulative += bucket.load(Relaxed);
            let _ = writeln!(out, "{name}_bucket{{le=\"{le}\"}} {cumulative}");
        }
        let total = self.count.load(Relaxed);
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {total}");
        let sum_secs = self.sum_ns.load(Relaxed) as f64 / 1e9;
        let _ = writeln!(out, "{name}_sum {sum_secs}");
        let _ = writeln!(out, "{name}_count {total}");
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

pub struct Metrics {
    pub feed_messages: AtomicU64,
    pub feed_tickers: AtomicU64,
    pub feed_unrecognized: AtomicU64,
    pub feed_errors: AtomicU64,
    pub reconnections: AtomicU64,
    pub broadcasts: AtomicU64,
    pub subscriber_evictions: AtomicU64,
    pub dropped_payloads: AtomicU64,

    pub feed_up: AtomicBool,
    pub subscribers: AtomicU64,
    pub cached_instruments: AtomicU64,
    start_time: Instant,

    pub frame_latency: LatencyHistogram,
    pub broadcast_latency: LatencyHistogram,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            feed_messages: AtomicU64::new(0),
            feed_tickers: AtomicU64::new(0),
            feed_unrecognized: AtomicU64::new(0),
            feed_errors: AtomicU64::new(0),
            reconnections: AtomicU64::new(0),
            broadcasts: AtomicU64::new(0),
            subscriber_evictions: AtomicU64::new(0),
            dropped_payloads: AtomicU64::new(0),
            feed_up: AtomicBool::new(false),
            subscribers: AtomicU64::new(0),
            cached_instruments: AtomicU64::new(0),
            start_time: Instant::now(),
            frame_latency: LatencyHistogram::default(),
            broadcast_latency: LatencyHistogram::default(),
        }
    }
}

fn counter(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} counter");
    let _ = writeln!(out, "{name} {value}");
}

fn gauge(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} gauge");
    let _ = writeln!(out, "{name} {value}");
}

impl Metrics {
    #[must_use]
    pub fn to_prometheus(&self) -> String {
        let mut out = String::with_capacity(4096);

        counter(&mut out, "relay_feed_messages_total", "Upstream WebSocket frames received", self.feed_messages.load(Relaxed));
        counter(&mut out, "relay_feed_tickers_total", "Ticker updates applied to the cache", self.feed_tickers.load(Relaxed));
        counter(&mut out, "relay_feed_unrecognized_total", "Upstream frames that could not be classified", self.feed_unrecognized.load(Relaxed));
        counter(&mut out, "relay_feed_errors_total", "Connection, handshake and directory failures", self.feed_errors.load(Relaxed));
        counter(&mut out, "relay_reconnections_total", "Reconnect attempts scheduled", self.reconnections.load(Relaxed));
        counter(&mut out, "relay_broadcasts_total", "Snapshot broadcast rounds", self.broadcasts.load(Relaxed));
        counter(&mut out, "relay_subscriber_evictions_total", "Subscribers removed after their connection closed", self.subscriber_evictions.load(Relaxed));
        counter(&mut out, "relay_dropped_payloads_total", "Payloads skipped for subscribers with a full queue", self.dropped_payloads.load(Relaxed));

        gauge(&mut out, "relay_feed_up", "Upstream feed subscribed (1) or not (0)", u64::from(self.feed_up.load(Relaxed)));
        gauge(&mut out, "relay_subscribers", "Registered downstream subscribers", self.subscribers.load(Relaxed));
        gauge(&mut out, "relay_cached_instruments", "Instrument pairs with a cached quote", self.cached_instruments.load(Relaxed));
        gauge(&mut out, "relay_uptime_seconds", "Seconds since process start", self.start_time.elapsed().as_secs());

        let _ = writeln!(out, "# HELP relay_frame_duration_seconds Upstream frame parse and cache update latency");
        let _ = writeln!(out, "# TYPE relay_frame_duration_seconds histogram");
        self.frame_latency.render("relay_frame_duration_seconds", &mut out);

        let _ = writeln!(out, "# HELP relay_broadcast_duration_seconds Snapshot, serialize and fan-out latency");
        let _ = writeln!(out, "# TYPE relay_broadcast_duration_seconds histogram");
        self.broadcast_latency.render("relay_broadcast_duration_seconds", &mut out);

        out
    }
}

// ---------------------------------------------------------------------------
// HTTP server
// ---------------------------------------------------------------------------

#[must_use]
pub fn router(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(prom_metrics))
        .with_state(metrics)
}

/// Serve `/health` and `/metrics` on a pre-bound listener until cancelled.
pub async fn serve_http(listener: TcpListener, metrics: Arc<Metrics>, cancel: CancellationToken) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "metrics/health HTTP server listening");
    }
    if let Err(e) = axum::serve(listener, router(metrics))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
    {
        error!(error = %e, "metrics server failed");
    }
}

async fn health(State(m): State<Arc<Metrics>>) -> (StatusCode, &'static str) {
    if m.feed_up.load(Relaxed) {
        (StatusCode::OK, "OK\n")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "DOWN\n")
    }
}

async fn prom_metrics(State(m): State<Arc<Metrics>>) -> String {
    m.to_prometheus()
}
