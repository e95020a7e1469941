//! Turns cache updates into subscriber broadcasts.
//!
//! The feed bumps a `watch` sequence after every cache write; this task wakes
//! on each change, ranks the cache, serializes the top [`TOP_N`] once and hands
//! the shared payload to the hub. A burst of ticks that arrives while a round is
//! in flight collapses into the next round, which always reflects the latest
//! state.
//!
//! Rounds and subscriber attachment share one lock: a new subscriber's initial
//! snapshot is never older than any payload later found in its queue.

use std::sync::Arc;
use std::sync::atomic::Ordering::Relaxed;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::cache::InstrumentCache;
use crate::error::Result;
use crate::hub::{BroadcastReport, Payload, SubscriberHub, SubscriberId};
use crate::metrics::Metrics;
use crate::types::TOP_N;

pub struct Orchestrator {
    cache: Arc<InstrumentCache>,
    hub: Arc<SubscriberHub>,
    metrics: Arc<Metrics>,
    round: Mutex<()>,
}

impl Orchestrator {
    #[must_use]
    pub fn new(cache: Arc<InstrumentCache>, hub: Arc<SubscriberHub>, metrics: Arc<Metrics>) -> Self {
        Self {
            cache,
            hub,
            metrics,
            round: Mutex::new(()),
        }
    }

    /// Register a subscriber and build its initial snapshot with no broadcast
    /// round in between.
    pub fn attach(&self) -> (SubscriberId, mpsc::Receiver<Payload>, Result<Payload>) {
        let _round = self.round.lock();
        let (id, queue) = self.hub.subscribe();
        (id, queue, self.payload())
    }

    /// Current top-[`TOP_N`] snapshot as a JSON array.
    pub fn payload(&self) -> Result<Payload> {
        let snapshot = self.cache.snapshot(TOP_N);
        Ok(Arc::from(serde_json::to_string(&snapshot)?))
    }

    /// One broadcast round. Skips serialization when nobody is listening.
    pub fn publish(&self) -> Result<BroadcastReport> {
        let _round = self.round.lock();
        if self.hub.is_empty() {
            return Ok(BroadcastReport::default());
        }
        let t0 = Instant::now();
        let payload = self.payload()?;
        let report = self.hub.broadcast(&payload);
        self.metrics.broadcast_latency.record(t0.elapsed());

        self.metrics.broadcasts.fetch_add(1, Relaxed);
        self.metrics
            .dropped_payloads
            .fetch_add(report.dropped as u64, Relaxed);
        self.metrics
            .subscriber_evictions
            .fetch_add(report.evicted as u64, Relaxed);
        self.metrics.subscribers.store(self.hub.len() as u64, Relaxed);
        debug!(
            delivered = report.delivered,
            dropped = report.dropped,
            evicted = report.evicted,
            "broadcast"
        );
        Ok(report)
    }

    /// Publish on every update until cancelled or the feed drops its sender.
    pub async fn run(self: Arc<Self>, mut updates: watch::Receiver<u64>, cancel: CancellationToken) {
        info!("orchestrator started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("orchestrator cancelled");
                    break;
                }
                changed = updates.changed() => {
                    if changed.is_err() {
                        info!("update source dropped, orchestrator exiting");
                        break;
                    }
                    if let Err(e) = self.publish() {
                        error!(error = %e, "snapshot serialization failed");
                    }
                }
            }
        }
    }
}
