//! Registry of downstream subscribers and snapshot fan-out.
//!
//! Each subscriber is a bounded `mpsc` queue drained by its own connection task.
//! `broadcast` copies the registry under a short read lock, releases it, then
//! `try_send`s to every copy: a closed queue is removed afterwards, a full queue
//! just misses this round. Ids are never reused, so removing by id cannot evict
//! a connection registered after the copy was taken.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info};

/// Serialized snapshot shared by every subscriber queue.
pub type Payload = Arc<str>;

pub type SubscriberId = u64;

/// Per-round delivery counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Queue full: payload skipped for that subscriber, subscriber kept.
    pub dropped: usize,
    /// Queue closed: subscriber removed from the registry.
    pub evicted: usize,
}

pub struct SubscriberHub {
    subscribers: RwLock<HashMap<SubscriberId, mpsc::Sender<Payload>>>,
    next_id: AtomicU64,
    buffer: usize,
}

impl SubscriberHub {
    /// `buffer` is the per-subscriber queue depth used by [`Self::subscribe`].
    #[must_use]
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
        }
    }

    /// Register an existing connection queue.
    pub fn register(&self, conn: mpsc::Sender<Payload>) -> SubscriberId {
        let id = self.next_id.fetch_add(1, Relaxed);
        let total = {
            let mut subscribers = self.subscribers.write();
            subscribers.insert(id, conn);
            subscribers.len()
        };
        info!(subscriber = id, total, "subscriber registered");
        id
    }

    /// Create a queue, register its sending half and hand back the receiver.
    pub fn subscribe(&self) -> (SubscriberId, mpsc::Receiver<Payload>) {
        let (tx, rx) = mpsc::channel(self.buffer);
        (self.register(tx), rx)
    }

    /// Remove a subscriber. Returns `false` if it was already gone.
    pub fn unregister(&self, id: SubscriberId) -> bool {
        let removed = self.subscribers.write().remove(&id).is_some();
        if removed {
            info!(subscriber = id, "subscriber unregistered");
        }
        removed
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribers.read().is_empty()
    }

    #[must_use]
    pub fn contains(&self, id: SubscriberId) -> bool {
        self.subscribers.read().contains_key(&id)
    }

    /// Send `payload` to every subscriber registered when the call starts.
    pub fn broadcast(&self, payload: &Payload) -> BroadcastReport {
        let targets: Vec<(SubscriberId, mpsc::Sender<Payload>)> = self
            .subscribers
            .read()
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();

        let mut report = BroadcastReport::default();
        let mut closed = Vec::new();
        for (id, tx) in targets {
            match tx.try_send(Arc::clone(payload)) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    debug!(subscriber = id, "subscriber queue full, skipping round");
                    report.dropped += 1;
                }
                Err(TrySendError::Closed(_)) => closed.push(id),
            }
        }

        if !closed.is_empty() {
            let mut subscribers = self.subscribers.write();
            for id in &closed {
                if subscribers.remove(id).is_some() {
                    report.evicted += 1;
                    info!(subscriber = id, "subscriber connection closed, evicted");
                }
            }
        }
        report
    }
}
