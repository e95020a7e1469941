//! Latest quote per instrument pair, with a ranked snapshot view.
//!
//! Backed by a sharded [`DashMap`]: writers lock one shard, readers copy entries
//! out shard by shard and sort after every lock is released. Ranking is price
//! descending; equal prices keep first-insertion order so repeated snapshots of
//! the same state are identical.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rust_decimal::Decimal;
use tracing::warn;

use crate::types::{InstrumentQuote, Snapshot};

#[derive(Debug, Clone)]
struct Slot {
    quote: InstrumentQuote,
    /// First-insertion sequence. Kept across overwrites.
    seq: u64,
}

#[derive(Debug, Default)]
pub struct InstrumentCache {
    entries: DashMap<String, Slot>,
    next_seq: AtomicU64,
}

impl InstrumentCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the quote for `quote.pair`. Returns `false` (and
    /// leaves the cache untouched) for a negative price.
    pub fn upsert(&self, quote: InstrumentQuote) -> bool {
        if quote.price < Decimal::ZERO {
            warn!(pair = %quote.pair, price = %quote.price, "rejecting negative price");
            return false;
        }
        match self.entries.entry(quote.pair.clone()) {
            Entry::Occupied(mut slot) => slot.get_mut().quote = quote,
            Entry::Vacant(slot) => {
                let seq = self.next_seq.fetch_add(1, Relaxed);
                slot.insert(Slot { quote, seq });
            }
        }
        true
    }

    #[must_use]
    pub fn get(&self, pair: &str) -> Option<InstrumentQuote> {
        self.entries.get(pair).map(|slot| slot.quote.clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Up to `limit` quotes, highest price first.
    #[must_use]
    pub fn snapshot(&self, limit: usize) -> Snapshot {
        if limit == 0 {
            return Snapshot::default();
        }
        let mut slots: Vec<Slot> = self.entries.iter().map(|e| e.value().clone()).collect();
        slots.sort_by(rank);
        slots.truncate(limit);
        Snapshot(slots.into_iter().map(|s| s.quote).collect())
    }
}

fn rank(a: &Slot, b: &Slot) -> Ordering {
    b.quote.price.cmp(&a.quote.price).then(a.seq.cmp(&b.seq))
}
