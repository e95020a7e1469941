//! Core domain types for the ticker pipeline.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Maximum number of instruments in a broadcast snapshot.
pub const TOP_N: usize = 20;

/// Latest observed ask price for one instrument pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentQuote {
    /// Pair identifier, e.g. `XBT/USD`. Unique key in the cache.
    pub pair: String,
    /// Display name resolved from the pair's base symbol.
    pub name: String,
    /// Ask price. Never negative.
    pub price: Decimal,
}

/// Point-in-time ranking of cached quotes, highest price first.
///
/// Serializes as a bare JSON array, which is the downstream wire format.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot(pub Vec<InstrumentQuote>);

impl Snapshot {
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &InstrumentQuote> {
        self.0.iter()
    }
}

/// Lifecycle of the upstream feed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Subscribed,
    /// Deliberate shutdown. Terminal: no reconnect is scheduled from here.
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Subscribed => "subscribed",
            Self::Closing => "closing",
        };
        f.write_str(s)
    }
}
