//! CLI configuration via clap. Every flag can also come from the environment.

use std::time::Duration;

use clap::Parser;

use crate::feed::directory::KRAKEN_PAIRS_URL;
use crate::feed::{FeedSettings, KRAKEN_WS_URL};
use crate::names::COINGECKO_CATALOG_URL;

#[derive(Parser, Debug, Clone)]
#[command(name = "ticker-relay")]
#[command(about = "Relays the top Kraken instruments by ask price to WebSocket subscribers")]
pub struct Config {
    /// Subscriber WebSocket port
    #[arg(short, long, env = "RELAY_PORT", default_value = "8080")]
    pub port: u16,

    /// Metrics/health HTTP port
    #[arg(long, env = "RELAY_METRICS_PORT", default_value = "9090")]
    pub metrics_port: u16,

    /// Upstream ticker WebSocket URL
    #[arg(long, env = "RELAY_FEED_URL", default_value = KRAKEN_WS_URL)]
    pub feed_url: String,

    /// Instrument-pairs directory URL
    #[arg(long, env = "RELAY_PAIRS_URL", default_value = KRAKEN_PAIRS_URL)]
    pub pairs_url: String,

    /// Asset name catalog URL
    #[arg(long, env = "RELAY_CATALOG_URL", default_value = COINGECKO_CATALOG_URL)]
    pub catalog_url: String,

    /// Skip the catalog fetch and use built-in names only
    #[arg(long, env = "RELAY_NO_CATALOG")]
    pub no_catalog: bool,

    /// Only subscribe to pairs whose name ends with this suffix
    #[arg(long, env = "RELAY_QUOTE_SUFFIX", default_value = "/USD")]
    pub quote_suffix: String,

    /// Seconds to wait before reconnecting to the feed
    #[arg(long, env = "RELAY_RECONNECT_DELAY_SECS", default_value = "5")]
    pub reconnect_delay_secs: u64,

    /// Feed handshake timeout in seconds
    #[arg(long, env = "RELAY_HANDSHAKE_TIMEOUT_SECS", default_value = "10")]
    pub handshake_timeout_secs: u64,

    /// Seconds without an upstream frame before a subscribed connection is dropped
    #[arg(long, env = "RELAY_IDLE_TIMEOUT_SECS", default_value = "10")]
    pub idle_timeout_secs: u64,

    /// Timeout for directory and catalog HTTP requests, in seconds
    #[arg(long, env = "RELAY_HTTP_TIMEOUT_SECS", default_value = "10")]
    pub http_timeout_secs: u64,

    /// Queued snapshots per subscriber before rounds are skipped
    #[arg(long, env = "RELAY_SUBSCRIBER_BUFFER", default_value = "32")]
    pub subscriber_buffer: usize,
}

impl Config {
    #[must_use]
    pub fn feed_settings(&self) -> FeedSettings {
        FeedSettings {
            url: self.feed_url.clone(),
            reconnect_delay: Duration::from_secs(self.reconnect_delay_secs),
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
        }
    }

    #[must_use]
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}
