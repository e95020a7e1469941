//! Shared test fixtures and helpers.

use std::str::FromStr;

use rust_decimal::Decimal;

use crate::types::InstrumentQuote;

/// Quote named after its base symbol, e.g. `quote("XBT/USD", "97250.1")`.
pub(crate) fn quote(pair: &str, price: &str) -> InstrumentQuote {
    let base = pair.split('/').next().unwrap_or(pair);
    InstrumentQuote {
        pair: pair.to_string(),
        name: base.to_string(),
        price: Decimal::from_str(price).unwrap(),
    }
}

// ---------------------------------------------------------------------------
// Wire fixtures
// ---------------------------------------------------------------------------

/// Kraken v1 ticker update, compact as received.
pub(crate) const TICKER_XBT_JSON: &str = r#"[340,{"a":["97250.1","1","1.000"],"b":["97250.0","3","3.000"],"c":["97250.1","0.0010"],"v":["1020.5","2041.1"],"p":["97012.3","96988.0"],"t":[12000,24000],"l":["96500.0","96400.0"],"h":["97400.0","97500.0"],"o":["96800.0","96700.0"]},"ticker","XBT/USD"]"#;

pub(crate) const SUBSCRIPTION_STATUS_JSON: &str = r#"{"channelID":340,"channelName":"ticker","event":"subscriptionStatus","pair":"XBT/USD","status":"subscribed","subscription":{"name":"ticker"}}"#;

pub(crate) const HEARTBEAT_JSON: &str = r#"{"event":"heartbeat"}"#;

/// Trimmed `AssetPairs` response: one USD pair, one EUR pair.
pub(crate) const ASSET_PAIRS_JSON: &str = r#"{"error":[],"result":{"XXBTZUSD":{"altname":"XBTUSD","wsname":"XBT/USD","base":"XXBT","quote":"ZUSD"},"XETHZEUR":{"altname":"ETHEUR","wsname":"ETH/EUR","base":"XETH","quote":"ZEUR"}}}"#;
