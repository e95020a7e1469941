//! Instrument-pairs directory lookup and the subscription it produces.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;

use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::error::{Error, Result};

pub const KRAKEN_PAIRS_URL: &str = "https://api.kraken.com/0/public/AssetPairs";

/// Source of the pairs to subscribe to on each new connection.
pub trait PairDirectory: Send + Sync + 'static {
    /// Fetch the tradable pairs, already filtered to the wanted quote currency.
    fn fetch_pairs(&self) -> impl Future<Output = Result<SubscriptionRequest>> + Send;
}

/// Ordered, de-duplicated set of pair identifiers sent upstream once per connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionRequest {
    pairs: Vec<String>,
}

impl SubscriptionRequest {
    pub fn new<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set: BTreeSet<String> = pairs.into_iter().map(Into::into).collect();
        Self {
            pairs: set.into_iter().collect(),
        }
    }

    #[must_use]
    pub fn pairs(&self) -> &[String] {
        &self.pairs
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Kraken ticker subscribe frame.
    #[must_use]
    pub fn to_frame(&self) -> String {
        json!({
            "event": "subscribe",
            "subscription": { "name": "ticker" },
            "pair": &self.pairs,
        })
        .to_string()
    }
}

/// `AssetPairs` response. Unknown fields in each entry are ignored.
#[derive(Debug, Deserialize)]
struct AssetPairsResponse {
    #[serde(default)]
    error: Vec<String>,
    #[serde(default)]
    result: BTreeMap<String, PairInfo>,
}

#[derive(Debug, Deserialize)]
struct PairInfo {
    #[serde(default)]
    wsname: Option<String>,
}

/// Decode an `AssetPairs` body and keep pairs whose `wsname` ends with `quote_suffix`.
pub fn filter_pairs(body: &str, quote_suffix: &str) -> Result<SubscriptionRequest> {
    let response: AssetPairsResponse = serde_json::from_str(body)?;
    if !response.error.is_empty() {
        return Err(Error::Directory(response.error.join("; ")));
    }
    let total = response.result.len();
    let request = SubscriptionRequest::new(
        response
            .result
            .into_values()
            .filter_map(|info| info.wsname)
            .filter(|name| !name.is_empty() && name.ends_with(quote_suffix)),
    );
    debug!(total, kept = request.pairs.len(), quote_suffix, "filtered pair directory");
    Ok(request)
}

/// Kraken REST `AssetPairs` directory.
pub struct KrakenDirectory {
    client: reqwest::Client,
    url: String,
    quote_suffix: String,
}

impl KrakenDirectory {
    pub fn new(client: reqwest::Client, url: impl Into<String>, quote_suffix: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            quote_suffix: quote_suffix.into(),
        }
    }
}

impl PairDirectory for KrakenDirectory {
    async fn fetch_pairs(&self) -> Result<SubscriptionRequest> {
        let body = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        filter_pairs(&body, &self.quote_suffix)
    }
}
