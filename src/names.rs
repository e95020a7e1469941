//! Display-name resolution for instrument base symbols.
//!
//! Lookup order: built-in table of well-known Kraken tickers, then the catalog
//! fetched once at startup, then the symbol itself.

use std::collections::HashMap;

use serde::Deserialize;
use tracing::{info, warn};

use crate::error::Result;

pub const COINGECKO_CATALOG_URL: &str = "https://api.coingecko.com/api/v3/coins/list";

/// Kraken uses its own tickers (`XBT`) that catalogs often map differently.
const FALLBACK_NAMES: [(&str, &str); 10] = [
    ("XBT", "Bitcoin"),
    ("ETH", "Ethereum"),
    ("XRP", "XRP"),
    ("LTC", "Litecoin"),
    ("BCH", "Bitcoin Cash"),
    ("ADA", "Cardano"),
    ("DOT", "Polkadot"),
    ("LINK", "Chainlink"),
    ("XLM", "Stellar"),
    ("DOGE", "Dogecoin"),
];

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    symbol: String,
    name: String,
}

#[derive(Debug, Clone)]
pub struct NameResolver {
    fallback: HashMap<&'static str, &'static str>,
    catalog: HashMap<String, String>,
}

impl Default for NameResolver {
    fn default() -> Self {
        Self::new(HashMap::new())
    }
}

impl NameResolver {
    /// `catalog` keys must already be upper-case.
    #[must_use]
    pub fn new(catalog: HashMap<String, String>) -> Self {
        Self {
            fallback: FALLBACK_NAMES.into_iter().collect(),
            catalog,
        }
    }

    #[must_use]
    pub fn resolve(&self, base: &str) -> String {
        let key = base.to_uppercase();
        if let Some(name) = self.fallback.get(key.as_str()) {
            return (*name).to_string();
        }
        if let Some(name) = self.catalog.get(&key) {
            return name.clone();
        }
        base.to_string()
    }

    /// Resolve the base symbol of a pair such as `XBT/USD`.
    #[must_use]
    pub fn resolve_pair(&self, pair: &str) -> String {
        let base = pair.split_once('/').map_or(pair, |(base, _)| base);
        self.resolve(base)
    }

    #[must_use]
    pub fn catalog_len(&self) -> usize {
        self.catalog.len()
    }
}

/// Decode a `[{symbol, name}, ...]` catalog body into an upper-cased lookup map.
/// Later entries for the same symbol replace earlier ones.
pub fn parse_catalog(body: &str) -> Result<HashMap<String, String>> {
    let entries: Vec<CatalogEntry> = serde_json::from_str(body)?;
    Ok(entries
        .into_iter()
        .map(|e| (e.symbol.to_uppercase(), e.name))
        .collect())
}

/// Single bounded attempt to download the catalog. Any failure yields an empty
/// catalog; the caller's client timeout bounds the wait.
pub async fn fetch_catalog(client: &reqwest::Client, url: &str) -> HashMap<String, String> {
    match try_fetch_catalog(client, url).await {
        Ok(catalog) => {
            info!(entries = catalog.len(), "asset name catalog loaded");
            catalog
        }
        Err(e) => {
            warn!(error = %e, "asset name catalog unavailable, using fallback names only");
            HashMap::new()
        }
    }
}

async fn try_fetch_catalog(client: &reqwest::Client, url: &str) -> Result<HashMap<String, String>> {
    let body = client
        .get(url)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;
    parse_catalog(&body)
}
