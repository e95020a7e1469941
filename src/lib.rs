//! Ticker relay library.
//!
//! Subscribes to Kraken's public ticker feed for every USD pair, keeps the
//! latest ask per pair, and pushes the top-20 instruments by price to
//! WebSocket subscribers after every update.

pub mod cache;
pub mod config;
pub mod error;
pub mod feed;
pub mod hub;
pub mod metrics;
pub mod names;
pub mod orchestrator;
pub mod server;
pub mod types;

#[cfg(test)]
pub(crate) mod testutil;
