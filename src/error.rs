//! Unified error types for the ticker relay.
//!
//! Only connection and lookup failures are represented here. Malformed feed
//! frames never become errors (see [`crate::feed::parser`]) and a broken
//! downstream connection is handled inside the hub.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("WebSocket handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    #[error("no upstream frame for {0:?}")]
    IdleTimeout(Duration),

    #[error("HTTP lookup failed: {0}")]
    Lookup(#[from] reqwest::Error),

    #[error("pair directory returned errors: {0}")]
    Directory(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
