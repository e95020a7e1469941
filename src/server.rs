//! Downstream WebSocket endpoint.
//!
//! Every connection gets a hub queue and the current snapshot right away,
//! attached atomically with respect to broadcast rounds, then each broadcast as
//! a text frame. The connection task unregisters itself when
//! the client goes away or its queue is evicted.

use std::sync::Arc;
use std::sync::atomic::Ordering::Relaxed;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::hub::SubscriberHub;
use crate::metrics::Metrics;
use crate::orchestrator::Orchestrator;

/// Path the browser client connects to.
pub const LIVE_PATH: &str = "/api/crypto/live";

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<SubscriberHub>,
    pub orchestrator: Arc<Orchestrator>,
    pub metrics: Arc<Metrics>,
}

#[must_use]
pub fn router(state: AppState) -> Router {
    Router::new().route(LIVE_PATH, get(live)).with_state(state)
}

/// Serve the live endpoint on a pre-bound listener until cancelled.
pub async fn serve(listener: TcpListener, state: AppState, cancel: CancellationToken) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, path = LIVE_PATH, "subscriber WebSocket server listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

async fn live(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| serve_subscriber(socket, state))
}

async fn serve_subscriber(socket: WebSocket, state: AppState) {
    let (id, mut queue, initial) = state.orchestrator.attach();
    state.metrics.subscribers.store(state.hub.len() as u64, Relaxed);
    debug!(subscriber = id, "subscriber connected");
    let (mut sink, mut stream) = socket.split();

    match initial {
        Ok(initial) => {
            if sink.send(Message::Text(initial.to_string())).await.is_err() {
                disconnect(&state, id);
                return;
            }
        }
        Err(e) => error!(subscriber = id, error = %e, "initial snapshot failed"),
    }

    loop {
        tokio::select! {
            payload = queue.recv() => {
                // `None`: the hub evicted this queue.
                let Some(payload) = payload else { break };
                if let Err(e) = sink.send(Message::Text(payload.to_string())).await {
                    debug!(subscriber = id, error = %e, "send failed");
                    break;
                }
            }
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(subscriber = id, error = %e, "subscriber socket error");
                    break;
                }
            },
        }
    }

    disconnect(&state, id);
}

fn disconnect(state: &AppState, id: u64) {
    state.hub.unregister(id);
    state.metrics.subscribers.store(state.hub.len() as u64, Relaxed);
    debug!(subscriber = id, "subscriber disconnected");
}
