use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use ticker_relay::cache::InstrumentCache;
use ticker_relay::config::Config;
use ticker_relay::feed::FeedConnection;
use ticker_relay::feed::directory::KrakenDirectory;
use ticker_relay::hub::SubscriberHub;
use ticker_relay::metrics::{self, Metrics};
use ticker_relay::names::{self, NameResolver};
use ticker_relay::orchestrator::Orchestrator;
use ticker_relay::server::{self, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    info!(
        port = config.port,
        metrics_port = config.metrics_port,
        feed = %config.feed_url,
        quote_suffix = %config.quote_suffix,
        "starting ticker relay"
    );

    // Bind both listeners before touching the network so a taken port fails fast.
    let ws_listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    let metrics_listener = TcpListener::bind(("0.0.0.0", config.metrics_port)).await?;

    let cancel = CancellationToken::new();
    let metrics = Arc::new(Metrics::default());
    let http = reqwest::Client::builder()
        .timeout(config.http_timeout())
        .build()?;

    let catalog = if config.no_catalog {
        Default::default()
    } else {
        names::fetch_catalog(&http, &config.catalog_url).await
    };
    let names = Arc::new(NameResolver::new(catalog));
    info!(catalog = names.catalog_len(), "name resolver ready");

    let cache = Arc::new(InstrumentCache::new());
    let hub = Arc::new(SubscriberHub::new(config.subscriber_buffer));

    // Feed -> orchestrator: a sequence number bumped after every cache write.
    let (updates_tx, updates_rx) = watch::channel(0u64);

    let orchestrator = Arc::new(Orchestrator::new(cache.clone(), hub.clone(), metrics.clone()));
    let orchestrator_handle = tokio::spawn(orchestrator.clone().run(updates_rx, cancel.clone()));

    let directory = KrakenDirectory::new(http, config.pairs_url.clone(), config.quote_suffix.clone());
    let feed = FeedConnection::new(
        config.feed_settings(),
        directory,
        cache,
        names,
        updates_tx,
        metrics.clone(),
    );
    let feed_handle = tokio::spawn(feed.run(cancel.clone()));

    let http_handle = tokio::spawn(metrics::serve_http(metrics_listener, metrics.clone(), cancel.clone()));

    // Shutdown signal handler (SIGINT + SIGTERM).
    let shutdown_cancel = cancel.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("received shutdown signal, draining");
        shutdown_cancel.cancel();
    });

    let state = AppState { hub, orchestrator, metrics };
    if let Err(e) = server::serve(ws_listener, state, cancel.clone()).await {
        error!(error = %e, "subscriber server failed");
        cancel.cancel();
    }

    let _ = tokio::join!(feed_handle, orchestrator_handle, http_handle);

    info!("shutdown complete");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = sigterm.recv() => {},
                }
                return;
            }
            Err(e) => warn!(error = %e, "SIGTERM handler unavailable, ctrl+c only"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for ctrl+c");
        std::future::pending::<()>().await;
    }
}
