//! Live price feed runner
//!
//! Connects to the streaming price feed, falls back to polling the REST price
//! API while the stream is down, and logs updates for the configured screens.

mod screens;

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pricefeed_core::{ConnectionState, FeedConfig};
use pricefeed_services::{
    FallbackPoller, HttpPriceCache, PriceCache, PriceDistributor, SubscriptionManager,
    UpdateRouter,
};
use pricefeed_stream::{PushChannel, StreamTransport, WebSocketTransport, WebSocketTransportConfig};

/// How often the health snapshot is logged
const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// How often a failed push channel is given another chance
const PUSH_RECOVERY_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env.local file
    if let Err(e) = dotenvy::from_filename(".env.local") {
        // Not an error if the file doesn't exist
        if !matches!(e, dotenvy::Error::Io(_)) {
            eprintln!("Warning: Failed to load .env.local: {}", e);
        }
    }

    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,pricefeed=debug")),
        )
        .init();

    info!("Starting price feed");

    let config = FeedConfig::from_env()?;
    info!(
        "Stream: {}, price API: {}, poll every {:?}",
        config.stream_url,
        config.price_api_url,
        config.poller.interval()
    );

    // Push source
    let transport: Arc<dyn StreamTransport> = Arc::new(WebSocketTransport::new(
        WebSocketTransportConfig::new(&config.stream_url)?,
    ));
    let push = Arc::new(PushChannel::new(transport, &config.reconnect));

    // Poll source
    let cache: Arc<dyn PriceCache> = Arc::new(HttpPriceCache::new(
        &config.price_api_url,
        config.poller.cache_ttl(),
    )?);
    let poller = Arc::new(FallbackPoller::new(cache, &config.poller));

    let distributor = Arc::new(PriceDistributor::new(
        push,
        poller,
        Arc::new(SubscriptionManager::new()),
    ));
    let router = Arc::new(UpdateRouter::new(Arc::clone(&distributor)));

    // Log connection state changes
    let mut state_rx = router.connection_state();
    tokio::spawn(async move {
        while state_rx.changed().await.is_ok() {
            let state = *state_rx.borrow_and_update();
            info!("Connection state: {}", state);
        }
    });

    // One logging task per screen
    for screen in screens::from_env()? {
        let delta = router.subscribe_screen(&screen.name, &screen.assets)?;
        info!(
            "Screen {} watching {} asset(s), {} new upstream",
            screen.name,
            screen.assets.len(),
            delta.added.len()
        );

        let mut updates = router.updates_for(&screen.assets);
        let name = screen.name;
        tokio::spawn(async move {
            while let Some(update) = updates.next().await {
                info!(
                    "[{}] {} {} ({}%)",
                    name,
                    update.asset_id,
                    update.price,
                    update.change_percent().round_dp(2)
                );
            }
        });
    }

    // Periodic health snapshot
    let health_router = Arc::clone(&router);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEALTH_LOG_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match serde_json::to_string(&health_router.health()) {
                Ok(json) => info!("Health: {}", json),
                Err(e) => warn!("Failed to serialize health: {}", e),
            }
        }
    });

    let state = router.start().await;
    info!("Price feed started ({})", state);

    // While degraded, periodically retry the stream so polling can hand back
    let recovery_router = Arc::clone(&router);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PUSH_RECOVERY_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if recovery_router.health().connection_state == ConnectionState::Failed {
                info!("Retrying push channel");
                let state = recovery_router.start().await;
                info!("Push channel retry ended in {}", state);
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    router.stop();

    let health = distributor.health();
    info!(
        "Final counts: {} push update(s), {} poll update(s)",
        health.push_updates, health.poll_updates
    );

    Ok(())
}
