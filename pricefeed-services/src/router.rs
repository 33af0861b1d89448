//! Update router
//!
//! Entry point for screens: records per-screen interest, forwards only the
//! ids that actually change the upstream set and hands each screen a
//! filtered view of the merged update stream.

use std::collections::HashSet;
use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

use pricefeed_core::{AssetId, ConnectionState, FeedError, FeedResult, PriceUpdate};

use crate::distributor::{DistributorHealth, PriceDistributor};
use crate::subscription::{SubscriptionDelta, SubscriptionManager};

/// Routes screen subscriptions to the distributor
pub struct UpdateRouter {
    distributor: Arc<PriceDistributor>,
    subscriptions: Arc<SubscriptionManager>,
    /// Serializes interest changes with their forwarding
    forwarding: Mutex<()>,
}

impl UpdateRouter {
    pub fn new(distributor: Arc<PriceDistributor>) -> Self {
        let subscriptions = Arc::clone(distributor.subscriptions());
        Self {
            distributor,
            subscriptions,
            forwarding: Mutex::new(()),
        }
    }

    /// Connect the distributor
    ///
    /// A no-op while connecting, connected or reconnecting. From FAILED or
    /// DISCONNECTED this starts a fresh attempt chain.
    pub async fn start(&self) -> ConnectionState {
        let current = self.distributor.health().connection_state;
        if !current.accepts_connect() {
            debug!("[UpdateRouter] Already started ({})", current);
            return current;
        }

        info!("[UpdateRouter] Starting from {}", current);
        self.distributor.connect().await
    }

    /// Replace `screen`'s interest set with `asset_ids`
    ///
    /// Only ids that join the union are subscribed upstream, and only ids
    /// that leave it are unsubscribed.
    pub fn subscribe_screen(
        &self,
        screen: &str,
        asset_ids: &[AssetId],
    ) -> FeedResult<SubscriptionDelta> {
        let screen = validate_screen(screen)?;
        let assets = asset_ids
            .iter()
            .map(|id| AssetId::parse(id.as_str()))
            .collect::<FeedResult<Vec<_>>>()?;

        let _guard = self.forwarding.lock();
        let delta = self.subscriptions.subscribe(screen, assets);
        self.forward(&delta);

        debug!(
            "[UpdateRouter] Screen {} subscribed (+{} -{})",
            screen,
            delta.added.len(),
            delta.removed.len()
        );
        Ok(delta)
    }

    /// Drop every interest `screen` holds
    pub fn unsubscribe_screen(&self, screen: &str) -> FeedResult<SubscriptionDelta> {
        let screen = validate_screen(screen)?;

        let _guard = self.forwarding.lock();
        let delta = self.subscriptions.unsubscribe(screen);
        self.forward(&delta);

        debug!(
            "[UpdateRouter] Screen {} unsubscribed (-{})",
            screen,
            delta.removed.len()
        );
        Ok(delta)
    }

    fn forward(&self, delta: &SubscriptionDelta) {
        if !delta.added.is_empty() {
            self.distributor.subscribe(&delta.added_ids());
        }
        if !delta.removed.is_empty() {
            self.distributor.unsubscribe(&delta.removed_ids());
        }
    }

    /// Updates for any of `asset_ids`
    ///
    /// Only updates published after this call are seen. A slow reader skips
    /// what it missed rather than ending the stream.
    pub fn updates_for(&self, asset_ids: &[AssetId]) -> BoxStream<'static, PriceUpdate> {
        let wanted: HashSet<AssetId> = asset_ids.iter().cloned().collect();

        BroadcastStream::new(self.distributor.price_updates())
            .filter_map(move |item| {
                let update = match item {
                    Ok(update) if wanted.contains(&update.asset_id) => Some(update),
                    Ok(_) => None,
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!("[UpdateRouter] Subscriber lagged, skipped {} update(s)", skipped);
                        None
                    }
                };
                futures::future::ready(update)
            })
            .boxed()
    }

    pub fn updates_for_asset(&self, asset_id: &AssetId) -> BoxStream<'static, PriceUpdate> {
        self.updates_for(std::slice::from_ref(asset_id))
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.distributor.connection_state()
    }

    pub fn health(&self) -> DistributorHealth {
        self.distributor.health()
    }

    /// Disconnect everything; screens keep their interest sets
    pub fn stop(&self) {
        let _guard = self.forwarding.lock();
        self.distributor.disconnect();
        info!("[UpdateRouter] Stopped");
    }
}

fn validate_screen(screen: &str) -> FeedResult<&str> {
    let trimmed = screen.trim();
    if trimmed.is_empty() {
        return Err(FeedError::invalid_consumer(screen));
    }
    Ok(trimmed)
}

impl std::fmt::Debug for UpdateRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateRouter")
            .field("screens", &self.subscriptions.consumer_count())
            .field("distributor", &self.distributor)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poller::FallbackPoller;
    use crate::price_cache::{InMemoryPriceCache, PriceCache};
    use pricefeed_core::{asset_ids, ReconnectConfig};
    use pricefeed_stream::mock::MockTransport;
    use pricefeed_stream::{PushChannel, StreamCommand};
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn router(transport: &MockTransport) -> UpdateRouter {
        let config = ReconnectConfig {
            jitter_ratio: 0.0,
            ..ReconnectConfig::default()
        };
        let push = Arc::new(PushChannel::new(Arc::new(transport.clone()), &config));
        let cache: Arc<dyn PriceCache> = Arc::new(InMemoryPriceCache::default());
        let poller = Arc::new(FallbackPoller::with_interval(cache, Duration::from_secs(30)));
        let distributor = Arc::new(PriceDistributor::new(
            push,
            poller,
            Arc::new(SubscriptionManager::new()),
        ));
        UpdateRouter::new(distributor)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejects_invalid_input() {
        let router = router(&MockTransport::new());

        assert_eq!(
            router.subscribe_screen("  ", &asset_ids(["BTC"])),
            Err(FeedError::invalid_consumer("  "))
        );
        assert!(matches!(
            router.subscribe_screen("list", &asset_ids(["BTC", " "])),
            Err(FeedError::InvalidAsset(_))
        ));
        assert!(matches!(
            router.unsubscribe_screen(""),
            Err(FeedError::InvalidConsumer(_))
        ));

        // Nothing reached the subscription state
        assert!(router.subscriptions.effective_upstream_set().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent() {
        let transport = MockTransport::new();
        let router = router(&transport);

        assert_eq!(router.start().await, ConnectionState::Connected);
        assert_eq!(router.start().await, ConnectionState::Connected);
        assert_eq!(transport.opens(), 1);

        router.stop();
        assert_eq!(*router.connection_state().borrow(), ConnectionState::Disconnected);

        // Startable again after stop
        assert_eq!(router.start().await, ConnectionState::Connected);
        assert_eq!(transport.opens(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_asset_is_subscribed_once() {
        let transport = MockTransport::new();
        let router = router(&transport);
        router.start().await;

        router.subscribe_screen("list", &asset_ids(["BTC", "ETH"])).unwrap();
        let delta = router.subscribe_screen("detail", &asset_ids(["BTC"])).unwrap();
        assert!(delta.is_empty());
        settle().await;

        assert_eq!(transport.subscribe_count(&AssetId::from("BTC")), 1);
        assert_eq!(
            transport.commands(),
            vec![StreamCommand::Subscribe(asset_ids(["BTC", "ETH"]))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribe_forwards_both_directions() {
        let transport = MockTransport::new();
        let router = router(&transport);
        router.start().await;

        router.subscribe_screen("list", &asset_ids(["BTC", "ETH"])).unwrap();
        router.subscribe_screen("list", &asset_ids(["ETH", "SOL"])).unwrap();
        settle().await;

        assert_eq!(
            transport.commands(),
            vec![
                StreamCommand::Subscribe(asset_ids(["BTC", "ETH"])),
                StreamCommand::Subscribe(asset_ids(["SOL"])),
                StreamCommand::Unsubscribe(asset_ids(["BTC"])),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_screen_ids_are_trimmed() {
        let router = router(&MockTransport::new());

        router.subscribe_screen(" list ", &asset_ids(["BTC"])).unwrap();
        let delta = router.unsubscribe_screen("list").unwrap();
        assert_eq!(delta.removed_ids(), asset_ids(["BTC"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_updates_for_filters_by_asset() {
        let transport = MockTransport::new();
        let router = router(&transport);
        router.start().await;
        router.subscribe_screen("list", &asset_ids(["BTC", "ETH"])).unwrap();
        settle().await;

        let mut btc = router.updates_for_asset(&AssetId::from("BTC"));
        let mut both = router.updates_for(&asset_ids(["BTC", "ETH"]));

        transport.emit_price("ETH", dec!(10)).await;
        transport.emit_price("BTC", dec!(100)).await;
        settle().await;

        let first = btc.next().await.unwrap();
        assert_eq!(first.asset_id, AssetId::from("BTC"));
        assert_eq!(first.price, dec!(100));

        assert_eq!(both.next().await.unwrap().asset_id, AssetId::from("ETH"));
        assert_eq!(both.next().await.unwrap().asset_id, AssetId::from("BTC"));
    }
}
