//! Fallback poller
//!
//! Periodically pulls prices for a set of assets from a `PriceCache` and turns
//! them into `PriceUpdate`s while the push channel is unavailable.
//!
//! Ticks run on a monotonic `interval` with `MissedTickBehavior::Skip`. The
//! fetch runs inside the tick loop, so ticks never overlap; a fetch slower
//! than the interval skips the ticks it missed instead of queueing them.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use pricefeed_core::{now_millis, AssetId, PollerConfig, PriceUpdate};
use pricefeed_stream::PRICE_UPDATE_BUFFER;

use crate::price_cache::PriceCache;

/// Counters describing poller activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PollerStats {
    /// Times a poll timer was started
    pub starts: u64,
    /// Times a running poll timer was cancelled
    pub stops: u64,
    pub ticks: u64,
    /// Ticks served from last-known prices after a failed or stale fetch
    pub degraded_ticks: u64,
    pub updates_emitted: u64,
}

/// Periodic price poller used as the fallback source
pub struct FallbackPoller {
    core: Arc<PollerCore>,
}

struct PollerCore {
    cache: Arc<dyn PriceCache>,
    interval: Duration,
    update_tx: broadcast::Sender<PriceUpdate>,
    state: Mutex<PollerState>,
    starts: AtomicU64,
    stops: AtomicU64,
    ticks: AtomicU64,
    degraded_ticks: AtomicU64,
    updates_emitted: AtomicU64,
}

#[derive(Default)]
struct PollerState {
    generation: u64,
    assets: BTreeSet<AssetId>,
    /// Last observed price per polled asset
    last_known: HashMap<AssetId, Decimal>,
    task: Option<JoinHandle<()>>,
}

impl FallbackPoller {
    pub fn new(cache: Arc<dyn PriceCache>, config: &PollerConfig) -> Self {
        Self::with_interval(cache, config.interval())
    }

    pub fn with_interval(cache: Arc<dyn PriceCache>, interval: Duration) -> Self {
        let (update_tx, _) = broadcast::channel(PRICE_UPDATE_BUFFER);
        Self {
            core: Arc::new(PollerCore {
                cache,
                interval: interval.max(Duration::from_millis(1)),
                update_tx,
                state: Mutex::new(PollerState::default()),
                starts: AtomicU64::new(0),
                stops: AtomicU64::new(0),
                ticks: AtomicU64::new(0),
                degraded_ticks: AtomicU64::new(0),
                updates_emitted: AtomicU64::new(0),
            }),
        }
    }

    /// Start polling `asset_ids`
    ///
    /// The first tick fires immediately. While already polling this only
    /// replaces the polled set; an empty set stops polling.
    pub fn start_polling<I>(&self, asset_ids: I)
    where
        I: IntoIterator<Item = AssetId>,
    {
        let assets: BTreeSet<AssetId> = asset_ids.into_iter().collect();
        if assets.is_empty() {
            self.stop_polling();
            return;
        }

        let mut state = self.core.state.lock();
        replace_assets(&mut state, assets);

        if state.task.is_some() {
            debug!(
                "[FallbackPoller] Already polling, now tracking {} asset(s)",
                state.assets.len()
            );
            return;
        }

        state.generation += 1;
        let generation = state.generation;
        let core = Arc::clone(&self.core);
        state.task = Some(tokio::spawn(core.run(generation)));
        self.core.starts.fetch_add(1, Ordering::SeqCst);

        info!(
            "[FallbackPoller] Polling {} asset(s) every {:?}",
            state.assets.len(),
            self.core.interval
        );
    }

    /// Replace the polled set without restarting the timer
    ///
    /// An empty set stops polling. Does nothing while stopped.
    pub fn update_subscriptions<I>(&self, asset_ids: I)
    where
        I: IntoIterator<Item = AssetId>,
    {
        let assets: BTreeSet<AssetId> = asset_ids.into_iter().collect();
        if assets.is_empty() {
            self.stop_polling();
            return;
        }

        let mut state = self.core.state.lock();
        if state.task.is_none() {
            debug!("[FallbackPoller] Not polling, ignoring subscription update");
            return;
        }
        replace_assets(&mut state, assets);
        debug!(
            "[FallbackPoller] Now tracking {} asset(s)",
            state.assets.len()
        );
    }

    /// Cancel the timer and forget all poll state; idempotent
    pub fn stop_polling(&self) {
        let task = {
            let mut state = self.core.state.lock();
            state.generation += 1;
            state.assets.clear();
            state.last_known.clear();
            state.task.take()
        };

        if let Some(task) = task {
            task.abort();
            self.core.stops.fetch_add(1, Ordering::SeqCst);
            info!("[FallbackPoller] Stopped polling");
        }
    }

    pub fn is_polling(&self) -> bool {
        self.core.state.lock().task.is_some()
    }

    pub fn polled_assets(&self) -> BTreeSet<AssetId> {
        self.core.state.lock().assets.clone()
    }

    /// Live price updates; nothing is replayed to late receivers
    pub fn price_updates(&self) -> broadcast::Receiver<PriceUpdate> {
        self.core.update_tx.subscribe()
    }

    pub fn interval(&self) -> Duration {
        self.core.interval
    }

    pub fn stats(&self) -> PollerStats {
        PollerStats {
            starts: self.core.starts.load(Ordering::SeqCst),
            stops: self.core.stops.load(Ordering::SeqCst),
            ticks: self.core.ticks.load(Ordering::SeqCst),
            degraded_ticks: self.core.degraded_ticks.load(Ordering::SeqCst),
            updates_emitted: self.core.updates_emitted.load(Ordering::SeqCst),
        }
    }
}

fn replace_assets(state: &mut PollerState, assets: BTreeSet<AssetId>) {
    state.last_known.retain(|id, _| assets.contains(id));
    state.assets = assets;
}

impl PollerCore {
    async fn run(self: Arc<Self>, generation: u64) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if !self.poll_once(generation).await {
                return;
            }
        }
    }

    /// Run one tick; false once `generation` has been cancelled
    async fn poll_once(&self, generation: u64) -> bool {
        let assets: Vec<AssetId> = {
            let state = self.state.lock();
            if state.generation != generation {
                return false;
            }
            state.assets.iter().cloned().collect()
        };

        let fresh = match self.cache.refresh_prices(&assets).await {
            Ok(()) => {
                let stale = self.cache.is_stale();
                if stale {
                    debug!("[FallbackPoller] Cache is stale, using last known prices");
                }
                !stale
            }
            Err(e) => {
                warn!("[FallbackPoller] Price fetch failed, using last known prices: {}", e);
                false
            }
        };
        let cached = self.cache.current_prices_for(&assets).await;

        let mut state = self.state.lock();
        if state.generation != generation {
            return false;
        }

        let observed_at = now_millis();
        let mut emitted = 0u64;
        for asset_id in assets {
            // Removed while the fetch was in flight
            if !state.assets.contains(&asset_id) {
                continue;
            }

            let known = state.last_known.get(&asset_id).copied();
            let update = if fresh {
                match cached.get(&asset_id) {
                    Some(price) => PriceUpdate::following(asset_id.clone(), *price, known, observed_at),
                    None => match known {
                        Some(price) => PriceUpdate::first_observation(asset_id.clone(), price, observed_at),
                        None => continue,
                    },
                }
            } else {
                match known.or_else(|| cached.get(&asset_id).copied()) {
                    Some(price) => PriceUpdate::first_observation(asset_id.clone(), price, observed_at),
                    None => continue,
                }
            };

            match update {
                Ok(update) => {
                    state.last_known.insert(asset_id, update.price);
                    // No receivers is fine
                    let _ = self.update_tx.send(update);
                    emitted += 1;
                }
                Err(e) => debug!("[FallbackPoller] Skipping invalid price: {}", e),
            }
        }
        drop(state);

        self.ticks.fetch_add(1, Ordering::SeqCst);
        if !fresh {
            self.degraded_ticks.fetch_add(1, Ordering::SeqCst);
        }
        self.updates_emitted.fetch_add(emitted, Ordering::SeqCst);
        debug!("[FallbackPoller] Tick emitted {} update(s)", emitted);
        true
    }
}

impl Drop for FallbackPoller {
    fn drop(&mut self) {
        if let Some(task) = self.core.state.lock().task.take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for FallbackPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackPoller")
            .field("interval", &self.core.interval)
            .field("polling", &self.is_polling())
            .field("stats", &self.stats())
            .finish()
    }
}
