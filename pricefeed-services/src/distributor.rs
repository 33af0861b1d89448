//! Price distributor
//!
//! Merges the push channel and the fallback poller into one update stream and
//! switches between them based on the push channel's connection state:
//!
//! - CONNECTED: the poller is stopped, updates come from the push channel
//! - FAILED with tracked assets: the poller runs with the effective set
//! - anything else: no switch is forced, the current source keeps running
//!
//! Subscriptions are always forwarded to the push channel, which keeps them
//! while it is down and replays them once it reconnects. That replay is the
//! hand-back from poll to push.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use pricefeed_core::{AssetId, ConnectionState, PriceUpdate};
use pricefeed_stream::{PushChannel, PRICE_UPDATE_BUFFER};

use crate::poller::FallbackPoller;
use crate::subscription::SubscriptionManager;

/// Point-in-time view of the distributor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DistributorHealth {
    pub connection_state: ConnectionState,
    pub using_fallback: bool,
    pub polling: bool,
    pub tracked_assets: usize,
    pub push_updates: u64,
    pub poll_updates: u64,
    /// Epoch millis of the last forwarded update
    pub last_update_at: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpdateSource {
    Push,
    Poll,
}

impl std::fmt::Display for UpdateSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateSource::Push => write!(f, "push"),
            UpdateSource::Poll => write!(f, "poll"),
        }
    }
}

/// Failover orchestrator over a push channel and a fallback poller
pub struct PriceDistributor {
    inner: Arc<DistributorInner>,
    tasks: Vec<JoinHandle<()>>,
}

struct DistributorInner {
    push: Arc<PushChannel>,
    poller: Arc<FallbackPoller>,
    subscriptions: Arc<SubscriptionManager>,
    update_tx: broadcast::Sender<PriceUpdate>,
    /// Guards every source switch
    using_fallback: Mutex<bool>,
    push_updates: AtomicU64,
    poll_updates: AtomicU64,
    /// 0 until the first update
    last_update_at: AtomicI64,
}

impl PriceDistributor {
    /// Wire up the distributor
    ///
    /// Spawns the connection watcher and the two forwarding tasks, so this
    /// must be called from within a Tokio runtime.
    pub fn new(
        push: Arc<PushChannel>,
        poller: Arc<FallbackPoller>,
        subscriptions: Arc<SubscriptionManager>,
    ) -> Self {
        let (update_tx, _) = broadcast::channel(PRICE_UPDATE_BUFFER);

        // Subscribe before spawning so nothing is missed
        let state_rx = push.connection_state();
        let push_rx = push.price_updates();
        let poll_rx = poller.price_updates();

        let inner = Arc::new(DistributorInner {
            push,
            poller,
            subscriptions,
            update_tx,
            using_fallback: Mutex::new(false),
            push_updates: AtomicU64::new(0),
            poll_updates: AtomicU64::new(0),
            last_update_at: AtomicI64::new(0),
        });

        let tasks = vec![
            tokio::spawn(Arc::clone(&inner).watch_connection(state_rx)),
            tokio::spawn(Arc::clone(&inner).forward(push_rx, UpdateSource::Push)),
            tokio::spawn(Arc::clone(&inner).forward(poll_rx, UpdateSource::Poll)),
        ];

        Self { inner, tasks }
    }

    /// Connect the push channel; see `PushChannel::connect`
    pub async fn connect(&self) -> ConnectionState {
        self.inner.push.connect().await
    }

    /// Disconnect the push channel and stop any fallback polling
    pub fn disconnect(&self) {
        self.inner.push.disconnect();

        let mut using_fallback = self.inner.using_fallback.lock();
        self.inner.poller.stop_polling();
        if *using_fallback {
            info!("[Distributor] Fallback cleared on disconnect");
        }
        *using_fallback = false;
    }

    /// Start receiving updates for `asset_ids`
    pub fn subscribe(&self, asset_ids: &[AssetId]) {
        if asset_ids.is_empty() {
            return;
        }
        self.inner.push.subscribe(asset_ids);

        let mut using_fallback = self.inner.using_fallback.lock();
        let effective = self.inner.subscriptions.effective_upstream_set();
        if *using_fallback {
            if self.inner.poller.is_polling() {
                self.inner.poller.update_subscriptions(effective);
            } else {
                self.inner.poller.start_polling(effective);
            }
        } else if self.inner.push.state() == ConnectionState::Failed && !effective.is_empty() {
            info!(
                "[Distributor] Push channel failed, polling {} asset(s)",
                effective.len()
            );
            self.inner.poller.start_polling(effective);
            *using_fallback = true;
        }
    }

    /// Stop receiving updates for `asset_ids`
    pub fn unsubscribe(&self, asset_ids: &[AssetId]) {
        if asset_ids.is_empty() {
            return;
        }
        self.inner.push.unsubscribe(asset_ids);

        let using_fallback = self.inner.using_fallback.lock();
        if *using_fallback && self.inner.poller.is_polling() {
            // An empty set stops the poller
            self.inner
                .poller
                .update_subscriptions(self.inner.subscriptions.effective_upstream_set());
        }
    }

    /// The push channel's connection state signal
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.push.connection_state()
    }

    /// Merged updates from both sources
    pub fn price_updates(&self) -> broadcast::Receiver<PriceUpdate> {
        self.inner.update_tx.subscribe()
    }

    pub fn is_using_fallback(&self) -> bool {
        *self.inner.using_fallback.lock()
    }

    pub fn health(&self) -> DistributorHealth {
        let last = self.inner.last_update_at.load(Ordering::SeqCst);
        DistributorHealth {
            connection_state: self.inner.push.state(),
            using_fallback: self.is_using_fallback(),
            polling: self.inner.poller.is_polling(),
            tracked_assets: self.inner.subscriptions.effective_upstream_set().len(),
            push_updates: self.inner.push_updates.load(Ordering::SeqCst),
            poll_updates: self.inner.poll_updates.load(Ordering::SeqCst),
            last_update_at: (last > 0).then_some(last),
        }
    }

    pub fn push_channel(&self) -> &Arc<PushChannel> {
        &self.inner.push
    }

    pub fn poller(&self) -> &Arc<FallbackPoller> {
        &self.inner.poller
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.inner.subscriptions
    }
}

impl DistributorInner {
    async fn watch_connection(self: Arc<Self>, mut state_rx: watch::Receiver<ConnectionState>) {
        loop {
            let observed = *state_rx.borrow_and_update();
            debug!("[Distributor] Connection state is {}", observed);
            self.reconcile();

            if state_rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Apply the failover rule to the push channel's current state
    ///
    /// The state is read under the switch lock, so a `disconnect()` racing
    /// with a state change can never leave the poller running.
    fn reconcile(&self) {
        let mut using_fallback = self.using_fallback.lock();
        match self.push.state() {
            ConnectionState::Connected if *using_fallback => {
                info!("[Distributor] Push channel is back, stopping fallback polling");
                self.poller.stop_polling();
                *using_fallback = false;
            }
            ConnectionState::Failed if !*using_fallback => {
                let effective = self.subscriptions.effective_upstream_set();
                if effective.is_empty() {
                    debug!("[Distributor] Push channel failed with nothing to poll");
                    return;
                }
                warn!(
                    "[Distributor] Push channel failed, polling {} asset(s)",
                    effective.len()
                );
                self.poller.start_polling(effective);
                *using_fallback = true;
            }
            state if state.is_transitioning() => {
                debug!("[Distributor] Push channel {}, keeping current source", state);
            }
            _ => {}
        }
    }

    async fn forward(self: Arc<Self>, mut rx: broadcast::Receiver<PriceUpdate>, source: UpdateSource) {
        loop {
            match rx.recv().await {
                Ok(update) => {
                    let counter = match source {
                        UpdateSource::Push => &self.push_updates,
                        UpdateSource::Poll => &self.poll_updates,
                    };
                    counter.fetch_add(1, Ordering::SeqCst);
                    self.last_update_at
                        .store(update.observed_at_millis, Ordering::SeqCst);
                    // No receivers is fine
                    let _ = self.update_tx.send(update);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(
                        "[Distributor] {} updates lagged, skipped {}",
                        source, skipped
                    );
                }
                Err(RecvError::Closed) => {
                    debug!("[Distributor] {} updates closed", source);
                    return;
                }
            }
        }
    }
}

impl Drop for PriceDistributor {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl std::fmt::Debug for PriceDistributor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriceDistributor")
            .field("health", &self.health())
            .finish()
    }
}
