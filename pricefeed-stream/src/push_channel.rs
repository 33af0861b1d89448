//! Push channel for real-time price updates
//!
//! Owns one logical streaming connection, drives the connection state machine
//! (with backoff between attempts) and turns decoded transport events into
//! `PriceUpdate`s.
//!
//! Every state change made by the background connection task is checked
//! against a generation counter. `connect()` and `disconnect()` bump the
//! generation, so an attempt that was cancelled can never move the state
//! machine afterwards.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use pricefeed_core::{AssetId, ConnectionState, PriceUpdate, ReconnectConfig};

use crate::reconnect::ReconnectionStrategy;
use crate::transport::{StreamCommand, StreamEvent, StreamTransport, TransportSession};

/// Capacity of the price update broadcast channel
pub const PRICE_UPDATE_BUFFER: usize = 1024;

/// Streaming client with automatic reconnection
pub struct PushChannel {
    core: Arc<ChannelCore>,
}

struct ChannelCore {
    transport: Arc<dyn StreamTransport>,
    strategy: ReconnectionStrategy,
    max_attempts: u32,
    state_tx: watch::Sender<ConnectionState>,
    update_tx: broadcast::Sender<PriceUpdate>,
    session: Mutex<SessionState>,
}

#[derive(Default)]
struct SessionState {
    generation: u64,
    /// Consecutive failed attempts in the current chain
    attempts: u32,
    /// Subscription intent, replayed on every (re)connect
    subscriptions: BTreeSet<AssetId>,
    /// Command sender of the live session, present only while connected
    commands: Option<mpsc::UnboundedSender<StreamCommand>>,
    last_prices: HashMap<AssetId, Decimal>,
    task: Option<JoinHandle<()>>,
}

impl PushChannel {
    /// Create a push channel using the given transport and reconnect policy
    pub fn new(transport: Arc<dyn StreamTransport>, config: &ReconnectConfig) -> Self {
        Self::with_strategy(
            transport,
            ReconnectionStrategy::new(config),
            config.max_attempts,
        )
    }

    pub fn with_strategy(
        transport: Arc<dyn StreamTransport>,
        strategy: ReconnectionStrategy,
        max_attempts: u32,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (update_tx, _) = broadcast::channel(PRICE_UPDATE_BUFFER);

        Self {
            core: Arc::new(ChannelCore {
                transport,
                strategy,
                max_attempts,
                state_tx,
                update_tx,
                session: Mutex::new(SessionState::default()),
            }),
        }
    }

    /// Start connecting
    ///
    /// Resolves once the first attempt resolves: connected, failed, or a retry
    /// has been scheduled. Returns the state at that point. A no-op while
    /// already connecting, connected or reconnecting.
    pub async fn connect(&self) -> ConnectionState {
        let (ready_tx, ready_rx) = oneshot::channel();
        {
            let mut session = self.core.session.lock();
            let current = *self.core.state_tx.borrow();
            if !current.accepts_connect() {
                debug!("[PushChannel] connect() ignored while {}", current);
                return current;
            }

            if let Some(stale) = session.task.take() {
                stale.abort();
            }
            session.generation += 1;
            session.attempts = 0;
            session.commands = None;
            let generation = session.generation;

            info!(
                "[PushChannel] Connecting via {} (generation {})",
                self.core.transport.name(),
                generation
            );
            self.core.state_tx.send_replace(ConnectionState::Connecting);

            let core = Arc::clone(&self.core);
            session.task = Some(tokio::spawn(core.run(generation, ready_tx)));
        }

        // Sender is dropped without a value if the attempt gets cancelled
        let _ = ready_rx.await;
        self.state()
    }

    /// Tear down the connection and cancel any pending retry
    pub fn disconnect(&self) {
        let task = {
            let mut session = self.core.session.lock();
            session.generation += 1;
            session.attempts = 0;
            session.commands = None;
            self.core.state_tx.send_replace(ConnectionState::Disconnected);
            session.task.take()
        };

        if let Some(task) = task {
            task.abort();
        }
        info!("[PushChannel] Disconnected");
    }

    /// Add assets to the subscription set
    ///
    /// Sent upstream right away when connected, otherwise remembered and
    /// replayed on the next successful connect.
    pub fn subscribe(&self, asset_ids: &[AssetId]) {
        let mut session = self.core.session.lock();
        let mut added = Vec::new();
        for id in asset_ids {
            if session.subscriptions.insert(id.clone()) {
                added.push(id.clone());
            }
        }
        if added.is_empty() {
            return;
        }

        match &session.commands {
            Some(tx) => {
                debug!("[PushChannel] Subscribing {:?}", added);
                if tx.send(StreamCommand::Subscribe(added)).is_err() {
                    debug!("[PushChannel] Session gone, subscription kept for replay");
                }
            }
            None => {
                debug!(
                    "[PushChannel] Not connected, {} subscription(s) kept for replay",
                    added.len()
                );
            }
        }
    }

    /// Remove assets from the subscription set
    pub fn unsubscribe(&self, asset_ids: &[AssetId]) {
        let mut session = self.core.session.lock();
        let mut removed = Vec::new();
        for id in asset_ids {
            if session.subscriptions.remove(id) {
                session.last_prices.remove(id);
                removed.push(id.clone());
            }
        }
        if removed.is_empty() {
            return;
        }

        if let Some(tx) = &session.commands {
            debug!("[PushChannel] Unsubscribing {:?}", removed);
            if tx.send(StreamCommand::Unsubscribe(removed)).is_err() {
                debug!("[PushChannel] Session gone while unsubscribing");
            }
        }
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.core.state_tx.borrow()
    }

    /// Observable connection state; new receivers see the current value
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.core.state_tx.subscribe()
    }

    /// Live price updates; nothing is replayed to late receivers
    pub fn price_updates(&self) -> broadcast::Receiver<PriceUpdate> {
        self.core.update_tx.subscribe()
    }

    pub fn subscribed_assets(&self) -> Vec<AssetId> {
        self.core.session.lock().subscriptions.iter().cloned().collect()
    }

    /// Failed attempts in the current reconnect chain
    pub fn attempts(&self) -> u32 {
        self.core.session.lock().attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.core.max_attempts
    }
}

impl ChannelCore {
    /// Connection loop for one generation
    async fn run(self: Arc<Self>, generation: u64, ready: oneshot::Sender<()>) {
        let mut ready = Some(ready);
        let mut failures = 0u32;

        loop {
            match self.transport.open().await {
                Ok(session) => {
                    let TransportSession { events, commands } = session;
                    if !self.mark_connected(generation, commands) {
                        return;
                    }
                    failures = 0;
                    signal_ready(&mut ready);

                    self.pump(generation, events).await;

                    if !self.mark_session_lost(generation) {
                        return;
                    }
                }
                Err(e) => {
                    warn!(
                        "[PushChannel] {} connection attempt failed: {}",
                        self.transport.name(),
                        e
                    );
                }
            }

            failures += 1;
            if failures > self.max_attempts {
                error!(
                    "[PushChannel] Giving up after {} failed attempt(s)",
                    failures
                );
                self.transition(generation, ConnectionState::Failed, failures);
                signal_ready(&mut ready);
                return;
            }

            if !self.transition(generation, ConnectionState::Reconnecting, failures) {
                return;
            }
            signal_ready(&mut ready);

            let delay = self.strategy.next_delay(failures - 1);
            info!(
                "[PushChannel] Reconnecting in {:?} (attempt {}/{})",
                delay, failures, self.max_attempts
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Apply a state change if `generation` is still current
    fn transition(&self, generation: u64, state: ConnectionState, attempts: u32) -> bool {
        let mut session = self.session.lock();
        if session.generation != generation {
            debug!(
                "[PushChannel] Ignoring {} from cancelled generation {}",
                state, generation
            );
            return false;
        }
        session.attempts = attempts;
        self.state_tx.send_replace(state);
        true
    }

    fn mark_connected(
        &self,
        generation: u64,
        commands: mpsc::UnboundedSender<StreamCommand>,
    ) -> bool {
        let mut session = self.session.lock();
        if session.generation != generation {
            debug!(
                "[PushChannel] Discarding session from cancelled generation {}",
                generation
            );
            return false;
        }

        if !session.subscriptions.is_empty() {
            let replay: Vec<AssetId> = session.subscriptions.iter().cloned().collect();
            info!("[PushChannel] Replaying {} subscription(s)", replay.len());
            if commands.send(StreamCommand::Subscribe(replay)).is_err() {
                warn!("[PushChannel] Session closed before replay");
            }
        }

        session.commands = Some(commands);
        session.attempts = 0;
        self.state_tx.send_replace(ConnectionState::Connected);
        info!("[PushChannel] Connected via {}", self.transport.name());
        true
    }

    fn mark_session_lost(&self, generation: u64) -> bool {
        let mut session = self.session.lock();
        if session.generation != generation {
            return false;
        }
        session.commands = None;
        warn!("[PushChannel] Connection lost");
        true
    }

    /// Forward session events until the session ends
    async fn pump(&self, generation: u64, mut events: mpsc::Receiver<StreamEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                StreamEvent::Price {
                    asset_id,
                    price,
                    observed_at_millis,
                } => self.publish(generation, asset_id, price, observed_at_millis),
                StreamEvent::Malformed { reason } => {
                    debug!("[PushChannel] Dropped malformed message: {}", reason);
                }
                StreamEvent::Closed { reason } => {
                    info!("[PushChannel] Session closed by remote: {:?}", reason);
                    break;
                }
            }
        }
    }

    fn publish(&self, generation: u64, asset_id: AssetId, price: Decimal, observed_at_millis: i64) {
        let mut session = self.session.lock();
        if session.generation != generation || session.commands.is_none() {
            return;
        }
        if !session.subscriptions.contains(&asset_id) {
            debug!("[PushChannel] Dropped update for unsubscribed {}", asset_id);
            return;
        }

        let previous = session.last_prices.get(&asset_id).copied();
        match PriceUpdate::following(asset_id.clone(), price, previous, observed_at_millis) {
            Ok(update) => {
                session.last_prices.insert(asset_id, price);
                // No receivers is fine
                let _ = self.update_tx.send(update);
            }
            Err(e) => {
                debug!("[PushChannel] Dropped invalid update: {}", e);
            }
        }
    }
}

fn signal_ready(ready: &mut Option<oneshot::Sender<()>>) {
    if let Some(tx) = ready.take() {
        let _ = tx.send(());
    }
}

impl Drop for PushChannel {
    fn drop(&mut self) {
        if let Some(task) = self.core.session.lock().task.take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for PushChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushChannel")
            .field("transport", &self.core.transport.name())
            .field("state", &self.state())
            .field("max_attempts", &self.core.max_attempts)
            .finish()
    }
}
