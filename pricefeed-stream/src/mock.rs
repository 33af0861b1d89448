//! Scripted in-process transport for tests
//!
//! Each `open()` consumes the next scripted outcome (or the fallback once the
//! script is empty). Accepted sessions can be fed events with `emit` and torn
//! down with `close_session`; every command the push channel sends is
//! recorded.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::mpsc;

use pricefeed_core::{now_millis, AssetId, FeedError, FeedResult};

use crate::transport::{
    StreamCommand, StreamEvent, StreamTransport, TransportSession, SESSION_EVENT_BUFFER,
};

/// Result of one scripted `open()` call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MockOutcome {
    #[default]
    Accept,
    Refuse,
}

#[derive(Debug, Default)]
struct MockState {
    script: VecDeque<MockOutcome>,
    fallback: MockOutcome,
    open_delay: Duration,
    opens: u32,
    commands: Vec<StreamCommand>,
    events: Option<mpsc::Sender<StreamEvent>>,
}

/// In-process `StreamTransport` driven by the test
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    inner: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// Transport that accepts every connection
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport that refuses every connection
    pub fn refusing() -> Self {
        let transport = Self::default();
        transport.set_fallback(MockOutcome::Refuse);
        transport
    }

    /// Queue outcomes for the next `open()` calls
    pub fn script(&self, outcomes: impl IntoIterator<Item = MockOutcome>) {
        self.inner.lock().script.extend(outcomes);
    }

    /// Outcome used once the script is exhausted
    pub fn set_fallback(&self, outcome: MockOutcome) {
        self.inner.lock().fallback = outcome;
    }

    pub fn set_open_delay(&self, delay: Duration) {
        self.inner.lock().open_delay = delay;
    }

    /// Number of `open()` calls so far
    pub fn opens(&self) -> u32 {
        self.inner.lock().opens
    }

    /// Every command received across all sessions, in order
    pub fn commands(&self) -> Vec<StreamCommand> {
        self.inner.lock().commands.clone()
    }

    /// How many subscribe commands mentioned `asset_id`
    pub fn subscribe_count(&self, asset_id: &AssetId) -> usize {
        self.count_commands(asset_id, |cmd| matches!(cmd, StreamCommand::Subscribe(_)))
    }

    /// How many unsubscribe commands mentioned `asset_id`
    pub fn unsubscribe_count(&self, asset_id: &AssetId) -> usize {
        self.count_commands(asset_id, |cmd| matches!(cmd, StreamCommand::Unsubscribe(_)))
    }

    fn count_commands(&self, asset_id: &AssetId, kind: impl Fn(&StreamCommand) -> bool) -> usize {
        self.inner
            .lock()
            .commands
            .iter()
            .filter(|cmd| kind(cmd) && cmd.asset_ids().contains(asset_id))
            .count()
    }

    pub fn has_session(&self) -> bool {
        self.inner
            .lock()
            .events
            .as_ref()
            .map(|tx| !tx.is_closed())
            .unwrap_or(false)
    }

    /// Deliver an event to the current session; false if none is open
    pub async fn emit(&self, event: StreamEvent) -> bool {
        let sender = self.inner.lock().events.clone();
        match sender {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    pub async fn emit_price(&self, asset_id: &str, price: Decimal) -> bool {
        self.emit(StreamEvent::Price {
            asset_id: AssetId::from(asset_id),
            price,
            observed_at_millis: now_millis(),
        })
        .await
    }

    /// Simulate the remote side dropping the connection
    pub fn close_session(&self) {
        self.inner.lock().events = None;
    }
}

#[async_trait]
impl StreamTransport for MockTransport {
    fn name(&self) -> &str {
        "mock"
    }

    async fn open(&self) -> FeedResult<TransportSession> {
        let delay = {
            let mut state = self.inner.lock();
            state.opens += 1;
            state.open_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let outcome = {
            let mut state = self.inner.lock();
            let fallback = state.fallback;
            state.script.pop_front().unwrap_or(fallback)
        };

        match outcome {
            MockOutcome::Refuse => Err(FeedError::transport("mock transport refused connection")),
            MockOutcome::Accept => {
                let (event_tx, event_rx) = mpsc::channel(SESSION_EVENT_BUFFER);
                let (command_tx, mut command_rx) = mpsc::unbounded_channel();
                self.inner.lock().events = Some(event_tx);

                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move {
                    while let Some(command) = command_rx.recv().await {
                        inner.lock().commands.push(command);
                    }
                });

                Ok(TransportSession::new(event_rx, command_tx))
            }
        }
    }
}
