//! Streaming transport seam
//!
//! A transport opens one streaming session at a time and hands back a pair of
//! channels: already-decoded events coming in, subscription commands going
//! out. The push channel never touches wire bytes.

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::mpsc;

use pricefeed_core::{AssetId, FeedResult};

/// Buffer for events flowing from a transport session to the push channel
pub const SESSION_EVENT_BUFFER: usize = 1024;

/// Decoded event delivered by a transport session
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A price observation for one asset
    Price {
        asset_id: AssetId,
        price: Decimal,
        observed_at_millis: i64,
    },
    /// A frame the transport could not decode (dropped by the push channel)
    Malformed { reason: String },
    /// The remote side closed the session
    Closed { reason: Option<String> },
}

/// Subscription command sent to a transport session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamCommand {
    Subscribe(Vec<AssetId>),
    Unsubscribe(Vec<AssetId>),
}

impl StreamCommand {
    pub fn asset_ids(&self) -> &[AssetId] {
        match self {
            Self::Subscribe(ids) | Self::Unsubscribe(ids) => ids,
        }
    }
}

/// One open streaming session
///
/// The session ends when `events` yields `None` or `StreamEvent::Closed`.
/// Dropping the session must tear the underlying connection down.
#[derive(Debug)]
pub struct TransportSession {
    pub events: mpsc::Receiver<StreamEvent>,
    pub commands: mpsc::UnboundedSender<StreamCommand>,
}

impl TransportSession {
    pub fn new(
        events: mpsc::Receiver<StreamEvent>,
        commands: mpsc::UnboundedSender<StreamCommand>,
    ) -> Self {
        Self { events, commands }
    }
}

/// Opens streaming sessions to the price feed
#[async_trait]
pub trait StreamTransport: Send + Sync + 'static {
    /// Short name used in log lines
    fn name(&self) -> &str;

    /// Open a new session; errors are connection-level failures
    async fn open(&self) -> FeedResult<TransportSession>;
}
