//! Streaming push channel for live price updates
//!
//! This crate owns the "push" half of the feed: a `StreamTransport` seam, a
//! WebSocket implementation of it, the reconnection backoff policy and the
//! `PushChannel` state machine that keeps a session alive and replays
//! subscriptions after every reconnect.

pub mod push_channel;
pub mod reconnect;
pub mod transport;
pub mod websocket;

#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use push_channel::{PushChannel, PRICE_UPDATE_BUFFER};
pub use reconnect::ReconnectionStrategy;
pub use transport::{StreamCommand, StreamEvent, StreamTransport, TransportSession};
pub use websocket::{WebSocketTransport, WebSocketTransportConfig};
