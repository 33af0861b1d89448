//! WebSocket transport for the streaming price feed
//!
//! Opens a WebSocket session, sends subscribe/unsubscribe frames, keeps the
//! connection alive with pings and decodes price frames into `StreamEvent`s.
//!
//! Wire format (text frames, JSON):
//! - outgoing: `{"type":"subscribe","asset_ids":["BTC","ETH"]}`
//! - incoming: `{"asset_id":"BTC","price":"64000.5","timestamp":1700000000000}`
//!   or an array of such objects

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

use pricefeed_core::{now_millis, AssetId, FeedError, FeedResult};

use crate::transport::{
    StreamCommand, StreamEvent, StreamTransport, TransportSession, SESSION_EVENT_BUFFER,
};

/// Ping interval for keepalive
const PING_INTERVAL: Duration = Duration::from_secs(10);

/// Timestamps below this are treated as seconds rather than milliseconds
const SECONDS_TIMESTAMP_CEILING: i64 = 10_000_000_000;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ============================================================================
// Wire Message Types
// ============================================================================

/// Subscribe/unsubscribe frame
#[derive(Debug, Clone, Serialize)]
struct CommandMessage<'a> {
    #[serde(rename = "type")]
    msg_type: &'static str,
    asset_ids: &'a [AssetId],
}

/// Price frame
#[derive(Debug, Clone, Deserialize)]
struct PriceMessage {
    asset_id: String,
    price: serde_json::Value,
    #[serde(default)]
    timestamp: Option<i64>,
}

/// Server error frame
#[derive(Debug, Clone, Deserialize)]
struct ErrorMessage {
    error: String,
    message: Option<String>,
}

// ============================================================================
// WebSocket Transport
// ============================================================================

/// Configuration for WebSocketTransport
#[derive(Clone, Debug)]
pub struct WebSocketTransportConfig {
    pub url: Url,
    pub ping_interval: Duration,
}

impl WebSocketTransportConfig {
    pub fn new(url: &str) -> FeedResult<Self> {
        let url = Url::parse(url)
            .map_err(|e| FeedError::config(format!("invalid stream url {:?}: {}", url, e)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(FeedError::config(format!(
                "stream url must use ws:// or wss://, got {}",
                url.scheme()
            )));
        }
        Ok(Self {
            url,
            ping_interval: PING_INTERVAL,
        })
    }
}

/// `StreamTransport` backed by a WebSocket connection
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    config: WebSocketTransportConfig,
}

impl WebSocketTransport {
    pub fn new(config: WebSocketTransportConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl StreamTransport for WebSocketTransport {
    fn name(&self) -> &str {
        "websocket"
    }

    async fn open(&self) -> FeedResult<TransportSession> {
        info!("[WebSocket] Connecting to {}", self.config.url);

        let (ws_stream, _) = connect_async(self.config.url.as_str())
            .await
            .map_err(|e| FeedError::transport(e.to_string()))?;

        info!("[WebSocket] Connected successfully");

        let (event_tx, event_rx) = mpsc::channel(SESSION_EVENT_BUFFER);
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_session(
            ws_stream,
            event_tx,
            command_rx,
            self.config.ping_interval,
        ));

        Ok(TransportSession::new(event_rx, command_tx))
    }
}

/// Pump one WebSocket session until either side goes away
async fn run_session(
    ws_stream: WsStream,
    events: mpsc::Sender<StreamEvent>,
    mut commands: mpsc::UnboundedReceiver<StreamCommand>,
    ping_interval: Duration,
) {
    let (mut write, mut read) = ws_stream.split();

    let mut ping_timer = interval(ping_interval);
    ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick fires immediately
    ping_timer.tick().await;

    loop {
        tokio::select! {
            // Handle incoming messages
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        for event in decode_frame(text.as_str()) {
                            if events.send(event).await.is_err() {
                                debug!("[WebSocket] Event receiver gone, closing session");
                                let _ = write.close().await;
                                return;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = write.send(Message::Pong(data)).await {
                            warn!("[WebSocket] Failed to send pong: {}", e);
                            break;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!("[WebSocket] Connection closed by server");
                        let _ = events
                            .send(StreamEvent::Closed {
                                reason: frame.map(|f| f.reason.to_string()),
                            })
                            .await;
                        return;
                    }
                    Some(Err(e)) => {
                        error!("[WebSocket] Error: {}", e);
                        break;
                    }
                    None => {
                        info!("[WebSocket] Stream ended");
                        break;
                    }
                    _ => {}
                }
            }

            // Handle outgoing commands
            cmd = commands.recv() => {
                match cmd {
                    Some(cmd) => {
                        let json = match encode_command(&cmd) {
                            Ok(json) => json,
                            Err(e) => {
                                warn!("[WebSocket] Failed to encode command: {}", e);
                                continue;
                            }
                        };
                        debug!("[WebSocket] Sending {}", json);
                        if let Err(e) = write.send(Message::Text(json.into())).await {
                            warn!("[WebSocket] Failed to send command: {}", e);
                            break;
                        }
                    }
                    None => {
                        debug!("[WebSocket] Command channel closed, closing session");
                        let _ = write.close().await;
                        return;
                    }
                }
            }

            // Send periodic pings to keep connection alive
            _ = ping_timer.tick() => {
                if let Err(e) = write.send(Message::Ping(Default::default())).await {
                    warn!("[WebSocket] Failed to send ping: {}", e);
                    break;
                }
            }

            _ = events.closed() => {
                debug!("[WebSocket] Session dropped, closing connection");
                let _ = write.close().await;
                return;
            }
        }
    }

    let _ = events
        .send(StreamEvent::Closed {
            reason: Some("connection error".to_string()),
        })
        .await;
}

/// Serialize a subscription command into a text frame
pub fn encode_command(command: &StreamCommand) -> Result<String, serde_json::Error> {
    let msg = match command {
        StreamCommand::Subscribe(ids) => CommandMessage {
            msg_type: "subscribe",
            asset_ids: ids,
        },
        StreamCommand::Unsubscribe(ids) => CommandMessage {
            msg_type: "unsubscribe",
            asset_ids: ids,
        },
    };
    serde_json::to_string(&msg)
}

/// Decode a text frame into zero or more events
///
/// Keepalive replies and acknowledgements produce nothing; anything that
/// cannot be understood becomes `StreamEvent::Malformed`.
pub fn decode_frame(text: &str) -> Vec<StreamEvent> {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("pong") {
        return Vec::new();
    }

    let json = match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(json) => json,
        Err(e) => return vec![malformed(format!("invalid json: {}", e))],
    };

    match json {
        serde_json::Value::Array(items) => items.into_iter().filter_map(decode_value).collect(),
        other => decode_value(other).into_iter().collect(),
    }
}

fn decode_value(json: serde_json::Value) -> Option<StreamEvent> {
    if json.get("error").is_some() {
        if let Ok(err) = serde_json::from_value::<ErrorMessage>(json) {
            error!("[WebSocket] Server error: {} - {:?}", err.error, err.message);
        }
        return None;
    }

    // Acknowledgements carry a type but no price
    if json.get("type").is_some() && json.get("price").is_none() {
        debug!("[WebSocket] Ignoring control message: {}", json);
        return None;
    }

    let msg = match serde_json::from_value::<PriceMessage>(json) {
        Ok(msg) => msg,
        Err(e) => return Some(malformed(format!("unexpected message: {}", e))),
    };

    let asset_id = match AssetId::parse(&msg.asset_id) {
        Ok(id) => id,
        Err(e) => return Some(malformed(e.to_string())),
    };

    let price = match parse_price(&msg.price) {
        Some(price) => price,
        None => return Some(malformed(format!("bad price for {}: {}", asset_id, msg.price))),
    };

    Some(StreamEvent::Price {
        asset_id,
        price,
        observed_at_millis: normalize_timestamp(msg.timestamp),
    })
}

fn parse_price(value: &serde_json::Value) -> Option<Decimal> {
    let raw = match value {
        serde_json::Value::String(s) => s.trim().to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        _ => return None,
    };
    Decimal::from_str(&raw)
        .or_else(|_| Decimal::from_scientific(&raw))
        .ok()
}

fn normalize_timestamp(timestamp: Option<i64>) -> i64 {
    match timestamp {
        Some(ts) if ts > 0 && ts < SECONDS_TIMESTAMP_CEILING => ts * 1000,
        Some(ts) if ts > 0 => ts,
        _ => now_millis(),
    }
}

fn malformed(reason: String) -> StreamEvent {
    StreamEvent::Malformed { reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pricefeed_core::asset_ids;
    use rust_decimal_macros::dec;

    #[test]
    fn test_encode_commands() {
        let sub = encode_command(&StreamCommand::Subscribe(asset_ids(["BTC", "ETH"]))).unwrap();
        assert_eq!(sub, r#"{"type":"subscribe","asset_ids":["BTC","ETH"]}"#);

        let unsub = encode_command(&StreamCommand::Unsubscribe(asset_ids(["ETH"]))).unwrap();
        assert_eq!(unsub, r#"{"type":"unsubscribe","asset_ids":["ETH"]}"#);
    }

    #[test]
    fn test_decode_price_frame() {
        let events = decode_frame(r#"{"asset_id":"BTC","price":"64000.5","timestamp":1700000000000}"#);
        assert_eq!(
            events,
            vec![StreamEvent::Price {
                asset_id: AssetId::from("BTC"),
                price: dec!(64000.5),
                observed_at_millis: 1_700_000_000_000,
            }]
        );
    }

    #[test]
    fn test_decode_numeric_price_and_second_timestamps() {
        let events = decode_frame(r#"{"asset_id":"ETH","price":3100.25,"timestamp":1700000000}"#);
        match &events[..] {
            [StreamEvent::Price {
                price,
                observed_at_millis,
                ..
            }] => {
                assert_eq!(*price, dec!(3100.25));
                assert_eq!(*observed_at_millis, 1_700_000_000_000);
            }
            other => panic!("unexpected events: {:?}", other),
        }
    }

    #[test]
    fn test_decode_batch() {
        let events = decode_frame(
            r#"[{"asset_id":"BTC","price":"1"},{"asset_id":"ETH","price":"2"},{"nope":true}]"#,
        );
        assert_eq!(events.len(), 3);
        assert!(matches!(events[2], StreamEvent::Malformed { .. }));
    }

    #[test]
    fn test_decode_ignores_control_frames() {
        assert!(decode_frame("PONG").is_empty());
        assert!(decode_frame("").is_empty());
        assert!(decode_frame(r#"{"type":"subscribed","asset_ids":["BTC"]}"#).is_empty());
        assert!(decode_frame(r#"{"error":"bad_request","message":"unknown asset"}"#).is_empty());
    }

    #[test]
    fn test_decode_malformed_frames() {
        assert!(matches!(
            decode_frame("not json").as_slice(),
            [StreamEvent::Malformed { .. }]
        ));
        assert!(matches!(
            decode_frame(r#"{"asset_id":"BTC","price":"abc"}"#).as_slice(),
            [StreamEvent::Malformed { .. }]
        ));
        assert!(matches!(
            decode_frame(r#"{"asset_id":"  ","price":"1"}"#).as_slice(),
            [StreamEvent::Malformed { .. }]
        ));
    }

    #[test]
    fn test_config_requires_websocket_scheme() {
        assert!(WebSocketTransportConfig::new("wss://example.com/ws").is_ok());
        assert!(WebSocketTransportConfig::new("https://example.com").is_err());
        assert!(WebSocketTransportConfig::new("not a url").is_err());
    }
}
