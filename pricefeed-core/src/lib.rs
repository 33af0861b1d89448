//! Core types for live price distribution
//!
//! This crate defines the shared data structures used across the workspace:
//! asset identifiers, price update events, the push connection state and the
//! feed configuration.

pub mod asset;
pub mod config;
pub mod connection;
pub mod error;
pub mod price;

pub use asset::{asset_ids, AssetId};
pub use config::{FeedConfig, PollerConfig, ReconnectConfig};
pub use connection::ConnectionState;
pub use error::{FeedError, FeedResult};
pub use price::{now_millis, PriceUpdate};
