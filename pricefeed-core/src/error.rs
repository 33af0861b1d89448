//! Error types for the price feed

use thiserror::Error;

/// Feed-wide error type
///
/// None of these ever reach UI consumers during normal failover: transport
/// and fetch failures are absorbed by the components that own them and only
/// show up as a `ConnectionState` change.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FeedError {
    #[error("Invalid consumer id: {0:?}")]
    InvalidConsumer(String),

    #[error("Invalid asset id: {0:?}")]
    InvalidAsset(String),

    #[error("Invalid price for {asset}: {price}")]
    InvalidPrice { asset: String, price: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Fetch error: {0}")]
    Fetch(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl FeedError {
    pub fn invalid_consumer(id: impl Into<String>) -> Self {
        FeedError::InvalidConsumer(id.into())
    }

    pub fn invalid_asset(id: impl Into<String>) -> Self {
        FeedError::InvalidAsset(id.into())
    }

    pub fn invalid_price(asset: impl Into<String>, price: impl ToString) -> Self {
        FeedError::InvalidPrice {
            asset: asset.into(),
            price: price.to_string(),
        }
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        FeedError::Transport(msg.into())
    }

    pub fn fetch(msg: impl Into<String>) -> Self {
        FeedError::Fetch(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        FeedError::Decode(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        FeedError::Config(msg.into())
    }
}

/// Result type alias for feed operations
pub type FeedResult<T> = Result<T, FeedError>;
