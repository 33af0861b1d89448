//! Configuration for the price feed
//!
//! Every field has a default; `FeedConfig::from_env` overrides them from
//! `PRICEFEED_*` environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FeedError, FeedResult};

/// Default streaming endpoint
pub const DEFAULT_STREAM_URL: &str = "wss://stream.pricefeed.local/ws/prices";

/// Default REST price endpoint base
pub const DEFAULT_PRICE_API_URL: &str = "https://api.pricefeed.local";

/// Reconnection policy settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Delay before the first retry, never zero
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,

    /// Upper bound for any retry delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Growth factor per attempt
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Maximum extra fraction added to each delay (0.2 = up to +20%)
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,

    /// Failed attempts tolerated before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_min_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter_ratio() -> f64 {
    0.2
}

fn default_max_attempts() -> u32 {
    5
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter_ratio: default_jitter_ratio(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl ReconnectConfig {
    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn validate(&self) -> FeedResult<()> {
        if self.min_delay_ms == 0 {
            return Err(FeedError::config("reconnect min_delay_ms must be > 0"));
        }
        if self.max_delay_ms < self.min_delay_ms {
            return Err(FeedError::config(format!(
                "reconnect max_delay_ms ({}) is below min_delay_ms ({})",
                self.max_delay_ms, self.min_delay_ms
            )));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(FeedError::config("reconnect multiplier must be >= 1.0"));
        }
        if !self.jitter_ratio.is_finite() || !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err(FeedError::config("reconnect jitter_ratio must be within 0..=1"));
        }
        Ok(())
    }
}

/// Fallback poller settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollerConfig {
    /// Time between poll ticks
    #[serde(default = "default_poll_interval_ms")]
    pub interval_ms: u64,

    /// Age after which the price cache reports itself stale
    #[serde(default = "default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    30_000
}

fn default_cache_ttl_ms() -> u64 {
    60_000
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval_ms(),
            cache_ttl_ms: default_cache_ttl_ms(),
        }
    }
}

impl PollerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn validate(&self) -> FeedResult<()> {
        if self.interval_ms == 0 {
            return Err(FeedError::config("poll interval_ms must be > 0"));
        }
        Ok(())
    }
}

/// Top-level feed configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedConfig {
    #[serde(default = "default_stream_url")]
    pub stream_url: String,

    #[serde(default = "default_price_api_url")]
    pub price_api_url: String,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    #[serde(default)]
    pub poller: PollerConfig,
}

fn default_stream_url() -> String {
    DEFAULT_STREAM_URL.to_string()
}

fn default_price_api_url() -> String {
    DEFAULT_PRICE_API_URL.to_string()
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            stream_url: default_stream_url(),
            price_api_url: default_price_api_url(),
            reconnect: ReconnectConfig::default(),
            poller: PollerConfig::default(),
        }
    }
}

impl FeedConfig {
    /// Load configuration from `PRICEFEED_*` environment variables
    pub fn from_env() -> FeedResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> FeedResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("PRICEFEED_STREAM_URL") {
            config.stream_url = url;
        }
        if let Some(url) = lookup("PRICEFEED_PRICE_API_URL") {
            config.price_api_url = url;
        }
        if let Some(v) = parse_var(&lookup, "PRICEFEED_RECONNECT_MIN_MS")? {
            config.reconnect.min_delay_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "PRICEFEED_RECONNECT_MAX_MS")? {
            config.reconnect.max_delay_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "PRICEFEED_RECONNECT_MAX_ATTEMPTS")? {
            config.reconnect.max_attempts = v;
        }
        if let Some(v) = parse_var(&lookup, "PRICEFEED_RECONNECT_JITTER")? {
            config.reconnect.jitter_ratio = v;
        }
        if let Some(v) = parse_var(&lookup, "PRICEFEED_POLL_INTERVAL_MS")? {
            config.poller.interval_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "PRICEFEED_CACHE_TTL_MS")? {
            config.poller.cache_ttl_ms = v;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> FeedResult<()> {
        if self.stream_url.trim().is_empty() {
            return Err(FeedError::config("stream_url must not be empty"));
        }
        self.reconnect.validate()?;
        self.poller.validate()
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> FeedResult<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| FeedError::config(format!("{}={:?}: {}", key, raw, e))),
        None => Ok(None),
    }
}
