//! Price cache seam used by the fallback poller
//!
//! The poller asks the cache to refresh the assets it tracks, then reads the
//! current prices back. A failed refresh and a stale cache are treated the
//! same way by the poller.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::Client;
use rust_decimal::Decimal;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};
use url::Url;

use pricefeed_core::{AssetId, FeedError, FeedResult};

/// HTTP request timeout
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Source of polled prices
#[async_trait]
pub trait PriceCache: Send + Sync + 'static {
    /// Fetch fresh prices for `asset_ids`
    async fn refresh_prices(&self, asset_ids: &[AssetId]) -> FeedResult<()>;

    /// Prices currently held for `asset_ids`; missing entries are allowed
    async fn current_prices_for(&self, asset_ids: &[AssetId]) -> HashMap<AssetId, Decimal>;

    /// Whether the held prices are too old to be trusted
    fn is_stale(&self) -> bool;
}

// ============================================================================
// In-memory cache
// ============================================================================

#[derive(Debug, Default)]
struct MemoryState {
    prices: HashMap<AssetId, Decimal>,
    confirmed_at: Option<Instant>,
    refresh_delay: Duration,
}

/// Cache whose prices are written directly by the owner
///
/// A successful refresh confirms the held prices as current; the cache turns
/// stale once `ttl` passes without a write or a refresh. Refreshes can be
/// made to fail or to take a while, which is how an outage or a slow backing
/// API is simulated.
#[derive(Debug)]
pub struct InMemoryPriceCache {
    ttl: Duration,
    state: RwLock<MemoryState>,
    failing: AtomicBool,
    refreshes: AtomicU64,
    in_flight: AtomicU64,
    max_in_flight: AtomicU64,
}

impl InMemoryPriceCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: RwLock::new(MemoryState::default()),
            failing: AtomicBool::new(false),
            refreshes: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
            max_in_flight: AtomicU64::new(0),
        }
    }

    pub fn set_price(&self, asset_id: impl Into<AssetId>, price: Decimal) {
        let mut state = self.state.write();
        state.prices.insert(asset_id.into(), price);
        state.confirmed_at = Some(Instant::now());
    }

    /// Make subsequent refreshes fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Make subsequent refreshes take `delay` before completing
    pub fn set_refresh_delay(&self, delay: Duration) {
        self.state.write().refresh_delay = delay;
    }

    /// Number of refresh calls so far
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::SeqCst)
    }

    /// Most refreshes ever running at the same time
    pub fn max_concurrent_refreshes(&self) -> u64 {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

/// Counts a refresh as running until dropped, including on cancellation
struct InFlight<'a>(&'a AtomicU64);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicU64, max: &AtomicU64) -> Self {
        let running = counter.fetch_add(1, Ordering::SeqCst) + 1;
        max.fetch_max(running, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for InMemoryPriceCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

#[async_trait]
impl PriceCache for InMemoryPriceCache {
    async fn refresh_prices(&self, _asset_ids: &[AssetId]) -> FeedResult<()> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        let _running = InFlight::enter(&self.in_flight, &self.max_in_flight);

        let delay = self.state.read().refresh_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.failing.load(Ordering::SeqCst) {
            return Err(FeedError::fetch("price source unavailable"));
        }
        self.state.write().confirmed_at = Some(Instant::now());
        Ok(())
    }

    async fn current_prices_for(&self, asset_ids: &[AssetId]) -> HashMap<AssetId, Decimal> {
        let state = self.state.read();
        asset_ids
            .iter()
            .filter_map(|id| state.prices.get(id).map(|price| (id.clone(), *price)))
            .collect()
    }

    fn is_stale(&self) -> bool {
        match self.state.read().confirmed_at {
            Some(at) => at.elapsed() > self.ttl,
            None => true,
        }
    }
}

// ============================================================================
// HTTP cache
// ============================================================================

#[derive(Debug, Default)]
struct HttpState {
    prices: HashMap<AssetId, Decimal>,
    refreshed_at: Option<Instant>,
}

/// Cache backed by the REST price API
///
/// `GET {base}/prices?ids=A,B` answers `{"A": "1.23", "B": 4.5}`. Assets the
/// API leaves out keep their previous cached price.
pub struct HttpPriceCache {
    client: Client,
    prices_url: Url,
    ttl: Duration,
    state: RwLock<HttpState>,
}

impl HttpPriceCache {
    pub fn new(base_url: &str, ttl: Duration) -> FeedResult<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| FeedError::config(format!("Failed to create HTTP client: {}", e)))?;

        let prices_url = Url::parse(&format!("{}/prices", base_url.trim_end_matches('/')))
            .map_err(|e| FeedError::config(format!("invalid price api url {:?}: {}", base_url, e)))?;

        Ok(Self {
            client,
            prices_url,
            ttl,
            state: RwLock::new(HttpState::default()),
        })
    }

    pub fn prices_url(&self) -> &Url {
        &self.prices_url
    }
}

#[async_trait]
impl PriceCache for HttpPriceCache {
    #[instrument(skip(self, asset_ids), fields(count = asset_ids.len()))]
    async fn refresh_prices(&self, asset_ids: &[AssetId]) -> FeedResult<()> {
        if asset_ids.is_empty() {
            return Ok(());
        }

        let ids = asset_ids
            .iter()
            .map(AssetId::as_str)
            .collect::<Vec<_>>()
            .join(",");

        debug!("Fetching prices from {} for {}", self.prices_url, ids);

        let response = self
            .client
            .get(self.prices_url.clone())
            .query(&[("ids", ids.as_str())])
            .send()
            .await
            .map_err(|e| FeedError::fetch(format!("Failed to fetch prices: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(FeedError::fetch(format!(
                "Price API error ({}): {}",
                status, body
            )));
        }

        let body: HashMap<String, serde_json::Value> = response
            .json()
            .await
            .map_err(|e| FeedError::decode(format!("Failed to parse price response: {}", e)))?;

        let fetched = parse_price_map(body);

        let mut state = self.state.write();
        state.prices.extend(fetched);
        state.refreshed_at = Some(Instant::now());
        Ok(())
    }

    async fn current_prices_for(&self, asset_ids: &[AssetId]) -> HashMap<AssetId, Decimal> {
        let state = self.state.read();
        asset_ids
            .iter()
            .filter_map(|id| state.prices.get(id).map(|price| (id.clone(), *price)))
            .collect()
    }

    fn is_stale(&self) -> bool {
        match self.state.read().refreshed_at {
            Some(at) => at.elapsed() > self.ttl,
            None => true,
        }
    }
}

impl std::fmt::Debug for HttpPriceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpPriceCache")
            .field("prices_url", &self.prices_url.as_str())
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

/// Decode a `{id: price}` body, skipping entries that are not positive numbers
fn parse_price_map(body: HashMap<String, serde_json::Value>) -> HashMap<AssetId, Decimal> {
    body.into_iter()
        .filter_map(|(id, value)| {
            let asset_id = AssetId::parse(&id).ok()?;
            let price = match &value {
                serde_json::Value::String(s) => Decimal::from_str(s.trim()).ok(),
                serde_json::Value::Number(n) => Decimal::from_str(&n.to_string())
                    .or_else(|_| Decimal::from_scientific(&n.to_string()))
                    .ok(),
                _ => None,
            };
            match price {
                Some(price) if price > Decimal::ZERO => Some((asset_id, price)),
                _ => {
                    warn!("Skipping unusable price for {}: {}", id, value);
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pricefeed_core::asset_ids;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn test_in_memory_cache_reads_back_prices() {
        let cache = InMemoryPriceCache::default();
        cache.set_price("BTC", dec!(64000));

        let prices = cache
            .current_prices_for(&asset_ids(["BTC", "ETH"]))
            .await;
        assert_eq!(prices.len(), 1);
        assert_eq!(prices[&AssetId::from("BTC")], dec!(64000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_memory_cache_staleness() {
        let cache = InMemoryPriceCache::new(Duration::from_secs(60));
        assert!(cache.is_stale());

        cache.set_price("BTC", dec!(1));
        assert!(!cache.is_stale());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cache.is_stale());

        cache.refresh_prices(&asset_ids(["BTC"])).await.unwrap();
        assert!(!cache.is_stale());
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_memory_cache_failing_refresh() {
        let cache = InMemoryPriceCache::default();
        cache.set_failing(true);

        let err = cache.refresh_prices(&asset_ids(["BTC"])).await.unwrap_err();
        assert!(matches!(err, FeedError::Fetch(_)));
        assert_eq!(cache.refresh_count(), 1);
    }

    #[test]
    fn test_parse_price_map() {
        let body: HashMap<String, serde_json::Value> = serde_json::from_value(json!({
            "BTC": "64000.50",
            "ETH": 3100.25,
            "BAD": "abc",
            "ZERO": 0,
            "NULL": null,
        }))
        .unwrap();

        let prices = parse_price_map(body);
        assert_eq!(prices.len(), 2);
        assert_eq!(prices[&AssetId::from("BTC")], dec!(64000.50));
        assert_eq!(prices[&AssetId::from("ETH")], dec!(3100.25));
    }

    #[tokio::test]
    async fn test_http_cache_builds_prices_url() {
        let cache = HttpPriceCache::new("https://api.example.com/", Duration::from_secs(60)).unwrap();
        assert_eq!(cache.prices_url().as_str(), "https://api.example.com/prices");
        assert!(cache.is_stale());

        assert!(HttpPriceCache::new("not a url", Duration::from_secs(60)).is_err());
    }
}
