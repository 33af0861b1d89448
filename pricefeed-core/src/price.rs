//! Price update events

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::asset::AssetId;
use crate::error::{FeedError, FeedResult};

/// A single observed price for one asset
///
/// Produced by either the push channel or the fallback poller. On the first
/// observation of an asset `previous_price` equals `price`, so consumers never
/// see a spurious change the first time an asset shows up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceUpdate {
    pub asset_id: AssetId,
    pub price: Decimal,
    pub previous_price: Decimal,
    pub observed_at_millis: i64,
}

impl PriceUpdate {
    /// Create an update, rejecting non-positive prices
    pub fn new(
        asset_id: AssetId,
        price: Decimal,
        previous_price: Decimal,
        observed_at_millis: i64,
    ) -> FeedResult<Self> {
        if price <= Decimal::ZERO {
            return Err(FeedError::invalid_price(asset_id.as_str(), price));
        }
        if previous_price <= Decimal::ZERO {
            return Err(FeedError::invalid_price(asset_id.as_str(), previous_price));
        }
        Ok(Self {
            asset_id,
            price,
            previous_price,
            observed_at_millis,
        })
    }

    /// Update for an asset that has never been observed before
    pub fn first_observation(
        asset_id: AssetId,
        price: Decimal,
        observed_at_millis: i64,
    ) -> FeedResult<Self> {
        Self::new(asset_id, price, price, observed_at_millis)
    }

    /// Update following a previously observed price (if any)
    pub fn following(
        asset_id: AssetId,
        price: Decimal,
        previous_price: Option<Decimal>,
        observed_at_millis: i64,
    ) -> FeedResult<Self> {
        Self::new(
            asset_id,
            price,
            previous_price.unwrap_or(price),
            observed_at_millis,
        )
    }

    pub fn change(&self) -> Decimal {
        self.price - self.previous_price
    }

    /// Percentage change against the previous price
    pub fn change_percent(&self) -> Decimal {
        // previous_price is validated positive
        (self.change() / self.previous_price) * Decimal::ONE_HUNDRED
    }

    pub fn is_unchanged(&self) -> bool {
        self.price == self.previous_price
    }
}

/// Current wall-clock time in epoch milliseconds
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_first_observation_has_no_change() {
        let update = PriceUpdate::first_observation("BTC".into(), dec!(64000.5), 1).unwrap();
        assert_eq!(update.previous_price, update.price);
        assert!(update.is_unchanged());
        assert_eq!(update.change(), Decimal::ZERO);
    }

    #[test]
    fn test_following_uses_previous_when_known() {
        let update =
            PriceUpdate::following("ETH".into(), dec!(110), Some(dec!(100)), 5).unwrap();
        assert_eq!(update.change(), dec!(10));
        assert_eq!(update.change_percent(), dec!(10));

        let first = PriceUpdate::following("ETH".into(), dec!(110), None, 5).unwrap();
        assert_eq!(first.previous_price, dec!(110));
    }

    #[test]
    fn test_rejects_non_positive_prices() {
        assert!(PriceUpdate::first_observation("BTC".into(), Decimal::ZERO, 1).is_err());
        assert!(PriceUpdate::first_observation("BTC".into(), dec!(-1), 1).is_err());
        assert!(PriceUpdate::new("BTC".into(), dec!(1), dec!(0), 1).is_err());
    }
}
