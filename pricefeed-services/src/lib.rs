//! Failover services for live price distribution
//!
//! This crate combines the push channel with a polling fallback:
//! per-screen subscription tracking, the price cache seam, the fallback
//! poller, the distributor that switches between sources and the router
//! screens talk to.

pub mod distributor;
pub mod poller;
pub mod price_cache;
pub mod router;
pub mod subscription;

pub use distributor::{DistributorHealth, PriceDistributor};
pub use poller::{FallbackPoller, PollerStats};
pub use price_cache::{HttpPriceCache, InMemoryPriceCache, PriceCache};
pub use router::UpdateRouter;
pub use subscription::{SubscriptionDelta, SubscriptionManager};
