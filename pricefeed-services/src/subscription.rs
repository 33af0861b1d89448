//! Subscription manager for screen interest sets
//!
//! Tracks which assets each consumer (screen) cares about and derives the
//! effective upstream set: the union of every consumer's assets.

use std::collections::{BTreeSet, HashMap};

use parking_lot::RwLock;
use tracing::debug;

use pricefeed_core::AssetId;

/// Change to the effective upstream set caused by one mutation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionDelta {
    /// Ids that joined the union
    pub added: BTreeSet<AssetId>,
    /// Ids that left the union
    pub removed: BTreeSet<AssetId>,
}

impl SubscriptionDelta {
    fn between(before: &BTreeSet<AssetId>, after: &BTreeSet<AssetId>) -> Self {
        Self {
            added: after.difference(before).cloned().collect(),
            removed: before.difference(after).cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    pub fn added_ids(&self) -> Vec<AssetId> {
        self.added.iter().cloned().collect()
    }

    pub fn removed_ids(&self) -> Vec<AssetId> {
        self.removed.iter().cloned().collect()
    }
}

/// Interest sets keyed by consumer id
///
/// All state sits behind one lock, so readers never observe a half-applied
/// mutation and every returned delta matches the union before and after it.
#[derive(Debug, Default)]
pub struct SubscriptionManager {
    interests: RwLock<HashMap<String, BTreeSet<AssetId>>>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace `consumer`'s interest set with `asset_ids`
    ///
    /// An empty set removes the consumer.
    pub fn subscribe<I>(&self, consumer: &str, asset_ids: I) -> SubscriptionDelta
    where
        I: IntoIterator<Item = AssetId>,
    {
        let assets: BTreeSet<AssetId> = asset_ids.into_iter().collect();
        let mut interests = self.interests.write();

        let before = union_of(&interests);
        if assets.is_empty() {
            interests.remove(consumer);
        } else {
            interests.insert(consumer.to_string(), assets);
        }
        let after = union_of(&interests);

        let delta = SubscriptionDelta::between(&before, &after);
        debug!(
            "Consumer {} subscribed, +{} -{} upstream ({} total)",
            consumer,
            delta.added.len(),
            delta.removed.len(),
            after.len()
        );
        delta
    }

    /// Remove `consumer` and all of its interests
    pub fn unsubscribe(&self, consumer: &str) -> SubscriptionDelta {
        let mut interests = self.interests.write();

        let before = union_of(&interests);
        if interests.remove(consumer).is_none() {
            return SubscriptionDelta::default();
        }
        let after = union_of(&interests);

        let delta = SubscriptionDelta::between(&before, &after);
        debug!(
            "Consumer {} unsubscribed, -{} upstream ({} total)",
            consumer,
            delta.removed.len(),
            after.len()
        );
        delta
    }

    /// Union of every consumer's interest set
    pub fn effective_upstream_set(&self) -> BTreeSet<AssetId> {
        union_of(&self.interests.read())
    }

    pub fn consumer_count(&self) -> usize {
        self.interests.read().len()
    }
}

fn union_of(interests: &HashMap<String, BTreeSet<AssetId>>) -> BTreeSet<AssetId> {
    interests.values().flatten().cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pricefeed_core::asset_ids;

    fn set(ids: &[&str]) -> BTreeSet<AssetId> {
        ids.iter().map(|id| AssetId::from(*id)).collect()
    }

    #[test]
    fn test_union_across_consumers() {
        let manager = SubscriptionManager::new();
        manager.subscribe("list", asset_ids(["BTC", "ETH"]));
        manager.subscribe("detail", asset_ids(["BTC", "SOL"]));

        assert_eq!(manager.effective_upstream_set(), set(&["BTC", "ETH", "SOL"]));
        assert_eq!(manager.consumer_count(), 2);
    }

    #[test]
    fn test_subscribe_replaces_previous_set() {
        let manager = SubscriptionManager::new();
        manager.subscribe("list", asset_ids(["BTC", "ETH"]));

        let delta = manager.subscribe("list", asset_ids(["ETH", "SOL"]));
        assert_eq!(delta.added, set(&["SOL"]));
        assert_eq!(delta.removed, set(&["BTC"]));
        assert_eq!(manager.effective_upstream_set(), set(&["ETH", "SOL"]));
    }

    #[test]
    fn test_shared_asset_produces_no_delta() {
        let manager = SubscriptionManager::new();
        let first = manager.subscribe("list", asset_ids(["BTC", "ETH"]));
        assert_eq!(first.added, set(&["BTC", "ETH"]));

        let second = manager.subscribe("detail", asset_ids(["BTC"]));
        assert!(second.is_empty());
    }

    #[test]
    fn test_unsubscribe_keeps_assets_held_elsewhere() {
        let manager = SubscriptionManager::new();
        manager.subscribe("list", asset_ids(["BTC", "ETH"]));
        manager.subscribe("detail", asset_ids(["BTC"]));

        let delta = manager.unsubscribe("list");
        assert!(delta.added.is_empty());
        assert_eq!(delta.removed, set(&["ETH"]));
        assert_eq!(manager.effective_upstream_set(), set(&["BTC"]));
    }

    #[test]
    fn test_unsubscribe_unknown_consumer_is_noop() {
        let manager = SubscriptionManager::new();
        manager.subscribe("list", asset_ids(["BTC"]));

        assert!(manager.unsubscribe("nobody").is_empty());
        assert_eq!(manager.effective_upstream_set(), set(&["BTC"]));
    }

    #[test]
    fn test_empty_subscribe_removes_consumer() {
        let manager = SubscriptionManager::new();
        manager.subscribe("list", asset_ids(["BTC"]));

        let delta = manager.subscribe("list", Vec::new());
        assert_eq!(delta.removed, set(&["BTC"]));
        assert_eq!(manager.consumer_count(), 0);
        assert!(manager.effective_upstream_set().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_mutations_keep_union_consistent() {
        const POOL: [&str; 5] = ["BTC", "ETH", "SOL", "DOGE", "ADA"];
        let manager = std::sync::Arc::new(SubscriptionManager::new());

        let tasks: Vec<_> = (0..8usize)
            .map(|i| {
                let manager = std::sync::Arc::clone(&manager);
                tokio::spawn(async move {
                    let consumer = format!("screen-{}", i);
                    let mut deltas = Vec::new();
                    for round in 0..50 {
                        let ids = [POOL[(i + round) % POOL.len()], POOL[(i + round + 1) % POOL.len()]];
                        deltas.push(manager.subscribe(&consumer, asset_ids(ids)));
                        if round % 3 == 0 {
                            deltas.push(manager.unsubscribe(&consumer));
                        }
                        tokio::task::yield_now().await;
                    }
                    // Odd screens end up empty
                    if i % 2 == 1 {
                        deltas.push(manager.unsubscribe(&consumer));
                    }
                    deltas
                })
            })
            .collect();

        let mut deltas = Vec::new();
        for task in tasks {
            deltas.extend(task.await.unwrap());
        }

        // Even screens finish on round 49's pair
        let expected: BTreeSet<AssetId> = (0..8usize)
            .filter(|i| i % 2 == 0)
            .flat_map(|i| [POOL[(i + 49) % POOL.len()], POOL[(i + 50) % POOL.len()]])
            .map(AssetId::from)
            .collect();
        assert_eq!(manager.effective_upstream_set(), expected);

        // Every union transition was reported exactly once
        for id in POOL {
            let id = AssetId::from(id);
            let added = deltas.iter().filter(|d| d.added.contains(&id)).count() as i64;
            let removed = deltas.iter().filter(|d| d.removed.contains(&id)).count() as i64;
            assert_eq!(added - removed, i64::from(expected.contains(&id)), "{}", id);
        }
    }

    #[test]
    fn test_union_matches_model_over_sequence() {
        let manager = SubscriptionManager::new();
        let mut model: HashMap<&str, BTreeSet<AssetId>> = HashMap::new();

        let steps: &[(&str, Option<&[&str]>)] = &[
            ("a", Some(&["BTC", "ETH"])),
            ("b", Some(&["ETH"])),
            ("c", Some(&["SOL", "BTC"])),
            ("a", None),
            ("b", Some(&["DOGE"])),
            ("c", Some(&[])),
            ("a", Some(&["ETH"])),
            ("b", None),
        ];

        for &(consumer, ids) in steps {
            let before = manager.effective_upstream_set();
            let delta = match ids {
                Some(ids) => {
                    let assets = set(ids);
                    if assets.is_empty() {
                        model.remove(consumer);
                    } else {
                        model.insert(consumer, assets.clone());
                    }
                    manager.subscribe(consumer, assets)
                }
                None => {
                    model.remove(consumer);
                    manager.unsubscribe(consumer)
                }
            };

            let expected: BTreeSet<AssetId> = model.values().flatten().cloned().collect();
            let after = manager.effective_upstream_set();
            assert_eq!(after, expected);
            assert_eq!(delta, SubscriptionDelta::between(&before, &after));
        }
    }
}
