// Invalidation Coordinator
// Translates a semantic description of a write into the cache keys that may now
// be stale and deletes them in one batch.

use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::{debug, error};

use crate::keys::{
    my_orders_key, order_key, product_key, reviews_key, ADMIN_KEYS, ALL_ORDERS_KEY,
    ALL_PRODUCTS_KEY, CATEGORIES_KEY, LATEST_PRODUCTS_KEY,
};
use crate::kv_store::{KeyValueStore, KvError};

// What a write just changed. Built by the write path, consumed once.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvalidationTags {
    pub product: bool,
    pub order: bool,
    pub admin: bool,
    pub review: bool,
    pub product_ids: Vec<String>,
    pub order_id: Option<String>,
    pub user_id: Option<String>,
}

impl InvalidationTags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn product(mut self) -> Self {
        self.product = true;
        self
    }

    pub fn order(mut self) -> Self {
        self.order = true;
        self
    }

    pub fn admin(mut self) -> Self {
        self.admin = true;
        self
    }

    pub fn review(mut self) -> Self {
        self.review = true;
        self
    }

    pub fn product_id(mut self, id: impl Into<String>) -> Self {
        self.product_ids.push(id.into());
        self
    }

    pub fn product_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.product_ids.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn order_id(mut self, id: impl Into<String>) -> Self {
        self.order_id = Some(id.into());
        self
    }

    pub fn user_id(mut self, id: impl Into<String>) -> Self {
        self.user_id = Some(id.into());
        self
    }

    /// Fixed keys named by these tags. Tracked listing keys are added by the
    /// coordinator on top of these when `product` is set.
    ///
    /// A product id always purges both `product-{id}` and `reviews-{id}`:
    /// ratings live on the product and reviews hang off it, so any write
    /// that names a product may have touched either.
    pub fn fixed_keys(&self) -> BTreeSet<String> {
        let mut keys = BTreeSet::new();

        if self.product {
            keys.insert(LATEST_PRODUCTS_KEY.to_string());
            keys.insert(CATEGORIES_KEY.to_string());
            keys.insert(ALL_PRODUCTS_KEY.to_string());
        }

        for id in &self.product_ids {
            keys.insert(product_key(id));
            keys.insert(reviews_key(id));
        }

        if self.order {
            keys.insert(ALL_ORDERS_KEY.to_string());
            if let Some(user_id) = &self.user_id {
                keys.insert(my_orders_key(user_id));
            }
            if let Some(order_id) = &self.order_id {
                keys.insert(order_key(order_id));
            }
        }

        if self.admin {
            keys.extend(ADMIN_KEYS.iter().map(|k| k.to_string()));
        }

        keys
    }
}

/// Live index of listing keys currently held in the cache.
///
/// Each key remembers when it was last filled. Entries older than the fill
/// TTL have already expired in the cache, so they are pruned whenever a new
/// key is recorded rather than waiting for the next product write.
#[derive(Debug)]
pub struct ListingKeyIndex {
    keys: DashMap<String, Instant>,
    ttl: Duration,
}

impl ListingKeyIndex {
    pub fn new(ttl: Duration) -> Self {
        Self {
            keys: DashMap::new(),
            ttl,
        }
    }

    pub fn record(&self, key: &str) {
        self.prune_expired();
        self.keys.insert(key.to_string(), Instant::now());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    // Removes and returns every tracked key
    pub fn drain(&self) -> Vec<String> {
        let keys: Vec<String> = self.keys.iter().map(|k| k.key().clone()).collect();
        for key in &keys {
            self.keys.remove(key);
        }
        keys
    }

    // Puts back keys whose deletion could not be delivered. Their age restarts,
    // which can only keep them longer than needed.
    pub fn restore(&self, keys: impl IntoIterator<Item = String>) {
        let now = Instant::now();
        for key in keys {
            self.keys.insert(key, now);
        }
    }

    fn prune_expired(&self) {
        let ttl = self.ttl;
        self.keys.retain(|_, filled_at| filled_at.elapsed() < ttl);
    }
}

/// Deletes every key a write may have made stale.
///
/// Each invalidation bumps a generation counter while holding the write side
/// of a gate. Cache fills take the read side of the gate and only write if the
/// generation they observed before loading is still current, so a load that
/// raced a write never repopulates a key the write just purged.
pub struct InvalidationCoordinator {
    kv: Arc<dyn KeyValueStore>,
    listing_keys: ListingKeyIndex,
    generation: AtomicU64,
    gate: RwLock<()>,
}

impl InvalidationCoordinator {
    // `listing_ttl` is the expiry listing fills are written with
    pub fn new(kv: Arc<dyn KeyValueStore>, listing_ttl: Duration) -> Self {
        Self {
            kv,
            listing_keys: ListingKeyIndex::new(listing_ttl),
            generation: AtomicU64::new(0),
            gate: RwLock::new(()),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn listing_keys(&self) -> &ListingKeyIndex {
        &self.listing_keys
    }

    // Held by cache fills for the duration of their write
    pub(crate) async fn fill_permit(&self) -> RwLockReadGuard<'_, ()> {
        self.gate.read().await
    }

    /// Deletes all keys named by `tags` in a single batch.
    ///
    /// Returns the number of keys that existed. Deleting absent keys is not an
    /// error, so repeating the same invalidation is harmless. A failed delete
    /// is returned to the caller; drained listing keys go back into the index
    /// so a retry still reaches them.
    pub async fn invalidate(&self, tags: &InvalidationTags) -> Result<usize, KvError> {
        let _gate = self.gate.write().await;
        self.generation.fetch_add(1, Ordering::SeqCst);

        let mut keys: Vec<String> = tags.fixed_keys().into_iter().collect();
        let drained = if tags.product {
            self.listing_keys.drain()
        } else {
            Vec::new()
        };
        keys.extend(drained.iter().cloned());

        if keys.is_empty() {
            return Ok(0);
        }

        match self.kv.delete(&keys).await {
            Ok(removed) => {
                debug!(
                    requested = keys.len(),
                    removed,
                    listing_keys = drained.len(),
                    "cache invalidated"
                );
                Ok(removed)
            }
            Err(e) => {
                self.listing_keys.restore(drained);
                error!(
                    error = %e,
                    keys = ?keys,
                    "cache invalidation failed; entries stay reachable until their TTL"
                );
                Err(e)
            }
        }
    }
}
