// Read-through cache
// A lookup hits the key-value store first; a miss runs the loader once per key
// (concurrent misses coalesce), then writes the encoded result back. Cache
// failures never fail the read: they are logged and treated as a miss.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::codec::{Codec, JsonCodec};
use crate::config::ServiceConfig;
use crate::error::CatalogError;
use crate::invalidation::{InvalidationCoordinator, InvalidationTags};
use crate::kv_store::{KeyValueStore, KvError, TimeoutStore};
use crate::single_flight::SingleFlight;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    // Configured TTL
    Ttl,
    // Written without expiry; only invalidation removes it
    Never,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillPolicy {
    ReadThrough(Expiry),
    // Read-through with TTL, and the key is tracked for bulk invalidation
    Listing,
    // Always recompute and write, never serve from the cache
    Refresh(Expiry),
}

impl FillPolicy {
    fn reads_cache(&self) -> bool {
        !matches!(self, FillPolicy::Refresh(_))
    }

    fn expiry(&self) -> Expiry {
        match self {
            FillPolicy::ReadThrough(expiry) | FillPolicy::Refresh(expiry) => *expiry,
            FillPolicy::Listing => Expiry::Ttl,
        }
    }
}

pub struct ReadThroughCache<C: Codec = JsonCodec> {
    kv: Arc<dyn KeyValueStore>,
    coordinator: Arc<InvalidationCoordinator>,
    codec: C,
    ttl: Duration,
    flights: SingleFlight<Bytes>,
}

impl<C: Codec> ReadThroughCache<C> {
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        coordinator: Arc<InvalidationCoordinator>,
        codec: C,
        ttl: Duration,
    ) -> Self {
        Self {
            kv,
            coordinator,
            codec,
            ttl,
            flights: SingleFlight::new(),
        }
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    pub fn flights(&self) -> &SingleFlight<Bytes> {
        &self.flights
    }

    /// Returns the cached value under `key`, or runs `load` and caches its
    /// result according to `policy`.
    ///
    /// Loader errors are returned unchanged and never cached.
    pub async fn fetch<T, F, Fut>(
        &self,
        key: &str,
        policy: FillPolicy,
        load: F,
    ) -> Result<T, CatalogError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, CatalogError>> + Send + 'static,
    {
        if policy.reads_cache() {
            if let Some(value) = self.lookup(key).await {
                return Ok(value);
            }
        }

        // Loads that began before the latest invalidation are not joined
        let generation = self.coordinator.generation();
        let flight_key = format!("{}@{}", key, generation);

        let fill = Fill {
            kv: Arc::clone(&self.kv),
            coordinator: Arc::clone(&self.coordinator),
            codec: self.codec.clone(),
            ttl: self.ttl,
            key: key.to_string(),
            policy,
            generation,
        };
        let bytes = self.flights.run(&flight_key, fill.run(load)).await?;
        self.codec.decode(&bytes)
    }

    async fn lookup<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.kv.get(key).await {
            Ok(Some(bytes)) => match self.codec.decode(&bytes) {
                Ok(value) => {
                    debug!(cache_key = key, "cache hit");
                    Some(value)
                }
                Err(e) => {
                    warn!(cache_key = key, error = %e, "undecodable cache entry, reloading");
                    None
                }
            },
            Ok(None) => {
                debug!(cache_key = key, "cache miss");
                None
            }
            Err(e) => {
                warn!(cache_key = key, error = %e, "cache read failed, falling back to store");
                None
            }
        }
    }
}

// Owned state of one miss, so the load can outlive the caller that started it
struct Fill<C: Codec> {
    kv: Arc<dyn KeyValueStore>,
    coordinator: Arc<InvalidationCoordinator>,
    codec: C,
    ttl: Duration,
    key: String,
    policy: FillPolicy,
    // Invalidation generation observed before loading
    generation: u64,
}

impl<C: Codec> Fill<C> {
    async fn run<T, F, Fut>(self, load: F) -> Result<Bytes, CatalogError>
    where
        T: Serialize + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, CatalogError>> + Send + 'static,
    {
        let value = load().await?;
        let bytes = self.codec.encode(&value)?;

        let _permit = self.coordinator.fill_permit().await;
        if self.coordinator.generation() != self.generation {
            // An invalidation ran while we were loading; the value may predate it
            debug!(cache_key = %self.key, "skipping fill that raced an invalidation");
            return Ok(bytes);
        }

        match self.write(bytes.clone()).await {
            Ok(()) => {
                if matches!(self.policy, FillPolicy::Listing) {
                    self.coordinator.listing_keys().record(&self.key);
                }
                debug!(cache_key = %self.key, policy = ?self.policy, "cache filled");
            }
            Err(e) => {
                warn!(cache_key = %self.key, error = %e, "cache fill failed");
            }
        }
        Ok(bytes)
    }

    async fn write(&self, bytes: Bytes) -> Result<(), KvError> {
        match self.policy.expiry() {
            Expiry::Ttl => self.kv.set_with_expiry(&self.key, self.ttl, bytes).await,
            Expiry::Never => self.kv.set_no_expiry(&self.key, bytes).await,
        }
    }
}

/// Connection-scoped cache handle injected into the services.
///
/// Owns the key-value client for the lifetime of the process: `connect`
/// at startup, `close` at shutdown.
pub struct CacheContext<C: Codec = JsonCodec> {
    kv: Arc<dyn KeyValueStore>,
    coordinator: Arc<InvalidationCoordinator>,
    cache: Arc<ReadThroughCache<C>>,
}

impl CacheContext<JsonCodec> {
    pub async fn connect(
        backend: Arc<dyn KeyValueStore>,
        config: &ServiceConfig,
    ) -> Result<Self, KvError> {
        Self::connect_with_codec(backend, config, JsonCodec).await
    }
}

impl<C: Codec> CacheContext<C> {
    pub async fn connect_with_codec(
        backend: Arc<dyn KeyValueStore>,
        config: &ServiceConfig,
        codec: C,
    ) -> Result<Self, KvError> {
        let kv: Arc<dyn KeyValueStore> =
            Arc::new(TimeoutStore::new(backend, config.store_timeout()));
        kv.connect().await?;

        let coordinator = Arc::new(InvalidationCoordinator::new(Arc::clone(&kv), config.ttl()));
        let cache = Arc::new(ReadThroughCache::new(
            Arc::clone(&kv),
            Arc::clone(&coordinator),
            codec,
            config.ttl(),
        ));
        debug!(ttl_seconds = config.ttl_seconds, "cache context connected");

        Ok(Self {
            kv,
            coordinator,
            cache,
        })
    }

    pub fn cache(&self) -> Arc<ReadThroughCache<C>> {
        Arc::clone(&self.cache)
    }

    pub fn coordinator(&self) -> Arc<InvalidationCoordinator> {
        Arc::clone(&self.coordinator)
    }

    pub async fn invalidate(&self, tags: &InvalidationTags) -> Result<usize, CatalogError> {
        Ok(self.coordinator.invalidate(tags).await?)
    }

    pub fn tracked_listing_keys(&self) -> usize {
        self.coordinator.listing_keys().len()
    }

    pub async fn close(&self) -> Result<(), KvError> {
        self.kv.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv_store::InMemoryKvStore;
    use futures::future::{BoxFuture, FutureExt};
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn setup() -> (Arc<InMemoryKvStore>, CacheContext) {
        let backend = Arc::new(InMemoryKvStore::new());
        let context = CacheContext::connect(backend.clone(), &ServiceConfig::default())
            .await
            .unwrap();
        (backend, context)
    }

    fn counting_loader(
        calls: &Arc<AtomicUsize>,
        value: Vec<String>,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<Vec<String>, CatalogError>> {
        let calls = Arc::clone(calls);
        move || {
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(value)
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let (backend, context) = setup().await;
        let cache = context.cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let policy = FillPolicy::ReadThrough(Expiry::Ttl);

        let first: Vec<String> = cache
            .fetch("categories", policy, counting_loader(&calls, vec!["home".into()]))
            .await
            .unwrap();
        let second: Vec<String> = cache
            .fetch("categories", policy, counting_loader(&calls, vec!["other".into()]))
            .await
            .unwrap();

        assert_eq!(first, vec!["home".to_string()]);
        assert_eq!(second, first);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(backend.ttl_of("categories"), Some(Some(Duration::from_secs(14400))));
    }

    #[tokio::test]
    async fn test_never_expiry_and_refresh_policy() {
        let (backend, context) = setup().await;
        let cache = context.cache();
        let calls = Arc::new(AtomicUsize::new(0));

        let _: Vec<String> = cache
            .fetch(
                "all-products",
                FillPolicy::ReadThrough(Expiry::Never),
                counting_loader(&calls, vec![]),
            )
            .await
            .unwrap();
        assert_eq!(backend.ttl_of("all-products"), Some(None));

        for _ in 0..3 {
            let _: Vec<String> = cache
                .fetch(
                    "admin-bar-charts",
                    FillPolicy::Refresh(Expiry::Ttl),
                    counting_loader(&calls, vec![]),
                )
                .await
                .unwrap();
        }
        // one fill for all-products, three recomputes for the chart
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(backend.contains_key("admin-bar-charts"));
    }

    #[tokio::test]
    async fn test_fail_open_when_cache_is_down() {
        let (backend, context) = setup().await;
        let cache = context.cache();
        let calls = Arc::new(AtomicUsize::new(0));
        backend.set_available(false);

        for _ in 0..2 {
            let value: Vec<String> = cache
                .fetch(
                    "latest-products",
                    FillPolicy::ReadThrough(Expiry::Ttl),
                    counting_loader(&calls, vec!["p1".into()]),
                )
                .await
                .unwrap();
            assert_eq!(value, vec!["p1".to_string()]);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_slow_cache_is_treated_as_miss() {
        let backend = Arc::new(InMemoryKvStore::new());
        let config = ServiceConfig {
            store_timeout_ms: 10,
            ..ServiceConfig::default()
        };
        let context = CacheContext::connect(backend.clone(), &config).await.unwrap();
        backend.set_latency(Duration::from_millis(100));

        let calls = Arc::new(AtomicUsize::new(0));
        let value: Vec<String> = context
            .cache()
            .fetch(
                "categories",
                FillPolicy::ReadThrough(Expiry::Ttl),
                counting_loader(&calls, vec!["books".into()]),
            )
            .await
            .unwrap();
        assert_eq!(value, vec!["books".to_string()]);
    }

    #[tokio::test]
    async fn test_loader_errors_are_not_cached() {
        let (backend, context) = setup().await;
        let result: Result<Vec<String>, _> = context
            .cache()
            .fetch("product-missing", FillPolicy::ReadThrough(Expiry::Ttl), || async {
                Err(CatalogError::NotFound("product-missing".into()))
            })
            .await;
        assert!(matches!(result, Err(CatalogError::NotFound(_))));
        assert!(!backend.contains_key("product-missing"));
    }

    #[tokio::test]
    async fn test_listing_fill_is_tracked() {
        let (_backend, context) = setup().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let key = "products-_-_-_-_-1";

        let _: Vec<String> = context
            .cache()
            .fetch(key, FillPolicy::Listing, counting_loader(&calls, vec![]))
            .await
            .unwrap();
        assert_eq!(context.tracked_listing_keys(), 1);
    }

    #[tokio::test]
    async fn test_fill_racing_an_invalidation_is_dropped() {
        let (backend, context) = setup().await;
        let cache = context.cache();
        let coordinator = context.coordinator();

        let key = "products-_-_-_-_-1";
        let slow = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache
                    .fetch(key, FillPolicy::Listing, || async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(vec!["stale".to_string()])
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        coordinator
            .invalidate(&InvalidationTags::new().product())
            .await
            .unwrap();

        let served = slow.await.unwrap().unwrap();
        assert_eq!(served, vec!["stale".to_string()]);
        assert!(!backend.contains_key(key));
        assert_eq!(context.tracked_listing_keys(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_misses_load_once() {
        let (_backend, context) = setup().await;
        let cache = context.cache();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for _ in 0..6 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .fetch("admin-stats", FillPolicy::ReadThrough(Expiry::Ttl), move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(40)).await;
                        Ok(vec!["stats".to_string()])
                    })
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), vec!["stats".to_string()]);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_disconnects_backend() {
        let (backend, context) = setup().await;
        context.close().await.unwrap();
        assert!(backend.get("categories").await.is_err());
    }
}
