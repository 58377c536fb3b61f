// Key-Value Store client
// The cache service is a black box reached over async I/O. This module holds the
// client contract, an in-memory backend with TTL expiry and a timeout wrapper that
// bounds every call.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum KvError {
    #[error("Cache unavailable: {0}")]
    Unavailable(String),

    #[error("Cache request timeout after {0}ms")]
    Timeout(u64),
}

// Client contract for the external cache service
#[async_trait]
pub trait KeyValueStore: Send + Sync + 'static {
    async fn connect(&self) -> Result<(), KvError>;

    async fn close(&self) -> Result<(), KvError>;

    // Returns None when the key is absent or its TTL has elapsed
    async fn get(&self, key: &str) -> Result<Option<Bytes>, KvError>;

    async fn set_with_expiry(&self, key: &str, ttl: Duration, value: Bytes)
        -> Result<(), KvError>;

    async fn set_no_expiry(&self, key: &str, value: Bytes) -> Result<(), KvError>;

    // Deleting absent keys is not an error; returns how many keys existed
    async fn delete(&self, keys: &[String]) -> Result<usize, KvError>;
}

// Counters kept by the in-memory backend
#[derive(Debug, Default)]
pub struct KvStats {
    pub items_count: AtomicUsize,
    pub hit_count: AtomicUsize,
    pub miss_count: AtomicUsize,
    pub expired_count: AtomicUsize,
    pub set_count: AtomicUsize,
    pub deleted_count: AtomicUsize,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct KvStatsReport {
    pub items_count: usize,
    pub hit_count: usize,
    pub miss_count: usize,
    pub expired_count: usize,
    pub set_count: usize,
    pub deleted_count: usize,
}

struct StoredValue {
    data: Bytes,
    created_at: Instant,
    ttl: Option<Duration>,
}

impl StoredValue {
    fn is_expired(&self) -> bool {
        match self.ttl {
            Some(ttl) => self.created_at.elapsed() >= ttl,
            None => false,
        }
    }
}

// In-process stand-in for the cache service. Expiry is lazy: an elapsed entry is
// dropped by the lookup that finds it.
pub struct InMemoryKvStore {
    entries: DashMap<String, StoredValue>,
    stats: KvStats,
    connected: AtomicBool,
    available: AtomicBool,
    latency_ms: AtomicU64,
}

impl Default for InMemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            stats: KvStats::default(),
            connected: AtomicBool::new(false),
            available: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
        }
    }

    // Simulate an outage of the cache service
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    // Delay every call by the given amount
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .map(|entry| !entry.is_expired())
            .unwrap_or(false)
    }

    pub fn ttl_of(&self, key: &str) -> Option<Option<Duration>> {
        self.entries.get(key).map(|entry| entry.ttl)
    }

    pub fn stats(&self) -> KvStatsReport {
        KvStatsReport {
            items_count: self.stats.items_count.load(Ordering::SeqCst),
            hit_count: self.stats.hit_count.load(Ordering::SeqCst),
            miss_count: self.stats.miss_count.load(Ordering::SeqCst),
            expired_count: self.stats.expired_count.load(Ordering::SeqCst),
            set_count: self.stats.set_count.load(Ordering::SeqCst),
            deleted_count: self.stats.deleted_count.load(Ordering::SeqCst),
        }
    }

    async fn check_reachable(&self) -> Result<(), KvError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        if !self.connected.load(Ordering::SeqCst) {
            return Err(KvError::Unavailable("client not connected".to_string()));
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(KvError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }

    fn insert(&self, key: &str, value: Bytes, ttl: Option<Duration>) {
        let entry = StoredValue {
            data: value,
            created_at: Instant::now(),
            ttl,
        };
        if self.entries.insert(key.to_string(), entry).is_none() {
            self.stats.items_count.fetch_add(1, Ordering::SeqCst);
        }
        self.stats.set_count.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKvStore {
    async fn connect(&self) -> Result<(), KvError> {
        self.connected.store(true, Ordering::SeqCst);
        debug!("in-memory cache connected");
        Ok(())
    }

    async fn close(&self) -> Result<(), KvError> {
        self.connected.store(false, Ordering::SeqCst);
        debug!("in-memory cache closed");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, KvError> {
        self.check_reachable().await?;

        // Resolve under the shard guard, then mutate after releasing it
        let lookup = self
            .entries
            .get(key)
            .map(|entry| (entry.is_expired(), entry.data.clone()));

        match lookup {
            Some((false, data)) => {
                self.stats.hit_count.fetch_add(1, Ordering::SeqCst);
                Ok(Some(data))
            }
            Some((true, _)) => {
                if self.entries.remove_if(key, |_, v| v.is_expired()).is_some() {
                    self.stats.items_count.fetch_sub(1, Ordering::SeqCst);
                    self.stats.expired_count.fetch_add(1, Ordering::SeqCst);
                }
                self.stats.miss_count.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            }
            None => {
                self.stats.miss_count.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            }
        }
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        ttl: Duration,
        value: Bytes,
    ) -> Result<(), KvError> {
        self.check_reachable().await?;
        self.insert(key, value, Some(ttl));
        Ok(())
    }

    async fn set_no_expiry(&self, key: &str, value: Bytes) -> Result<(), KvError> {
        self.check_reachable().await?;
        self.insert(key, value, None);
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<usize, KvError> {
        self.check_reachable().await?;

        let mut removed = 0;
        for key in keys {
            if self.entries.remove(key).is_some() {
                removed += 1;
                self.stats.items_count.fetch_sub(1, Ordering::SeqCst);
            }
        }
        self.stats.deleted_count.fetch_add(removed, Ordering::SeqCst);
        Ok(removed)
    }
}

// Bounds every call on the wrapped store; an elapsed call becomes KvError::Timeout
pub struct TimeoutStore {
    inner: Arc<dyn KeyValueStore>,
    timeout: Duration,
}

impl TimeoutStore {
    pub fn new(inner: Arc<dyn KeyValueStore>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn bounded<T, F>(&self, call: F) -> Result<T, KvError>
    where
        F: std::future::Future<Output = Result<T, KvError>> + Send,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(KvError::Timeout(self.timeout.as_millis() as u64)),
        }
    }
}

#[async_trait]
impl KeyValueStore for TimeoutStore {
    async fn connect(&self) -> Result<(), KvError> {
        self.bounded(self.inner.connect()).await
    }

    async fn close(&self) -> Result<(), KvError> {
        self.bounded(self.inner.close()).await
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, KvError> {
        self.bounded(self.inner.get(key)).await
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        ttl: Duration,
        value: Bytes,
    ) -> Result<(), KvError> {
        self.bounded(self.inner.set_with_expiry(key, ttl, value))
            .await
    }

    async fn set_no_expiry(&self, key: &str, value: Bytes) -> Result<(), KvError> {
        self.bounded(self.inner.set_no_expiry(key, value)).await
    }

    async fn delete(&self, keys: &[String]) -> Result<usize, KvError> {
        self.bounded(self.inner.delete(keys)).await
    }
}
