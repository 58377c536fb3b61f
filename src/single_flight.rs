// Per-key coalescing of cache-miss loads
// The first miss for a key starts the load; concurrent misses for the same key
// await that same future instead of hitting the document store again.

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::error::CatalogError;

type Flight<T> = Shared<BoxFuture<'static, Result<T, CatalogError>>>;

pub struct SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    calls: Arc<Mutex<HashMap<String, (u64, Flight<T>)>>>,
    next_id: AtomicU64,
    coalesced: AtomicUsize,
}

impl<T> Default for SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

// Removes the leader's entry once it finishes or is dropped mid-flight. Without
// this a cancelled leader would leave a finished future behind that every later
// miss would reuse.
struct FlightGuard<T>
where
    T: Clone + Send + Sync + 'static,
{
    calls: Arc<Mutex<HashMap<String, (u64, Flight<T>)>>>,
    key: String,
    id: u64,
}

impl<T> Drop for FlightGuard<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        let mut calls = self.calls.lock();
        if calls.get(&self.key).map(|(id, _)| *id) == Some(self.id) {
            calls.remove(&self.key);
        }
    }
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
            coalesced: AtomicUsize::new(0),
        }
    }

    /// Runs `load` for `key` unless a load for the same key is already in
    /// flight, in which case the caller joins it and receives its result.
    pub async fn run<F>(&self, key: &str, load: F) -> Result<T, CatalogError>
    where
        F: Future<Output = Result<T, CatalogError>> + Send + 'static,
    {
        let (flight, guard) = {
            let mut calls = self.calls.lock();
            match calls.get(key) {
                Some((_, flight)) => {
                    self.coalesced.fetch_add(1, Ordering::Relaxed);
                    debug!(cache_key = key, "joining in-flight load");
                    (flight.clone(), None)
                }
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let flight = load.boxed().shared();
                    calls.insert(key.to_string(), (id, flight.clone()));
                    let guard = FlightGuard {
                        calls: Arc::clone(&self.calls),
                        key: key.to_string(),
                        id,
                    };
                    (flight, Some(guard))
                }
            }
        };

        let result = flight.await;
        drop(guard);
        result
    }

    pub fn in_flight(&self) -> usize {
        self.calls.lock().len()
    }

    // Number of callers that joined another caller's load
    pub fn coalesced_count(&self) -> usize {
        self.coalesced.load(Ordering::Relaxed)
    }
}
