//! Two-tier response cache.
//!
//! L1 is an in-process LRU; L2 is the shared store with a TTL. Reads go
//! L1 → L2 (populating L1 on an L2 hit); writes go to both, and L2
//! failures are logged without invalidating L1. A per-key single-flight
//! registry lets concurrent misses for the same key share one provider
//! call within a process.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lru::LruCache;
use sha2::{Digest, Sha256};
use tokio::sync::watch;

use crate::error::StoreError;
use crate::request::GenerationParams;
use crate::store::SharedStore;

const L2_KEY_PREFIX: &str = "cache:";

/// Deterministic cache key over the inputs that affect a response.
///
/// The query is lowercased and whitespace-collapsed so requests that
/// differ only in spacing share a key; model, provider, and generation
/// parameters keep distinct keys distinct.
pub fn fingerprint(
    query: &str,
    model: &str,
    provider: Option<&str>,
    params: &GenerationParams,
) -> String {
    let normalized: String = query
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");

    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hasher.update([0]);
    hasher.update(model.as_bytes());
    hasher.update([0]);
    hasher.update(provider.unwrap_or("-").as_bytes());
    hasher.update([0]);
    hasher.update(params.max_tokens.to_le_bytes());
    hasher.update(params.temperature.to_le_bytes());
    hex::encode(hasher.finalize())
}

/// Counters for cache effectiveness.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct CacheStats {
    /// Reads answered from the in-process tier.
    pub l1_hits: u64,
    /// Reads answered from the shared tier.
    pub l2_hits: u64,
    /// Reads answered by neither tier.
    pub misses: u64,
}

impl CacheStats {
    /// Fraction of reads answered by either tier.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.l1_hits + self.l2_hits;
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// Result published to single-flight subscribers.
type FlightResult = Result<String, String>;

type FlightMap = Mutex<HashMap<String, watch::Receiver<Option<FlightResult>>>>;

/// Outcome of joining the single-flight registry for a key.
pub enum Flight {
    /// This caller computes the value and must publish through the guard.
    Leader(FlightGuard),
    /// Another caller is already computing; await its result.
    Follower(FlightWaiter),
}

/// Held by the computing caller; publishes the result to subscribers.
///
/// Dropping the guard without publishing reports the flight as
/// abandoned, so subscribers retry on their own instead of hanging.
pub struct FlightGuard {
    key: String,
    registry: Arc<FlightMap>,
    tx: watch::Sender<Option<FlightResult>>,
    published: bool,
}

impl FlightGuard {
    /// Publish the computed value (or failure) to all subscribers.
    pub fn publish(mut self, result: FlightResult) {
        let _ = self.tx.send(Some(result));
        self.published = true;
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if !self.published {
            let _ = self.tx.send(Some(Err("flight abandoned".to_string())));
        }
        self.registry
            .lock()
            .expect("flight registry lock")
            .remove(&self.key);
    }
}

/// Awaits a leader's published result.
pub struct FlightWaiter {
    rx: watch::Receiver<Option<FlightResult>>,
}

impl FlightWaiter {
    /// Wait up to `timeout` for the leader's result.
    ///
    /// Returns `None` on timeout or when the leader abandoned the
    /// flight; the caller then computes on its own.
    pub async fn wait(mut self, timeout: Duration) -> Option<String> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Some(result) = self.rx.borrow().clone() {
                return result.ok();
            }
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            match tokio::time::timeout(remaining, self.rx.changed()).await {
                Ok(Ok(())) => continue,
                // Leader dropped without publishing, or deadline passed.
                Ok(Err(_)) | Err(_) => return None,
            }
        }
    }
}

/// The two-tier cache.
pub struct TieredCache {
    l1: Mutex<LruCache<String, String>>,
    store: Arc<dyn SharedStore>,
    ttl: Duration,
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    misses: AtomicU64,
    flights: Arc<FlightMap>,
}

impl TieredCache {
    /// Create a cache over the shared store.
    pub fn new(store: Arc<dyn SharedStore>, l1_max_size: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(l1_max_size.max(1)).expect("nonzero capacity");
        Self {
            l1: Mutex::new(LruCache::new(capacity)),
            store,
            ttl,
            l1_hits: AtomicU64::new(0),
            l2_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            flights: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Read through both tiers. L2 failures are treated as misses.
    pub async fn get(&self, key: &str) -> Option<String> {
        if let Some(value) = self.l1.lock().expect("l1 lock").get(key).cloned() {
            self.l1_hits.fetch_add(1, Ordering::Relaxed);
            return Some(value);
        }

        match self.store.get(&l2_key(key)).await {
            Ok(Some(value)) => {
                self.l2_hits.fetch_add(1, Ordering::Relaxed);
                self.l1
                    .lock()
                    .expect("l1 lock")
                    .put(key.to_string(), value.clone());
                Some(value)
            }
            Ok(None) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(err) => {
                tracing::warn!(error = %err, "L2 cache read failed; treating as miss");
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Write through both tiers. Best-effort: an L2 failure is logged
    /// and does not invalidate the L1 write.
    pub async fn set(&self, key: &str, value: &str) {
        self.l1
            .lock()
            .expect("l1 lock")
            .put(key.to_string(), value.to_string());

        if let Err(err) = self
            .store
            .set(&l2_key(key), value, Some(self.ttl))
            .await
        {
            tracing::warn!(error = %err, "L2 cache write failed");
        }
    }

    /// Drop a key from both tiers.
    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.l1.lock().expect("l1 lock").pop(key);
        self.store.delete(&l2_key(key)).await
    }

    /// Join the single-flight registry for a key.
    ///
    /// At most one in-flight entry exists per key per process. The
    /// registry lock is held only to register or look up the handle,
    /// never across the computation itself.
    pub fn join_flight(&self, key: &str) -> Flight {
        let mut flights = self.flights.lock().expect("flight registry lock");
        if let Some(rx) = flights.get(key) {
            return Flight::Follower(FlightWaiter { rx: rx.clone() });
        }

        let (tx, rx) = watch::channel(None);
        flights.insert(key.to_string(), rx);
        Flight::Leader(FlightGuard {
            key: key.to_string(),
            registry: Arc::clone(&self.flights),
            tx,
            published: false,
        })
    }

    /// Miss-then-compute-then-populate with single-flight de-duplication.
    ///
    /// The first caller for a key runs `compute`; concurrent callers for
    /// the same key subscribe and receive the same value. If the leader
    /// fails, a subscriber falls back to computing on its own.
    pub async fn get_or_compute<F, Fut, E>(
        &self,
        key: &str,
        wait_timeout: Duration,
        compute: F,
    ) -> Result<String, E>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<String, E>>,
    {
        if let Some(value) = self.get(key).await {
            return Ok(value);
        }

        match self.join_flight(key) {
            Flight::Leader(guard) => match compute().await {
                Ok(value) => {
                    self.set(key, &value).await;
                    guard.publish(Ok(value.clone()));
                    Ok(value)
                }
                Err(err) => {
                    guard.publish(Err("computation failed".to_string()));
                    Err(err)
                }
            },
            Flight::Follower(waiter) => {
                if let Some(value) = waiter.wait(wait_timeout).await {
                    return Ok(value);
                }
                // Leader failed or timed out; compute independently.
                let value = compute().await?;
                self.set(key, &value).await;
                Ok(value)
            }
        }
    }

    /// Current hit/miss counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            l1_hits: self.l1_hits.load(Ordering::Relaxed),
            l2_hits: self.l2_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Number of entries currently in L1.
    pub fn l1_len(&self) -> usize {
        self.l1.lock().expect("l1 lock").len()
    }
}

fn l2_key(key: &str) -> String {
    format!("{L2_KEY_PREFIX}{key}")
}
