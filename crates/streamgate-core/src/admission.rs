//! Admission-layer overload defense.
//!
//! Two layers sit in front of the pool coordinator: a non-blocking
//! token-bucket load shedder, and a backpressure-aware append that
//! backs off while the failover stream is near its depth ceiling.
//! Admission is idempotent per thread identifier so a repeated check
//! for the same request never double-counts.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::config::{LoadShedConfig, QueueConfig};
use crate::error::GatewayError;
use crate::store::SharedStore;

/// Base delay for backpressure retries.
const BACKOFF_BASE: Duration = Duration::from_millis(100);
/// Maximum backpressure append attempts.
const BACKOFF_ATTEMPTS: u32 = 5;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket load shedder.
pub struct LoadShedder {
    config: LoadShedConfig,
    bucket: Mutex<Bucket>,
    admitted: Mutex<HashSet<String>>,
}

impl LoadShedder {
    /// Create a shedder sized for `max_in_flight` requests per second.
    pub fn new(config: LoadShedConfig) -> Self {
        let tokens = f64::from(config.max_in_flight);
        Self {
            config,
            bucket: Mutex::new(Bucket {
                tokens,
                last_refill: Instant::now(),
            }),
            admitted: Mutex::new(HashSet::new()),
        }
    }

    /// Non-blocking admission check.
    ///
    /// Returns `false` when the bucket is empty. Re-checking an already
    /// admitted thread identifier consumes nothing and always passes.
    pub fn accept(&self, thread_id: &str) -> bool {
        if !self.config.enabled {
            return true;
        }

        {
            let admitted = self.admitted.lock().expect("admitted lock");
            if admitted.contains(thread_id) {
                return true;
            }
        }

        let mut bucket = self.bucket.lock().expect("bucket lock");
        let capacity = f64::from(self.config.max_in_flight);
        let elapsed = bucket.last_refill.elapsed().as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * capacity).min(capacity);
        bucket.last_refill = Instant::now();

        if bucket.tokens < 1.0 {
            tracing::debug!(thread_id = %thread_id, "load shedder rejected request");
            return false;
        }
        bucket.tokens -= 1.0;
        drop(bucket);

        self.admitted
            .lock()
            .expect("admitted lock")
            .insert(thread_id.to_string());
        true
    }

    /// Forget a thread identifier once its request finishes.
    pub fn release(&self, thread_id: &str) {
        self.admitted.lock().expect("admitted lock").remove(thread_id);
    }
}

/// Backpressure-aware producer side of the failover stream.
pub struct BackpressureGate {
    config: QueueConfig,
}

impl BackpressureGate {
    /// Create a gate with the configured depth ceiling and ratio.
    pub fn new(config: QueueConfig) -> Self {
        Self { config }
    }

    /// Append to the stream, retrying with exponential backoff while
    /// the depth is at or above the backpressure threshold.
    ///
    /// Delays are `100ms * 2^attempt` with ±25% jitter, five attempts
    /// in total; a still-full stream fails with `queue_full`.
    pub async fn append(
        &self,
        store: &dyn SharedStore,
        stream: &str,
        payload: &str,
    ) -> Result<String, GatewayError> {
        #[allow(clippy::cast_precision_loss)]
        let threshold =
            (self.config.max_depth as f64 * self.config.backpressure_threshold_ratio) as u64;

        for attempt in 0..BACKOFF_ATTEMPTS {
            let depth = match store.stream_len(stream).await {
                Ok(depth) => depth,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to read stream depth");
                    0
                }
            };

            if depth < threshold.max(1) {
                return store
                    .stream_append(stream, payload, self.config.max_depth)
                    .await
                    .map_err(|err| {
                        tracing::error!(error = %err, "failover enqueue failed");
                        GatewayError::Internal {
                            message: "failed to enqueue failover job".to_string(),
                        }
                    });
            }

            if attempt + 1 == BACKOFF_ATTEMPTS {
                break;
            }

            let backoff = BACKOFF_BASE * 2u32.pow(attempt);
            let jitter = rand::thread_rng().gen_range(0.75..=1.25);
            let delay = backoff.mul_f64(jitter);
            tracing::debug!(
                depth,
                threshold,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "failover stream near capacity; backing off",
            );
            tokio::time::sleep(delay).await;
        }

        Err(GatewayError::QueueFull)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, SharedStore};
    use std::sync::Arc;

    fn shedder(max_in_flight: u32) -> LoadShedder {
        LoadShedder::new(LoadShedConfig {
            enabled: true,
            max_in_flight,
        })
    }

    #[test]
    fn disabled_shedder_accepts_everything() {
        let shedder = LoadShedder::new(LoadShedConfig {
            enabled: false,
            max_in_flight: 0,
        });
        for i in 0..100 {
            assert!(shedder.accept(&format!("t-{i}")));
        }
    }

    #[test]
    fn empty_bucket_rejects() {
        let shedder = shedder(2);
        assert!(shedder.accept("t-0"));
        assert!(shedder.accept("t-1"));
        assert!(!shedder.accept("t-2"));
    }

    #[test]
    fn repeat_admission_is_idempotent() {
        let shedder = shedder(1);
        assert!(shedder.accept("t-0"));
        // Re-checking the same request consumes no token.
        assert!(shedder.accept("t-0"));
        assert!(!shedder.accept("t-1"));
    }

    #[test]
    fn release_forgets_the_thread() {
        let shedder = shedder(1);
        assert!(shedder.accept("t-0"));
        shedder.release("t-0");
        // A fresh check for the same id now needs (and lacks) a token.
        assert!(!shedder.accept("t-0"));
    }

    #[tokio::test]
    async fn bucket_refills_over_time() {
        let shedder = shedder(10);
        for i in 0..10 {
            assert!(shedder.accept(&format!("a-{i}")));
        }
        assert!(!shedder.accept("b-0"));

        tokio::time::sleep(Duration::from_millis(250)).await;
        // ~2.5 tokens refilled at 10/s.
        assert!(shedder.accept("b-1"));
    }

    fn queue_config(max_depth: u64, ratio: f64) -> QueueConfig {
        QueueConfig {
            max_depth,
            backpressure_threshold_ratio: ratio,
            ..QueueConfig::default()
        }
    }

    #[tokio::test]
    async fn append_below_threshold_is_immediate() {
        let store = Arc::new(MemoryStore::new());
        let gate = BackpressureGate::new(queue_config(100, 0.8));

        let id = gate
            .append(store.as_ref(), "jobs", "payload")
            .await
            .expect("append");
        assert!(!id.is_empty());
        assert_eq!(store.stream_len("jobs").await.expect("len"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn append_above_threshold_retries_then_fails() {
        let store = Arc::new(MemoryStore::new());
        // Threshold is 4 entries (5 * 0.8); fill past it.
        for i in 0..5 {
            store
                .stream_append("jobs", &format!("j-{i}"), 100)
                .await
                .expect("seed");
        }

        let gate = BackpressureGate::new(queue_config(5, 0.8));
        let err = gate
            .append(store.as_ref(), "jobs", "overflow")
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::QueueFull));
    }

}
