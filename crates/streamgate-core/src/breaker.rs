//! Per-provider distributed circuit breakers.
//!
//! One breaker per provider name, stored as a serialized record in the
//! shared store. Every transition is a single atomic store operation: a
//! compare-and-swap on the serialized record, so concurrent gateways
//! agree on state. Half-open probing is gated by a short lease and only
//! the caller that wins the swap probes. When the store is unreachable
//! the breaker fails open (treated as closed) with a warning.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::BreakerConfig;
use crate::store::SharedStore;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls are rejected until the cooldown elapses.
    Open,
    /// One probe call is allowed to test recovery.
    HalfOpen,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct BreakerRecord {
    state: CircuitState,
    failures: u32,
    window_start: i64,
    opened_at: i64,
    probe_until: i64,
}

impl BreakerRecord {
    fn closed(now: i64) -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            window_start: now,
            opened_at: 0,
            probe_until: 0,
        }
    }
}

/// Pure transition applied on a recorded failure.
fn record_failure(record: &BreakerRecord, now: i64, config: &BreakerConfig) -> BreakerRecord {
    match record.state {
        // A failed probe reopens the circuit and restarts the cooldown.
        CircuitState::HalfOpen => BreakerRecord {
            state: CircuitState::Open,
            failures: record.failures.saturating_add(1),
            window_start: record.window_start,
            opened_at: now,
            probe_until: 0,
        },
        CircuitState::Open => BreakerRecord {
            failures: record.failures.saturating_add(1),
            ..record.clone()
        },
        CircuitState::Closed => {
            let window_elapsed =
                now - record.window_start >= config.window_seconds as i64;
            let failures = if window_elapsed {
                1
            } else {
                record.failures.saturating_add(1)
            };
            let window_start = if window_elapsed {
                now
            } else {
                record.window_start
            };

            if failures >= config.failure_threshold {
                BreakerRecord {
                    state: CircuitState::Open,
                    failures,
                    window_start,
                    opened_at: now,
                    probe_until: 0,
                }
            } else {
                BreakerRecord {
                    state: CircuitState::Closed,
                    failures,
                    window_start,
                    opened_at: 0,
                    probe_until: 0,
                }
            }
        }
    }
}

fn breaker_key(name: &str) -> String {
    format!("breaker:{name}")
}

/// Registry of per-provider circuit breakers.
pub struct CircuitBreakerRegistry {
    store: Arc<dyn SharedStore>,
    config: BreakerConfig,
}

impl CircuitBreakerRegistry {
    /// Create a registry over the shared store.
    pub fn new(store: Arc<dyn SharedStore>, config: BreakerConfig) -> Self {
        Self { store, config }
    }

    async fn fetch(&self, name: &str) -> Option<(String, BreakerRecord)> {
        let raw = match self.store.get(&breaker_key(name)).await {
            Ok(raw) => raw?,
            Err(err) => {
                tracing::warn!(
                    provider = %name,
                    error = %err,
                    "breaker state unavailable; failing open",
                );
                return None;
            }
        };
        match serde_json::from_str::<BreakerRecord>(&raw) {
            Ok(record) => Some((raw, record)),
            Err(err) => {
                tracing::warn!(provider = %name, error = %err, "discarding bad breaker record");
                None
            }
        }
    }

    /// Gate a call to the named provider.
    ///
    /// Returns `true` when the call may proceed: the circuit is closed,
    /// absent, or this caller won the half-open probe lease.
    pub async fn before(&self, name: &str) -> bool {
        let now = chrono::Utc::now().timestamp();
        let Some((raw, record)) = self.fetch(name).await else {
            return true;
        };

        match record.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if now - record.opened_at < self.config.cooldown_seconds as i64 {
                    return false;
                }
                self.try_claim_probe(name, &raw, &record, now).await
            }
            CircuitState::HalfOpen => {
                if now < record.probe_until {
                    // A probe is already in flight somewhere in the fleet.
                    return false;
                }
                self.try_claim_probe(name, &raw, &record, now).await
            }
        }
    }

    async fn try_claim_probe(
        &self,
        name: &str,
        raw: &str,
        record: &BreakerRecord,
        now: i64,
    ) -> bool {
        let probe = BreakerRecord {
            state: CircuitState::HalfOpen,
            probe_until: now + self.config.probe_lease_seconds as i64,
            ..record.clone()
        };
        let next = serde_json::to_string(&probe).expect("serialize breaker record");
        match self
            .store
            .compare_and_swap(&breaker_key(name), Some(raw), &next, None)
            .await
        {
            Ok(true) => {
                tracing::info!(provider = %name, "circuit half-open; probing");
                true
            }
            Ok(false) => false,
            Err(err) => {
                tracing::warn!(provider = %name, error = %err, "breaker CAS failed; failing open");
                true
            }
        }
    }

    /// Record a successful call: the circuit closes and counters reset.
    pub async fn on_success(&self, name: &str) {
        let now = chrono::Utc::now().timestamp();
        let was = self.current_state(name).await;
        let next = serde_json::to_string(&BreakerRecord::closed(now))
            .expect("serialize breaker record");
        if let Err(err) = self.store.set(&breaker_key(name), &next, None).await {
            tracing::warn!(provider = %name, error = %err, "failed to close breaker");
            return;
        }
        if was != CircuitState::Closed {
            tracing::info!(provider = %name, "circuit closed");
        }
    }

    /// Record a failed call; the circuit opens at the failure threshold.
    pub async fn on_failure(&self, name: &str) {
        let now = chrono::Utc::now().timestamp();

        for _ in 0..3 {
            let (expected, record) = match self.fetch(name).await {
                Some((raw, record)) => (Some(raw), record),
                None => (None, BreakerRecord::closed(now)),
            };
            let next = record_failure(&record, now, &self.config);
            let opened = next.state == CircuitState::Open && record.state != CircuitState::Open;
            let serialized = serde_json::to_string(&next).expect("serialize breaker record");

            match self
                .store
                .compare_and_swap(&breaker_key(name), expected.as_deref(), &serialized, None)
                .await
            {
                Ok(true) => {
                    if opened {
                        tracing::warn!(
                            provider = %name,
                            failures = next.failures,
                            cooldown_secs = self.config.cooldown_seconds,
                            "circuit opened",
                        );
                    }
                    return;
                }
                Ok(false) => continue,
                Err(err) => {
                    tracing::warn!(provider = %name, error = %err, "failed to record breaker failure");
                    return;
                }
            }
        }

        tracing::warn!(provider = %name, "breaker failure update lost to contention");
    }

    /// The state a caller would observe right now.
    ///
    /// An open circuit whose cooldown has elapsed reports half-open,
    /// since the next `before` may claim the probe.
    pub async fn current_state(&self, name: &str) -> CircuitState {
        let now = chrono::Utc::now().timestamp();
        let Some((_, record)) = self.fetch(name).await else {
            return CircuitState::Closed;
        };
        match record.state {
            CircuitState::Open
                if now - record.opened_at >= self.config.cooldown_seconds as i64 =>
            {
                CircuitState::HalfOpen
            }
            state => state,
        }
    }
}
