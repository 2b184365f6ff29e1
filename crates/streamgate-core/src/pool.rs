//! Distributed connection pool coordinator.
//!
//! Enforces a fleet-wide and a per-user ceiling on concurrent active
//! requests. Every acquire and release is a single atomic batch against
//! the shared store; the global counter is the source of truth and the
//! per-user counter is the fairness guard. When the store is
//! unreachable, acquisition falls back to process-local counters with
//! the same limits — a safety net, not a consistency promise.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::PoolConfig;
use crate::store::{SharedStore, SlotKeys, SlotOutcome, SlotRequest};

const GLOBAL_KEY: &str = "pool:global";
const MEMBERS_KEY: &str = "pool:active";

fn user_key(user_id: &str) -> String {
    format!("pool:user:{user_id}")
}

/// Pool utilization classification, derived purely from the global
/// counter. Transitions are logged but never change admission behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolHealth {
    /// Below the degraded threshold.
    Healthy,
    /// At or above the degraded threshold.
    Degraded,
    /// At or above the critical threshold.
    Critical,
    /// Every slot is taken.
    Exhausted,
}

impl PoolHealth {
    /// Classify a current count against the configured thresholds.
    pub fn classify(current: u64, config: &PoolConfig) -> Self {
        if current >= config.global_max {
            return Self::Exhausted;
        }
        let utilization = current as f64 / config.global_max as f64;
        if utilization >= config.critical_at {
            Self::Critical
        } else if utilization >= config.degraded_at {
            Self::Degraded
        } else {
            Self::Healthy
        }
    }
}

/// Result of a pool acquisition attempt.
pub enum PoolAdmission {
    /// A slot is held; release it through the contained guard.
    Admitted(PoolSlot),
    /// The fleet-wide ceiling is reached.
    GlobalExhausted {
        /// Observed global active count.
        current: u64,
        /// The configured ceiling.
        limit: u64,
    },
    /// The caller's per-user ceiling is reached.
    UserExhausted {
        /// Observed per-user active count.
        current: u64,
        /// The configured ceiling.
        limit: u64,
    },
}

#[derive(Default)]
struct LocalCounters {
    global: u64,
    per_user: HashMap<String, u64>,
    members: HashSet<String>,
}

/// Coordinates slot acquisition and release across the fleet.
pub struct PoolCoordinator {
    store: Arc<dyn SharedStore>,
    config: PoolConfig,
    local: Mutex<LocalCounters>,
    last_health: Mutex<PoolHealth>,
}

impl PoolCoordinator {
    /// Create a coordinator over the shared store.
    pub fn new(store: Arc<dyn SharedStore>, config: PoolConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            config,
            local: Mutex::new(LocalCounters::default()),
            last_health: Mutex::new(PoolHealth::Healthy),
        })
    }

    /// Try to take a slot for `(user_id, thread_id)`.
    ///
    /// A rejected acquire leaves no partial increments behind: the
    /// atomic batch rolls them back before reporting exhaustion.
    pub async fn acquire(
        self: &Arc<Self>,
        user_id: &str,
        thread_id: &str,
    ) -> PoolAdmission {
        let user_key = user_key(user_id);
        let request = SlotRequest {
            global_key: GLOBAL_KEY,
            user_key: &user_key,
            members_key: MEMBERS_KEY,
            member: thread_id,
            global_max: self.config.global_max,
            user_max: self.config.per_user_max,
        };

        match self.store.acquire_slots(request).await {
            Ok(SlotOutcome::Admitted { global, user }) => {
                tracing::debug!(
                    thread_id = %thread_id,
                    global,
                    user,
                    "pool slot acquired",
                );
                self.note_health(global);
                PoolAdmission::Admitted(PoolSlot::shared(self, user_id, thread_id))
            }
            Ok(SlotOutcome::GlobalExhausted { current }) => {
                self.note_health(current);
                PoolAdmission::GlobalExhausted {
                    current,
                    limit: self.config.global_max,
                }
            }
            Ok(SlotOutcome::UserExhausted { current }) => PoolAdmission::UserExhausted {
                current,
                limit: self.config.per_user_max,
            },
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    "shared store unreachable; using local pool counters",
                );
                self.acquire_local(user_id, thread_id)
            }
        }
    }

    fn acquire_local(self: &Arc<Self>, user_id: &str, thread_id: &str) -> PoolAdmission {
        let mut local = self.local.lock().expect("local pool lock");

        if local.global >= self.config.global_max {
            return PoolAdmission::GlobalExhausted {
                current: local.global,
                limit: self.config.global_max,
            };
        }

        let user_count = local.per_user.get(user_id).copied().unwrap_or(0);
        if user_count >= self.config.per_user_max {
            return PoolAdmission::UserExhausted {
                current: user_count,
                limit: self.config.per_user_max,
            };
        }

        local.global += 1;
        local.per_user.insert(user_id.to_string(), user_count + 1);
        local.members.insert(thread_id.to_string());

        PoolAdmission::Admitted(PoolSlot::local(self, user_id, thread_id))
    }

    async fn release_shared(&self, user_id: &str, thread_id: &str) {
        let user_key = user_key(user_id);
        let keys = SlotKeys {
            global_key: GLOBAL_KEY,
            user_key: &user_key,
            members_key: MEMBERS_KEY,
            member: thread_id,
        };
        match self.store.release_slots(keys).await {
            Ok(()) => {
                if let Ok(current) = self.store.counter(GLOBAL_KEY).await {
                    self.note_health(current.max(0) as u64);
                }
            }
            Err(err) => {
                // The counter will drift until it decays as other
                // requests finish; nothing else to do here.
                tracing::error!(error = %err, thread_id = %thread_id, "pool release failed");
            }
        }
    }

    fn release_local(&self, user_id: &str, thread_id: &str) {
        let mut local = self.local.lock().expect("local pool lock");
        if !local.members.remove(thread_id) {
            return;
        }
        local.global = local.global.saturating_sub(1);
        if let Some(count) = local.per_user.get_mut(user_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                local.per_user.remove(user_id);
            }
        }
    }

    /// Current global active count as the store reports it.
    pub async fn global_active(&self) -> Option<u64> {
        self.store
            .counter(GLOBAL_KEY)
            .await
            .ok()
            .map(|v| v.max(0) as u64)
    }

    /// Classify the given count and log when the classification moved.
    fn note_health(&self, current: u64) {
        let health = PoolHealth::classify(current, &self.config);
        let mut last = self.last_health.lock().expect("health lock");
        if *last != health {
            match health {
                PoolHealth::Healthy => {
                    tracing::info!(current, ?health, "pool recovered");
                }
                PoolHealth::Degraded | PoolHealth::Critical | PoolHealth::Exhausted => {
                    tracing::warn!(
                        current,
                        max = self.config.global_max,
                        ?health,
                        "pool utilization state changed",
                    );
                }
            }
            *last = health;
        }
    }

    /// The configured limits.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }
}

/// A held pool slot. Release it explicitly on the normal path; if the
/// slot is dropped while still held (cancellation, panic unwind in a
/// task), release is spawned in the background so the counters never
/// leak a slot.
pub struct PoolSlot {
    coordinator: Arc<PoolCoordinator>,
    user_id: String,
    thread_id: String,
    local: bool,
    released: Arc<AtomicBool>,
}

impl PoolSlot {
    fn shared(coordinator: &Arc<PoolCoordinator>, user_id: &str, thread_id: &str) -> Self {
        Self {
            coordinator: Arc::clone(coordinator),
            user_id: user_id.to_string(),
            thread_id: thread_id.to_string(),
            local: false,
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    fn local(coordinator: &Arc<PoolCoordinator>, user_id: &str, thread_id: &str) -> Self {
        Self {
            coordinator: Arc::clone(coordinator),
            user_id: user_id.to_string(),
            thread_id: thread_id.to_string(),
            local: true,
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Release the slot. Releasing twice is a no-op.
    pub async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.local {
            self.coordinator.release_local(&self.user_id, &self.thread_id);
        } else {
            self.coordinator
                .release_shared(&self.user_id, &self.thread_id)
                .await;
        }
    }
}

impl Drop for PoolSlot {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.local {
            self.coordinator.release_local(&self.user_id, &self.thread_id);
            return;
        }
        let coordinator = Arc::clone(&self.coordinator);
        let user_id = std::mem::take(&mut self.user_id);
        let thread_id = std::mem::take(&mut self.thread_id);
        tokio::spawn(async move {
            coordinator.release_shared(&user_id, &thread_id).await;
        });
    }
}
