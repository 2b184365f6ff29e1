//! Shared coordination store.
//!
//! Everything the gateway coordinates across instances — pool counters,
//! circuit state, rate-limit windows, the L2 cache, the failover job
//! stream, and result channels — goes through the [`SharedStore`] trait.
//! [`RedisStore`] is the production backend; [`MemoryStore`] backs tests
//! and single-instance deployments.

mod memory;
mod redis;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// Keys and limits for one atomic slot acquisition.
#[derive(Debug, Clone, Copy)]
pub struct SlotRequest<'a> {
    /// Key of the fleet-wide active counter.
    pub global_key: &'a str,
    /// Key of the per-user active counter.
    pub user_key: &'a str,
    /// Key of the active-member set.
    pub members_key: &'a str,
    /// Member added to the set on admission (the thread identifier).
    pub member: &'a str,
    /// Ceiling for the global counter.
    pub global_max: u64,
    /// Ceiling for the user counter.
    pub user_max: u64,
}

/// Keys for one atomic slot release.
#[derive(Debug, Clone, Copy)]
pub struct SlotKeys<'a> {
    /// Key of the fleet-wide active counter.
    pub global_key: &'a str,
    /// Key of the per-user active counter.
    pub user_key: &'a str,
    /// Key of the active-member set.
    pub members_key: &'a str,
    /// Member removed from the set.
    pub member: &'a str,
}

/// Result of an atomic slot acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotOutcome {
    /// Both counters were below their ceilings; the slot is held.
    Admitted {
        /// Global active count after the increment.
        global: u64,
        /// Per-user active count after the increment.
        user: u64,
    },
    /// The global ceiling would be exceeded; nothing was changed.
    GlobalExhausted {
        /// Global active count observed.
        current: u64,
    },
    /// The per-user ceiling would be exceeded; nothing was changed.
    UserExhausted {
        /// Per-user active count observed.
        current: u64,
    },
}

/// One claimed entry from a shared stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// Backend-assigned entry id, used for acknowledgement.
    pub id: String,
    /// The entry payload.
    pub payload: String,
}

/// Outcome of waiting on a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecvOutcome {
    /// A message arrived.
    Message(String),
    /// The wait deadline passed with no message.
    TimedOut,
    /// The subscription ended (connection lost or dropped).
    Closed,
}

/// An active pub/sub subscription.
///
/// Messages are pumped from the backend into an internal channel by a
/// background task; dropping the subscription unsubscribes.
pub struct Subscription {
    rx: tokio::sync::mpsc::Receiver<String>,
    pump: Option<tokio::task::JoinHandle<()>>,
}

impl Subscription {
    pub(crate) fn new(
        rx: tokio::sync::mpsc::Receiver<String>,
        pump: Option<tokio::task::JoinHandle<()>>,
    ) -> Self {
        Self { rx, pump }
    }

    /// Wait up to `timeout` for the next message.
    pub async fn recv(&mut self, timeout: Duration) -> RecvOutcome {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(message)) => RecvOutcome::Message(message),
            Ok(None) => RecvOutcome::Closed,
            Err(_) => RecvOutcome::TimedOut,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

/// The coordination surface required from the shared store.
///
/// Atomic counters with optional TTL, multi-key atomic slot batches,
/// sets, compare-and-swap, streams with consumer groups, and pub/sub
/// with a blocking timed receive. These capabilities are the only
/// cross-instance coordination mechanism in the gateway.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Round-trip liveness check.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Fetch a value.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Store a value, with an optional TTL.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>)
        -> Result<(), StoreError>;

    /// Delete a key. Deleting an absent key is a no-op.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Atomically increment a counter by `delta`, returning the new value.
    /// `ttl` is applied only when the increment created the key.
    async fn incr(&self, key: &str, delta: i64, ttl: Option<Duration>)
        -> Result<i64, StoreError>;

    /// Read a counter without modifying it. Absent counters read as zero.
    async fn counter(&self, key: &str) -> Result<i64, StoreError>;

    /// Add a member to a set.
    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError>;

    /// Remove a member from a set. Removing an absent member is a no-op.
    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError>;

    /// Compare-and-swap: write `next` iff the current value equals
    /// `expected` (`None` meaning the key is absent). Returns whether
    /// the swap happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        next: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError>;

    /// Atomically increment two bounded counters and add `member` to a
    /// set. Partial increments are rolled back inside the same atomic
    /// operation when either ceiling would be exceeded.
    async fn acquire_slots(&self, request: SlotRequest<'_>) -> Result<SlotOutcome, StoreError>;

    /// Atomically decrement both counters (floored at zero) and remove
    /// `member` from the set. Safe to call for a member that was never
    /// added or was already released.
    async fn release_slots(&self, keys: SlotKeys<'_>) -> Result<(), StoreError>;

    /// Append a payload to a stream capped at roughly `max_len` entries,
    /// returning the entry id.
    async fn stream_append(
        &self,
        stream: &str,
        payload: &str,
        max_len: u64,
    ) -> Result<String, StoreError>;

    /// Current stream depth.
    async fn stream_len(&self, stream: &str) -> Result<u64, StoreError>;

    /// Create the consumer group if it does not exist.
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), StoreError>;

    /// Claim the next undelivered entry for `consumer`, blocking up to
    /// `block`. Within a group each entry is delivered exactly once.
    async fn stream_claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> Result<Option<StreamEntry>, StoreError>;

    /// Acknowledge a claimed entry.
    async fn stream_ack(&self, stream: &str, group: &str, entry_id: &str)
        -> Result<(), StoreError>;

    /// Publish a message to a channel.
    async fn publish(&self, channel: &str, message: &str) -> Result<(), StoreError>;

    /// Subscribe to a channel. The subscription is live once this
    /// returns: messages published afterwards will be received.
    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError>;
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::{SharedStore, SlotKeys, SlotOutcome, SlotRequest, StreamEntry, Subscription};
    use crate::error::StoreError;
    use async_trait::async_trait;
    use std::time::Duration;

    /// A store whose every operation fails, for exercising degraded paths.
    pub struct UnreachableStore;

    fn down() -> StoreError {
        StoreError::Timeout { operation: "test" }
    }

    #[async_trait]
    impl SharedStore for UnreachableStore {
        async fn ping(&self) -> Result<(), StoreError> {
            Err(down())
        }
        async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Err(down())
        }
        async fn set(
            &self,
            _key: &str,
            _value: &str,
            _ttl: Option<Duration>,
        ) -> Result<(), StoreError> {
            Err(down())
        }
        async fn delete(&self, _key: &str) -> Result<(), StoreError> {
            Err(down())
        }
        async fn incr(
            &self,
            _key: &str,
            _delta: i64,
            _ttl: Option<Duration>,
        ) -> Result<i64, StoreError> {
            Err(down())
        }
        async fn counter(&self, _key: &str) -> Result<i64, StoreError> {
            Err(down())
        }
        async fn set_add(&self, _key: &str, _member: &str) -> Result<(), StoreError> {
            Err(down())
        }
        async fn set_remove(&self, _key: &str, _member: &str) -> Result<(), StoreError> {
            Err(down())
        }
        async fn compare_and_swap(
            &self,
            _key: &str,
            _expected: Option<&str>,
            _next: &str,
            _ttl: Option<Duration>,
        ) -> Result<bool, StoreError> {
            Err(down())
        }
        async fn acquire_slots(
            &self,
            _request: SlotRequest<'_>,
        ) -> Result<SlotOutcome, StoreError> {
            Err(down())
        }
        async fn release_slots(&self, _keys: SlotKeys<'_>) -> Result<(), StoreError> {
            Err(down())
        }
        async fn stream_append(
            &self,
            _stream: &str,
            _payload: &str,
            _max_len: u64,
        ) -> Result<String, StoreError> {
            Err(down())
        }
        async fn stream_len(&self, _stream: &str) -> Result<u64, StoreError> {
            Err(down())
        }
        async fn ensure_group(&self, _stream: &str, _group: &str) -> Result<(), StoreError> {
            Err(down())
        }
        async fn stream_claim(
            &self,
            _stream: &str,
            _group: &str,
            _consumer: &str,
            _block: Duration,
        ) -> Result<Option<StreamEntry>, StoreError> {
            Err(down())
        }
        async fn stream_ack(
            &self,
            _stream: &str,
            _group: &str,
            _entry_id: &str,
        ) -> Result<(), StoreError> {
            Err(down())
        }
        async fn publish(&self, _channel: &str, _message: &str) -> Result<(), StoreError> {
            Err(down())
        }
        async fn subscribe(&self, _channel: &str) -> Result<Subscription, StoreError> {
            Err(down())
        }
    }
}
