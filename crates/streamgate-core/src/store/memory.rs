//! In-process implementation of the shared store.
//!
//! Backs tests and single-instance deployments. All maps live behind one
//! mutex; operations are short and never await while holding it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex, Notify};

use super::{SharedStore, SlotKeys, SlotOutcome, SlotRequest, StreamEntry, Subscription};
use crate::error::StoreError;

#[derive(Default)]
struct MemStream {
    entries: Vec<(u64, String)>,
    next_seq: u64,
    /// Per-group delivery cursor (index into `entries`) and pending ids.
    groups: HashMap<String, GroupState>,
}

#[derive(Default)]
struct GroupState {
    cursor: usize,
    pending: HashSet<u64>,
}

#[derive(Default)]
struct Inner {
    kv: HashMap<String, (String, Option<Instant>)>,
    counters: HashMap<String, (i64, Option<Instant>)>,
    sets: HashMap<String, HashSet<String>>,
    streams: HashMap<String, MemStream>,
    channels: HashMap<String, broadcast::Sender<String>>,
}

impl Inner {
    fn live_kv(&mut self, key: &str) -> Option<&String> {
        if let Some((_, Some(expiry))) = self.kv.get(key) {
            if *expiry <= Instant::now() {
                self.kv.remove(key);
            }
        }
        self.kv.get(key).map(|(v, _)| v)
    }

    fn live_counter(&mut self, key: &str) -> i64 {
        if let Some((_, Some(expiry))) = self.counters.get(key) {
            if *expiry <= Instant::now() {
                self.counters.remove(key);
            }
        }
        self.counters.get(key).map_or(0, |(v, _)| *v)
    }
}

/// Shared store backed by process memory.
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    stream_signal: Arc<Notify>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            stream_signal: Arc::new(Notify::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(inner.live_kv(key).cloned())
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let expiry = ttl.map(|t| Instant::now() + t);
        inner.kv.insert(key.to_string(), (value.to_string(), expiry));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.kv.remove(key);
        inner.counters.remove(key);
        Ok(())
    }

    async fn incr(
        &self,
        key: &str,
        delta: i64,
        ttl: Option<Duration>,
    ) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().await;
        let current = inner.live_counter(key);
        let created = !inner.counters.contains_key(key);
        let next = current + delta;
        let expiry = if created {
            ttl.map(|t| Instant::now() + t)
        } else {
            inner.counters.get(key).and_then(|(_, e)| *e)
        };
        inner.counters.insert(key.to_string(), (next, expiry));
        Ok(next)
    }

    async fn counter(&self, key: &str) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(inner.live_counter(key))
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(set) = inner.sets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        next: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let current = inner.live_kv(key).cloned();
        if current.as_deref() == expected {
            let expiry = ttl.map(|t| Instant::now() + t);
            inner.kv.insert(key.to_string(), (next.to_string(), expiry));
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn acquire_slots(&self, request: SlotRequest<'_>) -> Result<SlotOutcome, StoreError> {
        let mut inner = self.inner.lock().await;

        let global = inner.live_counter(request.global_key);
        #[allow(clippy::cast_possible_wrap)]
        if global >= request.global_max as i64 {
            return Ok(SlotOutcome::GlobalExhausted {
                current: global.max(0) as u64,
            });
        }

        let user = inner.live_counter(request.user_key);
        #[allow(clippy::cast_possible_wrap)]
        if user >= request.user_max as i64 {
            return Ok(SlotOutcome::UserExhausted {
                current: user.max(0) as u64,
            });
        }

        inner
            .counters
            .insert(request.global_key.to_string(), (global + 1, None));
        inner
            .counters
            .insert(request.user_key.to_string(), (user + 1, None));
        inner
            .sets
            .entry(request.members_key.to_string())
            .or_default()
            .insert(request.member.to_string());

        Ok(SlotOutcome::Admitted {
            global: (global + 1) as u64,
            user: (user + 1) as u64,
        })
    }

    async fn release_slots(&self, keys: SlotKeys<'_>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;

        // Release only has an effect while the member is still active;
        // this is what makes a double release a no-op.
        let was_active = inner
            .sets
            .get_mut(keys.members_key)
            .is_some_and(|set| set.remove(keys.member));
        if !was_active {
            return Ok(());
        }

        for key in [keys.global_key, keys.user_key] {
            let current = inner.live_counter(key);
            inner
                .counters
                .insert(key.to_string(), ((current - 1).max(0), None));
        }
        Ok(())
    }

    async fn stream_append(
        &self,
        stream: &str,
        payload: &str,
        max_len: u64,
    ) -> Result<String, StoreError> {
        let mut inner = self.inner.lock().await;
        let entry = inner.streams.entry(stream.to_string()).or_default();
        let seq = entry.next_seq;
        entry.next_seq += 1;
        entry.entries.push((seq, payload.to_string()));

        #[allow(clippy::cast_possible_truncation)]
        while entry.entries.len() as u64 > max_len {
            entry.entries.remove(0);
            for group in entry.groups.values_mut() {
                group.cursor = group.cursor.saturating_sub(1);
            }
        }

        drop(inner);
        self.stream_signal.notify_waiters();
        Ok(seq.to_string())
    }

    async fn stream_len(&self, stream: &str) -> Result<u64, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .streams
            .get(stream)
            .map_or(0, |s| s.entries.len() as u64))
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner
            .streams
            .entry(stream.to_string())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_default();
        Ok(())
    }

    async fn stream_claim(
        &self,
        stream: &str,
        group: &str,
        _consumer: &str,
        block: Duration,
    ) -> Result<Option<StreamEntry>, StoreError> {
        let deadline = Instant::now() + block;
        loop {
            {
                let mut inner = self.inner.lock().await;
                if let Some(mem) = inner.streams.get_mut(stream) {
                    let state = mem.groups.entry(group.to_string()).or_default();
                    if state.cursor < mem.entries.len() {
                        let (seq, payload) = mem.entries[state.cursor].clone();
                        state.cursor += 1;
                        state.pending.insert(seq);
                        return Ok(Some(StreamEntry {
                            id: seq.to_string(),
                            payload,
                        }));
                    }
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let _ = tokio::time::timeout(remaining, self.stream_signal.notified()).await;
        }
    }

    async fn stream_ack(
        &self,
        stream: &str,
        group: &str,
        entry_id: &str,
    ) -> Result<(), StoreError> {
        let seq: u64 = entry_id.parse().map_err(|_| StoreError::Decode {
            key: stream.to_string(),
            message: format!("bad entry id '{entry_id}'"),
        })?;
        let mut inner = self.inner.lock().await;
        if let Some(mem) = inner.streams.get_mut(stream) {
            if let Some(state) = mem.groups.get_mut(group) {
                state.pending.remove(&seq);
            }
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), StoreError> {
        let inner = self.inner.lock().await;
        if let Some(tx) = inner.channels.get(channel) {
            // No subscribers is not an error, matching Redis semantics.
            let _ = tx.send(message.to_string());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        let mut inner = self.inner.lock().await;
        let tx = inner
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone();
        drop(inner);

        let mut bcast_rx = tx.subscribe();
        let (out_tx, out_rx) = tokio::sync::mpsc::channel(64);
        let pump = tokio::spawn(async move {
            loop {
                match bcast_rx.recv().await {
                    Ok(message) => {
                        if out_tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(Subscription::new(out_rx, Some(pump)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RecvOutcome;

    #[tokio::test]
    async fn kv_roundtrip_and_delete() {
        let store = MemoryStore::new();
        assert_eq!(store.get("k").await.expect("get"), None);

        store.set("k", "v", None).await.expect("set");
        assert_eq!(store.get("k").await.expect("get"), Some("v".to_string()));

        store.delete("k").await.expect("delete");
        assert_eq!(store.get("k").await.expect("get"), None);
    }

    #[tokio::test]
    async fn ttl_expires_values() {
        let store = MemoryStore::new();
        store
            .set("k", "v", Some(Duration::from_millis(20)))
            .await
            .expect("set");
        assert!(store.get("k").await.expect("get").is_some());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.get("k").await.expect("get"), None);
    }

    #[tokio::test]
    async fn incr_applies_ttl_only_on_create() {
        let store = MemoryStore::new();
        let ttl = Some(Duration::from_millis(50));
        assert_eq!(store.incr("c", 1, ttl).await.expect("incr"), 1);
        assert_eq!(store.incr("c", 1, ttl).await.expect("incr"), 2);

        tokio::time::sleep(Duration::from_millis(80)).await;
        // Window expired; the counter restarts.
        assert_eq!(store.incr("c", 1, ttl).await.expect("incr"), 1);
    }

    #[tokio::test]
    async fn compare_and_swap_semantics() {
        let store = MemoryStore::new();

        // Absent key: only expected=None succeeds.
        assert!(!store
            .compare_and_swap("s", Some("x"), "y", None)
            .await
            .expect("cas"));
        assert!(store
            .compare_and_swap("s", None, "first", None)
            .await
            .expect("cas"));

        // Present key: value must match exactly.
        assert!(!store
            .compare_and_swap("s", Some("wrong"), "second", None)
            .await
            .expect("cas"));
        assert!(store
            .compare_and_swap("s", Some("first"), "second", None)
            .await
            .expect("cas"));
        assert_eq!(store.get("s").await.expect("get"), Some("second".to_string()));
    }

    #[tokio::test]
    async fn acquire_respects_both_ceilings() {
        let store = MemoryStore::new();
        let request = SlotRequest {
            global_key: "g",
            user_key: "u",
            members_key: "m",
            member: "t-1",
            global_max: 2,
            user_max: 1,
        };

        assert!(matches!(
            store.acquire_slots(request).await.expect("acquire"),
            SlotOutcome::Admitted { global: 1, user: 1 }
        ));

        // Same user again: user ceiling blocks, global counter untouched.
        let second = SlotRequest {
            member: "t-2",
            ..request
        };
        assert_eq!(
            store.acquire_slots(second).await.expect("acquire"),
            SlotOutcome::UserExhausted { current: 1 }
        );

        // A different user fills the global ceiling.
        let other = SlotRequest {
            user_key: "u2",
            member: "t-3",
            ..request
        };
        assert!(matches!(
            store.acquire_slots(other).await.expect("acquire"),
            SlotOutcome::Admitted { global: 2, user: 1 }
        ));

        let third = SlotRequest {
            user_key: "u3",
            member: "t-4",
            ..request
        };
        assert_eq!(
            store.acquire_slots(third).await.expect("acquire"),
            SlotOutcome::GlobalExhausted { current: 2 }
        );
    }

    #[tokio::test]
    async fn release_is_idempotent_and_floored() {
        let store = MemoryStore::new();
        let request = SlotRequest {
            global_key: "g",
            user_key: "u",
            members_key: "m",
            member: "t-1",
            global_max: 10,
            user_max: 3,
        };
        store.acquire_slots(request).await.expect("acquire");

        let keys = SlotKeys {
            global_key: "g",
            user_key: "u",
            members_key: "m",
            member: "t-1",
        };
        store.release_slots(keys).await.expect("release");
        store.release_slots(keys).await.expect("double release");

        assert_eq!(store.incr("g", 0, None).await.expect("read"), 0);
        assert_eq!(store.incr("u", 0, None).await.expect("read"), 0);
    }

    #[tokio::test]
    async fn stream_group_delivers_each_entry_once() {
        let store = MemoryStore::new();
        store.ensure_group("jobs", "workers").await.expect("group");
        store.stream_append("jobs", "job-1", 100).await.expect("append");
        store.stream_append("jobs", "job-2", 100).await.expect("append");

        let first = store
            .stream_claim("jobs", "workers", "w1", Duration::from_millis(10))
            .await
            .expect("claim")
            .expect("entry");
        let second = store
            .stream_claim("jobs", "workers", "w2", Duration::from_millis(10))
            .await
            .expect("claim")
            .expect("entry");
        assert_eq!(first.payload, "job-1");
        assert_eq!(second.payload, "job-2");

        // Drained: claim times out.
        assert!(store
            .stream_claim("jobs", "workers", "w1", Duration::from_millis(10))
            .await
            .expect("claim")
            .is_none());

        store
            .stream_ack("jobs", "workers", &first.id)
            .await
            .expect("ack");
    }

    #[tokio::test]
    async fn stream_claim_wakes_on_append() {
        let store = Arc::new(MemoryStore::new());
        store.ensure_group("jobs", "workers").await.expect("group");

        let claimer = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .stream_claim("jobs", "workers", "w1", Duration::from_secs(2))
                    .await
                    .expect("claim")
            })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        store.stream_append("jobs", "late", 100).await.expect("append");

        let entry = claimer.await.expect("join").expect("entry");
        assert_eq!(entry.payload, "late");
    }

    #[tokio::test]
    async fn stream_len_reports_depth() {
        let store = MemoryStore::new();
        assert_eq!(store.stream_len("jobs").await.expect("len"), 0);
        store.stream_append("jobs", "a", 100).await.expect("append");
        store.stream_append("jobs", "b", 100).await.expect("append");
        assert_eq!(store.stream_len("jobs").await.expect("len"), 2);
    }

    #[tokio::test]
    async fn pubsub_delivers_after_subscribe() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe("results:t-1").await.expect("subscribe");

        store.publish("results:t-1", "hello").await.expect("publish");
        assert_eq!(
            sub.recv(Duration::from_millis(200)).await,
            RecvOutcome::Message("hello".to_string())
        );

        assert_eq!(
            sub.recv(Duration::from_millis(20)).await,
            RecvOutcome::TimedOut
        );
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_ok() {
        let store = MemoryStore::new();
        store.publish("nobody", "msg").await.expect("publish");
    }
}
