//! Redis implementation of the shared store.
//!
//! Regular commands go through a [`ConnectionManager`] clone per call;
//! pub/sub uses a dedicated connection per subscription, pumped into a
//! channel by a background task. The multi-key atomic operations (slot
//! batches, compare-and-swap, conditional-TTL increments) are Lua
//! scripts so each is a single round trip and a single atomic step.

use std::time::Duration;

use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::streams::{StreamMaxlen, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;

use super::{SharedStore, SlotKeys, SlotOutcome, SlotRequest, StreamEntry, Subscription};
use crate::error::StoreError;

/// INCRBY that applies a TTL only when the increment created the key.
const INCR_WITH_TTL: &str = r"
local value = redis.call('INCRBY', KEYS[1], ARGV[1])
if value == tonumber(ARGV[1]) and tonumber(ARGV[2]) > 0 then
  redis.call('EXPIRE', KEYS[1], ARGV[2])
end
return value
";

/// Compare-and-swap on a single key. An empty expected string means
/// "key must be absent".
const COMPARE_AND_SWAP: &str = r"
local current = redis.call('GET', KEYS[1])
if (current == false and ARGV[1] == '') or (current == ARGV[1]) then
  if tonumber(ARGV[3]) > 0 then
    redis.call('SET', KEYS[1], ARGV[2], 'EX', ARGV[3])
  else
    redis.call('SET', KEYS[1], ARGV[2])
  end
  return 1
end
return 0
";

/// Bounded two-counter increment plus set add. Rolls back every partial
/// increment before reporting which ceiling was hit.
const ACQUIRE_SLOTS: &str = r"
local global = redis.call('INCR', KEYS[1])
if global > tonumber(ARGV[1]) then
  redis.call('DECR', KEYS[1])
  return {'global', global - 1}
end
local user = redis.call('INCR', KEYS[2])
if user > tonumber(ARGV[2]) then
  redis.call('DECR', KEYS[2])
  redis.call('DECR', KEYS[1])
  return {'user', user - 1}
end
redis.call('SADD', KEYS[3], ARGV[3])
return {'ok', global, user}
";

/// Floored decrement of both counters plus set removal. The member must
/// still be present in the set, which makes a double release a no-op.
const RELEASE_SLOTS: &str = r"
local removed = redis.call('SREM', KEYS[3], ARGV[1])
if removed == 0 then
  return 0
end
for i = 1, 2 do
  local value = redis.call('DECR', KEYS[i])
  if value < 0 then
    redis.call('SET', KEYS[i], 0)
  end
end
return 1
";

/// Shared store backed by Redis.
pub struct RedisStore {
    client: redis::Client,
    conn: ConnectionManager,
    op_timeout: Duration,
}

impl RedisStore {
    /// Connect to Redis and open the managed connection.
    pub async fn connect(url: &str, op_timeout: Duration) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            client,
            conn,
            op_timeout,
        })
    }

    async fn timed<T, F>(&self, operation: &'static str, fut: F) -> Result<T, StoreError>
    where
        F: std::future::Future<Output = Result<T, redis::RedisError>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout { operation }),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn ttl_secs(ttl: Option<Duration>) -> u64 {
        ttl.map_or(0, |t| t.as_secs().max(1))
    }
}

#[async_trait::async_trait]
impl SharedStore for RedisStore {
    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        self.timed("ping", async move {
            redis::cmd("PING").query_async::<()>(&mut conn).await
        })
        .await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let key = key.to_string();
        self.timed("get", async move { conn.get(key).await }).await
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let key = key.to_string();
        let value = value.to_string();
        self.timed("set", async move {
            match ttl {
                Some(ttl) => conn.set_ex(key, value, ttl.as_secs().max(1)).await,
                None => conn.set(key, value).await,
            }
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let key = key.to_string();
        self.timed("delete", async move { conn.del(key).await }).await
    }

    async fn incr(
        &self,
        key: &str,
        delta: i64,
        ttl: Option<Duration>,
    ) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        let script = redis::Script::new(INCR_WITH_TTL);
        let key = key.to_string();
        let ttl = Self::ttl_secs(ttl);
        self.timed("incr", async move {
            script
                .key(key)
                .arg(delta)
                .arg(ttl)
                .invoke_async(&mut conn)
                .await
        })
        .await
    }

    async fn counter(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        let key = key.to_string();
        let value: Option<String> = self
            .timed("counter", async move { conn.get(key).await })
            .await?;
        Ok(value.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let key = key.to_string();
        let member = member.to_string();
        self.timed("set_add", async move { conn.sadd(key, member).await })
            .await
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let key = key.to_string();
        let member = member.to_string();
        self.timed("set_remove", async move { conn.srem(key, member).await })
            .await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        next: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let script = redis::Script::new(COMPARE_AND_SWAP);
        let key = key.to_string();
        let expected = expected.unwrap_or("").to_string();
        let next = next.to_string();
        let ttl = Self::ttl_secs(ttl);
        let swapped: i64 = self
            .timed("compare_and_swap", async move {
                script
                    .key(key)
                    .arg(expected)
                    .arg(next)
                    .arg(ttl)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;
        Ok(swapped == 1)
    }

    async fn acquire_slots(&self, request: SlotRequest<'_>) -> Result<SlotOutcome, StoreError> {
        let mut conn = self.conn.clone();
        let script = redis::Script::new(ACQUIRE_SLOTS);
        let global_key = request.global_key.to_string();
        let user_key = request.user_key.to_string();
        let members_key = request.members_key.to_string();
        let member = request.member.to_string();
        let (verdict, first, second): (String, i64, Option<i64>) = self
            .timed("acquire_slots", async move {
                script
                    .key(global_key)
                    .key(user_key)
                    .key(members_key)
                    .arg(request.global_max)
                    .arg(request.user_max)
                    .arg(member)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;

        match verdict.as_str() {
            "ok" => Ok(SlotOutcome::Admitted {
                global: first.max(0) as u64,
                user: second.unwrap_or(0).max(0) as u64,
            }),
            "global" => Ok(SlotOutcome::GlobalExhausted {
                current: first.max(0) as u64,
            }),
            "user" => Ok(SlotOutcome::UserExhausted {
                current: first.max(0) as u64,
            }),
            other => Err(StoreError::Decode {
                key: request.global_key.to_string(),
                message: format!("unexpected acquire verdict '{other}'"),
            }),
        }
    }

    async fn release_slots(&self, keys: SlotKeys<'_>) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let script = redis::Script::new(RELEASE_SLOTS);
        let global_key = keys.global_key.to_string();
        let user_key = keys.user_key.to_string();
        let members_key = keys.members_key.to_string();
        let member = keys.member.to_string();
        let _: i64 = self
            .timed("release_slots", async move {
                script
                    .key(global_key)
                    .key(user_key)
                    .key(members_key)
                    .arg(member)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;
        Ok(())
    }

    async fn stream_append(
        &self,
        stream: &str,
        payload: &str,
        max_len: u64,
    ) -> Result<String, StoreError> {
        let mut conn = self.conn.clone();
        let stream = stream.to_string();
        let payload = payload.to_string();
        self.timed("stream_append", async move {
            conn.xadd_maxlen(
                stream,
                StreamMaxlen::Approx(max_len as usize),
                "*",
                &[("payload", payload)],
            )
            .await
        })
        .await
    }

    async fn stream_len(&self, stream: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let stream = stream.to_string();
        self.timed("stream_len", async move { conn.xlen(stream).await })
            .await
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let stream = stream.to_string();
        let group = group.to_string();
        let result = self
            .timed("ensure_group", async move {
                redis::cmd("XGROUP")
                    .arg("CREATE")
                    .arg(stream)
                    .arg(group)
                    .arg("0")
                    .arg("MKSTREAM")
                    .query_async::<()>(&mut conn)
                    .await
            })
            .await;

        match result {
            Ok(()) => Ok(()),
            // The group already existing is the steady state.
            Err(StoreError::Backend { source })
                if source.to_string().contains("BUSYGROUP") =>
            {
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn stream_claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> Result<Option<StreamEntry>, StoreError> {
        let mut conn = self.conn.clone();
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(1)
            .block(block.as_millis() as usize);
        let stream_name = stream.to_string();

        // The read blocks server-side; give the client call headroom
        // beyond the requested block window.
        let reply: StreamReadReply =
            match tokio::time::timeout(block + Duration::from_secs(2), async move {
                conn.xread_options(&[stream_name], &[">"], &options).await
            })
            .await
            {
                Ok(result) => result.map_err(StoreError::from)?,
                Err(_) => return Ok(None),
            };

        let Some(first) = reply.keys.into_iter().next() else {
            return Ok(None);
        };
        let Some(entry) = first.ids.into_iter().next() else {
            return Ok(None);
        };

        let payload = entry
            .map
            .get("payload")
            .and_then(|value| redis::from_redis_value::<String>(value.clone()).ok())
            .ok_or_else(|| StoreError::Decode {
                key: stream.to_string(),
                message: format!("stream entry {} has no payload field", entry.id),
            })?;

        Ok(Some(StreamEntry {
            id: entry.id,
            payload,
        }))
    }

    async fn stream_ack(
        &self,
        stream: &str,
        group: &str,
        entry_id: &str,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let stream = stream.to_string();
        let group = group.to_string();
        let entry_id = entry_id.to_string();
        self.timed("stream_ack", async move {
            conn.xack(stream, group, &[entry_id]).await
        })
        .await
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let channel = channel.to_string();
        let message = message.to_string();
        self.timed("publish", async move { conn.publish(channel, message).await })
            .await
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        let (tx, rx) = tokio::sync::mpsc::channel(64);
        let pump = tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(message) = messages.next().await {
                let Ok(payload) = message.get_payload::<String>() else {
                    continue;
                };
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
        });

        Ok(Subscription::new(rx, Some(pump)))
    }
}
