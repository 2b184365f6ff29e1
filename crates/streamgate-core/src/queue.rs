//! Cross-instance queue failover.
//!
//! When the local pool is exhausted, the handling instance bridges the
//! request to a worker on any instance: it subscribes to a result
//! channel derived from the thread identifier, then appends the job to
//! a shared stream with consumer-group semantics. A worker claims the
//! job, acquires a slot on its own instance, runs the full lifecycle,
//! and publishes batched chunks back over the channel. The handling
//! instance forwards them to the client, heartbeating while it waits.
//!
//! Subscription strictly precedes enqueue: the worker may publish
//! immediately after claiming, and messages sent before the subscriber
//! is live would be lost.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::admission::BackpressureGate;
use crate::config::QueueConfig;
use crate::error::{ErrorKind, GatewayError};
use crate::events::StreamEvent;
use crate::pipeline::{EventStream, Pipeline};
use crate::pool::{PoolAdmission, PoolCoordinator};
use crate::request::StreamRequest;
use crate::store::{RecvOutcome, SharedStore};

/// Shared stream holding queued jobs.
pub const JOBS_STREAM: &str = "queue:jobs";
/// Consumer group name shared by all workers in the fleet.
pub const WORKERS_GROUP: &str = "gateway-workers";

fn result_channel(thread_id: &str) -> String {
    format!("queue:results:{thread_id}")
}

fn cancel_key(thread_id: &str) -> String {
    format!("queue:cancel:{thread_id}")
}

/// One queued request, serialized onto the jobs stream.
#[derive(Debug, Serialize, Deserialize)]
struct QueueJob {
    request: StreamRequest,
    result_channel: String,
    submitted_at: i64,
}

/// Messages a worker publishes on the result channel.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResultMessage {
    /// A batch of token chunks, in order.
    Chunks { contents: Vec<String> },
    /// The worker finished the stream cleanly.
    Done,
    /// The worker failed; the request ends with this error.
    Error { kind: ErrorKind, message: String },
}

/// Producer side: turns a locally un-admissible request into a queued
/// job and an event stream fed from the result channel.
pub struct QueueFailover {
    store: Arc<dyn SharedStore>,
    gate: BackpressureGate,
    timeout: Duration,
    heartbeat: Duration,
}

impl QueueFailover {
    /// Create the producer side with the configured deadline and
    /// heartbeat interval.
    pub fn new(store: Arc<dyn SharedStore>, config: &QueueConfig, heartbeat: Duration) -> Self {
        Self {
            store,
            gate: BackpressureGate::new(config.clone()),
            timeout: Duration::from_secs(config.timeout_seconds),
            heartbeat,
        }
    }

    /// Enqueue the request and return the bridged event stream.
    ///
    /// Fails pre-stream with `queue_full` when the jobs stream stays
    /// above its backpressure threshold; once this returns, waiting
    /// happens inside the stream and a missed deadline surfaces as an
    /// SSE `queue_timeout` error event.
    pub async fn enqueue_and_stream(
        &self,
        request: StreamRequest,
    ) -> Result<EventStream, GatewayError> {
        let thread_id = request.thread_id.clone();
        let channel = result_channel(&thread_id);

        // Subscription must be confirmed before the job exists.
        let mut subscription =
            self.store
                .subscribe(&channel)
                .await
                .map_err(|err| {
                    tracing::error!(error = %err, "failover subscription failed");
                    GatewayError::Internal {
                        message: "failed to subscribe to result channel".to_string(),
                    }
                })?;

        let job = QueueJob {
            request,
            result_channel: channel,
            submitted_at: chrono::Utc::now().timestamp(),
        };
        let payload = serde_json::to_string(&job).map_err(|err| GatewayError::Internal {
            message: format!("failed to serialize failover job: {err}"),
        })?;

        self.gate
            .append(self.store.as_ref(), JOBS_STREAM, &payload)
            .await?;

        tracing::info!(thread_id = %thread_id, "request handed to failover queue");

        let (tx, rx) = mpsc::channel::<StreamEvent>(1);
        let store = Arc::clone(&self.store);
        let timeout = self.timeout;
        let heartbeat = self.heartbeat;

        tokio::spawn(async move {
            let started = Instant::now();
            let mut cancelled = false;

            'bridge: loop {
                let elapsed = started.elapsed();
                if elapsed >= timeout {
                    let _ = tx
                        .send(StreamEvent::Error {
                            kind: ErrorKind::QueueTimeout,
                            message: GatewayError::QueueTimeout {
                                waited_secs: elapsed.as_secs(),
                            }
                            .to_string(),
                            details: None,
                        })
                        .await;
                    break;
                }

                let wait = heartbeat.min(timeout - elapsed);
                match subscription.recv(wait).await {
                    RecvOutcome::Message(raw) => {
                        let Ok(message) = serde_json::from_str::<ResultMessage>(&raw) else {
                            tracing::warn!(thread_id = %thread_id, "bad result message discarded");
                            continue;
                        };
                        match message {
                            ResultMessage::Chunks { contents } => {
                                for content in contents {
                                    if tx.send(StreamEvent::Chunk { content }).await.is_err() {
                                        cancelled = true;
                                        break 'bridge;
                                    }
                                }
                            }
                            ResultMessage::Done => {
                                let _ = tx.send(StreamEvent::Done).await;
                                break;
                            }
                            ResultMessage::Error { kind, message } => {
                                let _ = tx
                                    .send(StreamEvent::Error {
                                        kind,
                                        message,
                                        details: None,
                                    })
                                    .await;
                                break;
                            }
                        }
                    }
                    RecvOutcome::TimedOut => {
                        if tx.send(StreamEvent::Heartbeat).await.is_err() {
                            cancelled = true;
                            break;
                        }
                    }
                    RecvOutcome::Closed => {
                        let _ = tx
                            .send(StreamEvent::Error {
                                kind: ErrorKind::Internal,
                                message: "result channel closed".to_string(),
                                details: None,
                            })
                            .await;
                        break;
                    }
                }
            }

            if cancelled {
                // Best-effort: let the worker stop early.
                tracing::debug!(thread_id = %thread_id, "client left; flagging job cancelled");
                let _ = store
                    .set(&cancel_key(&thread_id), "1", Some(Duration::from_secs(120)))
                    .await;
            }
            // Dropping the subscription unsubscribes.
        });

        Ok(Box::pin(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })))
    }
}

/// Worker side: claims queued jobs and executes them against the local
/// pool and pipeline.
pub struct QueueWorker {
    store: Arc<dyn SharedStore>,
    pipeline: Arc<Pipeline>,
    pool: Arc<PoolCoordinator>,
    config: QueueConfig,
    consumer: String,
}

impl QueueWorker {
    /// Create a worker with a unique consumer name.
    pub fn new(
        store: Arc<dyn SharedStore>,
        pipeline: Arc<Pipeline>,
        pool: Arc<PoolCoordinator>,
        config: QueueConfig,
    ) -> Self {
        Self {
            store,
            pipeline,
            pool,
            config,
            consumer: format!("worker-{}", uuid::Uuid::new_v4()),
        }
    }

    /// Claim and execute jobs until cancelled. The current job is
    /// drained before the loop exits.
    pub async fn run(&self, shutdown: CancellationToken) {
        if let Err(err) = self.store.ensure_group(JOBS_STREAM, WORKERS_GROUP).await {
            tracing::error!(error = %err, "failed to create worker consumer group");
            return;
        }
        tracing::info!(consumer = %self.consumer, "failover worker started");

        loop {
            let claim = tokio::select! {
                () = shutdown.cancelled() => break,
                claim = self.store.stream_claim(
                    JOBS_STREAM,
                    WORKERS_GROUP,
                    &self.consumer,
                    Duration::from_secs(5),
                ) => claim,
            };

            let entry = match claim {
                Ok(Some(entry)) => entry,
                Ok(None) => continue,
                Err(err) => {
                    tracing::warn!(error = %err, "job claim failed; retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            match serde_json::from_str::<QueueJob>(&entry.payload) {
                Ok(job) => self.process(job).await,
                Err(err) => {
                    tracing::error!(error = %err, entry = %entry.id, "discarding malformed job");
                }
            }

            if let Err(err) = self
                .store
                .stream_ack(JOBS_STREAM, WORKERS_GROUP, &entry.id)
                .await
            {
                tracing::warn!(error = %err, entry = %entry.id, "job ack failed");
            }
        }

        tracing::info!(consumer = %self.consumer, "failover worker stopped");
    }

    async fn process(&self, job: QueueJob) {
        use futures_util::StreamExt;

        let thread_id = job.request.thread_id.clone();
        let channel = job.result_channel.clone();

        if self.job_cancelled(&thread_id).await {
            tracing::debug!(thread_id = %thread_id, "job already cancelled; skipping");
            return;
        }

        // The worker competes for its own instance's pool like any
        // local request, with a bounded retry.
        let slot = match self.acquire_with_retries(&job.request).await {
            Some(slot) => slot,
            None => {
                self.publish(
                    &channel,
                    &ResultMessage::Error {
                        kind: ErrorKind::PoolExhaustedGlobal,
                        message: "no worker capacity for failover job".to_string(),
                    },
                )
                .await;
                return;
            }
        };

        tracing::info!(thread_id = %thread_id, consumer = %self.consumer, "executing failover job");

        let mut stream = match self.pipeline.execute(job.request, slot).await {
            Ok(stream) => stream,
            Err(err) => {
                self.publish(
                    &channel,
                    &ResultMessage::Error {
                        kind: err.kind(),
                        message: err.to_string(),
                    },
                )
                .await;
                return;
            }
        };

        let mut batch: Vec<String> = Vec::new();
        while let Some(event) = stream.next().await {
            match event {
                StreamEvent::Chunk { content } => {
                    batch.push(content);
                    if batch.len() >= self.config.chunk_batch_size {
                        self.publish(
                            &channel,
                            &ResultMessage::Chunks {
                                contents: std::mem::take(&mut batch),
                            },
                        )
                        .await;
                        if self.job_cancelled(&thread_id).await {
                            tracing::debug!(thread_id = %thread_id, "job cancelled mid-stream");
                            return;
                        }
                    }
                }
                StreamEvent::Done => {
                    if !batch.is_empty() {
                        self.publish(
                            &channel,
                            &ResultMessage::Chunks {
                                contents: std::mem::take(&mut batch),
                            },
                        )
                        .await;
                    }
                    self.publish(&channel, &ResultMessage::Done).await;
                    return;
                }
                StreamEvent::Error { kind, message, .. } => {
                    if !batch.is_empty() {
                        self.publish(
                            &channel,
                            &ResultMessage::Chunks {
                                contents: std::mem::take(&mut batch),
                            },
                        )
                        .await;
                    }
                    self.publish(&channel, &ResultMessage::Error { kind, message })
                        .await;
                    return;
                }
                StreamEvent::Heartbeat => {}
            }
        }

        // Stream ended without a terminal event.
        self.publish(
            &channel,
            &ResultMessage::Error {
                kind: ErrorKind::Internal,
                message: "worker stream ended unexpectedly".to_string(),
            },
        )
        .await;
    }

    async fn acquire_with_retries(&self, request: &StreamRequest) -> Option<crate::pool::PoolSlot> {
        for attempt in 0..self.config.max_retries.max(1) {
            match self.pool.acquire(&request.user_id, &request.thread_id).await {
                PoolAdmission::Admitted(slot) => return Some(slot),
                PoolAdmission::GlobalExhausted { .. } | PoolAdmission::UserExhausted { .. } => {
                    let delay = Duration::from_millis(100) * 2u32.pow(attempt.min(4));
                    tokio::time::sleep(delay).await;
                }
            }
        }
        None
    }

    async fn job_cancelled(&self, thread_id: &str) -> bool {
        matches!(self.store.get(&cancel_key(thread_id)).await, Ok(Some(_)))
    }

    async fn publish(&self, channel: &str, message: &ResultMessage) {
        let payload = match serde_json::to_string(message) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(error = %err, "failed to serialize result message");
                return;
            }
        };
        if let Err(err) = self.store.publish(channel, &payload).await {
            tracing::warn!(error = %err, channel = %channel, "result publish failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitBreakerRegistry;
    use crate::cache::TieredCache;
    use crate::config::{Config, ProviderConfig, RuntimeToggles};
    use crate::limiter::RateLimiter;
    use crate::providers::fake::FakeProvider;
    use crate::providers::ProviderRegistry;
    use crate::request::GenerationParams;
    use crate::store::MemoryStore;
    use crate::tracker::ExecutionTracker;
    use futures_util::StreamExt;

    fn test_config() -> Config {
        Config {
            providers: vec![ProviderConfig {
                name: "fake".to_string(),
                kind: "fake".to_string(),
                models: vec!["test-model".to_string()],
                ..ProviderConfig::default()
            }],
            ..Config::default()
        }
    }

    fn build_pipeline(
        store: &Arc<dyn SharedStore>,
        config: &Config,
        provider: FakeProvider,
    ) -> Arc<Pipeline> {
        let breakers = Arc::new(CircuitBreakerRegistry::new(
            store.clone(),
            config.breaker.clone(),
        ));
        let mut registry = ProviderRegistry::from_config(&[], breakers);
        registry.register_instance("fake", Arc::new(provider));

        Pipeline::new(
            config,
            Arc::new(TieredCache::new(
                store.clone(),
                config.cache.l1_max_size,
                Duration::from_secs(config.cache.ttl_seconds),
            )),
            Arc::new(RateLimiter::new(store.clone(), config.rate_limit.clone())),
            Arc::new(registry),
            ExecutionTracker::new(1.0, 1000),
            Arc::new(RuntimeToggles::from_config(config)),
        )
    }

    fn request(thread_id: &str) -> StreamRequest {
        StreamRequest {
            query: "queued question".to_string(),
            model: "test-model".to_string(),
            provider: None,
            user_id: "u1".to_string(),
            thread_id: thread_id.to_string(),
            params: GenerationParams::default(),
        }
    }

    async fn collect(mut stream: EventStream) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event);
        }
        events
    }

    fn spawn_worker(
        store: &Arc<dyn SharedStore>,
        config: &Config,
        provider: FakeProvider,
    ) -> CancellationToken {
        let pipeline = build_pipeline(store, config, provider);
        let pool = crate::pool::PoolCoordinator::new(store.clone(), config.pool.clone());
        let worker = QueueWorker::new(store.clone(), pipeline, pool, config.queue.clone());
        let token = CancellationToken::new();
        let child = token.clone();
        tokio::spawn(async move { worker.run(child).await });
        token
    }

    #[tokio::test]
    async fn job_round_trips_through_worker() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let config = test_config();
        let shutdown = spawn_worker(
            &store,
            &config,
            FakeProvider::new("fake").with_chunks(["queued ", "answer"]),
        );

        let failover = QueueFailover::new(
            store.clone(),
            &config.queue,
            Duration::from_secs(15),
        );
        let stream = failover
            .enqueue_and_stream(request("t-q1"))
            .await
            .expect("enqueue");
        let events = collect(stream).await;

        let chunks: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Chunk { content } => Some(content.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(chunks, vec!["queued ", "answer"]);
        assert_eq!(events.last(), Some(&StreamEvent::Done));

        shutdown.cancel();
    }

    #[tokio::test]
    async fn chunk_batches_preserve_order() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let mut config = test_config();
        config.queue.chunk_batch_size = 2;
        let shutdown = spawn_worker(
            &store,
            &config,
            FakeProvider::new("fake").with_chunks(["1", "2", "3", "4", "5"]),
        );

        let failover =
            QueueFailover::new(store.clone(), &config.queue, Duration::from_secs(15));
        let stream = failover
            .enqueue_and_stream(request("t-batch"))
            .await
            .expect("enqueue");
        let events = collect(stream).await;

        let chunks: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Chunk { content } => Some(content.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(chunks, vec!["1", "2", "3", "4", "5"]);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn no_worker_times_out_with_heartbeats() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let mut config = test_config();
        config.queue.timeout_seconds = 1;

        let failover = QueueFailover::new(
            store.clone(),
            &config.queue,
            Duration::from_millis(250),
        );
        let stream = failover
            .enqueue_and_stream(request("t-orphan"))
            .await
            .expect("enqueue");
        let events = collect(stream).await;

        let heartbeats = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::Heartbeat))
            .count();
        assert!(heartbeats >= 2, "expected heartbeats while waiting");

        match events.last() {
            Some(StreamEvent::Error { kind, .. }) => {
                assert_eq!(*kind, ErrorKind::QueueTimeout);
            }
            other => panic!("expected queue timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn worker_forwards_pre_stream_errors() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let config = test_config();
        let shutdown = spawn_worker(&store, &config, FakeProvider::new("fake"));

        let failover =
            QueueFailover::new(store.clone(), &config.queue, Duration::from_secs(15));

        // Invalid on the worker side: the model is not whitelisted.
        let mut bad = request("t-bad");
        bad.model = "unknown-model".to_string();
        let stream = failover.enqueue_and_stream(bad).await.expect("enqueue");
        let events = collect(stream).await;

        match events.last() {
            Some(StreamEvent::Error { kind, .. }) => assert_eq!(*kind, ErrorKind::Validation),
            other => panic!("expected validation error, got {other:?}"),
        }

        shutdown.cancel();
    }

    #[tokio::test]
    async fn client_disconnect_sets_cancel_flag() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let mut config = test_config();
        config.queue.chunk_batch_size = 1;
        let shutdown = spawn_worker(
            &store,
            &config,
            FakeProvider::new("fake")
                .with_chunks(["a", "b", "c", "d", "e", "f"])
                .with_chunk_delay(Duration::from_millis(40)),
        );

        let failover =
            QueueFailover::new(store.clone(), &config.queue, Duration::from_secs(15));
        let mut stream = failover
            .enqueue_and_stream(request("t-cancel"))
            .await
            .expect("enqueue");

        // Take the first chunk, then hang up.
        loop {
            match stream.next().await {
                Some(StreamEvent::Chunk { .. }) => break,
                Some(_) => continue,
                None => panic!("stream ended before first chunk"),
            }
        }
        drop(stream);

        tokio::time::sleep(Duration::from_millis(400)).await;
        let flag = store.get(&cancel_key("t-cancel")).await.expect("get");
        assert_eq!(flag.as_deref(), Some("1"));

        shutdown.cancel();
    }
}
