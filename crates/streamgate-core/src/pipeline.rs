//! The request lifecycle orchestrator.
//!
//! Drives the fixed stages for one admitted request and produces a lazy
//! sequence of [`StreamEvent`]s:
//!
//! 1. validation, 2. cache lookup, 3. rate limit, 4. provider
//! selection, 5. token streaming (with failover while no chunk has been
//! flushed), 6. cache population, 7. cleanup.
//!
//! Stages 1–4 run before the event stream is returned, so their
//! failures map to HTTP status codes; stage 5 onward runs inside the
//! stream and failures surface as SSE `error` events. Cleanup releases
//! the pool slot on every exit path, including client disconnects.

use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;

use crate::cache::{self, Flight, FlightGuard, TieredCache};
use crate::config::{Config, RuntimeToggles, TimeoutsConfig};
use crate::error::GatewayError;
use crate::events::StreamEvent;
use crate::limiter::RateLimiter;
use crate::pool::PoolSlot;
use crate::providers::{ProviderRegistry, TokenProvider};
use crate::request::StreamRequest;
use crate::tracker::ExecutionTracker;
use crate::validate::RequestValidator;

/// Stage identifiers, stable strings shared by the tracker and logs.
pub mod stage {
    /// Request validation.
    pub const VALIDATION: &str = "1";
    /// Cache lookup.
    pub const CACHE_LOOKUP: &str = "2";
    /// Rate limiting.
    pub const RATE_LIMIT: &str = "3";
    /// Provider selection.
    pub const PROVIDER_SELECT: &str = "4";
    /// Token streaming.
    pub const STREAMING: &str = "5";
    /// Cache population.
    pub const CACHE_WRITE: &str = "6";
    /// Cleanup.
    pub const CLEANUP: &str = "7";
}

/// The event sequence produced for one request.
pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

enum StreamOutcome {
    Complete(String),
    Failed(GatewayError),
    Cancelled,
}

/// The per-process orchestrator, shared by the HTTP handlers and the
/// failover queue worker.
pub struct Pipeline {
    validator: RequestValidator,
    cache: Arc<TieredCache>,
    limiter: Arc<RateLimiter>,
    registry: Arc<ProviderRegistry>,
    tracker: Arc<ExecutionTracker>,
    toggles: Arc<RuntimeToggles>,
    timeouts: TimeoutsConfig,
    provider_fanout: u32,
}

impl Pipeline {
    /// Assemble the orchestrator from its owned components.
    pub fn new(
        config: &Config,
        cache: Arc<TieredCache>,
        limiter: Arc<RateLimiter>,
        registry: Arc<ProviderRegistry>,
        tracker: Arc<ExecutionTracker>,
        toggles: Arc<RuntimeToggles>,
    ) -> Arc<Self> {
        Arc::new(Self {
            validator: RequestValidator::from_config(config),
            cache,
            limiter,
            registry,
            tracker,
            toggles,
            timeouts: config.timeouts.clone(),
            provider_fanout: config.provider_fanout.max(1),
        })
    }

    /// The tracker shared with the admin surface.
    pub fn tracker(&self) -> &Arc<ExecutionTracker> {
        &self.tracker
    }

    /// The cache shared with the admin surface.
    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    /// Run the full lifecycle for an admitted request.
    ///
    /// The pool slot is released exactly once on every exit path: on
    /// pre-stream failure before this returns, otherwise by the cleanup
    /// stage inside the returned stream.
    pub async fn execute(
        self: &Arc<Self>,
        mut request: StreamRequest,
        slot: PoolSlot,
    ) -> Result<EventStream, GatewayError> {
        let thread_id = request.thread_id.clone();

        // Stage 1: validation.
        {
            let mut scope = self.tracker.stage(&thread_id, stage::VALIDATION);
            match self.validator.validate(&mut request) {
                Ok(()) => scope.complete(),
                Err(err) => {
                    scope.fail();
                    drop(scope);
                    self.cleanup(&thread_id, &slot).await;
                    return Err(err);
                }
            }
        }

        let fingerprint = cache::fingerprint(
            &request.query,
            &request.model,
            request.provider.as_deref(),
            &request.params,
        );
        let caching = self.toggles.caching_enabled();

        // Stage 2: cache lookup.
        if caching {
            let mut scope = self.tracker.stage(&thread_id, stage::CACHE_LOOKUP);
            let lookup = tokio::time::timeout(
                Duration::from_millis(self.timeouts.cache_lookup_ms),
                self.cache.get(&fingerprint),
            )
            .await;
            match lookup {
                Ok(Some(content)) => {
                    scope.complete_with("hit");
                    drop(scope);
                    tracing::debug!(thread_id = %thread_id, "serving cached response");
                    return Ok(self.serve_cached(request, slot, content));
                }
                Ok(None) => scope.complete_with("miss"),
                Err(_) => {
                    tracing::warn!(thread_id = %thread_id, "cache lookup timed out");
                    scope.complete_with("timeout");
                }
            }
        }

        // Stage 3: rate limit.
        {
            let mut scope = self.tracker.stage(&thread_id, stage::RATE_LIMIT);
            let decision = tokio::time::timeout(
                Duration::from_millis(self.timeouts.rate_limit_ms),
                self.limiter.check(&request.user_id, 1),
            )
            .await;
            match decision {
                Ok(decision) if !decision.allowed => {
                    scope.fail();
                    drop(scope);
                    self.cleanup(&thread_id, &slot).await;
                    return Err(GatewayError::RateLimited {
                        retry_after_secs: decision.retry_after_secs,
                    });
                }
                Ok(_) => scope.complete(),
                Err(_) => {
                    // Fail open; the limiter is advisory under timeout.
                    tracing::warn!(thread_id = %thread_id, "rate limit check timed out");
                    scope.complete_with("timeout");
                }
            }
        }

        // Stage 4: provider selection.
        let provider = {
            let mut scope = self.tracker.stage(&thread_id, stage::PROVIDER_SELECT);
            match self
                .registry
                .select_healthy(request.provider.as_deref(), &[])
                .await
            {
                Some(provider) => {
                    scope.complete_with(provider.name());
                    provider
                }
                None => {
                    scope.fail();
                    drop(scope);
                    self.cleanup(&thread_id, &slot).await;
                    return Err(GatewayError::AllProvidersUnavailable);
                }
            }
        };

        // Stages 5–7 run inside the stream.
        let (tx, rx) = mpsc::channel::<StreamEvent>(1);
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            pipeline
                .run_stream(request, fingerprint, provider, slot, tx)
                .await;
        });

        Ok(receiver_stream(rx))
    }

    /// Serve a cache hit: the cached string as one chunk, then done.
    fn serve_cached(
        self: &Arc<Self>,
        request: StreamRequest,
        slot: PoolSlot,
        content: String,
    ) -> EventStream {
        let (tx, rx) = mpsc::channel::<StreamEvent>(1);
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            let _ = tx.send(StreamEvent::Chunk { content }).await;
            let _ = tx.send(StreamEvent::Done).await;
            pipeline.cleanup(&request.thread_id, &slot).await;
        });
        receiver_stream(rx)
    }

    async fn run_stream(
        self: Arc<Self>,
        request: StreamRequest,
        fingerprint: String,
        provider: Arc<dyn TokenProvider>,
        slot: PoolSlot,
        tx: mpsc::Sender<StreamEvent>,
    ) {
        let thread_id = request.thread_id.clone();
        let deadline = Instant::now() + Duration::from_secs(self.timeouts.request_secs);
        let caching = self.toggles.caching_enabled();

        // Single-flight: a concurrent identical miss subscribes to this
        // request's result instead of opening its own provider stream.
        let mut flight_guard: Option<FlightGuard> = None;
        if caching {
            match self.cache.join_flight(&fingerprint) {
                Flight::Leader(guard) => flight_guard = Some(guard),
                Flight::Follower(waiter) => {
                    let mut scope = self.tracker.stage(&thread_id, stage::STREAMING);
                    let wait = deadline.saturating_duration_since(Instant::now());
                    if let Some(content) = waiter.wait(wait).await {
                        scope.complete_with("deduplicated");
                        drop(scope);
                        if tx.send(StreamEvent::Chunk { content }).await.is_ok() {
                            let _ = tx.send(StreamEvent::Done).await;
                        }
                        self.cleanup(&thread_id, &slot).await;
                        return;
                    }
                    // The leader failed; stream independently.
                    scope.complete_with("dedup_retry");
                    drop(scope);
                    match self.cache.join_flight(&fingerprint) {
                        Flight::Leader(guard) => flight_guard = Some(guard),
                        Flight::Follower(_) => {}
                    }
                }
            }
        }

        let outcome = self
            .stream_tokens(&request, provider, &tx, deadline)
            .await;

        match outcome {
            StreamOutcome::Complete(full_text) => {
                // Stage 6: cache population, best-effort.
                if caching && !full_text.is_empty() {
                    let mut scope = self.tracker.stage(&thread_id, stage::CACHE_WRITE);
                    self.cache.set(&fingerprint, &full_text).await;
                    scope.complete();
                }
                if let Some(guard) = flight_guard.take() {
                    guard.publish(Ok(full_text));
                }
                let _ = tx.send(StreamEvent::Done).await;
            }
            StreamOutcome::Failed(err) => {
                tracing::warn!(
                    thread_id = %thread_id,
                    error = %err,
                    "stream failed",
                );
                if let Some(guard) = flight_guard.take() {
                    guard.publish(Err(err.to_string()));
                }
                let _ = tx
                    .send(StreamEvent::Error {
                        kind: err.kind(),
                        message: err.to_string(),
                        details: None,
                    })
                    .await;
            }
            StreamOutcome::Cancelled => {
                tracing::debug!(thread_id = %thread_id, "client disconnected");
                // No event can reach the client, nothing is cached, and
                // the dropped flight guard unblocks any subscribers.
            }
        }

        self.cleanup(&thread_id, &slot).await;
    }

    /// Stage 5 with failover: try up to `provider_fanout` providers,
    /// but only while no chunk has reached the client.
    async fn stream_tokens(
        &self,
        request: &StreamRequest,
        first_provider: Arc<dyn TokenProvider>,
        tx: &mpsc::Sender<StreamEvent>,
        deadline: Instant,
    ) -> StreamOutcome {
        let thread_id = &request.thread_id;
        let breakers = self.registry.breakers();
        let mut excluded: Vec<String> = Vec::new();
        let mut provider = Some(first_provider);
        let mut last_error: Option<GatewayError> = None;

        for attempt in 0..self.provider_fanout {
            let current = match provider.take() {
                Some(provider) => provider,
                None => {
                    // Re-selection after a pre-chunk failure.
                    let mut scope = self.tracker.stage(thread_id, stage::PROVIDER_SELECT);
                    match self
                        .registry
                        .select_healthy(request.provider.as_deref(), &excluded)
                        .await
                    {
                        Some(provider) => {
                            scope.complete_with(provider.name());
                            provider
                        }
                        None => {
                            scope.fail();
                            return StreamOutcome::Failed(
                                last_error.unwrap_or(GatewayError::AllProvidersUnavailable),
                            );
                        }
                    }
                }
            };

            let name = current.name().to_string();
            if !breakers.before(&name).await {
                excluded.push(name);
                continue;
            }

            let mut scope = self.tracker.stage(thread_id, stage::STREAMING);
            tracing::debug!(
                thread_id = %thread_id,
                provider = %name,
                attempt,
                "streaming tokens",
            );

            let connect = tokio::time::timeout(
                Duration::from_secs(self.timeouts.provider_connect_secs),
                current.stream(
                    &request.query,
                    &request.model,
                    thread_id,
                    &request.params,
                ),
            )
            .await;

            let mut stream = match connect {
                Ok(Ok(stream)) => stream,
                Ok(Err(err)) => {
                    breakers.on_failure(&name).await;
                    scope.fail();
                    last_error = Some(GatewayError::ProviderStream {
                        provider: name.clone(),
                        message: err.to_string(),
                    });
                    excluded.push(name);
                    continue;
                }
                Err(_) => {
                    breakers.on_failure(&name).await;
                    scope.fail();
                    last_error = Some(GatewayError::ProviderStream {
                        provider: name.clone(),
                        message: "provider connect timed out".to_string(),
                    });
                    excluded.push(name);
                    continue;
                }
            };

            let mut sent_any = false;
            let mut collected = String::new();
            let read_timeout = Duration::from_secs(self.timeouts.provider_read_secs);

            loop {
                if Instant::now() >= deadline {
                    scope.fail();
                    return StreamOutcome::Failed(GatewayError::Internal {
                        message: "total request deadline exceeded".to_string(),
                    });
                }

                match tokio::time::timeout(read_timeout, stream.next()).await {
                    Ok(Some(Ok(chunk))) => {
                        // At most one chunk is buffered between provider
                        // and client; a slow client backpressures here.
                        if tx
                            .send(StreamEvent::Chunk {
                                content: chunk.clone(),
                            })
                            .await
                            .is_err()
                        {
                            // Receiver dropped: client disconnected. The
                            // scope drop records the cancelled outcome.
                            return StreamOutcome::Cancelled;
                        }
                        sent_any = true;
                        collected.push_str(&chunk);
                    }
                    Ok(Some(Err(err))) => {
                        breakers.on_failure(&name).await;
                        scope.fail();
                        if sent_any {
                            return StreamOutcome::Failed(GatewayError::ProviderStream {
                                provider: name,
                                message: err.to_string(),
                            });
                        }
                        last_error = Some(GatewayError::ProviderStream {
                            provider: name.clone(),
                            message: err.to_string(),
                        });
                        excluded.push(name);
                        break;
                    }
                    Ok(None) => {
                        breakers.on_success(&name).await;
                        scope.complete();
                        return StreamOutcome::Complete(collected);
                    }
                    Err(_) => {
                        breakers.on_failure(&name).await;
                        scope.fail();
                        let message = "provider read timed out".to_string();
                        if sent_any {
                            return StreamOutcome::Failed(GatewayError::ProviderStream {
                                provider: name,
                                message,
                            });
                        }
                        last_error = Some(GatewayError::ProviderStream {
                            provider: name.clone(),
                            message,
                        });
                        excluded.push(name);
                        break;
                    }
                }
            }
        }

        StreamOutcome::Failed(last_error.unwrap_or(GatewayError::AllProvidersUnavailable))
    }

    /// Stage 7: release the pool slot and finalize samples.
    async fn cleanup(&self, thread_id: &str, slot: &PoolSlot) {
        let mut scope = self.tracker.stage(thread_id, stage::CLEANUP);
        slot.release().await;
        scope.complete();
    }
}

fn receiver_stream(rx: mpsc::Receiver<StreamEvent>) -> EventStream {
    Box::pin(futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (event, rx))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{CircuitBreakerRegistry, CircuitState};
    use crate::config::ProviderConfig;
    use crate::error::ErrorKind;
    use crate::pool::{PoolAdmission, PoolCoordinator};
    use crate::providers::fake::{FailureMode, FakeProvider};
    use crate::request::GenerationParams;
    use crate::store::MemoryStore;

    struct Harness {
        pipeline: Arc<Pipeline>,
        pool: Arc<PoolCoordinator>,
        breakers: Arc<CircuitBreakerRegistry>,
    }

    fn fake_provider_config() -> ProviderConfig {
        ProviderConfig {
            name: "fake".to_string(),
            kind: "fake".to_string(),
            models: vec!["test-model".to_string(), "gpt-3.5-turbo".to_string()],
            ..ProviderConfig::default()
        }
    }

    fn harness_with(
        config: Config,
        providers: Vec<(&str, FakeProvider)>,
    ) -> Harness {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let store: Arc<dyn crate::store::SharedStore> = store;

        let breakers = Arc::new(CircuitBreakerRegistry::new(
            store.clone(),
            config.breaker.clone(),
        ));
        let mut registry = ProviderRegistry::from_config(&[], breakers.clone());
        for (name, provider) in providers {
            registry.register_instance(name, Arc::new(provider));
        }

        let cache = Arc::new(TieredCache::new(
            store.clone(),
            config.cache.l1_max_size,
            Duration::from_secs(config.cache.ttl_seconds),
        ));
        let limiter = Arc::new(RateLimiter::new(store.clone(), config.rate_limit.clone()));
        let tracker = ExecutionTracker::new(1.0, 1000);
        let toggles = Arc::new(RuntimeToggles::from_config(&config));
        let pool = PoolCoordinator::new(store, config.pool.clone());

        let pipeline = Pipeline::new(
            &config,
            cache,
            limiter,
            Arc::new(registry),
            tracker,
            toggles,
        );

        Harness {
            pipeline,
            pool,
            breakers,
        }
    }

    fn base_config() -> Config {
        Config {
            providers: vec![fake_provider_config()],
            ..Config::default()
        }
    }

    fn request(thread_id: &str) -> StreamRequest {
        StreamRequest {
            query: "hello world".to_string(),
            model: "test-model".to_string(),
            provider: None,
            user_id: "u1".to_string(),
            thread_id: thread_id.to_string(),
            params: GenerationParams::default(),
        }
    }

    async fn slot(harness: &Harness, request: &StreamRequest) -> PoolSlot {
        match harness.pool.acquire(&request.user_id, &request.thread_id).await {
            PoolAdmission::Admitted(slot) => slot,
            _ => panic!("pool should admit in tests"),
        }
    }

    async fn collect(mut stream: EventStream) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn happy_path_streams_chunks_then_done() {
        let harness = harness_with(
            base_config(),
            vec![("fake", FakeProvider::new("fake").with_chunks(["HEL", "LO"]))],
        );
        let req = request("t-happy");
        let slot = slot(&harness, &req).await;

        let stream = harness
            .pipeline
            .execute(req, slot)
            .await
            .expect("stream");
        let events = collect(stream).await;

        assert_eq!(
            events,
            vec![
                StreamEvent::Chunk {
                    content: "HEL".to_string()
                },
                StreamEvent::Chunk {
                    content: "LO".to_string()
                },
                StreamEvent::Done,
            ]
        );

        // Slot released by cleanup.
        assert_eq!(
            harness.pool.global_active().await,
            Some(0),
            "pool slot must be released"
        );
    }

    #[tokio::test]
    async fn validation_failure_is_pre_stream_and_releases_slot() {
        let harness = harness_with(base_config(), vec![("fake", FakeProvider::new("fake"))]);
        let mut req = request("t-invalid");
        req.query = String::new();
        let slot = slot(&harness, &req).await;

        let err = match harness.pipeline.execute(req, slot).await {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(harness.pool.global_active().await, Some(0));
    }

    #[tokio::test]
    async fn second_identical_request_is_served_from_cache() {
        let harness = harness_with(
            base_config(),
            vec![("fake", FakeProvider::new("fake").with_chunks(["HELLO"]))],
        );

        let first = request("t-A");
        let slot_a = slot(&harness, &first).await;
        let events = collect(
            harness
                .pipeline
                .execute(first, slot_a)
                .await
                .expect("stream"),
        )
        .await;
        assert_eq!(events.last(), Some(&StreamEvent::Done));

        // Same fields, different thread: bypasses stages 3-6.
        let second = request("t-B");
        let slot_b = slot(&harness, &second).await;
        let events = collect(
            harness
                .pipeline
                .execute(second, slot_b)
                .await
                .expect("stream"),
        )
        .await;

        assert_eq!(
            events,
            vec![
                StreamEvent::Chunk {
                    content: "HELLO".to_string()
                },
                StreamEvent::Done,
            ]
        );

        // Cache-hit requests record a "hit" outcome on stage 2.
        let tracker = harness.pipeline.tracker();
        assert!(tracker.sample_count(stage::CACHE_LOOKUP) >= 2);
    }

    #[tokio::test]
    async fn whitespace_variant_shares_the_cache_entry() {
        let harness = harness_with(
            base_config(),
            vec![("fake", FakeProvider::new("fake").with_chunks(["CACHED"]))],
        );

        let first = request("t-A");
        let slot_a = slot(&harness, &first).await;
        collect(harness.pipeline.execute(first, slot_a).await.expect("stream")).await;

        let mut second = request("t-B");
        second.query = "  Hello   WORLD ".to_string();
        let slot_b = slot(&harness, &second).await;
        let events = collect(
            harness
                .pipeline
                .execute(second, slot_b)
                .await
                .expect("stream"),
        )
        .await;

        assert_eq!(
            events[0],
            StreamEvent::Chunk {
                content: "CACHED".to_string()
            }
        );
    }

    #[tokio::test]
    async fn rate_limited_user_gets_pre_stream_error() {
        let mut config = base_config();
        config.rate_limit.tiers.insert("free".to_string(), 1);
        let harness = harness_with(
            config,
            vec![("fake", FakeProvider::new("fake").with_chunks(["A"]))],
        );

        let first = request("t-1");
        let slot_a = slot(&harness, &first).await;
        collect(harness.pipeline.execute(first, slot_a).await.expect("stream")).await;

        // Different query so the cache does not absorb the request.
        let mut second = request("t-2");
        second.query = "another question".to_string();
        let slot_b = slot(&harness, &second).await;
        let err = match harness.pipeline.execute(second, slot_b).await {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert_eq!(err.kind(), ErrorKind::RateLimited);
    }

    #[tokio::test]
    async fn first_chunk_failure_fails_over_to_next_provider() {
        let mut config = base_config();
        config.breaker.failure_threshold = 1;
        config.providers = vec![fake_provider_config()];
        let harness = harness_with(
            config,
            vec![
                (
                    "p1",
                    FakeProvider::new("p1").with_failure(FailureMode::BeforeFirstChunk),
                ),
                ("p2", FakeProvider::new("p2").with_chunks(["OK"])),
            ],
        );

        let mut req = request("t-failover");
        req.provider = None;
        let slot = slot(&harness, &req).await;
        let events = collect(harness.pipeline.execute(req, slot).await.expect("stream")).await;

        assert_eq!(
            events,
            vec![
                StreamEvent::Chunk {
                    content: "OK".to_string()
                },
                StreamEvent::Done,
            ]
        );

        // p1's breaker opened on its single allowed failure.
        assert_eq!(
            harness.breakers.current_state("p1").await,
            CircuitState::Open
        );

        // One selection sample for each provider attempt.
        assert!(harness.pipeline.tracker().sample_count(stage::PROVIDER_SELECT) >= 2);
    }

    #[tokio::test]
    async fn mid_stream_failure_surfaces_error_and_skips_cache() {
        let harness = harness_with(
            base_config(),
            vec![(
                "fake",
                FakeProvider::new("fake")
                    .with_chunks(["one ", "two ", "three"])
                    .with_failure(FailureMode::AfterChunks(2)),
            )],
        );

        let req = request("t-midfail");
        let slot_a = slot(&harness, &req).await;
        let events = collect(harness.pipeline.execute(req, slot_a).await.expect("stream")).await;

        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], StreamEvent::Chunk { .. }));
        assert!(matches!(events[1], StreamEvent::Chunk { .. }));
        match &events[2] {
            StreamEvent::Error { kind, .. } => {
                assert_eq!(*kind, ErrorKind::ProviderStreamFailure);
            }
            other => panic!("expected error event, got {other:?}"),
        }
        // No done event after a mid-stream error.
        assert_ne!(events.last(), Some(&StreamEvent::Done));

        // The partial response must not be cached.
        let retry = request("t-retry");
        let slot_b = slot(&harness, &retry).await;
        let events = collect(
            harness
                .pipeline
                .execute(retry, slot_b)
                .await
                .expect("stream"),
        )
        .await;
        assert!(matches!(events.last(), Some(StreamEvent::Error { .. })));
    }

    #[tokio::test]
    async fn all_providers_down_is_pre_stream_error() {
        let mut config = base_config();
        config.breaker.failure_threshold = 1;
        let harness = harness_with(
            config,
            vec![(
                "fake",
                FakeProvider::new("fake").with_failure(FailureMode::BeforeFirstChunk),
            )],
        );

        // Trip the only provider's breaker.
        harness.breakers.on_failure("fake").await;

        let req = request("t-none");
        let slot = slot(&harness, &req).await;
        let err = match harness.pipeline.execute(req, slot).await {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert_eq!(err.kind(), ErrorKind::AllProvidersUnavailable);
        assert_eq!(harness.pool.global_active().await, Some(0));
    }

    #[tokio::test]
    async fn client_disconnect_releases_slot_without_caching() {
        let harness = harness_with(
            base_config(),
            vec![(
                "fake",
                FakeProvider::new("fake")
                    .with_chunks(["a", "b", "c", "d", "e"])
                    .with_chunk_delay(Duration::from_millis(20)),
            )],
        );

        let req = request("t-gone");
        let slot_a = slot(&harness, &req).await;
        let mut stream = harness.pipeline.execute(req, slot_a).await.expect("stream");

        // Read one chunk, then hang up.
        let first = stream.next().await.expect("first chunk");
        assert!(matches!(first, StreamEvent::Chunk { .. }));
        drop(stream);

        // Cleanup runs asynchronously after the disconnect.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(harness.pool.global_active().await, Some(0));

        // Nothing was cached for the aborted request.
        let retry = request("t-after-gone");
        let slot_b = slot(&harness, &retry).await;
        let events = collect(
            harness
                .pipeline
                .execute(retry, slot_b)
                .await
                .expect("stream"),
        )
        .await;
        assert_eq!(events.len(), 6, "full stream plus done, not a cache hit");
    }

    #[tokio::test]
    async fn disabled_caching_skips_lookup_and_population() {
        let mut config = base_config();
        config.cache.enabled = false;
        let harness = harness_with(
            config,
            vec![("fake", FakeProvider::new("fake").with_chunks(["X"]))],
        );

        let first = request("t-1");
        let slot_a = slot(&harness, &first).await;
        collect(harness.pipeline.execute(first, slot_a).await.expect("stream")).await;

        let second = request("t-2");
        let slot_b = slot(&harness, &second).await;
        let events = collect(
            harness
                .pipeline
                .execute(second, slot_b)
                .await
                .expect("stream"),
        )
        .await;
        // Served by the provider again, not the cache.
        assert_eq!(events.len(), 2);
        assert_eq!(harness.pipeline.cache().stats().l1_hits, 0);
    }

    #[tokio::test]
    async fn tracker_samples_cover_all_stages_of_one_request() {
        let harness = harness_with(
            base_config(),
            vec![("fake", FakeProvider::new("fake").with_chunks(["X"]))],
        );

        let req = request("t-stages");
        let slot_a = slot(&harness, &req).await;
        collect(harness.pipeline.execute(req, slot_a).await.expect("stream")).await;

        let tracker = harness.pipeline.tracker();
        for stage_id in [
            stage::VALIDATION,
            stage::CACHE_LOOKUP,
            stage::RATE_LIMIT,
            stage::PROVIDER_SELECT,
            stage::STREAMING,
            stage::CACHE_WRITE,
            stage::CLEANUP,
        ] {
            assert!(
                tracker.sample_count(stage_id) >= 1,
                "stage {stage_id} has no samples"
            );
        }
    }
}
