//! Shared application state for the gateway server.

use std::sync::Arc;
use std::time::Duration;

use streamgate_core::admission::LoadShedder;
use streamgate_core::cache::TieredCache;
use streamgate_core::config::{Config, RuntimeToggles};
use streamgate_core::limiter::RateLimiter;
use streamgate_core::pipeline::Pipeline;
use streamgate_core::pool::PoolCoordinator;
use streamgate_core::providers::ProviderRegistry;
use streamgate_core::queue::QueueFailover;
use streamgate_core::store::SharedStore;
use streamgate_core::tracker::ExecutionTracker;

/// Shared application state accessible by all route handlers.
///
/// One instance per process; every coordination point (cache, pool,
/// tracker, toggles) lives here as an owned value rather than as
/// module-level state.
pub struct AppState {
    /// Loaded configuration.
    pub config: Config,
    /// Shared coordination store.
    pub store: Arc<dyn SharedStore>,
    /// Request lifecycle orchestrator.
    pub pipeline: Arc<Pipeline>,
    /// Distributed connection pool.
    pub pool: Arc<PoolCoordinator>,
    /// Admission-layer load shedder.
    pub shedder: Arc<LoadShedder>,
    /// Queue failover producer.
    pub failover: Arc<QueueFailover>,
    /// Runtime-adjustable knobs.
    pub toggles: Arc<RuntimeToggles>,
    /// Stage-timing tracker.
    pub tracker: Arc<ExecutionTracker>,
}

impl AppState {
    /// Wire up the component graph over a store and provider registry.
    ///
    /// The registry is passed in (rather than built here) so tests and
    /// alternative binaries can seed scripted providers.
    pub fn new(
        config: Config,
        store: Arc<dyn SharedStore>,
        registry: ProviderRegistry,
    ) -> Arc<Self> {
        let cache = Arc::new(TieredCache::new(
            store.clone(),
            config.cache.l1_max_size,
            Duration::from_secs(config.cache.ttl_seconds),
        ));
        let limiter = Arc::new(RateLimiter::new(store.clone(), config.rate_limit.clone()));
        let tracker = ExecutionTracker::new(
            config.tracker.sample_rate,
            config.tracker.ring_capacity,
        );
        let toggles = Arc::new(RuntimeToggles::from_config(&config));
        let pool = PoolCoordinator::new(store.clone(), config.pool.clone());
        let shedder = Arc::new(LoadShedder::new(config.load_shed.clone()));
        let failover = Arc::new(QueueFailover::new(
            store.clone(),
            &config.queue,
            Duration::from_secs(config.timeouts.sse_heartbeat_secs),
        ));

        let pipeline = Pipeline::new(
            &config,
            cache,
            limiter,
            Arc::new(registry),
            tracker.clone(),
            toggles.clone(),
        );

        Arc::new(Self {
            config,
            store,
            pipeline,
            pool,
            shedder,
            failover,
            toggles,
            tracker,
        })
    }
}
