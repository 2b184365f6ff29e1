//! Configuration section structs and their serde default functions.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

/// Deployment environment; selects CORS defaults and HSTS policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Local development: permissive CORS, no HSTS.
    #[default]
    Development,
    /// Pre-production: production headers with the configured origins.
    Staging,
    /// Production: strict origin whitelist, full HSTS.
    Production,
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// HTTP server binding and environment settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Host address to bind to. Use "0.0.0.0" behind a load balancer.
    #[serde(default = "default_server_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_server_port")]
    pub port: u16,

    /// Deployment environment.
    #[serde(default)]
    pub environment: Environment,

    /// Exact-match CORS origins. Ignored in development (any origin allowed).
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
            environment: Environment::default(),
            cors_origins: Vec::new(),
        }
    }
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}
fn default_server_port() -> u16 {
    8080
}

// ---------------------------------------------------------------------------
// Shared store
// ---------------------------------------------------------------------------

/// Shared coordination store (Redis) connection settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    /// Redis connection URL.
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Per-operation deadline in milliseconds.
    #[serde(default = "default_store_op_timeout_ms")]
    pub operation_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            operation_timeout_ms: default_store_op_timeout_ms(),
        }
    }
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}
fn default_store_op_timeout_ms() -> u64 {
    1000
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// Two-tier response cache settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Whether response caching is enabled at startup.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum number of entries in the in-process L1 tier.
    #[serde(default = "default_l1_max_size")]
    pub l1_max_size: usize,

    /// Time-to-live in seconds for entries in the shared L2 tier.
    #[serde(default = "default_cache_ttl_seconds")]
    pub ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            l1_max_size: default_l1_max_size(),
            ttl_seconds: default_cache_ttl_seconds(),
        }
    }
}

fn default_l1_max_size() -> usize {
    1000
}
fn default_cache_ttl_seconds() -> u64 {
    3600
}

// ---------------------------------------------------------------------------
// Connection pool
// ---------------------------------------------------------------------------

/// Distributed connection pool limits and health thresholds.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    /// Fleet-wide maximum concurrent active requests.
    #[serde(default = "default_pool_global_max")]
    pub global_max: u64,

    /// Per-user maximum concurrent active requests.
    #[serde(default = "default_pool_per_user_max")]
    pub per_user_max: u64,

    /// Utilization fraction at which the pool reports degraded.
    #[serde(default = "default_pool_degraded_at")]
    pub degraded_at: f64,

    /// Utilization fraction at which the pool reports critical.
    #[serde(default = "default_pool_critical_at")]
    pub critical_at: f64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            global_max: default_pool_global_max(),
            per_user_max: default_pool_per_user_max(),
            degraded_at: default_pool_degraded_at(),
            critical_at: default_pool_critical_at(),
        }
    }
}

fn default_pool_global_max() -> u64 {
    10_000
}
fn default_pool_per_user_max() -> u64 {
    3
}
fn default_pool_degraded_at() -> f64 {
    0.7
}
fn default_pool_critical_at() -> f64 {
    0.9
}

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

/// Per-provider circuit breaker settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BreakerConfig {
    /// Failures within the window that trip the breaker open.
    #[serde(default = "default_breaker_failure_threshold")]
    pub failure_threshold: u32,

    /// Sliding window in seconds for counting failures.
    #[serde(default = "default_breaker_window_seconds")]
    pub window_seconds: u64,

    /// Seconds an open breaker waits before allowing a probe.
    #[serde(default = "default_breaker_cooldown_seconds")]
    pub cooldown_seconds: u64,

    /// Seconds a half-open probe reservation is held before another
    /// caller may claim it.
    #[serde(default = "default_breaker_probe_lease_seconds")]
    pub probe_lease_seconds: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_breaker_failure_threshold(),
            window_seconds: default_breaker_window_seconds(),
            cooldown_seconds: default_breaker_cooldown_seconds(),
            probe_lease_seconds: default_breaker_probe_lease_seconds(),
        }
    }
}

fn default_breaker_failure_threshold() -> u32 {
    5
}
fn default_breaker_window_seconds() -> u64 {
    60
}
fn default_breaker_cooldown_seconds() -> u64 {
    60
}
fn default_breaker_probe_lease_seconds() -> u64 {
    10
}

// ---------------------------------------------------------------------------
// Rate limiter
// ---------------------------------------------------------------------------

/// Per-user request rate limits, grouped by tier.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    /// Requests per minute allowed for each tier.
    #[serde(default = "default_rate_limit_tiers")]
    pub tiers: HashMap<String, u32>,

    /// Tier assigned to users absent from `user_tiers`.
    #[serde(default = "default_rate_limit_default_tier")]
    pub default_tier: String,

    /// Explicit user-to-tier assignments.
    #[serde(default)]
    pub user_tiers: HashMap<String, String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            tiers: default_rate_limit_tiers(),
            default_tier: default_rate_limit_default_tier(),
            user_tiers: HashMap::new(),
        }
    }
}

impl RateLimitConfig {
    /// Resolve the per-minute limit for a user identifier.
    pub fn limit_for(&self, user_id: &str) -> u32 {
        let tier = self
            .user_tiers
            .get(user_id)
            .unwrap_or(&self.default_tier)
            .as_str();
        self.tiers.get(tier).copied().unwrap_or_else(|| {
            self.tiers
                .get(&self.default_tier)
                .copied()
                .unwrap_or(default_free_tier_per_minute())
        })
    }
}

fn default_rate_limit_tiers() -> HashMap<String, u32> {
    let mut tiers = HashMap::new();
    tiers.insert("free".to_string(), default_free_tier_per_minute());
    tiers.insert("pro".to_string(), 600);
    tiers
}
fn default_rate_limit_default_tier() -> String {
    "free".to_string()
}
fn default_free_tier_per_minute() -> u32 {
    60
}

// ---------------------------------------------------------------------------
// Queue failover
// ---------------------------------------------------------------------------

/// Cross-instance queue failover settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    /// Whether pool-exhausted requests fail over to a peer instance.
    #[serde(default = "default_true")]
    pub failover_enabled: bool,

    /// Total seconds a request may wait on its result channel.
    #[serde(default = "default_queue_timeout_seconds")]
    pub timeout_seconds: u64,

    /// Attempts a worker makes to acquire a local pool slot for a job.
    #[serde(default = "default_queue_max_retries")]
    pub max_retries: u32,

    /// Stream depth fraction at which producers start backing off.
    #[serde(default = "default_queue_backpressure_ratio")]
    pub backpressure_threshold_ratio: f64,

    /// Hard ceiling on the job stream depth.
    #[serde(default = "default_queue_max_depth")]
    pub max_depth: u64,

    /// Chunks batched into one result-channel message.
    #[serde(default = "default_queue_chunk_batch")]
    pub chunk_batch_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            failover_enabled: true,
            timeout_seconds: default_queue_timeout_seconds(),
            max_retries: default_queue_max_retries(),
            backpressure_threshold_ratio: default_queue_backpressure_ratio(),
            max_depth: default_queue_max_depth(),
            chunk_batch_size: default_queue_chunk_batch(),
        }
    }
}

fn default_queue_timeout_seconds() -> u64 {
    30
}
fn default_queue_max_retries() -> u32 {
    5
}
fn default_queue_backpressure_ratio() -> f64 {
    0.8
}
fn default_queue_max_depth() -> u64 {
    10_000
}
fn default_queue_chunk_batch() -> usize {
    8
}

// ---------------------------------------------------------------------------
// Load shedding
// ---------------------------------------------------------------------------

/// Admission-layer load shedding settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoadShedConfig {
    /// Whether the load shedder is active.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Token bucket capacity (requests per one-second window).
    #[serde(default = "default_load_shed_max_in_flight")]
    pub max_in_flight: u32,
}

impl Default for LoadShedConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_in_flight: default_load_shed_max_in_flight(),
        }
    }
}

fn default_load_shed_max_in_flight() -> u32 {
    1000
}

// ---------------------------------------------------------------------------
// Execution tracker
// ---------------------------------------------------------------------------

/// Stage-timing sampler settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrackerConfig {
    /// Fraction of requests sampled, in `[0.0, 1.0]`.
    #[serde(default = "default_tracker_sample_rate")]
    pub sample_rate: f64,

    /// Samples retained per stage before the oldest are overwritten.
    #[serde(default = "default_tracker_ring_capacity")]
    pub ring_capacity: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_tracker_sample_rate(),
            ring_capacity: default_tracker_ring_capacity(),
        }
    }
}

fn default_tracker_sample_rate() -> f64 {
    0.1
}
fn default_tracker_ring_capacity() -> usize {
    10_000
}

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

/// One upstream provider entry. Order in the list is the failover
/// tie-break order.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProviderConfig {
    /// Unique provider name (lowercased for matching).
    pub name: String,

    /// Wire adaptor: "openai_compat", "anthropic", or "fake".
    #[serde(default = "default_provider_kind")]
    pub kind: String,

    /// Models this provider serves; also feeds the validation whitelist.
    #[serde(default)]
    pub models: Vec<String>,

    /// API key (unused by the fake adaptor).
    #[serde(default)]
    pub api_key: Option<String>,

    /// Override URL for custom or mock endpoints.
    #[serde(default)]
    pub base_url: Option<String>,
}

fn default_provider_kind() -> String {
    "openai_compat".to_string()
}

// ---------------------------------------------------------------------------
// Timeouts
// ---------------------------------------------------------------------------

/// Per-stage deadlines.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimeoutsConfig {
    /// Cache lookup deadline in milliseconds.
    #[serde(default = "default_cache_lookup_ms")]
    pub cache_lookup_ms: u64,

    /// Rate-limit check deadline in milliseconds.
    #[serde(default = "default_rate_limit_ms")]
    pub rate_limit_ms: u64,

    /// Provider connection deadline in seconds.
    #[serde(default = "default_provider_connect_secs")]
    pub provider_connect_secs: u64,

    /// Per-chunk provider read deadline in seconds.
    #[serde(default = "default_provider_read_secs")]
    pub provider_read_secs: u64,

    /// Total request deadline in seconds.
    #[serde(default = "default_request_secs")]
    pub request_secs: u64,

    /// Interval in seconds between SSE heartbeat comments during waits.
    #[serde(default = "default_heartbeat_secs")]
    pub sse_heartbeat_secs: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            cache_lookup_ms: default_cache_lookup_ms(),
            rate_limit_ms: default_rate_limit_ms(),
            provider_connect_secs: default_provider_connect_secs(),
            provider_read_secs: default_provider_read_secs(),
            request_secs: default_request_secs(),
            sse_heartbeat_secs: default_heartbeat_secs(),
        }
    }
}

fn default_cache_lookup_ms() -> u64 {
    500
}
fn default_rate_limit_ms() -> u64 {
    100
}
fn default_provider_connect_secs() -> u64 {
    60
}
fn default_provider_read_secs() -> u64 {
    30
}
fn default_request_secs() -> u64 {
    300
}
fn default_heartbeat_secs() -> u64 {
    15
}

fn default_true() -> bool {
    true
}
