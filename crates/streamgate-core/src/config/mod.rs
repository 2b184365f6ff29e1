//! Configuration management for Streamgate.
//!
//! Two-layer loading: built-in defaults, then a TOML config file. The
//! recognized options are fully enumerated in the section structs; there
//! is no dynamic key space. A small subset of knobs is adjustable at
//! runtime through [`RuntimeToggles`].

mod types;
mod validation;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub use types::{
    BreakerConfig, CacheConfig, Environment, LoadShedConfig, PoolConfig, ProviderConfig,
    QueueConfig, RateLimitConfig, ServerConfig, StoreConfig, TimeoutsConfig, TrackerConfig,
};

/// Top-level configuration for a gateway instance.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// HTTP server binding and environment.
    #[serde(default)]
    pub server: ServerConfig,

    /// Shared coordination store connection.
    #[serde(default)]
    pub store: StoreConfig,

    /// Two-tier response cache.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Distributed connection pool.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Per-provider circuit breakers.
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Per-user rate limits.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Cross-instance queue failover.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Admission-layer load shedding.
    #[serde(default)]
    pub load_shed: LoadShedConfig,

    /// Stage-timing sampler.
    #[serde(default)]
    pub tracker: TrackerConfig,

    /// Upstream providers in failover order.
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,

    /// How many providers one request may try before giving up.
    #[serde(default = "default_provider_fanout")]
    pub provider_fanout: u32,

    /// Per-stage deadlines.
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
}

fn default_provider_fanout() -> u32 {
    2
}

impl Default for Config {
    fn default() -> Self {
        // Every field is serde-defaulted, so the empty document is the
        // canonical default configuration.
        toml::from_str("").expect("default config deserializes")
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// With `None`, returns built-in defaults. With a path, the file must
    /// exist and parse; missing sections fall back to defaults.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        if !Path::new(path).exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_string(),
            });
        }

        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::InvalidValue {
            field: "config file".to_string(),
            message: e.to_string(),
        })?;

        toml::from_str(&raw).map_err(|source| ConfigError::ParseError { source })
    }

    /// All model names served by any configured provider.
    pub fn model_whitelist(&self) -> Vec<String> {
        let mut models: Vec<String> = self
            .providers
            .iter()
            .flat_map(|p| p.models.iter().cloned())
            .collect();
        models.sort();
        models.dedup();
        models
    }

    /// All configured provider names, lowercased, in registration order.
    pub fn provider_whitelist(&self) -> Vec<String> {
        self.providers
            .iter()
            .map(|p| p.name.to_lowercase())
            .collect()
    }
}

/// Runtime-adjustable knobs, shared across the request path.
///
/// Exposed through the admin config endpoint. The tracker's sample rate
/// is the third runtime knob and lives on the tracker itself.
#[derive(Debug)]
pub struct RuntimeToggles {
    caching_enabled: AtomicBool,
    failover_enabled: AtomicBool,
}

impl RuntimeToggles {
    /// Seed the toggles from loaded configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            caching_enabled: AtomicBool::new(config.cache.enabled),
            failover_enabled: AtomicBool::new(config.queue.failover_enabled),
        }
    }

    /// Whether responses are currently cached and served from cache.
    pub fn caching_enabled(&self) -> bool {
        self.caching_enabled.load(Ordering::Relaxed)
    }

    /// Whether pool-exhausted requests fail over to the queue.
    pub fn failover_enabled(&self) -> bool {
        self.failover_enabled.load(Ordering::Relaxed)
    }

    /// Toggle response caching.
    pub fn set_caching_enabled(&self, enabled: bool) {
        self.caching_enabled.store(enabled, Ordering::Relaxed);
    }

    /// Toggle queue failover.
    pub fn set_failover_enabled(&self, enabled: bool) {
        self.failover_enabled.store(enabled, Ordering::Relaxed);
    }
}
