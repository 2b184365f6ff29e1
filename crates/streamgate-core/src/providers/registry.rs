//! Provider registry with lazy construction and health-aware selection.
//!
//! Registration stores configuration only; the provider instance (and
//! its HTTP client) is created on first use, guarded so concurrent
//! first calls construct it exactly once per process. Selection orders
//! providers by preference match, then circuit state (closed before
//! half-open), then registration order.

use std::sync::Arc;

use tokio::sync::OnceCell;

use super::anthropic::AnthropicProvider;
use super::fake::FakeProvider;
use super::openai_compat::OpenAiCompatProvider;
use super::TokenProvider;
use crate::breaker::{CircuitBreakerRegistry, CircuitState};
use crate::config::ProviderConfig;
use crate::error::ProviderError;

struct ProviderRecord {
    name: String,
    config: ProviderConfig,
    instance: OnceCell<Arc<dyn TokenProvider>>,
}

/// Registry of configured providers and their circuit breakers.
pub struct ProviderRegistry {
    records: Vec<ProviderRecord>,
    breakers: Arc<CircuitBreakerRegistry>,
}

impl ProviderRegistry {
    /// Register the configured providers. Cheap: stores references
    /// only, no clients are built here.
    pub fn from_config(
        providers: &[ProviderConfig],
        breakers: Arc<CircuitBreakerRegistry>,
    ) -> Self {
        let records = providers
            .iter()
            .map(|config| ProviderRecord {
                name: config.name.to_lowercase(),
                config: config.clone(),
                instance: OnceCell::new(),
            })
            .collect();
        Self { records, breakers }
    }

    /// Pre-seed a provider instance, bypassing lazy construction.
    pub fn register_instance(&mut self, name: &str, instance: Arc<dyn TokenProvider>) {
        let cell = OnceCell::new();
        cell.set(instance).ok();
        self.records.push(ProviderRecord {
            name: name.to_lowercase(),
            config: ProviderConfig {
                name: name.to_string(),
                ..ProviderConfig::default()
            },
            instance: cell,
        });
    }

    /// The circuit breaker registry shared with the pipeline.
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Registered provider names, in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.records.iter().map(|r| r.name.as_str()).collect()
    }

    /// Fetch (creating on first call) the named provider instance.
    pub async fn get(&self, name: &str) -> Result<Arc<dyn TokenProvider>, ProviderError> {
        let lowered = name.to_lowercase();
        let record = self
            .records
            .iter()
            .find(|r| r.name == lowered)
            .ok_or_else(|| ProviderError::Unknown {
                name: name.to_string(),
            })?;

        record
            .instance
            .get_or_try_init(|| async { build_provider(&record.config) })
            .await
            .cloned()
    }

    /// Pick the healthiest eligible provider.
    ///
    /// Eligible means registered, not excluded, and circuit closed or
    /// half-open. Ordering: `prefer` match first, then closed before
    /// half-open, then registration order. Returns `None` when nothing
    /// qualifies.
    pub async fn select_healthy(
        &self,
        prefer: Option<&str>,
        exclude: &[String],
    ) -> Option<Arc<dyn TokenProvider>> {
        let prefer = prefer.map(str::to_lowercase);
        let mut best: Option<(bool, bool, usize, &str)> = None;

        for (index, record) in self.records.iter().enumerate() {
            if exclude.iter().any(|e| e.eq_ignore_ascii_case(&record.name)) {
                continue;
            }
            let state = self.breakers.current_state(&record.name).await;
            if state == CircuitState::Open {
                continue;
            }

            // Sort key: preferred first, closed before half-open,
            // registration order as tie-break. `false < true`.
            let key = (
                prefer.as_deref() != Some(record.name.as_str()),
                state == CircuitState::HalfOpen,
                index,
                record.name.as_str(),
            );
            match &best {
                Some((p, h, i, _)) if (key.0, key.1, key.2) >= (*p, *h, *i) => {}
                _ => best = Some(key),
            }
        }

        let (_, _, _, name) = best?;
        match self.get(name).await {
            Ok(provider) => Some(provider),
            Err(err) => {
                tracing::error!(provider = %name, error = %err, "provider construction failed");
                None
            }
        }
    }
}

fn build_provider(config: &ProviderConfig) -> Result<Arc<dyn TokenProvider>, ProviderError> {
    let name = config.name.to_lowercase();
    let api_key = config.api_key.clone().unwrap_or_default();

    let provider: Arc<dyn TokenProvider> = match config.kind.as_str() {
        "openai_compat" => match &config.base_url {
            Some(base_url) => Arc::new(OpenAiCompatProvider::with_base_url(
                base_url.clone(),
                api_key,
                name,
            )),
            None => Arc::new(OpenAiCompatProvider::new(api_key, name)),
        },
        "anthropic" => match &config.base_url {
            Some(base_url) => Arc::new(AnthropicProvider::with_base_url(
                base_url.clone(),
                api_key,
                name,
            )),
            None => Arc::new(AnthropicProvider::new(api_key, name)),
        },
        "fake" => Arc::new(FakeProvider::new(name)),
        _ => {
            return Err(ProviderError::Unknown {
                name: config.name.clone(),
            })
        }
    };

    tracing::info!(provider = %provider.name(), kind = %config.kind, "provider instantiated");
    Ok(provider)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BreakerConfig;
    use crate::store::MemoryStore;

    fn breakers() -> Arc<CircuitBreakerRegistry> {
        Arc::new(CircuitBreakerRegistry::new(
            Arc::new(MemoryStore::new()),
            BreakerConfig::default(),
        ))
    }

    fn fake_config(name: &str) -> ProviderConfig {
        ProviderConfig {
            name: name.to_string(),
            kind: "fake".to_string(),
            models: vec!["test-model".to_string()],
            ..ProviderConfig::default()
        }
    }

    #[tokio::test]
    async fn get_creates_once_and_caches() {
        let registry =
            ProviderRegistry::from_config(&[fake_config("fake")], breakers());

        let first = registry.get("fake").await.expect("provider");
        let second = registry.get("FAKE").await.expect("provider");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.name(), "fake");
    }

    #[tokio::test]
    async fn get_unknown_name_errors() {
        let registry = ProviderRegistry::from_config(&[], breakers());
        let err = match registry.get("ghost").await {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert!(matches!(err, ProviderError::Unknown { .. }));
    }

    #[tokio::test]
    async fn selection_follows_registration_order() {
        let registry = ProviderRegistry::from_config(
            &[fake_config("p1"), fake_config("p2")],
            breakers(),
        );

        let chosen = registry.select_healthy(None, &[]).await.expect("provider");
        assert_eq!(chosen.name(), "p1");
    }

    #[tokio::test]
    async fn selection_honors_preference() {
        let registry = ProviderRegistry::from_config(
            &[fake_config("p1"), fake_config("p2")],
            breakers(),
        );

        let chosen = registry
            .select_healthy(Some("p2"), &[])
            .await
            .expect("provider");
        assert_eq!(chosen.name(), "p2");
    }

    #[tokio::test]
    async fn selection_skips_excluded_and_open_circuits() {
        let breakers = breakers();
        let registry = ProviderRegistry::from_config(
            &[fake_config("p1"), fake_config("p2"), fake_config("p3")],
            breakers.clone(),
        );

        // Trip p1's breaker with the default threshold.
        for _ in 0..BreakerConfig::default().failure_threshold {
            breakers.on_failure("p1").await;
        }

        let chosen = registry
            .select_healthy(None, &["p2".to_string()])
            .await
            .expect("provider");
        assert_eq!(chosen.name(), "p3");
    }

    #[tokio::test]
    async fn selection_returns_none_when_all_unhealthy() {
        let breakers = breakers();
        let registry =
            ProviderRegistry::from_config(&[fake_config("p1")], breakers.clone());

        for _ in 0..BreakerConfig::default().failure_threshold {
            breakers.on_failure("p1").await;
        }

        assert!(registry.select_healthy(None, &[]).await.is_none());
    }

    #[tokio::test]
    async fn registered_instance_is_served_directly() {
        let mut registry = ProviderRegistry::from_config(&[], breakers());
        registry.register_instance(
            "scripted",
            Arc::new(FakeProvider::new("scripted").with_chunks(["X"])),
        );

        let provider = registry.get("scripted").await.expect("provider");
        assert_eq!(provider.name(), "scripted");
    }
}
