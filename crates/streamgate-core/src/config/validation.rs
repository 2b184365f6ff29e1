//! Configuration validation logic.

use super::Config;
use crate::error::ConfigError;

impl Config {
    /// Validate the configuration, returning all errors found (not just the first).
    pub fn validate(&self) -> Result<(), Vec<ConfigError>> {
        let mut errors = Vec::new();

        if self.providers.is_empty() {
            errors.push(ConfigError::MissingField {
                field: "providers".to_string(),
            });
        }

        for (i, provider) in self.providers.iter().enumerate() {
            if provider.name.is_empty() {
                errors.push(ConfigError::MissingField {
                    field: format!("providers[{i}].name"),
                });
            }
            if provider.models.is_empty() {
                errors.push(ConfigError::MissingField {
                    field: format!("providers[{i}].models"),
                });
            }
            match provider.kind.as_str() {
                "openai_compat" | "anthropic" | "fake" => {}
                _ => {
                    errors.push(ConfigError::InvalidValue {
                        field: format!("providers[{i}].kind"),
                        message: "must be openai_compat, anthropic, or fake".to_string(),
                    });
                }
            }
            if matches!(provider.kind.as_str(), "openai_compat" | "anthropic") {
                match &provider.api_key {
                    Some(key) if !key.is_empty() => {}
                    _ => {
                        errors.push(ConfigError::MissingField {
                            field: format!(
                                "providers[{i}].api_key (required for {} adaptor)",
                                provider.kind
                            ),
                        });
                    }
                }
            }
        }

        if self.pool.global_max == 0 {
            errors.push(ConfigError::InvalidValue {
                field: "pool.global_max".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        if self.pool.per_user_max == 0 {
            errors.push(ConfigError::InvalidValue {
                field: "pool.per_user_max".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.pool.degraded_at)
            || !(0.0..=1.0).contains(&self.pool.critical_at)
        {
            errors.push(ConfigError::InvalidValue {
                field: "pool.degraded_at / pool.critical_at".to_string(),
                message: "must be between 0.0 and 1.0".to_string(),
            });
        } else if self.pool.degraded_at >= self.pool.critical_at {
            errors.push(ConfigError::InvalidValue {
                field: "pool.degraded_at".to_string(),
                message: "must be below pool.critical_at".to_string(),
            });
        }

        if self.breaker.failure_threshold == 0 {
            errors.push(ConfigError::InvalidValue {
                field: "breaker.failure_threshold".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        if !(0.0..=1.0).contains(&self.queue.backpressure_threshold_ratio) {
            errors.push(ConfigError::InvalidValue {
                field: "queue.backpressure_threshold_ratio".to_string(),
                message: "must be between 0.0 and 1.0".to_string(),
            });
        }
        if self.queue.chunk_batch_size == 0 {
            errors.push(ConfigError::InvalidValue {
                field: "queue.chunk_batch_size".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        if !(0.0..=1.0).contains(&self.tracker.sample_rate) {
            errors.push(ConfigError::InvalidValue {
                field: "tracker.sample_rate".to_string(),
                message: "must be between 0.0 and 1.0".to_string(),
            });
        }

        if !self.rate_limit.tiers.contains_key(&self.rate_limit.default_tier) {
            errors.push(ConfigError::InvalidValue {
                field: "rate_limit.default_tier".to_string(),
                message: format!(
                    "tier '{}' has no entry in rate_limit.tiers",
                    self.rate_limit.default_tier
                ),
            });
        }

        if self.server.environment == super::Environment::Production
            && self.server.cors_origins.is_empty()
        {
            errors.push(ConfigError::MissingField {
                field: "server.cors_origins (required in production)".to_string(),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
