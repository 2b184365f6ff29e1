//! Error types for the Streamgate core library.
//!
//! Each module has its own error enum to provide clear error boundaries.
//! The library uses `thiserror` for structured, typed errors. Errors that
//! reach the wire carry an [`ErrorKind`] naming the failure class; the
//! server crate maps kinds to HTTP status codes.

use serde::{Deserialize, Serialize};

/// Wire-visible failure classes.
///
/// Serialized into SSE `error` events and JSON error bodies, so the
/// string forms are part of the public API and must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Request failed field validation before streaming began.
    Validation,
    /// Request matched an attack pattern and was rejected.
    Security,
    /// The user exhausted their per-window request budget.
    RateLimited,
    /// The load shedder rejected the request at admission.
    Shedding,
    /// The failover queue is at capacity.
    QueueFull,
    /// No failover worker produced a result before the deadline.
    QueueTimeout,
    /// The fleet-wide connection limit is reached.
    PoolExhaustedGlobal,
    /// The caller's per-user connection limit is reached.
    PoolExhaustedUser,
    /// Every registered provider has an open circuit.
    AllProvidersUnavailable,
    /// The upstream provider failed while streaming tokens.
    ProviderStreamFailure,
    /// Unexpected internal failure.
    Internal,
}

impl ErrorKind {
    /// The stable wire string for this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Security => "security",
            Self::RateLimited => "rate_limited",
            Self::Shedding => "shedding",
            Self::QueueFull => "queue_full",
            Self::QueueTimeout => "queue_timeout",
            Self::PoolExhaustedGlobal => "pool_exhausted_global",
            Self::PoolExhaustedUser => "pool_exhausted_user",
            Self::AllProvidersUnavailable => "all_providers_unavailable",
            Self::ProviderStreamFailure => "provider_stream_failure",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced at request-pipeline stage boundaries.
///
/// Stages return `Result<_, GatewayError>`; the server crate translates
/// pre-stream errors into HTTP status codes and mid-stream errors into
/// SSE `error` events.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// A request field failed validation.
    #[error("invalid request: {message}")]
    Validation {
        /// What was wrong with the request.
        message: String,
    },

    /// A request field matched the attack-pattern set.
    #[error("request rejected: {message}")]
    Security {
        /// Which check rejected the request.
        message: String,
    },

    /// The user's per-window request budget is spent.
    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited {
        /// Seconds until the current window rolls over.
        retry_after_secs: u64,
    },

    /// The admission gate rejected the request outright.
    #[error("gateway is shedding load")]
    Shedding,

    /// The failover queue stayed above its depth ceiling through all retries.
    #[error("failover queue is full")]
    QueueFull,

    /// No failover worker answered before the configured deadline.
    #[error("timed out after {waited_secs}s waiting for a failover worker")]
    QueueTimeout {
        /// Total seconds spent waiting on the result channel.
        waited_secs: u64,
    },

    /// The fleet-wide concurrent-request limit is reached.
    #[error("global connection limit reached ({current}/{limit})")]
    PoolExhaustedGlobal {
        /// Observed global active count.
        current: u64,
        /// Configured global maximum.
        limit: u64,
    },

    /// The caller's concurrent-request limit is reached.
    #[error("connection limit reached for user {user_id} ({current}/{limit})")]
    PoolExhaustedUser {
        /// The user that hit the limit.
        user_id: String,
        /// Observed per-user active count.
        current: u64,
        /// Configured per-user maximum.
        limit: u64,
    },

    /// Every registered provider is circuit-open or unregistered.
    #[error("no healthy provider available")]
    AllProvidersUnavailable,

    /// The provider failed while (or before) streaming tokens.
    #[error("provider {provider} stream failed: {message}")]
    ProviderStream {
        /// Name of the failing provider.
        provider: String,
        /// Description of the failure.
        message: String,
    },

    /// Invariant violation or unexpected failure.
    #[error("internal gateway error: {message}")]
    Internal {
        /// Description of the failure.
        message: String,
    },
}

impl GatewayError {
    /// The wire kind for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Security { .. } => ErrorKind::Security,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::Shedding => ErrorKind::Shedding,
            Self::QueueFull => ErrorKind::QueueFull,
            Self::QueueTimeout { .. } => ErrorKind::QueueTimeout,
            Self::PoolExhaustedGlobal { .. } => ErrorKind::PoolExhaustedGlobal,
            Self::PoolExhaustedUser { .. } => ErrorKind::PoolExhaustedUser,
            Self::AllProvidersUnavailable => ErrorKind::AllProvidersUnavailable,
            Self::ProviderStream { .. } => ErrorKind::ProviderStreamFailure,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }
}

/// Errors related to configuration loading, parsing, and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required configuration field is absent.
    #[error("missing required config field: {field}")]
    MissingField {
        /// The name of the missing field.
        field: String,
    },

    /// A configuration field has an unacceptable value.
    #[error("invalid value for config field '{field}': {message}")]
    InvalidValue {
        /// The name of the invalid field.
        field: String,
        /// A description of why the value is invalid.
        message: String,
    },

    /// The configuration file does not exist at the specified path.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// The path that was searched.
        path: String,
    },

    /// TOML deserialization failed.
    #[error("failed to parse config file: {source}")]
    ParseError {
        /// The underlying TOML parse error.
        #[source]
        source: toml::de::Error,
    },
}

/// Errors from the shared coordination store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The underlying Redis command failed.
    #[error("shared store error: {source}")]
    Backend {
        /// The underlying client error.
        #[source]
        source: redis::RedisError,
    },

    /// A store operation exceeded its deadline.
    #[error("shared store operation '{operation}' timed out")]
    Timeout {
        /// The operation that timed out.
        operation: &'static str,
    },

    /// A stored value could not be decoded.
    #[error("failed to decode stored value for '{key}': {message}")]
    Decode {
        /// The key whose value failed to decode.
        key: String,
        /// Description of the decode failure.
        message: String,
    },
}

impl From<redis::RedisError> for StoreError {
    fn from(source: redis::RedisError) -> Self {
        Self::Backend { source }
    }
}

/// Errors from upstream token providers.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// HTTP request to the provider endpoint failed.
    #[error("provider HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Provider returned an error response before streaming.
    #[error("provider API error (status {status}): {message}")]
    Api {
        /// The HTTP status code.
        status: u16,
        /// The error message from the provider.
        message: String,
    },

    /// Provider rate limit hit.
    #[error("provider rate limited, retry after {retry_after_secs} seconds")]
    RateLimited {
        /// Seconds to wait before retrying.
        retry_after_secs: u64,
    },

    /// The token stream broke after it started.
    #[error("provider stream interrupted: {message}")]
    Stream {
        /// Description of the interruption.
        message: String,
    },

    /// Provider wire payload could not be parsed.
    #[error("failed to parse provider response: {0}")]
    Parse(String),

    /// No provider is registered under the requested name.
    #[error("provider '{name}' is not registered")]
    Unknown {
        /// The unrecognized provider name.
        name: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_wire_strings_are_stable() {
        assert_eq!(ErrorKind::Validation.as_str(), "validation");
        assert_eq!(ErrorKind::Security.as_str(), "security");
        assert_eq!(ErrorKind::RateLimited.as_str(), "rate_limited");
        assert_eq!(ErrorKind::QueueTimeout.as_str(), "queue_timeout");
        assert_eq!(
            ErrorKind::PoolExhaustedGlobal.as_str(),
            "pool_exhausted_global"
        );
        assert_eq!(
            ErrorKind::AllProvidersUnavailable.as_str(),
            "all_providers_unavailable"
        );
        assert_eq!(
            ErrorKind::ProviderStreamFailure.as_str(),
            "provider_stream_failure"
        );
    }

    #[test]
    fn error_kind_serializes_to_snake_case() {
        let json = serde_json::to_string(&ErrorKind::PoolExhaustedUser).expect("serialize");
        assert_eq!(json, "\"pool_exhausted_user\"");
    }

    #[test]
    fn gateway_error_kind_mapping() {
        let err = GatewayError::RateLimited {
            retry_after_secs: 12,
        };
        assert_eq!(err.kind(), ErrorKind::RateLimited);

        let err = GatewayError::PoolExhaustedUser {
            user_id: "u1".to_string(),
            current: 3,
            limit: 3,
        };
        assert_eq!(err.kind(), ErrorKind::PoolExhaustedUser);
    }

    #[test]
    fn gateway_error_messages() {
        let err = GatewayError::Validation {
            message: "query must not be empty".to_string(),
        };
        assert_eq!(err.to_string(), "invalid request: query must not be empty");

        let err = GatewayError::PoolExhaustedGlobal {
            current: 10_000,
            limit: 10_000,
        };
        assert_eq!(
            err.to_string(),
            "global connection limit reached (10000/10000)"
        );

        let err = GatewayError::QueueTimeout { waited_secs: 30 };
        assert_eq!(
            err.to_string(),
            "timed out after 30s waiting for a failover worker"
        );
    }

    #[test]
    fn config_error_missing_field_message() {
        let err = ConfigError::MissingField {
            field: "providers".to_string(),
        };
        assert_eq!(err.to_string(), "missing required config field: providers");
    }

    #[test]
    fn config_error_invalid_value_message() {
        let err = ConfigError::InvalidValue {
            field: "pool.degraded_at".to_string(),
            message: "must be between 0.0 and 1.0".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "invalid value for config field 'pool.degraded_at': must be between 0.0 and 1.0"
        );
    }

    #[test]
    fn store_error_timeout_message() {
        let err = StoreError::Timeout { operation: "incr" };
        assert_eq!(err.to_string(), "shared store operation 'incr' timed out");
    }

    #[test]
    fn provider_error_api_message() {
        let err = ProviderError::Api {
            status: 502,
            message: "bad gateway".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "provider API error (status 502): bad gateway"
        );
    }

    #[test]
    fn provider_error_unknown_message() {
        let err = ProviderError::Unknown {
            name: "nope".to_string(),
        };
        assert_eq!(err.to_string(), "provider 'nope' is not registered");
    }
}
