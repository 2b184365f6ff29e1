//! Request validation.
//!
//! A pipeline of synchronous checks over the request fields: whitelist
//! membership, length bounds, and an attack-pattern screen. Pattern
//! matches are rejected with a `security` kind and logged with the user
//! identifier; plain field problems get a `validation` kind.

use std::collections::HashMap;

use regex::RegexBuilder;

use crate::config::Config;
use crate::error::GatewayError;
use crate::request::StreamRequest;

/// Maximum query length in characters.
pub const MAX_QUERY_CHARS: usize = 10_000;

/// Characters of the offending field included in security log lines.
const LOG_EXCERPT_CHARS: usize = 100;

struct AttackPattern {
    label: &'static str,
    regex: regex::Regex,
}

/// Validates incoming requests against the configured whitelists and
/// the attack-pattern set.
pub struct RequestValidator {
    model_whitelist: Vec<String>,
    provider_whitelist: Vec<String>,
    provider_models: HashMap<String, Vec<String>>,
    attack_patterns: Vec<AttackPattern>,
}

impl RequestValidator {
    /// Build a validator from the provider configuration.
    pub fn from_config(config: &Config) -> Self {
        let provider_models = config
            .providers
            .iter()
            .map(|p| (p.name.to_lowercase(), p.models.clone()))
            .collect();

        Self {
            model_whitelist: config.model_whitelist(),
            provider_whitelist: config.provider_whitelist(),
            provider_models,
            attack_patterns: attack_patterns(),
        }
    }

    /// Run every check against the request.
    ///
    /// The provider hint is normalized to lowercase in place. Fails fast
    /// on the first violation.
    pub fn validate(&self, request: &mut StreamRequest) -> Result<(), GatewayError> {
        self.check_query(request)?;
        self.check_model(request)?;
        self.check_provider(request)?;
        Ok(())
    }

    fn check_query(&self, request: &StreamRequest) -> Result<(), GatewayError> {
        let trimmed = request.query.trim();
        if trimmed.is_empty() {
            return Err(GatewayError::Validation {
                message: "query must not be empty".to_string(),
            });
        }

        let chars = request.query.chars().count();
        if chars > MAX_QUERY_CHARS {
            return Err(GatewayError::Validation {
                message: format!("query exceeds {MAX_QUERY_CHARS} characters (got {chars})"),
            });
        }

        if request
            .query
            .chars()
            .any(|c| c.is_control() && !matches!(c, '\n' | '\r' | '\t'))
        {
            return Err(GatewayError::Validation {
                message: "query contains non-printable characters".to_string(),
            });
        }

        self.screen(&request.query, "query", &request.user_id)
    }

    fn check_model(&self, request: &StreamRequest) -> Result<(), GatewayError> {
        if request.model.is_empty() {
            return Err(GatewayError::Validation {
                message: "model must not be empty".to_string(),
            });
        }

        if !self.model_whitelist.iter().any(|m| m == &request.model) {
            return Err(GatewayError::Validation {
                message: format!("model '{}' is not supported", request.model),
            });
        }

        if let Some(provider) = &request.provider {
            let provider = provider.to_lowercase();
            if let Some(models) = self.provider_models.get(&provider) {
                if !models.iter().any(|m| m == &request.model) {
                    return Err(GatewayError::Validation {
                        message: format!(
                            "model '{}' is not served by provider '{provider}'",
                            request.model
                        ),
                    });
                }
            }
        }

        Ok(())
    }

    fn check_provider(&self, request: &mut StreamRequest) -> Result<(), GatewayError> {
        let Some(provider) = &request.provider else {
            return Ok(());
        };

        let normalized = provider.to_lowercase();
        if !self.provider_whitelist.iter().any(|p| p == &normalized) {
            return Err(GatewayError::Validation {
                message: format!("provider '{provider}' is not supported"),
            });
        }

        request.provider = Some(normalized);
        Ok(())
    }

    fn screen(&self, value: &str, field: &str, user_id: &str) -> Result<(), GatewayError> {
        for pattern in &self.attack_patterns {
            if pattern.regex.is_match(value) {
                let excerpt: String = value.chars().take(LOG_EXCERPT_CHARS).collect();
                tracing::warn!(
                    user_id = %user_id,
                    field = %field,
                    pattern = %pattern.label,
                    excerpt = %excerpt,
                    "security screening rejected request",
                );
                return Err(GatewayError::Security {
                    message: format!("{field} matched a blocked pattern"),
                });
            }
        }
        Ok(())
    }
}

fn attack_patterns() -> Vec<AttackPattern> {
    let sources: &[(&'static str, &'static str)] = &[
        ("script_tag", r"<script"),
        ("event_handler", r"on(?:error|click)\s*="),
        ("javascript_uri", r"javascript:"),
        ("sql_drop", r"drop\s+table"),
        ("sql_delete", r"delete\s+from"),
        ("sql_union", r"union\s+select"),
        ("sql_comment", r"--\s*$"),
        ("sql_tautology", r"'\s*or\s*'1'\s*=\s*'1"),
        ("path_traversal", r"\.\./|\.\.\\"),
        ("sensitive_path", r"/etc/(?:passwd|shadow)|\.ssh/|c:\\windows"),
        ("shell_rm", r";\s*rm\s+-rf"),
        ("shell_pipe", r"\|\s*cat\b"),
        ("shell_chain", r"&&"),
        ("shell_backtick", r"`[^`]+`"),
    ];

    sources
        .iter()
        .map(|(label, source)| AttackPattern {
            label,
            regex: RegexBuilder::new(source)
                .case_insensitive(true)
                .build()
                .expect("attack pattern compiles"),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderConfig;
    use crate::request::GenerationParams;

    fn validator() -> RequestValidator {
        let config = Config {
            providers: vec![
                ProviderConfig {
                    name: "fake".to_string(),
                    kind: "fake".to_string(),
                    models: vec!["test-model".to_string(), "gpt-3.5-turbo".to_string()],
                    ..Default::default()
                },
                ProviderConfig {
                    name: "anthropic".to_string(),
                    kind: "anthropic".to_string(),
                    models: vec!["claude-sonnet".to_string()],
                    api_key: Some("k".to_string()),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        RequestValidator::from_config(&config)
    }

    fn request(query: &str) -> StreamRequest {
        StreamRequest {
            query: query.to_string(),
            model: "test-model".to_string(),
            provider: None,
            user_id: "u1".to_string(),
            thread_id: "t-1".to_string(),
            params: GenerationParams::default(),
        }
    }

    #[test]
    fn accepts_ordinary_query() {
        validator().validate(&mut request("hello world")).expect("valid");
    }

    #[test]
    fn rejects_empty_query() {
        let err = validator().validate(&mut request("   ")).unwrap_err();
        assert!(matches!(err, GatewayError::Validation { .. }));
    }

    #[test]
    fn length_boundary_is_inclusive() {
        let at_limit = "a".repeat(MAX_QUERY_CHARS);
        validator().validate(&mut request(&at_limit)).expect("at limit");

        let over = "a".repeat(MAX_QUERY_CHARS + 1);
        let err = validator().validate(&mut request(&over)).unwrap_err();
        assert!(matches!(err, GatewayError::Validation { .. }));
    }

    #[test]
    fn rejects_unknown_model() {
        let mut req = request("hello");
        req.model = "unlisted-model".to_string();
        let err = validator().validate(&mut req).unwrap_err();
        assert!(err.to_string().contains("not supported"));
    }

    #[test]
    fn rejects_model_provider_mismatch() {
        let mut req = request("hello");
        req.model = "claude-sonnet".to_string();
        req.provider = Some("fake".to_string());
        let err = validator().validate(&mut req).unwrap_err();
        assert!(err.to_string().contains("not served by provider"));
    }

    #[test]
    fn normalizes_provider_case() {
        let mut req = request("hello");
        req.provider = Some("FAKE".to_string());
        validator().validate(&mut req).expect("valid");
        assert_eq!(req.provider.as_deref(), Some("fake"));
    }

    #[test]
    fn rejects_unknown_provider() {
        let mut req = request("hello");
        req.provider = Some("mystery".to_string());
        let err = validator().validate(&mut req).unwrap_err();
        assert!(matches!(err, GatewayError::Validation { .. }));
    }

    #[test]
    fn screens_script_injection() {
        for query in [
            "look at <script>alert(1)</script>",
            "img onerror=steal()",
            "a href javascript:void(0)",
            "onClick=doThing()",
        ] {
            let err = validator().validate(&mut request(query)).unwrap_err();
            assert!(matches!(err, GatewayError::Security { .. }), "query: {query}");
        }
    }

    #[test]
    fn screens_sql_markers() {
        for query in [
            "DROP TABLE users",
            "delete from accounts where 1=1",
            "x' UNION SELECT password",
            "admin' or '1'='1",
            "legit question --",
        ] {
            let err = validator().validate(&mut request(query)).unwrap_err();
            assert!(matches!(err, GatewayError::Security { .. }), "query: {query}");
        }
    }

    #[test]
    fn screens_path_traversal_and_shell() {
        for query in [
            "read ../../etc/config",
            "show me /etc/passwd",
            "do this; rm -rf /",
            "thing | cat secrets",
            "a && b",
            "run `whoami` now",
        ] {
            let err = validator().validate(&mut request(query)).unwrap_err();
            assert!(matches!(err, GatewayError::Security { .. }), "query: {query}");
        }
    }

    #[test]
    fn double_dash_mid_query_is_allowed() {
        validator()
            .validate(&mut request("what does -- mean in the middle of sql text here"))
            .expect("valid");
    }

    #[test]
    fn rejects_control_characters() {
        let err = validator()
            .validate(&mut request("hello\u{0007}world"))
            .unwrap_err();
        assert!(matches!(err, GatewayError::Validation { .. }));
    }
}
