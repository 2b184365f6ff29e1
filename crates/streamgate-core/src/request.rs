//! Request types carried through the pipeline.

use serde::{Deserialize, Serialize};

/// Parameters controlling token generation.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct GenerationParams {
    /// Maximum number of tokens to generate.
    pub max_tokens: u32,
    /// Sampling temperature (0.0 = deterministic, 1.0+ = creative).
    pub temperature: f32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            temperature: 0.7,
        }
    }
}

/// One admitted streaming request.
///
/// The thread identifier is the request's correlation key for its whole
/// lifetime: log lines, tracker samples, pool membership, and failover
/// result channels all derive from it.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamRequest {
    /// The user's query text.
    pub query: String,
    /// Model to generate with; must be on the configured whitelist.
    pub model: String,
    /// Optional preferred provider; normalized to lowercase during
    /// validation.
    pub provider: Option<String>,
    /// Caller identity, supplied by an external collaborator.
    pub user_id: String,
    /// Opaque correlation key, generated when the client sends none.
    pub thread_id: String,
    /// Generation parameters.
    #[serde(default)]
    pub params: GenerationParams,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_params_defaults() {
        let params = GenerationParams::default();
        assert_eq!(params.max_tokens, 512);
        assert!((params.temperature - 0.7).abs() < f32::EPSILON);
    }

    #[test]
    fn request_roundtrips_through_json() {
        let request = StreamRequest {
            query: "hello".to_string(),
            model: "test-model".to_string(),
            provider: Some("fake".to_string()),
            user_id: "u1".to_string(),
            thread_id: "t-1".to_string(),
            params: GenerationParams::default(),
        };
        let json = serde_json::to_string(&request).expect("serialize");
        let back: StreamRequest = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.query, "hello");
        assert_eq!(back.thread_id, "t-1");
    }
}
