//! Anthropic native streaming provider.
//!
//! Uses the Anthropic Messages API with `stream: true`, which has a
//! distinct request format, authentication mechanism, and event
//! vocabulary from OpenAI-compatible endpoints. Token text arrives in
//! `content_block_delta` events; `message_stop` ends the stream.

use serde::{Deserialize, Serialize};

use super::sse::{decode_stream, TokenEvent};
use super::{TokenProvider, TokenStream};
use crate::error::ProviderError;
use crate::request::GenerationParams;

/// The Anthropic Messages API base URL.
const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";

/// The Anthropic API version header value.
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Streaming provider using the Anthropic Messages API.
pub struct AnthropicProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    provider_name: String,
}

impl AnthropicProvider {
    /// Create a provider with the default base URL.
    pub fn new(api_key: String, provider_name: String) -> Self {
        Self::with_base_url(ANTHROPIC_BASE_URL.to_string(), api_key, provider_name)
    }

    /// Create a provider with a custom base URL (for testing).
    pub fn with_base_url(base_url: String, api_key: String, provider_name: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            api_key,
            provider_name,
        }
    }
}

#[async_trait::async_trait]
impl TokenProvider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.provider_name
    }

    async fn stream(
        &self,
        query: &str,
        model: &str,
        thread_id: &str,
        params: &GenerationParams,
    ) -> Result<TokenStream, ProviderError> {
        tracing::debug!(
            provider = %self.provider_name,
            model = %model,
            thread_id = %thread_id,
            max_tokens = params.max_tokens,
            "provider stream request",
        );

        let request = MessagesRequest {
            model,
            max_tokens: params.max_tokens,
            messages: vec![Message {
                role: "user",
                content: query,
            }],
            temperature: params.temperature,
            stream: true,
        };

        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();

            if status == 429 || status == 529 {
                let retry_after = if status == 529 {
                    30 // Anthropic "overloaded" default
                } else {
                    response
                        .headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<u64>().ok())
                        .unwrap_or(60)
                };
                return Err(ProviderError::RateLimited {
                    retry_after_secs: retry_after,
                });
            }

            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorResponse>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);

            return Err(ProviderError::Api { status, message });
        }

        Ok(decode_stream(response, extract_token))
    }
}

fn extract_token(payload: &str) -> TokenEvent {
    let Ok(event) = serde_json::from_str::<StreamEvent>(payload) else {
        return TokenEvent::Skip;
    };
    match event.event_type.as_str() {
        "content_block_delta" => event
            .delta
            .and_then(|d| d.text)
            .filter(|text| !text.is_empty())
            .map_or(TokenEvent::Skip, TokenEvent::Token),
        "message_stop" => TokenEvent::Done,
        "error" => TokenEvent::Fail(
            event
                .error
                .map_or_else(|| "provider reported an error".to_string(), |e| e.message),
        ),
        _ => TokenEvent::Skip,
    }
}

// --- Internal Serde types ---

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<Message<'a>>,
    temperature: f32,
    stream: bool,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct StreamEvent {
    #[serde(rename = "type", default)]
    event_type: String,
    #[serde(default)]
    delta: Option<Delta>,
    #[serde(default)]
    error: Option<ErrorDetail>,
}

#[derive(Deserialize)]
struct Delta {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    message: String,
}
