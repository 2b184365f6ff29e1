//! OpenAI-compatible streaming provider.
//!
//! Works with OpenAI and any endpoint that speaks the chat completions
//! wire format with `stream: true`. Tokens arrive as `data:` lines
//! holding chat completion chunks; the literal `[DONE]` payload ends
//! the stream.

use serde::{Deserialize, Serialize};

use super::sse::{decode_stream, TokenEvent};
use super::{TokenProvider, TokenStream};
use crate::error::ProviderError;
use crate::request::GenerationParams;

/// Default base URL for the hosted OpenAI API.
const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// A streaming provider using the OpenAI chat completions format.
pub struct OpenAiCompatProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    provider_name: String,
}

impl OpenAiCompatProvider {
    /// Create a provider against the hosted OpenAI endpoint.
    pub fn new(api_key: String, provider_name: String) -> Self {
        Self::with_base_url(OPENAI_BASE_URL.to_string(), api_key, provider_name)
    }

    /// Create a provider against a custom endpoint (self-hosted or mock).
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
impl TokenProvider for OpenAiCompatProvider {
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

        let request = ChatCompletionRequest {
            model,
            messages: vec![ChatMessage {
                role: "user",
                content: query,
            }],
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            stream: true,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();

            if status == 429 {
                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(60);
                return Err(ProviderError::RateLimited {
                    retry_after_secs: retry_after,
                });
            }

            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status,
                message: body,
            });
        }

        Ok(decode_stream(response, extract_token))
    }
}

fn extract_token(payload: &str) -> TokenEvent {
    if payload == "[DONE]" {
        return TokenEvent::Done;
    }
    match serde_json::from_str::<ChunkPayload>(payload) {
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.delta.content)
            .filter(|content| !content.is_empty())
            .map_or(TokenEvent::Skip, TokenEvent::Token),
        Err(_) => TokenEvent::Skip,
    }
}

// --- Internal Serde types ---

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChunkPayload {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Deserialize, Default)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}
