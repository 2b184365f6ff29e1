//! Upstream token providers.
//!
//! Provides a trait-based abstraction for streaming LLM providers with
//! health observed through the circuit breaker registry. Concrete
//! adaptors: OpenAI-compatible endpoints, the Anthropic Messages API,
//! and a scriptable fake for tests and local development.

pub mod anthropic;
pub mod fake;
pub mod openai_compat;
pub mod registry;
mod sse;

use std::pin::Pin;

use futures_util::Stream;

use crate::error::ProviderError;
use crate::request::GenerationParams;

pub use registry::ProviderRegistry;

/// A finite, non-restartable sequence of token text chunks.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, ProviderError>> + Send>>;

/// Trait abstracting a streaming token provider.
///
/// The trait is object-safe for use as `Arc<dyn TokenProvider>`;
/// instances are owned by the [`ProviderRegistry`] and created once per
/// process.
#[async_trait::async_trait]
pub trait TokenProvider: Send + Sync {
    /// The provider's registered name (e.g. "openai", "anthropic").
    fn name(&self) -> &str;

    /// Open a token stream for the query.
    ///
    /// Errors returned here happened before any token was produced;
    /// mid-stream failures surface as `Err` items inside the stream.
    async fn stream(
        &self,
        query: &str,
        model: &str,
        thread_id: &str,
        params: &GenerationParams,
    ) -> Result<TokenStream, ProviderError>;

    /// Check that the provider is reachable and configured correctly.
    async fn health_check(&self) -> Result<(), ProviderError> {
        let mut stream = self
            .stream("Say OK", "health-check", "health", &GenerationParams {
                max_tokens: 10,
                ..GenerationParams::default()
            })
            .await?;
        use futures_util::StreamExt;
        while let Some(chunk) = stream.next().await {
            chunk?;
        }
        Ok(())
    }
}
