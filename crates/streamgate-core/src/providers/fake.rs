//! Scriptable fake provider.
//!
//! Streams a configured chunk script with optional failure injection
//! and inter-chunk delay. Used by the test suites and available as the
//! "fake" adaptor kind for local development without upstream keys.

use std::time::Duration;

use futures_util::stream;

use super::{TokenProvider, TokenStream};
use crate::error::ProviderError;
use crate::request::GenerationParams;

/// Where in the stream the fake provider fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// Never fail.
    None,
    /// Fail when the stream is opened, before any chunk.
    BeforeFirstChunk,
    /// Deliver this many chunks, then fail mid-stream.
    AfterChunks(usize),
}

/// A provider that streams a fixed script.
pub struct FakeProvider {
    provider_name: String,
    chunks: Vec<String>,
    failure: FailureMode,
    chunk_delay: Duration,
}

impl FakeProvider {
    /// Create a fake provider with a small default script.
    pub fn new(provider_name: impl Into<String>) -> Self {
        Self {
            provider_name: provider_name.into(),
            chunks: vec!["This ", "is ", "a ", "fake ", "response."]
                .into_iter()
                .map(String::from)
                .collect(),
            failure: FailureMode::None,
            chunk_delay: Duration::ZERO,
        }
    }

    /// Replace the chunk script.
    pub fn with_chunks(mut self, chunks: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.chunks = chunks.into_iter().map(Into::into).collect();
        self
    }

    /// Inject a failure.
    pub fn with_failure(mut self, failure: FailureMode) -> Self {
        self.failure = failure;
        self
    }

    /// Sleep between chunks, for exercising timeouts and heartbeats.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }
}

#[async_trait::async_trait]
impl TokenProvider for FakeProvider {
    fn name(&self) -> &str {
        &self.provider_name
    }

    async fn stream(
        &self,
        _query: &str,
        _model: &str,
        thread_id: &str,
        _params: &GenerationParams,
    ) -> Result<TokenStream, ProviderError> {
        if self.failure == FailureMode::BeforeFirstChunk {
            return Err(ProviderError::Api {
                status: 503,
                message: "scripted connect failure".to_string(),
            });
        }

        tracing::debug!(
            provider = %self.provider_name,
            thread_id = %thread_id,
            chunks = self.chunks.len(),
            "fake provider streaming",
        );

        let fail_after = match self.failure {
            FailureMode::AfterChunks(n) => Some(n),
            _ => None,
        };
        let chunks = self.chunks.clone();
        let delay = self.chunk_delay;

        let items = stream::unfold(0usize, move |index| {
            let chunks = chunks.clone();
            async move {
                if delay > Duration::ZERO && index > 0 {
                    tokio::time::sleep(delay).await;
                }
                if let Some(n) = fail_after {
                    if index == n {
                        return Some((
                            Err(ProviderError::Stream {
                                message: "scripted mid-stream failure".to_string(),
                            }),
                            index + 1,
                        ));
                    }
                    if index > n {
                        return None;
                    }
                }
                chunks
                    .get(index)
                    .cloned()
                    .map(|chunk| (Ok(chunk), index + 1))
            }
        });

        Ok(Box::pin(items))
    }
}
