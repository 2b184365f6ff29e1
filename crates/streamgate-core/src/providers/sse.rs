//! Provider-side SSE decoding.
//!
//! Upstream providers deliver tokens as `data:` lines over a chunked
//! HTTP response. The splitter below reassembles lines across arbitrary
//! chunk boundaries; each adaptor maps the line payloads to token
//! events with its own wire knowledge.

use std::collections::VecDeque;

use futures_util::StreamExt;

use super::TokenStream;
use crate::error::ProviderError;

/// What one `data:` payload meant.
pub(crate) enum TokenEvent {
    /// A fragment of generated text.
    Token(String),
    /// The provider signalled a clean end of stream.
    Done,
    /// The provider reported an in-stream error.
    Fail(String),
    /// Housekeeping payload with no token content.
    Skip,
}

/// Reassembles `data:` payloads from raw transport chunks.
#[derive(Default)]
pub(crate) struct SseLineSplitter {
    buffer: Vec<u8>,
}

impl SseLineSplitter {
    /// Feed one transport chunk; returns the complete payloads it closed.
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);

        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]);
            let line = line.strip_suffix('\r').unwrap_or(&line);
            if let Some(payload) = line.strip_prefix("data:") {
                payloads.push(payload.trim_start().to_string());
            }
        }
        payloads
    }
}

struct DecodeState<F> {
    inner: futures_util::stream::BoxStream<'static, reqwest::Result<bytes::Bytes>>,
    splitter: SseLineSplitter,
    pending: VecDeque<Result<String, ProviderError>>,
    finished: bool,
    extract: F,
}

/// Turn a provider HTTP response into a token stream.
///
/// `extract` carries the provider's wire knowledge: it maps each `data:`
/// payload to a [`TokenEvent`]. A transport error or an end of body
/// before the provider's done marker yields a stream error item.
pub(crate) fn decode_stream<F>(response: reqwest::Response, extract: F) -> TokenStream
where
    F: Fn(&str) -> TokenEvent + Send + 'static,
{
    let state = DecodeState {
        inner: response.bytes_stream().boxed(),
        splitter: SseLineSplitter::default(),
        pending: VecDeque::new(),
        finished: false,
        extract,
    };

    Box::pin(futures_util::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }

            match state.inner.next().await {
                Some(Ok(bytes)) => {
                    for payload in state.splitter.push(&bytes) {
                        match (state.extract)(&payload) {
                            TokenEvent::Token(token) => state.pending.push_back(Ok(token)),
                            TokenEvent::Done => {
                                state.finished = true;
                                break;
                            }
                            TokenEvent::Fail(message) => {
                                state.pending.push_back(Err(ProviderError::Stream { message }));
                                state.finished = true;
                                break;
                            }
                            TokenEvent::Skip => {}
                        }
                    }
                }
                Some(Err(err)) => {
                    state.finished = true;
                    return Some((
                        Err(ProviderError::Stream {
                            message: err.to_string(),
                        }),
                        state,
                    ));
                }
                None => {
                    state.finished = true;
                    return Some((
                        Err(ProviderError::Stream {
                            message: "stream ended before completion".to_string(),
                        }),
                        state,
                    ));
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splitter_handles_chunk_boundaries() {
        let mut splitter = SseLineSplitter::default();
        assert!(splitter.push(b"data: {\"a\":").is_empty());
        let payloads = splitter.push(b"1}\n\ndata: [DONE]\n\n");
        assert_eq!(payloads, vec!["{\"a\":1}", "[DONE]"]);
    }

    #[test]
    fn splitter_ignores_non_data_lines() {
        let mut splitter = SseLineSplitter::default();
        let payloads = splitter.push(b"event: message\r\ndata: hello\r\n\r\n: comment\n");
        assert_eq!(payloads, vec!["hello"]);
    }

    #[test]
    fn splitter_accepts_no_space_after_colon() {
        let mut splitter = SseLineSplitter::default();
        let payloads = splitter.push(b"data:tight\n");
        assert_eq!(payloads, vec!["tight"]);
    }
}
