//! Stream events and their Server-Sent Events wire encoding.
//!
//! Every message a client sees is one of the [`StreamEvent`] variants.
//! The SSE frames are byte-exact: the terminal sentinel is the literal
//! `data: [DONE]` line and heartbeats are SSE comments, so encoding is
//! done here by hand rather than through a framework helper.

use serde::Serialize;

use crate::error::ErrorKind;

/// One event in a streaming response.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A fragment of generated text.
    Chunk {
        /// The text content of this fragment.
        content: String,
    },
    /// The stream completed cleanly.
    Done,
    /// The stream failed; no further events follow.
    Error {
        /// The wire failure class.
        kind: ErrorKind,
        /// Human-readable description.
        message: String,
        /// Optional structured details (e.g. limits that were hit).
        details: Option<serde_json::Value>,
    },
    /// Keep-alive comment sent while waiting on a slow producer.
    Heartbeat,
}

#[derive(Serialize)]
struct WireEnvelope<'a, T: Serialize> {
    event: &'a str,
    data: T,
}

#[derive(Serialize)]
struct WireChunk<'a> {
    content: &'a str,
}

#[derive(Serialize)]
struct WireError<'a> {
    error: &'a str,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<&'a serde_json::Value>,
}

impl StreamEvent {
    /// Encode this event as a complete SSE frame, trailing blank line included.
    pub fn to_sse(&self) -> String {
        match self {
            Self::Chunk { content } => {
                let envelope = WireEnvelope {
                    event: "chunk",
                    data: WireChunk { content },
                };
                // Envelope of borrowed strings; serialization cannot fail.
                let json = serde_json::to_string(&envelope).expect("serialize chunk event");
                format!("data: {json}\n\n")
            }
            Self::Done => "data: [DONE]\n\n".to_string(),
            Self::Error {
                kind,
                message,
                details,
            } => {
                let envelope = WireEnvelope {
                    event: "error",
                    data: WireError {
                        error: kind.as_str(),
                        message,
                        details: details.as_ref(),
                    },
                };
                let json = serde_json::to_string(&envelope).expect("serialize error event");
                format!("data: {json}\n\n")
            }
            Self::Heartbeat => ": ping\n\n".to_string(),
        }
    }

    /// True for the variants that terminate a stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_frame_format() {
        let event = StreamEvent::Chunk {
            content: "HELLO".to_string(),
        };
        assert_eq!(
            event.to_sse(),
            "data: {\"event\":\"chunk\",\"data\":{\"content\":\"HELLO\"}}\n\n"
        );
    }

    #[test]
    fn chunk_frame_escapes_json() {
        let event = StreamEvent::Chunk {
            content: "line1\nline2 \"quoted\"".to_string(),
        };
        let frame = event.to_sse();
        // Newlines inside content must be JSON-escaped, never raw, or the
        // SSE framing would split the event.
        assert!(frame.contains("line1\\nline2"));
        assert!(frame.contains("\\\"quoted\\\""));
        assert_eq!(frame.matches('\n').count(), 2);
    }

    #[test]
    fn done_frame_is_literal_sentinel() {
        assert_eq!(StreamEvent::Done.to_sse(), "data: [DONE]\n\n");
    }

    #[test]
    fn error_frame_format() {
        let event = StreamEvent::Error {
            kind: ErrorKind::ProviderStreamFailure,
            message: "connection reset".to_string(),
            details: None,
        };
        assert_eq!(
            event.to_sse(),
            "data: {\"event\":\"error\",\"data\":{\"error\":\"provider_stream_failure\",\"message\":\"connection reset\"}}\n\n"
        );
    }

    #[test]
    fn error_frame_with_details() {
        let event = StreamEvent::Error {
            kind: ErrorKind::PoolExhaustedUser,
            message: "limit reached".to_string(),
            details: Some(serde_json::json!({"user_id": "u1", "limit": 3})),
        };
        let frame = event.to_sse();
        assert!(frame.contains("\"details\":{\"limit\":3,\"user_id\":\"u1\"}"));
    }

    #[test]
    fn heartbeat_is_sse_comment() {
        assert_eq!(StreamEvent::Heartbeat.to_sse(), ": ping\n\n");
    }

    #[test]
    fn terminal_classification() {
        assert!(StreamEvent::Done.is_terminal());
        assert!(StreamEvent::Error {
            kind: ErrorKind::Internal,
            message: String::new(),
            details: None,
        }
        .is_terminal());
        assert!(!StreamEvent::Heartbeat.is_terminal());
        assert!(!StreamEvent::Chunk {
            content: String::new()
        }
        .is_terminal());
    }
}
