//! The streaming endpoint.
//!
//! Admission (load shed) → pool acquisition → pipeline, with queue
//! failover when the pool is exhausted and failover is enabled. The
//! response is `text/event-stream` with byte-exact SSE frames; errors
//! before the first frame map to HTTP status codes, everything after
//! rides the stream as SSE error events.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use axum::{Extension, Json};
use futures_util::StreamExt;
use serde::Deserialize;

use streamgate_core::admission::LoadShedder;
use streamgate_core::error::GatewayError;
use streamgate_core::pipeline::EventStream;
use streamgate_core::pool::PoolAdmission;
use streamgate_core::request::{GenerationParams, StreamRequest};

use crate::error::ApiError;
use crate::middleware::ThreadId;
use crate::state::AppState;

/// Header carrying the caller identity from the auth terminator.
const USER_ID_HEADER: &str = "x-user-id";

fn default_stream_flag() -> bool {
    true
}

/// Request body for `POST /stream`.
#[derive(Debug, Deserialize)]
pub struct StreamBody {
    /// The query text.
    pub query: String,
    /// Model to generate with.
    pub model: String,
    /// Optional preferred provider.
    #[serde(default)]
    pub provider: Option<String>,
    /// Caller identity; the `X-User-ID` header takes precedence.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Must be true; non-streaming completions are not served here.
    #[serde(default = "default_stream_flag")]
    pub stream: bool,
    /// Optional generation cap.
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Optional sampling temperature.
    #[serde(default)]
    pub temperature: Option<f32>,
}

/// `POST /api/v1/stream`
pub async fn stream(
    State(state): State<Arc<AppState>>,
    Extension(ThreadId(thread_id)): Extension<ThreadId>,
    headers: HeaderMap,
    Json(body): Json<StreamBody>,
) -> Result<Response, ApiError> {
    if !body.stream {
        return Err(GatewayError::Validation {
            message: "only streaming requests are supported; set \"stream\": true".to_string(),
        }
        .into());
    }

    let user_id = headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string)
        .or(body.user_id)
        .unwrap_or_else(|| "anonymous".to_string());

    let mut params = GenerationParams::default();
    if let Some(max_tokens) = body.max_tokens {
        params.max_tokens = max_tokens;
    }
    if let Some(temperature) = body.temperature {
        params.temperature = temperature;
    }

    let request = StreamRequest {
        query: body.query,
        model: body.model,
        provider: body.provider,
        user_id: user_id.clone(),
        thread_id: thread_id.clone(),
        params,
    };

    // Admission gate: non-blocking shed check, idempotent per thread.
    if !state.shedder.accept(&thread_id) {
        return Err(GatewayError::Shedding.into());
    }

    let result = admit_and_run(&state, request).await;
    match result {
        Ok(events) => Ok(sse_response(events, &state.shedder, thread_id)),
        Err(err) => {
            state.shedder.release(&thread_id);
            Err(err.into())
        }
    }
}

async fn admit_and_run(
    state: &Arc<AppState>,
    request: StreamRequest,
) -> Result<EventStream, GatewayError> {
    match state
        .pool
        .acquire(&request.user_id, &request.thread_id)
        .await
    {
        PoolAdmission::Admitted(slot) => state.pipeline.execute(request, slot).await,
        PoolAdmission::GlobalExhausted { current, limit } => {
            if state.toggles.failover_enabled() {
                tracing::info!(
                    thread_id = %request.thread_id,
                    current,
                    "global pool exhausted; failing over",
                );
                state.failover.enqueue_and_stream(request).await
            } else {
                Err(GatewayError::PoolExhaustedGlobal { current, limit })
            }
        }
        PoolAdmission::UserExhausted { current, limit } => {
            if state.toggles.failover_enabled() {
                tracing::info!(
                    thread_id = %request.thread_id,
                    user_id = %request.user_id,
                    current,
                    "user pool exhausted; failing over",
                );
                state.failover.enqueue_and_stream(request).await
            } else {
                Err(GatewayError::PoolExhaustedUser {
                    user_id: request.user_id,
                    current,
                    limit,
                })
            }
        }
    }
}

/// Releases the shedder's idempotence marker when the response body is
/// dropped, whether the stream completed or the client hung up.
struct ShedderRelease {
    shedder: Arc<LoadShedder>,
    thread_id: String,
}

impl Drop for ShedderRelease {
    fn drop(&mut self) {
        self.shedder.release(&self.thread_id);
    }
}

fn sse_response(events: EventStream, shedder: &Arc<LoadShedder>, thread_id: String) -> Response {
    let guard = ShedderRelease {
        shedder: Arc::clone(shedder),
        thread_id,
    };

    let frames = events.map(move |event| {
        let _held = &guard;
        Ok::<_, Infallible>(bytes::Bytes::from(event.to_sse()))
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("x-accel-buffering", "no")
        .body(Body::from_stream(frames))
        .expect("valid SSE response")
}
