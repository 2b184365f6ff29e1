//! Request/response middleware: thread-ID propagation, security
//! headers, and environment-aware CORS.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::{HeaderName, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;
use tower_http::cors::{Any, CorsLayer};

use streamgate_core::config::{Environment, ServerConfig};

use crate::state::AppState;

/// Header carrying the request correlation key.
pub const THREAD_ID_HEADER: &str = "x-thread-id";

/// The correlation key for one request, extracted from the client's
/// `X-Thread-ID` header or generated.
#[derive(Debug, Clone)]
pub struct ThreadId(pub String);

/// Read or generate the thread id on the way in; echo it on the way
/// out so every response (including errors) carries it.
pub async fn thread_id(mut request: Request, next: Next) -> Response {
    let thread_id = request
        .headers()
        .get(THREAD_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map_or_else(
            || format!("t-{}", uuid::Uuid::new_v4()),
            ToString::to_string,
        );

    request.extensions_mut().insert(ThreadId(thread_id.clone()));
    let mut response = next.run(request).await;

    if let Ok(value) = HeaderValue::from_str(&thread_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(THREAD_ID_HEADER), value);
    }
    response
}

/// Attach the standard security headers to every response. HSTS is
/// only meaningful behind TLS, so it is skipped in development.
pub async fn security_headers(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    headers.insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        HeaderName::from_static("x-frame-options"),
        HeaderValue::from_static("DENY"),
    );
    headers.insert(
        HeaderName::from_static("x-xss-protection"),
        HeaderValue::from_static("1; mode=block"),
    );
    // SSE rendering may need inline styles downstream.
    headers.insert(
        HeaderName::from_static("content-security-policy"),
        HeaderValue::from_static(
            "default-src 'self'; connect-src 'self'; style-src 'self' 'unsafe-inline'",
        ),
    );
    if state.config.server.environment != Environment::Development {
        headers.insert(
            HeaderName::from_static("strict-transport-security"),
            HeaderValue::from_static("max-age=31536000; includeSubDomains; preload"),
        );
    }

    response
}

/// Build the CORS layer for the configured environment.
///
/// Development allows any origin (credentials stay disabled); staging
/// and production use the exact-match whitelist. `X-Thread-ID` is
/// exposed so browsers can read the correlation key.
pub fn cors_layer(config: &ServerConfig) -> CorsLayer {
    let expose = [HeaderName::from_static(THREAD_ID_HEADER)];

    match config.environment {
        Environment::Development => CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
            .expose_headers(expose),
        Environment::Staging | Environment::Production => {
            let origins: Vec<HeaderValue> = config
                .cors_origins
                .iter()
                .filter_map(|origin| origin.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
                .allow_headers([
                    axum::http::header::CONTENT_TYPE,
                    HeaderName::from_static(THREAD_ID_HEADER),
                ])
                .expose_headers(expose)
        }
    }
}
