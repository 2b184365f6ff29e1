//! API error types for the gateway server.
//!
//! Maps core pipeline errors to HTTP status codes and JSON error
//! bodies. Mid-stream failures never pass through here; they surface as
//! SSE error events on an already-open 200 response.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use streamgate_core::error::GatewayError;

/// API error type for route handlers.
pub struct ApiError(pub GatewayError);

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let kind = err.kind();

        let status = match &err {
            GatewayError::Validation { .. } | GatewayError::Security { .. } => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::RateLimited { .. } | GatewayError::PoolExhaustedUser { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            GatewayError::Shedding
            | GatewayError::QueueFull
            | GatewayError::QueueTimeout { .. }
            | GatewayError::PoolExhaustedGlobal { .. }
            | GatewayError::AllProvidersUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::ProviderStream { .. } | GatewayError::Internal { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %err, "internal error surfaced to client");
        }

        let mut response = match &err {
            // Connection-limit rejections carry structured details so
            // clients can show which limit was hit.
            GatewayError::PoolExhaustedUser {
                user_id,
                current,
                limit,
            } => {
                let body = axum::Json(json!({
                    "error": "too_many_connections",
                    "details": {
                        "user_id": user_id,
                        "current": current,
                        "limit": limit,
                    },
                }));
                (status, body).into_response()
            }
            GatewayError::RateLimited { retry_after_secs } => {
                let body = axum::Json(json!({
                    "error": kind.as_str(),
                    "message": err.to_string(),
                }));
                let mut response = (status, body).into_response();
                if let Ok(value) = retry_after_secs.to_string().parse() {
                    response.headers_mut().insert("retry-after", value);
                }
                response
            }
            _ => {
                let body = axum::Json(json!({
                    "error": kind.as_str(),
                    "message": err.to_string(),
                }));
                (status, body).into_response()
            }
        };

        response.headers_mut().insert(
            "x-error-kind",
            axum::http::HeaderValue::from_static(kind.as_str()),
        );
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(err: GatewayError) -> StatusCode {
        ApiError(err).into_response().status()
    }

    #[test]
    fn status_mapping() {
        assert_eq!(
            status_of(GatewayError::Validation {
                message: "bad".into()
            }),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(GatewayError::Security {
                message: "bad".into()
            }),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(GatewayError::RateLimited {
                retry_after_secs: 5
            }),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            status_of(GatewayError::PoolExhaustedUser {
                user_id: "u".into(),
                current: 3,
                limit: 3
            }),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            status_of(GatewayError::PoolExhaustedGlobal {
                current: 1,
                limit: 1
            }),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(status_of(GatewayError::Shedding), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status_of(GatewayError::QueueFull), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            status_of(GatewayError::AllProvidersUnavailable),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(GatewayError::Internal {
                message: "boom".into()
            }),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn rate_limited_carries_retry_after() {
        let response = ApiError(GatewayError::RateLimited {
            retry_after_secs: 42,
        })
        .into_response();
        assert_eq!(
            response.headers().get("retry-after").unwrap(),
            &"42".parse::<axum::http::HeaderValue>().unwrap()
        );
    }
}
