use axum::extract::{Request, State};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{SecondsFormat, Utc};
use mlreg_core::RegistryError;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{ApiError, ErrorBody, ErrorDetail};
use crate::state::AppState;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const API_KEY_HEADER: &str = "x-api-key";

/// Per-request identity, inserted by [`request_context`].
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub path: String,
}

impl RequestContext {
    fn from_request(req: &Request) -> Self {
        let request_id = req
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|id| !id.is_empty() && id.len() <= 128)
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Self {
            request_id,
            path: req.uri().path().to_string(),
        }
    }
}

/// Outermost layer: assigns the request id, renders error bodies and logs
/// one line per completed request.
pub async fn request_context(mut req: Request, next: Next) -> Response {
    let ctx = RequestContext::from_request(&req);
    req.extensions_mut().insert(ctx.clone());
    let method = req.method().clone();
    let started = Instant::now();

    let mut response = next.run(req).await;

    if let Some(detail) = response.extensions_mut().remove::<ErrorDetail>() {
        let status = response.status();
        let body = ErrorBody {
            detail,
            request_id: ctx.request_id.clone(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            path: ctx.path.clone(),
        };
        response = (status, Json(body)).into_response();
    }
    if let Ok(value) = HeaderValue::from_str(&ctx.request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    info!(
        request_id = %ctx.request_id,
        method = %method,
        path = %ctx.path,
        status = response.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Request completed"
    );
    response
}

/// Rejects requests without the configured `X-API-Key`. A no-op when no key
/// is configured.
pub async fn require_api_key(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if let Some(expected) = state.config.api_key.as_deref() {
        let provided = req
            .headers()
            .get(API_KEY_HEADER)
            .map(HeaderValue::as_bytes)
            .unwrap_or_default();
        if !keys_match(provided, expected.as_bytes()) {
            warn!(path = %req.uri().path(), "Rejected request with missing or bad API key");
            return ApiError(RegistryError::Unauthorized(
                "missing or invalid X-API-Key header".into(),
            ))
            .into_response();
        }
    }
    next.run(req).await
}

/// Compare every byte regardless of where the first mismatch is.
fn keys_match(provided: &[u8], expected: &[u8]) -> bool {
    let diff = provided
        .iter()
        .zip(expected)
        .fold(provided.len() ^ expected.len(), |acc, (a, b)| {
            acc | usize::from(a ^ b)
        });
    diff == 0
}

/// JSON rendering for errors produced outside a handler, such as a route
/// that does not exist.
pub async fn not_found(req: Request) -> ApiError {
    ApiError(RegistryError::NotFound(format!(
        "route {} {}",
        req.method(),
        req.uri().path()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_match() {
        assert!(keys_match(b"secret", b"secret"));
        assert!(!keys_match(b"secreT", b"secret"));
        assert!(!keys_match(b"Secret", b"secret"));
        assert!(!keys_match(b"secret-and-more", b"secret"));
        assert!(!keys_match(b"secre", b"secret"));
        assert!(!keys_match(b"", b"secret"));
    }
}
