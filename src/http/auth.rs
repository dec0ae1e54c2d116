//! Request authentication and request-id propagation.

use super::AppState;
use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use uuid::Uuid;

const REQUEST_ID_HEADER: &str = "x-request-id";
const API_KEY_HEADER: &str = "x-api-key";

/// Request id attached to every request, echoed in `X-Request-ID`.
#[derive(Clone, Debug)]
pub struct RequestId(pub String);

/// Paths served without the shared API key.
fn is_open_path(path: &str) -> bool {
    path.starts_with("/health") || path.starts_with("/swagger") || path.starts_with("/chatwoot/webhook")
}

/// Shared-API-key check. The key travels in either `Authorization`
/// (optionally with a `Bearer ` prefix) or `X-API-Key`.
pub async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.api_key.as_deref() else {
        return next.run(request).await;
    };
    if is_open_path(request.uri().path()) {
        return next.run(request).await;
    }

    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.strip_prefix("Bearer ").unwrap_or(v))
        .or_else(|| {
            request
                .headers()
                .get(API_KEY_HEADER)
                .and_then(|v| v.to_str().ok())
        });

    if presented == Some(expected) {
        next.run(request).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            axum::Json(serde_json::json!({
                "error": { "kind": "unauthorized", "message": "missing or invalid api key" }
            })),
        )
            .into_response()
    }
}

/// Echo (or generate) `X-Request-ID` and emit one structured log line per
/// request.
pub async fn request_id(mut request: Request, next: Next) -> Response {
    let id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let method = request.method().clone();
    let path = request.uri().path().to_string();
    request.extensions_mut().insert(RequestId(id.clone()));

    let mut response = next.run(request).await;

    tracing::info!(
        request_id = %id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        "request"
    );
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_paths_skip_auth() {
        assert!(is_open_path("/health"));
        assert!(is_open_path("/health/live"));
        assert!(is_open_path("/swagger/index.html"));
        assert!(is_open_path("/chatwoot/webhook/alice"));
        assert!(!is_open_path("/sessions/list"));
    }
}
