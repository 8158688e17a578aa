use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;

/// Fallback for unrouted requests. Provisioning clients only ever see the status.
pub async fn not_found_handler(method: Method, uri: Uri, headers: HeaderMap) -> Response {
    tracing::debug!(%method, path = uri.path(), "no route");

    let wants_json = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("application/json"));

    if wants_json {
        let msg = serde_json::json!({"msg": "not found", "path": uri.path()});
        (StatusCode::NOT_FOUND, Json(msg)).into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}
