use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use http::StatusCode;

use crate::ServiceState;

pub fn router(state: ServiceState) -> Router<ServiceState> {
    Router::new()
        .route("/livez", get(livez))
        .route("/version", get(version))
        .with_state(state)
}

async fn livez() -> Response {
    (StatusCode::OK, Json(serde_json::json!({"status": "ok"}))).into_response()
}

async fn version() -> Response {
    let build = common::prelude::build_info();
    let msg = serde_json::json!({
        "version": build.version,
        "build_profile": build.build_profile,
    });
    (StatusCode::OK, Json(msg)).into_response()
}
