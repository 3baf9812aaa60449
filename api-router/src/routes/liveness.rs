use axum::http::StatusCode;

/// Process liveness probe.
pub async fn live() -> StatusCode {
    StatusCode::OK
}
