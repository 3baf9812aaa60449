use axum::{extract::State, http::StatusCode};
use tracing::warn;

use crate::api_state::ApiState;

/// Readiness probe: the service is ready once the graph store answers.
pub async fn ready(State(state): State<ApiState>) -> StatusCode {
    match state.db.client.health().await {
        Ok(()) => StatusCode::OK,
        Err(err) => {
            warn!(error = %err, "readiness probe failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}
