use axum::{extract::State, response::IntoResponse, Json};
use retrieval_pipeline::{SearchOptions, SearchRequest};
use serde::Deserialize;

use crate::{api_state::ApiState, error::ApiError};

use super::Identity;

#[derive(Debug, Deserialize)]
pub struct ApiSearchRequest {
    pub query: String,
    #[serde(flatten)]
    pub options: SearchOptions,
}

/// Hybrid retrieval over the caller's graph.
pub async fn search_data(
    State(state): State<ApiState>,
    identity: Identity,
    Json(input): Json<ApiSearchRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if input.query.trim().is_empty() {
        return Err(ApiError::ValidationError("query is required".into()));
    }

    let request = SearchRequest {
        user_id: identity.user_id,
        workspace_id: identity.workspace_id,
        query: input.query,
        options: input.options,
    };

    let reranker = match &state.reranker_pool {
        Some(pool) => Some(pool.checkout().await?),
        None => None,
    };

    let response = retrieval_pipeline::search(
        &state.db,
        state.query_services.as_ref(),
        &request,
        &state.retrieval_config,
        reranker,
    )
    .await?;

    Ok(Json(response))
}
