use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use chrono::{DateTime, Utc};
use common::storage::types::{
    episode::EpisodeType,
    queue_job::{JobPayload, QueueJob, QueueName},
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::{api_state::ApiState, error::ApiError};

use super::Identity;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestRequest {
    pub episode_body: String,
    #[serde(default)]
    pub reference_time: Option<DateTime<Utc>>,
    #[serde(rename = "type", default)]
    pub episode_type: Option<EpisodeType>,
    #[serde(default)]
    pub source: Option<String>,
    pub session_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub label_ids: Vec<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Accept an episode for ingestion. The request is validated, queued behind
/// its session, and acknowledged with the job id; processing status is
/// fetched separately.
pub async fn ingest_data(
    State(state): State<ApiState>,
    identity: Identity,
    Json(input): Json<IngestRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if input.episode_body.trim().is_empty() {
        return Err(ApiError::ValidationError("episodeBody is required".into()));
    }
    if input.session_id.trim().is_empty() {
        return Err(ApiError::ValidationError("sessionId is required".into()));
    }

    let payload = JobPayload::Ingest {
        episode_body: input.episode_body,
        reference_time: input.reference_time.unwrap_or_else(Utc::now),
        episode_type: input.episode_type.unwrap_or(EpisodeType::Conversation),
        source: input.source.unwrap_or_else(|| "core".to_owned()),
        session_id: input.session_id.clone(),
        title: input.title,
        label_ids: input.label_ids,
        metadata: input.metadata,
        user_id: identity.user_id.clone(),
        workspace_id: identity.workspace_id,
    };

    let job = QueueJob::new(QueueName::Ingest, payload, Some(input.session_id));
    let id = job
        .enqueue(&state.db, state.ingestion_config.queue_max_depth)
        .await?;

    info!(job_id = %id, user_id = %identity.user_id, "ingest accepted");

    Ok((StatusCode::OK, Json(json!({ "id": id }))))
}
