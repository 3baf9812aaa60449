use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use common::storage::types::{
    episode::{Episode, EpisodeStatus},
    queue_job::{JobState, QueueJob},
};
use serde::Serialize;
use serde_json::json;

use crate::{api_state::ApiState, error::ApiError};

use super::Identity;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EpisodeStatusResponse {
    pub id: String,
    pub status: EpisodeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub episode_ids: Vec<String>,
}

fn job_status(state: &JobState) -> EpisodeStatus {
    match state {
        JobState::Queued | JobState::Failed => EpisodeStatus::Pending,
        JobState::InProgress => EpisodeStatus::Processing,
        JobState::Succeeded => EpisodeStatus::Completed,
        JobState::DeadLetter => EpisodeStatus::Failed,
        JobState::Cancelled => EpisodeStatus::Cancelled,
    }
}

/// Status of an episode, or of the ingest job the episode id returned by
/// `/ingest` refers to.
pub async fn episode_status(
    State(state): State<ApiState>,
    identity: Identity,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let episode: Option<Episode> = state.db.get_item(&id).await.map_err(common::error::AppError::from)?;
    if let Some(episode) = episode {
        if episode.user_id != identity.user_id {
            return Err(ApiError::NotFound(format!("episode {id}")));
        }
        return Ok(Json(EpisodeStatusResponse {
            id: episode.id,
            status: episode.status,
            error: episode.error,
            session_id: Some(episode.session_id),
            episode_ids: Vec::new(),
        }));
    }

    let job: Option<QueueJob> = state.db.get_item(&id).await.map_err(common::error::AppError::from)?;
    let Some(job) = job else {
        return Err(ApiError::NotFound(format!("episode {id}")));
    };
    if job.user_id != identity.user_id {
        return Err(ApiError::NotFound(format!("episode {id}")));
    }

    Ok(Json(EpisodeStatusResponse {
        id: job.id,
        status: job_status(&job.state),
        error: job.last_error,
        session_id: job.serialization_key,
        episode_ids: job.episode_ids,
    }))
}

/// Re-enqueue a failed ingest: the job returns to the queue and its
/// episodes return to `PENDING`.
pub async fn retry_episode(
    State(state): State<ApiState>,
    identity: Identity,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = find_job(&state, &identity, &id).await?;

    QueueJob::requeue(&state.db, &job.id).await?;
    for episode_id in &job.episode_ids {
        Episode::set_status(&state.db, episode_id, EpisodeStatus::Pending, None).await?;
    }

    Ok((StatusCode::OK, Json(json!({ "status": "requeued" }))))
}

/// Delete an episode, cascading through statements whose only provenance it
/// was and entities that end up orphaned.
pub async fn delete_episode(
    State(state): State<ApiState>,
    identity: Identity,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    ingestion_pipeline::maintenance::delete_episode(&state.db, &id, &identity.user_id).await?;
    Ok((StatusCode::OK, Json(json!({ "status": "deleted" }))))
}

/// Locate the ingest job for either a job id or one of its episode ids.
async fn find_job(state: &ApiState, identity: &Identity, id: &str) -> Result<QueueJob, ApiError> {
    let job: Option<QueueJob> = state.db.get_item(id).await.map_err(common::error::AppError::from)?;
    if let Some(job) = job {
        if job.user_id == identity.user_id {
            return Ok(job);
        }
        return Err(ApiError::NotFound(format!("episode {id}")));
    }

    let mut response = state
        .db
        .client
        .query(
            "SELECT * FROM queue_job \
             WHERE user_id = $user_id AND $episode_id IN episode_ids \
             LIMIT 1;",
        )
        .bind(("user_id", identity.user_id.clone()))
        .bind(("episode_id", id.to_owned()))
        .await
        .map_err(common::error::AppError::from)?;

    let jobs: Vec<QueueJob> = response.take(0).map_err(common::error::AppError::from)?;
    jobs.into_iter()
        .next()
        .ok_or_else(|| ApiError::NotFound(format!("episode {id}")))
}
