use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            compacted_session::CompactedSession,
            episode::Episode,
            label::Label,
            queue_job::{JobPayload, QueueJob, QueueName},
        },
        vector::{self, VectorNamespace},
    },
};
use tracing::{debug, info, warn};

use crate::pipeline::{config::IngestionConfig, services::PipelineServices};

/// Schedule the follow-up work a successful ingest produces. Hook enqueue
/// failures (including backpressure) are logged, never propagated: the
/// ingest itself already succeeded.
pub async fn enqueue_after_ingest(
    db: &SurrealDbClient,
    config: &IngestionConfig,
    episodes: &[Episode],
    job: &QueueJob,
) {
    let Some(first) = episodes.first() else {
        return;
    };
    let JobPayload::Ingest {
        session_id,
        user_id,
        workspace_id,
        ..
    } = &job.payload
    else {
        return;
    };

    let mut hooks: Vec<QueueJob> = Vec::new();

    if first.title.is_none() {
        hooks.push(QueueJob::new(
            QueueName::TitleGeneration,
            JobPayload::TitleGeneration {
                episode_id: first.id.clone(),
                user_id: user_id.clone(),
            },
            None,
        ));
    }

    for episode in episodes {
        hooks.push(QueueJob::new(
            QueueName::LabelAssignment,
            JobPayload::LabelAssignment {
                episode_id: episode.id.clone(),
                user_id: user_id.clone(),
            },
            None,
        ));
    }

    let compaction = QueueJob::new(
        QueueName::SessionCompaction,
        JobPayload::SessionCompaction {
            session_id: session_id.clone(),
            user_id: user_id.clone(),
            workspace_id: workspace_id.clone(),
        },
        Some(session_id.clone()),
    )
    .delayed(chrono::Utc::now() + chrono::Duration::from_std(config.tuning.compaction_delay).unwrap_or_default());
    hooks.push(compaction);

    for hook in hooks {
        let queue = hook.queue;
        if let Err(err) = hook.enqueue(db, config.queue_max_depth).await {
            warn!(queue = queue.as_str(), error = %err, "post-hook enqueue failed");
        }
    }
}

/// Generate and store a short title for an episode that arrived without one.
pub async fn run_title_generation(
    db: &SurrealDbClient,
    services: &dyn PipelineServices,
    episode_id: &str,
) -> Result<(), AppError> {
    let episode: Option<Episode> = db.get_item(episode_id).await?;
    let Some(episode) = episode else {
        return Err(AppError::NotFound(format!("episode {episode_id}")));
    };

    if episode.title.is_some() {
        return Ok(());
    }

    let title = services.generate_title(&episode.content).await?;
    Episode::set_title(db, episode_id, title.trim()).await?;

    debug!(episode_id, "episode title generated");
    Ok(())
}

/// Auto-assign labels whose vector similarity to the episode content clears
/// the configured threshold.
pub async fn run_label_assignment(
    db: &SurrealDbClient,
    services: &dyn PipelineServices,
    tuning: &crate::pipeline::config::IngestionTuning,
    episode_id: &str,
    user_id: &str,
) -> Result<(), AppError> {
    let labels = Label::all_for_user(db, user_id).await?;
    if labels.is_empty() {
        return Ok(());
    }

    let episode: Option<Episode> = db.get_item(episode_id).await?;
    let Some(episode) = episode else {
        return Err(AppError::NotFound(format!("episode {episode_id}")));
    };

    let content_embedding = services.embed(&episode.content).await?;
    let label_ids: Vec<String> = labels.iter().map(|label| label.id.clone()).collect();
    let scores = vector::batch_score(db, VectorNamespace::Label, &label_ids, content_embedding)
        .await?;

    let assignable: Vec<String> = scores
        .into_iter()
        .filter(|hit| hit.score >= tuning.label_similarity_threshold)
        .filter(|hit| !episode.label_ids.contains(&hit.id))
        .map(|hit| hit.id)
        .collect();

    if assignable.is_empty() {
        return Ok(());
    }

    debug!(episode_id, labels = assignable.len(), "labels auto-assigned");
    Episode::add_labels(db, episode_id, assignable).await
}

/// Summarize a finished session into a `compacted_session` node linked to
/// its episodes. Idempotent: an already-compacted session is left alone.
pub async fn run_session_compaction(
    db: &SurrealDbClient,
    services: &dyn PipelineServices,
    session_id: &str,
    user_id: &str,
    workspace_id: Option<String>,
) -> Result<(), AppError> {
    if CompactedSession::find_by_session(db, session_id, user_id)
        .await?
        .is_some()
    {
        return Ok(());
    }

    let episodes = Episode::for_session(db, session_id, user_id).await?;
    if episodes.is_empty() {
        return Ok(());
    }

    let contents: Vec<String> = episodes
        .iter()
        .map(|episode| episode.content.clone())
        .collect();
    let summary = services.summarize_session(&contents).await?;

    let total_chars: usize = contents.iter().map(String::len).sum();
    let compression_ratio = if total_chars == 0 {
        1.0
    } else {
        summary.len() as f32 / total_chars as f32
    };

    let started_at = episodes
        .iter()
        .map(|episode| episode.created_at)
        .min()
        .unwrap_or_else(chrono::Utc::now);
    let ended_at = episodes
        .iter()
        .map(|episode| episode.created_at)
        .max()
        .unwrap_or_else(chrono::Utc::now);

    let compacted = CompactedSession::new(
        session_id.to_owned(),
        summary.clone(),
        episodes.len() as u32,
        started_at,
        ended_at,
        compression_ratio,
        user_id.to_owned(),
        workspace_id,
    );
    db.store_item(compacted.clone()).await?;

    let episode_ids: Vec<String> = episodes.iter().map(|episode| episode.id.clone()).collect();
    compacted.relate_episodes(db, &episode_ids).await?;

    let summary_embedding = services.embed(&summary).await?;
    vector::upsert_vector(
        db,
        VectorNamespace::CompactedSession,
        &compacted.id,
        summary_embedding,
        user_id,
    )
    .await?;

    info!(
        session_id,
        episodes = episode_ids.len(),
        compression_ratio,
        "session compacted"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::ExtractionResult;
    use crate::pipeline::config::IngestionTuning;
    use crate::pipeline::services::tests_support::MockServices;
    use chrono::Utc;
    use common::storage::indexes::ensure_runtime_indexes;
    use common::storage::types::episode::EpisodeType;
    use uuid::Uuid;

    async fn setup_db() -> SurrealDbClient {
        let db = SurrealDbClient::memory("hooks_test", &Uuid::new_v4().to_string())
            .await
            .expect("Failed to start in-memory surrealdb");
        ensure_runtime_indexes(&db, 3)
            .await
            .expect("failed to build runtime indexes");
        db
    }

    fn episode(session: &str, content: &str) -> Episode {
        Episode::new(
            content.into(),
            content.into(),
            "core".into(),
            session.into(),
            EpisodeType::Conversation,
            0,
            1,
            1,
            "hash".into(),
            vec!["hash".into()],
            Vec::new(),
            Utc::now(),
            "user-1".into(),
            None,
        )
    }

    #[tokio::test]
    async fn title_generation_fills_only_missing_titles() {
        let db = setup_db().await;
        let services = MockServices::new(ExtractionResult::default());

        let untitled = episode("s1", "A chat about gardening.");
        db.store_item(untitled.clone()).await.expect("store");
        run_title_generation(&db, &services, &untitled.id)
            .await
            .expect("hook");
        let stored: Episode = db.get_item(&untitled.id).await.expect("fetch").expect("present");
        assert_eq!(stored.title.as_deref(), Some("Mock Title"));

        let mut titled = episode("s2", "Another chat.");
        titled.title = Some("Kept".into());
        db.store_item(titled.clone()).await.expect("store");
        run_title_generation(&db, &services, &titled.id)
            .await
            .expect("hook");
        let stored: Episode = db.get_item(&titled.id).await.expect("fetch").expect("present");
        assert_eq!(stored.title.as_deref(), Some("Kept"));
    }

    #[tokio::test]
    async fn labels_above_threshold_are_assigned() {
        let db = setup_db().await;
        let services =
            MockServices::new(ExtractionResult::default()).with_embedding(vec![1.0, 0.0, 0.0]);
        let tuning = IngestionTuning::default();

        let close = Label::new("work".into(), None, "user-1".into());
        let far = Label::new("travel".into(), None, "user-1".into());
        db.store_item(close.clone()).await.expect("store");
        db.store_item(far.clone()).await.expect("store");
        vector::upsert_vector(&db, VectorNamespace::Label, &close.id, vec![1.0, 0.0, 0.0], "user-1")
            .await
            .expect("vector");
        vector::upsert_vector(&db, VectorNamespace::Label, &far.id, vec![0.0, 0.0, 1.0], "user-1")
            .await
            .expect("vector");

        let target = episode("s1", "Planning the quarterly roadmap.");
        db.store_item(target.clone()).await.expect("store");

        run_label_assignment(&db, &services, &tuning, &target.id, "user-1")
            .await
            .expect("hook");

        let stored: Episode = db.get_item(&target.id).await.expect("fetch").expect("present");
        assert!(stored.label_ids.contains(&close.id));
        assert!(!stored.label_ids.contains(&far.id));
    }

    #[tokio::test]
    async fn compaction_is_idempotent_per_session() {
        let db = setup_db().await;
        let services = MockServices::new(ExtractionResult::default());

        for content in ["First turn.", "Second turn."] {
            let mut row = episode("s1", content);
            row.id = Uuid::new_v4().to_string();
            db.store_item(row).await.expect("store");
        }

        run_session_compaction(&db, &services, "s1", "user-1", None)
            .await
            .expect("first compaction");
        run_session_compaction(&db, &services, "s1", "user-1", None)
            .await
            .expect("second compaction");

        let all: Vec<CompactedSession> = db.get_all_stored_items().await.expect("fetch");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].episode_count, 2);
        assert!(all[0].compression_ratio > 0.0);

        let summarize_calls = services
            .calls
            .lock()
            .await
            .iter()
            .filter(|call| **call == "summarize")
            .count();
        assert_eq!(summarize_calls, 1);
    }
}
