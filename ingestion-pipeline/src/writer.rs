use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        indexes::rebuild_fts_indexes,
        types::{entity::Entity, episode::Episode, statement::Statement},
        vector::{self, VectorNamespace},
    },
};
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

use crate::pipeline::{
    config::IngestionTuning,
    context::{DuplicateProvenance, Invalidation, NewEntity, PendingStatement},
    services::PipelineServices,
};

fn is_retryable_conflict(error: &surrealdb::Error) -> bool {
    error
        .to_string()
        .contains("Failed to commit transaction due to a read or write conflict")
}

/// Run a write closure with bounded backoff on Surreal commit conflicts.
async fn with_conflict_retry<F, Fut>(tuning: &IngestionTuning, mut write: F) -> Result<(), AppError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<(), AppError>>,
{
    let mut backoff_ms = tuning.graph_initial_backoff_ms;
    let last_attempt = tuning.graph_store_attempts.saturating_sub(1);

    for attempt in 0..tuning.graph_store_attempts {
        match write().await {
            Ok(()) => return Ok(()),
            Err(AppError::Database(err)) if is_retryable_conflict(&err) && attempt < last_attempt => {
                warn!(
                    attempt = attempt + 1,
                    "Transient SurrealDB conflict while writing graph data; retrying"
                );
                sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms = backoff_ms.saturating_mul(2).min(tuning.graph_max_backoff_ms);
            }
            Err(err) => return Err(err),
        }
    }

    Err(AppError::InternalError(
        "Failed to write graph data after retries".to_string(),
    ))
}

/// Persist everything one pipeline run produced. The order follows the
/// transactional contract: entities, statements and their edges,
/// invalidations, then vector upserts, with the episode embedding written
/// once after all chunks. Every write is idempotent on UUID, so re-running
/// a job converges on the same graph state.
pub async fn persist(
    db: &SurrealDbClient,
    services: &dyn PipelineServices,
    tuning: &IngestionTuning,
    episodes: &[Episode],
    new_entities: &[NewEntity],
    fresh: &[PendingStatement],
    duplicates: &[DuplicateProvenance],
    invalidations: &[Invalidation],
) -> Result<(), AppError> {
    // An unchanged re-ingest reaches this point with nothing to do; keep it
    // at literally zero writes.
    if episodes.is_empty()
        && new_entities.is_empty()
        && fresh.is_empty()
        && duplicates.is_empty()
        && invalidations.is_empty()
    {
        return Ok(());
    }

    for new_entity in new_entities {
        let entity = new_entity.entity.clone();
        with_conflict_retry(tuning, || {
            let entity = entity.clone();
            async move {
                db.upsert_item(entity).await?;
                Ok(())
            }
        })
        .await?;
    }

    for pending in fresh {
        let statement = pending.statement.clone();
        with_conflict_retry(tuning, || {
            let statement = statement.clone();
            let episode_id = pending.episode_id.clone();
            async move {
                db.upsert_item(statement.clone()).await?;
                statement.relate_roles(db).await?;
                statement.add_provenance(db, &episode_id).await?;
                Ok(())
            }
        })
        .await?;
    }

    for duplicate in duplicates {
        let existing = Statement::get_by_ids(
            db,
            std::slice::from_ref(&duplicate.statement_id),
            episodes
                .first()
                .map_or("", |episode| episode.user_id.as_str()),
        )
        .await?;
        if let Some(statement) = existing.into_iter().next() {
            statement.add_provenance(db, &duplicate.episode_id).await?;
        } else {
            warn!(
                statement_id = %duplicate.statement_id,
                "duplicate target vanished before provenance transfer"
            );
        }
    }

    for invalidation in invalidations {
        Statement::invalidate(
            db,
            &invalidation.statement_id,
            invalidation.invalid_at,
            &invalidation.invalidated_by,
        )
        .await?;
    }

    // Vector namespaces are strictly subordinate to the graph: a failed
    // upsert here leaves a missing row the reconciliation sweep repairs.
    for new_entity in new_entities {
        vector::upsert_vector(
            db,
            VectorNamespace::Entity,
            &new_entity.entity.id,
            new_entity.embedding.clone(),
            &new_entity.entity.user_id,
        )
        .await?;
    }

    for pending in fresh {
        vector::upsert_vector(
            db,
            VectorNamespace::Statement,
            &pending.statement.id,
            pending.fact_embedding.clone(),
            &pending.statement.user_id,
        )
        .await?;
    }

    for episode in episodes {
        let embedding = services.embed(&episode.content).await?;
        vector::upsert_vector(
            db,
            VectorNamespace::Episode,
            &episode.id,
            embedding,
            &episode.user_id,
        )
        .await?;
    }

    rebuild_fts_indexes(db).await?;

    debug!(
        entities = new_entities.len(),
        statements = fresh.len(),
        duplicates = duplicates.len(),
        invalidations = invalidations.len(),
        episodes = episodes.len(),
        "ingestion persistence flushed to database"
    );

    Ok(())
}

/// Upsert the chunk episode rows before the pipeline stages run so failures
/// are observable on the episode itself.
pub async fn persist_episode_rows(
    db: &SurrealDbClient,
    episodes: &[Episode],
) -> Result<(), AppError> {
    for episode in episodes {
        db.upsert_item(episode.clone()).await?;
    }
    Ok(())
}

/// Orphan check used by callers deciding whether an entity write is still
/// referenced. An entity with no incoming role edges is reclaimable.
pub async fn entity_is_orphaned(db: &SurrealDbClient, entity_id: &str) -> Result<bool, AppError> {
    #[derive(serde::Deserialize)]
    struct Row {
        total: usize,
    }

    let mut total = 0;
    for table in ["has_subject", "has_predicate", "has_object"] {
        let mut response = db
            .client
            .query(format!(
                "SELECT count() AS total FROM {table} \
                 WHERE out = type::thing('entity', $id) GROUP ALL;"
            ))
            .bind(("id", entity_id.to_owned()))
            .await?;
        let rows: Vec<Row> = response.take(0)?;
        total += rows.into_iter().next().map_or(0, |row| row.total);
    }

    Ok(total == 0)
}
