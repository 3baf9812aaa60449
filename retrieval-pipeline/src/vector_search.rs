use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::statement::Statement,
        vector::{self, VectorNamespace},
    },
};
use tracing::debug;

use crate::{
    provenance::group_by_episode, EpisodeCandidate, RetrievalConfig, StatementFilters,
};

/// Semantic sub-plan over statement fact embeddings.
pub async fn statement_plan(
    db: &SurrealDbClient,
    query_embedding: Vec<f32>,
    user_id: &str,
    filters: &StatementFilters,
    config: &RetrievalConfig,
) -> Result<Vec<EpisodeCandidate>, AppError> {
    let hits = vector::search(
        db,
        VectorNamespace::Statement,
        query_embedding,
        config.vector_take,
        user_id,
    )
    .await?;

    let passing: Vec<(String, f32)> = hits
        .into_iter()
        .filter(|hit| hit.score >= config.statement_vector_floor)
        .map(|hit| (hit.id, hit.score))
        .collect();

    debug!(hits = passing.len(), "statement vector candidates above floor");

    if passing.is_empty() {
        return Ok(Vec::new());
    }

    let ids: Vec<String> = passing.iter().map(|(id, _)| id.clone()).collect();
    let statements = Statement::get_by_ids(db, &ids, user_id).await?;

    let admitted: Vec<(String, f32)> = passing
        .into_iter()
        .filter(|(id, _)| {
            statements
                .iter()
                .find(|statement| &statement.id == id)
                .is_some_and(|statement| filters.admits(statement))
        })
        .collect();

    group_by_episode(db, &admitted, config.matched_statements_per_episode).await
}

/// Semantic sub-plan over whole-episode content embeddings.
pub async fn episode_plan(
    db: &SurrealDbClient,
    query_embedding: Vec<f32>,
    user_id: &str,
    config: &RetrievalConfig,
) -> Result<Vec<EpisodeCandidate>, AppError> {
    let hits = vector::search(
        db,
        VectorNamespace::Episode,
        query_embedding,
        config.vector_take,
        user_id,
    )
    .await?;

    Ok(hits
        .into_iter()
        .filter(|hit| hit.score >= config.episode_vector_floor)
        .map(|hit| EpisodeCandidate {
            episode_id: hit.id,
            score: hit.score,
            matched_statement_ids: Vec::new(),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common::storage::indexes::ensure_runtime_indexes;
    use common::storage::types::statement::Aspect;
    use uuid::Uuid;

    async fn setup_db() -> SurrealDbClient {
        let db = SurrealDbClient::memory("vector_plan_test", &Uuid::new_v4().to_string())
            .await
            .expect("Failed to start in-memory surrealdb");
        ensure_runtime_indexes(&db, 3)
            .await
            .expect("failed to build runtime indexes");
        db
    }

    #[tokio::test]
    async fn statement_plan_routes_through_provenance() {
        let db = setup_db().await;

        let statement = Statement::new(
            "Alice uses Neovim.".into(),
            "s".into(),
            "p".into(),
            "o".into(),
            Aspect::Preference,
            Utc::now(),
            None,
            "user-1".into(),
            None,
        );
        db.store_item(statement.clone()).await.expect("store");
        statement.add_provenance(&db, "e1").await.expect("provenance");
        vector::upsert_vector(
            &db,
            VectorNamespace::Statement,
            &statement.id,
            vec![1.0, 0.0, 0.0],
            "user-1",
        )
        .await
        .expect("vector");

        let config = RetrievalConfig {
            statement_vector_floor: 0.5,
            ..RetrievalConfig::default()
        };
        let candidates = statement_plan(
            &db,
            vec![0.95, 0.05, 0.0],
            "user-1",
            &StatementFilters::default(),
            &config,
        )
        .await
        .expect("plan");

        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].episode_id, "e1");
        assert_eq!(candidates[0].matched_statement_ids, vec![statement.id]);
    }

    #[tokio::test]
    async fn episode_plan_applies_cosine_floor() {
        let db = setup_db().await;

        vector::upsert_vector(
            &db,
            VectorNamespace::Episode,
            "close",
            vec![1.0, 0.0, 0.0],
            "user-1",
        )
        .await
        .expect("vector close");
        vector::upsert_vector(
            &db,
            VectorNamespace::Episode,
            "far",
            vec![0.0, 0.0, 1.0],
            "user-1",
        )
        .await
        .expect("vector far");

        let config = RetrievalConfig {
            episode_vector_floor: 0.7,
            ..RetrievalConfig::default()
        };
        let candidates = episode_plan(&db, vec![1.0, 0.0, 0.0], "user-1", &config)
            .await
            .expect("plan");

        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].episode_id, "close");
    }
}
