use common::{
    error::AppError,
    storage::{db::SurrealDbClient, types::statement::Statement},
};
use tracing::debug;

use crate::{
    provenance::group_by_episode, EpisodeCandidate, RetrievalConfig, StatementFilters,
};

/// Lexical sub-plan: BM25 over the statement fact index, grouped by episode
/// with score averaging.
pub async fn lexical_plan(
    db: &SurrealDbClient,
    query: &str,
    user_id: &str,
    filters: &StatementFilters,
    config: &RetrievalConfig,
) -> Result<Vec<EpisodeCandidate>, AppError> {
    let hits = Statement::search_facts(db, query, user_id, config.statement_limit).await?;

    let passing: Vec<(String, f32)> = hits
        .into_iter()
        .filter(|hit| hit.score >= config.bm25_floor)
        .map(|hit| (hit.id, hit.score))
        .collect();

    debug!(hits = passing.len(), "lexical sub-plan candidates above floor");

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

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common::storage::indexes::{ensure_runtime_indexes, rebuild_fts_indexes};
    use common::storage::types::statement::Aspect;
    use uuid::Uuid;

    async fn setup_db() -> SurrealDbClient {
        let db = SurrealDbClient::memory("fts_plan_test", &Uuid::new_v4().to_string())
            .await
            .expect("Failed to start in-memory surrealdb");
        ensure_runtime_indexes(&db, 3)
            .await
            .expect("failed to build runtime indexes");
        db
    }

    async fn seed_statement(db: &SurrealDbClient, fact: &str, episode_id: &str) -> Statement {
        let statement = Statement::new(
            fact.into(),
            "s".into(),
            "p".into(),
            Uuid::new_v4().to_string(),
            Aspect::Preference,
            Utc::now(),
            None,
            "user-1".into(),
            None,
        );
        db.store_item(statement.clone()).await.expect("store statement");
        statement
            .add_provenance(db, episode_id)
            .await
            .expect("provenance");
        statement
    }

    #[tokio::test]
    async fn lexical_plan_groups_hits_by_episode() {
        let db = setup_db().await;
        seed_statement(&db, "Alice prefers the Neovim editor.", "e1").await;
        seed_statement(&db, "Alice set an editor preference recently.", "e1").await;
        seed_statement(&db, "Bob plays tennis on Sundays.", "e2").await;
        rebuild_fts_indexes(&db).await.expect("rebuild");

        let config = RetrievalConfig {
            bm25_floor: 0.0,
            ..RetrievalConfig::default()
        };
        let candidates = lexical_plan(
            &db,
            "editor",
            "user-1",
            &StatementFilters::default(),
            &config,
        )
        .await
        .expect("plan");

        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].episode_id, "e1");
        assert_eq!(candidates[0].matched_statement_ids.len(), 2);
    }

    #[tokio::test]
    async fn invalidated_statements_are_filtered_by_default() {
        let db = setup_db().await;
        let statement = seed_statement(&db, "Alice works at Acme.", "e1").await;
        Statement::invalidate(&db, &statement.id, Utc::now(), "successor")
            .await
            .expect("invalidate");
        rebuild_fts_indexes(&db).await.expect("rebuild");

        let config = RetrievalConfig {
            bm25_floor: 0.0,
            ..RetrievalConfig::default()
        };

        let hidden = lexical_plan(&db, "acme", "user-1", &StatementFilters::default(), &config)
            .await
            .expect("plan");
        assert!(hidden.is_empty());

        let included = lexical_plan(
            &db,
            "acme",
            "user-1",
            &StatementFilters {
                valid_at: None,
                include_invalidated: true,
            },
            &config,
        )
        .await
        .expect("plan");
        assert_eq!(included.len(), 1);
    }
}
