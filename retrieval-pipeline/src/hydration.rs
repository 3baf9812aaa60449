use std::collections::HashMap;

use common::{
    error::AppError,
    storage::{db::SurrealDbClient, types::episode::Episode, types::statement::Statement},
};

use crate::{
    scoring::FusedEpisode, AdjacentChunks, MatchedStatement, RetrievalConfig, SearchResult,
    StatementFilters,
};

/// Assemble the response: matched statements with their validity intervals,
/// plus the surrounding chunks of each hit's session.
pub async fn hydrate(
    db: &SurrealDbClient,
    scored: Vec<(FusedEpisode, Episode)>,
    filters: &StatementFilters,
    config: &RetrievalConfig,
) -> Result<Vec<SearchResult>, AppError> {
    let all_statement_ids: Vec<String> = scored
        .iter()
        .flat_map(|(fused, _)| fused.matched_statement_ids.iter().cloned())
        .collect();

    let statements = match scored.first() {
        Some((_, episode)) => {
            Statement::get_by_ids(db, &all_statement_ids, &episode.user_id).await?
        }
        None => Vec::new(),
    };
    let statement_map: HashMap<String, Statement> = statements
        .into_iter()
        .map(|statement| (statement.id.clone(), statement))
        .collect();

    let mut results = Vec::with_capacity(scored.len());
    for (fused, episode) in scored {
        let matched_statements: Vec<MatchedStatement> = fused
            .matched_statement_ids
            .iter()
            .filter_map(|id| statement_map.get(id))
            .filter(|statement| filters.admits(statement))
            .take(config.matched_statements_per_episode)
            .map(|statement| MatchedStatement {
                uuid: statement.id.clone(),
                fact: statement.fact.clone(),
                valid_at: statement.valid_at,
                invalid_at: statement.invalid_at,
                aspect: statement.aspect,
            })
            .collect();

        let adjacent_chunks = if config.hydration_window > 0 && episode.total_chunks > 1 {
            let (previous, next) = episode.adjacent_chunks(db).await?;
            if previous.is_some() || next.is_some() {
                Some(AdjacentChunks {
                    previous: previous.map(|chunk| chunk.content),
                    next: next.map(|chunk| chunk.content),
                })
            } else {
                None
            }
        } else {
            None
        };

        results.push(SearchResult {
            episode_uuid: episode.id,
            score: fused.score,
            matched_statements,
            adjacent_chunks,
        });
    }

    Ok(results)
}
