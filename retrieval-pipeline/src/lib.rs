#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod config;
pub mod fts;
pub mod graph;
pub mod hydration;
pub mod planner;
mod provenance;
pub mod reranking;
pub mod scoring;
pub mod services;
pub mod vector_search;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            episode::Episode,
            statement::{Aspect, Statement},
        },
    },
};
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

pub use config::RetrievalConfig;
pub use planner::{SearchMode, SubPlan};
pub use services::QueryServices;

use crate::{hydration::hydrate, reranking::RerankerLease, scoring::rrf_fuse};

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub user_id: String,
    pub workspace_id: Option<String>,
    pub query: String,
    pub options: SearchOptions,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchOptions {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub valid_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub include_invalidated: bool,
    #[serde(default)]
    pub label_ids: Vec<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub mode: SearchMode,
}

/// Statement-level predicates shared by every sub-plan.
#[derive(Debug, Clone, Default)]
pub struct StatementFilters {
    pub valid_at: Option<DateTime<Utc>>,
    pub include_invalidated: bool,
}

impl StatementFilters {
    pub fn from_options(options: &SearchOptions) -> Self {
        Self {
            valid_at: options.valid_at,
            include_invalidated: options.include_invalidated,
        }
    }

    /// Whether a statement survives the temporal and validity predicates.
    /// `Event`-aspect statements also match on their recorded event date.
    pub fn admits(&self, statement: &Statement) -> bool {
        if !self.include_invalidated {
            if let Some(at) = self.valid_at {
                let started = statement.valid_at <= at;
                let not_ended = statement
                    .invalid_at
                    .is_none_or(|invalid_at| invalid_at > at);
                let event_date_matches = statement.aspect == Aspect::Event
                    && statement
                        .attributes
                        .as_ref()
                        .and_then(|attrs| attrs.get("event_date"))
                        .and_then(|value| value.as_str())
                        .and_then(|raw| raw.parse::<DateTime<Utc>>().ok())
                        .is_some_and(|event_date| event_date <= at);

                if !((started && not_ended) || event_date_matches) {
                    return false;
                }
            } else if statement.invalid_at.is_some() {
                return false;
            }
        }

        true
    }
}

/// One sub-plan's ranked view of the corpus.
#[derive(Debug, Clone)]
pub struct EpisodeCandidate {
    pub episode_id: String,
    pub score: f32,
    pub matched_statement_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchedStatement {
    pub uuid: String,
    pub fact: String,
    pub valid_at: DateTime<Utc>,
    pub invalid_at: Option<DateTime<Utc>>,
    pub aspect: Aspect,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdjacentChunks {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub episode_uuid: String,
    pub score: f32,
    pub matched_statements: Vec<MatchedStatement>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adjacent_chunks: Option<AdjacentChunks>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub degraded: bool,
}

/// Primary search orchestrator: plan, execute sub-plans concurrently, fuse,
/// rerank, hydrate. Any sub-plan may fail independently; the response is
/// annotated `degraded` and assembled from the rest.
#[instrument(skip_all, fields(user_id = %request.user_id, mode = ?request.options.mode))]
pub async fn search(
    db: &SurrealDbClient,
    services: &dyn QueryServices,
    request: &SearchRequest,
    config: &RetrievalConfig,
    reranker: Option<RerankerLease>,
) -> Result<SearchResponse, AppError> {
    let plans = planner::plan(services, &request.query, request.options.mode).await;
    let filters = StatementFilters::from_options(&request.options);

    let needs_embedding = plans.iter().any(|plan| {
        matches!(
            plan,
            SubPlan::SemanticStatement | SubPlan::SemanticEpisode | SubPlan::EntityGraph
        )
    });
    let query_embedding = if needs_embedding {
        match services.embed_query(&request.query).await {
            Ok(embedding) => Some(embedding),
            Err(err) => {
                warn!(error = %err, "query embedding failed; semantic sub-plans degraded");
                None
            }
        }
    } else {
        None
    };

    let mut ranked_lists: Vec<Vec<EpisodeCandidate>> = Vec::with_capacity(plans.len());
    let mut degraded = false;

    let plan_futures = plans.iter().map(|plan| {
        let embedding = query_embedding.clone();
        let filters = filters.clone();
        async move {
            match plan {
                SubPlan::Lexical => {
                    fts::lexical_plan(db, &request.query, &request.user_id, &filters, config).await
                }
                SubPlan::SemanticStatement => match embedding {
                    Some(embedding) => {
                        vector_search::statement_plan(
                            db,
                            embedding,
                            &request.user_id,
                            &filters,
                            config,
                        )
                        .await
                    }
                    None => Err(AppError::InternalError("query embedding unavailable".into())),
                },
                SubPlan::SemanticEpisode => match embedding {
                    Some(embedding) => {
                        vector_search::episode_plan(db, embedding, &request.user_id, config).await
                    }
                    None => Err(AppError::InternalError("query embedding unavailable".into())),
                },
                SubPlan::EntityGraph => match embedding {
                    Some(embedding) => {
                        graph::entity_bfs_plan(
                            db,
                            services,
                            &request.query,
                            embedding,
                            &request.user_id,
                            &filters,
                            config,
                        )
                        .await
                    }
                    None => Err(AppError::InternalError("query embedding unavailable".into())),
                },
                SubPlan::EpisodeGraph => {
                    graph::episode_graph_plan(
                        db,
                        services,
                        &request.query,
                        &request.user_id,
                        &filters,
                        config,
                    )
                    .await
                }
            }
        }
    });

    for (plan, outcome) in plans.iter().zip(futures::future::join_all(plan_futures).await) {
        match outcome {
            Ok(candidates) => ranked_lists.push(candidates),
            Err(err) => {
                degraded = true;
                warn!(sub_plan = ?plan, error = %err, "search sub-plan failed; continuing without it");
            }
        }
    }

    let fused = rrf_fuse(&ranked_lists, config.rrf_k);
    let limit = request.options.limit.unwrap_or(config.default_limit);

    // Hydrate enough episodes to apply episode-level filters and recency
    // tie-breaks before cutting to the requested limit.
    let candidate_ids: Vec<String> = fused.iter().map(|entry| entry.episode_id.clone()).collect();
    let episodes = Episode::get_by_ids(db, &candidate_ids, &request.user_id).await?;
    let episode_map: HashMap<String, Episode> = episodes
        .into_iter()
        .map(|episode| (episode.id.clone(), episode))
        .collect();

    let mut scored: Vec<(scoring::FusedEpisode, Episode)> = fused
        .into_iter()
        .filter_map(|entry| {
            episode_map
                .get(&entry.episode_id)
                .cloned()
                .map(|episode| (entry, episode))
        })
        .filter(|(_, episode)| episode_admitted(episode, &request.options))
        .collect();

    // RRF score descending, recency of `valid_at` breaking ties.
    scored.sort_by(|(a, ea), (b, eb)| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| eb.valid_at.cmp(&ea.valid_at))
    });

    if let Some(lease) = reranker {
        scored = rerank_episodes(scored, &request.query, lease, config).await;
    }

    scored.truncate(limit);

    let results = hydrate(db, scored, &filters, config).await?;

    Ok(SearchResponse { results, degraded })
}

fn episode_admitted(episode: &Episode, options: &SearchOptions) -> bool {
    if let Some(start_time) = options.start_time {
        if episode.valid_at < start_time {
            return false;
        }
    }
    if let Some(session_id) = &options.session_id {
        if &episode.session_id != session_id {
            return false;
        }
    }
    if !options.sources.is_empty() && !options.sources.contains(&episode.source) {
        return false;
    }
    if !options.label_ids.is_empty()
        && !options
            .label_ids
            .iter()
            .any(|label| episode.label_ids.contains(label))
    {
        return false;
    }

    true
}

/// Cross-encoder rerank of the fused head; keeps the fused ordering for the
/// tail and falls back entirely when the reranker errors.
async fn rerank_episodes(
    scored: Vec<(scoring::FusedEpisode, Episode)>,
    query: &str,
    lease: RerankerLease,
    config: &RetrievalConfig,
) -> Vec<(scoring::FusedEpisode, Episode)> {
    let head_len = scored.len().min(config.rerank_top_m);
    if head_len < 2 {
        return scored;
    }

    let mut iter = scored.into_iter();
    let head: Vec<_> = iter.by_ref().take(head_len).collect();
    let tail: Vec<_> = iter.collect();

    let documents: Vec<String> = head
        .iter()
        .map(|(_, episode)| episode.content.clone())
        .collect();

    match lease.rerank(query, documents).await {
        Ok(ranking) => {
            let mut reordered: Vec<(scoring::FusedEpisode, Episode)> =
                Vec::with_capacity(head.len());
            let mut taken: Vec<Option<(scoring::FusedEpisode, Episode)>> =
                head.into_iter().map(Some).collect();
            for result in ranking {
                if let Some(slot) = taken.get_mut(result.index) {
                    if let Some(entry) = slot.take() {
                        reordered.push(entry);
                    }
                }
            }
            // Anything the reranker did not mention keeps its fused order.
            reordered.extend(taken.into_iter().flatten());
            reordered.extend(tail);
            reordered
        }
        Err(err) => {
            warn!(error = %err, "rerank failed; keeping fused ordering");
            let mut restored = head;
            restored.extend(tail);
            restored
        }
    }
}
