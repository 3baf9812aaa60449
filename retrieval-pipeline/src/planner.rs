use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::services::QueryServices;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    #[default]
    Auto,
    Lexical,
    Semantic,
    Entity,
    Temporal,
    Relationship,
    Exploratory,
}

/// Executable unit of a query plan. Sub-plans run concurrently and fail
/// independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubPlan {
    Lexical,
    SemanticStatement,
    SemanticEpisode,
    EntityGraph,
    EpisodeGraph,
}

/// Map a search mode (classifying the query first when `Auto`) onto the
/// sub-plans to execute. Classifier failure degrades to the lexical +
/// semantic default rather than failing the search.
pub async fn plan(
    services: &dyn QueryServices,
    query: &str,
    mode: SearchMode,
) -> Vec<SubPlan> {
    let modes = match mode {
        SearchMode::Auto => match services.classify_query(query).await {
            Ok(modes) if !modes.is_empty() => modes,
            Ok(_) => vec![SearchMode::Lexical, SearchMode::Semantic],
            Err(err) => {
                warn!(error = %err, "query classification failed; using default plan");
                vec![SearchMode::Lexical, SearchMode::Semantic]
            }
        },
        explicit => vec![explicit],
    };

    let mut plans = Vec::new();
    for mode in modes {
        let additions: &[SubPlan] = match mode {
            // Auto inside a classification result means the classifier
            // punted; treat it as the default pair.
            SearchMode::Auto => &[SubPlan::Lexical, SubPlan::SemanticStatement],
            SearchMode::Lexical => &[SubPlan::Lexical],
            SearchMode::Semantic => &[SubPlan::SemanticStatement, SubPlan::SemanticEpisode],
            SearchMode::Entity => &[SubPlan::EntityGraph],
            SearchMode::Temporal => &[SubPlan::Lexical, SubPlan::SemanticStatement],
            SearchMode::Relationship => &[SubPlan::EntityGraph, SubPlan::EpisodeGraph],
            SearchMode::Exploratory => &[
                SubPlan::Lexical,
                SubPlan::SemanticStatement,
                SubPlan::SemanticEpisode,
                SubPlan::EntityGraph,
                SubPlan::EpisodeGraph,
            ],
        };
        for plan in additions {
            if !plans.contains(plan) {
                plans.push(*plan);
            }
        }
    }

    plans
}
