use common::utils::config::AppConfig;

/// Tuning knobs for the retrieval engine. Defaults mirror production
/// behavior; tests shrink them.
#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    /// Max statements considered by the lexical sub-plan.
    pub statement_limit: usize,
    /// BM25 score floor below which lexical hits are dropped.
    pub bm25_floor: f32,
    /// Cosine floor for statement vector hits.
    pub statement_vector_floor: f32,
    /// Cosine floor for episode vector hits.
    pub episode_vector_floor: f32,
    /// Top-K pulled from each vector namespace.
    pub vector_take: usize,
    /// BFS expansion depth from query entities over role edges.
    pub bfs_depth: usize,
    /// Reciprocal-rank fusion constant.
    pub rrf_k: f32,
    /// Matched statements attached per episode.
    pub matched_statements_per_episode: usize,
    /// Episodes handed to the cross-encoder.
    pub rerank_top_m: usize,
    /// Adjacent chunks included on each side of a hit.
    pub hydration_window: usize,
    pub default_limit: usize,
    /// Similarity floor when resolving query entities by vector.
    pub entity_resolution_floor: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            statement_limit: 100,
            bm25_floor: 0.5,
            statement_vector_floor: 0.7,
            episode_vector_floor: 0.7,
            vector_take: 50,
            bfs_depth: 2,
            rrf_k: 60.0,
            matched_statements_per_episode: 5,
            rerank_top_m: 25,
            hydration_window: 1,
            default_limit: 10,
            entity_resolution_floor: 0.82,
        }
    }
}

impl RetrievalConfig {
    /// Derive the engine tuning from application configuration, keeping
    /// defaults for knobs the configuration does not expose.
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            statement_vector_floor: config.statement_vector_floor,
            entity_resolution_floor: config.entity_similarity_threshold,
            rerank_top_m: config.rerank_top_m,
            ..Self::default()
        }
    }
}
