use std::time::Duration;

#[derive(Debug, Clone)]
pub struct IngestionTuning {
    pub retry_base_delay_secs: u64,
    pub retry_max_delay_secs: u64,
    pub retry_backoff_cap_exponent: u32,
    pub graph_store_attempts: usize,
    pub graph_initial_backoff_ms: u64,
    pub graph_max_backoff_ms: u64,
    /// Approximate word budget per chunk.
    pub chunk_target_words: usize,
    /// Cosine threshold above which an existing entity is a dedup candidate.
    pub entity_similarity_threshold: f32,
    /// Cosine threshold above which an existing statement is a duplicate.
    pub statement_similarity_threshold: f32,
    /// Vector ties closer than this prefer the better-provenanced statement.
    pub vector_tie_epsilon: f32,
    /// Top-K pulled from vector namespaces during resolution.
    pub resolution_vector_take: usize,
    /// Wall-clock budget for one job; exceeding it cancels the pipeline.
    pub pipeline_deadline: Duration,
    /// Delay before a session becomes eligible for compaction.
    pub compaction_delay: Duration,
    /// Cosine threshold for auto-assigning labels to an episode.
    pub label_similarity_threshold: f32,
}

impl Default for IngestionTuning {
    fn default() -> Self {
        Self {
            retry_base_delay_secs: 30,
            retry_max_delay_secs: 15 * 60,
            retry_backoff_cap_exponent: 5,
            graph_store_attempts: 3,
            graph_initial_backoff_ms: 50,
            graph_max_backoff_ms: 800,
            chunk_target_words: 400,
            entity_similarity_threshold: 0.82,
            statement_similarity_threshold: 0.90,
            vector_tie_epsilon: 0.005,
            resolution_vector_take: 5,
            pipeline_deadline: Duration::from_secs(10 * 60),
            compaction_delay: Duration::from_secs(30 * 60),
            label_similarity_threshold: 0.75,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestionConfig {
    pub tuning: IngestionTuning,
    /// Maximum unfinished jobs per queue before enqueue fails fast.
    pub queue_max_depth: usize,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            tuning: IngestionTuning::default(),
            queue_max_depth: 10_000,
        }
    }
}

impl IngestionConfig {
    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_max_depth = depth;
        self
    }

    /// Derive pipeline tuning from application configuration.
    pub fn from_app_config(config: &common::utils::config::AppConfig) -> Self {
        Self {
            tuning: IngestionTuning {
                entity_similarity_threshold: config.entity_similarity_threshold,
                statement_similarity_threshold: config.statement_similarity_threshold,
                label_similarity_threshold: config.label_similarity_threshold,
                ..IngestionTuning::default()
            },
            queue_max_depth: config.queue_max_depth,
        }
    }
}
