use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    pub openai_api_key: String,
    pub surrealdb_address: String,
    pub surrealdb_username: String,
    pub surrealdb_password: String,
    pub surrealdb_namespace: String,
    pub surrealdb_database: String,
    pub http_port: u16,
    #[serde(default = "default_base_url")]
    pub openai_base_url: String,
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_embedding_dimensions")]
    pub embedding_dimensions: u32,
    #[serde(default = "default_entity_similarity_threshold")]
    pub entity_similarity_threshold: f32,
    #[serde(default = "default_statement_similarity_threshold")]
    pub statement_similarity_threshold: f32,
    #[serde(default = "default_statement_vector_floor")]
    pub statement_vector_floor: f32,
    #[serde(default = "default_label_similarity_threshold")]
    pub label_similarity_threshold: f32,
    #[serde(default = "default_queue_max_depth")]
    pub queue_max_depth: usize,
    #[serde(default = "default_ingest_concurrency")]
    pub ingest_concurrency: usize,
    #[serde(default = "default_hook_concurrency")]
    pub hook_concurrency: usize,
    #[serde(default)]
    pub reranking_enabled: bool,
    #[serde(default)]
    pub reranking_pool_size: Option<usize>,
    #[serde(default = "default_rerank_top_m")]
    pub rerank_top_m: usize,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_chat_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_embedding_dimensions() -> u32 {
    1536
}

fn default_entity_similarity_threshold() -> f32 {
    0.82
}

fn default_statement_similarity_threshold() -> f32 {
    0.90
}

fn default_statement_vector_floor() -> f32 {
    0.7
}

fn default_label_similarity_threshold() -> f32 {
    0.75
}

fn default_queue_max_depth() -> usize {
    10_000
}

fn default_ingest_concurrency() -> usize {
    4
}

fn default_hook_concurrency() -> usize {
    2
}

fn default_rerank_top_m() -> usize {
    25
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}

#[cfg(any(test, feature = "test-utils"))]
impl AppConfig {
    /// Configuration for tests against an in-memory database. No network
    /// services are reachable through it.
    pub fn for_tests() -> Self {
        Self {
            openai_api_key: "test-key".into(),
            surrealdb_address: "mem://".into(),
            surrealdb_username: String::new(),
            surrealdb_password: String::new(),
            surrealdb_namespace: "test".into(),
            surrealdb_database: "test".into(),
            http_port: 0,
            openai_base_url: default_base_url(),
            chat_model: default_chat_model(),
            embedding_model: default_embedding_model(),
            embedding_dimensions: 3,
            entity_similarity_threshold: default_entity_similarity_threshold(),
            statement_similarity_threshold: default_statement_similarity_threshold(),
            statement_vector_floor: default_statement_vector_floor(),
            label_similarity_threshold: default_label_similarity_threshold(),
            queue_max_depth: default_queue_max_depth(),
            ingest_concurrency: default_ingest_concurrency(),
            hook_concurrency: default_hook_concurrency(),
            reranking_enabled: false,
            reranking_pool_size: None,
            rerank_top_m: default_rerank_top_m(),
        }
    }
}
