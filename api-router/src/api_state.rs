use std::sync::Arc;

use common::{storage::db::SurrealDbClient, utils::config::AppConfig};
use ingestion_pipeline::IngestionConfig;
use retrieval_pipeline::{reranking::RerankerPool, QueryServices, RetrievalConfig};

#[derive(Clone)]
pub struct ApiState {
    pub db: Arc<SurrealDbClient>,
    pub config: AppConfig,
    pub ingestion_config: IngestionConfig,
    pub retrieval_config: RetrievalConfig,
    pub query_services: Arc<dyn QueryServices>,
    pub reranker_pool: Option<Arc<RerankerPool>>,
}

impl ApiState {
    pub fn new(
        db: Arc<SurrealDbClient>,
        config: AppConfig,
        ingestion_config: IngestionConfig,
        retrieval_config: RetrievalConfig,
        query_services: Arc<dyn QueryServices>,
        reranker_pool: Option<Arc<RerankerPool>>,
    ) -> Self {
        Self {
            db,
            config,
            ingestion_config,
            retrieval_config,
            query_services,
            reranker_pool,
        }
    }
}
