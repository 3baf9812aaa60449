use std::sync::Arc;
use std::time::Duration;

use common::{
    storage::{db::SurrealDbClient, indexes::ensure_runtime_indexes},
    utils::{config::get_config, embedding::EmbeddingProvider},
};
use ingestion_pipeline::{
    maintenance,
    pipeline::{DefaultPipelineServices, IngestionPipeline},
    run_worker_loop, IngestionConfig, WorkerCounts,
};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set up tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let config = get_config()?;

    let db = Arc::new(
        SurrealDbClient::new(
            &config.surrealdb_address,
            &config.surrealdb_username,
            &config.surrealdb_password,
            &config.surrealdb_namespace,
            &config.surrealdb_database,
        )
        .await?,
    );
    ensure_runtime_indexes(&db, config.embedding_dimensions as usize).await?;

    let openai_client = async_openai::Client::with_config(
        async_openai::config::OpenAIConfig::new()
            .with_api_key(&config.openai_api_key)
            .with_api_base(&config.openai_base_url),
    );
    let embedding_provider = EmbeddingProvider::new(
        openai_client.clone(),
        &config.embedding_model,
        config.embedding_dimensions,
    );

    let services = Arc::new(DefaultPipelineServices::new(
        openai_client,
        embedding_provider,
        &config.chat_model,
    ));

    let pipeline = Arc::new(IngestionPipeline::with_services(
        Arc::clone(&db),
        IngestionConfig::from_app_config(&config),
        services.clone(),
    ));

    // Periodic maintenance: entity dedup, orphan sweep, vector
    // reconciliation.
    {
        let db = Arc::clone(&db);
        let services = services.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
            loop {
                ticker.tick().await;
                if let Err(err) = maintenance::run_sweep(&db, services.as_ref()).await {
                    tracing::error!(error = %err, "maintenance sweep failed");
                }
            }
        });
    }

    let workers = WorkerCounts {
        ingest: config.ingest_concurrency,
        hooks: config.hook_concurrency,
    };

    run_worker_loop(db, pipeline, workers).await
}
