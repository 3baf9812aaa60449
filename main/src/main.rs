use std::sync::Arc;
use std::time::Duration;

use api_router::{api_state::ApiState, api_routes_v1};
use common::{
    storage::{db::SurrealDbClient, indexes::ensure_runtime_indexes},
    utils::{config::get_config, embedding::EmbeddingProvider},
};
use ingestion_pipeline::{
    maintenance,
    pipeline::{DefaultPipelineServices, IngestionPipeline},
    run_worker_loop, IngestionConfig, WorkerCounts,
};
use retrieval_pipeline::{reranking::RerankerPool, services::DefaultQueryServices, RetrievalConfig};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Single-process deployment: API server, queue workers and periodic
/// maintenance in one binary. The `server` and `worker` binaries split the
/// same pieces across processes.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
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

    let pipeline_services = Arc::new(DefaultPipelineServices::new(
        openai_client.clone(),
        embedding_provider.clone(),
        &config.chat_model,
    ));
    let query_services = Arc::new(DefaultQueryServices::new(
        openai_client,
        embedding_provider,
        &config.chat_model,
    ));
    let reranker_pool = RerankerPool::maybe_from_config(&config)?;

    let pipeline = Arc::new(IngestionPipeline::with_services(
        Arc::clone(&db),
        IngestionConfig::from_app_config(&config),
        pipeline_services.clone(),
    ));

    let state = ApiState::new(
        Arc::clone(&db),
        config.clone(),
        IngestionConfig::from_app_config(&config),
        RetrievalConfig::from_app_config(&config),
        query_services,
        reranker_pool,
    );
    let router = api_routes_v1(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.http_port)).await?;
    tracing::info!(port = config.http_port, "api server listening");

    {
        let db = Arc::clone(&db);
        let services = pipeline_services.clone();
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

    tokio::select! {
        result = axum::serve(listener, router) => {
            result?;
        }
        result = run_worker_loop(db, pipeline, workers) => {
            result?;
        }
    }

    Ok(())
}
