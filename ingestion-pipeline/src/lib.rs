#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod chunker;
pub mod extraction;
pub mod invalidator;
pub mod maintenance;
pub mod pipeline;
pub mod post_hooks;
pub mod resolver;
pub mod versioning;
pub mod writer;
pub mod utils;

use chrono::Utc;
use common::storage::{
    db::SurrealDbClient,
    types::queue_job::{QueueJob, QueueName},
};
pub use pipeline::{IngestionConfig, IngestionPipeline, IngestionTuning};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Worker counts per queue. Ingest dominates; the hook queues idle most of
/// the time.
#[derive(Debug, Clone, Copy)]
pub struct WorkerCounts {
    pub ingest: usize,
    pub hooks: usize,
}

impl Default for WorkerCounts {
    fn default() -> Self {
        Self { ingest: 4, hooks: 2 }
    }
}

/// Run the queue consumers until the process is stopped. Each worker claims
/// leased jobs from one queue; per-session ordering is enforced by the claim
/// query, so adding workers only increases cross-session parallelism.
pub async fn run_worker_loop(
    db: Arc<SurrealDbClient>,
    ingestion_pipeline: Arc<IngestionPipeline>,
    workers: WorkerCounts,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut handles = Vec::new();

    for queue in QueueName::ALL {
        let count = match queue {
            QueueName::Ingest => workers.ingest.max(1),
            _ => workers.hooks.max(1),
        };

        for _ in 0..count {
            let db = Arc::clone(&db);
            let pipeline = Arc::clone(&ingestion_pipeline);
            handles.push(tokio::spawn(async move {
                run_queue_worker(db, pipeline, queue).await;
            }));
        }
    }

    info!(workers = handles.len(), "queue workers started");
    futures::future::join_all(handles).await;

    Ok(())
}

async fn run_queue_worker(
    db: Arc<SurrealDbClient>,
    pipeline: Arc<IngestionPipeline>,
    queue: QueueName,
) {
    let worker_id = format!("{}-worker-{}", queue.as_str(), Uuid::new_v4());
    let idle_backoff = Duration::from_millis(500);

    loop {
        let lease = Duration::from_secs(
            common::storage::types::queue_job::DEFAULT_LEASE_SECS as u64,
        );
        match QueueJob::claim_next_ready(&db, queue, &worker_id, Utc::now(), lease).await {
            Ok(Some(job)) => {
                let job_id = job.id.clone();
                info!(
                    %worker_id,
                    %job_id,
                    attempt = job.attempts,
                    "claimed job"
                );
                if let Err(err) = pipeline.process_job(job).await {
                    error!(%worker_id, %job_id, error = %err, "job processing failed");
                }
            }
            Ok(None) => {
                sleep(idle_backoff).await;
            }
            Err(err) => {
                error!(%worker_id, error = %err, "failed to claim job");
                warn!("Backing off for 1s after claim error");
                sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
