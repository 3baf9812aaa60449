pub mod config;
pub mod context;
pub mod services;
mod stages;
mod state;

pub use config::{IngestionConfig, IngestionTuning};
#[allow(clippy::module_name_repetitions)]
pub use services::{DefaultPipelineServices, PipelineServices};

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            episode::{Episode, EpisodeStatus},
            queue_job::{JobPayload, QueueJob, QueueName},
        },
    },
};
use tracing::{debug, info, warn};

use crate::post_hooks;

use self::{context::PipelineContext, state::ready};

#[allow(clippy::module_name_repetitions)]
pub struct IngestionPipeline {
    db: Arc<SurrealDbClient>,
    pipeline_config: IngestionConfig,
    services: Arc<dyn PipelineServices>,
}

impl IngestionPipeline {
    pub fn with_services(
        db: Arc<SurrealDbClient>,
        pipeline_config: IngestionConfig,
        services: Arc<dyn PipelineServices>,
    ) -> Self {
        Self {
            db,
            pipeline_config,
            services,
        }
    }

    pub fn config(&self) -> &IngestionConfig {
        &self.pipeline_config
    }

    /// Process one claimed job from any queue and translate its outcome into
    /// a queue-level result: success, scheduled retry, or dead letter.
    #[tracing::instrument(
        skip_all,
        fields(
            job_id = %job.id,
            queue = job.queue.as_str(),
            attempt = job.attempts,
            worker_id = job.worker_id.as_deref().unwrap_or("unknown-worker"),
            user_id = %job.user_id
        )
    )]
    pub async fn process_job(&self, job: QueueJob) -> Result<(), AppError> {
        let started = Instant::now();
        let deadline = self.pipeline_config.tuning.pipeline_deadline;

        let outcome = match tokio::time::timeout(deadline, self.dispatch(&job)).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Cancelled(format!(
                "job exceeded its {}s deadline",
                deadline.as_secs()
            ))),
        };

        match outcome {
            Ok(()) => {
                job.mark_succeeded(&self.db).await?;
                info!(
                    total_ms = started.elapsed().as_millis() as u64,
                    "job succeeded"
                );
                Ok(())
            }
            Err(err) => {
                let reason = err.to_string();
                debug!(error = %reason, "job failed");

                if err.is_retryable() && job.can_retry() {
                    let delay = self.retry_delay(job.attempts);
                    job.mark_failed(&self.db, &reason, delay).await?;
                    warn!(
                        retry_in_secs = delay.as_secs(),
                        error = %reason,
                        "job failed; scheduled retry"
                    );
                } else {
                    job.mark_dead_letter(&self.db, &reason).await?;
                    self.mark_job_episodes_failed(&job.id, &reason).await?;
                    warn!(error = %reason, "job failed; moved to dead letter queue");
                }

                Err(err)
            }
        }
    }

    async fn dispatch(&self, job: &QueueJob) -> Result<(), AppError> {
        match job.queue {
            QueueName::Ingest => self.drive_pipeline(job).await,
            QueueName::TitleGeneration => {
                let JobPayload::TitleGeneration { episode_id, .. } = &job.payload else {
                    return Err(AppError::Validation("malformed title job payload".into()));
                };
                post_hooks::run_title_generation(&self.db, self.services.as_ref(), episode_id)
                    .await
            }
            QueueName::LabelAssignment => {
                let JobPayload::LabelAssignment {
                    episode_id,
                    user_id,
                } = &job.payload
                else {
                    return Err(AppError::Validation("malformed label job payload".into()));
                };
                post_hooks::run_label_assignment(
                    &self.db,
                    self.services.as_ref(),
                    &self.pipeline_config.tuning,
                    episode_id,
                    user_id,
                )
                .await
            }
            QueueName::SessionCompaction => {
                let JobPayload::SessionCompaction {
                    session_id,
                    user_id,
                    workspace_id,
                } = &job.payload
                else {
                    return Err(AppError::Validation(
                        "malformed compaction job payload".into(),
                    ));
                };
                post_hooks::run_session_compaction(
                    &self.db,
                    self.services.as_ref(),
                    session_id,
                    user_id,
                    workspace_id.clone(),
                )
                .await
            }
        }
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let tuning = &self.pipeline_config.tuning;
        let capped_attempt = attempt
            .saturating_sub(1)
            .min(tuning.retry_backoff_cap_exponent);
        let multiplier = 2_u64.pow(capped_attempt);
        let delay = tuning.retry_base_delay_secs.saturating_mul(multiplier);

        Duration::from_secs(delay.min(tuning.retry_max_delay_secs))
    }

    /// Failures are never silent: every episode this job produced records
    /// the terminal error.
    async fn mark_job_episodes_failed(&self, job_id: &str, reason: &str) -> Result<(), AppError> {
        let job: Option<QueueJob> = self.db.get_item(job_id).await?;
        let Some(job) = job else {
            return Ok(());
        };

        for episode_id in job.episode_ids {
            Episode::set_status(
                &self.db,
                &episode_id,
                EpisodeStatus::Failed,
                Some(reason.to_owned()),
            )
            .await?;
        }

        Ok(())
    }

    #[tracing::instrument(skip_all, fields(job_id = %job.id, attempt = job.attempts))]
    async fn drive_pipeline(&self, job: &QueueJob) -> Result<(), AppError> {
        let mut ctx = PipelineContext::new(
            job,
            self.db.as_ref(),
            &self.pipeline_config,
            self.services.as_ref(),
        );

        let machine = ready();
        let pipeline_started = Instant::now();

        let machine = stages::chunk(machine, &mut ctx)
            .await
            .map_err(|err| ctx.abort(err))?;

        // Episode rows exist from here on; record them on the job so a later
        // failure can mark them.
        QueueJob::set_episode_ids(self.db.as_ref(), &ctx.job_id, ctx.episode_ids()).await?;

        let stage_result = async {
            let machine = stages::extract(machine, &mut ctx).await?;
            let machine = stages::resolve(machine, &mut ctx).await?;
            let machine = stages::invalidate(machine, &mut ctx).await?;
            stages::persist(machine, &mut ctx).await
        }
        .await;

        if let Err(err) = stage_result {
            let reason = err.to_string();
            for episode_id in ctx.episode_ids() {
                Episode::set_status(
                    self.db.as_ref(),
                    &episode_id,
                    EpisodeStatus::Failed,
                    Some(reason.clone()),
                )
                .await?;
            }
            return Err(ctx.abort(err));
        }

        info!(
            chunks = ctx.chunks.len(),
            statements = ctx.fresh.len(),
            duplicates = ctx.duplicates.len(),
            invalidations = ctx.invalidations.len(),
            total_ms = pipeline_started.elapsed().as_millis() as u64,
            "ingestion pipeline finished"
        );

        post_hooks::enqueue_after_ingest(
            self.db.as_ref(),
            &self.pipeline_config,
            &ctx.chunks
                .iter()
                .map(|work| work.episode.clone())
                .collect::<Vec<_>>(),
            job,
        )
        .await;

        Ok(())
    }
}
