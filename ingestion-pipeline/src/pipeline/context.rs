use std::collections::HashMap;

use chrono::{DateTime, Utc};
use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{entity::Entity, episode::Episode, queue_job::QueueJob, statement::Statement},
    },
};
use tracing::error;

use crate::extraction::TripleCandidate;

use super::{config::IngestionConfig, services::PipelineServices};

/// One chunk's episode row and the candidates extracted from it.
#[derive(Debug, Clone)]
pub struct ChunkWork {
    pub episode: Episode,
    pub candidates: Vec<TripleCandidate>,
}

/// An entity the resolver decided to create, with its name embedding.
#[derive(Debug, Clone)]
pub struct NewEntity {
    pub entity: Entity,
    pub embedding: Vec<f32>,
}

/// A statement that survived dedup and will be written.
#[derive(Debug, Clone)]
pub struct PendingStatement {
    pub statement: Statement,
    pub fact_embedding: Vec<f32>,
    pub episode_id: String,
}

/// Provenance absorbed by an existing statement instead of a new write.
#[derive(Debug, Clone)]
pub struct DuplicateProvenance {
    pub statement_id: String,
    pub episode_id: String,
}

#[derive(Debug, Clone)]
pub struct Invalidation {
    pub statement_id: String,
    pub invalid_at: DateTime<Utc>,
    pub invalidated_by: String,
}

pub struct PipelineContext<'a> {
    pub job: &'a QueueJob,
    pub job_id: String,
    pub attempt: u32,
    pub db: &'a SurrealDbClient,
    pub config: &'a IngestionConfig,
    pub services: &'a dyn PipelineServices,
    pub chunks: Vec<ChunkWork>,
    pub new_entities: Vec<NewEntity>,
    /// Request-scoped lookup cache: normalized name -> entity id. Never
    /// shared across jobs.
    pub entity_cache: HashMap<String, String>,
    pub fresh: Vec<PendingStatement>,
    pub duplicates: Vec<DuplicateProvenance>,
    pub invalidations: Vec<Invalidation>,
}

impl<'a> PipelineContext<'a> {
    pub fn new(
        job: &'a QueueJob,
        db: &'a SurrealDbClient,
        config: &'a IngestionConfig,
        services: &'a dyn PipelineServices,
    ) -> Self {
        let job_id = job.id.clone();
        let attempt = job.attempts;
        Self {
            job,
            job_id,
            attempt,
            db,
            config,
            services,
            chunks: Vec::new(),
            new_entities: Vec::new(),
            entity_cache: HashMap::new(),
            fresh: Vec::new(),
            duplicates: Vec::new(),
            invalidations: Vec::new(),
        }
    }

    pub fn episode_ids(&self) -> Vec<String> {
        self.chunks
            .iter()
            .map(|work| work.episode.id.clone())
            .collect()
    }

    pub fn abort(&mut self, err: AppError) -> AppError {
        error!(
            job_id = %self.job_id,
            attempt = self.attempt,
            error = %err,
            "ingestion pipeline aborted"
        );
        err
    }
}
