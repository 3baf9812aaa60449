use chrono::{DateTime, Utc};
use common::{
    error::AppError,
    storage::types::{
        episode::{Episode, EpisodeStatus, EpisodeType},
        queue_job::JobPayload,
        statement::Statement,
    },
};
use state_machines::core::GuardError;
use tracing::{debug, instrument};

use crate::{
    chunker,
    extraction::ChunkContext,
    resolver::{self, StatementResolution},
    versioning, writer,
};

use super::{
    context::{ChunkWork, DuplicateProvenance, PendingStatement, PipelineContext},
    state::{Chunked, Extracted, IngestionMachine, Invalidated, Persisted, Ready, Resolved},
};

/// Chunk the episode body, decide versioning for document sessions, and
/// write the chunk episode rows so later failures are observable on them.
/// An unchanged document re-ingest leaves the context empty and every later
/// stage degenerates to a no-op: zero writes.
#[instrument(
    level = "trace",
    skip_all,
    fields(job_id = %ctx.job_id, attempt = ctx.attempt)
)]
pub async fn chunk(
    machine: IngestionMachine<(), Ready>,
    ctx: &mut PipelineContext<'_>,
) -> Result<IngestionMachine<(), Chunked>, AppError> {
    let JobPayload::Ingest {
        episode_body,
        reference_time,
        episode_type,
        source,
        session_id,
        title,
        label_ids,
        metadata: _,
        user_id,
        workspace_id,
    } = &ctx.job.payload
    else {
        return Err(AppError::Validation(
            "ingest pipeline received a non-ingest payload".into(),
        ));
    };

    let chunks = chunker::chunk_body(episode_body, ctx.config.tuning.chunk_target_words)?;
    let chunk_hashes: Vec<String> = chunks
        .iter()
        .map(|chunk| chunk.content_hash.clone())
        .collect();

    let (version, changed): (u32, Vec<u32>) = match episode_type {
        EpisodeType::Document => {
            let plan =
                versioning::plan_document_version(ctx.db, session_id, user_id, &chunks).await?;
            if plan.is_noop() {
                debug!(%session_id, "document unchanged; ingest is a no-op");
                return machine
                    .chunk()
                    .map_err(|(_, guard)| map_guard_error("chunk", &guard));
            }
            (plan.version, plan.changed_indices)
        }
        // Conversation ingests under one session stack up as successive
        // versions; every chunk of this ingest is new.
        EpisodeType::Conversation => {
            let previous = Episode::latest_version(ctx.db, session_id, user_id).await?;
            (
                previous.map_or(1, |version| version + 1),
                (0..chunks.len() as u32).collect(),
            )
        }
    };

    let total_chunks = chunks.len() as u32;
    for chunk in chunks
        .iter()
        .filter(|chunk| changed.contains(&chunk.index))
    {
        let mut episode = Episode::new(
            chunk.text.clone(),
            chunk.text.clone(),
            source.clone(),
            session_id.clone(),
            *episode_type,
            chunk.index,
            total_chunks,
            version,
            chunk.content_hash.clone(),
            chunk_hashes.clone(),
            label_ids.clone(),
            *reference_time,
            user_id.clone(),
            workspace_id.clone(),
        );
        episode.status = EpisodeStatus::Processing;
        episode.title = title.clone();
        ctx.chunks.push(ChunkWork {
            episode,
            candidates: Vec::new(),
        });
    }

    let episodes: Vec<Episode> = ctx
        .chunks
        .iter()
        .map(|work| work.episode.clone())
        .collect();
    writer::persist_episode_rows(ctx.db, &episodes).await?;

    // A superseding document version invalidates the statements grounded
    // only in its changed chunks.
    if *episode_type == EpisodeType::Document {
        if let (Some(previous_version), Some(first)) =
            (version.checked_sub(1).filter(|v| *v > 0), episodes.first())
        {
            versioning::invalidate_statements_from_previous_version(
                ctx.db,
                session_id,
                previous_version,
                &changed,
                &first.id,
                user_id,
            )
            .await?;
        }
    }

    debug!(
        chunks = ctx.chunks.len(),
        version, "episode chunked and rows persisted"
    );

    machine
        .chunk()
        .map_err(|(_, guard)| map_guard_error("chunk", &guard))
}

/// One structured extraction call per chunk, with the neighboring chunks as
/// read-only context.
#[instrument(
    level = "trace",
    skip_all,
    fields(job_id = %ctx.job_id, attempt = ctx.attempt)
)]
pub async fn extract(
    machine: IngestionMachine<(), Chunked>,
    ctx: &mut PipelineContext<'_>,
) -> Result<IngestionMachine<(), Extracted>, AppError> {
    let texts: Vec<String> = ctx
        .chunks
        .iter()
        .map(|work| work.episode.content.clone())
        .collect();

    for (position, work) in ctx.chunks.iter_mut().enumerate() {
        let context = ChunkContext {
            previous: position.checked_sub(1).and_then(|p| texts.get(p).cloned()),
            next: texts.get(position + 1).cloned(),
        };

        let result = ctx
            .services
            .extract_triples(&work.episode.content, &context)
            .await?;
        debug!(
            chunk_index = work.episode.chunk_index,
            candidates = result.candidates.len(),
            "chunk extraction complete"
        );
        work.candidates = result.candidates;
    }

    machine
        .extract()
        .map_err(|(_, guard)| map_guard_error("extract", &guard))
}

/// Map candidate names and statements onto canonical graph identities.
#[instrument(
    level = "trace",
    skip_all,
    fields(job_id = %ctx.job_id, attempt = ctx.attempt)
)]
pub async fn resolve(
    machine: IngestionMachine<(), Extracted>,
    ctx: &mut PipelineContext<'_>,
) -> Result<IngestionMachine<(), Resolved>, AppError> {
    let chunks = ctx.chunks.clone();

    for work in &chunks {
        if work.candidates.is_empty() {
            continue;
        }

        let user_id = work.episode.user_id.clone();
        let workspace_id = work.episode.workspace_id.clone();

        let resolved_names = resolver::resolve_entities(
            ctx.db,
            ctx.services,
            &ctx.config.tuning,
            &work.candidates,
            &user_id,
            workspace_id.as_deref(),
            &mut ctx.entity_cache,
            &mut ctx.new_entities,
        )
        .await?;

        let facts: Vec<String> = work
            .candidates
            .iter()
            .map(|candidate| candidate.fact.clone())
            .collect();
        let fact_embeddings = ctx.services.embed_batch(&facts).await?;

        for (candidate, fact_embedding) in work.candidates.iter().zip(fact_embeddings) {
            let lookup = |name: &str| -> Result<String, AppError> {
                resolved_names
                    .get(&common::storage::types::entity::name_key(name))
                    .cloned()
                    .ok_or_else(|| {
                        AppError::InternalError(format!("unresolved entity name: {name}"))
                    })
            };

            let valid_at: DateTime<Utc> =
                candidate.valid_at.unwrap_or(work.episode.valid_at);
            let tentative = Statement::new(
                candidate.fact.clone(),
                lookup(&candidate.subject_name)?,
                lookup(&candidate.predicate_name)?,
                lookup(&candidate.object_name)?,
                candidate.aspect.unwrap_or_default(),
                valid_at,
                candidate.attributes.clone(),
                user_id.clone(),
                workspace_id.clone(),
            );

            match resolver::resolve_statement(
                ctx.db,
                &ctx.config.tuning,
                &tentative,
                &fact_embedding,
            )
            .await?
            {
                StatementResolution::Duplicate { statement_id } => {
                    ctx.duplicates.push(DuplicateProvenance {
                        statement_id,
                        episode_id: work.episode.id.clone(),
                    });
                }
                StatementResolution::Fresh => {
                    ctx.fresh.push(PendingStatement {
                        statement: tentative,
                        fact_embedding,
                        episode_id: work.episode.id.clone(),
                    });
                }
            }
        }
    }

    debug!(
        fresh = ctx.fresh.len(),
        duplicates = ctx.duplicates.len(),
        new_entities = ctx.new_entities.len(),
        "resolution complete"
    );

    machine
        .resolve()
        .map_err(|(_, guard)| map_guard_error("resolve", &guard))
}

/// Find existing statements the surviving candidates contradict.
#[instrument(
    level = "trace",
    skip_all,
    fields(job_id = %ctx.job_id, attempt = ctx.attempt)
)]
pub async fn invalidate(
    machine: IngestionMachine<(), Resolved>,
    ctx: &mut PipelineContext<'_>,
) -> Result<IngestionMachine<(), Invalidated>, AppError> {
    ctx.invalidations =
        crate::invalidator::find_contradictions(ctx.db, ctx.services, &ctx.fresh).await?;

    debug!(invalidations = ctx.invalidations.len(), "invalidation complete");

    machine
        .invalidate()
        .map_err(|(_, guard)| map_guard_error("invalidate", &guard))
}

/// Flush the run to the graph and vector namespaces and complete the
/// episodes.
#[instrument(
    level = "trace",
    skip_all,
    fields(job_id = %ctx.job_id, attempt = ctx.attempt)
)]
pub async fn persist(
    machine: IngestionMachine<(), Invalidated>,
    ctx: &mut PipelineContext<'_>,
) -> Result<IngestionMachine<(), Persisted>, AppError> {
    let episodes: Vec<Episode> = ctx
        .chunks
        .iter()
        .map(|work| work.episode.clone())
        .collect();

    writer::persist(
        ctx.db,
        ctx.services,
        &ctx.config.tuning,
        &episodes,
        &ctx.new_entities,
        &ctx.fresh,
        &ctx.duplicates,
        &ctx.invalidations,
    )
    .await?;

    for episode in &episodes {
        Episode::set_status(ctx.db, &episode.id, EpisodeStatus::Completed, None).await?;
    }

    machine
        .persist()
        .map_err(|(_, guard)| map_guard_error("persist", &guard))
}

fn map_guard_error(event: &str, guard: &GuardError) -> AppError {
    AppError::InternalError(format!(
        "invalid ingestion pipeline transition during {event}: {guard:?}"
    ))
}
