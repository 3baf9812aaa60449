use common::{
    error::AppError,
    storage::{db::SurrealDbClient, types::statement::Statement},
};
use tracing::{debug, warn};

use crate::pipeline::{
    context::{Invalidation, PendingStatement},
    services::PipelineServices,
};

/// Detect which existing valid statements the surviving candidates
/// contradict.
///
/// For every candidate this considers statements sharing `(subject,
/// predicate)` and statements sharing `(subject, object)` under another
/// predicate (the relationship-shift case). All pairs go to the adjudicator
/// in one batch; an adjudicator failure degrades to "no contradictions"
/// rather than failing the stage. Coexisting aspects (events, observations)
/// never invalidate each other.
pub async fn find_contradictions(
    db: &SurrealDbClient,
    services: &dyn PipelineServices,
    candidates: &[PendingStatement],
) -> Result<Vec<Invalidation>, AppError> {
    struct PairContext {
        existing_id: String,
        invalid_at: chrono::DateTime<chrono::Utc>,
        invalidated_by: String,
    }

    let mut pairs: Vec<(String, String)> = Vec::new();
    let mut contexts: Vec<PairContext> = Vec::new();

    for pending in candidates {
        let candidate = &pending.statement;

        let mut existing = Statement::active_for_subject_predicate(
            db,
            &candidate.subject_id,
            &candidate.predicate_id,
            &candidate.user_id,
        )
        .await?;
        existing.extend(
            Statement::active_for_subject_object(
                db,
                &candidate.subject_id,
                &candidate.object_id,
                &candidate.predicate_id,
                &candidate.user_id,
            )
            .await?,
        );

        for statement in existing {
            if statement.id == candidate.id {
                continue;
            }
            // Events do not invalidate other events; likewise observations.
            if candidate.aspect.coexists() && statement.aspect.coexists() {
                continue;
            }
            if contexts
                .iter()
                .any(|ctx| ctx.existing_id == statement.id && ctx.invalidated_by == candidate.id)
            {
                continue;
            }

            pairs.push((candidate.fact.clone(), statement.fact.clone()));
            contexts.push(PairContext {
                existing_id: statement.id,
                invalid_at: candidate.valid_at,
                invalidated_by: candidate.id.clone(),
            });
        }
    }

    if pairs.is_empty() {
        return Ok(Vec::new());
    }

    debug!(pairs = pairs.len(), "contradiction adjudication batch");

    let verdicts = match services.adjudicate_contradictions(&pairs).await {
        Ok(verdicts) => verdicts,
        Err(err) => {
            // Conservative fallback: keep everything valid.
            warn!(error = %err, "contradiction adjudication failed; treating batch as consistent");
            return Ok(Vec::new());
        }
    };

    Ok(contexts
        .into_iter()
        .zip(verdicts)
        .filter(|(_, contradicts)| *contradicts)
        .map(|(ctx, _)| Invalidation {
            statement_id: ctx.existing_id,
            invalid_at: ctx.invalid_at,
            invalidated_by: ctx.invalidated_by,
        })
        .collect())
}
