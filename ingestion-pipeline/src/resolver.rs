use std::collections::HashMap;

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            entity::{self, Entity, PREDICATE_TYPE},
            statement::Statement,
        },
        vector::{self, VectorHit, VectorNamespace},
    },
};
use tracing::{debug, warn};

use crate::{
    extraction::TripleCandidate,
    pipeline::{config::IngestionTuning, context::NewEntity, services::PipelineServices},
};

/// Where a candidate statement landed after dedup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementResolution {
    /// The graph already holds this triple; absorb provenance instead.
    Duplicate { statement_id: String },
    /// No sufficiently similar statement exists.
    Fresh,
}

/// Map every candidate entity name in a chunk to a canonical entity id.
///
/// Order of attack per name: request-scoped cache, exact `name_key` match,
/// vector similarity plus one batched adjudication over all borderline
/// pairs, and only then a fresh entity. New entities are accumulated for
/// the writer together with their name embeddings.
#[allow(clippy::implicit_hasher)]
pub async fn resolve_entities(
    db: &SurrealDbClient,
    services: &dyn PipelineServices,
    tuning: &IngestionTuning,
    candidates: &[TripleCandidate],
    user_id: &str,
    workspace_id: Option<&str>,
    entity_cache: &mut HashMap<String, String>,
    new_entities: &mut Vec<NewEntity>,
) -> Result<HashMap<String, String>, AppError> {
    // Unique names in first-seen order; predicates keep their role type.
    let mut names: Vec<(String, String, bool)> = Vec::new();
    for candidate in candidates {
        for (name, is_predicate) in [
            (&candidate.subject_name, false),
            (&candidate.predicate_name, true),
            (&candidate.object_name, false),
        ] {
            let key = entity::name_key(name);
            if key.is_empty() || names.iter().any(|(existing, _, _)| existing == &key) {
                continue;
            }
            names.push((key, name.clone(), is_predicate));
        }
    }

    let mut resolved: HashMap<String, String> = HashMap::new();
    let mut unresolved: Vec<(String, String, bool)> = Vec::new();

    for (key, name, is_predicate) in names {
        if let Some(id) = entity_cache.get(&key) {
            resolved.insert(key, id.clone());
            continue;
        }

        if let Some(existing) = Entity::find_exact(db, &name, user_id).await? {
            entity_cache.insert(key.clone(), existing.id.clone());
            resolved.insert(key, existing.id);
            continue;
        }

        unresolved.push((key, name, is_predicate));
    }

    if unresolved.is_empty() {
        return Ok(resolved);
    }

    let inputs: Vec<String> = unresolved.iter().map(|(_, name, _)| name.clone()).collect();
    let embeddings = services.embed_batch(&inputs).await?;

    // Borderline vector matches collected for one adjudication batch.
    struct Borderline {
        position: usize,
        existing_id: String,
    }
    let mut pairs: Vec<(String, String)> = Vec::new();
    let mut borderline: Vec<Borderline> = Vec::new();

    for (position, ((_, name, _), embedding)) in
        unresolved.iter().zip(embeddings.iter()).enumerate()
    {
        let hits = vector::search(
            db,
            VectorNamespace::Entity,
            embedding.clone(),
            tuning.resolution_vector_take,
            user_id,
        )
        .await?;

        let Some(best) = pick_entity_hit(db, &hits, tuning, user_id).await? else {
            continue;
        };

        if best.score >= tuning.entity_similarity_threshold {
            pairs.push((name.clone(), best.name.clone()));
            borderline.push(Borderline {
                position,
                existing_id: best.id,
            });
        }
    }

    let verdicts = if pairs.is_empty() {
        Vec::new()
    } else {
        match services.adjudicate_entity_matches(&pairs).await {
            Ok(verdicts) => verdicts,
            Err(err) => {
                // Conservative fallback: treat every pair as distinct.
                warn!(error = %err, "entity adjudication failed; keeping candidates separate");
                vec![false; pairs.len()]
            }
        }
    };

    let mut confirmed: HashMap<usize, String> = HashMap::new();
    for (entry, verdict) in borderline.into_iter().zip(verdicts) {
        if verdict {
            confirmed.insert(entry.position, entry.existing_id);
        }
    }

    for (position, ((key, name, is_predicate), embedding)) in unresolved
        .into_iter()
        .zip(embeddings.into_iter())
        .enumerate()
    {
        let id = match confirmed.remove(&position) {
            Some(existing_id) => existing_id,
            None => {
                let entity_type = if is_predicate {
                    PREDICATE_TYPE.to_owned()
                } else {
                    "Entity".to_owned()
                };
                let entity = Entity::new(
                    name,
                    entity_type,
                    None,
                    user_id.to_owned(),
                    workspace_id.map(str::to_owned),
                );
                let id = entity.id.clone();
                new_entities.push(NewEntity { entity, embedding });
                id
            }
        };

        entity_cache.insert(key.clone(), id.clone());
        resolved.insert(key, id);
    }

    debug!(
        resolved = resolved.len(),
        created = new_entities.len(),
        "entity resolution complete"
    );

    Ok(resolved)
}

/// Best entity hit: highest score, with ties inside the epsilon resolved
/// toward the older entity.
struct EntityHit {
    id: String,
    name: String,
    score: f32,
}

async fn pick_entity_hit(
    db: &SurrealDbClient,
    hits: &[VectorHit],
    tuning: &IngestionTuning,
    user_id: &str,
) -> Result<Option<EntityHit>, AppError> {
    let Some(top) = hits.first() else {
        return Ok(None);
    };

    let tied_ids: Vec<String> = hits
        .iter()
        .filter(|hit| (top.score - hit.score).abs() < tuning.vector_tie_epsilon)
        .map(|hit| hit.id.clone())
        .collect();

    let entities = Entity::get_by_ids(db, &tied_ids, user_id).await?;
    let oldest = entities
        .into_iter()
        .min_by_key(|entity| entity.created_at);

    Ok(oldest.map(|entity| {
        let score = hits
            .iter()
            .find(|hit| hit.id == entity.id)
            .map_or(top.score, |hit| hit.score);
        EntityHit {
            id: entity.id,
            name: entity.name,
            score,
        }
    }))
}

/// Decide whether a tentative statement already exists: the top vector hit
/// must clear the similarity threshold and carry the identical resolved
/// triple. Near-ties prefer the better-provenanced, then older, statement.
pub async fn resolve_statement(
    db: &SurrealDbClient,
    tuning: &IngestionTuning,
    tentative: &Statement,
    fact_embedding: &[f32],
) -> Result<StatementResolution, AppError> {
    let hits = vector::search(
        db,
        VectorNamespace::Statement,
        fact_embedding.to_vec(),
        tuning.resolution_vector_take,
        &tentative.user_id,
    )
    .await?;

    let passing: Vec<&VectorHit> = hits
        .iter()
        .filter(|hit| hit.score >= tuning.statement_similarity_threshold)
        .collect();
    if passing.is_empty() {
        return Ok(StatementResolution::Fresh);
    }

    let ids: Vec<String> = passing.iter().map(|hit| hit.id.clone()).collect();
    let statements = Statement::get_by_ids(db, &ids, &tentative.user_id).await?;

    let mut matching: Vec<(&VectorHit, &Statement)> = passing
        .iter()
        .filter_map(|hit| {
            statements
                .iter()
                .find(|statement| statement.id == hit.id)
                .filter(|statement| statement.triple() == tentative.triple())
                .map(|statement| (*hit, statement))
        })
        .collect();

    if matching.is_empty() {
        return Ok(StatementResolution::Fresh);
    }

    let top_score = matching
        .iter()
        .map(|(hit, _)| hit.score)
        .fold(f32::MIN, f32::max);
    matching.retain(|(hit, _)| (top_score - hit.score).abs() < tuning.vector_tie_epsilon);

    let mut best: Option<(&Statement, usize)> = None;
    for (_, statement) in matching {
        let provenance = Statement::provenance_count(db, &statement.id).await?;
        best = match best {
            None => Some((statement, provenance)),
            Some((current, current_provenance)) => {
                if provenance > current_provenance
                    || (provenance == current_provenance
                        && statement.created_at < current.created_at)
                {
                    Some((statement, provenance))
                } else {
                    Some((current, current_provenance))
                }
            }
        };
    }

    Ok(best.map_or(StatementResolution::Fresh, |(statement, _)| {
        StatementResolution::Duplicate {
            statement_id: statement.id.clone(),
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::ExtractionResult;
    use crate::pipeline::services::tests_support::MockServices;
    use chrono::Utc;
    use common::storage::indexes::ensure_runtime_indexes;
    use common::storage::types::statement::Aspect;
    use uuid::Uuid;

    async fn setup_db() -> SurrealDbClient {
        let db = SurrealDbClient::memory("resolver_test", &Uuid::new_v4().to_string())
            .await
            .expect("Failed to start in-memory surrealdb");
        ensure_runtime_indexes(&db, 3)
            .await
            .expect("failed to build runtime indexes");
        db
    }

    fn candidate(subject: &str, predicate: &str, object: &str) -> TripleCandidate {
        TripleCandidate {
            subject_name: subject.into(),
            predicate_name: predicate.into(),
            object_name: object.into(),
            fact: format!("{subject} {predicate} {object}."),
            aspect: None,
            attributes: None,
            valid_at: None,
        }
    }

    #[tokio::test]
    async fn exact_name_match_wins_without_model_calls() {
        let db = setup_db().await;
        let existing = Entity::new("Sam Altman".into(), "Entity".into(), None, "user-1".into(), None);
        db.store_item(existing.clone()).await.expect("store");

        let services = MockServices::new(ExtractionResult::default());
        let tuning = IngestionTuning::default();
        let mut cache = HashMap::new();
        let mut created = Vec::new();

        let resolved = resolve_entities(
            &db,
            &services,
            &tuning,
            &[candidate("sam altman", "works_at", "OpenAI")],
            "user-1",
            None,
            &mut cache,
            &mut created,
        )
        .await
        .expect("resolution");

        assert_eq!(
            resolved.get("sam altman").map(String::as_str),
            Some(existing.id.as_str())
        );
        // works_at and OpenAI had no match anywhere and were created.
        assert_eq!(created.len(), 2);
        assert!(created
            .iter()
            .any(|new| new.entity.entity_type == PREDICATE_TYPE));
    }

    #[tokio::test]
    async fn vector_match_is_reused_only_when_adjudicator_confirms() {
        let db = setup_db().await;
        let existing = Entity::new("Samuel Altman".into(), "Entity".into(), None, "user-1".into(), None);
        db.store_item(existing.clone()).await.expect("store");
        vector::upsert_vector(
            &db,
            VectorNamespace::Entity,
            &existing.id,
            vec![1.0, 0.0, 0.0],
            "user-1",
        )
        .await
        .expect("vector");

        let tuning = IngestionTuning::default();

        // Confirming adjudicator: candidate resolves onto the existing id.
        let services = MockServices::new(ExtractionResult::default())
            .with_embedding(vec![0.99, 0.01, 0.0])
            .with_entity_verdicts(vec![true]);
        let mut cache = HashMap::new();
        let mut created = Vec::new();
        let resolved = resolve_entities(
            &db,
            &services,
            &tuning,
            &[candidate("Sam A", "p", "o")],
            "user-1",
            None,
            &mut cache,
            &mut created,
        )
        .await
        .expect("resolution");
        assert_eq!(
            resolved.get("sam a").map(String::as_str),
            Some(existing.id.as_str())
        );

        // Rejecting adjudicator: a new entity is created instead.
        let services = MockServices::new(ExtractionResult::default())
            .with_embedding(vec![0.99, 0.01, 0.0])
            .with_entity_verdicts(vec![false]);
        let mut cache = HashMap::new();
        let mut created = Vec::new();
        let resolved = resolve_entities(
            &db,
            &services,
            &tuning,
            &[candidate("Sam A", "p", "o")],
            "user-1",
            None,
            &mut cache,
            &mut created,
        )
        .await
        .expect("resolution");
        assert_ne!(
            resolved.get("sam a").map(String::as_str),
            Some(existing.id.as_str())
        );
        assert!(created.iter().any(|new| new.entity.name == "Sam A"));
    }

    #[tokio::test]
    async fn adjudication_failure_falls_back_to_not_a_duplicate() {
        let db = setup_db().await;
        let existing = Entity::new("Acme Corp".into(), "Entity".into(), None, "user-1".into(), None);
        db.store_item(existing.clone()).await.expect("store");
        vector::upsert_vector(
            &db,
            VectorNamespace::Entity,
            &existing.id,
            vec![1.0, 0.0, 0.0],
            "user-1",
        )
        .await
        .expect("vector");

        let services = MockServices::new(ExtractionResult::default())
            .with_embedding(vec![0.99, 0.01, 0.0])
            .with_failing_adjudication();
        let tuning = IngestionTuning::default();
        let mut cache = HashMap::new();
        let mut created = Vec::new();

        let resolved = resolve_entities(
            &db,
            &services,
            &tuning,
            &[candidate("Acme Corporation", "p", "o")],
            "user-1",
            None,
            &mut cache,
            &mut created,
        )
        .await
        .expect("fallback must not fail the stage");

        assert_ne!(
            resolved.get("acme corporation").map(String::as_str),
            Some(existing.id.as_str())
        );
    }

    #[tokio::test]
    async fn duplicate_statement_is_detected_by_vector_and_triple() {
        let db = setup_db().await;
        let existing = Statement::new(
            "Alice works at Acme.".into(),
            "alice".into(),
            "works_at".into(),
            "acme".into(),
            Aspect::Attribute,
            Utc::now(),
            None,
            "user-1".into(),
            None,
        );
        db.store_item(existing.clone()).await.expect("store");
        vector::upsert_vector(
            &db,
            VectorNamespace::Statement,
            &existing.id,
            vec![1.0, 0.0, 0.0],
            "user-1",
        )
        .await
        .expect("vector");

        let tuning = IngestionTuning::default();
        let tentative = Statement::new(
            "Alice is employed by Acme.".into(),
            "alice".into(),
            "works_at".into(),
            "acme".into(),
            Aspect::Attribute,
            Utc::now(),
            None,
            "user-1".into(),
            None,
        );

        let resolution = resolve_statement(&db, &tuning, &tentative, &[0.99, 0.01, 0.0])
            .await
            .expect("resolution");
        assert_eq!(
            resolution,
            StatementResolution::Duplicate {
                statement_id: existing.id.clone()
            }
        );

        // Same vector neighborhood, different triple: not a duplicate.
        let different_triple = Statement::new(
            "Alice works at Globex.".into(),
            "alice".into(),
            "works_at".into(),
            "globex".into(),
            Aspect::Attribute,
            Utc::now(),
            None,
            "user-1".into(),
            None,
        );
        let resolution = resolve_statement(&db, &tuning, &different_triple, &[0.99, 0.01, 0.0])
            .await
            .expect("resolution");
        assert_eq!(resolution, StatementResolution::Fresh);
    }

    #[tokio::test]
    async fn statement_tie_break_prefers_larger_provenance() {
        let db = setup_db().await;
        let mut older = Statement::new(
            "Alice works at Acme.".into(),
            "alice".into(),
            "works_at".into(),
            "acme".into(),
            Aspect::Attribute,
            Utc::now(),
            None,
            "user-1".into(),
            None,
        );
        older.created_at = Utc::now() - chrono::Duration::days(2);
        let rich = Statement::new(
            "Alice is employed at Acme.".into(),
            "alice".into(),
            "works_at".into(),
            "acme".into(),
            Aspect::Attribute,
            Utc::now(),
            None,
            "user-1".into(),
            None,
        );
        db.store_item(older.clone()).await.expect("store older");
        db.store_item(rich.clone()).await.expect("store rich");
        rich.add_provenance(&db, "e1").await.expect("provenance");
        rich.add_provenance(&db, "e2").await.expect("provenance");

        // Identical vectors: scores tie inside the epsilon.
        for statement in [&older, &rich] {
            vector::upsert_vector(
                &db,
                VectorNamespace::Statement,
                &statement.id,
                vec![1.0, 0.0, 0.0],
                "user-1",
            )
            .await
            .expect("vector");
        }

        let tuning = IngestionTuning::default();
        let tentative = Statement::new(
            "Alice has a job at Acme.".into(),
            "alice".into(),
            "works_at".into(),
            "acme".into(),
            Aspect::Attribute,
            Utc::now(),
            None,
            "user-1".into(),
            None,
        );

        let resolution = resolve_statement(&db, &tuning, &tentative, &[1.0, 0.0, 0.0])
            .await
            .expect("resolution");
        assert_eq!(
            resolution,
            StatementResolution::Duplicate {
                statement_id: rich.id
            }
        );
    }
}
