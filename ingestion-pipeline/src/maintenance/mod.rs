use std::collections::{HashMap, HashSet};

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            compacted_session::CompactedSession,
            entity::Entity,
            episode::Episode,
            label::Label,
            statement::{Role, Statement},
        },
        vector::{self, VectorNamespace},
    },
};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::pipeline::services::PipelineServices;

#[derive(Deserialize)]
struct OutRow {
    #[serde(deserialize_with = "deserialize_out_id")]
    out: String,
}

fn deserialize_out_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let thing = surrealdb::sql::Thing::deserialize(deserializer)?;
    Ok(thing.id.to_raw())
}

/// Entity ids referenced by at least one role edge for this user.
async fn referenced_entity_ids(
    db: &SurrealDbClient,
    user_id: &str,
) -> Result<HashSet<String>, AppError> {
    let mut referenced = HashSet::new();
    for role in Role::ALL {
        let mut response = db
            .client
            .query(format!(
                "SELECT out FROM {table} WHERE metadata.user_id = $user_id;",
                table = role.edge_table()
            ))
            .bind(("user_id", user_id.to_owned()))
            .await?;
        let rows: Vec<OutRow> = response.take(0)?;
        referenced.extend(rows.into_iter().map(|row| row.out));
    }
    Ok(referenced)
}

/// Delete entities whose in-degree of role edges fell to zero, pruning
/// their vectors with them. Returns the number reclaimed.
pub async fn orphan_sweep(db: &SurrealDbClient, user_id: &str) -> Result<usize, AppError> {
    let entities = Entity::all_for_user(db, user_id).await?;
    let referenced = referenced_entity_ids(db, user_id).await?;

    let mut reclaimed = 0;
    for entity in entities {
        if referenced.contains(&entity.id) {
            continue;
        }

        db.delete_item::<Entity>(&entity.id).await?;
        vector::delete_vector(db, VectorNamespace::Entity, &entity.id).await?;
        reclaimed += 1;
    }

    if reclaimed > 0 {
        info!(user_id, reclaimed, "orphaned entities swept");
    }

    Ok(reclaimed)
}

/// Merge duplicate entities (same normalized name per user) into the oldest
/// one: attributes union with newer values winning, role edges and
/// statement references moved, then the duplicates deleted. Returns the
/// number of entities merged away.
pub async fn dedup_entities(db: &SurrealDbClient, user_id: &str) -> Result<usize, AppError> {
    let entities = Entity::all_for_user(db, user_id).await?;

    let mut groups: HashMap<String, Vec<Entity>> = HashMap::new();
    for entity in entities {
        groups.entry(entity.name_key.clone()).or_default().push(entity);
    }

    let mut merged = 0;
    for (_, group) in groups {
        if group.len() < 2 {
            continue;
        }

        // all_for_user returns oldest first; the canonical UUID is the oldest.
        let mut iter = group.into_iter();
        let Some(mut canonical) = iter.next() else {
            continue;
        };

        for duplicate in iter {
            canonical.attributes = canonical.merged_attributes(&duplicate);

            for field in ["subject_id", "predicate_id", "object_id"] {
                db.client
                    .query(format!(
                        "UPDATE statement SET {field} = $canonical \
                         WHERE {field} = $duplicate AND user_id = $user_id;"
                    ))
                    .bind(("canonical", canonical.id.clone()))
                    .bind(("duplicate", duplicate.id.clone()))
                    .bind(("user_id", user_id.to_owned()))
                    .await?
                    .check()?;
            }

            // Edge in/out are immutable; re-derive the role edges from the
            // rewritten statements, then drop the ones still pointing at
            // the duplicate.
            let mut response = db
                .client
                .query(
                    "SELECT * FROM statement \
                     WHERE user_id = $user_id \
                       AND (subject_id = $canonical \
                            OR predicate_id = $canonical \
                            OR object_id = $canonical);",
                )
                .bind(("user_id", user_id.to_owned()))
                .bind(("canonical", canonical.id.clone()))
                .await?;
            let rewritten: Vec<Statement> = response.take(0)?;
            for statement in &rewritten {
                statement.relate_roles(db).await?;
            }

            for role in Role::ALL {
                db.client
                    .query(format!(
                        "DELETE {table} WHERE out = type::thing('entity', $duplicate);",
                        table = role.edge_table()
                    ))
                    .bind(("duplicate", duplicate.id.clone()))
                    .await?
                    .check()?;
            }

            db.delete_item::<Entity>(&duplicate.id).await?;
            vector::delete_vector(db, VectorNamespace::Entity, &duplicate.id).await?;
            merged += 1;
            debug!(
                canonical = %canonical.id,
                duplicate = %duplicate.id,
                "duplicate entity merged"
            );
        }

        db.upsert_item(canonical).await?;
    }

    if merged > 0 {
        info!(user_id, merged, "entity dedup sweep complete");
    }

    Ok(merged)
}

/// Text the vector row of a node is derived from.
async fn embedding_input(
    db: &SurrealDbClient,
    namespace: VectorNamespace,
    id: &str,
) -> Result<Option<(String, String)>, AppError> {
    Ok(match namespace {
        VectorNamespace::Entity => db
            .get_item::<Entity>(id)
            .await?
            .map(|entity| (entity.name, entity.user_id)),
        VectorNamespace::Statement => db
            .get_item::<Statement>(id)
            .await?
            .map(|statement| (statement.fact, statement.user_id)),
        VectorNamespace::Episode => db
            .get_item::<Episode>(id)
            .await?
            .map(|episode| (episode.content, episode.user_id)),
        VectorNamespace::CompactedSession => db
            .get_item::<CompactedSession>(id)
            .await?
            .map(|session| (session.summary, session.user_id)),
        VectorNamespace::Label => db
            .get_item::<Label>(id)
            .await?
            .map(|label| (label.embedding_input(), label.user_id)),
    })
}

/// Restore vector/graph parity: re-embed graph nodes whose vector is
/// missing (once per sweep; persistent failures are logged and left for the
/// next run) and prune vectors whose node is gone.
pub async fn reconcile_vectors(
    db: &SurrealDbClient,
    services: &dyn PipelineServices,
) -> Result<(usize, usize), AppError> {
    let mut repaired = 0;
    let mut pruned = 0;

    for namespace in VectorNamespace::ALL {
        for id in vector::missing_vector_ids(db, namespace).await? {
            let Some((input, user_id)) = embedding_input(db, namespace, &id).await? else {
                continue;
            };

            match services.embed(&input).await {
                Ok(embedding) => {
                    vector::upsert_vector(db, namespace, &id, embedding, &user_id).await?;
                    repaired += 1;
                }
                Err(err) => {
                    error!(
                        namespace = namespace.as_str(),
                        id,
                        error = %err,
                        "re-embedding failed; leaving for next sweep"
                    );
                }
            }
        }

        for id in vector::stale_vector_ids(db, namespace).await? {
            vector::delete_vector(db, namespace, &id).await?;
            pruned += 1;
        }
    }

    if repaired > 0 || pruned > 0 {
        info!(repaired, pruned, "vector reconciliation sweep complete");
    }

    Ok((repaired, pruned))
}

/// Users with graph data, for the periodic sweeps. Identity lives outside
/// this service, so the graph itself is the roster.
pub async fn active_user_ids(db: &SurrealDbClient) -> Result<Vec<String>, AppError> {
    #[derive(Deserialize)]
    struct Row {
        user_id: String,
    }

    let mut response = db
        .client
        .query("SELECT user_id FROM entity GROUP BY user_id;")
        .await?;
    let rows: Vec<Row> = response.take(0)?;
    Ok(rows.into_iter().map(|row| row.user_id).collect())
}

/// One full maintenance pass: per-user entity dedup and orphan sweep, then
/// a global vector reconciliation.
pub async fn run_sweep(
    db: &SurrealDbClient,
    services: &dyn PipelineServices,
) -> Result<(), AppError> {
    for user_id in active_user_ids(db).await? {
        dedup_entities(db, &user_id).await?;
        orphan_sweep(db, &user_id).await?;
    }

    reconcile_vectors(db, services).await?;
    Ok(())
}

/// User-initiated episode deletion: remove the episode, any statement left
/// without provenance, and any entity orphaned as a result.
pub async fn delete_episode(
    db: &SurrealDbClient,
    episode_id: &str,
    user_id: &str,
) -> Result<(), AppError> {
    let episode: Option<Episode> = db.get_item(episode_id).await?;
    let Some(episode) = episode else {
        return Err(AppError::NotFound(format!("episode {episode_id}")));
    };
    if episode.user_id != user_id {
        return Err(AppError::NotFound(format!("episode {episode_id}")));
    }

    let statement_ids = Statement::ids_for_episode(db, episode_id).await?;

    db.client
        .query("DELETE has_provenance WHERE in = type::thing('episode', $id);")
        .bind(("id", episode_id.to_owned()))
        .await?
        .check()?;

    for statement_id in statement_ids {
        let remaining = Statement::provenance_count(db, &statement_id).await?;
        if remaining == 0 {
            Statement::delete_with_edges(db, &statement_id).await?;
        } else {
            warn!(
                statement_id = %statement_id,
                remaining,
                "statement retains other provenance; kept"
            );
        }
    }

    db.delete_item::<Episode>(episode_id).await?;
    vector::delete_vector(db, VectorNamespace::Episode, episode_id).await?;

    orphan_sweep(db, user_id).await?;

    info!(episode_id, "episode deleted with cascade");
    Ok(())
}
