use std::collections::{HashMap, HashSet};

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            entity::Entity,
            statement::{Role, Statement},
            StoredObject,
        },
        vector::{self, VectorNamespace},
    },
};
use serde::Deserialize;
use surrealdb::sql::Thing;
use tracing::debug;

use crate::{
    provenance::{group_by_episode, provenance_pairs},
    services::QueryServices,
    EpisodeCandidate, RetrievalConfig, StatementFilters,
};

#[derive(Deserialize)]
struct EdgeRow {
    #[serde(rename = "in", deserialize_with = "deserialize_edge_id")]
    statement_id: String,
    #[serde(rename = "out", deserialize_with = "deserialize_edge_id")]
    entity_id: String,
}

fn deserialize_edge_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let thing = Thing::deserialize(deserializer)?;
    Ok(thing.id.to_raw())
}

/// Role edges touching an entity set, across all three edge tables.
async fn role_edges_for_entities(
    db: &SurrealDbClient,
    entity_ids: &[String],
) -> Result<Vec<EdgeRow>, AppError> {
    if entity_ids.is_empty() {
        return Ok(Vec::new());
    }

    let things: Vec<Thing> = entity_ids
        .iter()
        .map(|id| Thing::from((Entity::table_name(), id.as_str())))
        .collect();

    let mut edges = Vec::new();
    for role in Role::ALL {
        let mut response = db
            .client
            .query(format!(
                "SELECT in, out FROM {table} WHERE out IN $things;",
                table = role.edge_table()
            ))
            .bind(("things", things.clone()))
            .await?;

        let rows: Vec<EdgeRow> = response.take(0)?;
        edges.extend(rows);
    }

    Ok(edges)
}

/// Role edges of a statement set, yielding the entities they connect.
async fn role_edges_for_statements(
    db: &SurrealDbClient,
    statement_ids: &[String],
) -> Result<Vec<EdgeRow>, AppError> {
    if statement_ids.is_empty() {
        return Ok(Vec::new());
    }

    let things: Vec<Thing> = statement_ids
        .iter()
        .map(|id| Thing::from((Statement::table_name(), id.as_str())))
        .collect();

    let mut edges = Vec::new();
    for role in Role::ALL {
        let mut response = db
            .client
            .query(format!(
                "SELECT in, out FROM {table} WHERE in IN $things;",
                table = role.edge_table()
            ))
            .bind(("things", things.clone()))
            .await?;

        let rows: Vec<EdgeRow> = response.take(0)?;
        edges.extend(rows);
    }

    Ok(edges)
}

/// Resolve the entities a query names to graph UUIDs: exact name match
/// first, vector similarity as the fallback.
pub(crate) async fn resolve_query_entities(
    db: &SurrealDbClient,
    services: &dyn QueryServices,
    query: &str,
    user_id: &str,
    config: &RetrievalConfig,
) -> Result<Vec<String>, AppError> {
    let names = services.extract_query_entities(query).await?;
    let mut resolved = Vec::new();

    for name in names {
        if let Some(entity) = Entity::find_exact(db, &name, user_id).await? {
            if !resolved.contains(&entity.id) {
                resolved.push(entity.id);
            }
            continue;
        }

        let name_embedding = services.embed_query(&name).await?;
        let hits =
            vector::search(db, VectorNamespace::Entity, name_embedding, 1, user_id).await?;
        if let Some(hit) = hits.first() {
            if hit.score >= config.entity_resolution_floor && !resolved.contains(&hit.id) {
                resolved.push(hit.id.clone());
            }
        }
    }

    debug!(entities = resolved.len(), "query entities resolved");
    Ok(resolved)
}

/// Entity BFS sub-plan: expand from the query entities over role edges up to
/// the configured depth, then score the collected statements against the
/// query embedding in one batch call. Scoring never happens in the traversal.
#[allow(clippy::too_many_arguments)]
pub async fn entity_bfs_plan(
    db: &SurrealDbClient,
    services: &dyn QueryServices,
    query: &str,
    query_embedding: Vec<f32>,
    user_id: &str,
    filters: &StatementFilters,
    config: &RetrievalConfig,
) -> Result<Vec<EpisodeCandidate>, AppError> {
    let seeds = resolve_query_entities(db, services, query, user_id, config).await?;
    if seeds.is_empty() {
        return Ok(Vec::new());
    }

    let mut visited_entities: HashSet<String> = seeds.iter().cloned().collect();
    let mut collected_statements: HashSet<String> = HashSet::new();
    let mut frontier = seeds;

    for depth in 0..config.bfs_depth {
        let edges = role_edges_for_entities(db, &frontier).await?;
        let mut new_statements = Vec::new();
        for edge in &edges {
            if collected_statements.insert(edge.statement_id.clone()) {
                new_statements.push(edge.statement_id.clone());
            }
        }

        if new_statements.is_empty() || depth + 1 >= config.bfs_depth {
            break;
        }

        let expansion = role_edges_for_statements(db, &new_statements).await?;
        frontier = expansion
            .into_iter()
            .filter_map(|edge| {
                visited_entities
                    .insert(edge.entity_id.clone())
                    .then_some(edge.entity_id)
            })
            .collect();

        if frontier.is_empty() {
            break;
        }
    }

    if collected_statements.is_empty() {
        return Ok(Vec::new());
    }

    let statement_ids: Vec<String> = collected_statements.into_iter().collect();
    let hits = vector::batch_score(
        db,
        VectorNamespace::Statement,
        &statement_ids,
        query_embedding,
    )
    .await?;

    let passing: Vec<(String, f32)> = hits
        .into_iter()
        .filter(|hit| hit.score >= config.statement_vector_floor)
        .map(|hit| (hit.id, hit.score))
        .collect();

    if passing.is_empty() {
        return Ok(Vec::new());
    }

    let ids: Vec<String> = passing.iter().map(|(id, _)| id.clone()).collect();
    let statements = Statement::get_by_ids(db, &ids, user_id).await?;
    let admitted: Vec<(String, f32)> = passing
        .into_iter()
        .filter(|(id, _)| {
            statements
                .iter()
                .find(|statement| &statement.id == id)
                .is_some_and(|statement| filters.admits(statement))
        })
        .collect();

    group_by_episode(db, &admitted, config.matched_statements_per_episode).await
}

/// Episode graph sub-plan: episodes ranked by how densely their provenance
/// subgraph matches the query entities.
/// `connectivity = (matched / total statements) * matched entity count`.
pub async fn episode_graph_plan(
    db: &SurrealDbClient,
    services: &dyn QueryServices,
    query: &str,
    user_id: &str,
    filters: &StatementFilters,
    config: &RetrievalConfig,
) -> Result<Vec<EpisodeCandidate>, AppError> {
    let seeds = resolve_query_entities(db, services, query, user_id, config).await?;
    if seeds.is_empty() {
        return Ok(Vec::new());
    }
    let seed_set: HashSet<&str> = seeds.iter().map(String::as_str).collect();

    let edges = role_edges_for_entities(db, &seeds).await?;
    if edges.is_empty() {
        return Ok(Vec::new());
    }

    // Which query entities each statement touches.
    let mut touched: HashMap<String, HashSet<String>> = HashMap::new();
    for edge in edges {
        if seed_set.contains(edge.entity_id.as_str()) {
            touched
                .entry(edge.statement_id)
                .or_default()
                .insert(edge.entity_id);
        }
    }

    let matched_ids: Vec<String> = touched.keys().cloned().collect();
    let statements = Statement::get_by_ids(db, &matched_ids, user_id).await?;
    let admitted: HashSet<&str> = statements
        .iter()
        .filter(|statement| filters.admits(statement))
        .map(|statement| statement.id.as_str())
        .collect();

    let admitted_ids: Vec<String> = matched_ids
        .iter()
        .filter(|id| admitted.contains(id.as_str()))
        .cloned()
        .collect();
    let pairs = provenance_pairs(db, &admitted_ids).await?;

    let mut per_episode: HashMap<String, Vec<String>> = HashMap::new();
    for (episode_id, statement_id) in pairs {
        per_episode.entry(episode_id).or_default().push(statement_id);
    }

    let mut candidates = Vec::with_capacity(per_episode.len());
    for (episode_id, mut matched_statements) in per_episode {
        let total = Statement::ids_for_episode(db, &episode_id).await?.len();
        if total == 0 {
            continue;
        }

        let matched_entities: HashSet<&String> = matched_statements
            .iter()
            .filter_map(|id| touched.get(id))
            .flatten()
            .collect();

        let connectivity = (matched_statements.len() as f32 / total as f32)
            * matched_entities.len() as f32;

        matched_statements.truncate(config.matched_statements_per_episode);
        candidates.push(EpisodeCandidate {
            episode_id,
            score: connectivity,
            matched_statement_ids: matched_statements,
        });
    }

    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.episode_id.cmp(&b.episode_id))
    });

    Ok(candidates)
}
