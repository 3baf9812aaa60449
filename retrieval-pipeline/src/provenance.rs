use std::collections::HashMap;

use common::{error::AppError, storage::db::SurrealDbClient};
use serde::Deserialize;
use surrealdb::sql::Thing;

use common::storage::types::statement::Statement;
use common::storage::types::StoredObject;

use crate::EpisodeCandidate;

#[derive(Deserialize)]
struct ProvenanceRow {
    #[serde(rename = "in", deserialize_with = "deserialize_edge_id")]
    episode_id: String,
    #[serde(rename = "out", deserialize_with = "deserialize_edge_id")]
    statement_id: String,
}

fn deserialize_edge_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let thing = Thing::deserialize(deserializer)?;
    Ok(thing.id.to_raw())
}

/// Provenance edges for a statement set, as `(episode_id, statement_id)`.
pub(crate) async fn provenance_pairs(
    db: &SurrealDbClient,
    statement_ids: &[String],
) -> Result<Vec<(String, String)>, AppError> {
    if statement_ids.is_empty() {
        return Ok(Vec::new());
    }

    let things: Vec<Thing> = statement_ids
        .iter()
        .map(|id| Thing::from((Statement::table_name(), id.as_str())))
        .collect();

    let mut response = db
        .client
        .query("SELECT in, out FROM has_provenance WHERE out IN $things;")
        .bind(("things", things))
        .await?;

    let rows: Vec<ProvenanceRow> = response.take(0)?;
    Ok(rows
        .into_iter()
        .map(|row| (row.episode_id, row.statement_id))
        .collect())
}

/// Group scored statements into per-episode candidates: episode score is the
/// mean of its statement scores, and the top statements by score are kept as
/// the match evidence.
pub(crate) async fn group_by_episode(
    db: &SurrealDbClient,
    scored_statements: &[(String, f32)],
    per_episode: usize,
) -> Result<Vec<EpisodeCandidate>, AppError> {
    let statement_ids: Vec<String> = scored_statements
        .iter()
        .map(|(id, _)| id.clone())
        .collect();
    let pairs = provenance_pairs(db, &statement_ids).await?;

    let score_map: HashMap<&str, f32> = scored_statements
        .iter()
        .map(|(id, score)| (id.as_str(), *score))
        .collect();

    let mut grouped: HashMap<String, Vec<(String, f32)>> = HashMap::new();
    for (episode_id, statement_id) in pairs {
        let Some(score) = score_map.get(statement_id.as_str()).copied() else {
            continue;
        };
        grouped
            .entry(episode_id)
            .or_default()
            .push((statement_id, score));
    }

    let mut candidates: Vec<EpisodeCandidate> = grouped
        .into_iter()
        .map(|(episode_id, mut statements)| {
            statements.sort_by(|a, b| {
                b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal)
            });
            let score =
                statements.iter().map(|(_, s)| *s).sum::<f32>() / statements.len() as f32;
            statements.truncate(per_episode);
            EpisodeCandidate {
                episode_id,
                score,
                matched_statement_ids: statements.into_iter().map(|(id, _)| id).collect(),
            }
        })
        .collect();

    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.episode_id.cmp(&b.episode_id))
    });

    Ok(candidates)
}
