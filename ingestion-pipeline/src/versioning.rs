use std::collections::HashSet;

use common::{
    error::AppError,
    storage::{db::SurrealDbClient, types::episode::Episode, types::statement::Statement},
};
use tracing::{debug, info};

use crate::chunker::Chunk;

/// Outcome of comparing an incoming document against the session's latest
/// version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionPlan {
    /// Version the new chunks will be written at.
    pub version: u32,
    /// Chunk indexes that changed, appeared or disappeared.
    pub changed_indices: Vec<u32>,
    /// Version the changed statements hang off, when one exists.
    pub previous_version: Option<u32>,
}

impl VersionPlan {
    /// An identical re-ingest: nothing to write.
    pub fn is_noop(&self) -> bool {
        self.previous_version.is_some() && self.changed_indices.is_empty()
    }
}

/// Positional diff of two chunk-hash vectors: indexes whose hash differs
/// plus indexes present in only one side.
pub fn diff_chunk_hashes(previous: &[String], current: &[String]) -> Vec<u32> {
    let longest = previous.len().max(current.len());
    (0..longest)
        .filter(|index| previous.get(*index) != current.get(*index))
        .map(|index| index as u32)
        .collect()
}

/// Decide what a document ingest under an existing session must do.
pub async fn plan_document_version(
    db: &SurrealDbClient,
    session_id: &str,
    user_id: &str,
    chunks: &[Chunk],
) -> Result<VersionPlan, AppError> {
    let current_hashes: Vec<String> = chunks
        .iter()
        .map(|chunk| chunk.content_hash.clone())
        .collect();

    match Episode::latest_chunk_hashes(db, session_id, user_id).await? {
        None => Ok(VersionPlan {
            version: 1,
            changed_indices: (0..chunks.len() as u32).collect(),
            previous_version: None,
        }),
        Some((previous_version, previous_hashes)) => {
            let changed_indices = diff_chunk_hashes(&previous_hashes, &current_hashes);
            debug!(
                session_id,
                previous_version,
                changed = changed_indices.len(),
                "document version diff computed"
            );
            Ok(VersionPlan {
                version: previous_version + 1,
                changed_indices,
                previous_version: Some(previous_version),
            })
        }
    }
}

/// Set `invalid_at` on statements whose provenance lies entirely in the
/// changed chunks of the superseded version. Statements also grounded in
/// unchanged chunks stay valid. Returns the number invalidated.
pub async fn invalidate_statements_from_previous_version(
    db: &SurrealDbClient,
    session_id: &str,
    previous_version: u32,
    changed_indices: &[u32],
    invalidated_by: &str,
    user_id: &str,
) -> Result<usize, AppError> {
    let previous_chunks =
        Episode::chunks_for_version(db, session_id, previous_version, user_id).await?;

    let changed_set: HashSet<u32> = changed_indices.iter().copied().collect();
    let changed_episode_ids: HashSet<String> = previous_chunks
        .iter()
        .filter(|episode| changed_set.contains(&episode.chunk_index))
        .map(|episode| episode.id.clone())
        .collect();

    if changed_episode_ids.is_empty() {
        return Ok(0);
    }

    let mut statement_ids: HashSet<String> = HashSet::new();
    for episode_id in &changed_episode_ids {
        statement_ids.extend(Statement::ids_for_episode(db, episode_id).await?);
    }

    let invalid_at = db.current_timestamp().await?;
    let mut invalidated = 0;

    for statement_id in statement_ids {
        let provenance = Statement::provenance_episode_ids(db, &statement_id).await?;
        let only_changed = provenance
            .iter()
            .all(|episode_id| changed_episode_ids.contains(episode_id));
        if !only_changed {
            continue;
        }

        let current: Vec<Statement> =
            Statement::get_by_ids(db, std::slice::from_ref(&statement_id), user_id).await?;
        if current
            .first()
            .is_none_or(|statement| statement.invalid_at.is_some())
        {
            continue;
        }

        Statement::invalidate(db, &statement_id, invalid_at, invalidated_by).await?;
        invalidated += 1;
    }

    info!(
        session_id,
        previous_version, invalidated, "superseded version statements invalidated"
    );

    Ok(invalidated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::content_hash;
    use chrono::Utc;
    use common::storage::types::episode::EpisodeType;
    use common::storage::types::statement::Aspect;
    use uuid::Uuid;

    fn hashes(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| (*v).to_owned()).collect()
    }

    #[test]
    fn diff_detects_changes_additions_and_removals() {
        assert!(diff_chunk_hashes(&hashes(&["a", "b"]), &hashes(&["a", "b"])).is_empty());
        assert_eq!(
            diff_chunk_hashes(&hashes(&["a", "b", "c"]), &hashes(&["a", "x", "c"])),
            vec![1]
        );
        assert_eq!(
            diff_chunk_hashes(&hashes(&["a"]), &hashes(&["a", "b"])),
            vec![1]
        );
        assert_eq!(
            diff_chunk_hashes(&hashes(&["a", "b"]), &hashes(&["a"])),
            vec![1]
        );
    }

    fn chunk_of(text: &str, index: u32) -> Chunk {
        Chunk {
            index,
            text: text.to_owned(),
            content_hash: content_hash(text),
        }
    }

    fn episode_row(session: &str, version: u32, index: u32, hashes: Vec<String>) -> Episode {
        Episode::new(
            format!("chunk {index}"),
            format!("chunk {index}"),
            "core".into(),
            session.into(),
            EpisodeType::Document,
            index,
            hashes.len() as u32,
            version,
            hashes.get(index as usize).cloned().unwrap_or_default(),
            hashes,
            Vec::new(),
            Utc::now(),
            "user-1".into(),
            None,
        )
    }

    async fn setup_db() -> SurrealDbClient {
        SurrealDbClient::memory("versioning_test", &Uuid::new_v4().to_string())
            .await
            .expect("Failed to start in-memory surrealdb")
    }

    #[tokio::test]
    async fn first_ingest_is_version_one_with_all_chunks_changed() {
        let db = setup_db().await;
        let chunks = vec![chunk_of("one", 0), chunk_of("two", 1)];

        let plan = plan_document_version(&db, "d1", "user-1", &chunks)
            .await
            .expect("plan");

        assert_eq!(plan.version, 1);
        assert_eq!(plan.changed_indices, vec![0, 1]);
        assert!(!plan.is_noop());
    }

    #[tokio::test]
    async fn identical_reingest_is_a_noop() {
        let db = setup_db().await;
        let chunks = vec![chunk_of("one", 0), chunk_of("two", 1)];
        let hash_vector: Vec<String> = chunks.iter().map(|c| c.content_hash.clone()).collect();

        for index in 0..2 {
            db.store_item(episode_row("d1", 1, index, hash_vector.clone()))
                .await
                .expect("store");
        }

        let plan = plan_document_version(&db, "d1", "user-1", &chunks)
            .await
            .expect("plan");
        assert!(plan.is_noop(), "unchanged hashes must plan zero writes");
    }

    #[tokio::test]
    async fn edited_chunk_bumps_version_and_lists_only_that_index() {
        let db = setup_db().await;
        let original = vec![chunk_of("one", 0), chunk_of("two", 1), chunk_of("three", 2)];
        let hash_vector: Vec<String> = original.iter().map(|c| c.content_hash.clone()).collect();
        for index in 0..3 {
            db.store_item(episode_row("d1", 1, index, hash_vector.clone()))
                .await
                .expect("store");
        }

        let edited = vec![
            chunk_of("one", 0),
            chunk_of("two (edited)", 1),
            chunk_of("three", 2),
        ];
        let plan = plan_document_version(&db, "d1", "user-1", &edited)
            .await
            .expect("plan");

        assert_eq!(plan.version, 2);
        assert_eq!(plan.changed_indices, vec![1]);
    }

    #[tokio::test]
    async fn invalidation_spares_statements_grounded_in_unchanged_chunks() {
        let db = setup_db().await;
        let hash_vector = hashes(&["h0", "h1"]);
        let chunk0 = episode_row("d1", 1, 0, hash_vector.clone());
        let chunk1 = episode_row("d1", 1, 1, hash_vector);
        db.store_item(chunk0.clone()).await.expect("store");
        db.store_item(chunk1.clone()).await.expect("store");

        let changed_only = Statement::new(
            "Fact from the edited chunk.".into(),
            "s".into(),
            "p".into(),
            "o1".into(),
            Aspect::Attribute,
            Utc::now(),
            None,
            "user-1".into(),
            None,
        );
        db.store_item(changed_only.clone()).await.expect("store");
        changed_only
            .add_provenance(&db, &chunk1.id)
            .await
            .expect("provenance");

        let shared = Statement::new(
            "Fact grounded in both chunks.".into(),
            "s".into(),
            "p".into(),
            "o2".into(),
            Aspect::Attribute,
            Utc::now(),
            None,
            "user-1".into(),
            None,
        );
        db.store_item(shared.clone()).await.expect("store");
        shared.add_provenance(&db, &chunk0.id).await.expect("provenance");
        shared.add_provenance(&db, &chunk1.id).await.expect("provenance");

        let invalidated = invalidate_statements_from_previous_version(
            &db,
            "d1",
            1,
            &[1],
            "new-episode-uuid",
            "user-1",
        )
        .await
        .expect("invalidation");

        assert_eq!(invalidated, 1);

        let changed_row: Statement = db
            .get_item(&changed_only.id)
            .await
            .expect("fetch")
            .expect("present");
        assert!(changed_row.invalid_at.is_some());
        assert_eq!(
            changed_row.invalidated_by.as_deref(),
            Some("new-episode-uuid")
        );

        let shared_row: Statement = db
            .get_item(&shared.id)
            .await
            .expect("fetch")
            .expect("present");
        assert!(shared_row.invalid_at.is_none());
    }
}
