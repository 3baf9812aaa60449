use surrealdb::opt::PatchOp;
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EpisodeType {
    Conversation,
    Document,
}

/// The only observable processing status of an episode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EpisodeStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

stored_object!(Episode, "episode", {
    content: String,
    original_content: String,
    source: String,
    session_id: String,
    episode_type: EpisodeType,
    chunk_index: u32,
    total_chunks: u32,
    version: u32,
    content_hash: String,
    /// Hashes of every chunk in the session at this version. Carried on each
    /// chunk row because a new version only writes its changed chunks.
    chunk_hashes: Vec<String>,
    label_ids: Vec<String>,
    #[serde(serialize_with = "serialize_datetime", deserialize_with = "deserialize_datetime", default)]
    valid_at: DateTime<Utc>,
    status: EpisodeStatus,
    error: Option<String>,
    title: Option<String>,
    user_id: String,
    workspace_id: Option<String>
});

impl Episode {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        content: String,
        original_content: String,
        source: String,
        session_id: String,
        episode_type: EpisodeType,
        chunk_index: u32,
        total_chunks: u32,
        version: u32,
        content_hash: String,
        chunk_hashes: Vec<String>,
        label_ids: Vec<String>,
        valid_at: DateTime<Utc>,
        user_id: String,
        workspace_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            content,
            original_content,
            source,
            session_id,
            episode_type,
            chunk_index,
            total_chunks,
            version,
            content_hash,
            chunk_hashes,
            label_ids,
            valid_at,
            status: EpisodeStatus::Pending,
            error: None,
            title: None,
            user_id,
            workspace_id,
        }
    }

    pub async fn set_status(
        db: &SurrealDbClient,
        id: &str,
        status: EpisodeStatus,
        error: Option<String>,
    ) -> Result<(), AppError> {
        let _episode: Option<Self> = db
            .update((Self::table_name(), id))
            .patch(PatchOp::replace("/status", status))
            .patch(PatchOp::replace("/error", error))
            .patch(PatchOp::replace(
                "/updated_at",
                surrealdb::sql::Datetime::default(),
            ))
            .await?;

        Ok(())
    }

    pub async fn set_title(db: &SurrealDbClient, id: &str, title: &str) -> Result<(), AppError> {
        let _episode: Option<Self> = db
            .update((Self::table_name(), id))
            .patch(PatchOp::replace("/title", title.to_owned()))
            .await?;

        Ok(())
    }

    pub async fn add_labels(
        db: &SurrealDbClient,
        id: &str,
        label_ids: Vec<String>,
    ) -> Result<(), AppError> {
        db.client
            .query(
                "UPDATE type::thing('episode', $id) \
                 SET label_ids = array::distinct(array::concat(label_ids, $labels));",
            )
            .bind(("id", id.to_owned()))
            .bind(("labels", label_ids))
            .await?
            .check()?;

        Ok(())
    }

    /// Highest version written for the session, if any.
    pub async fn latest_version(
        db: &SurrealDbClient,
        session_id: &str,
        user_id: &str,
    ) -> Result<Option<u32>, AppError> {
        #[derive(Deserialize)]
        struct Row {
            version: u32,
        }

        let mut response = db
            .client
            .query(
                "SELECT version FROM episode \
                 WHERE user_id = $user_id AND session_id = $session_id \
                 ORDER BY version DESC \
                 LIMIT 1;",
            )
            .bind(("user_id", user_id.to_owned()))
            .bind(("session_id", session_id.to_owned()))
            .await?;

        let rows: Vec<Row> = response.take(0)?;
        Ok(rows.into_iter().next().map(|row| row.version))
    }

    /// All chunks of one version, ordered by chunk index.
    pub async fn chunks_for_version(
        db: &SurrealDbClient,
        session_id: &str,
        version: u32,
        user_id: &str,
    ) -> Result<Vec<Self>, AppError> {
        let mut response = db
            .client
            .query(
                "SELECT * FROM episode \
                 WHERE user_id = $user_id AND session_id = $session_id AND version = $version \
                 ORDER BY chunk_index ASC;",
            )
            .bind(("user_id", user_id.to_owned()))
            .bind(("session_id", session_id.to_owned()))
            .bind(("version", version))
            .await?;

        Ok(response.take(0)?)
    }

    /// Chunk hash vector of the latest version, read from any of its rows.
    pub async fn latest_chunk_hashes(
        db: &SurrealDbClient,
        session_id: &str,
        user_id: &str,
    ) -> Result<Option<(u32, Vec<String>)>, AppError> {
        let Some(version) = Self::latest_version(db, session_id, user_id).await? else {
            return Ok(None);
        };

        let chunks = Self::chunks_for_version(db, session_id, version, user_id).await?;
        let hashes = chunks
            .first()
            .map(|chunk| chunk.chunk_hashes.clone())
            .unwrap_or_default();

        Ok(Some((version, hashes)))
    }

    /// Canonical view of a document session: for every chunk index the newest
    /// row, bounded by the latest version's chunk count so removed tail
    /// chunks drop out.
    pub async fn canonical_chunks(
        db: &SurrealDbClient,
        session_id: &str,
        user_id: &str,
    ) -> Result<Vec<Self>, AppError> {
        let all = Self::for_session(db, session_id, user_id).await?;
        let Some(latest_version) = all.iter().map(|episode| episode.version).max() else {
            return Ok(Vec::new());
        };

        let total = all
            .iter()
            .filter(|episode| episode.version == latest_version)
            .map(|episode| episode.total_chunks)
            .max()
            .unwrap_or(0);

        let mut newest: std::collections::HashMap<u32, Self> = std::collections::HashMap::new();
        for episode in all {
            if episode.chunk_index >= total {
                continue;
            }
            match newest.get(&episode.chunk_index) {
                Some(existing) if existing.version >= episode.version => {}
                _ => {
                    newest.insert(episode.chunk_index, episode);
                }
            }
        }

        let mut chunks: Vec<Self> = newest.into_values().collect();
        chunks.sort_by_key(|episode| episode.chunk_index);
        Ok(chunks)
    }

    /// Previous and next chunk within the same session version, used to
    /// hydrate retrieval results with surrounding context.
    pub async fn adjacent_chunks(
        &self,
        db: &SurrealDbClient,
    ) -> Result<(Option<Self>, Option<Self>), AppError> {
        let chunks =
            Self::chunks_for_version(db, &self.session_id, self.version, &self.user_id).await?;

        let previous = chunks
            .iter()
            .find(|chunk| self.chunk_index > 0 && chunk.chunk_index == self.chunk_index - 1)
            .cloned();
        let next = chunks
            .iter()
            .find(|chunk| chunk.chunk_index == self.chunk_index + 1)
            .cloned();

        Ok((previous, next))
    }

    pub async fn get_by_ids(
        db: &SurrealDbClient,
        ids: &[String],
        user_id: &str,
    ) -> Result<Vec<Self>, AppError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let things: Vec<Thing> = ids
            .iter()
            .map(|id| Thing::from((Self::table_name(), id.as_str())))
            .collect();

        let mut response = db
            .client
            .query("SELECT * FROM episode WHERE id IN $things AND user_id = $user_id;")
            .bind(("things", things))
            .bind(("user_id", user_id.to_owned()))
            .await?;

        Ok(response.take(0)?)
    }

    /// Every episode of a session regardless of version, for compaction and
    /// session-scoped search filters.
    pub async fn for_session(
        db: &SurrealDbClient,
        session_id: &str,
        user_id: &str,
    ) -> Result<Vec<Self>, AppError> {
        let mut response = db
            .client
            .query(
                "SELECT * FROM episode \
                 WHERE user_id = $user_id AND session_id = $session_id \
                 ORDER BY version ASC, chunk_index ASC;",
            )
            .bind(("user_id", user_id.to_owned()))
            .bind(("session_id", session_id.to_owned()))
            .await?;

        Ok(response.take(0)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(session: &str, version: u32, index: u32, total: u32) -> Episode {
        Episode::new(
            format!("content {index}"),
            format!("content {index}"),
            "core".into(),
            session.into(),
            EpisodeType::Document,
            index,
            total,
            version,
            format!("hash-{version}-{index}"),
            (0..total).map(|i| format!("hash-{version}-{i}")).collect(),
            Vec::new(),
            Utc::now(),
            "user-1".into(),
            None,
        )
    }

    async fn setup_db() -> SurrealDbClient {
        SurrealDbClient::memory("episode_test", &Uuid::new_v4().to_string())
            .await
            .expect("Failed to start in-memory surrealdb")
    }

    #[tokio::test]
    async fn latest_version_and_chunk_hashes() {
        let db = setup_db().await;

        for episode in [
            chunk("d1", 1, 0, 2),
            chunk("d1", 1, 1, 2),
            chunk("d1", 2, 0, 2),
            chunk("d1", 2, 1, 2),
        ] {
            db.store_item(episode).await.expect("store");
        }

        let latest = Episode::latest_version(&db, "d1", "user-1")
            .await
            .expect("query");
        assert_eq!(latest, Some(2));

        let (version, hashes) = Episode::latest_chunk_hashes(&db, "d1", "user-1")
            .await
            .expect("query")
            .expect("present");
        assert_eq!(version, 2);
        assert_eq!(hashes, vec!["hash-2-0".to_string(), "hash-2-1".to_string()]);

        assert!(Episode::latest_chunk_hashes(&db, "unknown", "user-1")
            .await
            .expect("query")
            .is_none());
    }

    #[tokio::test]
    async fn adjacent_chunks_respect_session_bounds() {
        let db = setup_db().await;

        let chunks = [chunk("d2", 1, 0, 3), chunk("d2", 1, 1, 3), chunk("d2", 1, 2, 3)];
        for episode in &chunks {
            db.store_item(episode.clone()).await.expect("store");
        }

        let (previous, next) = chunks[1].adjacent_chunks(&db).await.expect("query");
        assert_eq!(previous.map(|c| c.chunk_index), Some(0));
        assert_eq!(next.map(|c| c.chunk_index), Some(2));

        let (previous, next) = chunks[0].adjacent_chunks(&db).await.expect("query");
        assert!(previous.is_none());
        assert_eq!(next.map(|c| c.chunk_index), Some(1));
    }

    #[tokio::test]
    async fn canonical_chunks_take_newest_row_per_index() {
        let db = setup_db().await;

        // v1 has three chunks; v2 rewrites only chunk 1.
        for episode in [
            chunk("d4", 1, 0, 3),
            chunk("d4", 1, 1, 3),
            chunk("d4", 1, 2, 3),
            chunk("d4", 2, 1, 3),
        ] {
            db.store_item(episode).await.expect("store");
        }

        let canonical = Episode::canonical_chunks(&db, "d4", "user-1")
            .await
            .expect("query");
        assert_eq!(canonical.len(), 3);
        assert_eq!(canonical[0].version, 1);
        assert_eq!(canonical[1].version, 2);
        assert_eq!(canonical[2].version, 1);
    }

    #[tokio::test]
    async fn status_transitions_are_persisted() {
        let db = setup_db().await;
        let episode = chunk("d3", 1, 0, 1);
        let id = episode.id.clone();
        db.store_item(episode).await.expect("store");

        Episode::set_status(&db, &id, EpisodeStatus::Processing, None)
            .await
            .expect("processing");
        Episode::set_status(&db, &id, EpisodeStatus::Failed, Some("model refused".into()))
            .await
            .expect("failed");

        let stored: Episode = db.get_item(&id).await.expect("fetch").expect("present");
        assert_eq!(stored.status, EpisodeStatus::Failed);
        assert_eq!(stored.error.as_deref(), Some("model refused"));
    }
}
