use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

use super::statement::edge_id;

stored_object!(CompactedSession, "compacted_session", {
    session_id: String,
    summary: String,
    episode_count: u32,
    #[serde(serialize_with = "serialize_datetime", deserialize_with = "deserialize_datetime", default)]
    started_at: DateTime<Utc>,
    #[serde(serialize_with = "serialize_datetime", deserialize_with = "deserialize_datetime", default)]
    ended_at: DateTime<Utc>,
    compression_ratio: f32,
    user_id: String,
    workspace_id: Option<String>
});

impl CompactedSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: String,
        summary: String,
        episode_count: u32,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        compression_ratio: f32,
        user_id: String,
        workspace_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            session_id,
            summary,
            episode_count,
            started_at,
            ended_at,
            compression_ratio,
            user_id,
            workspace_id,
        }
    }

    /// Link the summary to the episodes it compacts.
    pub async fn relate_episodes(
        &self,
        db: &SurrealDbClient,
        episode_ids: &[String],
    ) -> Result<(), AppError> {
        for episode_id in episode_ids {
            db.client
                .query(
                    r#"BEGIN TRANSACTION;
                    LET $summary = type::thing('compacted_session', $summary_id);
                    LET $episode = type::thing('episode', $episode_id);
                    LET $edge = type::thing('compacts', $edge_id);
                    DELETE type::thing('compacts', $edge_id);
                    RELATE $summary->$edge->$episode SET metadata.user_id = $user_id;
                    COMMIT TRANSACTION;"#,
                )
                .bind(("summary_id", self.id.clone()))
                .bind(("episode_id", episode_id.clone()))
                .bind(("edge_id", edge_id(&self.id, "compacts", episode_id)))
                .bind(("user_id", self.user_id.clone()))
                .await?
                .check()?;
        }

        Ok(())
    }

    pub async fn find_by_session(
        db: &SurrealDbClient,
        session_id: &str,
        user_id: &str,
    ) -> Result<Option<Self>, AppError> {
        let mut response = db
            .client
            .query(
                "SELECT * FROM compacted_session \
                 WHERE user_id = $user_id AND session_id = $session_id \
                 LIMIT 1;",
            )
            .bind(("user_id", user_id.to_owned()))
            .bind(("session_id", session_id.to_owned()))
            .await?;

        let rows: Vec<Self> = response.take(0)?;
        Ok(rows.into_iter().next())
    }
}
