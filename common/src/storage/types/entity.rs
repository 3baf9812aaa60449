use unicode_normalization::UnicodeNormalization;
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

/// Entity type marking a node that plays the relation role in a triple.
pub const PREDICATE_TYPE: &str = "Predicate";

stored_object!(Entity, "entity", {
    name: String,
    name_key: String,
    entity_type: String,
    attributes: Option<serde_json::Value>,
    user_id: String,
    workspace_id: Option<String>
});

/// Case-insensitive, width-normalized key used for per-user name dedup.
pub fn name_key(name: &str) -> String {
    name.nfkc()
        .collect::<String>()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

impl Entity {
    pub fn new(
        name: String,
        entity_type: String,
        attributes: Option<serde_json::Value>,
        user_id: String,
        workspace_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        let key = name_key(&name);
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            name,
            name_key: key,
            entity_type,
            attributes,
            user_id,
            workspace_id,
        }
    }

    pub fn is_predicate(&self) -> bool {
        self.entity_type == PREDICATE_TYPE
    }

    /// Exact-name lookup scoped by user. Returns the oldest match so the
    /// canonical UUID wins when duplicates have crept in.
    pub async fn find_exact(
        db: &SurrealDbClient,
        name: &str,
        user_id: &str,
    ) -> Result<Option<Self>, AppError> {
        let mut response = db
            .client
            .query(
                "SELECT * FROM entity \
                 WHERE user_id = $user_id AND name_key = $name_key \
                 ORDER BY created_at ASC \
                 LIMIT 1;",
            )
            .bind(("user_id", user_id.to_owned()))
            .bind(("name_key", name_key(name)))
            .await?;

        let rows: Vec<Self> = response.take(0)?;
        Ok(rows.into_iter().next())
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
            .query("SELECT * FROM entity WHERE id IN $things AND user_id = $user_id;")
            .bind(("things", things))
            .bind(("user_id", user_id.to_owned()))
            .await?;

        Ok(response.take(0)?)
    }

    /// All entities for a user, oldest first. Used by the dedup sweep.
    pub async fn all_for_user(db: &SurrealDbClient, user_id: &str) -> Result<Vec<Self>, AppError> {
        let mut response = db
            .client
            .query("SELECT * FROM entity WHERE user_id = $user_id ORDER BY created_at ASC;")
            .bind(("user_id", user_id.to_owned()))
            .await?;

        Ok(response.take(0)?)
    }

    /// Union attributes from `other` into this entity; on key conflicts the
    /// newer record wins.
    pub fn merged_attributes(&self, other: &Self) -> Option<serde_json::Value> {
        let (older, newer) = if self.created_at <= other.created_at {
            (self, other)
        } else {
            (other, self)
        };

        match (older.attributes.as_ref(), newer.attributes.as_ref()) {
            (None, None) => None,
            (Some(attrs), None) | (None, Some(attrs)) => Some(attrs.clone()),
            (Some(older_attrs), Some(newer_attrs)) => {
                let mut merged = older_attrs
                    .as_object()
                    .cloned()
                    .unwrap_or_default();
                if let Some(map) = newer_attrs.as_object() {
                    for (key, value) in map {
                        merged.insert(key.clone(), value.clone());
                    }
                }
                Some(serde_json::Value::Object(merged))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn name_key_folds_case_and_whitespace() {
        assert_eq!(name_key("Sam Altman"), "sam altman");
        assert_eq!(name_key("  sam   ALTMAN  "), "sam altman");
        assert_eq!(name_key("ＳＡＭ"), "sam");
    }

    #[test]
    fn merged_attributes_newer_wins_on_conflicts() {
        let mut older = Entity::new(
            "Alice".into(),
            "Person".into(),
            Some(json!({"role": "engineer", "city": "Oslo"})),
            "user-1".into(),
            None,
        );
        let mut newer = Entity::new(
            "alice".into(),
            "Person".into(),
            Some(json!({"role": "manager"})),
            "user-1".into(),
            None,
        );
        older.created_at = Utc::now() - chrono::Duration::days(1);
        newer.created_at = Utc::now();

        let merged = older.merged_attributes(&newer).expect("merged");
        assert_eq!(merged["role"], "manager");
        assert_eq!(merged["city"], "Oslo");
    }

    #[tokio::test]
    async fn find_exact_is_case_insensitive_and_prefers_oldest() {
        let db = SurrealDbClient::memory("entity_test", &Uuid::new_v4().to_string())
            .await
            .expect("Failed to start in-memory surrealdb");

        let mut first = Entity::new("Sam Altman".into(), "Person".into(), None, "user-1".into(), None);
        first.created_at = Utc::now() - chrono::Duration::days(2);
        let second = Entity::new("sam altman".into(), "Person".into(), None, "user-1".into(), None);

        db.store_item(first.clone()).await.expect("store first");
        db.store_item(second).await.expect("store second");

        let found = Entity::find_exact(&db, "SAM ALTMAN", "user-1")
            .await
            .expect("lookup")
            .expect("present");
        assert_eq!(found.id, first.id);

        let other_user = Entity::find_exact(&db, "Sam Altman", "user-2")
            .await
            .expect("lookup");
        assert!(other_user.is_none());
    }
}
