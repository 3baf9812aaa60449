use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

stored_object!(Label, "label", {
    name: String,
    description: Option<String>,
    user_id: String
});

impl Label {
    pub fn new(name: String, description: Option<String>, user_id: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            name,
            description,
            user_id,
        }
    }

    /// Text used for the label vector; name plus optional description.
    pub fn embedding_input(&self) -> String {
        match &self.description {
            Some(description) => format!("{}: {}", self.name, description),
            None => self.name.clone(),
        }
    }

    pub async fn all_for_user(db: &SurrealDbClient, user_id: &str) -> Result<Vec<Self>, AppError> {
        let mut response = db
            .client
            .query("SELECT * FROM label WHERE user_id = $user_id ORDER BY name ASC;")
            .bind(("user_id", user_id.to_owned()))
            .await?;

        Ok(response.take(0)?)
    }
}
