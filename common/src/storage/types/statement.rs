use surrealdb::opt::PatchOp;
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

/// Classification of a statement's nature; controls invalidation rules.
/// Unknown values from foreign payloads degrade to `Attribute`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Aspect {
    Event,
    Preference,
    Relationship,
    Observation,
    #[serde(other)]
    Attribute,
}

impl Aspect {
    /// Aspects whose statements coexist rather than invalidate each other.
    pub fn coexists(self) -> bool {
        matches!(self, Self::Event | Self::Observation)
    }
}

impl Default for Aspect {
    fn default() -> Self {
        Self::Attribute
    }
}

stored_object!(Statement, "statement", {
    fact: String,
    subject_id: String,
    predicate_id: String,
    object_id: String,
    #[serde(default)]
    aspect: Aspect,
    #[serde(serialize_with = "serialize_datetime", deserialize_with = "deserialize_datetime", default)]
    valid_at: DateTime<Utc>,
    #[serde(serialize_with = "serialize_option_datetime", deserialize_with = "deserialize_option_datetime", default)]
    invalid_at: Option<DateTime<Utc>>,
    invalidated_by: Option<String>,
    attributes: Option<serde_json::Value>,
    user_id: String,
    workspace_id: Option<String>
});

/// Role played by an entity in a statement; doubles as the edge table name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Subject,
    Predicate,
    Object,
}

impl Role {
    pub const ALL: [Self; 3] = [Self::Subject, Self::Predicate, Self::Object];

    pub const fn edge_table(self) -> &'static str {
        match self {
            Self::Subject => "has_subject",
            Self::Predicate => "has_predicate",
            Self::Object => "has_object",
        }
    }
}

pub const PROVENANCE_EDGE_TABLE: &str = "has_provenance";

/// Deterministic edge id so repeated writes of the same edge are idempotent.
pub fn edge_id(from: &str, table: &str, to: &str) -> String {
    Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        format!("{from}:{table}:{to}").as_bytes(),
    )
    .to_string()
}

/// BM25 hit over the statement fact index.
#[derive(Debug, Deserialize)]
pub struct StatementFtsResult {
    #[serde(deserialize_with = "deserialize_flexible_id")]
    pub id: String,
    pub score: f32,
}

impl Statement {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fact: String,
        subject_id: String,
        predicate_id: String,
        object_id: String,
        aspect: Aspect,
        valid_at: DateTime<Utc>,
        attributes: Option<serde_json::Value>,
        user_id: String,
        workspace_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            fact,
            subject_id,
            predicate_id,
            object_id,
            aspect,
            valid_at,
            invalid_at: None,
            invalidated_by: None,
            attributes,
            user_id,
            workspace_id,
        }
    }

    pub fn triple(&self) -> (&str, &str, &str) {
        (&self.subject_id, &self.predicate_id, &self.object_id)
    }

    /// Write the three role edges for this statement. DELETE + RELATE on a
    /// deterministic id keeps re-execution idempotent.
    pub async fn relate_roles(&self, db: &SurrealDbClient) -> Result<(), AppError> {
        for (role, entity_id) in [
            (Role::Subject, &self.subject_id),
            (Role::Predicate, &self.predicate_id),
            (Role::Object, &self.object_id),
        ] {
            let table = role.edge_table();
            let query = format!(
                r#"BEGIN TRANSACTION;
                LET $stmt = type::thing('statement', $statement_id);
                LET $entity = type::thing('entity', $entity_id);
                LET $edge = type::thing('{table}', $edge_id);
                DELETE type::thing('{table}', $edge_id);
                RELATE $stmt->$edge->$entity SET metadata.user_id = $user_id;
                COMMIT TRANSACTION;"#
            );

            db.client
                .query(query)
                .bind(("statement_id", self.id.clone()))
                .bind(("entity_id", entity_id.clone()))
                .bind(("edge_id", edge_id(&self.id, table, entity_id)))
                .bind(("user_id", self.user_id.clone()))
                .await?
                .check()?;
        }

        Ok(())
    }

    /// Link an episode to this statement as provenance. Also used to absorb
    /// the provenance of a deduplicated candidate.
    pub async fn add_provenance(
        &self,
        db: &SurrealDbClient,
        episode_id: &str,
    ) -> Result<(), AppError> {
        db.client
            .query(
                r#"BEGIN TRANSACTION;
                LET $episode = type::thing('episode', $episode_id);
                LET $stmt = type::thing('statement', $statement_id);
                LET $edge = type::thing('has_provenance', $edge_id);
                DELETE type::thing('has_provenance', $edge_id);
                RELATE $episode->$edge->$stmt SET metadata.user_id = $user_id;
                COMMIT TRANSACTION;"#,
            )
            .bind(("episode_id", episode_id.to_owned()))
            .bind(("statement_id", self.id.clone()))
            .bind((
                "edge_id",
                edge_id(episode_id, PROVENANCE_EDGE_TABLE, &self.id),
            ))
            .bind(("user_id", self.user_id.clone()))
            .await?
            .check()?;

        Ok(())
    }

    pub async fn provenance_count(db: &SurrealDbClient, id: &str) -> Result<usize, AppError> {
        #[derive(Deserialize)]
        struct Row {
            total: usize,
        }

        let mut response = db
            .client
            .query(
                "SELECT count() AS total FROM has_provenance \
                 WHERE out = type::thing('statement', $id) \
                 GROUP ALL;",
            )
            .bind(("id", id.to_owned()))
            .await?;

        let rows: Vec<Row> = response.take(0)?;
        Ok(rows.into_iter().next().map_or(0, |row| row.total))
    }

    /// Episode ids holding provenance for this statement.
    pub async fn provenance_episode_ids(
        db: &SurrealDbClient,
        id: &str,
    ) -> Result<Vec<String>, AppError> {
        #[derive(Deserialize)]
        struct Row {
            #[serde(rename = "in", deserialize_with = "deserialize_flexible_id")]
            in_: String,
        }

        let mut response = db
            .client
            .query(
                "SELECT in FROM has_provenance \
                 WHERE out = type::thing('statement', $id);",
            )
            .bind(("id", id.to_owned()))
            .await?;

        let rows: Vec<Row> = response.take(0)?;
        Ok(rows.into_iter().map(|row| row.in_).collect())
    }

    /// Currently-valid statements sharing subject and predicate.
    pub async fn active_for_subject_predicate(
        db: &SurrealDbClient,
        subject_id: &str,
        predicate_id: &str,
        user_id: &str,
    ) -> Result<Vec<Self>, AppError> {
        let mut response = db
            .client
            .query(
                "SELECT * FROM statement \
                 WHERE user_id = $user_id \
                   AND subject_id = $subject_id \
                   AND predicate_id = $predicate_id \
                   AND (invalid_at IS NONE OR invalid_at IS NULL) \
                 ORDER BY created_at ASC;",
            )
            .bind(("user_id", user_id.to_owned()))
            .bind(("subject_id", subject_id.to_owned()))
            .bind(("predicate_id", predicate_id.to_owned()))
            .await?;

        Ok(response.take(0)?)
    }

    /// Currently-valid statements sharing subject and object under another
    /// predicate: the relationship-shift case.
    pub async fn active_for_subject_object(
        db: &SurrealDbClient,
        subject_id: &str,
        object_id: &str,
        exclude_predicate_id: &str,
        user_id: &str,
    ) -> Result<Vec<Self>, AppError> {
        let mut response = db
            .client
            .query(
                "SELECT * FROM statement \
                 WHERE user_id = $user_id \
                   AND subject_id = $subject_id \
                   AND object_id = $object_id \
                   AND predicate_id != $predicate_id \
                   AND (invalid_at IS NONE OR invalid_at IS NULL) \
                 ORDER BY created_at ASC;",
            )
            .bind(("user_id", user_id.to_owned()))
            .bind(("subject_id", subject_id.to_owned()))
            .bind(("object_id", object_id.to_owned()))
            .bind(("predicate_id", exclude_predicate_id.to_owned()))
            .await?;

        Ok(response.take(0)?)
    }

    /// Close the validity interval. The statement is retained for historical
    /// queries; only `invalid_at` and `invalidated_by` ever mutate.
    pub async fn invalidate(
        db: &SurrealDbClient,
        id: &str,
        invalid_at: DateTime<Utc>,
        invalidated_by: &str,
    ) -> Result<(), AppError> {
        let _statement: Option<Self> = db
            .update((Self::table_name(), id))
            .patch(PatchOp::replace(
                "/invalid_at",
                surrealdb::sql::Datetime::from(invalid_at),
            ))
            .patch(PatchOp::replace(
                "/invalidated_by",
                invalidated_by.to_owned(),
            ))
            .patch(PatchOp::replace(
                "/updated_at",
                surrealdb::sql::Datetime::default(),
            ))
            .await?;

        Ok(())
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
            .query("SELECT * FROM statement WHERE id IN $things AND user_id = $user_id;")
            .bind(("things", things))
            .bind(("user_id", user_id.to_owned()))
            .await?;

        Ok(response.take(0)?)
    }

    /// Statement ids linked to an episode through provenance.
    pub async fn ids_for_episode(
        db: &SurrealDbClient,
        episode_id: &str,
    ) -> Result<Vec<String>, AppError> {
        #[derive(Deserialize)]
        struct Row {
            #[serde(deserialize_with = "deserialize_flexible_id")]
            out: String,
        }

        let mut response = db
            .client
            .query(
                "SELECT out FROM has_provenance \
                 WHERE in = type::thing('episode', $episode_id);",
            )
            .bind(("episode_id", episode_id.to_owned()))
            .await?;

        let rows: Vec<Row> = response.take(0)?;
        Ok(rows.into_iter().map(|row| row.out).collect())
    }

    /// BM25 fulltext search over the fact index, scoped by user.
    pub async fn search_facts(
        db: &SurrealDbClient,
        terms: &str,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<StatementFtsResult>, AppError> {
        let mut response = db
            .client
            .query(
                "SELECT id, \
                 (IF search::score(0) != NONE THEN search::score(0) ELSE 0 END) AS score \
                 FROM statement \
                 WHERE fact @0@ $terms \
                   AND user_id = $user_id \
                 ORDER BY score DESC \
                 LIMIT $limit;",
            )
            .bind(("terms", terms.to_owned()))
            .bind(("user_id", user_id.to_owned()))
            .bind(("limit", limit as i64))
            .await?;

        Ok(response.take(0)?)
    }

    /// Delete the statement together with its role and provenance edges, and
    /// its vector row. Used by episode deletion cascades.
    pub async fn delete_with_edges(db: &SurrealDbClient, id: &str) -> Result<(), AppError> {
        db.client
            .query(
                "BEGIN TRANSACTION;
                 LET $stmt = type::thing('statement', $id);
                 DELETE has_subject WHERE in = $stmt;
                 DELETE has_predicate WHERE in = $stmt;
                 DELETE has_object WHERE in = $stmt;
                 DELETE has_provenance WHERE out = $stmt;
                 DELETE $stmt;
                 DELETE type::thing('statement_embedding', $id);
                 COMMIT TRANSACTION;",
            )
            .bind(("id", id.to_owned()))
            .await?
            .check()?;

        Ok(())
    }
}
