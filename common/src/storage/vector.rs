use std::collections::HashSet;

use serde::Deserialize;
use surrealdb::sql::Thing;

use crate::{error::AppError, storage::db::SurrealDbClient};

use super::types::entity::deserialize_flexible_id;

/// Logical segments of the vector store. Identifiers are wire-level stable;
/// every row id equals the UUID of the owning graph node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VectorNamespace {
    Entity,
    Statement,
    Episode,
    CompactedSession,
    Label,
}

impl VectorNamespace {
    pub const ALL: [Self; 5] = [
        Self::Entity,
        Self::Statement,
        Self::Episode,
        Self::CompactedSession,
        Self::Label,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Entity => "entity",
            Self::Statement => "statement",
            Self::Episode => "episode",
            Self::CompactedSession => "compacted_session",
            Self::Label => "label",
        }
    }

    /// Embedding table backing the namespace.
    pub const fn table(self) -> &'static str {
        match self {
            Self::Entity => "entity_embedding",
            Self::Statement => "statement_embedding",
            Self::Episode => "episode_embedding",
            Self::CompactedSession => "compacted_session_embedding",
            Self::Label => "label_embedding",
        }
    }

    /// Graph node table the namespace mirrors.
    pub const fn node_table(self) -> &'static str {
        self.as_str()
    }
}

/// A scored id returned by vector search or batch scoring.
#[derive(Debug, Clone, Deserialize)]
pub struct VectorHit {
    #[serde(deserialize_with = "deserialize_flexible_id")]
    pub id: String,
    pub score: f32,
}

/// Insert or replace the vector for a node. Idempotent on id.
pub async fn upsert_vector(
    db: &SurrealDbClient,
    namespace: VectorNamespace,
    id: &str,
    embedding: Vec<f32>,
    user_id: &str,
) -> Result<(), AppError> {
    db.client
        .query(
            "UPSERT type::thing($table, $id) SET \
             embedding = $embedding, user_id = $user_id, updated_at = time::now();",
        )
        .bind(("table", namespace.table()))
        .bind(("id", id.to_owned()))
        .bind(("embedding", embedding))
        .bind(("user_id", user_id.to_owned()))
        .await?
        .check()?;

    Ok(())
}

/// Top-K cosine search within a namespace, scoped by user. Threshold
/// filtering is the caller's concern.
pub async fn search(
    db: &SurrealDbClient,
    namespace: VectorNamespace,
    query_embedding: Vec<f32>,
    take: usize,
    user_id: &str,
) -> Result<Vec<VectorHit>, AppError> {
    if take == 0 {
        return Ok(Vec::new());
    }

    let sql = format!(
        "SELECT id, vector::similarity::cosine(embedding, $embedding) AS score \
         FROM {table} \
         WHERE user_id = $user_id \
           AND embedding <|{take},100|> $embedding \
         ORDER BY score DESC \
         LIMIT {take};",
        table = namespace.table(),
        take = take,
    );

    let mut response = db
        .client
        .query(sql)
        .bind(("embedding", query_embedding))
        .bind(("user_id", user_id.to_owned()))
        .await?;

    Ok(response.take(0)?)
}

/// Score an explicit id set against a query embedding in one call. Used by
/// graph traversal, which never scores inside the traversal itself.
pub async fn batch_score(
    db: &SurrealDbClient,
    namespace: VectorNamespace,
    ids: &[String],
    query_embedding: Vec<f32>,
) -> Result<Vec<VectorHit>, AppError> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let things: Vec<Thing> = ids
        .iter()
        .map(|id| Thing::from((namespace.table(), id.as_str())))
        .collect();

    let mut response = db
        .client
        .query(
            "SELECT id, vector::similarity::cosine(embedding, $embedding) AS score \
             FROM type::table($table) \
             WHERE id IN $things \
             ORDER BY score DESC;",
        )
        .bind(("table", namespace.table()))
        .bind(("things", things))
        .bind(("embedding", query_embedding))
        .await?;

    Ok(response.take(0)?)
}

pub async fn delete_vector(
    db: &SurrealDbClient,
    namespace: VectorNamespace,
    id: &str,
) -> Result<(), AppError> {
    db.client
        .query("DELETE type::thing($table, $id);")
        .bind(("table", namespace.table()))
        .bind(("id", id.to_owned()))
        .await?
        .check()?;

    Ok(())
}

#[derive(Deserialize)]
struct IdRow {
    #[serde(deserialize_with = "deserialize_flexible_id")]
    id: String,
}

async fn table_ids(db: &SurrealDbClient, table: &str) -> Result<HashSet<String>, AppError> {
    let mut response = db
        .client
        .query("SELECT id FROM type::table($table);")
        .bind(("table", table.to_owned()))
        .await?;

    let rows: Vec<IdRow> = response.take(0)?;
    Ok(rows.into_iter().map(|row| row.id).collect())
}

/// Node UUIDs present in the graph but missing from the namespace.
pub async fn missing_vector_ids(
    db: &SurrealDbClient,
    namespace: VectorNamespace,
) -> Result<Vec<String>, AppError> {
    let nodes = table_ids(db, namespace.node_table()).await?;
    let vectors = table_ids(db, namespace.table()).await?;

    Ok(nodes.difference(&vectors).cloned().collect())
}

/// Vector row UUIDs whose graph node is gone; pruned on reconciliation.
pub async fn stale_vector_ids(
    db: &SurrealDbClient,
    namespace: VectorNamespace,
) -> Result<Vec<String>, AppError> {
    let nodes = table_ids(db, namespace.node_table()).await?;
    let vectors = table_ids(db, namespace.table()).await?;

    Ok(vectors.difference(&nodes).cloned().collect())
}
