use anyhow::{Context, Result};
use tracing::warn;

use crate::{error::AppError, storage::db::SurrealDbClient, storage::vector::VectorNamespace};

const FTS_ANALYZER_NAME: &str = "app_en_fts_analyzer";

#[derive(Clone, Copy)]
struct FtsIndexSpec {
    index_name: &'static str,
    table: &'static str,
    field: &'static str,
}

const fn fts_index_specs() -> [FtsIndexSpec; 1] {
    [FtsIndexSpec {
        index_name: "statement_fact_fts_idx",
        table: "statement",
        field: "fact",
    }]
}

/// Plain lookup indexes used by the hot ingest and claim paths.
const PLAIN_INDEXES: &[&str] = &[
    "DEFINE INDEX IF NOT EXISTS entity_name_key_idx ON TABLE entity FIELDS user_id, name_key;",
    "DEFINE INDEX IF NOT EXISTS episode_session_idx ON TABLE episode FIELDS user_id, session_id;",
    "DEFINE INDEX IF NOT EXISTS statement_subject_idx ON TABLE statement FIELDS user_id, subject_id;",
    "DEFINE INDEX IF NOT EXISTS statement_triple_idx ON TABLE statement FIELDS subject_id, predicate_id, object_id;",
    "DEFINE INDEX IF NOT EXISTS queue_job_state_idx ON TABLE queue_job FIELDS queue, state;",
    "DEFINE INDEX IF NOT EXISTS queue_job_key_idx ON TABLE queue_job FIELDS queue, serialization_key;",
    "DEFINE INDEX IF NOT EXISTS queue_job_idem_idx ON TABLE queue_job FIELDS idempotency_key;",
    "DEFINE INDEX IF NOT EXISTS label_name_idx ON TABLE label FIELDS user_id, name;",
];

/// Build runtime Surreal indexes (plain + FTS + HNSW). Idempotent: safe to
/// call multiple times; HNSW definitions are overwritten when the embedding
/// dimension changes.
pub async fn ensure_runtime_indexes(
    db: &SurrealDbClient,
    embedding_dimension: usize,
) -> Result<(), AppError> {
    ensure_runtime_indexes_inner(db, embedding_dimension)
        .await
        .map_err(|err| AppError::InternalError(err.to_string()))
}

async fn ensure_runtime_indexes_inner(
    db: &SurrealDbClient,
    embedding_dimension: usize,
) -> Result<()> {
    create_fts_analyzer(db).await?;

    for definition in PLAIN_INDEXES {
        db.client
            .query(*definition)
            .await
            .with_context(|| format!("defining index: {definition}"))?
            .check()
            .with_context(|| format!("index definition rejected: {definition}"))?;
    }

    for spec in fts_index_specs() {
        let definition = format!(
            "DEFINE INDEX IF NOT EXISTS {index} ON TABLE {table} FIELDS {field} \
             SEARCH ANALYZER {analyzer} BM25;",
            index = spec.index_name,
            table = spec.table,
            field = spec.field,
            analyzer = FTS_ANALYZER_NAME,
        );
        db.client
            .query(definition)
            .await
            .with_context(|| format!("defining FTS index {}", spec.index_name))?
            .check()
            .with_context(|| format!("FTS index definition rejected: {}", spec.index_name))?;
    }

    for namespace in VectorNamespace::ALL {
        let definition = format!(
            "DEFINE INDEX OVERWRITE idx_embedding_{table} ON TABLE {table} \
             FIELDS embedding HNSW DIMENSION {dimension} DIST COSINE TYPE F32 EFC 100 M 8;",
            table = namespace.table(),
            dimension = embedding_dimension,
        );
        db.client
            .query(definition)
            .await
            .with_context(|| format!("defining HNSW index on {}", namespace.table()))?
            .check()
            .with_context(|| format!("HNSW definition rejected on {}", namespace.table()))?;
    }

    Ok(())
}

/// Rebuild the statement FTS index after bulk writes so BM25 scores pick up
/// the new rows.
pub async fn rebuild_fts_indexes(db: &SurrealDbClient) -> Result<(), AppError> {
    for spec in fts_index_specs() {
        db.client
            .query(format!(
                "REBUILD INDEX IF EXISTS {index} ON {table};",
                index = spec.index_name,
                table = spec.table,
            ))
            .await?;
    }

    Ok(())
}

async fn create_fts_analyzer(db: &SurrealDbClient) -> Result<()> {
    // Prefer snowball stemming when supported; fall back to ascii-only when
    // the filter is unavailable in the running Surreal build.
    let snowball_query = format!(
        "DEFINE ANALYZER IF NOT EXISTS {analyzer}
            TOKENIZERS class
            FILTERS lowercase, ascii, snowball(english);",
        analyzer = FTS_ANALYZER_NAME
    );

    match db.client.query(snowball_query).await {
        Ok(res) => {
            if res.check().is_ok() {
                return Ok(());
            }
            warn!(
                "Snowball analyzer check failed; attempting ascii fallback definition (analyzer: {})",
                FTS_ANALYZER_NAME
            );
        }
        Err(err) => {
            warn!(
                error = %err,
                "Snowball analyzer creation errored; attempting ascii fallback definition"
            );
        }
    }

    let fallback_query = format!(
        "DEFINE ANALYZER IF NOT EXISTS {analyzer}
            TOKENIZERS class
            FILTERS lowercase, ascii;",
        analyzer = FTS_ANALYZER_NAME
    );

    db.client
        .query(fallback_query)
        .await
        .context("creating fallback FTS analyzer")?
        .check()
        .context("failed to create fallback FTS analyzer")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn ensure_runtime_indexes_is_idempotent() {
        let namespace = "idx_test";
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory(namespace, database)
            .await
            .expect("Failed to start in-memory surrealdb");

        ensure_runtime_indexes(&db, 3)
            .await
            .expect("first index build");
        ensure_runtime_indexes(&db, 3)
            .await
            .expect("second index build");
    }

    #[tokio::test]
    async fn dimension_change_overwrites_hnsw_definitions() {
        let namespace = "idx_test";
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory(namespace, database)
            .await
            .expect("Failed to start in-memory surrealdb");

        ensure_runtime_indexes(&db, 3).await.expect("dimension 3");
        ensure_runtime_indexes(&db, 8).await.expect("dimension 8");
    }
}
