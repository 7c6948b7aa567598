//! Versioned schema for knowledge base databases.
//!
//! Each database records its layout version in `schema_meta`. Opening an
//! older file upgrades it step by step inside one transaction before any
//! row is read; a file written by a newer build is refused with
//! [`RagError::SchemaMigrationFailed`] rather than misread.
//!
//! | Version | Change |
//! |---------|--------|
//! | 1 | manifest, sources, documents, chunks with vectors |
//! | 2 | `sources.tags`, `sources.forgotten`, `chunks.overlaps_previous` |

use sqlx::SqlitePool;
use tracing::info;

use crate::error::{RagError, Result};

pub const SCHEMA_VERSION: i64 = 2;

const CREATE_META: &str = r#"
    CREATE TABLE IF NOT EXISTS schema_meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )
"#;

const CREATE_MANIFEST: &str = r#"
    CREATE TABLE IF NOT EXISTS manifest (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        name TEXT NOT NULL,
        embedding_provider TEXT NOT NULL,
        embedding_model TEXT NOT NULL,
        dims INTEGER NOT NULL,
        chunk_size INTEGER NOT NULL,
        chunk_overlap INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        modified_at INTEGER NOT NULL
    )
"#;

const CREATE_DOCUMENTS: &str = r#"
    CREATE TABLE IF NOT EXISTS documents (
        id TEXT PRIMARY KEY,
        source_id TEXT NOT NULL,
        location TEXT NOT NULL,
        relative_path TEXT NOT NULL,
        source_type TEXT NOT NULL,
        content_type TEXT NOT NULL DEFAULT 'text/plain',
        content_hash TEXT NOT NULL,
        ingested_at INTEGER NOT NULL,
        modified_at INTEGER NOT NULL,
        body TEXT NOT NULL,
        UNIQUE(source_id, relative_path),
        FOREIGN KEY (source_id) REFERENCES sources(id)
    )
"#;

/// Layout of the first release; kept so upgrades can be tested.
pub(crate) const SCHEMA_V1: &[&str] = &[
    CREATE_META,
    CREATE_MANIFEST,
    r#"
    CREATE TABLE IF NOT EXISTS sources (
        id TEXT PRIMARY KEY,
        location TEXT NOT NULL,
        source_type TEXT NOT NULL,
        added_at INTEGER NOT NULL,
        refreshed_at INTEGER
    )
    "#,
    CREATE_DOCUMENTS,
    r#"
    CREATE TABLE IF NOT EXISTS chunks (
        id TEXT PRIMARY KEY,
        document_id TEXT NOT NULL,
        ordinal INTEGER NOT NULL,
        start_offset INTEGER NOT NULL,
        end_offset INTEGER NOT NULL,
        text TEXT NOT NULL,
        char_count INTEGER NOT NULL,
        hash TEXT NOT NULL,
        vector BLOB NOT NULL,
        UNIQUE(document_id, ordinal),
        FOREIGN KEY (document_id) REFERENCES documents(id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_chunks_document_id ON chunks(document_id)",
    "CREATE INDEX IF NOT EXISTS idx_documents_source_id ON documents(source_id)",
];

/// Statements that take version `n - 1` to version `n`.
const UPGRADES: &[(i64, &[&str])] = &[(
    2,
    &[
        "ALTER TABLE sources ADD COLUMN tags TEXT NOT NULL DEFAULT '[]'",
        "ALTER TABLE sources ADD COLUMN forgotten TEXT NOT NULL DEFAULT '[]'",
        "ALTER TABLE chunks ADD COLUMN overlaps_previous INTEGER NOT NULL DEFAULT 0",
        "UPDATE chunks SET overlaps_previous = CASE WHEN ordinal > 0 THEN 1 ELSE 0 END",
    ],
)];

/// Create the schema at the current version, or upgrade an existing one.
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    if schema_version(pool).await?.is_none() {
        create_at_version(pool, 1).await?;
    }
    migrate(pool).await?;
    Ok(())
}

pub(crate) async fn create_at_version(pool: &SqlitePool, version: i64) -> Result<()> {
    let mut tx = pool.begin().await?;
    for stmt in SCHEMA_V1 {
        sqlx::query(stmt).execute(&mut *tx).await?;
    }
    sqlx::query("INSERT OR REPLACE INTO schema_meta (key, value) VALUES ('schema_version', ?)")
        .bind(version.to_string())
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

/// The stored schema version, or `None` for a database without one.
pub async fn schema_version(pool: &SqlitePool) -> Result<Option<i64>> {
    let has_meta: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='schema_meta'",
    )
    .fetch_one(pool)
    .await?;
    if !has_meta {
        return Ok(None);
    }
    let value: Option<String> =
        sqlx::query_scalar("SELECT value FROM schema_meta WHERE key = 'schema_version'")
            .fetch_optional(pool)
            .await?;
    match value {
        None => Ok(None),
        Some(v) => v
            .parse::<i64>()
            .map(Some)
            .map_err(|_| RagError::corruption(format!("unreadable schema_version '{}'", v))),
    }
}

/// Bring the database up to [`SCHEMA_VERSION`]. Returns the version found.
pub async fn migrate(pool: &SqlitePool) -> Result<i64> {
    let found = schema_version(pool)
        .await?
        .ok_or_else(|| RagError::corruption("database has no schema_version"))?;
    if found > SCHEMA_VERSION {
        return Err(RagError::SchemaMigrationFailed(format!(
            "schema version {} is newer than supported version {}",
            found, SCHEMA_VERSION
        )));
    }
    if found < 1 {
        return Err(RagError::SchemaMigrationFailed(format!(
            "unknown schema version {}",
            found
        )));
    }
    if found == SCHEMA_VERSION {
        return Ok(found);
    }

    let mut tx = pool.begin().await?;
    for (version, stmts) in UPGRADES.iter().filter(|(v, _)| *v > found) {
        for stmt in *stmts {
            sqlx::query(stmt).execute(&mut *tx).await.map_err(|e| {
                RagError::SchemaMigrationFailed(format!("upgrade to v{}: {}", version, e))
            })?;
        }
    }
    sqlx::query("UPDATE schema_meta SET value = ? WHERE key = 'schema_version'")
        .bind(SCHEMA_VERSION.to_string())
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    info!(from = found, to = SCHEMA_VERSION, "migrated knowledge base schema");
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_fresh_schema_is_current() {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect(&tmp.path().join("kb.sqlite"), true).await.unwrap();
        create_schema(&pool).await.unwrap();
        assert_eq!(schema_version(&pool).await.unwrap(), Some(SCHEMA_VERSION));
        // Idempotent.
        assert_eq!(migrate(&pool).await.unwrap(), SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn test_v1_upgrade_backfills_overlap_flag() {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect(&tmp.path().join("kb.sqlite"), true).await.unwrap();
        create_at_version(&pool, 1).await.unwrap();
        for ordinal in 0..3i64 {
            sqlx::query(
                "INSERT INTO chunks (id, document_id, ordinal, start_offset, end_offset, text, char_count, hash, vector) \
                 VALUES (?, 'd', ?, 0, 1, 'x', 1, 'h', x'00000000')",
            )
            .bind(format!("d#{}", ordinal))
            .bind(ordinal)
            .execute(&pool)
            .await
            .unwrap();
        }

        assert_eq!(migrate(&pool).await.unwrap(), 1);
        let flags: Vec<i64> =
            sqlx::query_scalar("SELECT overlaps_previous FROM chunks ORDER BY ordinal")
                .fetch_all(&pool)
                .await
                .unwrap();
        assert_eq!(flags, vec![0, 1, 1]);
        let tags: String = sqlx::query_scalar("SELECT COALESCE((SELECT tags FROM sources LIMIT 1), '[]')")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(tags, "[]");
    }

    #[tokio::test]
    async fn test_newer_version_refused() {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect(&tmp.path().join("kb.sqlite"), true).await.unwrap();
        create_at_version(&pool, SCHEMA_VERSION + 1).await.unwrap();
        assert!(matches!(
            migrate(&pool).await,
            Err(RagError::SchemaMigrationFailed(_))
        ));
    }
}
