//! SQLite connection setup for knowledge base files.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;

use crate::error::{RagError, Result};

/// Open the database at `path` in WAL mode. With `create` unset a missing
/// file is reported as [`RagError::NotFound`] instead of being created.
pub async fn connect(path: &Path, create: bool) -> Result<SqlitePool> {
    if create {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
    } else if !path.exists() {
        return Err(RagError::not_found(
            "knowledge base file",
            path.display().to_string(),
        ));
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(create)
        .journal_mode(SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await?;

    Ok(pool)
}
