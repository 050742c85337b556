//! SQLite connection pool.

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tracing::warn;

use crate::config::Config;

fn options(db_path: &Path) -> Result<SqliteConnectOptions> {
    Ok(
        SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal),
    )
}

/// Open the workspace database, loading the vector extension if one is
/// configured. An extension that fails to load is logged and the pool is
/// opened without it; schema setup then reports the vector index as
/// unavailable.
pub async fn connect(config: &Config) -> Result<SqlitePool> {
    let db_path = &config.db.path;

    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    if let Some(ref ext) = config.db.vector_extension {
        let with_ext = options(db_path)?.extension(ext.to_string_lossy().into_owned());
        match SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(with_ext)
            .await
        {
            Ok(pool) => return Ok(pool),
            Err(e) => warn!(
                extension = %ext.display(),
                error = %e,
                "vector extension failed to load, using fallback scan"
            ),
        }
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options(db_path)?)
        .await?;

    Ok(pool)
}
