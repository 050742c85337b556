//! Schema creation and migration.
//!
//! Every statement is create-if-absent, so [`ensure_schema`] can run on
//! every open. Columns added after the first release are applied through
//! a `PRAGMA table_info` check, since SQLite has no
//! `ADD COLUMN IF NOT EXISTS`. The schema version is recorded in
//! `PRAGMA user_version`.
//!
//! The keyword index (`chunks_fts`) and native vector index (`chunks_vec`)
//! are optional: a failure to create either is reported in
//! [`SchemaStatus`] and the engine degrades instead of failing.

use anyhow::Result;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{debug, warn};

use crate::config::Config;
use crate::db;

/// Current schema version.
pub const SCHEMA_VERSION: i64 = 2;

/// Which optional indexes are usable after schema setup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchemaStatus {
    pub fts_available: bool,
    pub fts_error: Option<String>,
    pub vector_available: bool,
    pub vector_error: Option<String>,
}

const CORE_TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS files (
        path TEXT PRIMARY KEY,
        source TEXT NOT NULL DEFAULT 'memory',
        hash TEXT NOT NULL,
        mtime INTEGER NOT NULL,
        size INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS chunks (
        id TEXT PRIMARY KEY,
        path TEXT NOT NULL,
        source TEXT NOT NULL DEFAULT 'memory',
        start_line INTEGER NOT NULL,
        end_line INTEGER NOT NULL,
        hash TEXT NOT NULL,
        model TEXT NOT NULL,
        text TEXT NOT NULL,
        embedding BLOB,
        updated_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_chunks_path ON chunks(path)",
    "CREATE INDEX IF NOT EXISTS idx_chunks_source ON chunks(source)",
    r#"
    CREATE TABLE IF NOT EXISTS embedding_cache (
        provider TEXT NOT NULL,
        model TEXT NOT NULL,
        provider_key TEXT NOT NULL,
        hash TEXT NOT NULL,
        embedding BLOB NOT NULL,
        dims INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (provider, model, provider_key, hash)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_embedding_cache_updated_at ON embedding_cache(updated_at)",
    r#"
    CREATE TABLE IF NOT EXISTS claims (
        id TEXT PRIMARY KEY,
        text TEXT NOT NULL,
        claim_type TEXT NOT NULL,
        scope TEXT NOT NULL,
        task_id TEXT,
        status TEXT NOT NULL DEFAULT 'unverified',
        confidence REAL NOT NULL,
        evidence_refs TEXT NOT NULL DEFAULT '[]',
        source_path TEXT,
        source_start_line INTEGER,
        source_end_line INTEGER,
        embedding BLOB,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_claims_scope ON claims(scope)",
    "CREATE INDEX IF NOT EXISTS idx_claims_status ON claims(status)",
    "CREATE INDEX IF NOT EXISTS idx_claims_task_id ON claims(task_id)",
    r#"
    CREATE TABLE IF NOT EXISTS qa_pairs (
        id TEXT PRIMARY KEY,
        question TEXT NOT NULL,
        answer TEXT NOT NULL,
        question_embedding BLOB,
        session_key TEXT,
        task_id TEXT,
        claim_refs TEXT NOT NULL DEFAULT '[]',
        chunk_refs TEXT NOT NULL DEFAULT '[]',
        model TEXT,
        feedback TEXT,
        created_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_qa_pairs_session_key ON qa_pairs(session_key)",
    "CREATE INDEX IF NOT EXISTS idx_qa_pairs_task_id ON qa_pairs(task_id)",
    r#"
    CREATE TABLE IF NOT EXISTS pins (
        id TEXT PRIMARY KEY,
        text TEXT NOT NULL,
        pin_type TEXT NOT NULL DEFAULT 'default',
        scope TEXT NOT NULL DEFAULT 'global',
        task_id TEXT,
        created_at INTEGER NOT NULL,
        expires_at INTEGER
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_pins_expires_at ON pins(expires_at)",
    r#"
    CREATE TABLE IF NOT EXISTS transient_items (
        id TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        content TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_transient_items_created_at ON transient_items(created_at)",
];

/// Columns added after version 1: `(table, column, definition)`.
const ADDITIVE_COLUMNS: &[(&str, &str, &str)] = &[("qa_pairs", "correction", "TEXT")];

/// Check if a column exists in a table.
async fn column_exists(pool: &SqlitePool, table: &str, column: &str) -> Result<bool> {
    let names: Vec<String> =
        sqlx::query_scalar(&format!("SELECT name FROM pragma_table_info('{}')", table))
            .fetch_all(pool)
            .await?;
    Ok(names.iter().any(|n| n == column))
}

async fn table_exists(pool: &SqlitePool, name: &str) -> Result<bool> {
    let exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name = ?",
    )
    .bind(name)
    .fetch_one(pool)
    .await?;
    Ok(exists)
}

async fn ensure_fts(pool: &SqlitePool) -> Result<()> {
    // FTS5 CREATE is not idempotent natively, so we check first
    if !table_exists(pool, "chunks_fts").await? {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE chunks_fts USING fts5(
                text,
                id UNINDEXED,
                path UNINDEXED,
                source UNINDEXED,
                model UNINDEXED,
                start_line UNINDEXED,
                end_line UNINDEXED
            )
            "#,
        )
        .execute(pool)
        .await?;
    }
    Ok(())
}

async fn ensure_vector_index(pool: &SqlitePool, dims: usize) -> Result<()> {
    if !table_exists(pool, "chunks_vec").await? {
        sqlx::query(&format!(
            "CREATE VIRTUAL TABLE chunks_vec USING vec0(chunk_id TEXT PRIMARY KEY, embedding float[{}] distance_metric=cosine)",
            dims
        ))
        .execute(pool)
        .await?;
    }
    Ok(())
}

/// Create every table and index, apply additive migrations, and report
/// optional index availability.
///
/// `vector_dims` is the embedding width; `None` skips the native vector
/// index entirely.
pub async fn ensure_schema(pool: &SqlitePool, vector_dims: Option<usize>) -> Result<SchemaStatus> {
    for ddl in CORE_TABLES {
        sqlx::query(ddl).execute(pool).await?;
    }

    for (table, column, definition) in ADDITIVE_COLUMNS {
        if !column_exists(pool, table, column).await? {
            debug!(table, column, "adding column");
            sqlx::query(&format!(
                "ALTER TABLE {} ADD COLUMN {} {}",
                table, column, definition
            ))
            .execute(pool)
            .await?;
        }
    }

    let mut status = SchemaStatus::default();

    match ensure_fts(pool).await {
        Ok(()) => status.fts_available = true,
        Err(e) => {
            warn!(error = %e, "keyword index unavailable, search will be vector-only");
            status.fts_error = Some(e.to_string());
        }
    }

    match vector_dims {
        Some(dims) if dims > 0 => match ensure_vector_index(pool, dims).await {
            Ok(()) => status.vector_available = true,
            Err(e) => {
                debug!(error = %e, "native vector index unavailable, using fallback scan");
                status.vector_error = Some(e.to_string());
            }
        },
        _ => {
            status.vector_error = Some("vector index not configured".to_string());
        }
    }

    sqlx::query(&format!("PRAGMA user_version = {}", SCHEMA_VERSION))
        .execute(pool)
        .await?;

    Ok(status)
}

/// Read the recorded schema version.
pub async fn schema_version(pool: &SqlitePool) -> Result<i64> {
    let version: i64 = sqlx::query_scalar("PRAGMA user_version")
        .fetch_one(pool)
        .await?;
    Ok(version)
}

/// Open the configured database, bring the schema up to date, and close.
pub async fn run_migrations(config: &Config) -> Result<SchemaStatus> {
    let pool = db::connect(config).await?;
    let dims = if config.db.vector_extension.is_some() {
        config.embedding.dims
    } else {
        None
    };
    let status = ensure_schema(&pool, dims).await?;
    pool.close().await;
    Ok(status)
}
