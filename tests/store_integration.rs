//! Integration tests for schema setup and the SQLite store.
//!
//! Every test opens a fresh database file in a temp directory and goes
//! through the public storage traits.

use memory_harness::config::Config;
use memory_harness::db;
use memory_harness::migrate::{ensure_schema, run_migrations, schema_version, SCHEMA_VERSION};
use memory_harness::sqlite_store::SqliteStore;
use memory_harness_core::claims::new_claim;
use memory_harness_core::models::{
    Chunk, ClaimStatus, ClaimType, EmbeddingCacheEntry, FileRecord, Scope,
};
use memory_harness_core::qa::new_qa_pair;
use memory_harness_core::store::{
    CandidateFilter, ChunkStore, ClaimFilter, ClaimSearchOptions, ClaimStore, QaFilter,
    QaSearchOptions, QaStore, VectorPath,
};
use sqlx::SqlitePool;
use tempfile::TempDir;

// ─── Helpers ────────────────────────────────────────────────────────

fn test_config(tmp: &TempDir) -> Config {
    let mut config = Config::default();
    config.db.path = tmp.path().join("data/memory.sqlite");
    config
}

async fn open_pool(tmp: &TempDir) -> SqlitePool {
    db::connect(&test_config(tmp)).await.unwrap()
}

async fn open_store(tmp: &TempDir) -> SqliteStore {
    SqliteStore::open(open_pool(tmp).await, None).await.unwrap()
}

fn chunk(id: &str, path: &str, text: &str, embedding: Option<Vec<f32>>) -> Chunk {
    Chunk {
        id: id.to_string(),
        path: path.to_string(),
        source: "memory".to_string(),
        start_line: 1,
        end_line: 1,
        hash: format!("h-{}", id),
        model: "m".to_string(),
        text: text.to_string(),
        embedding,
        updated_at: 0,
    }
}

// ─── Schema ─────────────────────────────────────────────────────────

/// Schema setup runs twice without error and records its version.
#[tokio::test]
async fn test_schema_is_idempotent_and_versioned() {
    let tmp = TempDir::new().unwrap();
    let status = run_migrations(&test_config(&tmp)).await.unwrap();
    assert!(status.fts_available);
    assert!(status.fts_error.is_none());
    assert!(!status.vector_available);
    assert!(status.vector_error.is_some());

    let pool = open_pool(&tmp).await;
    let again = ensure_schema(&pool, None).await.unwrap();
    assert_eq!(again, status);
    assert_eq!(schema_version(&pool).await.unwrap(), SCHEMA_VERSION);
}

/// A `qa_pairs` table from before the `correction` column gains it.
#[tokio::test]
async fn test_additive_column_migration() {
    let tmp = TempDir::new().unwrap();
    let pool = open_pool(&tmp).await;
    sqlx::query(
        r#"
        CREATE TABLE qa_pairs (
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
    )
    .execute(&pool)
    .await
    .unwrap();

    let store = SqliteStore::open(pool, None).await.unwrap();
    let pair = new_qa_pair("q", "a", 1);
    store.store_qa_pair(&pair).await.unwrap();
    assert!(store
        .update_qa_feedback(&pair.id, "correction: b", Some("b"))
        .await
        .unwrap());
    let stored = store.get_qa_pair(&pair.id).await.unwrap().unwrap();
    assert_eq!(stored.correction.as_deref(), Some("b"));
}

// ─── Chunks ─────────────────────────────────────────────────────────

/// Replacing a path's chunks replaces its keyword rows too, and deleting
/// the file removes everything.
#[tokio::test]
async fn test_replace_and_delete_chunks() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    let filter = CandidateFilter::default();

    store
        .replace_chunks("memory/a.md", &[chunk("c1", "memory/a.md", "redis cache", None)])
        .await
        .unwrap();
    store
        .upsert_file(&FileRecord {
            path: "memory/a.md".to_string(),
            source: "memory".to_string(),
            hash: "h".to_string(),
            mtime: 0,
            size: 11,
        })
        .await
        .unwrap();
    assert_eq!(store.keyword_search("\"redis\"", &filter, 10).await.unwrap().len(), 1);

    store
        .replace_chunks("memory/a.md", &[chunk("c2", "memory/a.md", "memcached cache", None)])
        .await
        .unwrap();
    assert!(store.keyword_search("\"redis\"", &filter, 10).await.unwrap().is_empty());
    let hits = store.keyword_search("\"cache\"", &filter, 10).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].chunk_id, "c2");

    assert!(store.delete_file("memory/a.md").await.unwrap());
    assert!(store.get_file("memory/a.md").await.unwrap().is_none());
    assert!(store.keyword_search("\"cache\"", &filter, 10).await.unwrap().is_empty());
    assert!(!store.delete_file("memory/a.md").await.unwrap());
}

/// A match expression the keyword index rejects yields no results.
#[tokio::test]
async fn test_malformed_match_expression_is_empty() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    store
        .replace_chunks("MEMORY.md", &[chunk("c1", "MEMORY.md", "text", None)])
        .await
        .unwrap();
    let hits = store
        .keyword_search("\"unterminated AND", &CandidateFilter::default(), 10)
        .await
        .unwrap();
    assert!(hits.is_empty());
}

/// Task scope and path prefixes are applied before scoring on both paths,
/// for task memory files and task-scoped pins alike.
#[tokio::test]
async fn test_scoped_candidates() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    for (id, path) in [
        ("g", "MEMORY.md"),
        ("a", "memory/tasks/a.md"),
        ("b", "memory/tasks/b.md"),
        ("b2", "memory/tasks/b/log.md"),
        ("u", "memory/tasks/a_b.md"),
    ] {
        store
            .replace_chunks(path, &[chunk(id, path, "deploy docker", Some(vec![1.0, 0.0]))])
            .await
            .unwrap();
    }
    for (id, path) in [
        ("pa", "pins/tasks/a/pin_a"),
        ("pb", "pins/tasks/b/pin_b"),
        ("pg", "pins/pin_g"),
    ] {
        let mut pin_chunk = chunk(id, path, "deploy docker", Some(vec![1.0, 0.0]));
        pin_chunk.source = "pins".to_string();
        store.replace_chunks(path, &[pin_chunk]).await.unwrap();
    }

    let scoped = CandidateFilter {
        task_id: Some("a".to_string()),
        ..Default::default()
    };
    let mut vector_ids: Vec<String> = store
        .vector_search(&[1.0, 0.0], &scoped, 10, VectorPath::FallbackScan)
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.chunk_id)
        .collect();
    vector_ids.sort();
    assert_eq!(vector_ids, vec!["a", "g", "pa", "pg"]);

    let mut keyword_ids: Vec<String> = store
        .keyword_search("\"docker\"", &scoped, 10)
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.chunk_id)
        .collect();
    keyword_ids.sort();
    assert_eq!(keyword_ids, vec!["a", "g", "pa", "pg"]);

    // Native requested without a vector index falls back to the scan.
    let native = store
        .vector_search(&[1.0, 0.0], &scoped, 10, VectorPath::Native)
        .await
        .unwrap();
    assert_eq!(native.len(), 4);

    let prefixed = CandidateFilter {
        path_prefixes: vec!["memory/tasks/b".to_string()],
        ..Default::default()
    };
    let hits = store.keyword_search("\"docker\"", &prefixed, 10).await.unwrap();
    assert_eq!(hits.len(), 2);

    let wrong_model = CandidateFilter {
        model: Some("other".to_string()),
        ..Default::default()
    };
    assert!(store
        .vector_search(&[1.0, 0.0], &wrong_model, 10, VectorPath::FallbackScan)
        .await
        .unwrap()
        .is_empty());
}

/// Cached embeddings are keyed by provider identity and hash.
#[tokio::test]
async fn test_embedding_cache() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    store
        .put_cached_embedding(&EmbeddingCacheEntry {
            provider: "ollama".to_string(),
            model: "nomic".to_string(),
            provider_key: "http://localhost:11434#2".to_string(),
            hash: "abc".to_string(),
            embedding: vec![0.25, -1.0],
            dims: 2,
            updated_at: 1,
        })
        .await
        .unwrap();

    let hit = store
        .get_cached_embedding("ollama", "nomic", "http://localhost:11434#2", "abc")
        .await
        .unwrap();
    assert_eq!(hit, Some(vec![0.25, -1.0]));
    let miss = store
        .get_cached_embedding("ollama", "nomic", "http://other#2", "abc")
        .await
        .unwrap();
    assert!(miss.is_none());
}

// ─── Claims ─────────────────────────────────────────────────────────

/// Upserts keep the original `created_at`; search filters and orders.
#[tokio::test]
async fn test_claim_store() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;

    let mut redis = new_claim("Cache is redis", ClaimType::Fact, Scope::Global, None, 0.6, 100);
    redis.embedding = Some(vec![1.0, 0.0]);
    redis.evidence_refs = vec!["pin_1".to_string()];
    store.upsert_claim(&redis).await.unwrap();

    let mut task = new_claim("Use CSV", ClaimType::Decision, Scope::Task, Some("t1"), 0.7, 200);
    task.embedding = Some(vec![0.6, 0.8]);
    store.upsert_claim(&task).await.unwrap();

    let mut again = redis.clone();
    again.created_at = 999;
    again.updated_at = 300;
    again.confidence = 0.8;
    store.upsert_claim(&again).await.unwrap();

    let stored = store.get_claim(&redis.id).await.unwrap().unwrap();
    assert_eq!(stored.created_at, 100);
    assert_eq!(stored.updated_at, 300);
    assert_eq!(stored.evidence_refs, vec!["pin_1".to_string()]);
    assert_eq!(stored.embedding, Some(vec![1.0, 0.0]));

    let all = store.list_claims(&ClaimFilter::default()).await.unwrap();
    assert_eq!(all[0].id, redis.id);

    let scored = store
        .search_claims_by_vector(&[1.0, 0.0], &ClaimSearchOptions::default())
        .await
        .unwrap();
    assert_eq!(scored.len(), 2);
    assert_eq!(scored[0].claim.id, redis.id);
    assert!((scored[1].similarity - 0.6).abs() < 1e-6);

    assert!(store
        .update_claim_status(&task.id, ClaimStatus::Disputed, Some(400))
        .await
        .unwrap());
    let verified_only = ClaimSearchOptions {
        status_filter: Some(vec![ClaimStatus::Unverified]),
        ..Default::default()
    };
    let scored = store
        .search_claims_by_vector(&[1.0, 0.0], &verified_only)
        .await
        .unwrap();
    assert_eq!(scored.len(), 1);

    let task_only = ClaimFilter {
        task_id: Some("t1".to_string()),
        ..Default::default()
    };
    assert_eq!(store.list_claims(&task_only).await.unwrap().len(), 1);

    assert!(store.delete_claim(&task.id).await.unwrap());
    assert!(!store.delete_claim(&task.id).await.unwrap());
    assert!(store.search_claims_by_vector(&[], &ClaimSearchOptions::default()).await.unwrap().is_empty());
}

// ─── Q/A ────────────────────────────────────────────────────────────

/// Pairs list newest first and vector recall honors the session filter.
#[tokio::test]
async fn test_qa_store() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;

    let mut older = new_qa_pair("which cache?", "redis", 10);
    older.session_key = Some("s1".to_string());
    older.question_embedding = Some(vec![1.0, 0.0]);
    older.claim_refs = vec!["claim_x".to_string()];
    store.store_qa_pair(&older).await.unwrap();

    let mut newer = new_qa_pair("which db?", "postgres", 20);
    newer.session_key = Some("s2".to_string());
    newer.question_embedding = Some(vec![0.0, 1.0]);
    store.store_qa_pair(&newer).await.unwrap();

    let listed = store.list_qa_pairs(&QaFilter::default()).await.unwrap();
    assert_eq!(listed[0].id, newer.id);
    assert_eq!(listed[1].claim_refs, vec!["claim_x".to_string()]);

    let s1 = QaSearchOptions {
        session_key: Some("s1".to_string()),
        ..Default::default()
    };
    let hits = store.search_qa_by_vector(&[0.0, 1.0], &s1).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].pair.id, older.id);

    assert!(store.update_qa_feedback(&older.id, "positive", None).await.unwrap());
    assert!(!store.update_qa_feedback("qa_missing", "positive", None).await.unwrap());
}

// ─── Pins and transient items ───────────────────────────────────────

/// Transient items past their TTL are swept; the WAL checkpoint succeeds.
#[tokio::test]
async fn test_transient_prune_and_checkpoint() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    store.push_transient("turn", "old", 1_000).await.unwrap();
    store.push_transient("turn", "new", 5_000).await.unwrap();

    assert_eq!(store.prune_transient(2_000).await.unwrap(), 1);
    assert_eq!(store.count_transient().await.unwrap(), 1);
    store.checkpoint_wal().await.unwrap();
}
