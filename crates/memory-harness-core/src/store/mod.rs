//! Storage abstraction for the memory engine.
//!
//! Three traits split the persisted tables by concern:
//!
//! | Trait | Tables |
//! |-------|--------|
//! | [`ChunkStore`] | `files`, `chunks`, `chunks_fts`, `chunks_vec`, `embedding_cache` |
//! | [`ClaimStore`] | `claims` |
//! | [`QaStore`] | `qa_pairs` |
//!
//! Every write helper is its own atomic unit; there are no cross-call
//! transactions. Upserts are keyed by id, so concurrent writes to
//! different ids are safe and writes to the same id are last-write-wins.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::models::{
    Chunk, Claim, ClaimStatus, ClaimType, EmbeddingCacheEntry, FileRecord, PinRecord, QaPair,
    Scope, ScoredClaim, ScoredQaPair,
};

/// Directory holding per-task memory files (`memory/tasks/<task>.md`).
pub const TASK_MEMORY_DIR: &str = "memory/tasks/";

/// Directory of task-scoped pins (`pins/tasks/<task>/<id>`). Global pins
/// live directly under `pins/`.
pub const TASK_PIN_DIR: &str = "pins/tasks/";

/// Directories whose first path segment names the owning task.
pub const TASK_OWNED_DIRS: &[&str] = &[TASK_MEMORY_DIR, TASK_PIN_DIR];

/// The task that owns `path`, if it lives under one of
/// [`TASK_OWNED_DIRS`].
///
/// ```rust
/// use memory_harness_core::store::task_owner;
///
/// assert_eq!(task_owner("memory/tasks/t1.md"), Some("t1"));
/// assert_eq!(task_owner("memory/tasks/t1/notes.md"), Some("t1"));
/// assert_eq!(task_owner("pins/tasks/t1/pin_a"), Some("t1"));
/// assert_eq!(task_owner("pins/pin_a"), None);
/// assert_eq!(task_owner("memory/2024-01-01.md"), None);
/// ```
pub fn task_owner(path: &str) -> Option<&str> {
    if let Some(rest) = path.strip_prefix(TASK_MEMORY_DIR) {
        let segment = rest.split('/').next().unwrap_or("");
        let owner = segment.strip_suffix(".md").unwrap_or(segment);
        return non_empty(owner);
    }
    let rest = path.strip_prefix(TASK_PIN_DIR)?;
    non_empty(rest.split('/').next().unwrap_or(""))
}

/// Virtual path under which a pin is indexed. Task-scoped pins carry their
/// task so scope filters can exclude them like task memory files.
pub fn pin_path(pin: &PinRecord) -> String {
    match (pin.scope, pin.task_id.as_deref()) {
        (Scope::Task, Some(task)) if !task.is_empty() => {
            format!("{}{}/{}", TASK_PIN_DIR, task, pin.id)
        }
        _ => format!("pins/{}", pin.id),
    }
}

fn non_empty(s: &str) -> Option<&str> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

/// Which vector path a search takes.
///
/// Both variants produce cosine similarities in `[-1, 1]`, so their
/// scores are interchangeable downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VectorPath {
    /// Nearest-neighbour query against the store's vector index.
    Native,
    /// In-process cosine scan over the filtered candidates.
    FallbackScan,
}

/// Candidate admission rules applied before any score is computed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CandidateFilter {
    /// Only admit chunks from these sources (empty = all).
    pub sources: Vec<String>,
    /// Only admit chunks whose path starts with one of these (empty = all).
    pub path_prefixes: Vec<String>,
    /// Task scope: task memory files of any other task are excluded.
    pub task_id: Option<String>,
    /// Only admit chunks embedded with this model (vector path only).
    pub model: Option<String>,
}

impl CandidateFilter {
    /// Whether any admission rule beyond the model narrows the candidates.
    /// A vector index without scope columns cannot serve such a filter.
    pub fn is_scoped(&self) -> bool {
        !self.sources.is_empty() || !self.path_prefixes.is_empty() || self.task_id.is_some()
    }

    /// Whether a chunk at `path` from `source` may enter a search path.
    pub fn admits(&self, path: &str, source: &str) -> bool {
        if !self.sources.is_empty() && !self.sources.iter().any(|s| s == source) {
            return false;
        }
        if !self.path_prefixes.is_empty()
            && !self.path_prefixes.iter().any(|p| path.starts_with(p.as_str()))
        {
            return false;
        }
        if let Some(ref task) = self.task_id {
            if let Some(owner) = task_owner(path) {
                if owner != task {
                    return false;
                }
            }
        }
        true
    }
}

/// A candidate chunk returned from keyword or vector search.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkCandidate {
    pub chunk_id: String,
    pub path: String,
    pub source: String,
    pub start_line: i64,
    pub end_line: i64,
    /// BM25 rank (lower is better) for keyword search, cosine similarity
    /// for vector search.
    pub raw_score: f64,
    pub text: String,
}

/// Storage for indexed files, their chunks, and the embedding cache.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Insert or replace the file row for `file.path`.
    async fn upsert_file(&self, file: &FileRecord) -> Result<()>;

    async fn get_file(&self, path: &str) -> Result<Option<FileRecord>>;

    /// All indexed files, optionally restricted to one source.
    async fn list_files(&self, source: Option<&str>) -> Result<Vec<FileRecord>>;

    /// Remove a file and all of its chunks. Returns whether a row existed.
    async fn delete_file(&self, path: &str) -> Result<bool>;

    /// Replace every chunk of `path` with `chunks`.
    async fn replace_chunks(&self, path: &str, chunks: &[Chunk]) -> Result<()>;

    async fn get_cached_embedding(
        &self,
        provider: &str,
        model: &str,
        provider_key: &str,
        hash: &str,
    ) -> Result<Option<Vec<f32>>>;

    async fn put_cached_embedding(&self, entry: &EmbeddingCacheEntry) -> Result<()>;

    /// Whether the keyword index exists.
    fn keyword_available(&self) -> bool;

    /// Whether [`VectorPath::Native`] can be served.
    fn native_vector_available(&self) -> bool;

    /// Full-text search with a prepared match expression.
    ///
    /// Implementations return an empty list for an expression the index
    /// cannot parse instead of an error.
    async fn keyword_search(
        &self,
        match_expr: &str,
        filter: &CandidateFilter,
        limit: usize,
    ) -> Result<Vec<ChunkCandidate>>;

    /// Cosine-similarity search over embedded chunks.
    async fn vector_search(
        &self,
        query_vec: &[f32],
        filter: &CandidateFilter,
        limit: usize,
        path: VectorPath,
    ) -> Result<Vec<ChunkCandidate>>;
}

/// Filter for [`ClaimStore::list_claims`].
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimFilter {
    pub scope: Option<Scope>,
    pub task_id: Option<String>,
    pub status: Option<ClaimStatus>,
    pub claim_type: Option<ClaimType>,
    pub limit: usize,
}

impl Default for ClaimFilter {
    fn default() -> Self {
        Self {
            scope: None,
            task_id: None,
            status: None,
            claim_type: None,
            limit: 500,
        }
    }
}

/// Options for [`ClaimStore::search_claims_by_vector`].
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimSearchOptions {
    pub scope: Option<Scope>,
    pub task_id: Option<String>,
    pub limit: usize,
    pub min_score: f64,
    /// Only claims in one of these statuses (`None` = any).
    pub status_filter: Option<Vec<ClaimStatus>>,
}

impl Default for ClaimSearchOptions {
    fn default() -> Self {
        Self {
            scope: None,
            task_id: None,
            limit: 50,
            min_score: 0.0,
            status_filter: None,
        }
    }
}

impl ClaimSearchOptions {
    /// Whether `claim` passes the scope/task/status filters.
    pub fn admits(&self, claim: &Claim) -> bool {
        if let Some(scope) = self.scope {
            if claim.scope != scope {
                return false;
            }
        }
        if let Some(ref task) = self.task_id {
            if claim.task_id.as_deref() != Some(task.as_str()) {
                return false;
            }
        }
        if let Some(ref statuses) = self.status_filter {
            if !statuses.contains(&claim.status) {
                return false;
            }
        }
        true
    }
}

/// Storage for claims.
#[async_trait]
pub trait ClaimStore: Send + Sync {
    /// Insert or replace by id. `id` and `created_at` of an existing row
    /// are preserved.
    async fn upsert_claim(&self, claim: &Claim) -> Result<()>;

    async fn get_claim(&self, id: &str) -> Result<Option<Claim>>;

    async fn delete_claim(&self, id: &str) -> Result<bool>;

    /// Set the status; `now` defaults to the current time.
    async fn update_claim_status(
        &self,
        id: &str,
        status: ClaimStatus,
        now: Option<i64>,
    ) -> Result<bool>;

    /// Set confidence and status together (promotion writes).
    async fn update_claim_confidence(
        &self,
        id: &str,
        confidence: f64,
        status: ClaimStatus,
        now: i64,
    ) -> Result<bool>;

    /// Claims matching `filter`, most recently updated first.
    async fn list_claims(&self, filter: &ClaimFilter) -> Result<Vec<Claim>>;

    async fn search_claims_by_vector(
        &self,
        query_vec: &[f32],
        opts: &ClaimSearchOptions,
    ) -> Result<Vec<ScoredClaim>>;
}

/// Filter for [`QaStore::list_qa_pairs`].
#[derive(Debug, Clone, PartialEq)]
pub struct QaFilter {
    pub session_key: Option<String>,
    pub task_id: Option<String>,
    pub limit: usize,
}

impl Default for QaFilter {
    fn default() -> Self {
        Self {
            session_key: None,
            task_id: None,
            limit: 200,
        }
    }
}

/// Options for [`QaStore::search_qa_by_vector`].
#[derive(Debug, Clone, PartialEq)]
pub struct QaSearchOptions {
    pub session_key: Option<String>,
    pub task_id: Option<String>,
    pub limit: usize,
    pub min_score: f64,
}

impl Default for QaSearchOptions {
    fn default() -> Self {
        Self {
            session_key: None,
            task_id: None,
            limit: 10,
            min_score: 0.0,
        }
    }
}

impl QaSearchOptions {
    pub fn admits(&self, pair: &QaPair) -> bool {
        if let Some(ref key) = self.session_key {
            if pair.session_key.as_deref() != Some(key.as_str()) {
                return false;
            }
        }
        if let Some(ref task) = self.task_id {
            if pair.task_id.as_deref() != Some(task.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Storage for cached question/answer pairs.
#[async_trait]
pub trait QaStore: Send + Sync {
    async fn store_qa_pair(&self, pair: &QaPair) -> Result<()>;

    async fn get_qa_pair(&self, id: &str) -> Result<Option<QaPair>>;

    /// Pairs matching `filter`, newest first.
    async fn list_qa_pairs(&self, filter: &QaFilter) -> Result<Vec<QaPair>>;

    /// Record a feedback verdict and optional correction text.
    async fn update_qa_feedback(
        &self,
        id: &str,
        feedback: &str,
        correction: Option<&str>,
    ) -> Result<bool>;

    async fn search_qa_by_vector(
        &self,
        query_vec: &[f32],
        opts: &QaSearchOptions,
    ) -> Result<Vec<ScoredQaPair>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pin(id: &str, scope: Scope, task_id: Option<&str>) -> PinRecord {
        PinRecord {
            id: id.to_string(),
            text: "x".to_string(),
            pin_type: crate::models::PinType::Fact,
            scope,
            task_id: task_id.map(str::to_string),
            created_at: 0,
            expires_at: None,
        }
    }

    #[test]
    fn test_pin_path_carries_task() {
        assert_eq!(pin_path(&pin("p1", Scope::Global, None)), "pins/p1");
        assert_eq!(pin_path(&pin("p2", Scope::Task, Some("t1"))), "pins/tasks/t1/p2");
        assert_eq!(task_owner(&pin_path(&pin("p2", Scope::Task, Some("t1")))), Some("t1"));
        // A task id on a global pin does not scope it.
        assert_eq!(pin_path(&pin("p3", Scope::Global, Some("t1"))), "pins/p3");
        assert_eq!(pin_path(&pin("p4", Scope::Task, None)), "pins/p4");
    }

    #[test]
    fn test_task_owner_requires_segment() {
        assert_eq!(task_owner("memory/tasks/"), None);
        assert_eq!(task_owner("memory/tasks/.md"), None);
        assert_eq!(task_owner("pins/tasks/"), None);
        assert_eq!(task_owner("pins/tasks"), None);
    }

    #[test]
    fn test_filter_excludes_other_task_files() {
        let filter = CandidateFilter {
            task_id: Some("a".to_string()),
            ..Default::default()
        };
        assert!(filter.admits("memory/tasks/a.md", "memory"));
        assert!(filter.admits("memory/tasks/a/log.md", "memory"));
        assert!(!filter.admits("memory/tasks/b.md", "memory"));
        assert!(filter.admits("MEMORY.md", "memory"));
        assert!(filter.admits("pins/tasks/a/pin_1", "pins"));
        assert!(!filter.admits("pins/tasks/b/pin_2", "pins"));
        assert!(filter.admits("pins/pin_3", "pins"));
    }

    #[test]
    fn test_filter_sources_and_prefixes() {
        let filter = CandidateFilter {
            sources: vec!["memory".to_string()],
            path_prefixes: vec!["memory/".to_string()],
            ..Default::default()
        };
        assert!(filter.admits("memory/x.md", "memory"));
        assert!(!filter.admits("memory/x.md", "sessions"));
        assert!(!filter.admits("MEMORY.md", "memory"));
    }

    #[test]
    fn test_claim_search_options_admits() {
        let now = 0;
        let mut claim = crate::claims::new_claim(
            "x",
            ClaimType::Fact,
            Scope::Task,
            Some("t1"),
            0.5,
            now,
        );
        let opts = ClaimSearchOptions {
            task_id: Some("t1".to_string()),
            status_filter: Some(vec![ClaimStatus::Unverified]),
            ..Default::default()
        };
        assert!(opts.admits(&claim));
        claim.status = ClaimStatus::Verified;
        assert!(!opts.admits(&claim));
    }
}
