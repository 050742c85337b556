//! Hybrid retrieval over a [`ChunkStore`].
//!
//! The search algorithm operates entirely through the store trait, with no
//! database or configuration dependencies. The caller embeds the query (or
//! not, when the breaker says no), picks the weights, and passes a
//! [`SearchRequest`].
//!
//! # Hybrid Scoring Algorithm
//!
//! 1. Pool size = `min(200, max(1, ⌊limit × candidate_multiplier⌋))`.
//! 2. Keyword path: quoted-token `AND` expression against the keyword index;
//!    FTS5 rank `r` (lower is better) maps to `s/(1+s)` with `s = max(0, -r)`.
//! 3. Vector path: cosine similarity, native index or fallback scan.
//! 4. Merge by chunk: `score = w_v × vector + w_t × text`, with weights
//!    renormalized to the paths that can actually contribute.
//! 5. Drop results below `min_score`.
//! 6. Order with [`rank_deterministic`], truncate to `limit`.
//!
//! Scope filtering happens inside the store, before either path scores a
//! candidate.

use std::collections::HashMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::chunk::snap_to_char_boundary;
use crate::ranking::{rank_deterministic, ProvenanceClass, Rankable, RankingPolicy};
use crate::store::{CandidateFilter, ChunkCandidate, ChunkStore, VectorPath};

/// Upper bound on candidates fetched per path.
pub const MAX_CANDIDATE_POOL: usize = 200;

/// Blend weights for the two retrieval paths.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SearchWeights {
    pub vector: f64,
    pub text: f64,
}

impl Default for SearchWeights {
    fn default() -> Self {
        Self {
            vector: 0.7,
            text: 0.3,
        }
    }
}

impl SearchWeights {
    /// Weights after dropping the paths that cannot contribute.
    ///
    /// ```rust
    /// use memory_harness_core::search::SearchWeights;
    ///
    /// let w = SearchWeights { vector: 0.7, text: 0.3 };
    /// assert_eq!(w.effective(false, true), SearchWeights { vector: 1.0, text: 0.0 });
    /// assert_eq!(w.effective(true, false), SearchWeights { vector: 0.0, text: 1.0 });
    /// assert_eq!(w.effective(true, true), w);
    /// ```
    pub fn effective(self, keyword_usable: bool, vector_usable: bool) -> SearchWeights {
        let vector = if vector_usable { self.vector.max(0.0) } else { 0.0 };
        let text = if keyword_usable { self.text.max(0.0) } else { 0.0 };
        match (vector_usable, keyword_usable) {
            (true, true) => SearchWeights { vector, text },
            (true, false) => SearchWeights {
                vector: 1.0,
                text: 0.0,
            },
            (false, true) => SearchWeights {
                vector: 0.0,
                text: 1.0,
            },
            (false, false) => SearchWeights {
                vector: 0.0,
                text: 0.0,
            },
        }
    }
}

/// Retrieval tuning parameters, decoupled from application config.
#[derive(Debug, Clone)]
pub struct SearchParams {
    pub limit: usize,
    pub min_score: f64,
    pub candidate_multiplier: f64,
    pub snippet_max_chars: usize,
    pub ranking: RankingPolicy,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            limit: 6,
            min_score: 0.35,
            candidate_multiplier: 4.0,
            snippet_max_chars: 700,
            ranking: RankingPolicy::default(),
        }
    }
}

/// Bundles all inputs for a single search invocation.
#[derive(Debug, Clone)]
pub struct SearchRequest<'a> {
    pub query: &'a str,
    /// Query embedding; `None` runs keyword-only.
    pub query_vec: Option<&'a [f32]>,
    /// Weights as projected by the breaker.
    pub weights: SearchWeights,
    pub filter: CandidateFilter,
    /// Preferred vector path; falls back to a scan when the store has no
    /// native index.
    pub vector_path: VectorPath,
    pub params: SearchParams,
}

/// One ranked search hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemorySearchResult {
    pub chunk_id: String,
    pub path: String,
    pub start_line: i64,
    pub end_line: i64,
    pub score: f64,
    pub snippet: String,
    pub source: String,
    pub provenance: ProvenanceClass,
    pub vector_score: Option<f64>,
    pub text_score: Option<f64>,
}

impl Rankable for MemorySearchResult {
    fn rank_id(&self) -> &str {
        &self.chunk_id
    }

    fn rank_score(&self) -> f64 {
        self.score
    }

    fn provenance(&self) -> ProvenanceClass {
        self.provenance
    }

    fn stable_key(&self) -> (&str, i64) {
        (&self.path, self.start_line)
    }
}

/// Build an FTS5 match expression from free text.
///
/// Tokens are runs of alphanumerics and underscores, each quoted, joined
/// with `AND`. `None` when the text has no searchable token.
///
/// ```rust
/// use memory_harness_core::search::build_fts_query;
///
/// assert_eq!(build_fts_query("deploy-docker!").as_deref(), Some("\"deploy\" AND \"docker\""));
/// assert_eq!(build_fts_query("  ?! "), None);
/// ```
pub fn build_fts_query(raw: &str) -> Option<String> {
    let tokens: Vec<String> = raw
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t))
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" AND "))
    }
}

/// Map an FTS5 rank (lower is better) to a score in `[0, 1)`.
///
/// Monotonic: a better rank never yields a lower score.
pub fn bm25_rank_to_score(rank: f64) -> f64 {
    if !rank.is_finite() {
        return 0.0;
    }
    let relevance = (-rank).max(0.0);
    relevance / (1.0 + relevance)
}

/// Candidates fetched per path for a final `limit`.
pub fn candidate_pool(limit: usize, multiplier: f64) -> usize {
    let multiplier = if multiplier.is_finite() {
        multiplier.max(1.0)
    } else {
        1.0
    };
    let pool = (limit as f64 * multiplier).floor() as usize;
    pool.clamp(1, MAX_CANDIDATE_POOL)
}

/// Truncate to at most `max_chars` bytes on a char boundary.
pub fn truncate_snippet(text: &str, max_chars: usize) -> String {
    if text.len() <= max_chars {
        return text.to_string();
    }
    let end = snap_to_char_boundary(text, max_chars);
    text[..end].to_string()
}

struct Merged {
    candidate: ChunkCandidate,
    vector: Option<f64>,
    text: Option<f64>,
}

/// Run a hybrid search against a [`ChunkStore`].
pub async fn search<S: ChunkStore + ?Sized>(
    store: &S,
    req: &SearchRequest<'_>,
) -> Result<Vec<MemorySearchResult>> {
    let params = &req.params;
    if params.limit == 0 || req.query.trim().is_empty() {
        return Ok(Vec::new());
    }

    let match_expr = build_fts_query(req.query);
    let keyword_usable = store.keyword_available() && match_expr.is_some();
    let query_vec = req.query_vec.filter(|v| !v.is_empty());
    let vector_usable = query_vec.is_some() && req.weights.vector > 0.0;

    let weights = req.weights.effective(keyword_usable, vector_usable);
    if weights.vector <= 0.0 && weights.text <= 0.0 {
        tracing::debug!(query = req.query, "no usable retrieval path");
        return Ok(Vec::new());
    }

    let pool = candidate_pool(params.limit, params.candidate_multiplier);

    let vector_candidates = match query_vec {
        Some(qv) if weights.vector > 0.0 => {
            let path = if req.vector_path == VectorPath::Native && store.native_vector_available() {
                VectorPath::Native
            } else {
                VectorPath::FallbackScan
            };
            store.vector_search(qv, &req.filter, pool, path).await?
        }
        _ => Vec::new(),
    };

    let keyword_candidates = match match_expr {
        Some(ref expr) if weights.text > 0.0 => {
            store.keyword_search(expr, &req.filter, pool).await?
        }
        _ => Vec::new(),
    };

    let mut merged: HashMap<String, Merged> = HashMap::new();
    for c in vector_candidates {
        let sim = c.raw_score.max(0.0);
        merged.insert(
            c.chunk_id.clone(),
            Merged {
                candidate: c,
                vector: Some(sim),
                text: None,
            },
        );
    }
    for c in keyword_candidates {
        let score = bm25_rank_to_score(c.raw_score);
        match merged.get_mut(&c.chunk_id) {
            Some(m) => m.text = Some(score),
            None => {
                merged.insert(
                    c.chunk_id.clone(),
                    Merged {
                        candidate: c,
                        vector: None,
                        text: Some(score),
                    },
                );
            }
        }
    }

    let results: Vec<MemorySearchResult> = merged
        .into_values()
        .filter_map(|m| {
            let score = weights.vector * m.vector.unwrap_or(0.0)
                + weights.text * m.text.unwrap_or(0.0);
            if !score.is_finite() || score < params.min_score {
                return None;
            }
            let c = m.candidate;
            Some(MemorySearchResult {
                provenance: ProvenanceClass::classify(&c.path, &c.source),
                snippet: truncate_snippet(&c.text, params.snippet_max_chars),
                chunk_id: c.chunk_id,
                path: c.path,
                start_line: c.start_line,
                end_line: c.end_line,
                score,
                source: c.source,
                vector_score: m.vector,
                text_score: m.text,
            })
        })
        .collect();

    let mut ranked = rank_deterministic(results, &params.ranking);
    ranked.truncate(params.limit);
    Ok(ranked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Chunk;
    use crate::store::memory::InMemoryStore;

    fn chunk(id: &str, path: &str, source: &str, text: &str, embedding: Vec<f32>) -> Chunk {
        Chunk {
            id: id.to_string(),
            path: path.to_string(),
            source: source.to_string(),
            start_line: 1,
            end_line: 3,
            hash: String::new(),
            model: "m".to_string(),
            text: text.to_string(),
            embedding: Some(embedding),
            updated_at: 0,
        }
    }

    async fn seeded() -> InMemoryStore {
        seed(InMemoryStore::new()).await
    }

    async fn seed(store: InMemoryStore) -> InMemoryStore {
        store
            .replace_chunks(
                "memory/tasks/a.md",
                &[chunk("a1", "memory/tasks/a.md", "memory", "deploy target is staging", vec![1.0, 0.0])],
            )
            .await
            .unwrap();
        store
            .replace_chunks(
                "memory/tasks/b.md",
                &[chunk("b1", "memory/tasks/b.md", "memory", "deploy target is production deploy", vec![1.0, 0.0])],
            )
            .await
            .unwrap();
        store
            .replace_chunks(
                "MEMORY.md",
                &[chunk("m1", "MEMORY.md", "memory", "deploy notes for everyone", vec![0.8, 0.6])],
            )
            .await
            .unwrap();
        store
    }

    fn request<'a>(query: &'a str, vec: Option<&'a [f32]>, task: Option<&str>) -> SearchRequest<'a> {
        SearchRequest {
            query,
            query_vec: vec,
            weights: SearchWeights::default(),
            filter: CandidateFilter {
                task_id: task.map(String::from),
                ..Default::default()
            },
            vector_path: VectorPath::FallbackScan,
            params: SearchParams {
                min_score: 0.0,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_fts_query_builder() {
        assert_eq!(build_fts_query("a_b c").as_deref(), Some("\"a_b\" AND \"c\""));
        assert_eq!(build_fts_query(""), None);
    }

    #[test]
    fn test_bm25_score_is_monotonic() {
        let ranks = [-10.0, -3.0, -1.0, -0.1, 0.0, 2.0];
        let scores: Vec<f64> = ranks.iter().map(|&r| bm25_rank_to_score(r)).collect();
        for pair in scores.windows(2) {
            assert!(pair[0] >= pair[1]);
        }
        assert_eq!(bm25_rank_to_score(0.0), 0.0);
        assert!((bm25_rank_to_score(-1.0) - 0.5).abs() < 1e-9);
        assert_eq!(bm25_rank_to_score(f64::NAN), 0.0);
    }

    #[test]
    fn test_candidate_pool_bounds() {
        assert_eq!(candidate_pool(6, 4.0), 24);
        assert_eq!(candidate_pool(0, 4.0), 1);
        assert_eq!(candidate_pool(100, 4.0), MAX_CANDIDATE_POOL);
        assert_eq!(candidate_pool(5, 0.5), 5);
        assert_eq!(candidate_pool(3, 2.5), 7);
    }

    #[test]
    fn test_truncate_snippet_char_boundary() {
        let s = "héllo";
        assert_eq!(truncate_snippet(s, 2), "h");
        assert_eq!(truncate_snippet(s, 100), s);
    }

    #[tokio::test]
    async fn test_scope_isolation_vector_only() {
        let store = seeded().await;
        let qv = [1.0f32, 0.0];
        let mut req = request("zzz", Some(&qv), Some("a"));
        req.weights = SearchWeights {
            vector: 1.0,
            text: 0.0,
        };
        let results = search(&store, &req).await.unwrap();
        let ids: Vec<&str> = results.iter().map(|r| r.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["a1", "m1"]);
    }

    #[tokio::test]
    async fn test_scope_isolation_hybrid() {
        let store = seeded().await;
        let qv = [1.0f32, 0.0];
        let results = search(&store, &request("deploy", Some(&qv), Some("a")))
            .await
            .unwrap();
        assert!(results.iter().all(|r| r.path != "memory/tasks/b.md"));
        assert_eq!(results[0].chunk_id, "a1");
        assert_eq!(results[0].provenance, ProvenanceClass::TaskFile);
        assert!(results[0].vector_score.is_some());
        assert!(results[0].text_score.is_some());

        // Same query unscoped sees b1; a1's score is unaffected by it.
        let unscoped = search(&store, &request("deploy", Some(&qv), None)).await.unwrap();
        let a1_scoped = results[0].score;
        let a1_unscoped = unscoped.iter().find(|r| r.chunk_id == "a1").unwrap().score;
        assert_eq!(a1_scoped, a1_unscoped);
        assert!(unscoped.iter().any(|r| r.chunk_id == "b1"));
    }

    #[tokio::test]
    async fn test_keyword_only_without_vector() {
        let store = seeded().await;
        let results = search(&store, &request("production", None, None)).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk_id, "b1");
        assert!(results[0].vector_score.is_none());
        assert!((results[0].score - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_unsearchable_query_without_vector_is_empty() {
        let store = seeded().await;
        assert!(search(&store, &request("?!", None, None)).await.unwrap().is_empty());
        assert!(search(&store, &request("   ", None, None)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_min_score_and_limit() {
        let store = seeded().await;
        let qv = [1.0f32, 0.0];
        let mut req = request("deploy", Some(&qv), None);
        req.params.limit = 1;
        assert_eq!(search(&store, &req).await.unwrap().len(), 1);

        req.params.limit = 6;
        req.params.min_score = 0.99;
        assert!(search(&store, &req).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_native_preference_falls_back_to_scan() {
        let store = seeded().await;
        let qv = [1.0f32, 0.0];
        let mut req = request("zzz", Some(&qv), None);
        req.vector_path = VectorPath::Native;
        let results = search(&store, &req).await.unwrap();
        assert_eq!(results.len(), 3);
    }

    #[tokio::test]
    async fn test_native_and_fallback_rank_identically() {
        let store = seed(InMemoryStore::with_native_vectors()).await;
        let qv = [1.0f32, 0.0];
        let scan = search(&store, &request("deploy", Some(&qv), None)).await.unwrap();
        let mut req = request("deploy", Some(&qv), None);
        req.vector_path = VectorPath::Native;
        let native = search(&store, &req).await.unwrap();

        assert_eq!(native.len(), scan.len());
        for (n, s) in native.iter().zip(&scan) {
            assert_eq!(n.chunk_id, s.chunk_id);
            assert!((n.score - s.score).abs() < 1e-6);
        }
    }
}
