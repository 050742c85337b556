//! In-memory store for testing and embedded use.
//!
//! Uses `HashMap` behind `std::sync::RwLock` for thread safety. Vector
//! search is brute-force cosine similarity; keyword search is a naive
//! all-terms match whose rank mimics FTS5 (more negative is better).

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::embedding::{cosine_distance, rank_by_similarity, similarity_from_distance};
use crate::models::{
    now_ms, Chunk, Claim, ClaimStatus, EmbeddingCacheEntry, FileRecord, QaPair, ScoredClaim,
    ScoredQaPair,
};

use super::{
    ChunkCandidate, ChunkStore, ClaimFilter, ClaimSearchOptions, ClaimStore, QaFilter,
    QaSearchOptions, QaStore, VectorPath,
};

type CacheKey = (String, String, String, String);

/// In-memory implementation of every storage trait.
pub struct InMemoryStore {
    files: RwLock<HashMap<String, FileRecord>>,
    chunks: RwLock<HashMap<String, Vec<Chunk>>>,
    cache: RwLock<HashMap<CacheKey, EmbeddingCacheEntry>>,
    claims: RwLock<HashMap<String, Claim>>,
    qa_pairs: RwLock<HashMap<String, QaPair>>,
    native_vectors: bool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            files: RwLock::new(HashMap::new()),
            chunks: RwLock::new(HashMap::new()),
            cache: RwLock::new(HashMap::new()),
            claims: RwLock::new(HashMap::new()),
            qa_pairs: RwLock::new(HashMap::new()),
            native_vectors: false,
        }
    }

    /// A store that reports a native vector index.
    pub fn with_native_vectors() -> Self {
        Self {
            native_vectors: true,
            ..Self::new()
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read().map_err(|e| anyhow!("store lock poisoned: {}", e))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write().map_err(|e| anyhow!("store lock poisoned: {}", e))
}

/// Terms of an FTS match expression: quoted phrases, else bare words.
fn match_terms(expr: &str) -> Vec<String> {
    let quoted: Vec<String> = expr
        .split('"')
        .skip(1)
        .step_by(2)
        .map(|t| t.to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    if !quoted.is_empty() {
        return quoted;
    }
    expr.split_whitespace()
        .filter(|w| !matches!(*w, "AND" | "OR" | "NOT"))
        .map(|w| w.to_lowercase())
        .collect()
}

#[async_trait]
impl ChunkStore for InMemoryStore {
    async fn upsert_file(&self, file: &FileRecord) -> Result<()> {
        write(&self.files)?.insert(file.path.clone(), file.clone());
        Ok(())
    }

    async fn get_file(&self, path: &str) -> Result<Option<FileRecord>> {
        Ok(read(&self.files)?.get(path).cloned())
    }

    async fn list_files(&self, source: Option<&str>) -> Result<Vec<FileRecord>> {
        let mut files: Vec<FileRecord> = read(&self.files)?
            .values()
            .filter(|f| source.map_or(true, |s| f.source == s))
            .cloned()
            .collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    async fn delete_file(&self, path: &str) -> Result<bool> {
        write(&self.chunks)?.remove(path);
        Ok(write(&self.files)?.remove(path).is_some())
    }

    async fn replace_chunks(&self, path: &str, chunks: &[Chunk]) -> Result<()> {
        write(&self.chunks)?.insert(path.to_string(), chunks.to_vec());
        Ok(())
    }

    async fn get_cached_embedding(
        &self,
        provider: &str,
        model: &str,
        provider_key: &str,
        hash: &str,
    ) -> Result<Option<Vec<f32>>> {
        let key = (
            provider.to_string(),
            model.to_string(),
            provider_key.to_string(),
            hash.to_string(),
        );
        Ok(read(&self.cache)?.get(&key).map(|e| e.embedding.clone()))
    }

    async fn put_cached_embedding(&self, entry: &EmbeddingCacheEntry) -> Result<()> {
        let key = (
            entry.provider.clone(),
            entry.model.clone(),
            entry.provider_key.clone(),
            entry.hash.clone(),
        );
        write(&self.cache)?.insert(key, entry.clone());
        Ok(())
    }

    fn keyword_available(&self) -> bool {
        true
    }

    fn native_vector_available(&self) -> bool {
        self.native_vectors
    }

    async fn keyword_search(
        &self,
        match_expr: &str,
        filter: &super::CandidateFilter,
        limit: usize,
    ) -> Result<Vec<ChunkCandidate>> {
        let terms = match_terms(match_expr);
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let chunks = read(&self.chunks)?;
        let mut candidates: Vec<ChunkCandidate> = chunks
            .values()
            .flatten()
            .filter(|c| filter.admits(&c.path, &c.source))
            .filter_map(|c| {
                let lower = c.text.to_lowercase();
                let mut hits = 0usize;
                for term in &terms {
                    let n = lower.matches(term.as_str()).count();
                    if n == 0 {
                        return None;
                    }
                    hits += n;
                }
                Some(to_candidate(c, -(hits as f64)))
            })
            .collect();

        candidates.sort_by(|a, b| {
            a.raw_score
                .partial_cmp(&b.raw_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn vector_search(
        &self,
        query_vec: &[f32],
        filter: &super::CandidateFilter,
        limit: usize,
        path: VectorPath,
    ) -> Result<Vec<ChunkCandidate>> {
        if path == VectorPath::Native && !self.native_vectors {
            anyhow::bail!("native vector index not available");
        }
        if path == VectorPath::Native && !filter.is_scoped() {
            return self.nearest_neighbours(query_vec, filter.model.as_deref(), limit);
        }

        let chunks = read(&self.chunks)?;
        let items: Vec<(ChunkCandidate, Vec<f32>)> = chunks
            .values()
            .flatten()
            .filter(|c| filter.admits(&c.path, &c.source))
            .filter(|c| filter.model.as_ref().map_or(true, |m| &c.model == m))
            .filter_map(|c| Some((to_candidate(c, 0.0), c.embedding.clone()?)))
            .collect();

        Ok(
            rank_by_similarity(query_vec, items, f64::NEG_INFINITY, limit, |c| {
                c.chunk_id.as_str()
            })
            .into_iter()
            .map(|(mut c, sim)| {
                c.raw_score = sim;
                c
            })
            .collect(),
        )
    }
}

impl InMemoryStore {
    /// The index-backed path: k nearest by cosine distance over every
    /// embedded chunk, then the model filter, like a KNN table joined back
    /// to its chunks.
    fn nearest_neighbours(
        &self,
        query_vec: &[f32],
        model: Option<&str>,
        k: usize,
    ) -> Result<Vec<ChunkCandidate>> {
        if query_vec.is_empty() {
            return Ok(Vec::new());
        }
        let chunks = read(&self.chunks)?;
        let mut nearest: Vec<(&Chunk, f64)> = chunks
            .values()
            .flatten()
            .filter_map(|c| {
                let distance = cosine_distance(query_vec, c.embedding.as_deref()?);
                distance.is_finite().then_some((c, distance))
            })
            .collect();
        nearest.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.id.cmp(&b.0.id))
        });
        nearest.truncate(k);

        Ok(nearest
            .into_iter()
            .filter(|(c, _)| model.map_or(true, |m| c.model == m))
            .map(|(c, distance)| to_candidate(c, similarity_from_distance(distance)))
            .collect())
    }
}

fn to_candidate(c: &Chunk, raw_score: f64) -> ChunkCandidate {
    ChunkCandidate {
        chunk_id: c.id.clone(),
        path: c.path.clone(),
        source: c.source.clone(),
        start_line: c.start_line,
        end_line: c.end_line,
        raw_score,
        text: c.text.clone(),
    }
}

#[async_trait]
impl ClaimStore for InMemoryStore {
    async fn upsert_claim(&self, claim: &Claim) -> Result<()> {
        let mut claims = write(&self.claims)?;
        let mut stored = claim.clone();
        if let Some(existing) = claims.get(&claim.id) {
            stored.created_at = existing.created_at;
        }
        claims.insert(stored.id.clone(), stored);
        Ok(())
    }

    async fn get_claim(&self, id: &str) -> Result<Option<Claim>> {
        Ok(read(&self.claims)?.get(id).cloned())
    }

    async fn delete_claim(&self, id: &str) -> Result<bool> {
        Ok(write(&self.claims)?.remove(id).is_some())
    }

    async fn update_claim_status(
        &self,
        id: &str,
        status: ClaimStatus,
        now: Option<i64>,
    ) -> Result<bool> {
        let mut claims = write(&self.claims)?;
        match claims.get_mut(id) {
            Some(c) => {
                c.status = status;
                c.updated_at = now.unwrap_or_else(now_ms);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn update_claim_confidence(
        &self,
        id: &str,
        confidence: f64,
        status: ClaimStatus,
        now: i64,
    ) -> Result<bool> {
        let mut claims = write(&self.claims)?;
        match claims.get_mut(id) {
            Some(c) => {
                c.confidence = crate::claims::clamp_confidence(confidence);
                c.status = status;
                c.updated_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_claims(&self, filter: &ClaimFilter) -> Result<Vec<Claim>> {
        let mut claims: Vec<Claim> = read(&self.claims)?
            .values()
            .filter(|c| filter.scope.map_or(true, |s| c.scope == s))
            .filter(|c| {
                filter
                    .task_id
                    .as_ref()
                    .map_or(true, |t| c.task_id.as_ref() == Some(t))
            })
            .filter(|c| filter.status.map_or(true, |s| c.status == s))
            .filter(|c| filter.claim_type.map_or(true, |t| c.claim_type == t))
            .cloned()
            .collect();
        claims.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
        claims.truncate(filter.limit);
        Ok(claims)
    }

    async fn search_claims_by_vector(
        &self,
        query_vec: &[f32],
        opts: &ClaimSearchOptions,
    ) -> Result<Vec<ScoredClaim>> {
        if query_vec.is_empty() {
            return Ok(Vec::new());
        }
        let items: Vec<(Claim, Vec<f32>)> = read(&self.claims)?
            .values()
            .filter(|c| opts.admits(c))
            .filter_map(|c| c.embedding.clone().map(|e| (c.clone(), e)))
            .collect();
        Ok(
            rank_by_similarity(query_vec, items, opts.min_score, opts.limit, |c| {
                c.id.as_str()
            })
            .into_iter()
            .map(|(claim, similarity)| ScoredClaim { claim, similarity })
            .collect(),
        )
    }
}

#[async_trait]
impl QaStore for InMemoryStore {
    async fn store_qa_pair(&self, pair: &QaPair) -> Result<()> {
        write(&self.qa_pairs)?.insert(pair.id.clone(), pair.clone());
        Ok(())
    }

    async fn get_qa_pair(&self, id: &str) -> Result<Option<QaPair>> {
        Ok(read(&self.qa_pairs)?.get(id).cloned())
    }

    async fn list_qa_pairs(&self, filter: &QaFilter) -> Result<Vec<QaPair>> {
        let mut pairs: Vec<QaPair> = read(&self.qa_pairs)?
            .values()
            .filter(|p| {
                filter
                    .session_key
                    .as_ref()
                    .map_or(true, |k| p.session_key.as_ref() == Some(k))
            })
            .filter(|p| {
                filter
                    .task_id
                    .as_ref()
                    .map_or(true, |t| p.task_id.as_ref() == Some(t))
            })
            .cloned()
            .collect();
        pairs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        pairs.truncate(filter.limit);
        Ok(pairs)
    }

    async fn update_qa_feedback(
        &self,
        id: &str,
        feedback: &str,
        correction: Option<&str>,
    ) -> Result<bool> {
        let mut pairs = write(&self.qa_pairs)?;
        match pairs.get_mut(id) {
            Some(p) => {
                p.feedback = Some(feedback.to_string());
                p.correction = correction.map(str::to_string);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn search_qa_by_vector(
        &self,
        query_vec: &[f32],
        opts: &QaSearchOptions,
    ) -> Result<Vec<ScoredQaPair>> {
        if query_vec.is_empty() {
            return Ok(Vec::new());
        }
        let items: Vec<(QaPair, Vec<f32>)> = read(&self.qa_pairs)?
            .values()
            .filter(|p| opts.admits(p))
            .filter_map(|p| p.question_embedding.clone().map(|e| (p.clone(), e)))
            .collect();
        Ok(
            rank_by_similarity(query_vec, items, opts.min_score, opts.limit, |p| {
                p.id.as_str()
            })
            .into_iter()
            .map(|(pair, similarity)| ScoredQaPair { pair, similarity })
            .collect(),
        )
    }
}
