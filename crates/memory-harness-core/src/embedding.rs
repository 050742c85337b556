//! Embedding trait and vector utilities.
//!
//! Defines the [`Embedder`] trait that all embedding backends implement,
//! plus pure helpers for the embedding column codec and cosine ranking.
//!
//! Concrete providers (OpenAI, Ollama) live in the `memory-harness` app
//! crate. Every failure they return is meant to be reported to the
//! [`EmbeddingCircuitBreaker`](crate::breaker::EmbeddingCircuitBreaker)
//! by the caller.

use anyhow::Result;
use async_trait::async_trait;

/// An embedding backend.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Provider identifier (e.g. `"openai"`).
    fn provider(&self) -> &str;
    /// Model identifier (e.g. `"text-embedding-3-small"`).
    fn model(&self) -> &str;
    /// Key distinguishing provider configurations that embed differently
    /// (endpoint, dimensions). Part of the embedding cache key.
    fn provider_key(&self) -> &str;
    /// Embed a single query text.
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>>;
    /// Embed a batch of texts, returning vectors in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// # Example
///
/// ```rust
/// use memory_harness_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12); // 3 × 4 bytes
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
///
/// Reverses [`vec_to_blob`]. Trailing bytes that do not form a whole
/// `f32` are ignored.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Decode a nullable embedding column.
///
/// This is the single boundary where stored bytes become a vector:
/// `NULL`, empty and misaligned blobs all read as "no embedding".
pub fn decode_embedding(blob: Option<&[u8]>) -> Option<Vec<f32>> {
    match blob {
        Some(bytes) if !bytes.is_empty() && bytes.len() % 4 == 0 => Some(blob_to_vec(bytes)),
        _ => None,
    }
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`; `0.0` for empty vectors or vectors
/// of different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

/// Cosine distance, as a `distance_metric=cosine` vector index reports it.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f64 {
    1.0 - cosine_similarity(a, b) as f64
}

/// Map a cosine distance from a vector index back to the similarity the
/// fallback scan reports, so both vector paths score alike.
pub fn similarity_from_distance(distance: f64) -> f64 {
    1.0 - distance
}

/// Score `items` against `query` by cosine similarity.
///
/// Drops non-finite scores and scores below `min_score`, sorts descending
/// (ties by `key` ascending so storage order never leaks), and truncates
/// to `limit`. An empty query yields no results.
pub fn rank_by_similarity<T, K>(
    query: &[f32],
    items: Vec<(T, Vec<f32>)>,
    min_score: f64,
    limit: usize,
    key: K,
) -> Vec<(T, f64)>
where
    K: Fn(&T) -> &str,
{
    if query.is_empty() {
        return Vec::new();
    }

    let mut scored: Vec<(T, f64)> = items
        .into_iter()
        .filter_map(|(item, vec)| {
            let sim = cosine_similarity(query, &vec) as f64;
            if sim.is_finite() && sim >= min_score {
                Some((item, sim))
            } else {
                None
            }
        })
        .collect();

    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| key(&a.0).cmp(key(&b.0)))
    });
    scored.truncate(limit);
    scored
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_round_trips_to_similarity() {
        let a = [0.6f32, 0.8];
        let b = [1.0f32, 0.0];
        let sim = cosine_similarity(&a, &b) as f64;
        assert!((similarity_from_distance(cosine_distance(&a, &b)) - sim).abs() < 1e-9);
        assert!((cosine_distance(&b, &b)).abs() < 1e-6);
        assert!((cosine_distance(&[0.0, 1.0], &b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        let sim = cosine_similarity(&v, &v);
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_different_lengths() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }

    #[test]
    fn test_decode_embedding_rejects_bad_shapes() {
        assert_eq!(decode_embedding(None), None);
        assert_eq!(decode_embedding(Some(&[])), None);
        assert_eq!(decode_embedding(Some(&[0, 0, 128])), None);
        let blob = vec_to_blob(&[0.5, -1.0]);
        assert_eq!(decode_embedding(Some(&blob)), Some(vec![0.5, -1.0]));
    }

    #[test]
    fn test_rank_by_similarity_filters_and_orders() {
        let items = vec![
            ("b".to_string(), vec![1.0, 0.0]),
            ("a".to_string(), vec![1.0, 0.0]),
            ("c".to_string(), vec![0.0, 1.0]),
            ("d".to_string(), vec![0.7, 0.7]),
        ];
        let ranked = rank_by_similarity(&[1.0, 0.0], items, 0.5, 10, |s: &String| s.as_str());
        let ids: Vec<&str> = ranked.iter().map(|(s, _)| s.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "d"]);
    }

    #[test]
    fn test_rank_by_similarity_empty_query() {
        let items = vec![("a".to_string(), vec![1.0])];
        assert!(rank_by_similarity(&[], items, 0.0, 10, |s: &String| s.as_str()).is_empty());
    }

    #[test]
    fn test_rank_by_similarity_truncates() {
        let items = (0..5)
            .map(|i| (format!("id{i}"), vec![1.0, i as f32 * 0.1]))
            .collect();
        let ranked = rank_by_similarity(&[1.0, 0.0], items, 0.0, 2, |s: &String| s.as_str());
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].0, "id0");
    }
}
