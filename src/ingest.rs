//! Workspace indexing.
//!
//! Coordinates the sync flow: scan → hash check → chunking → embedding
//! (through the cache) → storage. Unchanged files are not re-chunked.
//! Embedding is inline and non-fatal: when the provider fails or the
//! breaker is open, chunks are stored without vectors and counted as
//! pending. A later sync embeds the pending chunks of an unchanged file,
//! and re-embeds chunks whose vectors came from another model.
//!
//! Indexed inputs:
//!
//! | Path | Source |
//! |------|--------|
//! | `MEMORY.md`, `memory/**/*.md` | `memory` |
//! | `pins/<id>`, `pins/tasks/<task>/<id>` (virtual, one per active pin) | `pins` |

use std::collections::HashSet;
use std::path::Path;

use anyhow::Result;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use memory_harness_core::breaker::EmbeddingCircuitBreaker;
use memory_harness_core::chunk::{chunk_id, chunk_lines, hash_text, ChunkingParams};
use memory_harness_core::embedding::Embedder;
use memory_harness_core::models::{now_ms, Chunk, EmbeddingCacheEntry, FileRecord};
use memory_harness_core::ranking::PINS_SOURCE;
use memory_harness_core::store::{pin_path, ChunkStore};

use crate::sqlite_store::SqliteStore;

/// Source label of workspace memory files.
pub const MEMORY_SOURCE: &str = "memory";

const INCLUDE_GLOBS: &[&str] = &["MEMORY.md", "memory/**/*.md"];

/// Everything indexing needs besides the document itself.
pub struct IndexContext<'a> {
    pub store: &'a SqliteStore,
    pub embedder: &'a dyn Embedder,
    pub breaker: &'a Mutex<EmbeddingCircuitBreaker>,
    pub chunking: ChunkingParams,
    pub batch_size: usize,
    /// `false` when the embedding provider is disabled.
    pub embeddings_enabled: bool,
}

/// Result of indexing one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IndexOutcome {
    /// Content hash matched and every chunk has a current vector.
    Unchanged,
    /// Content hash matched; stored chunks missing a current vector were
    /// embedded again.
    Refreshed { embedded: usize, pending: usize },
    Indexed {
        chunks: usize,
        embedded: usize,
        pending: usize,
    },
}

/// Counters for one [`sync_workspace`] run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub files_scanned: usize,
    pub files_indexed: usize,
    pub files_unchanged: usize,
    pub files_refreshed: usize,
    pub files_removed: usize,
    pub pins_indexed: usize,
    pub chunks_written: usize,
    pub embeddings_written: usize,
    pub embeddings_pending: usize,
}

impl SyncReport {
    fn add(&mut self, outcome: IndexOutcome) {
        match outcome {
            IndexOutcome::Unchanged => self.files_unchanged += 1,
            IndexOutcome::Refreshed { embedded, pending } => {
                self.files_refreshed += 1;
                self.embeddings_written += embedded;
                self.embeddings_pending += pending;
            }
            IndexOutcome::Indexed {
                chunks,
                embedded,
                pending,
            } => {
                self.files_indexed += 1;
                self.chunks_written += chunks;
                self.embeddings_written += embedded;
                self.embeddings_pending += pending;
            }
        }
    }
}

/// Index one document, replacing its chunks if its content changed.
pub async fn index_document(
    ctx: &IndexContext<'_>,
    path: &str,
    source: &str,
    content: &str,
    mtime: i64,
) -> Result<IndexOutcome> {
    let hash = hash_text(content);
    if let Some(existing) = ctx.store.get_file(path).await? {
        if existing.hash == hash && existing.source == source {
            return refresh_embeddings(ctx, path).await;
        }
    }

    let pieces = chunk_lines(content, &ctx.chunking);
    let items: Vec<(&str, &str)> = pieces
        .iter()
        .map(|p| (p.hash.as_str(), p.text.as_str()))
        .collect();
    let vectors = embed_texts(ctx, &items).await?;
    let embedded = vectors.iter().filter(|v| v.is_some()).count();
    let pending = if ctx.embeddings_enabled {
        pieces.len() - embedded
    } else {
        0
    };

    let now = now_ms();
    let model = ctx.embedder.model().to_string();
    let chunks: Vec<Chunk> = pieces
        .into_iter()
        .zip(vectors)
        .map(|(piece, embedding)| Chunk {
            id: chunk_id(source, path, piece.start_line, piece.end_line, &piece.hash),
            path: path.to_string(),
            source: source.to_string(),
            start_line: piece.start_line,
            end_line: piece.end_line,
            hash: piece.hash,
            model: model.clone(),
            text: piece.text,
            embedding,
            updated_at: now,
        })
        .collect();

    ctx.store.replace_chunks(path, &chunks).await?;
    ctx.store
        .upsert_file(&FileRecord {
            path: path.to_string(),
            source: source.to_string(),
            hash,
            mtime,
            size: content.len() as i64,
        })
        .await?;

    debug!(path, chunks = chunks.len(), embedded, pending, "indexed");
    Ok(IndexOutcome::Indexed {
        chunks: chunks.len(),
        embedded,
        pending,
    })
}

/// Embed the stored chunks of an unchanged file that have no vector from
/// the current model.
async fn refresh_embeddings(ctx: &IndexContext<'_>, path: &str) -> Result<IndexOutcome> {
    if !ctx.embeddings_enabled {
        debug!(path, "unchanged, skipping");
        return Ok(IndexOutcome::Unchanged);
    }

    let model = ctx.embedder.model();
    let mut chunks = ctx.store.chunks_for_path(path).await?;
    let stale: Vec<usize> = chunks
        .iter()
        .enumerate()
        .filter(|(_, c)| c.embedding.is_none() || c.model != model)
        .map(|(i, _)| i)
        .collect();
    if stale.is_empty() {
        debug!(path, "unchanged, skipping");
        return Ok(IndexOutcome::Unchanged);
    }

    let items: Vec<(&str, &str)> = stale
        .iter()
        .map(|&i| (chunks[i].hash.as_str(), chunks[i].text.as_str()))
        .collect();
    let vectors = embed_texts(ctx, &items).await?;

    let now = now_ms();
    let mut embedded = 0;
    for (&i, vector) in stale.iter().zip(vectors) {
        if let Some(vector) = vector {
            let chunk = &mut chunks[i];
            chunk.embedding = Some(vector);
            chunk.model = model.to_string();
            chunk.updated_at = now;
            embedded += 1;
        }
    }
    let pending = stale.len() - embedded;
    if embedded > 0 {
        ctx.store.replace_chunks(path, &chunks).await?;
    }

    debug!(path, embedded, pending, "refreshed embeddings");
    Ok(IndexOutcome::Refreshed { embedded, pending })
}

/// Embeddings for `(hash, text)` items, in order. Cache hits are reused;
/// misses are embedded in batches while the breaker allows it.
async fn embed_texts(
    ctx: &IndexContext<'_>,
    items: &[(&str, &str)],
) -> Result<Vec<Option<Vec<f32>>>> {
    let mut out: Vec<Option<Vec<f32>>> = vec![None; items.len()];
    if !ctx.embeddings_enabled || items.is_empty() {
        return Ok(out);
    }

    let provider = ctx.embedder.provider();
    let model = ctx.embedder.model();
    let key = ctx.embedder.provider_key();

    let mut misses = Vec::new();
    for (i, (hash, _)) in items.iter().enumerate() {
        match ctx
            .store
            .get_cached_embedding(provider, model, key, hash)
            .await?
        {
            Some(v) => out[i] = Some(v),
            None => misses.push(i),
        }
    }

    for batch in misses.chunks(ctx.batch_size.max(1)) {
        if !ctx.breaker.lock().await.allow_request(now_ms()) {
            debug!(remaining = batch.len(), "embedding breaker open, deferring");
            break;
        }

        let texts: Vec<String> = batch.iter().map(|&i| items[i].1.to_string()).collect();
        match ctx.embedder.embed_batch(&texts).await {
            Ok(vectors) => {
                ctx.breaker.lock().await.record_success(now_ms());
                let now = now_ms();
                for (&i, vector) in batch.iter().zip(vectors) {
                    ctx.store
                        .put_cached_embedding(&EmbeddingCacheEntry {
                            provider: provider.to_string(),
                            model: model.to_string(),
                            provider_key: key.to_string(),
                            hash: items[i].0.to_string(),
                            dims: vector.len(),
                            embedding: vector.clone(),
                            updated_at: now,
                        })
                        .await?;
                    out[i] = Some(vector);
                }
            }
            Err(e) => {
                ctx.breaker.lock().await.record_failure(now_ms());
                warn!(error = %e, "embedding batch failed, storing chunks without vectors");
                break;
            }
        }
    }

    Ok(out)
}

fn build_globset(patterns: &[&str]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

/// Workspace-relative paths of every memory file, sorted.
pub fn collect_memory_files(workspace: &Path) -> Result<Vec<String>> {
    let include = build_globset(INCLUDE_GLOBS)?;
    let mut paths = Vec::new();

    let root_memory = workspace.join("MEMORY.md");
    if root_memory.is_file() {
        paths.push("MEMORY.md".to_string());
    }

    let memory_dir = workspace.join("memory");
    if memory_dir.is_dir() {
        for entry in WalkDir::new(&memory_dir) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(workspace)
                .unwrap_or(entry.path());
            let rel_str = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if include.is_match(&rel_str) {
                paths.push(rel_str);
            }
        }
    }

    paths.sort();
    Ok(paths)
}

fn file_mtime_ms(path: &Path) -> i64 {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Bring the index in line with the workspace and the active pins.
pub async fn sync_workspace(ctx: &IndexContext<'_>, workspace: &Path) -> Result<SyncReport> {
    let mut report = SyncReport::default();

    let paths = collect_memory_files(workspace)?;
    report.files_scanned = paths.len();
    let mut seen: HashSet<String> = HashSet::new();

    for rel in paths {
        let full = workspace.join(&rel);
        let content = match std::fs::read_to_string(&full) {
            Ok(c) => c,
            Err(e) => {
                warn!(path = %rel, error = %e, "unreadable memory file, skipping");
                continue;
            }
        };
        let outcome = index_document(ctx, &rel, MEMORY_SOURCE, &content, file_mtime_ms(&full)).await?;
        report.add(outcome);
        seen.insert(rel);
    }

    for pin in ctx.store.list_active_pins(now_ms()).await? {
        let path = pin_path(&pin);
        let outcome = index_document(ctx, &path, PINS_SOURCE, &pin.text, pin.created_at).await?;
        if matches!(outcome, IndexOutcome::Indexed { .. }) {
            report.pins_indexed += 1;
        }
        report.add(outcome);
        seen.insert(path);
    }

    for source in [MEMORY_SOURCE, PINS_SOURCE] {
        for file in ctx.store.list_files(Some(source)).await? {
            if !seen.contains(&file.path) && ctx.store.delete_file(&file.path).await? {
                debug!(path = %file.path, "removed vanished file");
                report.files_removed += 1;
            }
        }
    }

    info!(
        scanned = report.files_scanned,
        indexed = report.files_indexed,
        removed = report.files_removed,
        pending = report.embeddings_pending,
        "sync complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_collect_memory_files() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::write(root.join("MEMORY.md"), "root").unwrap();
        fs::write(root.join("README.md"), "not memory").unwrap();
        fs::create_dir_all(root.join("memory/tasks/t1")).unwrap();
        fs::write(root.join("memory/2024-01-01.md"), "day").unwrap();
        fs::write(root.join("memory/tasks/t1.md"), "task").unwrap();
        fs::write(root.join("memory/tasks/t1/notes.md"), "notes").unwrap();
        fs::write(root.join("memory/image.png"), "bin").unwrap();

        let paths = collect_memory_files(root).unwrap();
        assert_eq!(
            paths,
            vec![
                "MEMORY.md",
                "memory/2024-01-01.md",
                "memory/tasks/t1.md",
                "memory/tasks/t1/notes.md",
            ]
        );
    }

    #[test]
    fn test_collect_memory_files_empty_workspace() {
        let tmp = TempDir::new().unwrap();
        assert!(collect_memory_files(tmp.path()).unwrap().is_empty());
    }

    #[test]
    fn test_report_accumulates() {
        let mut report = SyncReport::default();
        report.add(IndexOutcome::Unchanged);
        report.add(IndexOutcome::Indexed {
            chunks: 3,
            embedded: 2,
            pending: 1,
        });
        assert_eq!(report.files_unchanged, 1);
        assert_eq!(report.files_indexed, 1);
        assert_eq!(report.chunks_written, 3);
        assert_eq!(report.embeddings_pending, 1);

        report.add(IndexOutcome::Refreshed {
            embedded: 1,
            pending: 0,
        });
        assert_eq!(report.files_refreshed, 1);
        assert_eq!(report.files_unchanged, 1);
        assert_eq!(report.embeddings_written, 3);
    }
}
