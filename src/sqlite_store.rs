//! SQLite-backed storage.
//!
//! [`SqliteStore`] implements [`ChunkStore`], [`ClaimStore`] and [`QaStore`]
//! over one workspace database, plus the pin and transient-buffer tables
//! that only the native crate needs.
//!
//! Every stored embedding goes through
//! [`decode_embedding`] on the way out, so malformed blobs read as "no
//! embedding" at exactly one boundary. JSON id lists (`evidence_refs`,
//! `claim_refs`, `chunk_refs`) that fail to parse read as empty.
//!
//! Candidate filters are compiled into the SQL `WHERE` clause so that an
//! out-of-scope chunk never consumes a `LIMIT` slot or gets a score.

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use memory_harness_core::claims::clamp_confidence;
use memory_harness_core::embedding::{
    decode_embedding, rank_by_similarity, similarity_from_distance, vec_to_blob,
};
use memory_harness_core::models::{
    now_ms, Chunk, Claim, ClaimStatus, ClaimType, EmbeddingCacheEntry, FileRecord, PinRecord,
    PinType, QaPair, Scope, ScoredClaim, ScoredQaPair,
};
use memory_harness_core::store::{
    CandidateFilter, ChunkCandidate, ChunkStore, ClaimFilter, ClaimSearchOptions, ClaimStore,
    pin_path, QaFilter, QaSearchOptions, QaStore, VectorPath, TASK_OWNED_DIRS,
};

use crate::migrate::{ensure_schema, SchemaStatus};

/// SQLite implementation of the storage traits.
pub struct SqliteStore {
    pool: SqlitePool,
    status: SchemaStatus,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool, status: SchemaStatus) -> Self {
        Self { pool, status }
    }

    /// Ensure the schema on `pool` and wrap it.
    pub async fn open(pool: SqlitePool, vector_dims: Option<usize>) -> Result<Self> {
        let status = ensure_schema(&pool, vector_dims).await?;
        Ok(Self::new(pool, status))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn schema_status(&self) -> &SchemaStatus {
        &self.status
    }

    // ---- pins ----

    pub async fn upsert_pin(&self, pin: &PinRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO pins (id, text, pin_type, scope, task_id, created_at, expires_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                text = excluded.text,
                pin_type = excluded.pin_type,
                scope = excluded.scope,
                task_id = excluded.task_id,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(&pin.id)
        .bind(&pin.text)
        .bind(pin.pin_type.as_str())
        .bind(pin.scope.as_str())
        .bind(&pin.task_id)
        .bind(pin.created_at)
        .bind(pin.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_pin(&self, id: &str) -> Result<Option<PinRecord>> {
        let row = sqlx::query("SELECT * FROM pins WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_pin))
    }

    /// Pins that have not expired at `now`, oldest first.
    pub async fn list_active_pins(&self, now: i64) -> Result<Vec<PinRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM pins WHERE expires_at IS NULL OR expires_at > ? ORDER BY created_at ASC, id ASC",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_pin).collect())
    }

    /// Delete a pin and its indexed chunks.
    pub async fn delete_pin(&self, id: &str) -> Result<bool> {
        let pin = match self.get_pin(id).await? {
            Some(pin) => pin,
            None => return Ok(false),
        };
        let res = sqlx::query("DELETE FROM pins WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        self.delete_file(&pin_path(&pin)).await?;
        Ok(res.rows_affected() > 0)
    }

    /// Delete every pin whose `expires_at` is at or before `now`, with its
    /// indexed chunks. Returns the number of pins removed.
    pub async fn prune_expired_pins(&self, now: i64) -> Result<u64> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM pins WHERE expires_at IS NOT NULL AND expires_at <= ?",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut removed = 0;
        for id in &ids {
            if self.delete_pin(id).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Ids of every stored claim.
    pub async fn claim_ids(&self) -> Result<HashSet<String>> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM claims")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids.into_iter().collect())
    }

    // ---- transient buffer ----

    /// Append an item to the transient buffer, returning its id.
    pub async fn push_transient(&self, kind: &str, content: &str, now: i64) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        sqlx::query("INSERT INTO transient_items (id, kind, content, created_at) VALUES (?, ?, ?, ?)")
            .bind(&id)
            .bind(kind)
            .bind(content)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(id)
    }

    pub async fn count_transient(&self) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM transient_items")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    /// Delete transient items created before `cutoff`.
    pub async fn prune_transient(&self, cutoff: i64) -> Result<u64> {
        let res = sqlx::query("DELETE FROM transient_items WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    // ---- maintenance ----

    /// `PRAGMA wal_checkpoint(TRUNCATE)`; returns the checkpointed frames.
    pub async fn checkpoint_wal(&self) -> Result<u64> {
        let row = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .fetch_one(&self.pool)
            .await?;
        let busy: i64 = row.try_get(0)?;
        let checkpointed: i64 = row.try_get(2)?;
        if busy != 0 {
            debug!("wal checkpoint could not complete, database busy");
        }
        Ok(checkpointed.max(0) as u64)
    }

    /// Chunks of `path` in line order.
    pub async fn chunks_for_path(&self, path: &str) -> Result<Vec<Chunk>> {
        let rows = sqlx::query("SELECT * FROM chunks WHERE path = ? ORDER BY start_line ASC, id ASC")
            .bind(path)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_chunk).collect())
    }

    async fn fallback_vector_scan(
        &self,
        query_vec: &[f32],
        filter: &CandidateFilter,
        limit: usize,
    ) -> Result<Vec<ChunkCandidate>> {
        let where_ = chunk_filter_sql(filter, true);
        let sql = format!(
            "SELECT id, path, source, start_line, end_line, text, embedding FROM chunks WHERE embedding IS NOT NULL{}",
            where_.clause
        );
        let mut q = sqlx::query(&sql);
        for b in &where_.binds {
            q = q.bind(b);
        }
        let rows = q.fetch_all(&self.pool).await?;

        let items: Vec<(ChunkCandidate, Vec<f32>)> = rows
            .iter()
            .filter_map(|row| {
                let blob: Option<Vec<u8>> = row.get("embedding");
                let vec = decode_embedding(blob.as_deref())?;
                let cand = row_to_candidate(row, 0.0);
                if filter.admits(&cand.path, &cand.source) {
                    Some((cand, vec))
                } else {
                    None
                }
            })
            .collect();

        Ok(
            rank_by_similarity(
                query_vec,
                items,
                f64::NEG_INFINITY,
                limit,
                |c: &ChunkCandidate| c.chunk_id.as_str(),
            )
            .into_iter()
            .map(|(mut c, sim)| {
                c.raw_score = sim;
                c
            })
            .collect(),
        )
    }

    async fn native_vector_search(
        &self,
        query_vec: &[f32],
        filter: &CandidateFilter,
        limit: usize,
    ) -> Result<Vec<ChunkCandidate>> {
        let model_clause = if filter.model.is_some() {
            " WHERE c.model = ?"
        } else {
            ""
        };
        let sql = format!(
            r#"
            SELECT c.id, c.path, c.source, c.start_line, c.end_line, c.text, knn.distance
            FROM (
                SELECT chunk_id, distance FROM chunks_vec
                WHERE embedding MATCH ? AND k = ?
            ) knn
            JOIN chunks c ON c.id = knn.chunk_id{}
            ORDER BY knn.distance ASC, c.id ASC
            "#,
            model_clause
        );
        let mut q = sqlx::query(&sql)
            .bind(vec_to_blob(query_vec))
            .bind(limit as i64);
        if let Some(ref model) = filter.model {
            q = q.bind(model);
        }
        let rows = q.fetch_all(&self.pool).await?;

        Ok(rows
            .iter()
            .map(|row| {
                let distance: f64 = row.get("distance");
                row_to_candidate(row, similarity_from_distance(distance))
            })
            .collect())
    }
}

/// `AND ...` clause plus binds for a candidate filter.
struct SqlFilter {
    clause: String,
    binds: Vec<String>,
}

fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn chunk_filter_sql(filter: &CandidateFilter, with_model: bool) -> SqlFilter {
    let mut clause = String::new();
    let mut binds = Vec::new();

    if !filter.sources.is_empty() {
        let marks = vec!["?"; filter.sources.len()].join(", ");
        clause.push_str(&format!(" AND source IN ({})", marks));
        binds.extend(filter.sources.iter().cloned());
    }

    if !filter.path_prefixes.is_empty() {
        let ors = vec!["path LIKE ? ESCAPE '\\'"; filter.path_prefixes.len()].join(" OR ");
        clause.push_str(&format!(" AND ({})", ors));
        binds.extend(
            filter
                .path_prefixes
                .iter()
                .map(|p| format!("{}%", escape_like(p))),
        );
    }

    if let Some(ref task) = filter.task_id {
        for dir in TASK_OWNED_DIRS {
            clause.push_str(
                " AND (path NOT LIKE ? ESCAPE '\\' OR path = ? OR path = ? OR path LIKE ? ESCAPE '\\')",
            );
            let escaped = escape_like(dir);
            binds.push(format!("{}_%", escaped));
            binds.push(format!("{}{}", dir, task));
            binds.push(format!("{}{}.md", dir, task));
            binds.push(format!("{}{}/%", escaped, escape_like(task)));
        }
    }

    if with_model {
        if let Some(ref model) = filter.model {
            clause.push_str(" AND model = ?");
            binds.push(model.clone());
        }
    }

    SqlFilter { clause, binds }
}

fn json_ids(raw: Option<String>) -> Vec<String> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

fn ids_json(ids: &[String]) -> String {
    serde_json::to_string(ids).unwrap_or_else(|_| "[]".to_string())
}

fn row_to_candidate(row: &SqliteRow, raw_score: f64) -> ChunkCandidate {
    ChunkCandidate {
        chunk_id: row.get("id"),
        path: row.get("path"),
        source: row.get("source"),
        start_line: row.get("start_line"),
        end_line: row.get("end_line"),
        raw_score,
        text: row.get("text"),
    }
}

fn row_to_chunk(row: &SqliteRow) -> Chunk {
    let blob: Option<Vec<u8>> = row.get("embedding");
    Chunk {
        id: row.get("id"),
        path: row.get("path"),
        source: row.get("source"),
        start_line: row.get("start_line"),
        end_line: row.get("end_line"),
        hash: row.get("hash"),
        model: row.get("model"),
        text: row.get("text"),
        embedding: decode_embedding(blob.as_deref()),
        updated_at: row.get("updated_at"),
    }
}

fn row_to_file(row: &SqliteRow) -> FileRecord {
    FileRecord {
        path: row.get("path"),
        source: row.get("source"),
        hash: row.get("hash"),
        mtime: row.get("mtime"),
        size: row.get("size"),
    }
}

fn row_to_claim(row: &SqliteRow) -> Claim {
    let claim_type: String = row.get("claim_type");
    let scope: String = row.get("scope");
    let status: String = row.get("status");
    let blob: Option<Vec<u8>> = row.get("embedding");
    Claim {
        id: row.get("id"),
        text: row.get("text"),
        claim_type: ClaimType::parse(&claim_type).unwrap_or(ClaimType::Fact),
        scope: Scope::parse(&scope).unwrap_or(Scope::Global),
        task_id: row.get("task_id"),
        status: ClaimStatus::parse(&status).unwrap_or(ClaimStatus::Unverified),
        confidence: clamp_confidence(row.get("confidence")),
        evidence_refs: json_ids(row.get("evidence_refs")),
        source_path: row.get("source_path"),
        source_start_line: row.get("source_start_line"),
        source_end_line: row.get("source_end_line"),
        embedding: decode_embedding(blob.as_deref()),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn row_to_qa(row: &SqliteRow) -> QaPair {
    let blob: Option<Vec<u8>> = row.get("question_embedding");
    QaPair {
        id: row.get("id"),
        question: row.get("question"),
        answer: row.get("answer"),
        question_embedding: decode_embedding(blob.as_deref()),
        session_key: row.get("session_key"),
        task_id: row.get("task_id"),
        claim_refs: json_ids(row.get("claim_refs")),
        chunk_refs: json_ids(row.get("chunk_refs")),
        model: row.get("model"),
        feedback: row.get("feedback"),
        correction: row.get("correction"),
        created_at: row.get("created_at"),
    }
}

fn row_to_pin(row: &SqliteRow) -> PinRecord {
    let pin_type: String = row.get("pin_type");
    let scope: String = row.get("scope");
    PinRecord {
        id: row.get("id"),
        text: row.get("text"),
        pin_type: PinType::parse(&pin_type).unwrap_or(PinType::Default),
        scope: Scope::parse(&scope).unwrap_or(Scope::Global),
        task_id: row.get("task_id"),
        created_at: row.get("created_at"),
        expires_at: row.get("expires_at"),
    }
}

#[async_trait]
impl ChunkStore for SqliteStore {
    async fn upsert_file(&self, file: &FileRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO files (path, source, hash, mtime, size)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(path) DO UPDATE SET
                source = excluded.source,
                hash = excluded.hash,
                mtime = excluded.mtime,
                size = excluded.size
            "#,
        )
        .bind(&file.path)
        .bind(&file.source)
        .bind(&file.hash)
        .bind(file.mtime)
        .bind(file.size)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_file(&self, path: &str) -> Result<Option<FileRecord>> {
        let row = sqlx::query("SELECT * FROM files WHERE path = ?")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_file))
    }

    async fn list_files(&self, source: Option<&str>) -> Result<Vec<FileRecord>> {
        let rows = match source {
            Some(src) => {
                sqlx::query("SELECT * FROM files WHERE source = ? ORDER BY path ASC")
                    .bind(src)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM files ORDER BY path ASC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(rows.iter().map(row_to_file).collect())
    }

    async fn delete_file(&self, path: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        if self.status.vector_available {
            sqlx::query("DELETE FROM chunks_vec WHERE chunk_id IN (SELECT id FROM chunks WHERE path = ?)")
                .bind(path)
                .execute(&mut *tx)
                .await?;
        }
        if self.status.fts_available {
            sqlx::query("DELETE FROM chunks_fts WHERE path = ?")
                .bind(path)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("DELETE FROM chunks WHERE path = ?")
            .bind(path)
            .execute(&mut *tx)
            .await?;
        let res = sqlx::query("DELETE FROM files WHERE path = ?")
            .bind(path)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(res.rows_affected() > 0)
    }

    async fn replace_chunks(&self, path: &str, chunks: &[Chunk]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        if self.status.vector_available {
            sqlx::query("DELETE FROM chunks_vec WHERE chunk_id IN (SELECT id FROM chunks WHERE path = ?)")
                .bind(path)
                .execute(&mut *tx)
                .await?;
        }
        if self.status.fts_available {
            sqlx::query("DELETE FROM chunks_fts WHERE path = ?")
                .bind(path)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("DELETE FROM chunks WHERE path = ?")
            .bind(path)
            .execute(&mut *tx)
            .await?;

        for chunk in chunks {
            let blob = chunk.embedding.as_deref().map(vec_to_blob);
            sqlx::query(
                r#"
                INSERT INTO chunks (id, path, source, start_line, end_line, hash, model, text, embedding, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    path = excluded.path,
                    source = excluded.source,
                    start_line = excluded.start_line,
                    end_line = excluded.end_line,
                    hash = excluded.hash,
                    model = excluded.model,
                    text = excluded.text,
                    embedding = excluded.embedding,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&chunk.id)
            .bind(&chunk.path)
            .bind(&chunk.source)
            .bind(chunk.start_line)
            .bind(chunk.end_line)
            .bind(&chunk.hash)
            .bind(&chunk.model)
            .bind(&chunk.text)
            .bind(&blob)
            .bind(chunk.updated_at)
            .execute(&mut *tx)
            .await?;

            if self.status.fts_available {
                sqlx::query(
                    "INSERT INTO chunks_fts (text, id, path, source, model, start_line, end_line) VALUES (?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(&chunk.text)
                .bind(&chunk.id)
                .bind(&chunk.path)
                .bind(&chunk.source)
                .bind(&chunk.model)
                .bind(chunk.start_line)
                .bind(chunk.end_line)
                .execute(&mut *tx)
                .await?;
            }

            if let (true, Some(blob)) = (self.status.vector_available, blob) {
                sqlx::query("INSERT OR REPLACE INTO chunks_vec (chunk_id, embedding) VALUES (?, ?)")
                    .bind(&chunk.id)
                    .bind(blob)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_cached_embedding(
        &self,
        provider: &str,
        model: &str,
        provider_key: &str,
        hash: &str,
    ) -> Result<Option<Vec<f32>>> {
        let blob: Option<Vec<u8>> = sqlx::query_scalar(
            "SELECT embedding FROM embedding_cache WHERE provider = ? AND model = ? AND provider_key = ? AND hash = ?",
        )
        .bind(provider)
        .bind(model)
        .bind(provider_key)
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(decode_embedding(blob.as_deref()))
    }

    async fn put_cached_embedding(&self, entry: &EmbeddingCacheEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO embedding_cache (provider, model, provider_key, hash, embedding, dims, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(provider, model, provider_key, hash) DO UPDATE SET
                embedding = excluded.embedding,
                dims = excluded.dims,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&entry.provider)
        .bind(&entry.model)
        .bind(&entry.provider_key)
        .bind(&entry.hash)
        .bind(vec_to_blob(&entry.embedding))
        .bind(entry.dims as i64)
        .bind(entry.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn keyword_available(&self) -> bool {
        self.status.fts_available
    }

    fn native_vector_available(&self) -> bool {
        self.status.vector_available
    }

    async fn keyword_search(
        &self,
        match_expr: &str,
        filter: &CandidateFilter,
        limit: usize,
    ) -> Result<Vec<ChunkCandidate>> {
        if !self.status.fts_available || match_expr.trim().is_empty() {
            return Ok(Vec::new());
        }

        let where_ = chunk_filter_sql(filter, false);
        let sql = format!(
            r#"
            SELECT id, path, source,
                   CAST(start_line AS INTEGER) AS start_line,
                   CAST(end_line AS INTEGER) AS end_line,
                   text, rank
            FROM chunks_fts
            WHERE chunks_fts MATCH ?{}
            ORDER BY rank ASC, id ASC
            LIMIT ?
            "#,
            where_.clause
        );
        let mut q = sqlx::query(&sql).bind(match_expr);
        for b in &where_.binds {
            q = q.bind(b);
        }
        q = q.bind(limit as i64);

        let rows = match q.fetch_all(&self.pool).await {
            Ok(rows) => rows,
            Err(e) => {
                debug!(error = %e, match_expr, "keyword query rejected");
                return Ok(Vec::new());
            }
        };

        Ok(rows
            .iter()
            .map(|row| {
                let rank: f64 = row.get("rank");
                row_to_candidate(row, rank)
            })
            .filter(|c| filter.admits(&c.path, &c.source))
            .collect())
    }

    async fn vector_search(
        &self,
        query_vec: &[f32],
        filter: &CandidateFilter,
        limit: usize,
        path: VectorPath,
    ) -> Result<Vec<ChunkCandidate>> {
        if query_vec.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        match path {
            VectorPath::Native if self.status.vector_available && !filter.is_scoped() => {
                self.native_vector_search(query_vec, filter, limit).await
            }
            // The KNN index has no scope columns; scoped queries scan.
            _ => self.fallback_vector_scan(query_vec, filter, limit).await,
        }
    }
}

#[async_trait]
impl ClaimStore for SqliteStore {
    async fn upsert_claim(&self, claim: &Claim) -> Result<()> {
        let blob = claim.embedding.as_deref().map(vec_to_blob);
        sqlx::query(
            r#"
            INSERT INTO claims (id, text, claim_type, scope, task_id, status, confidence,
                                evidence_refs, source_path, source_start_line, source_end_line,
                                embedding, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                text = excluded.text,
                claim_type = excluded.claim_type,
                scope = excluded.scope,
                task_id = excluded.task_id,
                status = excluded.status,
                confidence = excluded.confidence,
                evidence_refs = excluded.evidence_refs,
                source_path = excluded.source_path,
                source_start_line = excluded.source_start_line,
                source_end_line = excluded.source_end_line,
                embedding = excluded.embedding,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&claim.id)
        .bind(&claim.text)
        .bind(claim.claim_type.as_str())
        .bind(claim.scope.as_str())
        .bind(&claim.task_id)
        .bind(claim.status.as_str())
        .bind(clamp_confidence(claim.confidence))
        .bind(ids_json(&claim.evidence_refs))
        .bind(&claim.source_path)
        .bind(claim.source_start_line)
        .bind(claim.source_end_line)
        .bind(&blob)
        .bind(claim.created_at)
        .bind(claim.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_claim(&self, id: &str) -> Result<Option<Claim>> {
        let row = sqlx::query("SELECT * FROM claims WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_claim))
    }

    async fn delete_claim(&self, id: &str) -> Result<bool> {
        let res = sqlx::query("DELETE FROM claims WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn update_claim_status(
        &self,
        id: &str,
        status: ClaimStatus,
        now: Option<i64>,
    ) -> Result<bool> {
        let res = sqlx::query("UPDATE claims SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(now.unwrap_or_else(now_ms))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn update_claim_confidence(
        &self,
        id: &str,
        confidence: f64,
        status: ClaimStatus,
        now: i64,
    ) -> Result<bool> {
        let res = sqlx::query(
            "UPDATE claims SET confidence = ?, status = ?, updated_at = ? WHERE id = ?",
        )
        .bind(clamp_confidence(confidence))
        .bind(status.as_str())
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn list_claims(&self, filter: &ClaimFilter) -> Result<Vec<Claim>> {
        let mut sql = String::from("SELECT * FROM claims WHERE 1 = 1");
        let mut binds: Vec<String> = Vec::new();
        if let Some(scope) = filter.scope {
            sql.push_str(" AND scope = ?");
            binds.push(scope.as_str().to_string());
        }
        if let Some(ref task) = filter.task_id {
            sql.push_str(" AND task_id = ?");
            binds.push(task.clone());
        }
        if let Some(status) = filter.status {
            sql.push_str(" AND status = ?");
            binds.push(status.as_str().to_string());
        }
        if let Some(claim_type) = filter.claim_type {
            sql.push_str(" AND claim_type = ?");
            binds.push(claim_type.as_str().to_string());
        }
        sql.push_str(" ORDER BY updated_at DESC, id ASC LIMIT ?");

        let mut q = sqlx::query(&sql);
        for b in &binds {
            q = q.bind(b);
        }
        let rows = q.bind(filter.limit as i64).fetch_all(&self.pool).await?;
        Ok(rows.iter().map(row_to_claim).collect())
    }

    async fn search_claims_by_vector(
        &self,
        query_vec: &[f32],
        opts: &ClaimSearchOptions,
    ) -> Result<Vec<ScoredClaim>> {
        if query_vec.is_empty() {
            return Ok(Vec::new());
        }

        let mut sql = String::from("SELECT * FROM claims WHERE embedding IS NOT NULL");
        let mut binds: Vec<String> = Vec::new();
        if let Some(scope) = opts.scope {
            sql.push_str(" AND scope = ?");
            binds.push(scope.as_str().to_string());
        }
        if let Some(ref task) = opts.task_id {
            sql.push_str(" AND task_id = ?");
            binds.push(task.clone());
        }
        if let Some(ref statuses) = opts.status_filter {
            if statuses.is_empty() {
                return Ok(Vec::new());
            }
            let marks = vec!["?"; statuses.len()].join(", ");
            sql.push_str(&format!(" AND status IN ({})", marks));
            binds.extend(statuses.iter().map(|s| s.as_str().to_string()));
        }

        let mut q = sqlx::query(&sql);
        for b in &binds {
            q = q.bind(b);
        }
        let rows = q.fetch_all(&self.pool).await?;

        let items: Vec<(Claim, Vec<f32>)> = rows
            .iter()
            .map(row_to_claim)
            .filter_map(|mut c| c.embedding.take().map(|e| (c, e)))
            .collect();

        Ok(
            rank_by_similarity(query_vec, items, opts.min_score, opts.limit, |c: &Claim| {
                c.id.as_str()
            })
                .into_iter()
                .map(|(claim, similarity)| ScoredClaim { claim, similarity })
                .collect(),
        )
    }
}

#[async_trait]
impl QaStore for SqliteStore {
    async fn store_qa_pair(&self, pair: &QaPair) -> Result<()> {
        let blob = pair.question_embedding.as_deref().map(vec_to_blob);
        sqlx::query(
            r#"
            INSERT INTO qa_pairs (id, question, answer, question_embedding, session_key, task_id,
                                  claim_refs, chunk_refs, model, feedback, correction, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                question = excluded.question,
                answer = excluded.answer,
                question_embedding = excluded.question_embedding,
                session_key = excluded.session_key,
                task_id = excluded.task_id,
                claim_refs = excluded.claim_refs,
                chunk_refs = excluded.chunk_refs,
                model = excluded.model,
                feedback = excluded.feedback,
                correction = excluded.correction
            "#,
        )
        .bind(&pair.id)
        .bind(&pair.question)
        .bind(&pair.answer)
        .bind(&blob)
        .bind(&pair.session_key)
        .bind(&pair.task_id)
        .bind(ids_json(&pair.claim_refs))
        .bind(ids_json(&pair.chunk_refs))
        .bind(&pair.model)
        .bind(&pair.feedback)
        .bind(&pair.correction)
        .bind(pair.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_qa_pair(&self, id: &str) -> Result<Option<QaPair>> {
        let row = sqlx::query("SELECT * FROM qa_pairs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_qa))
    }

    async fn list_qa_pairs(&self, filter: &QaFilter) -> Result<Vec<QaPair>> {
        let mut sql = String::from("SELECT * FROM qa_pairs WHERE 1 = 1");
        let mut binds: Vec<String> = Vec::new();
        if let Some(ref key) = filter.session_key {
            sql.push_str(" AND session_key = ?");
            binds.push(key.clone());
        }
        if let Some(ref task) = filter.task_id {
            sql.push_str(" AND task_id = ?");
            binds.push(task.clone());
        }
        sql.push_str(" ORDER BY created_at DESC, id ASC LIMIT ?");

        let mut q = sqlx::query(&sql);
        for b in &binds {
            q = q.bind(b);
        }
        let rows = q.bind(filter.limit as i64).fetch_all(&self.pool).await?;
        Ok(rows.iter().map(row_to_qa).collect())
    }

    async fn update_qa_feedback(
        &self,
        id: &str,
        feedback: &str,
        correction: Option<&str>,
    ) -> Result<bool> {
        let res = sqlx::query("UPDATE qa_pairs SET feedback = ?, correction = ? WHERE id = ?")
            .bind(feedback)
            .bind(correction)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn search_qa_by_vector(
        &self,
        query_vec: &[f32],
        opts: &QaSearchOptions,
    ) -> Result<Vec<ScoredQaPair>> {
        if query_vec.is_empty() {
            return Ok(Vec::new());
        }

        let mut sql = String::from("SELECT * FROM qa_pairs WHERE question_embedding IS NOT NULL");
        let mut binds: Vec<String> = Vec::new();
        if let Some(ref key) = opts.session_key {
            sql.push_str(" AND session_key = ?");
            binds.push(key.clone());
        }
        if let Some(ref task) = opts.task_id {
            sql.push_str(" AND task_id = ?");
            binds.push(task.clone());
        }

        let mut q = sqlx::query(&sql);
        for b in &binds {
            q = q.bind(b);
        }
        let rows = q.fetch_all(&self.pool).await?;

        let items: Vec<(QaPair, Vec<f32>)> = rows
            .iter()
            .map(row_to_qa)
            .filter_map(|mut p| p.question_embedding.take().map(|e| (p, e)))
            .collect();

        Ok(
            rank_by_similarity(query_vec, items, opts.min_score, opts.limit, |p: &QaPair| {
                p.id.as_str()
            })
                .into_iter()
                .map(|(pair, similarity)| ScoredQaPair { pair, similarity })
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("a_b%c\\"), "a\\_b\\%c\\\\");
    }

    #[test]
    fn test_task_filter_sql_binds() {
        let filter = CandidateFilter {
            task_id: Some("t_1".to_string()),
            ..Default::default()
        };
        let f = chunk_filter_sql(&filter, false);
        assert_eq!(f.binds.len(), 8);
        assert_eq!(f.binds[0], "memory/tasks/_%");
        assert_eq!(f.binds[1], "memory/tasks/t_1");
        assert_eq!(f.binds[2], "memory/tasks/t_1.md");
        assert_eq!(f.binds[3], "memory/tasks/t\\_1/%");
        assert_eq!(f.binds[4], "pins/tasks/_%");
        assert_eq!(f.binds[7], "pins/tasks/t\\_1/%");
    }

    #[test]
    fn test_model_clause_only_when_requested() {
        let filter = CandidateFilter {
            model: Some("m".to_string()),
            ..Default::default()
        };
        assert!(chunk_filter_sql(&filter, false).clause.is_empty());
        assert_eq!(chunk_filter_sql(&filter, true).binds, vec!["m".to_string()]);
    }
}
