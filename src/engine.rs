//! The memory engine facade.
//!
//! [`MemoryEngine`] ties the SQLite store, the embedder, the embedding
//! circuit breaker and the retention scheduler together behind the
//! operations an agent runtime calls: search, snippet fetch, feedback,
//! extraction, sync and retention.
//!
//! Search never fails because of the embedder. The breaker decides whether
//! the query is embedded at all; an embedding error is recorded against
//! the breaker and the search continues keyword-only.

use std::path::Path;

use anyhow::Result;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use memory_harness_core::breaker::{BreakerSnapshot, EmbeddingCircuitBreaker};
use memory_harness_core::embedding::Embedder;
use memory_harness_core::extract::{
    extract_claims_from_pins, extract_claims_from_snapshot, store_extracted_claims,
};
use memory_harness_core::models::{now_ms, TaskMemorySnapshot};
use memory_harness_core::promotion::{
    apply_implicit_acceptance, process_claim_feedback, process_qa_feedback, Feedback,
    ImplicitAcceptance, PromotionDelta,
};
use memory_harness_core::search::{search, MemorySearchResult, SearchRequest};
use memory_harness_core::store::{CandidateFilter, ChunkStore, VectorPath};

use crate::config::Config;
use crate::db;
use crate::embedding::create_embedder;
use crate::get::{read_file, FileSlice};
use crate::ingest::{sync_workspace, IndexContext, SyncReport};
use crate::retention::{default_policies, RetentionPolicy, RetentionReport, RetentionScheduler};
use crate::sqlite_store::SqliteStore;

/// Per-call search options. Unset fields use the configured defaults.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    /// Restrict task memory files to this task.
    pub task_id: Option<String>,
    pub sources: Vec<String>,
    pub path_prefixes: Vec<String>,
    pub limit: Option<usize>,
    pub min_score: Option<f64>,
}

/// Counts from one extraction call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExtractionReport {
    pub drafted: usize,
    pub written: usize,
}

pub struct MemoryEngine {
    config: Config,
    store: SqliteStore,
    embedder: Box<dyn Embedder>,
    breaker: Mutex<EmbeddingCircuitBreaker>,
    scheduler: RetentionScheduler,
    policies: Vec<Box<dyn RetentionPolicy>>,
}

impl MemoryEngine {
    /// Open the configured database and embedder.
    pub async fn open(config: Config) -> Result<Self> {
        let pool = db::connect(&config).await?;
        let dims = if config.db.vector_extension.is_some() {
            config.embedding.dims
        } else {
            None
        };
        let store = SqliteStore::open(pool, dims).await?;
        let embedder = create_embedder(&config.embedding)?;
        Ok(Self::with_parts(config, store, embedder))
    }

    /// Assemble an engine from an existing store and embedder.
    pub fn with_parts(config: Config, store: SqliteStore, embedder: Box<dyn Embedder>) -> Self {
        Self {
            breaker: Mutex::new(EmbeddingCircuitBreaker::new(config.breaker)),
            scheduler: RetentionScheduler::from_config(&config.retention),
            policies: default_policies(&config.retention),
            config,
            store,
            embedder,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    pub fn scheduler(&self) -> &RetentionScheduler {
        &self.scheduler
    }

    fn embeddings_enabled(&self) -> bool {
        self.embedder.provider() != "disabled"
    }

    fn index_context(&self) -> IndexContext<'_> {
        IndexContext {
            store: &self.store,
            embedder: self.embedder.as_ref(),
            breaker: &self.breaker,
            chunking: self.config.chunking,
            batch_size: self.config.embedding.batch_size,
            embeddings_enabled: self.embeddings_enabled(),
        }
    }

    /// Embed `query` if the breaker allows it, reporting the outcome.
    async fn embed_query_guarded(&self, query: &str) -> Option<Vec<f32>> {
        if !self.embeddings_enabled() {
            return None;
        }
        if !self.breaker.lock().await.allow_request(now_ms()) {
            debug!("embedding breaker open, searching keyword-only");
            return None;
        }

        match self.embedder.embed_query(query).await {
            Ok(vec) => {
                self.breaker.lock().await.record_success(now_ms());
                Some(vec)
            }
            Err(e) => {
                self.breaker.lock().await.record_failure(now_ms());
                warn!(error = %e, "query embedding failed, searching keyword-only");
                None
            }
        }
    }

    /// Hybrid search over the indexed memory.
    pub async fn search(
        &self,
        query: &str,
        opts: &SearchOptions,
    ) -> Result<Vec<MemorySearchResult>> {
        let query_vec = self.embed_query_guarded(query).await;
        let weights = self
            .breaker
            .lock()
            .await
            .search_weights(self.config.retrieval.weights());

        let mut params = self
            .config
            .retrieval
            .search_params(self.config.ranking);
        if let Some(limit) = opts.limit {
            params.limit = limit;
        }
        if let Some(min_score) = opts.min_score {
            params.min_score = min_score;
        }

        let filter = CandidateFilter {
            sources: opts.sources.clone(),
            path_prefixes: opts.path_prefixes.clone(),
            task_id: opts.task_id.clone(),
            model: query_vec
                .as_ref()
                .map(|_| self.embedder.model().to_string()),
        };

        let vector_path = if self.store.native_vector_available() {
            VectorPath::Native
        } else {
            VectorPath::FallbackScan
        };

        let req = SearchRequest {
            query,
            query_vec: query_vec.as_deref(),
            weights,
            filter,
            vector_path,
            params,
        };
        search(&self.store, &req).await
    }

    /// Fetch a memory file or a line window of it.
    pub fn read_file(
        &self,
        rel_path: &str,
        from_line: Option<usize>,
        lines: Option<usize>,
    ) -> Result<Option<FileSlice>> {
        read_file(&self.config.workspace.dir, rel_path, from_line, lines)
    }

    pub async fn record_claim_feedback(
        &self,
        claim_id: &str,
        feedback: Feedback,
    ) -> Result<Option<PromotionDelta>> {
        process_claim_feedback(&self.store, claim_id, feedback, &self.config.promotion).await
    }

    pub async fn record_qa_feedback(
        &self,
        qa_id: &str,
        feedback: Feedback,
        correction: Option<&str>,
    ) -> Result<Option<Vec<PromotionDelta>>> {
        process_qa_feedback(
            &self.store,
            qa_id,
            feedback,
            correction,
            &self.config.promotion,
        )
        .await
    }

    pub async fn apply_implicit_acceptance(
        &self,
        claim_id: &str,
        was_retrieved: bool,
        consecutive_non_dispute_turns: u32,
    ) -> Result<ImplicitAcceptance> {
        apply_implicit_acceptance(
            &self.store,
            claim_id,
            was_retrieved,
            consecutive_non_dispute_turns,
        )
        .await
    }

    /// Extract and store claims from a task memory snapshot.
    pub async fn extract_from_snapshot(
        &self,
        snapshot: &TaskMemorySnapshot,
    ) -> Result<ExtractionReport> {
        let existing = self.store.claim_ids().await?;
        let drafts = extract_claims_from_snapshot(snapshot, &existing, now_ms());
        let written = store_extracted_claims(&self.store, &drafts).await?;
        Ok(ExtractionReport {
            drafted: drafts.len(),
            written,
        })
    }

    /// Extract and store claims from every active pin.
    pub async fn extract_from_pins(&self) -> Result<ExtractionReport> {
        let now = now_ms();
        let pins = self.store.list_active_pins(now).await?;
        let existing = self.store.claim_ids().await?;
        let drafts = extract_claims_from_pins(&pins, &existing, now);
        let written = store_extracted_claims(&self.store, &drafts).await?;
        Ok(ExtractionReport {
            drafted: drafts.len(),
            written,
        })
    }

    /// Re-index the workspace memory files and active pins.
    pub async fn sync(&self) -> Result<SyncReport> {
        sync_workspace(&self.index_context(), &self.config.workspace.dir).await
    }

    /// Run the enabled retention policies for this workspace.
    pub async fn run_retention_policies(&self, force: bool) -> RetentionReport {
        self.run_retention_for(&self.config.workspace.dir, force)
            .await
    }

    /// Run retention keyed by an explicit workspace path.
    pub async fn run_retention_for(&self, workspace: &Path, force: bool) -> RetentionReport {
        self.scheduler
            .run(workspace, &self.store, &self.policies, force, now_ms())
            .await
    }

    pub async fn breaker_snapshot(&self) -> BreakerSnapshot {
        self.breaker.lock().await.snapshot()
    }

    /// Close the underlying pool.
    pub async fn close(self) {
        self.store.pool().close().await;
    }
}
