//! Configuration parsing and validation.
//!
//! Memory Harness is configured via a TOML file. Every section has
//! defaults, so an empty file (or no file, via [`Config::default`]) is a
//! valid configuration with embeddings disabled.
//!
//! # Example
//!
//! ```toml
//! [db]
//! path = "./data/memory.sqlite"
//!
//! [workspace]
//! dir = "."
//!
//! [retrieval]
//! vector_weight = 0.7
//! text_weight = 0.3
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! dims = 1536
//! ```

use anyhow::{bail, Context, Result};
use memory_harness_core::breaker::BreakerConfig;
use memory_harness_core::chunk::ChunkingParams;
use memory_harness_core::promotion::PromotionThresholds;
use memory_harness_core::ranking::RankingPolicy;
use memory_harness_core::search::{SearchParams, SearchWeights};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub db: DbConfig,
    pub workspace: WorkspaceConfig,
    pub chunking: ChunkingParams,
    pub retrieval: RetrievalConfig,
    pub ranking: RankingPolicy,
    pub embedding: EmbeddingConfig,
    pub breaker: BreakerConfig,
    pub promotion: PromotionThresholds,
    pub retention: RetentionConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
    /// Loadable SQLite extension providing `vec0` (e.g. sqlite-vec).
    #[serde(default)]
    pub vector_extension: Option<PathBuf>,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            vector_extension: None,
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/memory.sqlite")
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkspaceConfig {
    #[serde(default = "default_workspace_dir")]
    pub dir: PathBuf,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            dir: default_workspace_dir(),
        }
    }
}

fn default_workspace_dir() -> PathBuf {
    PathBuf::from(".")
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_vector_weight")]
    pub vector_weight: f64,
    #[serde(default = "default_text_weight")]
    pub text_weight: f64,
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: f64,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default = "default_min_score")]
    pub min_score: f64,
    #[serde(default = "default_snippet_max_chars")]
    pub snippet_max_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            vector_weight: default_vector_weight(),
            text_weight: default_text_weight(),
            candidate_multiplier: default_candidate_multiplier(),
            max_results: default_max_results(),
            min_score: default_min_score(),
            snippet_max_chars: default_snippet_max_chars(),
        }
    }
}

fn default_vector_weight() -> f64 {
    0.7
}
fn default_text_weight() -> f64 {
    0.3
}
fn default_candidate_multiplier() -> f64 {
    4.0
}
fn default_max_results() -> usize {
    6
}
fn default_min_score() -> f64 {
    0.35
}
fn default_snippet_max_chars() -> usize {
    700
}

impl RetrievalConfig {
    pub fn weights(&self) -> SearchWeights {
        SearchWeights {
            vector: self.vector_weight,
            text: self.text_weight,
        }
    }

    pub fn search_params(&self, ranking: RankingPolicy) -> SearchParams {
        SearchParams {
            limit: self.max_results,
            min_score: self.min_score,
            candidate_multiplier: self.candidate_multiplier,
            snippet_max_chars: self.snippet_max_chars,
            ranking,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Endpoint override (OpenAI-compatible base URL or Ollama host).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetentionConfig {
    #[serde(default = "default_retention_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_true")]
    pub wal_compaction: bool,
    #[serde(default = "default_true")]
    pub transient_prune: bool,
    #[serde(default = "default_transient_ttl_secs")]
    pub transient_ttl_secs: u64,
    #[serde(default = "default_true")]
    pub pin_prune: bool,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: default_retention_cooldown_secs(),
            wal_compaction: true,
            transient_prune: true,
            transient_ttl_secs: default_transient_ttl_secs(),
            pin_prune: true,
        }
    }
}

fn default_retention_cooldown_secs() -> u64 {
    60
}
fn default_transient_ttl_secs() -> u64 {
    86_400
}
fn default_true() -> bool {
    true
}

/// Parse a config from TOML text and validate it.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Read, parse and validate a config file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

fn validate(config: &Config) -> Result<()> {
    // Chunking
    if config.chunking.max_tokens == 0 {
        bail!("chunking.max_tokens must be > 0");
    }
    if config.chunking.overlap_tokens >= config.chunking.max_tokens {
        bail!("chunking.overlap_tokens must be < chunking.max_tokens");
    }

    // Retrieval
    let r = &config.retrieval;
    if !(0.0..=1.0).contains(&r.vector_weight) || !(0.0..=1.0).contains(&r.text_weight) {
        bail!("retrieval weights must be in [0.0, 1.0]");
    }
    if r.vector_weight == 0.0 && r.text_weight == 0.0 {
        bail!("retrieval.vector_weight and retrieval.text_weight cannot both be 0");
    }
    if !(r.candidate_multiplier >= 1.0) {
        bail!("retrieval.candidate_multiplier must be >= 1");
    }
    if r.max_results == 0 {
        bail!("retrieval.max_results must be >= 1");
    }
    if !(0.0..=1.0).contains(&r.min_score) {
        bail!("retrieval.min_score must be in [0.0, 1.0]");
    }

    // Ranking
    let k = &config.ranking;
    if !(k.relative_epsilon >= 0.0 && k.absolute_epsilon >= 0.0 && k.override_delta >= 0.0) {
        bail!("ranking epsilons and override_delta must be >= 0");
    }

    // Promotion
    let p = &config.promotion;
    if !(p.deprecate_threshold < p.verify_threshold) {
        bail!("promotion.deprecate_threshold must be < promotion.verify_threshold");
    }
    if !(p.positive_boost >= 0.0 && p.negative_penalty >= 0.0) {
        bail!("promotion.positive_boost and promotion.negative_penalty must be >= 0");
    }

    // Breaker
    let b = &config.breaker;
    if b.failure_threshold == 0 {
        bail!("breaker.failure_threshold must be >= 1");
    }
    if b.base_cooldown_secs > b.max_cooldown_secs {
        bail!("breaker.base_cooldown_secs must be <= breaker.max_cooldown_secs");
    }

    // Embedding
    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }
    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.batch_size == 0 {
            bail!("embedding.batch_size must be > 0");
        }
    }

    Ok(())
}
