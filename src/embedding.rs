//! Embedding providers.
//!
//! Concrete [`Embedder`] implementations selected by `embedding.provider`:
//!
//! | Config Value | Embedder |
//! |-------------|----------|
//! | `"disabled"` | [`DisabledEmbedder`] |
//! | `"openai"` | [`OpenAiEmbedder`] |
//! | `"ollama"` | [`OllamaEmbedder`] |
//!
//! # Retry Strategy
//!
//! Both HTTP providers use exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)
//!
//! A call that still fails after its retries is one failure from the
//! point of view of the circuit breaker.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use memory_harness_core::embedding::Embedder;

use crate::config::EmbeddingConfig;

const OPENAI_DEFAULT_URL: &str = "https://api.openai.com/v1";
const OLLAMA_DEFAULT_URL: &str = "http://localhost:11434";

/// Build the configured embedder.
///
/// ```rust
/// # use memory_harness::config::EmbeddingConfig;
/// # use memory_harness::embedding::create_embedder;
/// let embedder = create_embedder(&EmbeddingConfig::default()).unwrap();
/// assert_eq!(embedder.provider(), "disabled");
/// ```
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Box<dyn Embedder>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledEmbedder)),
        "openai" => Ok(Box::new(OpenAiEmbedder::new(config)?)),
        "ollama" => Ok(Box::new(OllamaEmbedder::new(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

/// Cache-key component for an endpoint and width.
pub fn provider_key(url: &str, dims: usize) -> String {
    format!("{}#{}", url.trim_end_matches('/'), dims)
}

// ============ Disabled ============

/// Embedder used when `embedding.provider = "disabled"`; every call fails.
pub struct DisabledEmbedder;

#[async_trait]
impl Embedder for DisabledEmbedder {
    fn provider(&self) -> &str {
        "disabled"
    }
    fn model(&self) -> &str {
        "disabled"
    }
    fn provider_key(&self) -> &str {
        ""
    }
    async fn embed_query(&self, _text: &str) -> Result<Vec<f32>> {
        bail!("Embedding provider is disabled")
    }
    async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        bail!("Embedding provider is disabled")
    }
}

// ============ shared HTTP plumbing ============

struct HttpSettings {
    client: reqwest::Client,
    model: String,
    dims: usize,
    url: String,
    key: String,
    max_retries: u32,
}

impl HttpSettings {
    fn new(config: &EmbeddingConfig, label: &str, default_url: &str) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("embedding.model required for {} provider", label))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow!("embedding.dims required for {} provider", label))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| default_url.to_string())
            .trim_end_matches('/')
            .to_string();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            key: provider_key(&url, dims),
            model,
            dims,
            url,
            max_retries: config.max_retries,
        })
    }

    fn check_dims(&self, vectors: &[Vec<f32>]) -> Result<()> {
        if let Some(v) = vectors.iter().find(|v| v.len() != self.dims) {
            bail!(
                "embedding has {} dimensions, expected {}",
                v.len(),
                self.dims
            );
        }
        Ok(())
    }
}

/// POST `body` to `endpoint` with retry/backoff, returning the JSON body of
/// the first successful response.
async fn post_with_backoff(
    settings: &HttpSettings,
    endpoint: &str,
    bearer: Option<&str>,
    body: &serde_json::Value,
    label: &str,
) -> Result<serde_json::Value> {
    let mut last_err = None;

    for attempt in 0..=settings.max_retries {
        if attempt > 0 {
            // Exponential backoff: 1s, 2s, 4s, 8s, ...
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            debug!(attempt, ?delay, provider = label, "retrying embedding request");
            tokio::time::sleep(delay).await;
        }

        let mut req = settings
            .client
            .post(endpoint)
            .header("Content-Type", "application/json")
            .json(body);
        if let Some(token) = bearer {
            req = req.header("Authorization", format!("Bearer {}", token));
        }

        match req.send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    return Ok(response.json().await?);
                }

                // Rate limited or server error, retry
                if status.as_u16() == 429 || status.is_server_error() {
                    let body_text = response.text().await.unwrap_or_default();
                    last_err = Some(anyhow!("{} API error {}: {}", label, status, body_text));
                    continue;
                }

                let body_text = response.text().await.unwrap_or_default();
                bail!("{} API error {}: {}", label, status, body_text);
            }
            Err(e) => {
                last_err = Some(anyhow!(
                    "{} connection error ({}): {}",
                    label,
                    settings.url,
                    e
                ));
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("{} embedding failed after retries", label)))
}

fn json_vector(value: &serde_json::Value, label: &str) -> Result<Vec<f32>> {
    Ok(value
        .as_array()
        .ok_or_else(|| anyhow!("Invalid {} response: embedding is not an array", label))?
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect())
}

// ============ OpenAI ============

/// Embedder for the OpenAI `POST /embeddings` API (or any compatible
/// endpoint set via `embedding.url`). Reads `OPENAI_API_KEY`.
pub struct OpenAiEmbedder {
    settings: HttpSettings,
    api_key: String,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let settings = HttpSettings::new(config, "OpenAI", OPENAI_DEFAULT_URL)?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?;
        Ok(Self { settings, api_key })
    }
}

/// Extract `data[].embedding`, ordered by `data[].index` when present.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);
        let embedding = item
            .get("embedding")
            .ok_or_else(|| anyhow!("Invalid OpenAI response: missing embedding"))?;
        indexed.push((index, json_vector(embedding, "OpenAI")?));
    }

    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn provider(&self) -> &str {
        "openai"
    }
    fn model(&self) -> &str {
        &self.settings.model
    }
    fn provider_key(&self) -> &str {
        &self.settings.key
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("Empty embedding response"))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::json!({
            "model": self.settings.model,
            "input": texts,
        });
        let endpoint = format!("{}/embeddings", self.settings.url);
        let json =
            post_with_backoff(&self.settings, &endpoint, Some(&self.api_key), &body, "OpenAI")
                .await?;
        let vectors = parse_openai_response(&json)?;
        if vectors.len() != texts.len() {
            bail!(
                "OpenAI returned {} embeddings for {} inputs",
                vectors.len(),
                texts.len()
            );
        }
        self.settings.check_dims(&vectors)?;
        Ok(vectors)
    }
}

// ============ Ollama ============

/// Embedder for a local Ollama instance's `POST /api/embed` endpoint.
pub struct OllamaEmbedder {
    settings: HttpSettings,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        Ok(Self {
            settings: HttpSettings::new(config, "Ollama", OLLAMA_DEFAULT_URL)?,
        })
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    json.get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow!("Invalid Ollama response: missing embeddings array"))?
        .iter()
        .map(|e| json_vector(e, "Ollama"))
        .collect()
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn provider(&self) -> &str {
        "ollama"
    }
    fn model(&self) -> &str {
        &self.settings.model
    }
    fn provider_key(&self) -> &str {
        &self.settings.key
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("Empty embedding response"))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::json!({
            "model": self.settings.model,
            "input": texts,
        });
        let endpoint = format!("{}/api/embed", self.settings.url);
        let json = post_with_backoff(&self.settings, &endpoint, None, &body, "Ollama").await?;
        let vectors = parse_ollama_response(&json)?;
        if vectors.len() != texts.len() {
            bail!(
                "Ollama returned {} embeddings for {} inputs",
                vectors.len(),
                texts.len()
            );
        }
        self.settings.check_dims(&vectors)?;
        Ok(vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_openai_orders_by_index() {
        let json = serde_json::json!({
            "data": [
                {"index": 1, "embedding": [0.0, 1.0]},
                {"index": 0, "embedding": [1.0, 0.0]}
            ]
        });
        let vecs = parse_openai_response(&json).unwrap();
        assert_eq!(vecs, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn test_parse_openai_missing_data() {
        assert!(parse_openai_response(&serde_json::json!({"error": "x"})).is_err());
    }

    #[test]
    fn test_parse_ollama() {
        let json = serde_json::json!({"embeddings": [[0.5, 0.25], [1.0, 0.0]]});
        let vecs = parse_ollama_response(&json).unwrap();
        assert_eq!(vecs.len(), 2);
        assert_eq!(vecs[0], vec![0.5, 0.25]);
        assert!(parse_ollama_response(&serde_json::json!({"embeddings": [1]})).is_err());
    }

    #[test]
    fn test_provider_key_normalizes_trailing_slash() {
        assert_eq!(
            provider_key("http://localhost:11434/", 768),
            provider_key("http://localhost:11434", 768)
        );
        assert_ne!(provider_key("http://a", 768), provider_key("http://a", 1024));
    }

    #[test]
    fn test_ollama_requires_model() {
        let config = EmbeddingConfig {
            provider: "ollama".to_string(),
            dims: Some(8),
            ..Default::default()
        };
        assert!(create_embedder(&config).is_err());
    }

    #[tokio::test]
    async fn test_disabled_embedder_fails() {
        let embedder = create_embedder(&EmbeddingConfig::default()).unwrap();
        assert!(embedder.embed_query("x").await.is_err());
    }

    #[tokio::test]
    async fn test_ollama_unreachable_is_an_error() {
        let config = EmbeddingConfig {
            provider: "ollama".to_string(),
            model: Some("nomic-embed-text".to_string()),
            dims: Some(8),
            url: Some("http://127.0.0.1:9".to_string()),
            max_retries: 0,
            timeout_secs: 2,
            ..Default::default()
        };
        let embedder = create_embedder(&config).unwrap();
        assert_eq!(embedder.provider_key(), "http://127.0.0.1:9#8");
        assert!(embedder.embed_batch(&["x".to_string()]).await.is_err());
    }
}
