//! Embedding capability and backends.
//!
//! Defines the [`EmbeddingProvider`] trait and its implementations:
//! - **[`DisabledEmbedder`]**: always fails; used when `embedding.provider = "disabled"`.
//! - **[`OpenAIEmbedder`]**: `POST {base}/v1/embeddings` (OpenAI or any compatible gateway).
//! - **[`OllamaEmbedder`]**: `POST {url}/api/embed` on a local Ollama instance.
//!
//! Providers make exactly one HTTP call per [`EmbeddingProvider::embed`] and
//! classify failures as transient or permanent. Batching, concurrency and
//! retry live in [`batch::EmbeddingBatcher`].
//!
//! Also provides the vector helpers used by the SQLite vector index:
//! - [`cosine_similarity`]
//! - [`vec_to_blob`] / [`blob_to_vec`] (little-endian `f32` BLOBs)

pub mod batch;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::chunk::CHARS_PER_TOKEN;
use crate::config::Config;
use crate::error::ProviderError;

/// Vectors for one batch, in input order.
#[derive(Debug, Clone, Default)]
pub struct Embedded {
    pub vectors: Vec<Vec<f32>>,
    /// Tokens billed for the batch, when the provider reports them.
    pub tokens: Option<u64>,
}

/// A backend that turns texts into embedding vectors.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Short backend name, e.g. `"openai"`.
    fn provider_name(&self) -> &str;
    /// Model identifier recorded in the ledger, e.g. `"text-embedding-3-small"`.
    fn model_name(&self) -> &str;
    /// Expected dimensionality, when configured.
    fn dims(&self) -> Option<usize>;
    /// Embed one batch. One request, no retry.
    async fn embed(&self, texts: &[String]) -> Result<Embedded, ProviderError>;
}

/// Embed a single query text, returning its vector and token usage.
pub async fn embed_query(
    provider: &dyn EmbeddingProvider,
    text: &str,
) -> Result<(Vec<f32>, u64), ProviderError> {
    let texts = [text.to_string()];
    let embedded = provider.embed(&texts).await?;
    let tokens = embedded
        .tokens
        .unwrap_or_else(|| estimate_tokens(&texts));
    let vector = embedded.vectors.into_iter().next().ok_or_else(|| {
        ProviderError::permanent(provider.provider_name(), "empty embedding response")
    })?;
    Ok((vector, tokens))
}

/// Rough token count for providers that do not report usage.
pub fn estimate_tokens(texts: &[String]) -> u64 {
    texts
        .iter()
        .map(|t| t.len().div_ceil(CHARS_PER_TOKEN) as u64)
        .sum()
}

// ============ Disabled Provider ============

pub struct DisabledEmbedder;

#[async_trait]
impl EmbeddingProvider for DisabledEmbedder {
    fn provider_name(&self) -> &str {
        "disabled"
    }
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> Option<usize> {
        None
    }
    async fn embed(&self, _texts: &[String]) -> Result<Embedded, ProviderError> {
        Err(ProviderError::NotConfigured("embedding".to_string()))
    }
}

// ============ OpenAI Provider ============

/// Embedding provider for the OpenAI embeddings API.
pub struct OpenAIEmbedder {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    dims: Option<usize>,
}

impl OpenAIEmbedder {
    pub fn new(
        api_key: String,
        base_url: &str,
        model: String,
        dims: Option<usize>,
        timeout: Duration,
    ) -> Result<Self> {
        anyhow::ensure!(!api_key.trim().is_empty(), "missing OpenAI API key");
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build OpenAI HTTP client")?;
        Ok(Self {
            client,
            endpoint: format!("{}/v1/embeddings", base_url.trim_end_matches('/')),
            api_key,
            model,
            dims,
        })
    }
}

#[derive(Serialize)]
struct OpenAIEmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct OpenAIEmbeddingResponse {
    data: Vec<OpenAIEmbeddingData>,
    #[serde(default)]
    usage: Option<OpenAIEmbeddingUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIEmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

#[derive(Debug, Deserialize)]
struct OpenAIEmbeddingUsage {
    total_tokens: u64,
}

#[async_trait]
impl EmbeddingProvider for OpenAIEmbedder {
    fn provider_name(&self) -> &str {
        "openai"
    }
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> Option<usize> {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Embedded, ProviderError> {
        if texts.is_empty() {
            return Ok(Embedded::default());
        }

        // Only the v3 models accept a `dimensions` parameter
        let dimensions = self.dims.filter(|_| self.model.starts_with("text-embedding-3"));
        let request = OpenAIEmbeddingRequest {
            model: &self.model,
            input: texts,
            dimensions,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest("openai", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status("openai", status, &body));
        }

        let parsed: OpenAIEmbeddingResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::permanent("openai", format!("invalid response: {}", e)))?;
        Ok(parse_openai_response(parsed))
    }
}

fn parse_openai_response(mut parsed: OpenAIEmbeddingResponse) -> Embedded {
    // Sort by index to ensure order matches input
    parsed.data.sort_by_key(|d| d.index);
    Embedded {
        vectors: parsed.data.into_iter().map(|d| d.embedding).collect(),
        tokens: parsed.usage.map(|u| u.total_tokens),
    }
}

// ============ Ollama Provider ============

/// Embedding provider for a local Ollama instance.
///
/// Requires an embedding model to be pulled, e.g. `ollama pull nomic-embed-text`.
pub struct OllamaEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
    dims: Option<usize>,
}

impl OllamaEmbedder {
    pub fn new(url: &str, model: String, dims: Option<usize>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build Ollama HTTP client")?;
        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            model,
            dims,
        })
    }
}

#[derive(Debug, Deserialize)]
struct OllamaEmbedResponse {
    embeddings: Vec<Vec<f32>>,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbedder {
    fn provider_name(&self) -> &str {
        "ollama"
    }
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> Option<usize> {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Embedded, ProviderError> {
        if texts.is_empty() {
            return Ok(Embedded::default());
        }

        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post(format!("{}/api/embed", self.url))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                ProviderError::transient(
                    "ollama",
                    format!("connection error (is Ollama running at {}?): {}", self.url, e),
                )
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status("ollama", status, &body));
        }

        let parsed: OllamaEmbedResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::permanent("ollama", format!("invalid response: {}", e)))?;
        Ok(Embedded {
            vectors: parsed.embeddings,
            tokens: parsed.prompt_eval_count,
        })
    }
}

/// Create the configured [`EmbeddingProvider`].
///
/// | `embedding.provider` | Provider |
/// |----------------------|----------|
/// | `"disabled"` | [`DisabledEmbedder`] |
/// | `"openai"` | [`OpenAIEmbedder`] (key from `providers.openai.api_key_env`) |
/// | `"ollama"` | [`OllamaEmbedder`] (`embedding.url` or `providers.ollama.base_url`) |
pub fn create_embedder(config: &Config) -> Result<Arc<dyn EmbeddingProvider>> {
    let embedding = &config.embedding;
    let timeout = Duration::from_secs(embedding.timeout_secs);
    match embedding.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledEmbedder)),
        "openai" => {
            let api_key = config.providers.api_key("openai").ok_or_else(|| {
                anyhow::anyhow!("OpenAI API key not set (see providers.openai.api_key_env)")
            })?;
            let base_url = embedding
                .url
                .clone()
                .unwrap_or_else(|| config.providers.base_url("openai"));
            Ok(Arc::new(OpenAIEmbedder::new(
                api_key,
                &base_url,
                embedding.model.clone(),
                embedding.dims,
                timeout,
            )?))
        }
        "ollama" => {
            let url = embedding
                .url
                .clone()
                .unwrap_or_else(|| config.providers.base_url("ollama"));
            Ok(Arc::new(OllamaEmbedder::new(
                &url,
                embedding.model.clone(),
                embedding.dims,
                timeout,
            )?))
        }
        other => bail!("Unknown embedding provider: {}", other),
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB written by [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`.
///
/// Returns `0.0` for empty vectors, vectors of different lengths, or
/// zero-norm vectors.
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

    (dot / denom).clamp(-1.0, 1.0)
}
