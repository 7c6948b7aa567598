//! Embedding provider abstraction and implementations.
//!
//! Defines the [`EmbeddingProvider`] trait and concrete backends:
//! - **[`DisabledProvider`]**: always unavailable; used when embeddings are not configured.
//! - **[`HashingProvider`]**: deterministic feature-hashed term frequencies; offline, no model.
//! - **[`OpenAIProvider`]**: calls the OpenAI embeddings API with batching, retry, and backoff.
//! - **[`OllamaProvider`]**: calls a local Ollama instance's `/api/embed` endpoint.
//! - **`LocalProvider`**: runs models in-process via fastembed (feature `local-embeddings`).
//!
//! Pipeline helpers [`embed_all`] and [`embed_query`] wrap providers with a
//! [`Deadline`] and enforce the knowledge base's vector dimension.
//!
//! # Provider Selection
//!
//! ```rust
//! # use oracle_rag::config::EmbeddingConfig;
//! # use oracle_rag::embedding::create_provider;
//! let provider = create_provider(&EmbeddingConfig::hashing(64)).unwrap();
//! assert_eq!(provider.dims(), 64);
//! assert_eq!(provider.backend(), "hashing");
//! ```
//!
//! # Retry Strategy
//!
//! The OpenAI and Ollama providers use exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cancel::Deadline;
use crate::config::EmbeddingConfig;
use crate::error::{RagError, Result};

/// Capability interface every embedding backend implements.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Backend identifier (`"openai"`, `"ollama"`, `"local"`, `"hashing"`).
    fn backend(&self) -> &str;
    /// Model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Output vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;

    /// Embed a batch; output order matches input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RagError::backend(self.backend(), "empty embedding response"))
    }
}

/// Fail with [`RagError::EmbeddingDimensionMismatch`] unless `vector` has `expected` entries.
pub fn check_dims(expected: usize, vector: &[f32]) -> Result<()> {
    if vector.len() != expected {
        return Err(RagError::EmbeddingDimensionMismatch {
            expected,
            actual: vector.len(),
        });
    }
    Ok(())
}

/// Embed `texts` in batches of `batch_size`.
///
/// Either every vector is returned or nothing is: a failure, timeout, or
/// cancellation part-way through discards the batches already embedded.
pub async fn embed_all(
    provider: &dyn EmbeddingProvider,
    texts: &[String],
    batch_size: usize,
    expected_dims: usize,
    deadline: &Deadline,
) -> Result<Vec<Vec<f32>>> {
    let mut out = Vec::with_capacity(texts.len());
    for batch in texts.chunks(batch_size.max(1)) {
        let vectors = deadline.run("embed", provider.embed_batch(batch)).await?;
        if vectors.len() != batch.len() {
            return Err(RagError::backend(
                provider.backend(),
                format!("returned {} vectors for {} inputs", vectors.len(), batch.len()),
            ));
        }
        for v in &vectors {
            check_dims(expected_dims, v)?;
        }
        out.extend(vectors);
    }
    Ok(out)
}

/// Embed a single query text under `deadline`.
pub async fn embed_query(
    provider: &dyn EmbeddingProvider,
    text: &str,
    expected_dims: usize,
    deadline: &Deadline,
) -> Result<Vec<f32>> {
    let v = deadline.run("embed", provider.embed(text)).await?;
    check_dims(expected_dims, &v)?;
    Ok(v)
}

// ============ Disabled Provider ============

/// A no-op provider whose every call fails.
pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn backend(&self) -> &str {
        "disabled"
    }
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(RagError::backend("disabled", "embedding provider is disabled"))
    }
}

// ============ Hashing Provider ============

/// Term-frequency vectors hashed into a fixed number of buckets, L2-normalised.
///
/// Needs no model download or network, and gives identical output for
/// identical text on every platform.
#[derive(Debug, Clone)]
pub struct HashingProvider {
    model: String,
    dims: usize,
}

impl HashingProvider {
    pub fn new(dims: usize) -> Result<Self> {
        if dims == 0 {
            return Err(RagError::config("hashing provider needs dims > 0"));
        }
        Ok(Self {
            model: format!("hashing-tf-{}", dims),
            dims,
        })
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dims];
        let lowered = text.to_lowercase();
        let mut tf: HashMap<&str, usize> = HashMap::new();
        for word in lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            *tf.entry(word).or_insert(0) += 1;
        }
        for (term, count) in tf {
            vector[djb2(term) % self.dims] += count as f32;
        }
        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

fn djb2(s: &str) -> usize {
    let mut hash: usize = 5381;
    for b in s.bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(b as usize);
    }
    hash
}

#[async_trait]
impl EmbeddingProvider for HashingProvider {
    fn backend(&self) -> &str {
        "hashing"
    }
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

// ============ HTTP retry loop ============

/// POST `body` to `url`, retrying 429/5xx and network errors with backoff.
async fn post_with_retry(
    backend: &str,
    client: &reqwest::Client,
    url: &str,
    bearer: Option<&str>,
    body: &serde_json::Value,
    max_retries: u32,
) -> Result<reqwest::Response> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            debug!(backend, attempt, ?delay, "retrying embedding request");
            tokio::time::sleep(delay).await;
        }

        let mut req = client.post(url).json(body);
        if let Some(key) = bearer {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        match req.send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return Ok(response);
                }
                let body_text = response.text().await.unwrap_or_default();
                if status.as_u16() == 429 || status.is_server_error() {
                    warn!(backend, %status, "transient embedding API error");
                    last_err = Some(format!("API error {}: {}", status, body_text));
                    continue;
                }
                return Err(RagError::backend(
                    backend,
                    format!("API error {}: {}", status, body_text),
                ));
            }
            Err(e) => {
                last_err = Some(format!("connection error ({}): {}", url, e));
                continue;
            }
        }
    }

    Err(RagError::backend(
        backend,
        last_err.unwrap_or_else(|| "request failed after retries".to_string()),
    ))
}

fn http_client(backend: &str, timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| RagError::backend(backend, e))
}

// ============ OpenAI Provider ============

/// Embedding provider using the OpenAI API.
///
/// Calls `POST /v1/embeddings`. Requires the `OPENAI_API_KEY` environment
/// variable.
pub struct OpenAIProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    dims: usize,
    max_retries: u32,
}

#[derive(Deserialize)]
struct OpenAIResponse {
    data: Vec<OpenAIEmbedding>,
}

#[derive(Deserialize)]
struct OpenAIEmbedding {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

impl OpenAIProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| RagError::config("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| RagError::config("embedding.dims required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| RagError::backend("openai", "OPENAI_API_KEY environment variable not set"))?;

        Ok(Self {
            client: http_client("openai", config.timeout())?,
            api_key,
            model,
            dims,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn backend(&self) -> &str {
        "openai"
    }
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let response = post_with_retry(
            "openai",
            &self.client,
            "https://api.openai.com/v1/embeddings",
            Some(&self.api_key),
            &body,
            self.max_retries,
        )
        .await?;
        let parsed: OpenAIResponse = response
            .json()
            .await
            .map_err(|e| RagError::backend("openai", format!("invalid response: {}", e)))?;
        Ok(order_by_index(parsed.data))
    }
}

fn order_by_index(mut data: Vec<OpenAIEmbedding>) -> Vec<Vec<f32>> {
    data.sort_by_key(|d| d.index);
    data.into_iter().map(|d| d.embedding).collect()
}

// ============ Ollama Provider ============

/// Embedding provider using a local Ollama instance.
///
/// Calls `POST /api/embed` on the configured URL (default `http://localhost:11434`).
pub struct OllamaProvider {
    client: reqwest::Client,
    url: String,
    model: String,
    dims: usize,
    max_retries: u32,
}

#[derive(Deserialize)]
struct OllamaResponse {
    embeddings: Vec<Vec<f32>>,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| RagError::config("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| RagError::config("embedding.dims required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());

        Ok(Self {
            client: http_client("ollama", config.timeout())?,
            url,
            model,
            dims,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn backend(&self) -> &str {
        "ollama"
    }
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let url = format!("{}/api/embed", self.url.trim_end_matches('/'));
        let response =
            post_with_retry("ollama", &self.client, &url, None, &body, self.max_retries).await?;
        let parsed: OllamaResponse = response
            .json()
            .await
            .map_err(|e| RagError::backend("ollama", format!("invalid response: {}", e)))?;
        Ok(parsed.embeddings)
    }
}

// ============ Local Provider (fastembed) ============

/// Default local model; the same one the desktop client shipped with.
pub const DEFAULT_LOCAL_MODEL: &str = "all-minilm-l6-v2";

/// Resolve the local model name and its native dimension.
pub fn resolve_local_model(config: &EmbeddingConfig) -> (String, usize) {
    let model_name = config
        .model
        .clone()
        .unwrap_or_else(|| DEFAULT_LOCAL_MODEL.to_string());

    let dims = config.dims.unwrap_or(match model_name.as_str() {
        "bge-base-en-v1.5" | "nomic-embed-text-v1" | "nomic-embed-text-v1.5" => 768,
        "multilingual-e5-base" => 768,
        "bge-large-en-v1.5" | "multilingual-e5-large" => 1024,
        _ => 384,
    });

    (model_name, dims)
}

/// In-process inference. The model is downloaded from Hugging Face on
/// first use, cached, and kept loaded for the provider's lifetime.
#[cfg(feature = "local-embeddings")]
pub struct LocalProvider {
    model_name: String,
    dims: usize,
    batch_size: usize,
    model: Arc<std::sync::Mutex<Option<fastembed::TextEmbedding>>>,
}

#[cfg(feature = "local-embeddings")]
impl LocalProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let (model_name, dims) = resolve_local_model(config);
        fastembed_model(&model_name)?;
        Ok(Self {
            model_name,
            dims,
            batch_size: config.batch_size,
            model: Arc::new(std::sync::Mutex::new(None)),
        })
    }
}

#[cfg(feature = "local-embeddings")]
fn fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
        "nomic-embed-text-v1" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV1),
        "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
        "multilingual-e5-small" => Ok(fastembed::EmbeddingModel::MultilingualE5Small),
        "multilingual-e5-base" => Ok(fastembed::EmbeddingModel::MultilingualE5Base),
        "multilingual-e5-large" => Ok(fastembed::EmbeddingModel::MultilingualE5Large),
        other => Err(RagError::config(format!(
            "unknown local embedding model: '{}'. Supported models: \
             all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, \
             nomic-embed-text-v1, nomic-embed-text-v1.5, \
             multilingual-e5-small, multilingual-e5-base, multilingual-e5-large",
            other
        ))),
    }
}

#[cfg(feature = "local-embeddings")]
#[async_trait]
impl EmbeddingProvider for LocalProvider {
    fn backend(&self) -> &str {
        "local"
    }
    fn model_name(&self) -> &str {
        &self.model_name
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let which = fastembed_model(&self.model_name)?;
        let slot = Arc::clone(&self.model);
        let batch_size = self.batch_size;
        let texts = texts.to_vec();

        tokio::task::spawn_blocking(move || {
            let mut guard = slot
                .lock()
                .map_err(|_| RagError::backend("local", "model lock poisoned"))?;
            if guard.is_none() {
                let loaded = fastembed::TextEmbedding::try_new(
                    fastembed::InitOptions::new(which).with_show_download_progress(true),
                )
                .map_err(|e| RagError::backend("local", format!("failed to load model: {}", e)))?;
                *guard = Some(loaded);
            }
            let model = guard
                .as_mut()
                .ok_or_else(|| RagError::backend("local", "model not loaded"))?;
            model
                .embed(texts, Some(batch_size))
                .map_err(|e| RagError::backend("local", e))
        })
        .await
        .map_err(|e| RagError::backend("local", e))?
    }
}

/// Create the [`EmbeddingProvider`] named by `config.provider`.
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledProvider`] |
/// | `"hashing"` | [`HashingProvider`] |
/// | `"openai"` | [`OpenAIProvider`] |
/// | `"ollama"` | [`OllamaProvider`] |
/// | `"local"` | `LocalProvider` (feature `local-embeddings`) |
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledProvider)),
        "hashing" => Ok(Arc::new(HashingProvider::new(config.dims.unwrap_or(256))?)),
        "openai" => Ok(Arc::new(OpenAIProvider::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaProvider::new(config)?)),
        #[cfg(feature = "local-embeddings")]
        "local" => Ok(Arc::new(LocalProvider::new(config)?)),
        #[cfg(not(feature = "local-embeddings"))]
        "local" => Err(RagError::backend(
            "local",
            "this build lacks the `local-embeddings` feature",
        )),
        other => Err(RagError::config(format!(
            "unknown embedding provider: {}",
            other
        ))),
    }
}

/// Encode a float vector as little-endian `f32` bytes for BLOB storage.
///
/// ```rust
/// use oracle_rag::embedding::{vec_to_blob, blob_to_vec};
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

/// Decode a BLOB back into a float vector. Trailing partial words are ignored.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// L2 norm of a vector.
pub fn norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty, zero, or
/// differently-sized vectors.
///
/// ```text
///            a · b
/// cos(θ) = ─────────
///          ‖a‖ × ‖b‖
/// ```
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
