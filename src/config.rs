//! TOML configuration parsing and validation.
//!
//! Every section has serde defaults, so a config file only needs the keys it
//! changes. [`load_config`] rejects out-of-range values with
//! [`RagError::Configuration`] before any knowledge base is touched.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::chunk::ChunkingPolicy;
use crate::error::{RagError, Result};
use crate::models::KnowledgeBaseManifest;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_store_root")]
    pub root: PathBuf,
    #[serde(default = "default_kb")]
    pub default_kb: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: default_store_root(),
            default_kb: default_kb(),
        }
    }
}

fn default_store_root() -> PathBuf {
    PathBuf::from("./data/kb")
}
fn default_kb() -> String {
    "default".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

impl ChunkingConfig {
    pub fn policy(&self) -> Result<ChunkingPolicy> {
        ChunkingPolicy::new(self.chunk_size, self.chunk_overlap)
    }
}

fn default_chunk_size() -> usize {
    1000
}
fn default_chunk_overlap() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Results scoring below this are dropped even inside the top-k.
    #[serde(default)]
    pub min_score: Option<f32>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            min_score: None,
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl RetrievalConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_top_k() -> usize {
    5
}
fn default_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Base URL for the Ollama backend.
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            url: None,
        }
    }
}

impl EmbeddingConfig {
    /// Offline hashing backend, used by tests and air-gapped setups.
    pub fn hashing(dims: usize) -> Self {
        Self {
            provider: "hashing".to_string(),
            model: Some(format!("hashing-tf-{}", dims)),
            dims: Some(dims),
            ..Self::default()
        }
    }

    /// Runtime settings from this config, with the backend identity pinned
    /// to what the knowledge base was built with.
    pub fn pinned_to(&self, manifest: &KnowledgeBaseManifest) -> Self {
        Self {
            provider: manifest.embedding_provider.clone(),
            model: Some(manifest.embedding_model.clone()),
            dims: Some(manifest.dims),
            ..self.clone()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_provider() -> String {
    "local".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourcesConfig {
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    /// Include patterns for codebase sources.
    #[serde(default = "default_code_globs")]
    pub code_globs: Vec<String>,
    /// Files larger than this are skipped with a warning.
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default)]
    pub follow_symlinks: bool,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            code_globs: default_code_globs(),
            max_file_bytes: default_max_file_bytes(),
            follow_symlinks: false,
        }
    }
}

fn default_include_globs() -> Vec<String> {
    ["**/*.md", "**/*.txt", "**/*.rst", "**/*.pdf", "**/*.docx"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_code_globs() -> Vec<String> {
    [
        "**/*.rs", "**/*.py", "**/*.js", "**/*.ts", "**/*.tsx", "**/*.go", "**/*.java",
        "**/*.c", "**/*.h", "**/*.cpp", "**/*.hpp", "**/*.rb", "**/*.sh", "**/*.toml",
        "**/*.yaml", "**/*.yml", "**/*.json", "**/*.md",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_max_file_bytes() -> u64 {
    2 * 1024 * 1024
}

impl Config {
    /// All-defaults configuration, validated.
    pub fn minimal() -> Self {
        Self::default()
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        RagError::config(format!(
            "failed to read config file {}: {}",
            path.display(),
            e
        ))
    })?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content)
        .map_err(|e| RagError::config(format!("failed to parse config file: {}", e)))?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    config.chunking.policy()?;

    if config.retrieval.top_k == 0 {
        return Err(RagError::config("retrieval.top_k must be >= 1"));
    }
    if let Some(min) = config.retrieval.min_score {
        if !(-1.0..=1.0).contains(&min) {
            return Err(RagError::config("retrieval.min_score must be in [-1.0, 1.0]"));
        }
    }
    if config.retrieval.timeout_ms == 0 {
        return Err(RagError::config("retrieval.timeout_ms must be > 0"));
    }

    if config.embedding.batch_size == 0 {
        return Err(RagError::config("embedding.batch_size must be > 0"));
    }
    match config.embedding.provider.as_str() {
        "disabled" | "local" | "hashing" => {}
        "openai" | "ollama" => {
            if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
                return Err(RagError::config(format!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    config.embedding.provider
                )));
            }
            if config.embedding.model.is_none() {
                return Err(RagError::config(format!(
                    "embedding.model must be specified when provider is '{}'",
                    config.embedding.provider
                )));
            }
        }
        other => {
            return Err(RagError::config(format!(
                "unknown embedding provider: '{}'. Must be disabled, hashing, local, openai, or ollama.",
                other
            )))
        }
    }
    if config.embedding.dims == Some(0) {
        return Err(RagError::config("embedding.dims must be > 0"));
    }

    if config.sources.max_file_bytes == 0 {
        return Err(RagError::config("sources.max_file_bytes must be > 0"));
    }

    if config.store.default_kb.trim().is_empty() {
        return Err(RagError::config("store.default_kb must not be empty"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let cfg = parse_config("").unwrap();
        assert_eq!(cfg.chunking.chunk_size, 1000);
        assert_eq!(cfg.chunking.chunk_overlap, 100);
        assert_eq!(cfg.retrieval.top_k, 5);
        assert_eq!(cfg.retrieval.min_score, None);
        assert_eq!(cfg.embedding.provider, "local");
        assert_eq!(cfg.embedding.model, None);
        assert_eq!(cfg.store.default_kb, "default");
    }

    #[test]
    fn test_overlap_must_be_smaller_than_size() {
        let err = parse_config("[chunking]\nchunk_size = 100\nchunk_overlap = 100\n").unwrap_err();
        assert!(matches!(err, RagError::Configuration(_)));
    }

    #[test]
    fn test_remote_provider_requires_dims() {
        let err = parse_config("[embedding]\nprovider = \"openai\"\nmodel = \"text-embedding-3-small\"\n")
            .unwrap_err();
        assert!(err.to_string().contains("embedding.dims"));
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let err = parse_config("[embedding]\nprovider = \"magic\"\n").unwrap_err();
        assert!(err.to_string().contains("unknown embedding provider"));
    }

    #[test]
    fn test_min_score_range() {
        assert!(parse_config("[retrieval]\nmin_score = 0.25\n").is_ok());
        assert!(parse_config("[retrieval]\nmin_score = 1.5\n").is_err());
    }

    #[test]
    fn test_pinned_to_manifest() {
        let cfg = Config::minimal();
        let manifest = KnowledgeBaseManifest {
            name: "kb".into(),
            embedding_provider: "hashing".into(),
            embedding_model: "hashing-tf-64".into(),
            dims: 64,
            chunk_size: 500,
            chunk_overlap: 50,
            created_at: 0,
            modified_at: 0,
        };
        let pinned = cfg.embedding.pinned_to(&manifest);
        assert_eq!(pinned.provider, "hashing");
        assert_eq!(pinned.dims, Some(64));
        assert_eq!(pinned.batch_size, cfg.embedding.batch_size);
    }
}
