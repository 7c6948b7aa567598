//! Core data models that flow through the indexing and retrieval pipeline.
//!
//! Timestamps are Unix seconds (`i64`) so they survive SQLite and archive
//! round-trips without precision loss.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::RagError;

/// Kind of ingested source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    /// A single file.
    File,
    /// A directory walked recursively with include/exclude globs.
    Folder,
    /// A repository tree that additionally honours gitignore rules.
    Codebase,
    /// A URL fetched over HTTP.
    Web,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::File => "file",
            SourceType::Folder => "folder",
            SourceType::Codebase => "codebase",
            SourceType::Web => "web",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = RagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(SourceType::File),
            "folder" => Ok(SourceType::Folder),
            "codebase" => Ok(SourceType::Codebase),
            "web" => Ok(SourceType::Web),
            other => Err(RagError::config(format!(
                "unknown source type '{}'. Must be file, folder, codebase, or web.",
                other
            ))),
        }
    }
}

/// A registered source: one file, folder, codebase, or URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    /// Filesystem path or URI as supplied by the user.
    pub location: String,
    pub source_type: SourceType,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Relative paths the user asked to forget; never re-ingested.
    #[serde(default)]
    pub forgotten: Vec<String>,
    pub added_at: i64,
    pub refreshed_at: Option<i64>,
}

/// A user-supplied unit of content, owned by the source manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub source_id: String,
    /// Absolute path or URI of the document.
    pub location: String,
    /// Path relative to the source root (the URI for web sources).
    pub relative_path: String,
    pub source_type: SourceType,
    pub content_type: String,
    /// SHA-256 of the raw bytes; drives incremental refresh.
    pub content_hash: String,
    pub ingested_at: i64,
    pub modified_at: i64,
    /// Extracted text that chunk offsets refer to.
    pub body: String,
}

/// A contiguous span of a document's text.
///
/// `start` and `end` are character offsets (not bytes) into the parent
/// document body; `end` is exclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub ordinal: usize,
    pub start: usize,
    pub end: usize,
    pub text: String,
    pub char_count: usize,
    /// Whether the leading characters repeat the tail of the previous chunk.
    pub overlaps_previous: bool,
    /// SHA-256 of `text`.
    pub hash: String,
}

impl Chunk {
    pub fn make_id(document_id: &str, ordinal: usize) -> String {
        format!("{}#{}", document_id, ordinal)
    }
}

/// Configuration and identity of one knowledge base.
///
/// Immutable once documents are indexed, except through a full re-index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeBaseManifest {
    pub name: String,
    /// Embedding backend identifier (`openai`, `ollama`, `local`, `hashing`).
    pub embedding_provider: String,
    pub embedding_model: String,
    pub dims: usize,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub created_at: i64,
    pub modified_at: i64,
}

/// One ranked, citeable retrieval hit. Not persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalResult {
    pub knowledge_base: String,
    pub chunk_id: String,
    pub document_id: String,
    pub source_id: String,
    pub location: String,
    pub ordinal: usize,
    pub start: usize,
    pub end: usize,
    pub text: String,
    pub score: f32,
}

pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}
