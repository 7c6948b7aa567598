//! Error taxonomy for the retrieval engine.
//!
//! Every fallible library operation returns [`Result`], whose error type
//! [`RagError`] separates recoverable per-document problems
//! ([`RagError::SourceRead`]) from hard failures that must reach the caller
//! (backend, dimension, corruption, and schema errors).

use thiserror::Error;

/// Errors produced by the RAG engine.
#[derive(Error, Debug)]
pub enum RagError {
    /// Invalid chunking, retrieval, or knowledge-base parameters.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The embedding backend could not be reached, loaded, or returned garbage.
    #[error("embedding backend '{backend}' unavailable: {reason}")]
    EmbeddingBackendUnavailable { backend: String, reason: String },

    /// A vector's length disagrees with the knowledge base's recorded dimension.
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    EmbeddingDimensionMismatch { expected: usize, actual: usize },

    /// A timeout elapsed or the caller cancelled the operation.
    #[error("operation '{operation}' timed out or was cancelled")]
    OperationTimedOut { operation: &'static str },

    /// A single source file could not be read, extracted, or was too large.
    #[error("cannot read source '{path}': {reason}")]
    SourceRead { path: String, reason: String },

    /// Persisted state failed validation on load or import.
    #[error("index corruption: {0}")]
    IndexCorruption(String),

    /// A stored knowledge base uses a schema this build cannot upgrade.
    #[error("schema migration failed: {0}")]
    SchemaMigrationFailed(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl RagError {
    pub fn config(msg: impl Into<String>) -> Self {
        RagError::Configuration(msg.into())
    }

    pub fn backend(backend: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        RagError::EmbeddingBackendUnavailable {
            backend: backend.into(),
            reason: reason.to_string(),
        }
    }

    pub fn corruption(msg: impl Into<String>) -> Self {
        RagError::IndexCorruption(msg.into())
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        RagError::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// True for errors that only affect one document and may be skipped.
    pub fn is_per_document(&self) -> bool {
        matches!(self, RagError::SourceRead { .. })
    }
}

pub type Result<T> = std::result::Result<T, RagError>;
