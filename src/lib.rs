//! # Oracle RAG
//!
//! A local retrieval-augmented-generation engine for personal documents and
//! codebases.
//!
//! Sources (folders, codebases, web pages) are scanned into documents, split
//! into overlapping character chunks, embedded, and kept in an exact
//! in-memory vector index. Each knowledge base persists to its own SQLite
//! file and can be exported to a portable zip archive.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌──────────────┐
//! │   Sources   │──▶│   Pipeline   │──▶│ Vector index │
//! │ dir/code/web│   │ Chunk+Embed  │   │  (in memory) │
//! └─────────────┘   └──────────────┘   └──────┬───────┘
//!                                             │
//!                        ┌────────────────────┤
//!                        ▼                    ▼
//!                  ┌───────────┐        ┌───────────┐
//!                  │ Retriever │        │   Store   │
//!                  │  (top-k)  │        │ SQLite/zip│
//!                  └───────────┘        └───────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! orag init notes                          # create a knowledge base
//! orag --kb notes add ~/Documents/notes    # index a folder
//! orag --kb notes add ./repo --type codebase
//! orag --kb notes query "how do we deploy?"
//! orag --kb notes export notes.zip
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error type shared by all operations |
//! | [`models`] | Core data types |
//! | [`chunk`] | Character-based chunking with overlap |
//! | [`extract`] | Text extraction from markdown, PDF, DOCX |
//! | [`sources`] | Source scanning, change detection, bookkeeping |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | Exact cosine vector index |
//! | [`kb`] | The knowledge base handle |
//! | [`ingest`] | Add, refresh, remove, forget, re-index |
//! | [`retrieve`] | Top-k retrieval with provenance |
//! | [`store`] | SQLite persistence, export and import |
//! | [`archive`] | Portable archive format |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema versions and upgrades |
//! | [`cancel`] | Deadlines and cancellation |
//! | [`progress`] | Indexing progress reporting |
//! | [`stats`] | Knowledge base statistics |

pub mod archive;
pub mod cancel;
pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod index;
pub mod ingest;
pub mod kb;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod retrieve;
pub mod sources;
pub mod stats;
pub mod store;

pub use error::{RagError, Result};
pub use kb::KnowledgeBase;
pub use retrieve::Retriever;
pub use store::KnowledgeBaseStore;
