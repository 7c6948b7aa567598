//! The knowledge base: one manifest, its sources, and its vector index.
//!
//! A [`KnowledgeBase`] is an explicitly owned handle shared by reference
//! (usually inside an `Arc`) between the ingest pipeline, the retriever,
//! and the store. It carries the embedding provider pinned to the
//! manifest's model and dimension.
//!
//! # Locking
//!
//! | Lock | Held by | Purpose |
//! |------|---------|---------|
//! | maintenance (async, rw) | ingest ops shared, `reindex` exclusive | re-index excludes all other mutation |
//! | per-source (async) | refresh, remove, forget | one refresh of a source at a time |
//! | per-document (async) | indexing one document | no interleaved re-chunk of a document |
//! | commit (sync, rw) | mutators shared, [`KnowledgeBase::snapshot`] exclusive | index and bookkeeping change together |
//!
//! The commit lock is only held across synchronous code.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};

use crate::chunk::ChunkingPolicy;
use crate::config::Config;
use crate::embedding::EmbeddingProvider;
use crate::error::{RagError, Result};
use crate::index::{ChunkMeta, IndexEntry, Snapshot, VectorIndex};
use crate::models::{now_ts, Chunk, Document, KnowledgeBaseManifest, Source};
use crate::progress::{NoProgress, ProgressReporter};
use crate::sources::{ScanSettings, SourceManager};

/// Runtime knobs that are not part of the manifest.
#[derive(Debug, Clone)]
pub struct IndexSettings {
    pub scan: ScanSettings,
    pub batch_size: usize,
}

impl IndexSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            scan: ScanSettings::from_config(&config.sources)?,
            batch_size: config.embedding.batch_size,
        })
    }
}

/// A consistent, owned copy of everything a knowledge base persists.
#[derive(Debug, Clone, PartialEq)]
pub struct KbSnapshot {
    pub manifest: KnowledgeBaseManifest,
    pub sources: Vec<Source>,
    pub documents: Vec<Document>,
    /// Chunks with their vectors, ordered by document then ordinal.
    pub chunks: Vec<(Chunk, Vec<f32>)>,
}

/// Names become file names, so keep them to a portable character set.
pub fn validate_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.len() <= 64
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(RagError::config(format!(
            "invalid knowledge base name '{}': use 1-64 of [A-Za-z0-9._-], not starting with '.'",
            name
        )))
    }
}

pub struct KnowledgeBase {
    manifest: RwLock<KnowledgeBaseManifest>,
    pub(crate) sources: SourceManager,
    pub(crate) index: VectorIndex,
    provider: RwLock<Arc<dyn EmbeddingProvider>>,
    pub(crate) settings: IndexSettings,
    commit: RwLock<()>,
    pub(crate) maintenance: tokio::sync::RwLock<()>,
    pub(crate) progress: Box<dyn ProgressReporter>,
}

impl std::fmt::Debug for KnowledgeBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnowledgeBase")
            .field("manifest", &self.manifest())
            .field("vectors", &self.index.len())
            .finish()
    }
}

impl KnowledgeBase {
    /// A new, empty knowledge base bound to `provider`'s model and dimension.
    pub fn create(
        name: &str,
        policy: ChunkingPolicy,
        provider: Arc<dyn EmbeddingProvider>,
        settings: IndexSettings,
    ) -> Result<Self> {
        validate_name(name)?;
        if provider.dims() == 0 {
            return Err(RagError::backend(
                provider.backend(),
                "a knowledge base needs an embedding provider with a fixed dimension",
            ));
        }
        let now = now_ts();
        let manifest = KnowledgeBaseManifest {
            name: name.to_string(),
            embedding_provider: provider.backend().to_string(),
            embedding_model: provider.model_name().to_string(),
            dims: provider.dims(),
            chunk_size: policy.chunk_size(),
            chunk_overlap: policy.overlap(),
            created_at: now,
            modified_at: now,
        };
        Ok(Self::assemble(
            manifest,
            SourceManager::new(),
            VectorIndex::for_model(provider.model_name(), provider.dims()),
            provider,
            settings,
        ))
    }

    /// Rebuild a knowledge base from persisted state, validating it.
    ///
    /// Fails with [`RagError::IndexCorruption`] when a chunk references an
    /// unknown document, its offsets fall outside the document body, or its
    /// vector has the wrong length. A provider whose model or dimension
    /// differs from the manifest is rejected.
    pub fn from_snapshot(
        snapshot: KbSnapshot,
        provider: Arc<dyn EmbeddingProvider>,
        settings: IndexSettings,
    ) -> Result<Self> {
        let KbSnapshot {
            manifest,
            sources,
            documents,
            chunks,
        } = snapshot;

        validate_name(&manifest.name)?;
        ChunkingPolicy::new(manifest.chunk_size, manifest.chunk_overlap)
            .map_err(|e| RagError::corruption(format!("manifest: {}", e)))?;
        if provider.dims() != manifest.dims {
            return Err(RagError::EmbeddingDimensionMismatch {
                expected: manifest.dims,
                actual: provider.dims(),
            });
        }
        if provider.model_name() != manifest.embedding_model {
            return Err(RagError::config(format!(
                "knowledge base '{}' was built with model '{}', not '{}'",
                manifest.name,
                manifest.embedding_model,
                provider.model_name()
            )));
        }

        let source_by_id: HashMap<&str, &Source> =
            sources.iter().map(|s| (s.id.as_str(), s)).collect();
        let mut doc_by_id: HashMap<&str, (&Document, usize)> = HashMap::new();
        for d in &documents {
            if !source_by_id.contains_key(d.source_id.as_str()) {
                return Err(RagError::corruption(format!(
                    "document {} references unknown source {}",
                    d.id, d.source_id
                )));
            }
            doc_by_id.insert(d.id.as_str(), (d, d.body.chars().count()));
        }

        let mut seen: HashSet<&str> = HashSet::new();
        let mut entries = Vec::with_capacity(chunks.len());
        for (chunk, vector) in &chunks {
            let (doc, body_len) = doc_by_id.get(chunk.document_id.as_str()).ok_or_else(|| {
                RagError::corruption(format!(
                    "chunk {} references unknown document {}",
                    chunk.id, chunk.document_id
                ))
            })?;
            if chunk.start > chunk.end || chunk.end > *body_len {
                return Err(RagError::corruption(format!(
                    "chunk {} offsets {}..{} outside document of {} chars",
                    chunk.id, chunk.start, chunk.end, body_len
                )));
            }
            if vector.len() != manifest.dims {
                return Err(RagError::corruption(format!(
                    "chunk {} vector has {} dims, manifest says {}",
                    chunk.id,
                    vector.len(),
                    manifest.dims
                )));
            }
            if !seen.insert(chunk.id.as_str()) {
                return Err(RagError::corruption(format!("duplicate chunk id {}", chunk.id)));
            }
            let source = source_by_id[doc.source_id.as_str()];
            entries.push(IndexEntry::new(
                chunk.id.clone(),
                vector.clone(),
                chunk_meta(source, doc, chunk),
            ));
        }

        let index = VectorIndex::from_entries(&manifest.embedding_model, manifest.dims, entries)?;
        Ok(Self::assemble(
            manifest,
            SourceManager::from_parts(sources, documents),
            index,
            provider,
            settings,
        ))
    }

    fn assemble(
        manifest: KnowledgeBaseManifest,
        sources: SourceManager,
        index: VectorIndex,
        provider: Arc<dyn EmbeddingProvider>,
        settings: IndexSettings,
    ) -> Self {
        Self {
            manifest: RwLock::new(manifest),
            sources,
            index,
            provider: RwLock::new(provider),
            settings,
            commit: RwLock::new(()),
            maintenance: tokio::sync::RwLock::new(()),
            progress: Box::new(NoProgress),
        }
    }

    pub fn with_progress(mut self, progress: Box<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn manifest(&self) -> KnowledgeBaseManifest {
        self.manifest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn name(&self) -> String {
        self.manifest().name
    }

    pub fn dims(&self) -> usize {
        self.index.dims()
    }

    pub fn policy(&self) -> Result<ChunkingPolicy> {
        let m = self.manifest();
        ChunkingPolicy::new(m.chunk_size, m.chunk_overlap)
    }

    pub fn provider(&self) -> Arc<dyn EmbeddingProvider> {
        Arc::clone(&self.provider.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn index(&self) -> &VectorIndex {
        &self.index
    }

    /// The provider together with the index snapshot built by it. A
    /// re-index swaps both under the provider lock, so the pair never
    /// mixes two models.
    pub fn embedding_space(&self) -> (Arc<dyn EmbeddingProvider>, Arc<Snapshot>) {
        let provider = self.provider.read().unwrap_or_else(PoisonError::into_inner);
        (Arc::clone(&provider), self.index.snapshot())
    }

    pub fn sources(&self) -> Vec<Source> {
        self.sources.sources()
    }

    pub fn source(&self, id: &str) -> Result<Source> {
        self.sources.source(id)
    }

    pub fn documents(&self) -> Vec<Document> {
        self.sources.documents()
    }

    pub fn document(&self, id: &str) -> Result<Document> {
        self.sources.document(id)
    }

    /// Chunks of one document in ordinal order, rebuilt from the index.
    pub fn chunks_of(&self, document_id: &str) -> Vec<Chunk> {
        let mut chunks: Vec<Chunk> = self
            .index
            .entries()
            .into_iter()
            .filter(|e| e.meta.document_id == document_id)
            .map(|e| entry_to_chunk(&e))
            .collect();
        chunks.sort_by_key(|c| c.ordinal);
        chunks
    }

    /// Shared side of the commit lock; mutators hold it while they update
    /// the index and the bookkeeping together.
    pub(crate) fn commit_guard(&self) -> RwLockReadGuard<'_, ()> {
        self.commit.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn touch(&self) {
        self.manifest
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .modified_at = now_ts();
    }

    /// Publish a full re-index: the new entries, chunking policy, and
    /// provider become visible together.
    pub(crate) fn rebind(
        &self,
        policy: ChunkingPolicy,
        provider: Arc<dyn EmbeddingProvider>,
        entries: Vec<IndexEntry>,
    ) -> Result<()> {
        let mut current = self.provider.write().unwrap_or_else(PoisonError::into_inner);
        self.index
            .reset(provider.model_name(), provider.dims(), entries)?;
        {
            let mut m = self.manifest.write().unwrap_or_else(PoisonError::into_inner);
            m.chunk_size = policy.chunk_size();
            m.chunk_overlap = policy.overlap();
            m.embedding_provider = provider.backend().to_string();
            m.embedding_model = provider.model_name().to_string();
            m.dims = provider.dims();
            m.modified_at = now_ts();
        }
        *current = provider;
        Ok(())
    }

    /// A consistent copy of all persisted state. Waits for in-flight
    /// commits and blocks new ones while copying.
    pub fn snapshot(&self) -> KbSnapshot {
        let _exclusive = self.commit.write().unwrap_or_else(PoisonError::into_inner);
        let chunks = self
            .index
            .entries()
            .into_iter()
            .map(|e| (entry_to_chunk(&e), e.vector.clone()))
            .collect();
        KbSnapshot {
            manifest: self.manifest(),
            sources: self.sources.sources(),
            documents: self.sources.documents(),
            chunks,
        }
    }
}

pub(crate) fn chunk_meta(source: &Source, document: &Document, chunk: &Chunk) -> ChunkMeta {
    ChunkMeta {
        document_id: document.id.clone(),
        source_id: source.id.clone(),
        source_type: source.source_type,
        tags: source.tags.clone(),
        location: document.location.clone(),
        ordinal: chunk.ordinal,
        start: chunk.start,
        end: chunk.end,
        text: chunk.text.clone(),
        hash: chunk.hash.clone(),
        char_count: chunk.char_count,
        overlaps_previous: chunk.overlaps_previous,
        modified_at: document.modified_at,
    }
}

fn entry_to_chunk(entry: &IndexEntry) -> Chunk {
    let m = &entry.meta;
    Chunk {
        id: entry.id.clone(),
        document_id: m.document_id.clone(),
        ordinal: m.ordinal,
        start: m.start,
        end: m.end,
        text: m.text.clone(),
        char_count: m.char_count,
        overlaps_previous: m.overlaps_previous,
        hash: m.hash.clone(),
    }
}
