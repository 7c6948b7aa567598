//! Ingestion pipeline orchestration.
//!
//! Coordinates the flow for one source: scan → hash diff → chunk → embed →
//! commit. Each changed document is committed on its own: its new chunks
//! replace the old ones in a single index swap, together with the updated
//! document record. Unchanged documents are never re-embedded.
//!
//! Per-file read problems are collected as skipped items; embedding
//! failures, timeouts, and dimension mismatches abort the operation and
//! leave the failing document at its previous version.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::cancel::Deadline;
use crate::chunk::ChunkingPolicy;
use crate::embedding::{embed_all, EmbeddingProvider};
use crate::error::{RagError, Result};
use crate::index::IndexEntry;
use crate::kb::{chunk_meta, KnowledgeBase};
use crate::models::{now_ts, Chunk, Document, Source, SourceType};
use crate::progress::IndexProgressEvent;
use crate::sources::{scan, ScannedDocument, SkippedItem};

/// Outcome of one refresh.
#[derive(Debug, Clone, Default)]
pub struct RefreshReport {
    pub source_id: String,
    /// Ids of documents that were added or re-indexed.
    pub changed: Vec<String>,
    pub added: usize,
    pub updated: usize,
    /// Ids of documents that disappeared from the source.
    pub removed: Vec<String>,
    pub unchanged: usize,
    pub chunks_written: usize,
    pub skipped: Vec<SkippedItem>,
}

#[derive(Debug, Clone)]
pub struct AddSourceReport {
    pub source: Source,
    pub refresh: RefreshReport,
}

#[derive(Debug, Clone, Default)]
pub struct RemovalReport {
    pub source_id: String,
    pub documents_removed: usize,
    pub vectors_removed: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ReindexReport {
    pub documents: usize,
    pub chunks: usize,
}

impl KnowledgeBase {
    /// Register a source and index everything in it.
    ///
    /// If indexing fails with a hard error the registration is rolled back,
    /// so a failed add leaves no trace.
    pub async fn add_source(
        &self,
        location: &str,
        source_type: SourceType,
        tags: Vec<String>,
        deadline: &Deadline,
    ) -> Result<AddSourceReport> {
        let _shared = self.maintenance.read().await;
        let source = self.sources.register(location, source_type, tags)?;
        info!(source = %source.id, location = %source.location, kind = %source_type, "added source");

        let _guard = self.sources.lock_source(&source.id).await;
        match self.refresh_locked(&source, deadline).await {
            Ok(refresh) => Ok(AddSourceReport { source, refresh }),
            Err(e) => {
                warn!(source = %source.id, error = %e, "indexing failed; rolling back source");
                self.remove_committed(&source.id)?;
                Err(e)
            }
        }
    }

    /// Re-scan a source and re-index only the documents whose content hash
    /// changed. A second refresh with no file changes reports nothing.
    pub async fn refresh(&self, source_id: &str, deadline: &Deadline) -> Result<RefreshReport> {
        let _shared = self.maintenance.read().await;
        let _guard = self.sources.lock_source(source_id).await;
        let source = self.sources.source(source_id)?;
        self.refresh_locked(&source, deadline).await
    }

    /// Refresh every source. A source that cannot be read at all, such as
    /// a deleted folder or an unreachable page, is reported as skipped and
    /// the others still refresh. Hard failures abort.
    pub async fn refresh_all(&self, deadline: &Deadline) -> Result<Vec<RefreshReport>> {
        let mut reports = Vec::new();
        for source in self.sources.sources() {
            match self.refresh(&source.id, deadline).await {
                Ok(report) => reports.push(report),
                Err(e) if e.is_per_document() => {
                    warn!(source = %source.id, error = %e, "source unreadable; skipped");
                    reports.push(RefreshReport {
                        source_id: source.id.clone(),
                        skipped: vec![SkippedItem::from_error(source.location.clone(), e)],
                        ..Default::default()
                    });
                }
                Err(e) => return Err(e),
            }
        }
        Ok(reports)
    }

    async fn refresh_locked(&self, source: &Source, deadline: &Deadline) -> Result<RefreshReport> {
        self.progress.report(IndexProgressEvent::Scanning {
            source: source.location.clone(),
        });
        let scanned = scan(source, &self.settings.scan).await?;
        let diff = self.sources.diff(&source.id, scanned.documents);

        let mut report = RefreshReport {
            source_id: source.id.clone(),
            unchanged: diff.unchanged,
            skipped: scanned.skipped,
            ..Default::default()
        };

        if !diff.removed.is_empty() {
            let ids: HashSet<String> = diff.removed.iter().cloned().collect();
            self.remove_documents_committed(&ids);
            report.removed = diff.removed;
        }

        let total = diff.changed.len() as u64;
        for (n, (doc_id, doc)) in diff.changed.into_iter().enumerate() {
            let _doc_guard = self.sources.lock_document(&doc_id).await;
            let existed = self.sources.document(&doc_id).is_ok();
            let written = self.index_document(source, &doc_id, doc, deadline).await?;
            if existed {
                report.updated += 1;
            } else {
                report.added += 1;
            }
            report.chunks_written += written;
            report.changed.push(doc_id);
            self.progress.report(IndexProgressEvent::Indexing {
                source: source.location.clone(),
                n: n as u64 + 1,
                total,
            });
        }

        self.sources.mark_refreshed(&source.id, now_ts());
        info!(
            source = %source.id,
            added = report.added,
            updated = report.updated,
            removed = report.removed.len(),
            unchanged = report.unchanged,
            skipped = report.skipped.len(),
            "refreshed source"
        );
        Ok(report)
    }

    /// Chunk and embed one document, then commit it atomically.
    async fn index_document(
        &self,
        source: &Source,
        doc_id: &str,
        scanned: ScannedDocument,
        deadline: &Deadline,
    ) -> Result<usize> {
        let policy = self.policy()?;
        let (provider, space) = self.embedding_space();
        let document = Document {
            id: doc_id.to_string(),
            source_id: source.id.clone(),
            location: scanned.location,
            relative_path: scanned.relative_path,
            source_type: source.source_type,
            content_type: scanned.content_type,
            content_hash: scanned.content_hash,
            ingested_at: now_ts(),
            modified_at: scanned.modified_at,
            body: scanned.body,
        };
        let entries = self
            .embed_document(source, &document, policy, provider.as_ref(), space.dims(), deadline)
            .await?;
        let n = entries.len();

        let _commit = self.commit_guard();
        self.index.replace_document(&document.id, entries)?;
        self.sources.commit_document(document);
        self.touch();
        Ok(n)
    }

    async fn embed_document(
        &self,
        source: &Source,
        document: &Document,
        policy: ChunkingPolicy,
        provider: &dyn EmbeddingProvider,
        dims: usize,
        deadline: &Deadline,
    ) -> Result<Vec<IndexEntry>> {
        let chunks: Vec<Chunk> = policy.chunks(&document.id, &document.body).collect();
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = embed_all(provider, &texts, self.settings.batch_size, dims, deadline).await?;
        debug!(document = %document.id, chunks = chunks.len(), "embedded document");
        Ok(chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, vector)| {
                IndexEntry::new(chunk.id.clone(), vector, chunk_meta(source, document, &chunk))
            })
            .collect())
    }

    /// Remove a source, its documents, and their vectors in one commit.
    pub async fn remove_source(&self, source_id: &str) -> Result<RemovalReport> {
        let _shared = self.maintenance.read().await;
        let _guard = self.sources.lock_source(source_id).await;
        self.remove_committed(source_id)
    }

    fn remove_committed(&self, source_id: &str) -> Result<RemovalReport> {
        let _commit = self.commit_guard();
        self.sources.source(source_id)?;
        let doc_ids: HashSet<String> = self
            .sources
            .documents_of(source_id)
            .into_iter()
            .map(|d| d.id)
            .collect();
        let vectors_removed = self.index.remove_documents(&doc_ids);
        let documents_removed = self.sources.remove_source(source_id)?.len();
        for id in &doc_ids {
            self.sources.release_document_lock(id);
        }
        self.touch();
        info!(source = source_id, documents_removed, vectors_removed, "removed source");
        Ok(RemovalReport {
            source_id: source_id.to_string(),
            documents_removed,
            vectors_removed,
        })
    }

    fn remove_documents_committed(&self, ids: &HashSet<String>) {
        let _commit = self.commit_guard();
        self.index.remove_documents(ids);
        self.sources.remove_documents(ids);
        for id in ids {
            self.sources.release_document_lock(id);
        }
        self.touch();
    }

    /// Drop one document and remember its path so refresh skips it.
    pub async fn forget_document(&self, document_id: &str) -> Result<Document> {
        let _shared = self.maintenance.read().await;
        let source_id = self.sources.document(document_id)?.source_id;
        let _source_guard = self.sources.lock_source(&source_id).await;
        let _doc_guard = self.sources.lock_document(document_id).await;

        let _commit = self.commit_guard();
        let doc = self.sources.forget_document(document_id)?;
        self.index
            .remove_documents(&HashSet::from([document_id.to_string()]));
        self.sources.release_document_lock(document_id);
        self.touch();
        info!(document = document_id, path = %doc.relative_path, "forgot document");
        Ok(doc)
    }

    /// Re-chunk and re-embed every document, optionally with a new
    /// chunking policy or provider. The new index replaces the old one in a
    /// single swap; on failure nothing changes.
    pub async fn reindex(
        &self,
        policy: Option<ChunkingPolicy>,
        provider: Option<Arc<dyn EmbeddingProvider>>,
        deadline: &Deadline,
    ) -> Result<ReindexReport> {
        let _exclusive = self.maintenance.write().await;
        let policy = match policy {
            Some(p) => p,
            None => self.policy()?,
        };
        let provider = provider.unwrap_or_else(|| self.provider());
        let dims = provider.dims();
        if dims == 0 {
            return Err(RagError::backend(
                provider.backend(),
                "re-index needs an embedding provider with a fixed dimension",
            ));
        }

        let sources = self.sources.sources();
        let documents = self.sources.documents();
        let mut entries = Vec::new();
        for (n, document) in documents.iter().enumerate() {
            let source = sources
                .iter()
                .find(|s| s.id == document.source_id)
                .ok_or_else(|| RagError::not_found("source", document.source_id.clone()))?;
            let mut doc_entries = self
                .embed_document(source, document, policy, provider.as_ref(), dims, deadline)
                .await?;
            entries.append(&mut doc_entries);
            self.progress.report(IndexProgressEvent::Indexing {
                source: "reindex".to_string(),
                n: n as u64 + 1,
                total: documents.len() as u64,
            });
        }

        let report = ReindexReport {
            documents: documents.len(),
            chunks: entries.len(),
        };
        let _commit = self.commit_guard();
        self.rebind(policy, provider, entries)?;
        info!(documents = report.documents, chunks = report.chunks, "re-indexed");
        Ok(report)
    }
}
