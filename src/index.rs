//! In-memory vector index with copy-on-write snapshots.
//!
//! The index maps chunk ids to `(vector, metadata)` entries and answers
//! exact cosine top-k queries. Every mutation builds a fresh [`Snapshot`]
//! and swaps it in under a short write lock; searches clone the current
//! `Arc<Snapshot>` and score against it without holding any lock, so a
//! reader sees either all of an insert or none of it.
//!
//! Mutations are serialised by a writer mutex (single-writer per knowledge
//! base) and run concurrently with searches.
//!
//! Each snapshot is tagged with the embedding model its vectors came from.
//! A query vector must be searched against a snapshot of the same model.
//!
//! # Ranking
//!
//! Results are ordered by cosine score descending. Equal scores are broken
//! by document modification time (newest first), then chunk ordinal
//! (ascending), then chunk id, so ordering is fully deterministic.
//!
//! # Filters
//!
//! A [`SearchFilter`] is applied to the candidate set *before* scoring, so a
//! restrictive filter never under-fills `k` when enough matching entries
//! exist.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cancel::Deadline;
use crate::embedding::{check_dims, norm};
use crate::error::{RagError, Result};
use crate::models::SourceType;

/// How many entries are scored between cancellation checks.
const CANCEL_CHECK_INTERVAL: usize = 1024;

/// Provenance and text carried alongside each vector, so a hit can be
/// cited without consulting the source bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkMeta {
    pub document_id: String,
    pub source_id: String,
    pub source_type: SourceType,
    pub tags: Vec<String>,
    pub location: String,
    pub ordinal: usize,
    pub start: usize,
    pub end: usize,
    pub text: String,
    pub hash: String,
    pub char_count: usize,
    pub overlaps_previous: bool,
    /// Modification time of the parent document; used for tie-breaking.
    pub modified_at: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub id: String,
    pub vector: Vec<f32>,
    norm: f32,
    pub meta: ChunkMeta,
}

impl IndexEntry {
    pub fn new(id: impl Into<String>, vector: Vec<f32>, meta: ChunkMeta) -> Self {
        let norm = norm(&vector);
        Self {
            id: id.into(),
            vector,
            norm,
            meta,
        }
    }
}

/// Candidate restriction applied before scoring. Empty fields match all.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchFilter {
    pub source_id: Option<String>,
    pub document_id: Option<String>,
    pub source_type: Option<SourceType>,
    pub tag: Option<String>,
    pub location_prefix: Option<String>,
}

impl SearchFilter {
    pub fn is_empty(&self) -> bool {
        *self == SearchFilter::default()
    }

    pub fn matches(&self, meta: &ChunkMeta) -> bool {
        if let Some(ref s) = self.source_id {
            if &meta.source_id != s {
                return false;
            }
        }
        if let Some(ref d) = self.document_id {
            if &meta.document_id != d {
                return false;
            }
        }
        if let Some(t) = self.source_type {
            if meta.source_type != t {
                return false;
            }
        }
        if let Some(ref tag) = self.tag {
            if !meta.tags.iter().any(|t| t == tag) {
                return false;
            }
        }
        if let Some(ref prefix) = self.location_prefix {
            if !meta.location.starts_with(prefix.as_str()) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub score: f32,
    pub entry: Arc<IndexEntry>,
}

/// Immutable view of the index at one point in time.
#[derive(Debug, Default)]
pub struct Snapshot {
    model: String,
    dims: usize,
    entries: HashMap<String, Arc<IndexEntry>>,
}

impl Snapshot {
    pub fn dims(&self) -> usize {
        self.dims
    }

    /// Embedding model of every vector in this snapshot.
    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Arc<IndexEntry>> {
        self.entries.get(id)
    }

    /// Exact top-k search. Checks `token` periodically and fails with
    /// [`RagError::OperationTimedOut`] once it fires.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: &SearchFilter,
        token: Option<&CancellationToken>,
    ) -> Result<Vec<SearchHit>> {
        if k == 0 {
            return Err(RagError::config("top-k must be a positive integer"));
        }
        check_dims(self.dims, query)?;
        let qn = norm(query);

        let mut scored: Vec<SearchHit> = Vec::new();
        for (i, entry) in self.entries.values().enumerate() {
            if i % CANCEL_CHECK_INTERVAL == 0 && token.is_some_and(|t| t.is_cancelled()) {
                return Err(RagError::OperationTimedOut { operation: "search" });
            }
            if !filter.matches(&entry.meta) {
                continue;
            }
            scored.push(SearchHit {
                score: score(query, qn, entry),
                entry: Arc::clone(entry),
            });
        }

        if scored.len() > k {
            scored.select_nth_unstable_by(k - 1, rank);
            scored.truncate(k);
        }
        scored.sort_by(rank);
        Ok(scored)
    }

    /// Search on the blocking pool, abandoning the scan when `deadline`
    /// fires.
    pub async fn search_with_deadline(
        self: Arc<Self>,
        query: Vec<f32>,
        k: usize,
        filter: SearchFilter,
        deadline: &Deadline,
    ) -> Result<Vec<SearchHit>> {
        let token = deadline.token().child_token();
        let scan_token = token.clone();
        let hits = deadline
            .run("search", async move {
                tokio::task::spawn_blocking(move || {
                    self.search(&query, k, &filter, Some(&scan_token))
                })
                .await
                .map_err(|e| RagError::corruption(format!("search task failed: {}", e)))?
            })
            .await;
        // Stop the blocking scan if the deadline won the race.
        token.cancel();
        let hits = hits?;
        debug!(k, returned = hits.len(), "vector search");
        Ok(hits)
    }
}

fn score(query: &[f32], qn: f32, entry: &IndexEntry) -> f32 {
    let denom = qn * entry.norm;
    if denom < f32::EPSILON {
        return 0.0;
    }
    let dot: f32 = query.iter().zip(&entry.vector).map(|(a, b)| a * b).sum();
    dot / denom
}

fn rank(a: &SearchHit, b: &SearchHit) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| b.entry.meta.modified_at.cmp(&a.entry.meta.modified_at))
        .then_with(|| a.entry.meta.ordinal.cmp(&b.entry.meta.ordinal))
        .then_with(|| a.entry.id.cmp(&b.entry.id))
}

/// Shared, single-writer, many-reader vector index.
#[derive(Debug)]
pub struct VectorIndex {
    current: RwLock<Arc<Snapshot>>,
    writer: Mutex<()>,
}

impl VectorIndex {
    /// An empty index with no model tag.
    pub fn new(dims: usize) -> Self {
        Self::for_model("", dims)
    }

    pub fn for_model(model: &str, dims: usize) -> Self {
        Self {
            current: RwLock::new(Arc::new(Snapshot {
                model: model.to_string(),
                dims,
                entries: HashMap::new(),
            })),
            writer: Mutex::new(()),
        }
    }

    /// Build an index from previously serialised entries.
    pub fn from_entries(model: &str, dims: usize, entries: Vec<IndexEntry>) -> Result<Self> {
        let index = Self::for_model(model, dims);
        index.reset(model, dims, entries)?;
        Ok(index)
    }

    /// The current snapshot. Cheap; holds no lock after returning.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn dims(&self) -> usize {
        self.snapshot().dims
    }

    pub fn model(&self) -> String {
        self.snapshot().model.clone()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &str) -> bool {
        self.snapshot().entries.contains_key(id)
    }

    /// Serialisation hook: every entry, ordered by document then ordinal.
    pub fn entries(&self) -> Vec<Arc<IndexEntry>> {
        let snap = self.snapshot();
        let mut out: Vec<Arc<IndexEntry>> = snap.entries.values().cloned().collect();
        out.sort_by(|a, b| {
            a.meta
                .document_id
                .cmp(&b.meta.document_id)
                .then(a.meta.ordinal.cmp(&b.meta.ordinal))
        });
        out
    }

    pub fn document_chunk_count(&self, document_id: &str) -> usize {
        self.snapshot()
            .entries
            .values()
            .filter(|e| e.meta.document_id == document_id)
            .count()
    }

    /// Apply `mutate` to a copy of the current entries and publish it.
    fn commit<T>(
        &self,
        mutate: impl FnOnce(&mut Snapshot) -> Result<T>,
    ) -> Result<T> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let base = self.snapshot();
        let mut next = Snapshot {
            model: base.model.clone(),
            dims: base.dims,
            entries: base.entries.clone(),
        };
        let out = mutate(&mut next)?;
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
        Ok(out)
    }

    pub fn insert(&self, id: impl Into<String>, vector: Vec<f32>, meta: ChunkMeta) -> Result<()> {
        self.insert_batch(vec![IndexEntry::new(id, vector, meta)])
    }

    /// Insert all entries or none: dimensions are checked before anything
    /// is published.
    pub fn insert_batch(&self, entries: Vec<IndexEntry>) -> Result<()> {
        self.commit(|snap| {
            for e in &entries {
                check_dims(snap.dims, &e.vector)?;
            }
            for e in entries {
                snap.entries.insert(e.id.clone(), Arc::new(e));
            }
            Ok(())
        })
    }

    pub fn remove(&self, id: &str) -> bool {
        if !self.contains(id) {
            return false;
        }
        self.commit(|snap| Ok(snap.entries.remove(id).is_some()))
            .unwrap_or(false)
    }

    /// Remove every entry belonging to any of `document_ids` in one swap.
    pub fn remove_documents(&self, document_ids: &HashSet<String>) -> usize {
        if document_ids.is_empty() {
            return 0;
        }
        self.commit(|snap| {
            let before = snap.entries.len();
            snap.entries
                .retain(|_, e| !document_ids.contains(&e.meta.document_id));
            Ok(before - snap.entries.len())
        })
        .unwrap_or(0)
    }

    /// Atomically swap a document's entries for `entries`.
    pub fn replace_document(&self, document_id: &str, entries: Vec<IndexEntry>) -> Result<usize> {
        self.commit(|snap| {
            for e in &entries {
                check_dims(snap.dims, &e.vector)?;
                if e.meta.document_id != document_id {
                    return Err(RagError::corruption(format!(
                        "entry {} does not belong to document {}",
                        e.id, document_id
                    )));
                }
            }
            snap.entries.retain(|_, e| e.meta.document_id != document_id);
            let n = entries.len();
            for e in entries {
                snap.entries.insert(e.id.clone(), Arc::new(e));
            }
            Ok(n)
        })
    }

    /// Replace the whole index, possibly with a new model and dimension.
    pub fn reset(&self, model: &str, dims: usize, entries: Vec<IndexEntry>) -> Result<()> {
        self.commit(|snap| {
            for e in &entries {
                check_dims(dims, &e.vector)?;
            }
            snap.model = model.to_string();
            snap.dims = dims;
            snap.entries = entries
                .into_iter()
                .map(|e| (e.id.clone(), Arc::new(e)))
                .collect();
            Ok(())
        })
    }

    pub fn search(&self, query: &[f32], k: usize, filter: &SearchFilter) -> Result<Vec<SearchHit>> {
        self.snapshot().search(query, k, filter, None)
    }

    pub async fn search_with_deadline(
        &self,
        query: Vec<f32>,
        k: usize,
        filter: SearchFilter,
        deadline: &Deadline,
    ) -> Result<Vec<SearchHit>> {
        self.snapshot()
            .search_with_deadline(query, k, filter, deadline)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn meta(doc: &str, ordinal: usize, modified_at: i64) -> ChunkMeta {
        ChunkMeta {
            document_id: doc.to_string(),
            source_id: "src".to_string(),
            source_type: SourceType::File,
            tags: vec![],
            location: format!("/docs/{}.md", doc),
            ordinal,
            start: 0,
            end: 1,
            text: "x".to_string(),
            hash: String::new(),
            char_count: 1,
            overlaps_previous: ordinal > 0,
            modified_at,
        }
    }

    fn ids(hits: &[SearchHit]) -> Vec<&str> {
        hits.iter().map(|h| h.entry.id.as_str()).collect()
    }

    #[test]
    fn test_insert_wrong_dimension_leaves_index_unchanged() {
        let index = VectorIndex::new(768);
        index.insert("a#0", vec![0.1; 768], meta("a", 0, 0)).unwrap();

        let err = index
            .insert_batch(vec![
                IndexEntry::new("b#0", vec![0.1; 768], meta("b", 0, 0)),
                IndexEntry::new("b#1", vec![0.1; 384], meta("b", 1, 0)),
            ])
            .unwrap_err();
        assert!(matches!(
            err,
            RagError::EmbeddingDimensionMismatch {
                expected: 768,
                actual: 384
            }
        ));
        assert_eq!(index.len(), 1);
        assert!(!index.contains("b#0"));
    }

    #[test]
    fn test_k_larger_than_index_returns_all() {
        let index = VectorIndex::new(2);
        index.insert("a#0", vec![1.0, 0.0], meta("a", 0, 0)).unwrap();
        index.insert("a#1", vec![0.0, 1.0], meta("a", 1, 0)).unwrap();
        let hits = index.search(&[1.0, 0.0], 10, &SearchFilter::default()).unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn test_zero_k_rejected() {
        let index = VectorIndex::new(2);
        assert!(matches!(
            index.search(&[1.0, 0.0], 0, &SearchFilter::default()),
            Err(RagError::Configuration(_))
        ));
    }

    #[test]
    fn test_scores_non_increasing_and_truncated() {
        let index = VectorIndex::new(2);
        for i in 0..50 {
            let angle = i as f32 * 0.03;
            index
                .insert(
                    format!("d#{}", i),
                    vec![angle.cos(), angle.sin()],
                    meta("d", i, 0),
                )
                .unwrap();
        }
        let hits = index.search(&[1.0, 0.0], 7, &SearchFilter::default()).unwrap();
        assert_eq!(hits.len(), 7);
        assert_eq!(hits[0].entry.id, "d#0");
        for w in hits.windows(2) {
            assert!(w[0].score >= w[1].score);
        }
    }

    #[test]
    fn test_ties_prefer_recent_then_low_ordinal() {
        let index = VectorIndex::new(2);
        index.insert("old#0", vec![1.0, 0.0], meta("old", 0, 100)).unwrap();
        index.insert("new#3", vec![1.0, 0.0], meta("new", 3, 200)).unwrap();
        index.insert("new#1", vec![2.0, 0.0], meta("new", 1, 200)).unwrap();
        let hits = index.search(&[1.0, 0.0], 3, &SearchFilter::default()).unwrap();
        assert_eq!(ids(&hits), vec!["new#1", "new#3", "old#0"]);
    }

    #[test]
    fn test_filter_is_applied_before_top_k() {
        let index = VectorIndex::new(2);
        for i in 0..20 {
            index.insert(format!("a#{}", i), vec![1.0, 0.0], meta("a", i, 0)).unwrap();
        }
        let mut tagged = meta("b", 0, 0);
        tagged.tags = vec!["design".into()];
        index.insert("b#0", vec![0.0, 1.0], tagged).unwrap();
        index.insert("b#1", vec![0.1, 1.0], meta("b", 1, 0)).unwrap();

        let filter = SearchFilter {
            document_id: Some("b".into()),
            ..Default::default()
        };
        let hits = index.search(&[1.0, 0.0], 2, &filter).unwrap();
        assert_eq!(hits.len(), 2);

        let filter = SearchFilter {
            tag: Some("design".into()),
            ..Default::default()
        };
        assert_eq!(ids(&index.search(&[1.0, 0.0], 5, &filter).unwrap()), vec!["b#0"]);
    }

    #[test]
    fn test_replace_and_remove_documents() {
        let index = VectorIndex::new(2);
        index
            .insert_batch((0..3).map(|i| IndexEntry::new(format!("a#{}", i), vec![1.0, 0.0], meta("a", i, 0))).collect())
            .unwrap();
        index.insert("b#0", vec![0.0, 1.0], meta("b", 0, 0)).unwrap();

        let n = index
            .replace_document("a", vec![IndexEntry::new("a#0", vec![0.5, 0.5], meta("a", 0, 1))])
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(index.document_chunk_count("a"), 1);

        let removed = index.remove_documents(&HashSet::from(["a".to_string(), "b".to_string()]));
        assert_eq!(removed, 2);
        assert!(index.is_empty());
    }

    #[test]
    fn test_reset_retags_model_without_touching_held_snapshot() {
        let index = VectorIndex::for_model("old", 2);
        index.insert("a#0", vec![1.0, 0.0], meta("a", 0, 1)).unwrap();
        let held = index.snapshot();

        index
            .reset("new", 3, vec![IndexEntry::new("a#0", vec![0.0, 0.0, 1.0], meta("a", 0, 1))])
            .unwrap();
        assert_eq!((index.model(), index.dims()), ("new".to_string(), 3));
        assert_eq!((held.model(), held.dims()), ("old", 2));
        let hits = held.search(&[1.0, 0.0], 1, &SearchFilter::default(), None).unwrap();
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_snapshot_isolated_from_later_writes() {
        let index = VectorIndex::new(2);
        index.insert("a#0", vec![1.0, 0.0], meta("a", 0, 0)).unwrap();
        let snap = index.snapshot();
        index.insert("a#1", vec![1.0, 0.0], meta("a", 1, 0)).unwrap();
        assert_eq!(snap.len(), 1);
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_cancelled_scan_times_out() {
        let index = VectorIndex::new(2);
        index.insert("a#0", vec![1.0, 0.0], meta("a", 0, 0)).unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let res = index
            .snapshot()
            .search(&[1.0, 0.0], 1, &SearchFilter::default(), Some(&token));
        assert!(matches!(res, Err(RagError::OperationTimedOut { .. })));
    }

    #[tokio::test]
    async fn test_search_with_deadline() {
        let index = VectorIndex::new(2);
        index.insert("a#0", vec![1.0, 0.0], meta("a", 0, 0)).unwrap();
        let hits = index
            .search_with_deadline(
                vec![1.0, 0.0],
                3,
                SearchFilter::default(),
                &Deadline::after(Duration::from_secs(5)),
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }
}
