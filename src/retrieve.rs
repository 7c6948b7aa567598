//! Query-time retrieval: embed, search, threshold, cite.
//!
//! The [`Retriever`] embeds a query with the knowledge base's own provider,
//! runs an exact top-k search under a [`Deadline`], and drops hits below the
//! optional minimum score. Every [`RetrievalResult`] carries the document
//! id, location, and character offsets needed to cite the exact span.
//!
//! Querying several knowledge bases at once goes through
//! [`Retriever::query_across`], which refuses to compare vectors from
//! different embedding spaces unless asked to reconcile per knowledge base.

use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use tracing::debug;

use crate::cancel::Deadline;
use crate::config::RetrievalConfig;
use crate::embedding::embed_query;
use crate::error::{RagError, Result};
use crate::index::{SearchFilter, SearchHit, Snapshot};
use crate::kb::KnowledgeBase;
use crate::models::RetrievalResult;

/// How to treat knowledge bases built with different embedding models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reconciliation {
    /// All knowledge bases must share model and dimension; the query is
    /// embedded once.
    #[default]
    Strict,
    /// Each knowledge base embeds the query with its own model; results are
    /// merged by score.
    PerKnowledgeBase,
}

#[derive(Debug, Clone)]
pub struct Retriever {
    top_k: usize,
    min_score: Option<f32>,
    timeout: Option<Duration>,
}

impl Retriever {
    pub fn new(top_k: usize) -> Result<Self> {
        if top_k == 0 {
            return Err(RagError::config("top_k must be >= 1"));
        }
        Ok(Self {
            top_k,
            min_score: None,
            timeout: None,
        })
    }

    pub fn from_config(config: &RetrievalConfig) -> Result<Self> {
        Ok(Self::new(config.top_k)?
            .with_min_score(config.min_score)
            .with_timeout(Some(config.timeout())))
    }

    pub fn with_min_score(mut self, min_score: Option<f32>) -> Self {
        self.min_score = min_score;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// A fresh deadline from the configured timeout.
    pub fn deadline(&self) -> Deadline {
        match self.timeout {
            Some(t) => Deadline::after(t),
            None => Deadline::none(),
        }
    }

    fn k(&self, k: Option<usize>) -> Result<usize> {
        match k {
            Some(0) => Err(RagError::config("top-k must be a positive integer")),
            Some(k) => Ok(k),
            None => Ok(self.top_k),
        }
    }

    /// Top-k chunks of `kb` for `text`, best first.
    pub async fn query(
        &self,
        kb: &KnowledgeBase,
        text: &str,
        k: Option<usize>,
        filter: &SearchFilter,
        deadline: &Deadline,
    ) -> Result<Vec<RetrievalResult>> {
        let k = self.k(k)?;
        let (provider, space) = kb.embedding_space();
        let vector = embed_query(provider.as_ref(), text, space.dims(), deadline).await?;
        self.search(kb, space, vector, k, filter, deadline).await
    }

    /// Search `space`, the snapshot the query vector was embedded for. A
    /// re-index that lands meanwhile does not affect it.
    async fn search(
        &self,
        kb: &KnowledgeBase,
        space: Arc<Snapshot>,
        vector: Vec<f32>,
        k: usize,
        filter: &SearchFilter,
        deadline: &Deadline,
    ) -> Result<Vec<RetrievalResult>> {
        let hits = space
            .search_with_deadline(vector, k, filter.clone(), deadline)
            .await?;
        let name = kb.name();
        let results: Vec<RetrievalResult> = hits
            .into_iter()
            .filter(|h| self.min_score.map_or(true, |min| h.score >= min))
            .map(|h| to_result(&name, h))
            .collect();
        debug!(kb = %name, k, returned = results.len(), "retrieved");
        Ok(results)
    }

    /// Query several knowledge bases and merge the hits by score.
    ///
    /// Under [`Reconciliation::Strict`] a dimension difference fails with
    /// [`RagError::EmbeddingDimensionMismatch`] and a model difference at
    /// equal dimension fails with [`RagError::Configuration`].
    pub async fn query_across(
        &self,
        kbs: &[&KnowledgeBase],
        text: &str,
        k: Option<usize>,
        filter: &SearchFilter,
        reconciliation: Reconciliation,
        deadline: &Deadline,
    ) -> Result<Vec<RetrievalResult>> {
        let k = self.k(k)?;
        let Some(first) = kbs.first() else {
            return Ok(Vec::new());
        };

        let mut merged = Vec::new();
        match reconciliation {
            Reconciliation::Strict => {
                let (provider, base) = first.embedding_space();
                let mut spaces = vec![Arc::clone(&base)];
                for kb in &kbs[1..] {
                    let space = kb.index().snapshot();
                    if space.dims() != base.dims() {
                        return Err(RagError::EmbeddingDimensionMismatch {
                            expected: base.dims(),
                            actual: space.dims(),
                        });
                    }
                    if space.model() != base.model() {
                        return Err(RagError::config(format!(
                            "knowledge bases '{}' ({}) and '{}' ({}) use different embedding models",
                            first.name(),
                            base.model(),
                            kb.name(),
                            space.model()
                        )));
                    }
                    spaces.push(space);
                }
                let vector = embed_query(provider.as_ref(), text, base.dims(), deadline).await?;
                for (kb, space) in kbs.iter().zip(spaces) {
                    merged.extend(
                        self.search(kb, space, vector.clone(), k, filter, deadline)
                            .await?,
                    );
                }
            }
            Reconciliation::PerKnowledgeBase => {
                let per_kb = try_join_all(
                    kbs.iter()
                        .map(|kb| self.query(kb, text, Some(k), filter, deadline)),
                )
                .await?;
                merged.extend(per_kb.into_iter().flatten());
            }
        }

        merged.sort_by(|a, b| b.score.total_cmp(&a.score));
        merged.truncate(k);
        Ok(merged)
    }
}

fn to_result(kb: &str, hit: SearchHit) -> RetrievalResult {
    let m = &hit.entry.meta;
    RetrievalResult {
        knowledge_base: kb.to_string(),
        chunk_id: hit.entry.id.clone(),
        document_id: m.document_id.clone(),
        source_id: m.source_id.clone(),
        location: m.location.clone(),
        ordinal: m.ordinal,
        start: m.start,
        end: m.end,
        text: m.text.clone(),
        score: hit.score,
    }
}

/// Format results as a numbered context block with citations, ready to be
/// placed in front of a prompt.
///
/// ```rust
/// use oracle_rag::models::RetrievalResult;
/// use oracle_rag::retrieve::render_context;
///
/// let r = RetrievalResult {
///     knowledge_base: "notes".into(),
///     chunk_id: "d#0".into(),
///     document_id: "d".into(),
///     source_id: "s".into(),
///     location: "/notes/deploy.md".into(),
///     ordinal: 0,
///     start: 0,
///     end: 12,
///     text: "Use blue/green".into(),
///     score: 0.91,
/// };
/// let block = render_context(&[r]);
/// assert!(block.starts_with("[1] /notes/deploy.md:0-12"));
/// ```
pub fn render_context(results: &[RetrievalResult]) -> String {
    let mut out = String::new();
    for (i, r) in results.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        out.push_str(&format!(
            "[{}] {}:{}-{} (score {:.3})\n{}\n",
            i + 1,
            r.location,
            r.start,
            r.end,
            r.score,
            r.text.trim_end()
        ));
    }
    out
}
