use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use oracle_rag::cancel::Deadline;
use oracle_rag::chunk::ChunkingPolicy;
use oracle_rag::config::{Config, EmbeddingConfig};
use oracle_rag::embedding::{EmbeddingProvider, HashingProvider};
use oracle_rag::index::SearchFilter;
use oracle_rag::kb::IndexSettings;
use oracle_rag::models::SourceType;
use oracle_rag::{KnowledgeBase, KnowledgeBaseStore, RagError, Retriever};

fn config(dims: usize) -> Config {
    let mut cfg = Config::minimal();
    cfg.embedding = EmbeddingConfig::hashing(dims);
    cfg
}

fn hashing(dims: usize) -> Arc<dyn EmbeddingProvider> {
    Arc::new(HashingProvider::new(dims).unwrap())
}

fn new_kb(name: &str, provider: Arc<dyn EmbeddingProvider>) -> KnowledgeBase {
    KnowledgeBase::create(
        name,
        ChunkingPolicy::new(300, 30).unwrap(),
        provider,
        IndexSettings::from_config(&Config::minimal()).unwrap(),
    )
    .unwrap()
}

fn write_docs(dir: &Path, prefix: &str, n: usize) {
    fs::create_dir_all(dir).unwrap();
    for i in 0..n {
        fs::write(
            dir.join(format!("{}-{}.md", prefix, i)),
            format!(
                "# {prefix} note {i}\n\n{}",
                format!("{} topic number {} has some words. ", prefix, i).repeat(20)
            ),
        )
        .unwrap();
    }
}

/// Reports one dimension but returns vectors of another.
struct LyingProvider;

#[async_trait]
impl EmbeddingProvider for LyingProvider {
    fn backend(&self) -> &str {
        "lying"
    }
    fn model_name(&self) -> &str {
        "lying-768"
    }
    fn dims(&self) -> usize {
        768
    }
    async fn embed_batch(&self, texts: &[String]) -> oracle_rag::Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|_| vec![0.1; 384]).collect())
    }
}

/// Never answers within any reasonable deadline.
struct StalledProvider;

#[async_trait]
impl EmbeddingProvider for StalledProvider {
    fn backend(&self) -> &str {
        "stalled"
    }
    fn model_name(&self) -> &str {
        "stalled-8"
    }
    fn dims(&self) -> usize {
        8
    }
    async fn embed_batch(&self, texts: &[String]) -> oracle_rag::Result<Vec<Vec<f32>>> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(texts.iter().map(|_| vec![0.0; 8]).collect())
    }
}

/// Maps every text onto one axis picked by the model, so vectors from two
/// models are orthogonal. Embedding "slow query" takes a while.
struct AxisProvider {
    model: &'static str,
    axis: usize,
}

#[async_trait]
impl EmbeddingProvider for AxisProvider {
    fn backend(&self) -> &str {
        "axis"
    }
    fn model_name(&self) -> &str {
        self.model
    }
    fn dims(&self) -> usize {
        8
    }
    async fn embed_batch(&self, texts: &[String]) -> oracle_rag::Result<Vec<Vec<f32>>> {
        if texts.iter().any(|t| t == "slow query") {
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        let mut v = vec![0.0; 8];
        v[self.axis] = 1.0;
        Ok(texts.iter().map(|_| v.clone()).collect())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_add_source() {
    let tmp = TempDir::new().unwrap();
    write_docs(&tmp.path().join("a"), "apple", 6);
    write_docs(&tmp.path().join("b"), "banana", 6);

    let kb = Arc::new(new_kb("shared", hashing(64)));
    let mut handles = Vec::new();
    for sub in ["a", "b"] {
        let kb = Arc::clone(&kb);
        let dir = tmp.path().join(sub).to_str().unwrap().to_string();
        handles.push(tokio::spawn(async move {
            kb.add_source(&dir, SourceType::Folder, vec![], &Deadline::none())
                .await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }

    assert_eq!(kb.sources().len(), 2);
    assert_eq!(kb.documents().len(), 12);
    let chunk_total: usize = kb.documents().iter().map(|d| kb.chunks_of(&d.id).len()).sum();
    assert_eq!(chunk_total, kb.index().len());
    for doc in kb.documents() {
        let chunks = kb.chunks_of(&doc.id);
        let ordinals: Vec<usize> = chunks.iter().map(|c| c.ordinal).collect();
        assert_eq!(ordinals, (0..chunks.len()).collect::<Vec<_>>());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_queries_during_ingest_see_consistent_state() {
    let tmp = TempDir::new().unwrap();
    write_docs(&tmp.path().join("a"), "cherry", 20);
    let kb = Arc::new(new_kb("live", hashing(64)));

    let writer = {
        let kb = Arc::clone(&kb);
        let dir = tmp.path().join("a").to_str().unwrap().to_string();
        tokio::spawn(async move {
            kb.add_source(&dir, SourceType::Folder, vec![], &Deadline::none())
                .await
        })
    };
    let retriever = Retriever::new(5).unwrap();
    while !writer.is_finished() {
        let results = retriever
            .query(&kb, "cherry topic", None, &SearchFilter::default(), &Deadline::none())
            .await
            .unwrap();
        for pair in results.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
        for r in &results {
            assert!(r.chunk_id.starts_with(&r.document_id));
            assert_eq!(r.text.chars().count(), r.end - r.start);
        }
        tokio::task::yield_now().await;
    }
    writer.await.unwrap().unwrap();
    assert_eq!(kb.documents().len(), 20);
}

#[tokio::test]
async fn test_remove_source_cascades() {
    let tmp = TempDir::new().unwrap();
    write_docs(&tmp.path().join("docs"), "doc", 10);
    write_docs(&tmp.path().join("keep"), "keep", 2);
    let kb = new_kb("cascade", hashing(32));

    let removed = kb
        .add_source(
            tmp.path().join("docs").to_str().unwrap(),
            SourceType::Folder,
            vec![],
            &Deadline::none(),
        )
        .await
        .unwrap();
    kb.add_source(
        tmp.path().join("keep").to_str().unwrap(),
        SourceType::Folder,
        vec![],
        &Deadline::none(),
    )
    .await
    .unwrap();
    let before = kb.index().len();

    let report = kb.remove_source(&removed.source.id).await.unwrap();
    assert_eq!(report.documents_removed, 10);
    assert_eq!(kb.documents().len(), 2);
    assert_eq!(kb.index().len(), before - report.vectors_removed);
    assert!(kb
        .index()
        .entries()
        .iter()
        .all(|e| e.meta.source_id != removed.source.id));
    assert!(matches!(
        kb.source(&removed.source.id),
        Err(RagError::NotFound { .. })
    ));

    let filter = SearchFilter {
        source_id: Some(removed.source.id.clone()),
        ..Default::default()
    };
    let hits = Retriever::new(10)
        .unwrap()
        .query(&kb, "doc topic", None, &filter, &Deadline::none())
        .await
        .unwrap();
    assert!(hits.is_empty());
}

#[tokio::test]
async fn test_refresh_without_changes_does_nothing() {
    let tmp = TempDir::new().unwrap();
    write_docs(tmp.path(), "stable", 4);
    let kb = new_kb("idem", hashing(32));
    let added = kb
        .add_source(tmp.path().to_str().unwrap(), SourceType::Folder, vec![], &Deadline::none())
        .await
        .unwrap();
    let before = kb.snapshot();

    let report = kb.refresh(&added.source.id, &Deadline::none()).await.unwrap();
    assert!(report.changed.is_empty());
    assert!(report.removed.is_empty());
    assert_eq!(report.unchanged, 4);
    let after = kb.snapshot();
    assert_eq!(after.documents, before.documents);
    assert_eq!(after.chunks, before.chunks);
}

#[tokio::test]
async fn test_forgotten_document_stays_out() {
    let tmp = TempDir::new().unwrap();
    write_docs(tmp.path(), "f", 3);
    let kb = new_kb("forget", hashing(32));
    let added = kb
        .add_source(tmp.path().to_str().unwrap(), SourceType::Folder, vec![], &Deadline::none())
        .await
        .unwrap();

    let victim = kb.documents()[0].clone();
    kb.forget_document(&victim.id).await.unwrap();
    assert_eq!(kb.documents().len(), 2);
    assert!(kb.chunks_of(&victim.id).is_empty());

    let report = kb.refresh(&added.source.id, &Deadline::none()).await.unwrap();
    assert_eq!(report.added, 0);
    assert_eq!(kb.documents().len(), 2);
}

#[tokio::test]
async fn test_backend_dimension_mismatch_rolls_back_add() {
    let tmp = TempDir::new().unwrap();
    write_docs(tmp.path(), "d", 2);
    let kb = new_kb("dims", Arc::new(LyingProvider));

    let err = kb
        .add_source(tmp.path().to_str().unwrap(), SourceType::Folder, vec![], &Deadline::none())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RagError::EmbeddingDimensionMismatch {
            expected: 768,
            actual: 384
        }
    ));
    assert!(kb.sources().is_empty());
    assert!(kb.documents().is_empty());
    assert!(kb.index().is_empty());
}

#[tokio::test]
async fn test_loading_with_other_dimension_fails() {
    let tmp = TempDir::new().unwrap();
    let store = KnowledgeBaseStore::new(tmp.path().join("store"), &config(768)).unwrap();
    store
        .create_with_provider("big", ChunkingPolicy::new(200, 20).unwrap(), hashing(768))
        .await
        .unwrap();

    let err = store.load_with_provider("big", hashing(384)).await.unwrap_err();
    assert!(matches!(
        err,
        RagError::EmbeddingDimensionMismatch {
            expected: 768,
            actual: 384
        }
    ));
}

#[tokio::test]
async fn test_stalled_backend_times_out() {
    let tmp = TempDir::new().unwrap();
    write_docs(tmp.path(), "slow", 1);
    let kb = new_kb("slow", Arc::new(StalledProvider));

    let err = kb
        .add_source(
            tmp.path().to_str().unwrap(),
            SourceType::Folder,
            vec![],
            &Deadline::after(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RagError::OperationTimedOut { .. }));
    assert!(kb.sources().is_empty());

    let err = Retriever::new(3)
        .unwrap()
        .with_timeout(Some(Duration::from_millis(50)))
        .query(
            &kb,
            "anything",
            None,
            &SearchFilter::default(),
            &Deadline::after(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RagError::OperationTimedOut { .. }));
}

#[tokio::test]
async fn test_store_export_import_preserves_results() {
    let tmp = TempDir::new().unwrap();
    write_docs(&tmp.path().join("docs"), "plum", 5);
    let store = KnowledgeBaseStore::new(tmp.path().join("store"), &config(64)).unwrap();
    let kb = store
        .create("orig", ChunkingPolicy::new(250, 25).unwrap())
        .await
        .unwrap();
    kb.add_source(
        tmp.path().join("docs").to_str().unwrap(),
        SourceType::Folder,
        vec!["fruit".into()],
        &Deadline::none(),
    )
    .await
    .unwrap();
    store.save(&kb).await.unwrap();

    let archive = tmp.path().join("out").join("orig.zip");
    let manifest = store.export("orig", &archive).await.unwrap();
    assert_eq!(manifest.counts.documents, 5);

    let copy = store.import(&archive, Some("copy")).await.unwrap();
    let mut original = kb.snapshot();
    let mut restored = copy.snapshot();
    original.manifest.name = String::new();
    restored.manifest.name = String::new();
    assert_eq!(original, restored);

    let r = Retriever::new(4).unwrap();
    let a = r
        .query(&kb, "plum topic number 3", None, &SearchFilter::default(), &Deadline::none())
        .await
        .unwrap();
    let b = r
        .query(&copy, "plum topic number 3", None, &SearchFilter::default(), &Deadline::none())
        .await
        .unwrap();
    let key = |v: &[oracle_rag::models::RetrievalResult]| {
        v.iter()
            .map(|r| (r.chunk_id.clone(), r.score))
            .collect::<Vec<_>>()
    };
    assert_eq!(key(&a), key(&b));

    assert_eq!(store.list().unwrap(), vec!["copy".to_string(), "orig".to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_query_during_model_swap_uses_one_model() {
    let tmp = TempDir::new().unwrap();
    write_docs(tmp.path(), "swap", 3);
    let old: Arc<dyn EmbeddingProvider> = Arc::new(AxisProvider {
        model: "old-model",
        axis: 0,
    });
    let kb = Arc::new(new_kb("swap", old));
    kb.add_source(tmp.path().to_str().unwrap(), SourceType::Folder, vec![], &Deadline::none())
        .await
        .unwrap();

    let pending = {
        let kb = Arc::clone(&kb);
        tokio::spawn(async move {
            Retriever::new(3)
                .unwrap()
                .query(&kb, "slow query", None, &SearchFilter::default(), &Deadline::none())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    kb.reindex(
        None,
        Some(Arc::new(AxisProvider {
            model: "new-model",
            axis: 1,
        })),
        &Deadline::none(),
    )
    .await
    .unwrap();
    assert_eq!(kb.manifest().embedding_model, "new-model");
    assert_eq!(kb.index().model(), "new-model");

    // Embedded by the old model, so it must be scored against the old vectors.
    let hits = pending.await.unwrap().unwrap();
    assert_eq!(hits.len(), 3);
    assert!(hits.iter().all(|h| (h.score - 1.0).abs() < 1e-5), "{:?}", hits);

    let hits = Retriever::new(3)
        .unwrap()
        .query(&kb, "fresh query", None, &SearchFilter::default(), &Deadline::none())
        .await
        .unwrap();
    assert!(hits.iter().all(|h| (h.score - 1.0).abs() < 1e-5), "{:?}", hits);
}

#[tokio::test]
async fn test_reindex_with_new_policy() {
    let tmp = TempDir::new().unwrap();
    write_docs(tmp.path(), "r", 3);
    let kb = new_kb("reindex", hashing(32));
    kb.add_source(tmp.path().to_str().unwrap(), SourceType::Folder, vec![], &Deadline::none())
        .await
        .unwrap();
    let before = kb.index().len();

    let report = kb
        .reindex(Some(ChunkingPolicy::new(100, 10).unwrap()), None, &Deadline::none())
        .await
        .unwrap();
    assert_eq!(report.documents, 3);
    assert_eq!(report.chunks, kb.index().len());
    assert!(kb.index().len() > before);
    assert_eq!(kb.manifest().chunk_size, 100);

    let report = kb
        .reindex(None, Some(hashing(48)), &Deadline::none())
        .await
        .unwrap();
    assert_eq!(kb.dims(), 48);
    assert_eq!(kb.manifest().embedding_model, "hashing-tf-48");
    assert_eq!(report.chunks, kb.index().len());
}
