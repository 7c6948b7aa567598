//! Durable storage for knowledge bases.
//!
//! Each knowledge base lives in its own SQLite file,
//! `<root>/<name>.kb.sqlite`. [`KnowledgeBaseStore::save`] rewrites every
//! table inside a single transaction, so a crash mid-save leaves the last
//! committed state intact. [`KnowledgeBaseStore::load`] upgrades older
//! schemas first (see [`crate::migrate`]) and validates the data before
//! building the in-memory index.
//!
//! Export and import go through the zip format in [`crate::archive`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use sqlx::{Row, SqlitePool};
use tracing::info;

use crate::archive::{read_archive, write_archive, ArchiveManifest};
use crate::chunk::ChunkingPolicy;
use crate::config::{Config, EmbeddingConfig};
use crate::db;
use crate::embedding::{blob_to_vec, create_provider, vec_to_blob, EmbeddingProvider};
use crate::error::{RagError, Result};
use crate::kb::{validate_name, IndexSettings, KbSnapshot, KnowledgeBase};
use crate::migrate;
use crate::models::{Chunk, Document, KnowledgeBaseManifest, Source, SourceType};

const DB_SUFFIX: &str = ".kb.sqlite";

#[derive(Debug, Clone)]
pub struct KnowledgeBaseStore {
    root: PathBuf,
    embedding: EmbeddingConfig,
    settings: IndexSettings,
}

impl KnowledgeBaseStore {
    pub fn new(root: impl Into<PathBuf>, config: &Config) -> Result<Self> {
        Ok(Self {
            root: root.into(),
            embedding: config.embedding.clone(),
            settings: IndexSettings::from_config(config)?,
        })
    }

    /// Store rooted at `config.store.root`.
    pub fn open(config: &Config) -> Result<Self> {
        Self::new(config.store.root.clone(), config)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}{}", name, DB_SUFFIX))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path_for(name).exists()
    }

    /// Names of all stored knowledge bases, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut names: Vec<String> = std::fs::read_dir(&self.root)?
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                e.file_name()
                    .to_str()
                    .and_then(|n| n.strip_suffix(DB_SUFFIX))
                    .map(str::to_string)
            })
            .collect();
        names.sort();
        Ok(names)
    }

    /// Create and persist an empty knowledge base using the configured
    /// embedding provider.
    pub async fn create(&self, name: &str, policy: ChunkingPolicy) -> Result<KnowledgeBase> {
        let provider = create_provider(&self.embedding)?;
        self.create_with_provider(name, policy, provider).await
    }

    pub async fn create_with_provider(
        &self,
        name: &str,
        policy: ChunkingPolicy,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> Result<KnowledgeBase> {
        validate_name(name)?;
        if self.exists(name) {
            return Err(RagError::config(format!(
                "knowledge base '{}' already exists",
                name
            )));
        }
        let kb = KnowledgeBase::create(name, policy, provider, self.settings.clone())?;
        self.save(&kb).await?;
        info!(kb = name, dims = kb.dims(), "created knowledge base");
        Ok(kb)
    }

    /// Persist `kb` atomically.
    pub async fn save(&self, kb: &KnowledgeBase) -> Result<()> {
        let snapshot = kb.snapshot();
        self.write_snapshot(&snapshot).await
    }

    async fn write_snapshot(&self, snap: &KbSnapshot) -> Result<()> {
        let pool = db::connect(&self.path_for(&snap.manifest.name), true).await?;
        let result = write_tables(&pool, snap).await;
        pool.close().await;
        result
    }

    /// Load a knowledge base with a provider pinned to its manifest.
    pub async fn load(&self, name: &str) -> Result<KnowledgeBase> {
        let snapshot = self.read_snapshot(name).await?;
        let provider = create_provider(&self.embedding.pinned_to(&snapshot.manifest))?;
        KnowledgeBase::from_snapshot(snapshot, provider, self.settings.clone())
    }

    pub async fn load_with_provider(
        &self,
        name: &str,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> Result<KnowledgeBase> {
        let snapshot = self.read_snapshot(name).await?;
        KnowledgeBase::from_snapshot(snapshot, provider, self.settings.clone())
    }

    /// Read persisted state, upgrading the schema if needed. Does not
    /// validate cross references; [`KnowledgeBase::from_snapshot`] does.
    pub async fn read_snapshot(&self, name: &str) -> Result<KbSnapshot> {
        validate_name(name)?;
        let path = self.path_for(name);
        if !path.exists() {
            return Err(RagError::not_found("knowledge base", name));
        }
        let pool = db::connect(&path, false).await?;
        let result = async {
            migrate::migrate(&pool).await?;
            read_tables(&pool).await
        }
        .await;
        pool.close().await;
        result
    }

    /// Remove a knowledge base file and its WAL side files.
    pub fn delete(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        let path = self.path_for(name);
        if !path.exists() {
            return Err(RagError::not_found("knowledge base", name));
        }
        std::fs::remove_file(&path)?;
        for suffix in ["-wal", "-shm"] {
            let side = PathBuf::from(format!("{}{}", path.display(), suffix));
            if side.exists() {
                std::fs::remove_file(side)?;
            }
        }
        info!(kb = name, "deleted knowledge base");
        Ok(())
    }

    /// Write the persisted state of `name` to a portable archive at `dest`.
    pub async fn export(&self, name: &str, dest: &Path) -> Result<ArchiveManifest> {
        let snapshot = self.read_snapshot(name).await?;
        let dest = dest.to_path_buf();
        let manifest = tokio::task::spawn_blocking(move || write_archive(&snapshot, &dest))
            .await
            .map_err(|e| RagError::Io(std::io::Error::other(e)))??;
        info!(kb = name, chunks = manifest.counts.chunks, "exported knowledge base");
        Ok(manifest)
    }

    /// Restore an archive as a new knowledge base, optionally renamed.
    ///
    /// The archive is fully verified and the knowledge base rebuilt in
    /// memory before anything is written to the store.
    pub async fn import(&self, archive: &Path, rename: Option<&str>) -> Result<KnowledgeBase> {
        let path = archive.to_path_buf();
        let (_, mut snapshot) = tokio::task::spawn_blocking(move || read_archive(&path))
            .await
            .map_err(|e| RagError::Io(std::io::Error::other(e)))??;
        if let Some(name) = rename {
            snapshot.manifest.name = name.to_string();
        }
        let name = snapshot.manifest.name.clone();
        validate_name(&name)?;
        if self.exists(&name) {
            return Err(RagError::config(format!(
                "knowledge base '{}' already exists; import under another name",
                name
            )));
        }

        let provider = create_provider(&self.embedding.pinned_to(&snapshot.manifest))?;
        let kb = KnowledgeBase::from_snapshot(snapshot, provider, self.settings.clone())?;
        self.save(&kb).await?;
        info!(kb = %name, "imported knowledge base");
        Ok(kb)
    }
}

async fn write_tables(pool: &SqlitePool, snap: &KbSnapshot) -> Result<()> {
    migrate::create_schema(pool).await?;

    let mut tx = pool.begin().await?;
    for table in ["chunks", "documents", "sources", "manifest"] {
        sqlx::query(&format!("DELETE FROM {}", table))
            .execute(&mut *tx)
            .await?;
    }

    let m = &snap.manifest;
    sqlx::query(
        "INSERT INTO manifest (id, name, embedding_provider, embedding_model, dims, chunk_size, chunk_overlap, created_at, modified_at) \
         VALUES (1, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&m.name)
    .bind(&m.embedding_provider)
    .bind(&m.embedding_model)
    .bind(m.dims as i64)
    .bind(m.chunk_size as i64)
    .bind(m.chunk_overlap as i64)
    .bind(m.created_at)
    .bind(m.modified_at)
    .execute(&mut *tx)
    .await?;

    for s in &snap.sources {
        sqlx::query(
            "INSERT INTO sources (id, location, source_type, tags, forgotten, added_at, refreshed_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&s.id)
        .bind(&s.location)
        .bind(s.source_type.as_str())
        .bind(serde_json::to_string(&s.tags)?)
        .bind(serde_json::to_string(&s.forgotten)?)
        .bind(s.added_at)
        .bind(s.refreshed_at)
        .execute(&mut *tx)
        .await?;
    }

    for d in &snap.documents {
        sqlx::query(
            "INSERT INTO documents (id, source_id, location, relative_path, source_type, content_type, content_hash, ingested_at, modified_at, body) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&d.id)
        .bind(&d.source_id)
        .bind(&d.location)
        .bind(&d.relative_path)
        .bind(d.source_type.as_str())
        .bind(&d.content_type)
        .bind(&d.content_hash)
        .bind(d.ingested_at)
        .bind(d.modified_at)
        .bind(&d.body)
        .execute(&mut *tx)
        .await?;
    }

    for (c, vector) in &snap.chunks {
        sqlx::query(
            "INSERT INTO chunks (id, document_id, ordinal, start_offset, end_offset, text, char_count, overlaps_previous, hash, vector) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&c.id)
        .bind(&c.document_id)
        .bind(c.ordinal as i64)
        .bind(c.start as i64)
        .bind(c.end as i64)
        .bind(&c.text)
        .bind(c.char_count as i64)
        .bind(c.overlaps_previous)
        .bind(&c.hash)
        .bind(vec_to_blob(vector))
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

fn to_usize(v: i64, what: &str) -> Result<usize> {
    usize::try_from(v).map_err(|_| RagError::corruption(format!("negative {}: {}", what, v)))
}

fn to_source_type(s: &str) -> Result<SourceType> {
    s.parse()
        .map_err(|_| RagError::corruption(format!("unknown source type '{}'", s)))
}

fn to_list(json: &str, what: &str) -> Result<Vec<String>> {
    serde_json::from_str(json).map_err(|e| RagError::corruption(format!("{}: {}", what, e)))
}

async fn read_tables(pool: &SqlitePool) -> Result<KbSnapshot> {
    let row = sqlx::query("SELECT * FROM manifest WHERE id = 1")
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| RagError::corruption("manifest row missing"))?;
    let manifest = KnowledgeBaseManifest {
        name: row.try_get("name")?,
        embedding_provider: row.try_get("embedding_provider")?,
        embedding_model: row.try_get("embedding_model")?,
        dims: to_usize(row.try_get("dims")?, "dims")?,
        chunk_size: to_usize(row.try_get("chunk_size")?, "chunk_size")?,
        chunk_overlap: to_usize(row.try_get("chunk_overlap")?, "chunk_overlap")?,
        created_at: row.try_get("created_at")?,
        modified_at: row.try_get("modified_at")?,
    };

    let mut sources = Vec::new();
    for row in sqlx::query("SELECT * FROM sources ORDER BY id")
        .fetch_all(pool)
        .await?
    {
        sources.push(Source {
            id: row.try_get("id")?,
            location: row.try_get("location")?,
            source_type: to_source_type(row.try_get("source_type")?)?,
            tags: to_list(row.try_get("tags")?, "sources.tags")?,
            forgotten: to_list(row.try_get("forgotten")?, "sources.forgotten")?,
            added_at: row.try_get("added_at")?,
            refreshed_at: row.try_get("refreshed_at")?,
        });
    }

    let mut documents = Vec::new();
    for row in sqlx::query("SELECT * FROM documents ORDER BY source_id, relative_path")
        .fetch_all(pool)
        .await?
    {
        documents.push(Document {
            id: row.try_get("id")?,
            source_id: row.try_get("source_id")?,
            location: row.try_get("location")?,
            relative_path: row.try_get("relative_path")?,
            source_type: to_source_type(row.try_get("source_type")?)?,
            content_type: row.try_get("content_type")?,
            content_hash: row.try_get("content_hash")?,
            ingested_at: row.try_get("ingested_at")?,
            modified_at: row.try_get("modified_at")?,
            body: row.try_get("body")?,
        });
    }

    let expected_blob = manifest.dims * 4;
    let mut chunks = Vec::new();
    for row in sqlx::query("SELECT * FROM chunks ORDER BY document_id, ordinal")
        .fetch_all(pool)
        .await?
    {
        let id: String = row.try_get("id")?;
        let blob: Vec<u8> = row.try_get("vector")?;
        if blob.len() != expected_blob {
            return Err(RagError::corruption(format!(
                "chunk {} vector is {} bytes, expected {}",
                id,
                blob.len(),
                expected_blob
            )));
        }
        let chunk = Chunk {
            id,
            document_id: row.try_get("document_id")?,
            ordinal: to_usize(row.try_get("ordinal")?, "ordinal")?,
            start: to_usize(row.try_get("start_offset")?, "start_offset")?,
            end: to_usize(row.try_get("end_offset")?, "end_offset")?,
            text: row.try_get("text")?,
            char_count: to_usize(row.try_get("char_count")?, "char_count")?,
            overlaps_previous: row.try_get("overlaps_previous")?,
            hash: row.try_get("hash")?,
        };
        chunks.push((chunk, blob_to_vec(&blob)));
    }

    Ok(KbSnapshot {
        manifest,
        sources,
        documents,
        chunks,
    })
}
