//! Source registration, scanning, and hash bookkeeping.
//!
//! The [`SourceManager`] owns every [`Source`] and [`Document`] of one
//! knowledge base. Scanning a source produces [`ScannedDocument`]s; diffing
//! them against the recorded content hashes yields the documents that need
//! re-chunking, so a refresh never rebuilds unchanged documents.
//!
//! | Type | Enumeration |
//! |------|-------------|
//! | `file` | the single file |
//! | `folder` | `walkdir` + include/exclude globs |
//! | `codebase` | `ignore` walker (gitignore-aware) + code globs |
//! | `web` | one HTTP GET |
//!
//! Files that are too large, binary, unreadable, or fail extraction are
//! returned as [`SkippedItem`]s and never abort the scan.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, SystemTime};

use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::config::SourcesConfig;
use crate::error::{RagError, Result};
use crate::extract::{content_type_for, extract_text, looks_binary, MIME_HTML, MIME_PDF, MIME_TEXT};
use crate::models::{now_ts, Document, Source, SourceType};

const DEFAULT_EXCLUDES: [&str; 3] = ["**/.git/**", "**/target/**", "**/node_modules/**"];

/// Compiled include/exclude rules and limits for scanning.
#[derive(Debug, Clone)]
pub struct ScanSettings {
    include: GlobSet,
    exclude: GlobSet,
    code: GlobSet,
    max_file_bytes: u64,
    follow_symlinks: bool,
    http_timeout: Duration,
}

impl ScanSettings {
    pub fn from_config(config: &SourcesConfig) -> Result<Self> {
        let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
        excludes.extend(config.exclude_globs.iter().cloned());
        Ok(Self {
            include: build_globset(&config.include_globs)?,
            exclude: build_globset(&excludes)?,
            code: build_globset(&config.code_globs)?,
            max_file_bytes: config.max_file_bytes,
            follow_symlinks: config.follow_symlinks,
            http_timeout: Duration::from_secs(30),
        })
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| RagError::config(format!("invalid glob '{}': {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| RagError::config(format!("invalid glob set: {}", e)))
}

/// A document as found on disk or the network, before bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct ScannedDocument {
    pub relative_path: String,
    pub location: String,
    pub content_type: String,
    pub content_hash: String,
    pub modified_at: i64,
    pub body: String,
}

/// A file left out of a scan, with the reason shown to the user.
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedItem {
    pub path: String,
    pub reason: String,
}

impl SkippedItem {
    pub(crate) fn from_error(path: impl Into<String>, err: RagError) -> Self {
        let reason = match err {
            RagError::SourceRead { reason, .. } => reason,
            other => other.to_string(),
        };
        Self {
            path: path.into(),
            reason,
        }
    }
}

#[derive(Debug, Default)]
pub struct Scan {
    pub documents: Vec<ScannedDocument>,
    pub skipped: Vec<SkippedItem>,
}

/// Enumerate and read every document of `source`.
pub async fn scan(source: &Source, settings: &ScanSettings) -> Result<Scan> {
    let mut result = match source.source_type {
        SourceType::Web => scan_web(&source.location, settings).await?,
        _ => {
            let source = source.clone();
            let settings = settings.clone();
            tokio::task::spawn_blocking(move || scan_local(&source, &settings))
                .await
                .map_err(|e| RagError::SourceRead {
                    path: "<scan>".to_string(),
                    reason: e.to_string(),
                })??
        }
    };

    result
        .documents
        .retain(|d| !source.forgotten.contains(&d.relative_path));
    result.documents.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    for s in &result.skipped {
        warn!(path = %s.path, reason = %s.reason, "skipped");
    }
    debug!(
        source = %source.id,
        documents = result.documents.len(),
        skipped = result.skipped.len(),
        "scanned source"
    );
    Ok(result)
}

fn scan_local(source: &Source, settings: &ScanSettings) -> Result<Scan> {
    let root = PathBuf::from(&source.location);
    if !root.exists() {
        return Err(RagError::SourceRead {
            path: source.location.clone(),
            reason: "path does not exist".to_string(),
        });
    }
    let mut scan = Scan::default();

    match source.source_type {
        SourceType::File => {
            let rel = root
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| source.location.clone());
            read_into(&mut scan, &root, &rel, settings);
        }
        SourceType::Folder => {
            let walker = WalkDir::new(&root).follow_links(settings.follow_symlinks);
            for entry in walker {
                let entry = match entry {
                    Ok(e) => e,
                    Err(e) => {
                        let path = e
                            .path()
                            .map(|p| p.display().to_string())
                            .unwrap_or_else(|| source.location.clone());
                        scan.skipped.push(SkippedItem {
                            path,
                            reason: e.to_string(),
                        });
                        continue;
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                let rel = relative(&root, entry.path());
                if settings.exclude.is_match(&rel) || !settings.include.is_match(&rel) {
                    continue;
                }
                read_into(&mut scan, entry.path(), &rel, settings);
            }
        }
        SourceType::Codebase => {
            let mut builder = ignore::WalkBuilder::new(&root);
            builder
                .hidden(true)
                .follow_links(settings.follow_symlinks)
                .git_ignore(true)
                .git_exclude(true)
                .git_global(true)
                .require_git(false);
            for entry in builder.build() {
                let entry = match entry {
                    Ok(e) => e,
                    Err(e) => {
                        scan.skipped.push(SkippedItem {
                            path: source.location.clone(),
                            reason: e.to_string(),
                        });
                        continue;
                    }
                };
                if !entry.file_type().is_some_and(|t| t.is_file()) {
                    continue;
                }
                let rel = relative(&root, entry.path());
                if settings.exclude.is_match(&rel) || !settings.code.is_match(&rel) {
                    continue;
                }
                read_into(&mut scan, entry.path(), &rel, settings);
            }
        }
        SourceType::Web => {
            return Err(RagError::config("web sources are scanned over HTTP"));
        }
    }
    Ok(scan)
}

fn relative(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

fn read_into(scan: &mut Scan, path: &Path, rel: &str, settings: &ScanSettings) {
    match read_file(path, rel, settings) {
        Ok(doc) => scan.documents.push(doc),
        Err(e) => scan.skipped.push(SkippedItem::from_error(path.display().to_string(), e)),
    }
}

fn read_file(path: &Path, rel: &str, settings: &ScanSettings) -> Result<ScannedDocument> {
    let origin = path.display().to_string();
    let read_err = |e: std::io::Error| RagError::SourceRead {
        path: origin.clone(),
        reason: e.to_string(),
    };
    let metadata = std::fs::metadata(path).map_err(read_err)?;
    if metadata.len() > settings.max_file_bytes {
        return Err(RagError::SourceRead {
            path: origin.clone(),
            reason: format!(
                "file is {} bytes, larger than max_file_bytes ({})",
                metadata.len(),
                settings.max_file_bytes
            ),
        });
    }
    let modified_at = metadata
        .modified()
        .unwrap_or(SystemTime::UNIX_EPOCH)
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;

    let bytes = std::fs::read(path).map_err(read_err)?;
    let content_type = content_type_for(path);
    if content_type != MIME_PDF && looks_binary(&bytes) {
        return Err(RagError::SourceRead {
            path: origin.clone(),
            reason: "binary file".to_string(),
        });
    }
    let body = extract_text(&bytes, content_type, &origin)?;
    let location = std::fs::canonicalize(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .display()
        .to_string();

    Ok(ScannedDocument {
        relative_path: rel.to_string(),
        location,
        content_type: content_type.to_string(),
        content_hash: hash_bytes(&bytes),
        modified_at,
        body,
    })
}

async fn scan_web(url: &str, settings: &ScanSettings) -> Result<Scan> {
    let fail = |reason: String| RagError::SourceRead {
        path: url.to_string(),
        reason,
    };
    let client = reqwest::Client::builder()
        .timeout(settings.http_timeout)
        .build()?;
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| fail(e.to_string()))?;
    if !response.status().is_success() {
        return Err(fail(format!("HTTP {}", response.status())));
    }
    let content_type = match response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
    {
        Some(ct) if ct.starts_with("application/pdf") => MIME_PDF,
        Some(ct) if ct.starts_with("text/html") => MIME_HTML,
        _ => MIME_TEXT,
    };
    let bytes = response
        .bytes()
        .await
        .map_err(|e| fail(e.to_string()))?;

    let mut scan = Scan::default();
    if bytes.len() as u64 > settings.max_file_bytes {
        scan.skipped.push(SkippedItem {
            path: url.to_string(),
            reason: format!("response is {} bytes, larger than max_file_bytes", bytes.len()),
        });
        return Ok(scan);
    }
    match extract_text(&bytes, content_type, url) {
        Ok(body) => scan.documents.push(ScannedDocument {
            relative_path: url.to_string(),
            location: url.to_string(),
            content_type: content_type.to_string(),
            content_hash: hash_bytes(&bytes),
            modified_at: now_ts(),
            body,
        }),
        Err(e) => scan.skipped.push(SkippedItem::from_error(url, e)),
    }
    Ok(scan)
}

pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Result of comparing a scan with the recorded hashes.
#[derive(Debug, Default)]
pub struct Diff {
    /// New or modified documents, with the id they will be stored under.
    pub changed: Vec<(String, ScannedDocument)>,
    /// Ids of recorded documents no longer present in the source.
    pub removed: Vec<String>,
    pub unchanged: usize,
}

/// Per-key async mutexes, created on demand.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(map.entry(key.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    pub fn forget(&self, key: &str) {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
struct Book {
    sources: BTreeMap<String, Source>,
    documents: HashMap<String, Document>,
}

/// Bookkeeping for one knowledge base's sources and documents.
#[derive(Debug, Default)]
pub struct SourceManager {
    book: RwLock<Book>,
    source_locks: KeyedLocks,
    document_locks: KeyedLocks,
}

impl SourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts(sources: Vec<Source>, documents: Vec<Document>) -> Self {
        let manager = Self::new();
        manager.restore(sources, documents);
        manager
    }

    /// Replace the whole book.
    pub fn restore(&self, sources: Vec<Source>, documents: Vec<Document>) {
        let mut book = self.write();
        book.sources = sources.into_iter().map(|s| (s.id.clone(), s)).collect();
        book.documents = documents.into_iter().map(|d| (d.id.clone(), d)).collect();
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Book> {
        self.book.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Book> {
        self.book.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a new source. Filesystem locations are canonicalised so the
    /// same folder cannot be registered twice under different spellings.
    pub fn register(
        &self,
        location: &str,
        source_type: SourceType,
        tags: Vec<String>,
    ) -> Result<Source> {
        let location = match source_type {
            SourceType::Web => {
                if !(location.starts_with("http://") || location.starts_with("https://")) {
                    return Err(RagError::config(format!(
                        "web source must be an http(s) URL: {}",
                        location
                    )));
                }
                location.to_string()
            }
            _ => std::fs::canonicalize(location)
                .map_err(|e| RagError::SourceRead {
                    path: location.to_string(),
                    reason: e.to_string(),
                })?
                .display()
                .to_string(),
        };
        if source_type == SourceType::File && !Path::new(&location).is_file() {
            return Err(RagError::config(format!("not a file: {}", location)));
        }
        if matches!(source_type, SourceType::Folder | SourceType::Codebase)
            && !Path::new(&location).is_dir()
        {
            return Err(RagError::config(format!("not a directory: {}", location)));
        }

        let mut book = self.write();
        if book
            .sources
            .values()
            .any(|s| s.location == location && s.source_type == source_type)
        {
            return Err(RagError::config(format!(
                "{} source already registered: {}",
                source_type, location
            )));
        }
        let source = Source {
            id: Uuid::new_v4().to_string(),
            location,
            source_type,
            tags,
            forgotten: Vec::new(),
            added_at: now_ts(),
            refreshed_at: None,
        };
        book.sources.insert(source.id.clone(), source.clone());
        Ok(source)
    }

    pub fn source(&self, id: &str) -> Result<Source> {
        self.read()
            .sources
            .get(id)
            .cloned()
            .ok_or_else(|| RagError::not_found("source", id))
    }

    pub fn sources(&self) -> Vec<Source> {
        self.read().sources.values().cloned().collect()
    }

    pub fn document(&self, id: &str) -> Result<Document> {
        self.read()
            .documents
            .get(id)
            .cloned()
            .ok_or_else(|| RagError::not_found("document", id))
    }

    /// All documents, ordered by source then relative path.
    pub fn documents(&self) -> Vec<Document> {
        let mut docs: Vec<Document> = self.read().documents.values().cloned().collect();
        docs.sort_by(|a, b| {
            a.source_id
                .cmp(&b.source_id)
                .then_with(|| a.relative_path.cmp(&b.relative_path))
        });
        docs
    }

    pub fn documents_of(&self, source_id: &str) -> Vec<Document> {
        let mut docs: Vec<Document> = self
            .read()
            .documents
            .values()
            .filter(|d| d.source_id == source_id)
            .cloned()
            .collect();
        docs.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        docs
    }

    pub fn document_count(&self) -> usize {
        self.read().documents.len()
    }

    /// Compare a scan against recorded hashes. Ids of existing documents are
    /// kept so their chunk ids stay stable.
    pub fn diff(&self, source_id: &str, scanned: Vec<ScannedDocument>) -> Diff {
        let book = self.read();
        let mut existing: HashMap<&str, &Document> = book
            .documents
            .values()
            .filter(|d| d.source_id == source_id)
            .map(|d| (d.relative_path.as_str(), d))
            .collect();

        let mut diff = Diff::default();
        for doc in scanned {
            match existing.remove(doc.relative_path.as_str()) {
                Some(old) if old.content_hash == doc.content_hash => diff.unchanged += 1,
                Some(old) => diff.changed.push((old.id.clone(), doc)),
                None => diff.changed.push((Uuid::new_v4().to_string(), doc)),
            }
        }
        diff.removed = existing.values().map(|d| d.id.clone()).collect();
        diff.removed.sort();
        diff
    }

    /// Insert or replace a document record.
    pub fn commit_document(&self, document: Document) {
        self.write()
            .documents
            .insert(document.id.clone(), document);
    }

    pub fn remove_documents(&self, ids: &HashSet<String>) -> usize {
        let mut book = self.write();
        let before = book.documents.len();
        book.documents.retain(|id, _| !ids.contains(id));
        before - book.documents.len()
    }

    /// Drop a source and every document it owns. Returns the removed
    /// document ids.
    pub fn remove_source(&self, id: &str) -> Result<HashSet<String>> {
        let mut book = self.write();
        if book.sources.remove(id).is_none() {
            return Err(RagError::not_found("source", id));
        }
        let doomed: HashSet<String> = book
            .documents
            .values()
            .filter(|d| d.source_id == id)
            .map(|d| d.id.clone())
            .collect();
        book.documents.retain(|doc_id, _| !doomed.contains(doc_id));
        drop(book);
        self.source_locks.forget(id);
        Ok(doomed)
    }

    /// Remove a document and record its path so refresh skips it.
    pub fn forget_document(&self, id: &str) -> Result<Document> {
        let mut book = self.write();
        let doc = book
            .documents
            .remove(id)
            .ok_or_else(|| RagError::not_found("document", id))?;
        if let Some(source) = book.sources.get_mut(&doc.source_id) {
            if !source.forgotten.contains(&doc.relative_path) {
                source.forgotten.push(doc.relative_path.clone());
            }
        }
        Ok(doc)
    }

    pub fn mark_refreshed(&self, source_id: &str, at: i64) {
        if let Some(source) = self.write().sources.get_mut(source_id) {
            source.refreshed_at = Some(at);
        }
    }

    /// Serialise refreshes of one source.
    pub async fn lock_source(&self, id: &str) -> OwnedMutexGuard<()> {
        self.source_locks.lock(id).await
    }

    /// Serialise indexing of one document.
    pub async fn lock_document(&self, id: &str) -> OwnedMutexGuard<()> {
        self.document_locks.lock(id).await
    }

    pub fn release_document_lock(&self, id: &str) {
        self.document_locks.forget(id);
    }

    pub fn document_lock_count(&self) -> usize {
        self.document_locks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn settings() -> ScanSettings {
        ScanSettings::from_config(&SourcesConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_folder_scan_applies_globs_and_skips() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.md"), "# Alpha").unwrap();
        fs::create_dir_all(tmp.path().join("sub")).unwrap();
        fs::write(tmp.path().join("sub/b.txt"), "beta").unwrap();
        fs::write(tmp.path().join("image.png"), [0u8, 1, 2]).unwrap();
        fs::write(tmp.path().join("blob.txt"), [b'a', 0, b'b']).unwrap();
        fs::create_dir_all(tmp.path().join("node_modules/x")).unwrap();
        fs::write(tmp.path().join("node_modules/x/c.md"), "no").unwrap();

        let mgr = SourceManager::new();
        let source = mgr
            .register(tmp.path().to_str().unwrap(), SourceType::Folder, vec![])
            .unwrap();
        let scan = scan(&source, &settings()).await.unwrap();
        let rels: Vec<&str> = scan.documents.iter().map(|d| d.relative_path.as_str()).collect();
        assert_eq!(rels, vec!["a.md", "sub/b.txt"]);
        assert_eq!(scan.skipped.len(), 1);
        assert!(scan.skipped[0].path.ends_with("blob.txt"));
    }

    #[tokio::test]
    async fn test_oversized_file_is_skipped_not_fatal() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("big.md"), "x".repeat(2048)).unwrap();
        fs::write(tmp.path().join("small.md"), "ok").unwrap();
        let cfg = SourcesConfig {
            max_file_bytes: 1024,
            ..SourcesConfig::default()
        };
        let settings = ScanSettings::from_config(&cfg).unwrap();
        let mgr = SourceManager::new();
        let source = mgr
            .register(tmp.path().to_str().unwrap(), SourceType::Folder, vec![])
            .unwrap();
        let scan = scan(&source, &settings).await.unwrap();
        assert_eq!(scan.documents.len(), 1);
        assert_eq!(scan.skipped.len(), 1);
        assert!(scan.skipped[0].reason.contains("max_file_bytes"));
    }

    #[tokio::test]
    async fn test_codebase_respects_gitignore() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(".gitignore"), "build/\n").unwrap();
        fs::create_dir_all(tmp.path().join("build")).unwrap();
        fs::write(tmp.path().join("build/gen.rs"), "fn gen() {}").unwrap();
        fs::create_dir_all(tmp.path().join("src")).unwrap();
        fs::write(tmp.path().join("src/main.rs"), "fn main() {}").unwrap();
        fs::write(tmp.path().join("notes.docx.bak"), "zzz").unwrap();

        let mgr = SourceManager::new();
        let source = mgr
            .register(tmp.path().to_str().unwrap(), SourceType::Codebase, vec![])
            .unwrap();
        let scan = scan(&source, &settings()).await.unwrap();
        let rels: Vec<&str> = scan.documents.iter().map(|d| d.relative_path.as_str()).collect();
        assert_eq!(rels, vec!["src/main.rs"]);
    }

    #[test]
    fn test_register_rejects_duplicates_and_missing_paths() {
        let tmp = TempDir::new().unwrap();
        let mgr = SourceManager::new();
        let loc = tmp.path().to_str().unwrap();
        mgr.register(loc, SourceType::Folder, vec![]).unwrap();
        assert!(matches!(
            mgr.register(loc, SourceType::Folder, vec![]),
            Err(RagError::Configuration(_))
        ));
        assert!(mgr
            .register("/definitely/not/here", SourceType::Folder, vec![])
            .is_err());
        assert!(mgr.register("ftp://x", SourceType::Web, vec![]).is_err());
    }

    fn scanned(rel: &str, hash: &str) -> ScannedDocument {
        ScannedDocument {
            relative_path: rel.to_string(),
            location: format!("/r/{}", rel),
            content_type: MIME_TEXT.to_string(),
            content_hash: hash.to_string(),
            modified_at: 0,
            body: "body".to_string(),
        }
    }

    fn document(id: &str, source_id: &str, rel: &str, hash: &str) -> Document {
        Document {
            id: id.to_string(),
            source_id: source_id.to_string(),
            location: format!("/r/{}", rel),
            relative_path: rel.to_string(),
            source_type: SourceType::Folder,
            content_type: MIME_TEXT.to_string(),
            content_hash: hash.to_string(),
            ingested_at: 0,
            modified_at: 0,
            body: "body".to_string(),
        }
    }

    #[test]
    fn test_diff_detects_changed_new_removed() {
        let mgr = SourceManager::new();
        mgr.commit_document(document("d1", "s", "same.md", "h1"));
        mgr.commit_document(document("d2", "s", "edit.md", "h2"));
        mgr.commit_document(document("d3", "s", "gone.md", "h3"));
        mgr.commit_document(document("d4", "other", "x.md", "h4"));

        let diff = mgr.diff(
            "s",
            vec![scanned("same.md", "h1"), scanned("edit.md", "NEW"), scanned("new.md", "h5")],
        );
        assert_eq!(diff.unchanged, 1);
        assert_eq!(diff.removed, vec!["d3".to_string()]);
        assert_eq!(diff.changed.len(), 2);
        assert!(diff.changed.iter().any(|(id, d)| id == "d2" && d.relative_path == "edit.md"));
    }

    #[test]
    fn test_forget_records_path() {
        let tmp = TempDir::new().unwrap();
        let mgr = SourceManager::new();
        let src = mgr
            .register(tmp.path().to_str().unwrap(), SourceType::Folder, vec![])
            .unwrap();
        mgr.commit_document(document("d1", &src.id, "a.md", "h"));
        mgr.forget_document("d1").unwrap();
        assert_eq!(mgr.source(&src.id).unwrap().forgotten, vec!["a.md".to_string()]);
        assert!(matches!(mgr.document("d1"), Err(RagError::NotFound { .. })));
    }

    #[test]
    fn test_remove_source_cascades() {
        let tmp = TempDir::new().unwrap();
        let mgr = SourceManager::new();
        let src = mgr
            .register(tmp.path().to_str().unwrap(), SourceType::Folder, vec![])
            .unwrap();
        for i in 0..10 {
            mgr.commit_document(document(&format!("d{}", i), &src.id, &format!("{}.md", i), "h"));
        }
        mgr.commit_document(document("keep", "other", "k.md", "h"));
        let removed = mgr.remove_source(&src.id).unwrap();
        assert_eq!(removed.len(), 10);
        assert_eq!(mgr.document_count(), 1);
        assert!(mgr.sources().is_empty());
    }
}
