//! Portable export archives.
//!
//! An archive is a zip file holding one knowledge base:
//!
//! | Entry | Content |
//! |-------|---------|
//! | `manifest.json` | format and schema version, configuration, counts, checksums |
//! | `sources.json` | every [`Source`] |
//! | `documents.json` | every [`Document`], including its body |
//! | `chunks.json` | every [`Chunk`], ordered by document then ordinal |
//! | `vectors.bin` | little-endian `f32` vectors in `chunks.json` order |
//!
//! `manifest.json` carries the SHA-256 of every other entry; [`read_archive`]
//! checks versions and checksums before decoding anything else. Archives
//! written at an older schema are upgraded in memory with the same steps the
//! database applies (see [`crate::migrate`]). Writing goes
//! to a temporary file next to the destination, which is renamed into place
//! once complete.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::{RagError, Result};
use crate::kb::KbSnapshot;
use crate::migrate::SCHEMA_VERSION;
use crate::models::{now_ts, Chunk, Document, KnowledgeBaseManifest, Source};
use crate::sources::hash_bytes;

pub const ARCHIVE_FORMAT_VERSION: u32 = 1;

const MANIFEST_ENTRY: &str = "manifest.json";
const PAYLOAD_ENTRIES: [&str; 4] = ["sources.json", "documents.json", "chunks.json", "vectors.bin"];

/// Edits that take the JSON tables from schema `n - 1` to `n`.
const UPGRADES: &[(i64, fn(&mut Tables))] = &[(2, upgrade_to_v2)];

/// Payload tables before typed decoding.
struct Tables {
    sources: Vec<Value>,
    documents: Vec<Value>,
    chunks: Vec<Value>,
}

fn upgrade_to_v2(tables: &mut Tables) {
    for source in tables.sources.iter_mut().filter_map(Value::as_object_mut) {
        source.entry("tags").or_insert_with(|| json!([]));
        source.entry("forgotten").or_insert_with(|| json!([]));
    }
    for chunk in tables.chunks.iter_mut().filter_map(Value::as_object_mut) {
        let overlaps = chunk
            .get("ordinal")
            .and_then(Value::as_u64)
            .is_some_and(|o| o > 0);
        chunk.insert("overlaps_previous".to_string(), Value::Bool(overlaps));
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveCounts {
    pub sources: usize,
    pub documents: usize,
    pub chunks: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveManifest {
    pub format_version: u32,
    pub schema_version: i64,
    pub exported_at: i64,
    pub knowledge_base: KnowledgeBaseManifest,
    pub counts: ArchiveCounts,
    /// SHA-256 of each payload entry, keyed by entry name.
    pub checksums: BTreeMap<String, String>,
}

/// Write `snapshot` to `dest` as an archive.
pub fn write_archive(snapshot: &KbSnapshot, dest: &Path) -> Result<ArchiveManifest> {
    let chunks: Vec<&Chunk> = snapshot.chunks.iter().map(|(c, _)| c).collect();
    let mut vectors = Vec::with_capacity(snapshot.chunks.len() * snapshot.manifest.dims * 4);
    for (_, v) in &snapshot.chunks {
        vectors.extend(vec_to_blob(v));
    }

    let payload: [(&str, Vec<u8>); 4] = [
        ("sources.json", serde_json::to_vec_pretty(&snapshot.sources)?),
        ("documents.json", serde_json::to_vec_pretty(&snapshot.documents)?),
        ("chunks.json", serde_json::to_vec_pretty(&chunks)?),
        ("vectors.bin", vectors),
    ];
    let manifest = ArchiveManifest {
        format_version: ARCHIVE_FORMAT_VERSION,
        schema_version: SCHEMA_VERSION,
        exported_at: now_ts(),
        knowledge_base: snapshot.manifest.clone(),
        counts: ArchiveCounts {
            sources: snapshot.sources.len(),
            documents: snapshot.documents.len(),
            chunks: snapshot.chunks.len(),
        },
        checksums: payload
            .iter()
            .map(|(name, bytes)| (name.to_string(), hash_bytes(bytes)))
            .collect(),
    };

    if let Some(parent) = dest.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let file_name = dest
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "archive".to_string());
    let tmp = dest.with_file_name(format!(".{}.{}.tmp", file_name, Uuid::new_v4()));

    let written = (|| -> Result<()> {
        let mut zip = zip::ZipWriter::new(File::create(&tmp)?);
        let opts = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        zip.start_file(MANIFEST_ENTRY, opts)?;
        zip.write_all(&serde_json::to_vec_pretty(&manifest)?)?;
        for (name, bytes) in &payload {
            zip.start_file(*name, opts)?;
            zip.write_all(bytes)?;
        }
        let file = zip.finish()?;
        file.sync_all()?;
        Ok(())
    })();
    if let Err(e) = written {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    std::fs::rename(&tmp, dest)?;
    Ok(manifest)
}

/// Read and verify an archive.
pub fn read_archive(path: &Path) -> Result<(ArchiveManifest, KbSnapshot)> {
    let mut zip = zip::ZipArchive::new(File::open(path)?)?;

    let manifest: ArchiveManifest = serde_json::from_slice(&read_entry(&mut zip, MANIFEST_ENTRY)?)
        .map_err(|e| RagError::corruption(format!("{}: {}", MANIFEST_ENTRY, e)))?;
    if manifest.format_version > ARCHIVE_FORMAT_VERSION {
        return Err(RagError::SchemaMigrationFailed(format!(
            "archive format {} is newer than supported format {}",
            manifest.format_version, ARCHIVE_FORMAT_VERSION
        )));
    }
    if manifest.schema_version > SCHEMA_VERSION {
        return Err(RagError::SchemaMigrationFailed(format!(
            "archive schema {} is newer than supported schema {}",
            manifest.schema_version, SCHEMA_VERSION
        )));
    }

    let mut entries: BTreeMap<&str, Vec<u8>> = BTreeMap::new();
    for name in PAYLOAD_ENTRIES {
        let bytes = read_entry(&mut zip, name)?;
        let expected = manifest
            .checksums
            .get(name)
            .ok_or_else(|| RagError::corruption(format!("no checksum for {}", name)))?;
        if &hash_bytes(&bytes) != expected {
            return Err(RagError::corruption(format!("checksum mismatch for {}", name)));
        }
        entries.insert(name, bytes);
    }

    let mut tables = Tables {
        sources: decode(&entries, "sources.json")?,
        documents: decode(&entries, "documents.json")?,
        chunks: decode(&entries, "chunks.json")?,
    };
    for (version, upgrade) in UPGRADES {
        if manifest.schema_version < *version {
            info!(to = *version, "upgrading archive tables");
            upgrade(&mut tables);
        }
    }
    let sources: Vec<Source> = typed(tables.sources, "sources.json")?;
    let documents: Vec<Document> = typed(tables.documents, "documents.json")?;
    let chunks: Vec<Chunk> = typed(tables.chunks, "chunks.json")?;
    let vectors = entries.get("vectors.bin").map(Vec::as_slice).unwrap_or_default();

    let dims = manifest.knowledge_base.dims;
    if vectors.len() != chunks.len() * dims * 4 {
        return Err(RagError::corruption(format!(
            "vectors.bin holds {} bytes; {} chunks of {} dims need {}",
            vectors.len(),
            chunks.len(),
            dims,
            chunks.len() * dims * 4
        )));
    }
    let counts = ArchiveCounts {
        sources: sources.len(),
        documents: documents.len(),
        chunks: chunks.len(),
    };
    if counts != manifest.counts {
        return Err(RagError::corruption("entry counts disagree with manifest"));
    }

    let chunks = chunks
        .into_iter()
        .zip(vectors.chunks_exact(dims.max(1) * 4))
        .map(|(c, blob)| (c, blob_to_vec(blob)))
        .collect();

    let snapshot = KbSnapshot {
        manifest: manifest.knowledge_base.clone(),
        sources,
        documents,
        chunks,
    };
    Ok((manifest, snapshot))
}

fn read_entry(zip: &mut zip::ZipArchive<File>, name: &str) -> Result<Vec<u8>> {
    let mut entry = zip
        .by_name(name)
        .map_err(|_| RagError::corruption(format!("archive is missing {}", name)))?;
    let mut out = Vec::new();
    entry.read_to_end(&mut out)?;
    Ok(out)
}

fn decode<T: serde::de::DeserializeOwned>(entries: &BTreeMap<&str, Vec<u8>>, name: &str) -> Result<T> {
    let bytes = entries
        .get(name)
        .ok_or_else(|| RagError::corruption(format!("archive is missing {}", name)))?;
    serde_json::from_slice(bytes).map_err(|e| RagError::corruption(format!("{}: {}", name, e)))
}

fn typed<T: serde::de::DeserializeOwned>(rows: Vec<Value>, name: &str) -> Result<Vec<T>> {
    rows.into_iter()
        .map(|row| {
            serde_json::from_value(row)
                .map_err(|e| RagError::corruption(format!("{}: {}", name, e)))
        })
        .collect()
}
