//! Knowledge base statistics and health overview.
//!
//! A quick summary of what is indexed: documents, chunks, vectors, and a
//! per-source breakdown with the last refresh time. Used by `orag stats` to
//! confirm that refreshes landed and that every chunk has a vector.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;

use crate::kb::KnowledgeBase;
use crate::models::KnowledgeBaseManifest;

/// Per-source breakdown of document and chunk counts.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SourceStats {
    pub source_id: String,
    pub location: String,
    pub source_type: String,
    pub documents: usize,
    pub chunks: usize,
    pub refreshed_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct KbStats {
    pub manifest: KnowledgeBaseManifest,
    pub documents: usize,
    pub chunks: usize,
    pub vectors: usize,
    pub file_bytes: u64,
    pub sources: Vec<SourceStats>,
}

impl KbStats {
    pub fn collect(kb: &KnowledgeBase, file: Option<&Path>) -> Self {
        let snap = kb.snapshot();

        let mut chunks_per_doc: BTreeMap<&str, usize> = BTreeMap::new();
        for (c, _) in &snap.chunks {
            *chunks_per_doc.entry(c.document_id.as_str()).or_default() += 1;
        }

        let sources = snap
            .sources
            .iter()
            .map(|s| {
                let docs: Vec<&str> = snap
                    .documents
                    .iter()
                    .filter(|d| d.source_id == s.id)
                    .map(|d| d.id.as_str())
                    .collect();
                SourceStats {
                    source_id: s.id.clone(),
                    location: s.location.clone(),
                    source_type: s.source_type.to_string(),
                    documents: docs.len(),
                    chunks: docs
                        .iter()
                        .map(|d| chunks_per_doc.get(d).copied().unwrap_or(0))
                        .sum(),
                    refreshed_at: s.refreshed_at,
                }
            })
            .collect();

        Self {
            documents: snap.documents.len(),
            chunks: snap.chunks.len(),
            vectors: snap.chunks.iter().filter(|(_, v)| !v.is_empty()).count(),
            file_bytes: file
                .and_then(|p| std::fs::metadata(p).ok())
                .map(|m| m.len())
                .unwrap_or(0),
            manifest: snap.manifest,
            sources,
        }
    }

    pub fn print(&self) {
        let m = &self.manifest;
        println!("Knowledge base '{}'", m.name);
        println!("{}", "=".repeat(18 + m.name.len()));
        println!();
        println!("  Embedding:   {} / {} ({} dims)", m.embedding_provider, m.embedding_model, m.dims);
        println!("  Chunking:    {} chars, {} overlap", m.chunk_size, m.chunk_overlap);
        println!("  Size:        {}", format_bytes(self.file_bytes));
        println!("  Modified:    {}", format_ts_relative(m.modified_at));
        println!();
        println!("  Documents:   {}", self.documents);
        println!("  Chunks:      {}", self.chunks);
        println!(
            "  Vectors:     {} / {} ({}%)",
            self.vectors,
            self.chunks,
            if self.chunks > 0 {
                (self.vectors * 100) / self.chunks
            } else {
                0
            }
        );

        if !self.sources.is_empty() {
            println!();
            println!("  By source:");
            println!(
                "  {:<38} {:<9} {:>6} {:>8}   {}",
                "SOURCE", "TYPE", "DOCS", "CHUNKS", "LAST REFRESH"
            );
            println!("  {}", "-".repeat(80));

            for s in &self.sources {
                let refreshed = match s.refreshed_at {
                    Some(ts) => format_ts_relative(ts),
                    None => "never".to_string(),
                };
                println!(
                    "  {:<38} {:<9} {:>6} {:>8}   {}",
                    truncate(&s.location, 38),
                    s.source_type,
                    s.documents,
                    s.chunks,
                    refreshed
                );
            }
        }

        println!();
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let tail: String = s
        .chars()
        .rev()
        .take(max - 1)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("…{}", tail)
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp relative to now (e.g. "3 hours ago").
pub fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

pub fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
