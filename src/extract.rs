//! Text extraction for ingested files.
//!
//! Plain-text formats are decoded as UTF-8. PDF goes through `pdf-extract`;
//! DOCX is unzipped and the `w:t` runs of `word/document.xml` are collected,
//! one line per paragraph. HTML is read leniently with `quick-xml`: markup,
//! scripts, and styles are dropped and block elements become line breaks. Every failure is a [`RagError::SourceRead`] so the
//! caller can skip the file and carry on.

use std::io::Read;
use std::path::Path;

use crate::error::{RagError, Result};

pub const MIME_TEXT: &str = "text/plain";
pub const MIME_MARKDOWN: &str = "text/markdown";
pub const MIME_HTML: &str = "text/html";
pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Bytes inspected by [`looks_binary`].
const BINARY_SNIFF_BYTES: usize = 8 * 1024;

/// Content type inferred from the file extension.
pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("md") | Some("markdown") => MIME_MARKDOWN,
        Some("html") | Some("htm") => MIME_HTML,
        Some("pdf") => MIME_PDF,
        Some("docx") => MIME_DOCX,
        _ => MIME_TEXT,
    }
}

/// A NUL byte near the start of the file marks it as binary.
pub fn looks_binary(bytes: &[u8]) -> bool {
    bytes[..bytes.len().min(BINARY_SNIFF_BYTES)].contains(&0)
}

/// Extract UTF-8 text from `bytes`. `origin` is only used in error messages.
pub fn extract_text(bytes: &[u8], content_type: &str, origin: &str) -> Result<String> {
    let fail = |reason: String| RagError::SourceRead {
        path: origin.to_string(),
        reason,
    };
    match content_type {
        MIME_PDF => pdf_extract::extract_text_from_mem(bytes)
            .map_err(|e| fail(format!("PDF extraction failed: {}", e))),
        MIME_DOCX => extract_docx(bytes).map_err(|e| fail(format!("DOCX extraction failed: {}", e))),
        _ => {
            if looks_binary(bytes) {
                return Err(fail("binary content".to_string()));
            }
            let text = String::from_utf8(bytes.to_vec())
                .map_err(|_| fail("not valid UTF-8".to_string()))?;
            if content_type == MIME_HTML {
                Ok(html_text(&text))
            } else {
                Ok(text)
            }
        }
    }
}

/// Elements that end a line of text.
const HTML_BLOCKS: &[&[u8]] = &[
    b"p", b"div", b"br", b"li", b"tr", b"h1", b"h2", b"h3", b"h4", b"h5", b"h6", b"title",
    b"pre", b"section", b"article", b"header", b"footer", b"blockquote", b"td", b"th",
];

/// Visible text of an HTML page, one line per block.
fn html_text(html: &str) -> String {
    use quick_xml::events::Event;

    let cleaned = drop_elements(html, &["script", "style", "noscript"]);
    let mut reader = quick_xml::Reader::from_str(&cleaned);
    reader.config_mut().check_end_names = false;

    let mut raw = String::new();
    loop {
        let before = reader.buffer_position();
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                if is_block(e.local_name().as_ref()) {
                    raw.push('\n');
                }
            }
            Ok(Event::End(e)) => {
                if is_block(e.local_name().as_ref()) {
                    raw.push('\n');
                }
            }
            Ok(Event::Text(t)) => match t.unescape_with(|entity| match entity {
                "nbsp" => Some(" "),
                _ => None,
            }) {
                Ok(text) => raw.push_str(&text),
                Err(_) => raw.push_str(&String::from_utf8_lossy(&t)),
            },
            Ok(Event::CData(c)) => raw.push_str(&String::from_utf8_lossy(&c)),
            Ok(Event::Eof) => break,
            // Malformed markup: keep going unless the reader is stuck.
            Err(_) if reader.buffer_position() == before => break,
            _ => {}
        }
    }

    raw.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn is_block(name: &[u8]) -> bool {
    let lower = name.to_ascii_lowercase();
    HTML_BLOCKS.contains(&lower.as_slice())
}

/// Remove `<tag ...> ... </tag>` spans, case-insensitively. Their bodies are
/// not markup and would confuse the reader.
fn drop_elements(html: &str, tags: &[&str]) -> String {
    let lower = html.to_ascii_lowercase();
    let mut out = String::with_capacity(html.len());
    let mut pos = 0;
    while pos < html.len() {
        let next = tags
            .iter()
            .filter_map(|t| lower[pos..].find(&format!("<{}", t)).map(|i| (pos + i, *t)))
            .min_by_key(|(i, _)| *i);
        let Some((start, tag)) = next else {
            break;
        };
        out.push_str(&html[pos..start]);
        let close = format!("</{}", tag);
        pos = match lower[start..].find(&close) {
            Some(i) => {
                let after = start + i + close.len();
                lower[after..].find('>').map_or(html.len(), |j| after + j + 1)
            }
            None => html.len(),
        };
    }
    if pos < html.len() {
        out.push_str(&html[pos..]);
    }
    out
}

fn extract_docx(bytes: &[u8]) -> std::result::Result<String, String> {
    let mut archive =
        zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| e.to_string())?;
    let entry = archive
        .by_name("word/document.xml")
        .map_err(|_| "word/document.xml not found".to_string())?;
    let mut doc_xml = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut doc_xml)
        .map_err(|e| e.to_string())?;
    if doc_xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err("word/document.xml exceeds size limit".to_string());
    }
    collect_runs(&doc_xml)
}

fn collect_runs(xml: &[u8]) -> std::result::Result<String, String> {
    use quick_xml::events::Event;

    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Text(t)) if in_text => {
                let text = t.unescape().map_err(|e| e.to_string())?;
                out.push_str(&text);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(e.to_string()),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}
