//! Markdown → retrieval chunks. Sections split on `## ` headers, long
//! sections resplit at line boundaries, tiny fragments dropped.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// The unit of indexing and retrieval.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryChunk {
    /// `source#index`, stable for a given ingest pass.
    pub id: String,
    pub text: String,
    /// File stem the chunk was carved from.
    pub source: String,
    /// SHA-256 hex of `text`; equal hashes share one cached embedding.
    pub hash: String,
    pub embedding: Option<Vec<f32>>,
    /// Source file mtime, used for age filters.
    pub timestamp: DateTime<Utc>,
}

pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Carve `content` into chunks of [min_chars, max_chars].
pub fn chunk_markdown(
    source: &str,
    content: &str,
    mtime: DateTime<Utc>,
    min_chars: usize,
    max_chars: usize,
) -> Vec<MemoryChunk> {
    let mut pieces: Vec<String> = Vec::new();

    for section in split_sections(content) {
        if section.chars().count() <= max_chars {
            pieces.push(section);
        } else {
            pieces.extend(split_at_lines(&section, max_chars));
        }
    }

    pieces
        .into_iter()
        .map(|p| p.trim().to_string())
        .filter(|p| p.chars().count() >= min_chars)
        .enumerate()
        .map(|(idx, text)| MemoryChunk {
            id: format!("{}#{}", source, idx),
            hash: content_hash(&text),
            source: source.to_string(),
            embedding: None,
            timestamp: mtime,
            text,
        })
        .collect()
}

/// Split on `## ` headers at line starts; the header stays with its body.
fn split_sections(content: &str) -> Vec<String> {
    let mut sections: Vec<String> = Vec::new();
    let mut current = String::new();
    for line in content.lines() {
        if line.starts_with("## ") && !current.trim().is_empty() {
            sections.push(std::mem::take(&mut current));
        }
        current.push_str(line);
        current.push('\n');
    }
    if !current.trim().is_empty() {
        sections.push(current);
    }
    sections
}

/// Greedy line-boundary packing for sections beyond max_chars.
fn split_at_lines(section: &str, max_chars: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for line in section.lines() {
        let line_len = line.chars().count() + 1;
        if !current.is_empty() && current.chars().count() + line_len > max_chars {
            out.push(std::mem::take(&mut current));
        }
        current.push_str(line);
        current.push('\n');
        // A single line longer than the cap gets hard-split.
        while current.chars().count() > max_chars {
            let head: String = current.chars().take(max_chars).collect();
            let rest: String = current.chars().skip(max_chars).collect();
            out.push(head);
            current = rest;
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}
