use crate::error::IngestError;
use crate::models::Chunk;
use crate::lexical::{cached_pattern, CachedPattern};
use regex::Regex;
use std::sync::OnceLock;
use uuid::Uuid;

/// Windows shorter than this after trimming are dropped.
pub const MIN_CHUNK_CHARS: usize = 20;

pub const DEFAULT_CHUNK_SIZE: usize = 500;
pub const DEFAULT_CHUNK_OVERLAP: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub size: usize,
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_CHUNK_SIZE,
            overlap: DEFAULT_CHUNK_OVERLAP,
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<(), IngestError> {
        validate_window(self.size as i64, self.overlap as i64)
    }
}

fn blank_line_runs() -> Result<&'static Regex, regex::Error> {
    static PATTERN: CachedPattern = OnceLock::new();
    cached_pattern(&PATTERN, r"\n{3,}")
}

fn horizontal_whitespace_runs() -> Result<&'static Regex, regex::Error> {
    static PATTERN: CachedPattern = OnceLock::new();
    cached_pattern(&PATTERN, r"[ \t]{2,}")
}

/// Unifies line endings, caps blank-line runs at one empty line, squeezes
/// horizontal whitespace runs and trims the result. Idempotent.
pub fn normalize(text: &str) -> Result<String, IngestError> {
    if text.is_empty() {
        return Ok(String::new());
    }

    let unified = text.replace("\r\n", "\n").replace('\r', "\n");
    let collapsed = blank_line_runs()?.replace_all(&unified, "\n\n");
    let squeezed = horizontal_whitespace_runs()?.replace_all(&collapsed, " ");
    Ok(squeezed.trim().to_string())
}

fn validate_window(size: i64, overlap: i64) -> Result<(), IngestError> {
    if size <= 0 {
        return Err(IngestError::InvalidParameter(format!(
            "chunk size must be > 0, got {size}"
        )));
    }
    if overlap < 0 {
        return Err(IngestError::InvalidParameter(format!(
            "chunk overlap must be >= 0, got {overlap}"
        )));
    }
    if overlap >= size {
        return Err(IngestError::InvalidParameter(format!(
            "chunk overlap ({overlap}) must be smaller than chunk size ({size})"
        )));
    }
    Ok(())
}

/// Splits `text` into fixed-size character windows that overlap by `overlap`
/// characters. Each window is trimmed and kept only if it still has at least
/// [`MIN_CHUNK_CHARS`] characters.
pub fn chunk(text: &str, size: i64, overlap: i64) -> Result<Vec<String>, IngestError> {
    validate_window(size, overlap)?;

    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return Ok(Vec::new());
    }

    let size = size as usize;
    let overlap = overlap as usize;
    let mut windows = Vec::new();
    let mut start = 0usize;

    while start < chars.len() {
        let end = (start + size).min(chars.len());
        let window: String = chars[start..end].iter().collect();
        let trimmed = window.trim();
        if trimmed.chars().count() >= MIN_CHUNK_CHARS {
            windows.push(trimmed.to_string());
        }
        if end == chars.len() {
            break;
        }
        start = end.saturating_sub(overlap);
    }

    Ok(windows)
}

/// Normalizes and chunks a document's text, tagging each chunk with its
/// position in the source.
pub fn build_chunks(
    document_id: Uuid,
    raw_text: &str,
    config: ChunkingConfig,
) -> Result<Vec<Chunk>, IngestError> {
    let normalized = normalize(raw_text)?;
    let windows = chunk(&normalized, config.size as i64, config.overlap as i64)?;

    Ok(windows
        .into_iter()
        .enumerate()
        .map(|(chunk_index, text)| Chunk {
            text,
            document_id,
            chunk_index,
        })
        .collect())
}
