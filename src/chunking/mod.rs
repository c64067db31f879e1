//! Deterministic semantic chunking with overlap.
//!
//! The chunker windows forward over the raw text with a fixed stride of
//! `max_tokens - overlap_tokens`, preferring to end each window at a
//! sentence, paragraph, or page boundary found in the window tail, and
//! falling back to whitespace. Budgets are measured in characters.
//! Byte-identical text with identical config yields byte-identical chunks
//! with identical indices and UUIDs.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StageError;
use crate::models::Chunk;

/// Chunking configuration. Token budgets are measured in characters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkerConfig {
    pub max_tokens: usize,
    pub overlap_tokens: usize,
    /// Trailing chunks shorter than this merge into their predecessor.
    pub min_chunk_chars: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_tokens: 500,
            overlap_tokens: 50,
            min_chunk_chars: 200,
        }
    }
}

/// Deterministic chunker.
#[derive(Debug, Clone, Default)]
pub struct Chunker {
    config: ChunkerConfig,
}

impl Chunker {
    pub fn new(config: ChunkerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Split raw text into ordered chunks.
    pub fn chunk(&self, document_uuid: Uuid, text: &str) -> Result<Vec<Chunk>, StageError> {
        let chars: Vec<char> = text.chars().collect();

        if chars.iter().all(|c| c.is_whitespace()) {
            return Err(StageError::data("empty_ocr: no text to chunk"));
        }

        let max = self.config.max_tokens.max(1);
        let stride = max.saturating_sub(self.config.overlap_tokens).max(1);

        if let Some(run) = longest_token_run(&chars) {
            if run > max {
                return Err(StageError::data(format!(
                    "tokenization_error: token of {} chars exceeds window of {}",
                    run, max
                )));
            }
        }

        let mut windows: Vec<(usize, usize)> = Vec::new();
        let mut cursor = 0usize;

        while cursor < chars.len() {
            let hard_end = (cursor + max).min(chars.len());
            let end = if hard_end == chars.len() {
                hard_end
            } else {
                // Only snap within the tail past the next window's start so
                // the fixed stride never leaves a gap.
                let tail_start = cursor + stride;
                find_boundary(&chars, tail_start, hard_end).unwrap_or(hard_end)
            };

            windows.push((cursor, end));

            if hard_end == chars.len() {
                break;
            }
            cursor += stride;
        }

        // Merge a trailing window shorter than the minimum into its
        // predecessor.
        if windows.len() > 1 {
            let (last_start, last_end) = windows[windows.len() - 1];
            if last_end - last_start < self.config.min_chunk_chars {
                windows.pop();
                let last = windows.len() - 1;
                windows[last].1 = last_end;
            }
        }

        let chunks = windows
            .into_iter()
            .enumerate()
            .map(|(index, (start, end))| {
                let chunk_text: String = chars[start..end].iter().collect();
                let mut chunk = Chunk::new(
                    document_uuid,
                    index as i32,
                    chunk_text,
                    start as i64,
                    end as i64,
                );
                // Deterministic identity so stage re-runs reproduce rows.
                chunk.uuid = Uuid::new_v5(
                    &document_uuid,
                    format!("chunk:{}:{}:{}", index, start, end).as_bytes(),
                );
                let (page_start, page_end) = page_span(&chars, start, end);
                chunk.page_start = Some(page_start);
                chunk.page_end = Some(page_end);
                chunk
            })
            .collect();

        Ok(chunks)
    }
}

/// Length of the longest whitespace-free run.
fn longest_token_run(chars: &[char]) -> Option<usize> {
    let mut longest = 0usize;
    let mut current = 0usize;
    for c in chars {
        if c.is_whitespace() {
            longest = longest.max(current);
            current = 0;
        } else {
            current += 1;
        }
    }
    longest = longest.max(current);
    (longest > 0).then_some(longest)
}

/// Find the best boundary in `[from, to)`, preferring sentence over
/// paragraph over page break, with whitespace as the fallback. Returns an
/// exclusive end index.
fn find_boundary(chars: &[char], from: usize, to: usize) -> Option<usize> {
    if from >= to {
        return None;
    }

    let mut sentence = None;
    let mut paragraph = None;
    let mut page = None;
    let mut whitespace = None;

    for i in from..to {
        let c = chars[i];
        if matches!(c, '.' | '!' | '?') {
            let next_ws = chars.get(i + 1).map(|n| n.is_whitespace()).unwrap_or(true);
            if next_ws {
                sentence = Some(i + 1);
            }
        }
        if c == '\n' && chars.get(i + 1) == Some(&'\n') {
            paragraph = Some(i);
        }
        if c == '\u{c}' {
            page = Some(i);
        }
        if c.is_whitespace() {
            whitespace = Some(i);
        }
    }

    sentence.or(paragraph).or(page).or(whitespace)
}

/// 1-based page span for a char range, derived from form feeds.
fn page_span(chars: &[char], start: usize, end: usize) -> (i32, i32) {
    let page_at = |pos: usize| -> i32 {
        1 + chars[..pos].iter().filter(|c| **c == '\u{c}').count() as i32
    };
    let last = if end > start { end - 1 } else { start };
    (page_at(start), page_at(last))
}
