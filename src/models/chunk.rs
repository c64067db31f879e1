//! Chunk model: an immutable text window of a document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One text window of a document.
///
/// Chunk indices are dense and strictly increasing per document. Char
/// ranges are non-decreasing and may overlap by the configured margin.
/// The set is closed once the chunking stage completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub uuid: Uuid,
    pub document_uuid: Uuid,
    /// 0-based, contiguous position within the document.
    pub chunk_index: i32,
    pub text: String,
    /// Char range `[start, end)` into the document's raw text.
    pub char_start: i64,
    pub char_end: i64,
    /// 1-based page span, when page breaks were present in the text.
    pub page_start: Option<i32>,
    pub page_end: Option<i32>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Chunk {
    pub fn new(
        document_uuid: Uuid,
        chunk_index: i32,
        text: String,
        char_start: i64,
        char_end: i64,
    ) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            document_uuid,
            chunk_index,
            text,
            char_start,
            char_end,
            page_start: None,
            page_end: None,
            metadata: serde_json::json!({}),
            created_at: Utc::now(),
        }
    }

    /// Length in chars, the unit mention offsets are validated against.
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}
