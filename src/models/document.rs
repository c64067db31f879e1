//! Document model: the unit of processing.
//!
//! A document is created at intake (status `pending`) and advances through
//! six strictly ordered stages. The pipeline coordinator owns status
//! transitions; stage executors own per-stage result writes.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Overall processing status of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// The six ordered pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Ocr,
    Chunking,
    EntityExtraction,
    EntityResolution,
    RelationshipBuilding,
    Finalization,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Ocr,
        Stage::Chunking,
        Stage::EntityExtraction,
        Stage::EntityResolution,
        Stage::RelationshipBuilding,
        Stage::Finalization,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ocr => "ocr",
            Self::Chunking => "chunking",
            Self::EntityExtraction => "entity_extraction",
            Self::EntityResolution => "entity_resolution",
            Self::RelationshipBuilding => "relationship_building",
            Self::Finalization => "finalization",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "ocr" => Some(Self::Ocr),
            "chunking" => Some(Self::Chunking),
            "entity_extraction" => Some(Self::EntityExtraction),
            "entity_resolution" => Some(Self::EntityResolution),
            "relationship_building" => Some(Self::RelationshipBuilding),
            "finalization" => Some(Self::Finalization),
            _ => None,
        }
    }

    /// 0-based position in the stage order. Recorded stage indices must
    /// never decrease for a document.
    pub fn index(&self) -> usize {
        Self::ALL.iter().position(|s| s == self).unwrap_or(0)
    }

    pub fn first() -> Self {
        Self::Ocr
    }

    /// The stage that follows this one, or `None` after finalization.
    pub fn next(&self) -> Option<Stage> {
        Self::ALL.get(self.index() + 1).copied()
    }

    /// TTL for the per-(document, stage) scoped lock. OCR waits on an
    /// external provider and gets the longer window.
    pub fn lock_ttl(&self) -> Duration {
        match self {
            Self::Ocr => Duration::from_secs(60 * 60),
            _ => Duration::from_secs(30 * 60),
        }
    }
}

/// A document moving through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Unique identifier, assigned at intake.
    pub uuid: Uuid,
    /// Project this document belongs to.
    pub project_uuid: Uuid,
    /// Source blob location, `scheme://bucket/key`.
    pub blob_location: String,
    /// Original filename, when known.
    pub original_filename: Option<String>,
    /// SHA-256 of the source bytes, computed at intake.
    pub content_hash: Option<String>,
    /// Size of the source blob in bytes.
    pub file_size: Option<u64>,
    /// MIME type, sniffed from content when the declared type is generic.
    pub mime_type: Option<String>,
    /// Overall pipeline status.
    pub status: DocumentStatus,
    /// Stage currently executing or last recorded.
    pub current_stage: Option<Stage>,
    /// Provider job id while an OCR job is outstanding.
    pub ocr_job_id: Option<String>,
    /// Raw text produced by stage 1.
    pub raw_text: Option<String>,
    /// Last classified error, as `kind: message`.
    pub error: Option<String>,
    pub page_count: u32,
    pub chunk_count: u32,
    pub entity_count: u32,
    /// Additional document information.
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// Create a new pending document.
    pub fn new(uuid: Uuid, project_uuid: Uuid, blob_location: String) -> Self {
        let now = Utc::now();
        Self {
            uuid,
            project_uuid,
            blob_location,
            original_filename: None,
            content_hash: None,
            file_size: None,
            mime_type: None,
            status: DocumentStatus::Pending,
            current_stage: None,
            ocr_job_id: None,
            raw_text: None,
            error: None,
            page_count: 0,
            chunk_count: 0,
            entity_count: 0,
            metadata: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        }
    }

    /// Compute SHA-256 hash of source content.
    pub fn compute_hash(content: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(content);
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order() {
        assert_eq!(Stage::first(), Stage::Ocr);
        assert_eq!(Stage::Ocr.next(), Some(Stage::Chunking));
        assert_eq!(Stage::RelationshipBuilding.next(), Some(Stage::Finalization));
        assert_eq!(Stage::Finalization.next(), None);

        let mut prev = Stage::first().index();
        let mut stage = Stage::first();
        while let Some(next) = stage.next() {
            assert!(next.index() > prev);
            prev = next.index();
            stage = next;
        }
    }

    #[test]
    fn test_stage_roundtrip() {
        for stage in Stage::ALL {
            assert_eq!(Stage::from_str(stage.as_str()), Some(stage));
        }
    }

    #[test]
    fn test_ocr_lock_ttl_is_longer() {
        assert!(Stage::Ocr.lock_ttl() > Stage::Chunking.lock_ttl());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!DocumentStatus::Pending.is_terminal());
        assert!(!DocumentStatus::InProgress.is_terminal());
        assert!(DocumentStatus::Completed.is_terminal());
        assert!(DocumentStatus::Failed.is_terminal());
        assert!(DocumentStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_compute_hash() {
        let hash = Document::compute_hash(b"motion to dismiss");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, Document::compute_hash(b"motion to dismiss"));
    }
}
