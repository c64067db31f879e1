//! Staged relationship model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A directed typed edge between two canonical entities, staged in
/// relational storage for downstream graph loading.
///
/// `from ≠ to`, both endpoints belong to the same document, and
/// `(from, to, type)` is unique per document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub uuid: Uuid,
    pub document_uuid: Uuid,
    pub from_entity_uuid: Uuid,
    pub to_entity_uuid: Uuid,
    /// Type label, e.g. `REPRESENTS`, `PARTY_TO`, `EMPLOYED_BY`.
    pub rel_type: String,
    pub confidence: f32,
    /// First supporting chunk, when available.
    pub evidence_chunk_uuid: Option<Uuid>,
    pub evidence_text: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Relationship {
    pub fn new(
        document_uuid: Uuid,
        from_entity_uuid: Uuid,
        to_entity_uuid: Uuid,
        rel_type: String,
        confidence: f32,
    ) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            document_uuid,
            from_entity_uuid,
            to_entity_uuid,
            rel_type,
            confidence,
            evidence_chunk_uuid: None,
            evidence_text: None,
            created_at: Utc::now(),
        }
    }

    /// Dedup key within a document.
    pub fn key(&self) -> (Uuid, Uuid, String) {
        (
            self.from_entity_uuid,
            self.to_entity_uuid,
            self.rel_type.clone(),
        )
    }
}
