//! Entity mention and canonical entity models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Entity types recognized by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityType {
    #[serde(rename = "PERSON")]
    Person,
    #[serde(rename = "ORG")]
    Org,
    #[serde(rename = "LOC")]
    Location,
    #[serde(rename = "DATE")]
    Date,
    #[serde(rename = "MONEY")]
    Money,
    #[serde(rename = "OTHER")]
    Other,
}

impl EntityType {
    pub const ALL: [EntityType; 6] = [
        EntityType::Person,
        EntityType::Org,
        EntityType::Location,
        EntityType::Date,
        EntityType::Money,
        EntityType::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Person => "PERSON",
            Self::Org => "ORG",
            Self::Location => "LOC",
            Self::Date => "DATE",
            Self::Money => "MONEY",
            Self::Other => "OTHER",
        }
    }

    /// Tolerant parse covering the aliases external extractors emit.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PERSON" | "PER" => Some(Self::Person),
            "ORG" | "ORGANIZATION" => Some(Self::Org),
            "LOC" | "LOCATION" | "GPE" => Some(Self::Location),
            "DATE" | "TIME" => Some(Self::Date),
            "MONEY" | "CURRENCY" => Some(Self::Money),
            "OTHER" | "MISC" => Some(Self::Other),
            _ => None,
        }
    }
}

/// How a mention was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    /// External extraction endpoint.
    Llm,
    /// Local pattern-based fallback.
    Fallback,
}

impl ExtractionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Llm => "llm",
            Self::Fallback => "fallback",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "llm" => Some(Self::Llm),
            "fallback" => Some(Self::Fallback),
            _ => None,
        }
    }
}

/// An occurrence of an entity in one chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityMention {
    pub uuid: Uuid,
    pub document_uuid: Uuid,
    pub chunk_uuid: Uuid,
    /// Denormalized from the chunk for deterministic ordering.
    pub chunk_index: i32,
    pub text: String,
    pub entity_type: EntityType,
    /// Extractor confidence in [0, 1].
    pub confidence: f32,
    /// Char offsets within the chunk text, `[start, end)`.
    pub start_offset: i32,
    pub end_offset: i32,
    /// Set by entity resolution; `None` with a reason means explicitly
    /// unresolved.
    pub canonical_entity_uuid: Option<Uuid>,
    pub unresolved_reason: Option<String>,
    pub extraction_method: ExtractionMethod,
    pub created_at: DateTime<Utc>,
}

/// The deduplicated representative of a cluster of mentions within a
/// document's resolution scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalEntity {
    /// Deterministic v5 UUID derived from the document and the cluster's
    /// first mention position, so re-running resolution reproduces ids.
    pub uuid: Uuid,
    pub document_uuid: Uuid,
    pub entity_type: EntityType,
    pub canonical_name: String,
    /// Distinct mention texts other than the canonical name.
    pub aliases: Vec<String>,
    pub mention_count: u32,
    /// Highest confidence among clustered mentions.
    pub confidence: f32,
    pub created_at: DateTime<Utc>,
}
