//! Relationship building: canonical entities + chunks to staged edges.
//!
//! The builder requires both the document's mentions and its canonical
//! entities as inputs; endpoints come back from the external function as
//! mention indices and are projected onto canonicals before filtering.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StageError;
use crate::llm::{LlmClient, LlmError, MentionRef, RawEdge};
use crate::models::{CanonicalEntity, Chunk, EntityMention, Relationship};
use crate::rate_limit::RedisTokenBucket;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipConfig {
    /// Candidate edges below this confidence are dropped.
    pub min_confidence: f32,
    /// Evidence text is clipped to this many chars.
    pub max_evidence_chars: usize,
    /// Token bucket name shared across workers.
    pub provider: String,
    /// Retry budget for rate-limited calls.
    pub rate_limit_attempts: u32,
}

impl Default for RelationshipConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.5,
            max_evidence_chars: 240,
            provider: "llm".to_string(),
            rate_limit_attempts: 5,
        }
    }
}

/// Source of candidate edges for one chunk.
#[async_trait]
pub trait RelationshipBackend: Send + Sync {
    async fn extract(
        &self,
        text: &str,
        mentions: &[MentionRef<'_>],
    ) -> Result<Vec<RawEdge>, LlmError>;
}

/// Endpoint-backed edge source with shared rate limiting and backoff.
pub struct LlmRelationshipBackend {
    client: Arc<LlmClient>,
    limiter: RedisTokenBucket,
    provider: String,
    rate_limit_attempts: u32,
}

impl LlmRelationshipBackend {
    pub fn new(
        client: Arc<LlmClient>,
        limiter: RedisTokenBucket,
        config: &RelationshipConfig,
    ) -> Self {
        Self {
            client,
            limiter,
            provider: config.provider.clone(),
            rate_limit_attempts: config.rate_limit_attempts,
        }
    }
}

#[async_trait]
impl RelationshipBackend for LlmRelationshipBackend {
    async fn extract(
        &self,
        text: &str,
        mentions: &[MentionRef<'_>],
    ) -> Result<Vec<RawEdge>, LlmError> {
        let mut attempt = 0u32;
        loop {
            self.limiter
                .wait_ready(&self.provider)
                .await
                .map_err(|e| LlmError::Connection(e.to_string()))?;

            match self.client.extract_relationships(text, mentions).await {
                Err(LlmError::RateLimited) if attempt < self.rate_limit_attempts => {
                    let base = 5u64 * 2u64.saturating_pow(attempt);
                    let jitter = rand::thread_rng().gen_range(0..1000);
                    let delay = std::time::Duration::from_millis(base * 1000 + jitter);
                    tracing::warn!(attempt, "relationship extraction rate limited, backing off");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

pub struct RelationshipBuilder {
    backend: Arc<dyn RelationshipBackend>,
    config: RelationshipConfig,
}

impl RelationshipBuilder {
    pub fn new(backend: Arc<dyn RelationshipBackend>, config: RelationshipConfig) -> Self {
        Self { backend, config }
    }

    /// Build the staged relationship set for a document.
    ///
    /// Callers must pass the document's chunks, mentions, AND canonical
    /// entities; endpoints are never re-derived here.
    pub async fn build(
        &self,
        document_uuid: Uuid,
        chunks: &[Chunk],
        mentions: &[EntityMention],
        canonical: &[CanonicalEntity],
    ) -> Result<Vec<Relationship>, StageError> {
        let canonical_ids: HashSet<Uuid> = canonical.iter().map(|c| c.uuid).collect();

        // (from, to, type) -> relationship; evidence stays with the first
        // supporting chunk, confidence takes the max.
        let mut edges: BTreeMap<(Uuid, Uuid, String), Relationship> = BTreeMap::new();

        for chunk in chunks {
            let chunk_mentions: Vec<&EntityMention> = mentions
                .iter()
                .filter(|m| m.chunk_index == chunk.chunk_index)
                .collect();

            if chunk_mentions.len() < 2 {
                continue;
            }

            let refs: Vec<MentionRef<'_>> = chunk_mentions
                .iter()
                .enumerate()
                .map(|(index, m)| MentionRef {
                    index,
                    text: &m.text,
                    entity_type: m.entity_type.as_str(),
                })
                .collect();

            let candidates = self
                .backend
                .extract(&chunk.text, &refs)
                .await
                .map_err(StageError::from)?;

            for edge in candidates {
                let (Some(from_mention), Some(to_mention)) =
                    (chunk_mentions.get(edge.from), chunk_mentions.get(edge.to))
                else {
                    continue;
                };

                // Project endpoints; unresolved mentions drop the edge.
                let (Some(from), Some(to)) = (
                    from_mention.canonical_entity_uuid,
                    to_mention.canonical_entity_uuid,
                ) else {
                    continue;
                };

                if from == to {
                    continue;
                }
                if !canonical_ids.contains(&from) || !canonical_ids.contains(&to) {
                    continue;
                }
                let confidence = edge.confidence.clamp(0.0, 1.0);
                if confidence < self.config.min_confidence {
                    continue;
                }

                let rel_type = edge.rel_type.trim().to_uppercase().replace(' ', "_");
                if rel_type.is_empty() {
                    continue;
                }

                let key = (from, to, rel_type.clone());
                match edges.get_mut(&key) {
                    Some(existing) => {
                        existing.confidence = existing.confidence.max(confidence);
                    }
                    None => {
                        edges.insert(key, Relationship {
                            uuid: Uuid::new_v5(
                                &document_uuid,
                                format!("rel:{}:{}:{}", from, to, rel_type).as_bytes(),
                            ),
                            document_uuid,
                            from_entity_uuid: from,
                            to_entity_uuid: to,
                            rel_type,
                            confidence,
                            evidence_chunk_uuid: Some(chunk.uuid),
                            evidence_text: Some(evidence_snippet(
                                chunk,
                                from_mention,
                                to_mention,
                                self.config.max_evidence_chars,
                            )),
                            created_at: Utc::now(),
                        });
                    }
                }
            }
        }

        Ok(edges.into_values().collect())
    }
}

/// Chunk text spanning both mentions, clipped to the evidence budget.
fn evidence_snippet(
    chunk: &Chunk,
    a: &EntityMention,
    b: &EntityMention,
    max_chars: usize,
) -> String {
    let chars: Vec<char> = chunk.text.chars().collect();
    let start = (a.start_offset.min(b.start_offset)).max(0) as usize;
    let end = (a.end_offset.max(b.end_offset)).max(0) as usize;
    let end = end.min(chars.len());
    if start >= end {
        return String::new();
    }

    let span: String = chars[start..end].iter().collect();
    if span.chars().count() <= max_chars {
        span
    } else {
        span.chars().take(max_chars).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntityType, ExtractionMethod};

    struct FixedBackend {
        edges: Vec<RawEdge>,
    }

    #[async_trait]
    impl RelationshipBackend for FixedBackend {
        async fn extract(
            &self,
            _text: &str,
            _mentions: &[MentionRef<'_>],
        ) -> Result<Vec<RawEdge>, LlmError> {
            Ok(self.edges.clone())
        }
    }

    fn edge(from: usize, to: usize, ty: &str, confidence: f32) -> RawEdge {
        RawEdge {
            from,
            to,
            rel_type: ty.to_string(),
            confidence,
        }
    }

    struct Fixture {
        doc: Uuid,
        chunks: Vec<Chunk>,
        mentions: Vec<EntityMention>,
        canonical: Vec<CanonicalEntity>,
    }

    fn fixture() -> Fixture {
        let doc = Uuid::new_v4();
        let chunk = Chunk::new(
            doc,
            0,
            "John Doe is counsel for Acme Widgets LLC in this matter.".to_string(),
            0,
            56,
        );

        let c1 = CanonicalEntity {
            uuid: Uuid::new_v5(&doc, b"e1"),
            document_uuid: doc,
            entity_type: EntityType::Person,
            canonical_name: "John Doe".to_string(),
            aliases: vec![],
            mention_count: 1,
            confidence: 0.9,
            created_at: Utc::now(),
        };
        let c2 = CanonicalEntity {
            uuid: Uuid::new_v5(&doc, b"e2"),
            document_uuid: doc,
            entity_type: EntityType::Org,
            canonical_name: "Acme Widgets LLC".to_string(),
            aliases: vec![],
            mention_count: 1,
            confidence: 0.85,
            created_at: Utc::now(),
        };

        let m1 = EntityMention {
            uuid: Uuid::new_v4(),
            document_uuid: doc,
            chunk_uuid: chunk.uuid,
            chunk_index: 0,
            text: "John Doe".to_string(),
            entity_type: EntityType::Person,
            confidence: 0.9,
            start_offset: 0,
            end_offset: 8,
            canonical_entity_uuid: Some(c1.uuid),
            unresolved_reason: None,
            extraction_method: ExtractionMethod::Llm,
            created_at: Utc::now(),
        };
        let m2 = EntityMention {
            uuid: Uuid::new_v4(),
            document_uuid: doc,
            chunk_uuid: chunk.uuid,
            chunk_index: 0,
            text: "Acme Widgets LLC".to_string(),
            entity_type: EntityType::Org,
            confidence: 0.85,
            start_offset: 24,
            end_offset: 40,
            canonical_entity_uuid: Some(c2.uuid),
            unresolved_reason: None,
            extraction_method: ExtractionMethod::Llm,
            created_at: Utc::now(),
        };

        Fixture {
            doc,
            chunks: vec![chunk],
            mentions: vec![m1, m2],
            canonical: vec![c1, c2],
        }
    }

    #[tokio::test]
    async fn test_projection_and_evidence() {
        let f = fixture();
        let builder = RelationshipBuilder::new(
            Arc::new(FixedBackend {
                edges: vec![edge(0, 1, "represents", 0.8)],
            }),
            RelationshipConfig::default(),
        );

        let rels = builder
            .build(f.doc, &f.chunks, &f.mentions, &f.canonical)
            .await
            .unwrap();

        assert_eq!(rels.len(), 1);
        assert_eq!(rels[0].from_entity_uuid, f.canonical[0].uuid);
        assert_eq!(rels[0].to_entity_uuid, f.canonical[1].uuid);
        assert_eq!(rels[0].rel_type, "REPRESENTS");
        assert_eq!(rels[0].evidence_chunk_uuid, Some(f.chunks[0].uuid));
        assert_eq!(
            rels[0].evidence_text.as_deref(),
            Some("John Doe is counsel for Acme Widgets LLC")
        );
    }

    #[tokio::test]
    async fn test_filters_self_loops_and_low_confidence() {
        let f = fixture();
        let builder = RelationshipBuilder::new(
            Arc::new(FixedBackend {
                edges: vec![
                    edge(0, 0, "KNOWS", 0.9),
                    edge(0, 1, "REPRESENTS", 0.3),
                ],
            }),
            RelationshipConfig::default(),
        );

        let rels = builder
            .build(f.doc, &f.chunks, &f.mentions, &f.canonical)
            .await
            .unwrap();
        assert!(rels.is_empty());
    }

    #[tokio::test]
    async fn test_unresolved_endpoint_drops_edge() {
        let mut f = fixture();
        f.mentions[1].canonical_entity_uuid = None;

        let builder = RelationshipBuilder::new(
            Arc::new(FixedBackend {
                edges: vec![edge(0, 1, "REPRESENTS", 0.9)],
            }),
            RelationshipConfig::default(),
        );

        let rels = builder
            .build(f.doc, &f.chunks, &f.mentions, &f.canonical)
            .await
            .unwrap();
        assert!(rels.is_empty());
    }

    #[tokio::test]
    async fn test_dedup_keeps_highest_confidence() {
        let f = fixture();
        let builder = RelationshipBuilder::new(
            Arc::new(FixedBackend {
                edges: vec![
                    edge(0, 1, "REPRESENTS", 0.6),
                    edge(0, 1, "REPRESENTS", 0.9),
                ],
            }),
            RelationshipConfig::default(),
        );

        let rels = builder
            .build(f.doc, &f.chunks, &f.mentions, &f.canonical)
            .await
            .unwrap();
        assert_eq!(rels.len(), 1);
        assert!((rels[0].confidence - 0.9).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn test_deterministic_uuids() {
        let f = fixture();
        let make = || {
            RelationshipBuilder::new(
                Arc::new(FixedBackend {
                    edges: vec![edge(0, 1, "REPRESENTS", 0.8)],
                }),
                RelationshipConfig::default(),
            )
        };

        let a = make()
            .build(f.doc, &f.chunks, &f.mentions, &f.canonical)
            .await
            .unwrap();
        let b = make()
            .build(f.doc, &f.chunks, &f.mentions, &f.canonical)
            .await
            .unwrap();

        assert_eq!(a[0].uuid, b[0].uuid);
    }
}
