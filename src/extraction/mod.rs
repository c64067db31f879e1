//! Entity extraction stage logic.
//!
//! Per chunk, the external endpoint maps text to typed mentions. The
//! extractor enforces the output policies — span validation, in-chunk
//! dedup, type whitelisting — and switches to the local pattern fallback
//! for the rest of a document after repeated endpoint failures.

mod fallback;

pub use fallback::FallbackNer;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorKind, StageError};
use crate::llm::{LlmClient, LlmError, RawMention};
use crate::models::{Chunk, EntityMention, EntityType, ExtractionMethod};
use crate::rate_limit::RedisTokenBucket;

/// What to do with mention types outside the whitelist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownTypePolicy {
    /// Re-type to OTHER.
    Retype,
    /// Drop the mention.
    Drop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Consecutive endpoint failures before the document switches to the
    /// local fallback for its remaining chunks.
    pub fallback_after_failures: u32,
    pub unknown_type_policy: UnknownTypePolicy,
    /// Retry budget for rate-limited calls before giving up on a chunk.
    pub rate_limit_attempts: u32,
    /// Token bucket name shared across workers.
    pub provider: String,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            fallback_after_failures: 3,
            unknown_type_policy: UnknownTypePolicy::Retype,
            rate_limit_attempts: 5,
            provider: "llm".to_string(),
        }
    }
}

/// Source of raw mentions for one chunk of text.
#[async_trait]
pub trait EntityBackend: Send + Sync {
    async fn extract(&self, text: &str) -> Result<Vec<RawMention>, LlmError>;
}

/// Endpoint-backed entity source with shared rate limiting and backoff.
pub struct LlmEntityBackend {
    client: Arc<LlmClient>,
    limiter: RedisTokenBucket,
    provider: String,
    rate_limit_attempts: u32,
}

impl LlmEntityBackend {
    pub fn new(client: Arc<LlmClient>, limiter: RedisTokenBucket, config: &ExtractionConfig) -> Self {
        Self {
            client,
            limiter,
            provider: config.provider.clone(),
            rate_limit_attempts: config.rate_limit_attempts,
        }
    }
}

#[async_trait]
impl EntityBackend for LlmEntityBackend {
    async fn extract(&self, text: &str) -> Result<Vec<RawMention>, LlmError> {
        let mut attempt = 0u32;
        loop {
            self.limiter
                .wait_ready(&self.provider)
                .await
                .map_err(|e| LlmError::Connection(e.to_string()))?;

            match self.client.extract_entities(text).await {
                Err(LlmError::RateLimited) if attempt < self.rate_limit_attempts => {
                    let base = 5u64 * 2u64.saturating_pow(attempt);
                    let jitter = rand::thread_rng().gen_range(0..1000);
                    let delay = std::time::Duration::from_millis(base * 1000 + jitter);
                    tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, "extraction rate limited, backing off");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

/// Chunk-by-chunk extractor applying the output policies.
pub struct EntityExtractor {
    backend: Arc<dyn EntityBackend>,
    fallback: FallbackNer,
    config: ExtractionConfig,
}

impl EntityExtractor {
    pub fn new(backend: Arc<dyn EntityBackend>, config: ExtractionConfig) -> Self {
        Self {
            backend,
            fallback: FallbackNer::new(),
            config,
        }
    }

    /// Extract mentions for every chunk of a document, in
    /// (chunk_index, start_offset) order.
    pub async fn extract_document(
        &self,
        document_uuid: Uuid,
        chunks: &[Chunk],
    ) -> Result<Vec<EntityMention>, StageError> {
        let mut mentions = Vec::new();
        let mut consecutive_failures = 0u32;
        let mut fallback_for_rest = false;

        for chunk in chunks {
            let (raw, method) = if fallback_for_rest {
                (self.fallback.extract(&chunk.text), ExtractionMethod::Fallback)
            } else {
                match self.backend.extract(&chunk.text).await {
                    Ok(raw) => {
                        consecutive_failures = 0;
                        (raw, ExtractionMethod::Llm)
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        tracing::warn!(
                            document = %document_uuid,
                            chunk = chunk.chunk_index,
                            failures = consecutive_failures,
                            error = %e,
                            "entity extraction call failed, using fallback for this chunk"
                        );
                        if e.kind() == ErrorKind::RateLimit {
                            // Backoff budget is spent; surface it so the
                            // runtime reschedules the stage.
                            return Err(e.into());
                        }
                        if consecutive_failures >= self.config.fallback_after_failures {
                            fallback_for_rest = true;
                        }
                        (self.fallback.extract(&chunk.text), ExtractionMethod::Fallback)
                    }
                }
            };

            let cleaned = apply_policies(raw, &chunk.text, self.config.unknown_type_policy);
            mentions.extend(to_mentions(cleaned, chunk, method));
        }

        mentions.sort_by(|a, b| {
            (a.chunk_index, a.start_offset).cmp(&(b.chunk_index, b.start_offset))
        });

        Ok(mentions)
    }
}

/// A validated mention with its final type.
#[derive(Debug, Clone)]
struct CleanMention {
    text: String,
    entity_type: EntityType,
    start: usize,
    end: usize,
    confidence: f32,
}

/// Apply span validation, the type whitelist, and in-chunk dedup.
fn apply_policies(
    raw: Vec<RawMention>,
    chunk_text: &str,
    unknown_policy: UnknownTypePolicy,
) -> Vec<CleanMention> {
    let chars: Vec<char> = chunk_text.chars().collect();
    let mut cleaned: Vec<CleanMention> = Vec::new();

    for mention in raw {
        let Some((start, end)) = validate_span(&chars, mention.start, mention.end) else {
            continue;
        };

        let entity_type = match EntityType::from_str(&mention.entity_type) {
            Some(t) => t,
            None => match unknown_policy {
                UnknownTypePolicy::Retype => EntityType::Other,
                UnknownTypePolicy::Drop => continue,
            },
        };

        let text: String = chars[start..end].iter().collect();
        let confidence = mention.confidence.clamp(0.0, 1.0);

        // Dedup on (lowercased text, type), keeping highest confidence.
        let key = (text.to_lowercase(), entity_type);
        if let Some(existing) = cleaned
            .iter_mut()
            .find(|m| (m.text.to_lowercase(), m.entity_type) == key)
        {
            if confidence > existing.confidence {
                existing.confidence = confidence;
                existing.start = start;
                existing.end = end;
                existing.text = text;
            }
            continue;
        }

        cleaned.push(CleanMention {
            text,
            entity_type,
            start,
            end,
            confidence,
        });
    }

    cleaned
}

/// Validate offsets against the chunk, clipping whitespace at the edges.
/// Returns `None` when the span is out of range or empty after clipping.
fn validate_span(chars: &[char], start: usize, end: usize) -> Option<(usize, usize)> {
    if start >= end || end > chars.len() {
        return None;
    }

    let mut start = start;
    let mut end = end;
    while start < end && chars[start].is_whitespace() {
        start += 1;
    }
    while end > start && chars[end - 1].is_whitespace() {
        end -= 1;
    }

    (start < end).then_some((start, end))
}

fn to_mentions(
    cleaned: Vec<CleanMention>,
    chunk: &Chunk,
    method: ExtractionMethod,
) -> Vec<EntityMention> {
    cleaned
        .into_iter()
        .map(|m| EntityMention {
            // Deterministic identity keyed on position and type so stage
            // re-runs reproduce rows.
            uuid: Uuid::new_v5(
                &chunk.document_uuid,
                format!(
                    "mention:{}:{}:{}:{}",
                    chunk.chunk_index,
                    m.start,
                    m.end,
                    m.entity_type.as_str()
                )
                .as_bytes(),
            ),
            document_uuid: chunk.document_uuid,
            chunk_uuid: chunk.uuid,
            chunk_index: chunk.chunk_index,
            text: m.text,
            entity_type: m.entity_type,
            confidence: m.confidence,
            start_offset: m.start as i32,
            end_offset: m.end as i32,
            canonical_entity_uuid: None,
            unresolved_reason: None,
            extraction_method: method,
            created_at: Utc::now(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn raw(text: &str, ty: &str, start: usize, end: usize, confidence: f32) -> RawMention {
        RawMention {
            text: text.to_string(),
            entity_type: ty.to_string(),
            start,
            end,
            confidence,
        }
    }

    #[test]
    fn test_span_validation_drops_out_of_range() {
        let chunk = "short text";
        let cleaned = apply_policies(
            vec![raw("beyond", "PERSON", 5, 99, 0.9)],
            chunk,
            UnknownTypePolicy::Retype,
        );
        assert!(cleaned.is_empty());
    }

    #[test]
    fn test_span_whitespace_clipping() {
        let chunk = "  John Doe  appeared";
        let cleaned = apply_policies(
            vec![raw(" John Doe ", "PERSON", 0, 12, 0.9)],
            chunk,
            UnknownTypePolicy::Retype,
        );
        assert_eq!(cleaned.len(), 1);
        assert_eq!(cleaned[0].text, "John Doe");
        assert_eq!(cleaned[0].start, 2);
        assert_eq!(cleaned[0].end, 10);
    }

    #[test]
    fn test_dedup_keeps_highest_confidence() {
        let chunk = "Acme Corp met Acme Corp";
        let cleaned = apply_policies(
            vec![
                raw("Acme Corp", "ORG", 0, 9, 0.7),
                raw("acme corp", "ORG", 14, 23, 0.9),
            ],
            chunk,
            UnknownTypePolicy::Retype,
        );
        assert_eq!(cleaned.len(), 1);
        assert!((cleaned[0].confidence - 0.9).abs() < f32::EPSILON);
    }

    #[test]
    fn test_unknown_type_policies() {
        let chunk = "some artifact here";
        let retyped = apply_policies(
            vec![raw("artifact", "WIDGET", 5, 13, 0.8)],
            chunk,
            UnknownTypePolicy::Retype,
        );
        assert_eq!(retyped.len(), 1);
        assert_eq!(retyped[0].entity_type, EntityType::Other);

        let dropped = apply_policies(
            vec![raw("artifact", "WIDGET", 5, 13, 0.8)],
            chunk,
            UnknownTypePolicy::Drop,
        );
        assert!(dropped.is_empty());
    }

    struct FlakyBackend {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl EntityBackend for FlakyBackend {
        async fn extract(&self, _text: &str) -> Result<Vec<RawMention>, LlmError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                Err(LlmError::Server("boom".to_string()))
            } else {
                Ok(vec![raw("Mr. John Doe", "PERSON", 0, 12, 0.9)])
            }
        }
    }

    fn chunk_at(doc: Uuid, index: i32, text: &str) -> Chunk {
        Chunk::new(doc, index, text.to_string(), 0, text.chars().count() as i64)
    }

    #[tokio::test]
    async fn test_fallback_switch_after_consecutive_failures() {
        let doc = Uuid::new_v4();
        let backend = Arc::new(FlakyBackend {
            calls: AtomicU32::new(0),
            fail_first: 99,
        });
        let extractor = EntityExtractor::new(backend.clone(), ExtractionConfig::default());

        let chunks: Vec<Chunk> = (0..5)
            .map(|i| chunk_at(doc, i, "Judge Sarah Connor presiding over Acme Widgets LLC."))
            .collect();

        let mentions = extractor.extract_document(doc, &chunks).await.unwrap();

        // Every chunk was served by the fallback.
        assert!(mentions
            .iter()
            .all(|m| m.extraction_method == ExtractionMethod::Fallback));
        assert!(!mentions.is_empty());
        // The endpoint stopped being consulted after the third failure.
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_endpoint_recovery_resets_counter() {
        let doc = Uuid::new_v4();
        let backend = Arc::new(FlakyBackend {
            calls: AtomicU32::new(0),
            fail_first: 2,
        });
        let extractor = EntityExtractor::new(backend, ExtractionConfig::default());

        let chunks: Vec<Chunk> = (0..4)
            .map(|i| chunk_at(doc, i, "Mr. John Doe appeared."))
            .collect();

        let mentions = extractor.extract_document(doc, &chunks).await.unwrap();

        let llm_count = mentions
            .iter()
            .filter(|m| m.extraction_method == ExtractionMethod::Llm)
            .count();
        assert!(llm_count >= 1);
    }

    #[tokio::test]
    async fn test_mentions_ordered_and_deterministic() {
        let doc = Uuid::new_v4();
        let backend = Arc::new(FlakyBackend {
            calls: AtomicU32::new(0),
            fail_first: 0,
        });
        let extractor = EntityExtractor::new(backend, ExtractionConfig::default());

        let chunks = vec![
            chunk_at(doc, 0, "Mr. John Doe appeared."),
            chunk_at(doc, 1, "Mr. John Doe appeared."),
        ];

        let first = extractor.extract_document(doc, &chunks).await.unwrap();
        let backend2 = Arc::new(FlakyBackend {
            calls: AtomicU32::new(0),
            fail_first: 0,
        });
        let extractor2 = EntityExtractor::new(backend2, ExtractionConfig::default());
        let second = extractor2.extract_document(doc, &chunks).await.unwrap();

        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.uuid, b.uuid);
            assert!(a.chunk_index <= b.chunk_index);
        }
    }
}
