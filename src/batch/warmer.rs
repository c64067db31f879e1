//! Cache warmer: preloads persistent-store state into the state store
//! ahead of a batch so early stages hit warm reads.
//!
//! Idempotent; warm entries carry a one-hour TTL and are plain
//! overwrites, so repeated invocations are harmless.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::CoreContext;
use crate::models::Batch;
use crate::pipeline::PipelineError;
use crate::state::keys;

/// What a warm pass loaded, per category.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WarmStats {
    pub ocr_texts: usize,
    pub chunk_sets: usize,
    pub resolution_maps: usize,
    pub project_entities: usize,
}

#[derive(Clone)]
pub struct CacheWarmer {
    ctx: Arc<CoreContext>,
}

impl CacheWarmer {
    pub fn new(ctx: Arc<CoreContext>) -> Self {
        Self { ctx }
    }

    /// Preload project metadata, OCR results, chunks, frequent canonical
    /// entities, and resolution maps for a batch.
    pub async fn warm(&self, batch: &Batch) -> Result<WarmStats, PipelineError> {
        let mut stats = WarmStats::default();

        // Project metadata for the batch's project.
        let project_meta = serde_json::json!({
            "project_uuid": batch.project_uuid,
            "batch_id": batch.batch_id,
            "document_count": batch.document_uuids.len(),
            "priority": batch.priority.as_str(),
        });
        self.ctx
            .state
            .put_json(
                &keys::proj_meta(batch.project_uuid),
                &project_meta,
                keys::TTL_HOUR_SECS,
            )
            .await?;

        // Canonical-entity frequency across the batch's documents.
        let mut entity_counts: BTreeMap<String, u64> = BTreeMap::new();

        for &document_uuid in &batch.document_uuids {
            stats.ocr_texts += self.warm_document_text(document_uuid).await?;
            stats.chunk_sets += self.warm_document_chunks(document_uuid).await?;
            stats.resolution_maps += self
                .warm_resolution_map(document_uuid, &mut entity_counts)
                .await?;
        }

        if !entity_counts.is_empty() {
            let mut frequent: Vec<(&String, &u64)> = entity_counts.iter().collect();
            frequent.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
            let top: Vec<serde_json::Value> = frequent
                .into_iter()
                .take(50)
                .map(|(name, count)| serde_json::json!({ "entity": name, "mentions": count }))
                .collect();

            self.ctx
                .state
                .put_json(
                    &keys::proj_entities(batch.project_uuid),
                    &top,
                    keys::TTL_HOUR_SECS,
                )
                .await?;
            stats.project_entities = top.len();
        }

        tracing::info!(
            batch = %batch.batch_id,
            ocr_texts = stats.ocr_texts,
            chunk_sets = stats.chunk_sets,
            resolution_maps = stats.resolution_maps,
            project_entities = stats.project_entities,
            "cache warmed"
        );
        Ok(stats)
    }

    async fn warm_document_text(&self, document_uuid: Uuid) -> Result<usize, PipelineError> {
        let Some(doc) = self.ctx.docs.get(document_uuid).await? else {
            return Ok(0);
        };
        match doc.raw_text {
            Some(text) if !text.is_empty() => {
                self.ctx.state.warm_ocr_text(document_uuid, &text).await?;
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn warm_document_chunks(&self, document_uuid: Uuid) -> Result<usize, PipelineError> {
        let chunks = self.ctx.chunks.get_for_document(document_uuid).await?;
        if chunks.is_empty() {
            return Ok(0);
        }
        self.ctx.state.cache_chunks(document_uuid, &chunks).await?;
        Ok(1)
    }

    async fn warm_resolution_map(
        &self,
        document_uuid: Uuid,
        entity_counts: &mut BTreeMap<String, u64>,
    ) -> Result<usize, PipelineError> {
        let canonical = self.ctx.entities.get_canonical(document_uuid).await?;
        if canonical.is_empty() {
            return Ok(0);
        }

        for entity in &canonical {
            *entity_counts
                .entry(format!("{}:{}", entity.entity_type.as_str(), entity.canonical_name))
                .or_insert(0) += entity.mention_count as u64;
        }

        let mentions = self.ctx.entities.get_mentions(document_uuid).await?;
        let map: BTreeMap<String, String> = mentions
            .iter()
            .filter_map(|m| {
                m.canonical_entity_uuid
                    .map(|c| (m.uuid.to_string(), c.to_string()))
            })
            .collect();

        self.ctx
            .state
            .put_json(
                &keys::doc_resolution(document_uuid),
                &map,
                keys::TTL_HOUR_SECS,
            )
            .await?;
        Ok(1)
    }
}
