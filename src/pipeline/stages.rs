//! Stage executors.
//!
//! Each stage is a function of `(task, ctx)`: inputs are fetched from the
//! persistent store (or its cache mirror), outputs are written back
//! durably before the coordinator is allowed to transition. Every stage
//! begins with an idempotent re-entry check so a replayed task returns
//! `completed` without recomputation.

use std::time::Duration;

use crate::context::CoreContext;
use crate::error::StageError;
use crate::models::{Document, OcrJob, OcrJobStatus, Stage};
use crate::ocr::{JobHandle, OcrAdapter, PollOutcome};
use crate::state::keys;

use super::outcome::{StageReport, TaskDisposition};
use super::{QueuedTask, TaskKind};

/// Execute one queued task to a disposition.
pub async fn run_task(task: &QueuedTask, ctx: &CoreContext) -> TaskDisposition {
    match ctx.state.is_cancel_requested(task.document_uuid).await {
        Ok(true) => return TaskDisposition::Cancelled,
        Ok(false) => {}
        Err(e) => return TaskDisposition::Failed(StageError::transient(e.to_string())),
    }

    let doc = match ctx.docs.get(task.document_uuid).await {
        Ok(Some(doc)) => doc,
        Ok(None) => {
            return TaskDisposition::Failed(StageError::permanent(format!(
                "unknown document {}",
                task.document_uuid
            )))
        }
        Err(e) => return TaskDisposition::Failed(StageError::from(e)),
    };

    let result = match task.kind {
        TaskKind::OcrSubmit => ocr_submit(task, &doc, ctx).await,
        TaskKind::OcrPoll => ocr_poll(task, &doc, ctx).await,
        TaskKind::Chunking => chunking(&doc, ctx).await.map(TaskDisposition::Completed),
        TaskKind::EntityExtraction => entity_extraction(&doc, ctx)
            .await
            .map(TaskDisposition::Completed),
        TaskKind::EntityResolution => entity_resolution(&doc, ctx)
            .await
            .map(TaskDisposition::Completed),
        TaskKind::RelationshipBuilding => relationship_building(&doc, ctx)
            .await
            .map(TaskDisposition::Completed),
        TaskKind::Finalization => finalization(&doc, ctx).await.map(TaskDisposition::Completed),
    };

    match result {
        Ok(disposition) => disposition,
        Err(e) => TaskDisposition::Failed(e),
    }
}

// ============================================================================
// Stage 1a: OCR submit
// ============================================================================

async fn ocr_submit(
    task: &QueuedTask,
    doc: &Document,
    ctx: &CoreContext,
) -> Result<TaskDisposition, StageError> {
    // Idempotent re-entry: OCR output already persisted.
    if doc.raw_text.is_some() {
        return Ok(TaskDisposition::Completed(StageReport::noted(
            Stage::Ocr,
            "ocr output already present",
        )));
    }

    // A live job from an earlier attempt: resume polling instead of
    // resubmitting.
    if let Some(job) = ctx.tasks.get_ocr_job_for_document(doc.uuid).await? {
        if job.status == OcrJobStatus::InProgress {
            tracing::info!(document = %doc.uuid, job = %job.job_id, "resuming existing ocr job");
            return Ok(reschedule_poll(task, ctx.ocr.settings().poll_interval_secs));
        }
    }

    let submission = ctx.ocr.submit(doc).await?;

    let mut job = OcrJob::new(submission.handle.job_id.clone(), doc.uuid);
    job.page_count = Some(submission.page_count as i32);
    ctx.tasks.upsert_ocr_job(&job).await?;
    ctx.docs.set_ocr_job_id(doc.uuid, &job.job_id).await?;

    let handle_json = serde_json::to_string(&submission.handle)
        .map_err(|e| StageError::permanent(format!("handle serialization: {}", e)))?;
    ctx.state
        .put_ocr_job(&job.job_id, doc.uuid, &handle_json)
        .await?;

    tracing::info!(
        document = %doc.uuid,
        job = %job.job_id,
        scanned = submission.scanned,
        pages = submission.page_count,
        "ocr job submitted"
    );

    Ok(reschedule_poll(task, ctx.ocr.settings().initial_poll_delay_secs))
}

fn reschedule_poll(task: &QueuedTask, delay_secs: u64) -> TaskDisposition {
    let mut poll = task.clone();
    poll.kind = TaskKind::OcrPoll;
    TaskDisposition::Reschedule {
        task: poll,
        delay: Duration::from_secs(delay_secs),
    }
}

// ============================================================================
// Stage 1b: OCR poll
// ============================================================================

async fn ocr_poll(
    task: &QueuedTask,
    doc: &Document,
    ctx: &CoreContext,
) -> Result<TaskDisposition, StageError> {
    if doc.raw_text.is_some() {
        return Ok(TaskDisposition::Completed(StageReport::noted(
            Stage::Ocr,
            "ocr output already present",
        )));
    }

    let job = ctx
        .tasks
        .get_ocr_job_for_document(doc.uuid)
        .await?
        .ok_or_else(|| StageError::transient("no ocr job recorded for document"))?;

    let handle: JobHandle = match ctx.state.get_ocr_job_handle(&job.job_id).await? {
        Some(json) => serde_json::from_str(&json)
            .unwrap_or_else(|_| JobHandle::whole(job.job_id.clone())),
        None => JobHandle::whole(job.job_id.clone()),
    };

    let attempts = ctx.state.incr_ocr_attempts(&job.job_id).await?;
    let settings = ctx.ocr.settings();

    match ctx.ocr.poll(&handle).await? {
        PollOutcome::InProgress => {
            if attempts >= settings.max_polls as u64 {
                let message = format!(
                    "ocr_timeout: provider did not complete after {} polls",
                    attempts
                );
                ctx.tasks
                    .update_ocr_job(&job.job_id, OcrJobStatus::Failed, job.page_count, Some(message.as_str()), None)
                    .await?;
                ctx.state
                    .set_ocr_job_status(&job.job_id, OcrJobStatus::Failed)
                    .await?;
                return Err(StageError::permanent(message));
            }

            tracing::debug!(
                document = %doc.uuid,
                job = %job.job_id,
                attempts,
                "ocr still in progress"
            );
            Ok(reschedule_poll(task, settings.poll_interval_secs))
        }
        PollOutcome::Completed { pages } => {
            let text = OcrAdapter::concatenate_pages(&pages);
            let page_count = pages.len() as u32;

            ctx.docs.set_raw_text(doc.uuid, &text, page_count).await?;
            ctx.tasks
                .update_ocr_job(
                    &job.job_id,
                    OcrJobStatus::Completed,
                    Some(page_count as i32),
                    None,
                    Some(keys::doc_ocr(doc.uuid).as_str()),
                )
                .await?;
            ctx.state
                .set_ocr_job_status(&job.job_id, OcrJobStatus::Completed)
                .await?;
            ctx.state.cache_ocr_text(doc.uuid, &text).await?;

            tracing::info!(document = %doc.uuid, pages = page_count, chars = text.len(), "ocr completed");
            Ok(TaskDisposition::Completed(StageReport::with_items(
                Stage::Ocr,
                page_count as u64,
            )))
        }
        PollOutcome::Failed { reason } => {
            let message = format!("provider failure: {}", reason);
            ctx.tasks
                .update_ocr_job(&job.job_id, OcrJobStatus::Failed, job.page_count, Some(message.as_str()), None)
                .await?;
            ctx.state
                .set_ocr_job_status(&job.job_id, OcrJobStatus::Failed)
                .await?;
            Err(StageError::permanent(message))
        }
    }
}

// ============================================================================
// Stage 2: chunking
// ============================================================================

async fn chunking(doc: &Document, ctx: &CoreContext) -> Result<StageReport, StageError> {
    // Idempotent re-entry: expected chunk set already persisted.
    if doc.chunk_count > 0 {
        let existing = ctx.chunks.count_for_document(doc.uuid).await?;
        if existing == doc.chunk_count as u64 {
            return Ok(StageReport::noted(Stage::Chunking, "chunks already present"));
        }
    }

    let text = match ctx.state.cached_ocr_text(doc.uuid).await? {
        Some(text) => text,
        None => doc
            .raw_text
            .clone()
            .ok_or_else(|| StageError::permanent("no ocr output for chunking"))?,
    };

    let chunks = ctx.chunker.chunk(doc.uuid, &text)?;

    ctx.chunks.replace_for_document(doc.uuid, &chunks).await?;
    ctx.docs.set_chunk_count(doc.uuid, chunks.len() as u32).await?;
    ctx.state.cache_chunks(doc.uuid, &chunks).await?;

    Ok(StageReport::with_items(Stage::Chunking, chunks.len() as u64))
}

// ============================================================================
// Stage 3: entity extraction
// ============================================================================

async fn entity_extraction(doc: &Document, ctx: &CoreContext) -> Result<StageReport, StageError> {
    let existing = ctx.entities.count_mentions(doc.uuid).await?;
    if existing > 0 {
        return Ok(StageReport::noted(
            Stage::EntityExtraction,
            "mentions already present",
        ));
    }

    let chunks = match ctx.state.cached_chunks(doc.uuid).await? {
        Some(chunks) if !chunks.is_empty() => chunks,
        _ => ctx.chunks.get_for_document(doc.uuid).await?,
    };
    if chunks.is_empty() {
        return Err(StageError::permanent("no chunks available for extraction"));
    }

    let mentions = ctx.extractor.extract_document(doc.uuid, &chunks).await?;
    ctx.entities.replace_mentions(doc.uuid, &mentions).await?;

    Ok(StageReport::with_items(
        Stage::EntityExtraction,
        mentions.len() as u64,
    ))
}

// ============================================================================
// Stage 4: entity resolution
// ============================================================================

async fn entity_resolution(doc: &Document, ctx: &CoreContext) -> Result<StageReport, StageError> {
    let mentions = ctx.entities.get_mentions(doc.uuid).await?;
    if mentions.is_empty() {
        return Ok(StageReport::noted(
            Stage::EntityResolution,
            "no mentions to resolve",
        ));
    }

    // Idempotent re-entry: resolution closure already holds.
    let resolved = mentions
        .iter()
        .all(|m| m.canonical_entity_uuid.is_some() || m.unresolved_reason.is_some());
    if resolved && ctx.entities.count_canonical(doc.uuid).await? > 0 {
        return Ok(StageReport::noted(
            Stage::EntityResolution,
            "mentions already resolved",
        ));
    }

    let outcome = ctx.resolver.resolve(doc.uuid, &mentions);
    ctx.entities
        .write_resolution(doc.uuid, &outcome.canonical, &outcome.assignments)
        .await?;
    ctx.docs
        .set_entity_count(doc.uuid, outcome.canonical.len() as u32)
        .await?;

    Ok(StageReport::with_items(
        Stage::EntityResolution,
        outcome.canonical.len() as u64,
    ))
}

// ============================================================================
// Stage 5: relationship building
// ============================================================================

async fn relationship_building(
    doc: &Document,
    ctx: &CoreContext,
) -> Result<StageReport, StageError> {
    let existing = ctx.relationships.count_for_document(doc.uuid).await?;
    if existing > 0 {
        return Ok(StageReport::noted(
            Stage::RelationshipBuilding,
            "relationships already staged",
        ));
    }

    let chunks = ctx.chunks.get_for_document(doc.uuid).await?;
    // Builder contract: both mentions and canonical entities are supplied.
    let mentions = ctx.entities.get_mentions(doc.uuid).await?;
    let canonical = ctx.entities.get_canonical(doc.uuid).await?;

    if canonical.is_empty() {
        // Entities absent or never resolved; relationships stay absent.
        ctx.relationships.replace_for_document(doc.uuid, &[]).await?;
        return Ok(StageReport::noted(
            Stage::RelationshipBuilding,
            "no canonical entities, nothing to relate",
        ));
    }

    let relationships = ctx
        .relationship_builder
        .build(doc.uuid, &chunks, &mentions, &canonical)
        .await?;
    ctx.relationships
        .replace_for_document(doc.uuid, &relationships)
        .await?;

    Ok(StageReport::with_items(
        Stage::RelationshipBuilding,
        relationships.len() as u64,
    ))
}

// ============================================================================
// Stage 6: finalization
// ============================================================================

async fn finalization(doc: &Document, ctx: &CoreContext) -> Result<StageReport, StageError> {
    let chunk_count = ctx.chunks.count_for_document(doc.uuid).await?;
    let canonical_count = ctx.entities.count_canonical(doc.uuid).await?;
    let mention_count = ctx.entities.count_mentions(doc.uuid).await?;
    let relationship_count = ctx.relationships.count_for_document(doc.uuid).await?;

    // Re-assert counters so the document row matches its children.
    ctx.docs.set_chunk_count(doc.uuid, chunk_count as u32).await?;
    ctx.docs.set_entity_count(doc.uuid, canonical_count as u32).await?;

    tracing::info!(
        document = %doc.uuid,
        chunks = chunk_count,
        mentions = mention_count,
        entities = canonical_count,
        relationships = relationship_count,
        "finalizing document"
    );

    Ok(StageReport::with_items(Stage::Finalization, relationship_count))
}
