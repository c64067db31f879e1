//! Pipeline coordinator: owns the six-stage state machine.
//!
//! The coordinator is event-driven. Inbound events are stage completion,
//! stage failure, and cancellation; outbound effects are queue pushes and
//! status writes. Stage executors never call the coordinator directly —
//! the runtime routes their outcomes here.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use uuid::Uuid;

use crate::context::CoreContext;
use crate::error::StageError;
use crate::models::{
    BatchPriority, Document, DocumentStatus, ProcessingTask, Stage, TaskStatus,
};

use super::outcome::StageReport;
use super::{PipelineError, QueueName, QueuedTask, TaskKind, TaskQueue};

/// One document entering the pipeline.
#[derive(Debug, Clone)]
pub struct IntakeRequest {
    pub document_uuid: Uuid,
    pub blob_location: String,
    pub project_uuid: Uuid,
    pub original_filename: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// How a submission is scheduled.
#[derive(Debug, Clone)]
pub struct SubmitOptions {
    pub queue: QueueName,
    pub priority: BatchPriority,
    pub batch_id: Option<Uuid>,
    pub max_retries: u32,
    pub entity_resolution: bool,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            queue: QueueName::Ocr,
            priority: BatchPriority::Normal,
            batch_id: None,
            max_retries: 3,
            entity_resolution: true,
        }
    }
}

#[derive(Clone)]
pub struct PipelineCoordinator {
    ctx: Arc<CoreContext>,
    queue: TaskQueue,
}

impl PipelineCoordinator {
    pub fn new(ctx: Arc<CoreContext>) -> Self {
        let queue = TaskQueue::new(&ctx.state);
        Self { ctx, queue }
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn context(&self) -> &Arc<CoreContext> {
        &self.ctx
    }

    // ========================================================================
    // Intake
    // ========================================================================

    /// Submit one document, idempotent on its UUID. Returns the task id of
    /// the first-stage attempt (the existing one on re-submission).
    pub async fn submit_document(&self, request: IntakeRequest) -> Result<Uuid, PipelineError> {
        let mut options = SubmitOptions::default();
        options.max_retries = self.ctx.settings.retry.max_retries;
        self.submit_document_with(request, options).await
    }

    /// Submit with explicit scheduling options (used by the batch
    /// orchestrator for priority fan-out).
    pub async fn submit_document_with(
        &self,
        request: IntakeRequest,
        options: SubmitOptions,
    ) -> Result<Uuid, PipelineError> {
        // Idempotency: an open task for this document wins.
        if let Some(open) = self
            .ctx
            .tasks
            .get_open_for_document(request.document_uuid)
            .await?
        {
            tracing::info!(
                document = %request.document_uuid,
                task = %open.id,
                "document already has an open task, returning it"
            );
            return Ok(open.id);
        }

        let mut doc = Document::new(
            request.document_uuid,
            request.project_uuid,
            request.blob_location.clone(),
        );
        doc.original_filename = request.original_filename.clone();
        if let Some(metadata) = request.metadata.clone() {
            doc.metadata = metadata;
        }

        let created = self.ctx.docs.create_if_absent(&doc).await?;
        if created {
            self.record_content_info(&doc).await;
        }

        // A re-submitted document may carry a stale cancel flag.
        self.ctx.state.clear_cancel(doc.uuid).await?;
        self.ctx
            .state
            .set_doc_status(doc.uuid, "pending", None, &[])
            .await?;

        let task = self
            .create_task(doc.uuid, TaskKind::OcrSubmit, 0, &options)
            .await?;
        self.queue.push(options.queue, &task).await?;

        tracing::info!(document = %doc.uuid, task = %task.task_id, "document submitted");
        Ok(task.task_id)
    }

    /// Best-effort intake enrichment: content hash, size, sniffed MIME.
    async fn record_content_info(&self, doc: &Document) {
        let reference = match crate::blob::BlobRef::parse(&doc.blob_location) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(document = %doc.uuid, error = %e, "unparseable blob location at intake");
                return;
            }
        };

        match self.ctx.blobs.get(&reference).await {
            Ok(bytes) => {
                let hash = Document::compute_hash(&bytes);
                let mime = infer::get(&bytes).map(|t| t.mime_type());
                if let Err(e) = self
                    .ctx
                    .docs
                    .set_content_info(doc.uuid, &hash, bytes.len() as u64, mime)
                    .await
                {
                    tracing::warn!(document = %doc.uuid, error = %e, "failed to record content info");
                }
            }
            Err(e) => {
                tracing::debug!(document = %doc.uuid, error = %e, "content info skipped, blob not readable at intake");
            }
        }
    }

    /// Create the `processing_tasks` row and its queue payload.
    async fn create_task(
        &self,
        document_uuid: Uuid,
        kind: TaskKind,
        retry_count: u32,
        options: &SubmitOptions,
    ) -> Result<QueuedTask, PipelineError> {
        let record = ProcessingTask::new(document_uuid, kind.stage(), retry_count);
        self.ctx.tasks.create(&record).await?;

        Ok(QueuedTask {
            task_id: record.id,
            document_uuid,
            kind,
            priority: options.priority.task_priority(),
            retry_count,
            max_retries: options.max_retries,
            batch_id: options.batch_id,
            entity_resolution: options.entity_resolution,
        })
    }

    /// Create a fresh first-stage task for a recovery re-enqueue.
    pub async fn create_task_for_recovery(
        &self,
        document_uuid: Uuid,
        kind: TaskKind,
        options: &SubmitOptions,
    ) -> Result<QueuedTask, PipelineError> {
        self.create_task(document_uuid, kind, 0, options).await
    }

    // ========================================================================
    // Inbound events
    // ========================================================================

    /// A stage finished; persist the transition and enqueue the successor.
    pub async fn on_stage_completed(
        &self,
        task: &QueuedTask,
        report: &StageReport,
    ) -> Result<(), PipelineError> {
        let stage = task.kind.stage();

        self.ctx
            .tasks
            .mark_finished(task.task_id, TaskStatus::Completed, None)
            .await?;
        self.ctx
            .state
            .record_stage_state(task.document_uuid, stage, "completed", None)
            .await?;
        if let Err(e) = self.ctx.metrics.record(stage, "completed").await {
            tracing::warn!(error = %e, "metrics write failed");
        }

        let completed: Vec<Stage> = Stage::ALL[..=stage.index()].to_vec();

        match self.next_stage(task, stage) {
            Some(next) => {
                self.ctx
                    .state
                    .set_doc_status(task.document_uuid, "in_progress", Some(next), &completed)
                    .await?;

                let options = SubmitOptions {
                    queue: QueueName::for_stage(next),
                    priority: priority_of(task),
                    batch_id: task.batch_id,
                    max_retries: task.max_retries,
                    entity_resolution: task.entity_resolution,
                };
                let next_task = self
                    .create_task(task.document_uuid, TaskKind::for_stage(next), 0, &options)
                    .await?;
                self.ctx.docs.set_current_stage(task.document_uuid, next).await?;
                self.queue.push(options.queue, &next_task).await?;

                tracing::info!(
                    document = %task.document_uuid,
                    from = stage.as_str(),
                    to = next.as_str(),
                    items = report.items_written,
                    "stage transition"
                );
            }
            None => {
                self.ctx
                    .docs
                    .update_status(task.document_uuid, DocumentStatus::Completed, None)
                    .await?;
                self.ctx
                    .state
                    .set_doc_status(task.document_uuid, "completed", None, &completed)
                    .await?;
                tracing::info!(document = %task.document_uuid, "document completed");
            }
        }

        Ok(())
    }

    /// Successor stage, honoring the per-batch entity resolution switch.
    fn next_stage(&self, task: &QueuedTask, stage: Stage) -> Option<Stage> {
        if !task.entity_resolution && stage == Stage::EntityExtraction {
            return Some(Stage::Finalization);
        }
        stage.next()
    }

    /// A stage failed; retry with a category-driven backoff or mark the
    /// document failed.
    pub async fn on_stage_failed(
        &self,
        task: &QueuedTask,
        error: &StageError,
    ) -> Result<(), PipelineError> {
        let stage = task.kind.stage();
        let message = error.to_string();

        self.ctx
            .tasks
            .mark_finished(task.task_id, TaskStatus::Failed, Some(error.message.as_str()))
            .await?;
        self.ctx
            .state
            .record_stage_state(task.document_uuid, stage, "failed", Some(message.as_str()))
            .await?;
        if let Err(e) = self.ctx.metrics.record(stage, "failed").await {
            tracing::warn!(error = %e, "metrics write failed");
        }
        if let Err(e) = self
            .ctx
            .metrics
            .record_error(error.kind, stage, task.document_uuid)
            .await
        {
            tracing::warn!(error = %e, "error log write failed");
        }

        let retryable = error.is_retryable() && task.retry_count < task.max_retries;
        if retryable {
            let base = error
                .kind
                .retry_delay(task.retry_count)
                .unwrap_or(Duration::from_secs(30));
            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..2000));
            let delay = base + jitter;

            let options = SubmitOptions {
                queue: QueueName::for_stage(stage),
                priority: priority_of(task),
                batch_id: task.batch_id,
                max_retries: task.max_retries,
                entity_resolution: task.entity_resolution,
            };
            // Retries restart the stage from its entry task so a failed
            // poll re-submits rather than polling a dead job.
            let retry = self
                .create_task(
                    task.document_uuid,
                    TaskKind::for_stage(stage),
                    task.retry_count + 1,
                    &options,
                )
                .await?;
            self.queue.push_delayed(options.queue, &retry, delay).await?;
            if let Err(e) = self.ctx.metrics.record(stage, "retried").await {
                tracing::warn!(error = %e, "metrics write failed");
            }

            tracing::warn!(
                document = %task.document_uuid,
                stage = stage.as_str(),
                retry = task.retry_count + 1,
                delay_secs = delay.as_secs(),
                error = %message,
                "stage failed, retry scheduled"
            );
        } else {
            // Record the failing stage before the terminal status so the
            // batch monitor can report where the document died.
            self.ctx
                .docs
                .set_current_stage(task.document_uuid, stage)
                .await?;
            self.ctx
                .docs
                .update_status(task.document_uuid, DocumentStatus::Failed, Some(message.as_str()))
                .await?;
            self.ctx
                .state
                .set_doc_status(
                    task.document_uuid,
                    "failed",
                    Some(stage),
                    &Stage::ALL[..stage.index()].to_vec(),
                )
                .await?;

            tracing::error!(
                document = %task.document_uuid,
                stage = stage.as_str(),
                error = %message,
                "document failed"
            );
        }

        Ok(())
    }

    /// A task observed the cancel flag and stopped.
    pub async fn on_stage_cancelled(&self, task: &QueuedTask) -> Result<(), PipelineError> {
        let stage = task.kind.stage();

        self.ctx
            .tasks
            .mark_finished(task.task_id, TaskStatus::Cancelled, None)
            .await?;
        self.ctx
            .docs
            .update_status(task.document_uuid, DocumentStatus::Cancelled, None)
            .await?;
        self.ctx
            .state
            .record_stage_state(task.document_uuid, stage, "cancelled", None)
            .await?;
        self.ctx
            .state
            .set_doc_status(task.document_uuid, "cancelled", Some(stage), &[])
            .await?;
        if let Err(e) = self.ctx.metrics.record(stage, "cancelled").await {
            tracing::warn!(error = %e, "metrics write failed");
        }

        tracing::info!(document = %task.document_uuid, stage = stage.as_str(), "task cancelled");
        Ok(())
    }

    /// Request cancellation of a document's in-flight work.
    ///
    /// The flag is cooperative: the runtime refuses queued tasks for the
    /// document and in-flight stages stop at their next check. An
    /// outstanding OCR job is cancelled at the provider.
    pub async fn cancel_document(&self, document_uuid: Uuid) -> Result<(), PipelineError> {
        self.ctx.state.request_cancel(document_uuid).await?;

        if let Some(job) = self.ctx.tasks.get_ocr_job_for_document(document_uuid).await? {
            let handle = match self.ctx.state.get_ocr_job_handle(&job.job_id).await? {
                Some(json) => serde_json::from_str(&json)
                    .unwrap_or_else(|_| crate::ocr::JobHandle::whole(job.job_id.clone())),
                None => crate::ocr::JobHandle::whole(job.job_id.clone()),
            };
            self.ctx.ocr.cancel(&handle).await;
        }

        tracing::info!(document = %document_uuid, "cancellation requested");
        Ok(())
    }
}

fn priority_of(task: &QueuedTask) -> BatchPriority {
    match task.priority {
        p if p >= BatchPriority::High.task_priority() => BatchPriority::High,
        p if p >= BatchPriority::Normal.task_priority() => BatchPriority::Normal,
        _ => BatchPriority::Low,
    }
}
