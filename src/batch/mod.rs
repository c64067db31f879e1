//! Batch orchestration: manifest, fan-out, progress, recovery.
//!
//! A batch is a group of documents processed independently; its state is
//! always recomputed from per-document state, never stored as truth.

mod warmer;

pub use warmer::{CacheWarmer, WarmStats};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::config::BatchConfig;
use crate::context::CoreContext;
use crate::models::{
    Batch, BatchOptions, BatchPriority, BatchProgress, BatchSubmission, DocumentFailure,
    DocumentStatus, RecoveryPlan, RetryStrategy,
};
use crate::pipeline::{
    IntakeRequest, PipelineCoordinator, PipelineError, QueueName, SubmitOptions, TaskKind,
};

/// A batch submission request.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub documents: Vec<IntakeRequest>,
    pub project_uuid: Uuid,
    pub priority: BatchPriority,
    pub options: BatchOptions,
}

pub struct BatchOrchestrator {
    ctx: Arc<CoreContext>,
    coordinator: PipelineCoordinator,
    warmer: CacheWarmer,
}

impl BatchOrchestrator {
    pub fn new(coordinator: PipelineCoordinator) -> Self {
        let ctx = coordinator.context().clone();
        let warmer = CacheWarmer::new(ctx.clone());
        Self {
            ctx,
            coordinator,
            warmer,
        }
    }

    fn config(&self) -> &BatchConfig {
        &self.ctx.settings.batch
    }

    // ========================================================================
    // Submit
    // ========================================================================

    /// Submit a batch: write the manifest, fan documents onto the priority
    /// queue, and optionally warm the cache.
    pub async fn submit(&self, request: BatchRequest) -> Result<BatchSubmission, PipelineError> {
        let batch_id = Uuid::new_v4();
        let queue_name = QueueName::for_priority(request.priority);

        self.apply_backpressure(queue_name).await;

        let batch = Batch {
            batch_id,
            project_uuid: request.project_uuid,
            priority: request.priority,
            document_uuids: request
                .documents
                .iter()
                .map(|d| d.document_uuid)
                .collect(),
            options: request.options.clone(),
            submitted_at: Utc::now(),
        };
        self.ctx.state.put_batch_manifest(&batch).await?;

        // Cache warming: synchronous for high priority, spawned otherwise.
        // High priority warms regardless of batch size; other priorities
        // only past the size threshold. Low-priority batches skip the
        // warm entirely when the queue is saturated.
        let big_enough = batch.document_uuids.len() >= self.config().warm_cache_min_documents
            || request.priority == BatchPriority::High;
        let warm = request.options.warm_cache
            && big_enough
            && !(request.priority == BatchPriority::Low && self.saturated(queue_name).await);
        if warm {
            if request.priority == BatchPriority::High {
                if let Err(e) = self.warmer.warm(&batch).await {
                    tracing::warn!(batch = %batch_id, error = %e, "cache warm failed");
                }
            } else {
                let warmer = self.warmer.clone();
                let spawned = batch.clone();
                tokio::spawn(async move {
                    if let Err(e) = warmer.warm(&spawned).await {
                        tracing::warn!(batch = %spawned.batch_id, error = %e, "cache warm failed");
                    }
                });
            }
        }

        let mut task_ids = Vec::with_capacity(request.documents.len());
        for doc_request in &request.documents {
            let options = SubmitOptions {
                queue: queue_name,
                priority: request.priority,
                batch_id: Some(batch_id),
                max_retries: request.options.max_retries,
                entity_resolution: request.options.entity_resolution,
            };
            let task_id = self
                .coordinator
                .submit_document_with(doc_request.clone(), options)
                .await?;
            task_ids.push(task_id);
        }

        self.ctx.state.put_batch_tasks(batch_id, &task_ids).await?;

        let progress = self.compute_progress(&batch).await?;
        self.ctx.state.put_batch_progress(&progress).await?;

        tracing::info!(
            batch = %batch_id,
            documents = task_ids.len(),
            priority = request.priority.as_str(),
            "batch submitted"
        );

        Ok(BatchSubmission {
            batch_id,
            task_id: task_ids.first().copied().unwrap_or(batch_id),
            document_task_ids: task_ids,
        })
    }

    /// Wait (bounded) while the target queue is over the depth threshold.
    async fn apply_backpressure(&self, queue: QueueName) {
        let deadline = Utc::now()
            + chrono::Duration::seconds(self.config().backpressure_max_wait_secs as i64);

        while self.saturated(queue).await {
            if Utc::now() >= deadline {
                tracing::warn!(
                    queue = queue.as_str(),
                    "backpressure wait exhausted, enqueueing anyway"
                );
                break;
            }
            tracing::info!(queue = queue.as_str(), "queue saturated, delaying batch enqueue");
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    async fn saturated(&self, queue: QueueName) -> bool {
        match self.coordinator.queue().depth(queue).await {
            Ok(depth) => depth > self.config().backpressure_depth,
            Err(e) => {
                tracing::warn!(error = %e, "queue depth check failed");
                false
            }
        }
    }

    // ========================================================================
    // Monitor
    // ========================================================================

    /// Recompute and store the progress aggregate for a batch.
    pub async fn monitor(&self, batch_id: Uuid) -> Result<BatchProgress, PipelineError> {
        let batch = self
            .ctx
            .state
            .get_batch_manifest(batch_id)
            .await?
            .ok_or(PipelineError::UnknownBatch(batch_id))?;

        let progress = self.compute_progress(&batch).await?;
        self.ctx.state.put_batch_progress(&progress).await?;
        Ok(progress)
    }

    /// Progress comes from scanning `doc:status:{uuid}` in the state
    /// store; the persistent store fills in expired entries and the error
    /// detail for failed documents.
    async fn compute_progress(&self, batch: &Batch) -> Result<BatchProgress, PipelineError> {
        let mut views = Vec::with_capacity(batch.document_uuids.len());
        let mut missing = Vec::new();

        for &document_uuid in &batch.document_uuids {
            match self.ctx.state.get_doc_status(document_uuid).await? {
                Some(summary) => views.push(DocView {
                    uuid: document_uuid,
                    status: DocumentStatus::from_str(&summary.overall_status)
                        .unwrap_or(DocumentStatus::Pending),
                    stage: summary.current_stage,
                    error: None,
                }),
                None => missing.push(document_uuid),
            }
        }

        if !missing.is_empty() {
            for doc in self.ctx.docs.get_many(&missing).await? {
                views.push(DocView {
                    uuid: doc.uuid,
                    status: doc.status,
                    stage: doc.current_stage.map(|s| s.as_str().to_string()),
                    error: doc.error,
                });
            }
        }

        // Failure detail lives on the document row.
        let failed_ids: Vec<Uuid> = views
            .iter()
            .filter(|v| v.status == DocumentStatus::Failed && v.error.is_none())
            .map(|v| v.uuid)
            .collect();
        if !failed_ids.is_empty() {
            for doc in self.ctx.docs.get_many(&failed_ids).await? {
                if let Some(view) = views.iter_mut().find(|v| v.uuid == doc.uuid) {
                    view.error = doc.error;
                    if view.stage.is_none() {
                        view.stage = doc.current_stage.map(|s| s.as_str().to_string());
                    }
                }
            }
        }

        let elapsed_secs = (Utc::now() - batch.submitted_at).num_seconds().max(0) as u64;
        Ok(aggregate_progress(batch, &views, elapsed_secs))
    }

    // ========================================================================
    // Recover
    // ========================================================================

    /// Build a recovery plan for a batch's failed documents.
    pub async fn plan_recovery(&self, batch_id: Uuid) -> Result<RecoveryPlan, PipelineError> {
        let batch = self
            .ctx
            .state
            .get_batch_manifest(batch_id)
            .await?
            .ok_or(PipelineError::UnknownBatch(batch_id))?;

        let documents = self.ctx.docs.get_many(&batch.document_uuids).await?;
        let failed: Vec<Uuid> = documents
            .iter()
            .filter(|d| d.status == DocumentStatus::Failed)
            .map(|d| d.uuid)
            .collect();

        let retry_count = self.ctx.state.get_batch_retry(batch_id).await? as u32;
        let plan = plan_recovery(
            batch_id,
            batch.document_uuids.len(),
            failed,
            retry_count,
            batch.options.max_retries,
            self.config().recovery_delay_secs,
        );

        tracing::info!(
            batch = %batch_id,
            strategy = plan.retry_strategy.as_str(),
            failed = plan.failed_documents.len(),
            "recovery plan built"
        );
        Ok(plan)
    }

    /// Execute a recovery plan: re-enqueue only the failed documents with
    /// the batch retry counter incremented. Manual plans re-enqueue
    /// nothing.
    pub async fn execute_recovery(&self, plan: &RecoveryPlan) -> Result<usize, PipelineError> {
        if plan.retry_strategy == RetryStrategy::Manual || plan.failed_documents.is_empty() {
            return Ok(0);
        }

        let batch = self
            .ctx
            .state
            .get_batch_manifest(plan.batch_id)
            .await?
            .ok_or(PipelineError::UnknownBatch(plan.batch_id))?;

        self.ctx.state.incr_batch_retry(plan.batch_id).await?;

        let delay = match plan.retry_strategy {
            RetryStrategy::Delayed => Duration::from_secs(plan.delay_secs),
            _ => Duration::ZERO,
        };
        let queue_name = QueueName::for_priority(batch.priority);

        let mut requeued = 0usize;
        for &document_uuid in &plan.failed_documents {
            // Clear the terminal status so the chain can re-enter; the
            // completed stages short-circuit through their idempotency
            // checks.
            self.ctx
                .docs
                .update_status(document_uuid, DocumentStatus::Pending, None)
                .await?;
            self.ctx
                .state
                .set_doc_status(document_uuid, "pending", None, &[])
                .await?;

            let options = SubmitOptions {
                queue: queue_name,
                priority: batch.priority,
                batch_id: Some(plan.batch_id),
                max_retries: batch.options.max_retries,
                entity_resolution: batch.options.entity_resolution,
            };
            let task = self
                .coordinator
                .create_task_for_recovery(document_uuid, TaskKind::OcrSubmit, &options)
                .await?;

            if delay.is_zero() {
                self.coordinator.queue().push(queue_name, &task).await?;
            } else {
                self.coordinator
                    .queue()
                    .push_delayed(queue_name, &task, delay)
                    .await?;
            }
            requeued += 1;
        }

        tracing::info!(
            batch = %plan.batch_id,
            requeued,
            strategy = plan.retry_strategy.as_str(),
            delay_secs = delay.as_secs(),
            "recovery executed"
        );
        Ok(requeued)
    }
}

/// Per-document view assembled from the state store (with persistent
/// store fallback) before aggregation.
#[derive(Debug, Clone)]
struct DocView {
    uuid: Uuid,
    status: DocumentStatus,
    stage: Option<String>,
    error: Option<String>,
}

/// Pure progress aggregation from per-document views.
fn aggregate_progress(batch: &Batch, documents: &[DocView], elapsed_secs: u64) -> BatchProgress {
    let total = batch.document_uuids.len();
    let mut by_stage: BTreeMap<String, usize> = BTreeMap::new();
    let mut completed = 0;
    let mut failed = 0;
    let mut cancelled = 0;
    let mut in_progress = 0;
    let mut pending = 0;
    let mut failures = Vec::new();

    for doc in documents {
        let stage = doc.stage.as_deref().unwrap_or("intake");
        *by_stage
            .entry(format!("{}:{}", stage, doc.status.as_str()))
            .or_insert(0) += 1;

        match doc.status {
            DocumentStatus::Completed => completed += 1,
            DocumentStatus::Failed => {
                failed += 1;
                let (kind, message) = split_error(doc.error.as_deref());
                failures.push(DocumentFailure {
                    document_uuid: doc.uuid,
                    error_kind: kind,
                    error_message: message,
                    failed_stage: doc.stage.clone(),
                });
            }
            DocumentStatus::Cancelled => cancelled += 1,
            DocumentStatus::InProgress => in_progress += 1,
            DocumentStatus::Pending => pending += 1,
        }
    }

    // Documents with no recorded state yet count as pending.
    pending += total.saturating_sub(documents.len());

    let percent_complete = if total == 0 {
        100.0
    } else {
        completed as f64 * 100.0 / total as f64
    };

    let remaining = total.saturating_sub(completed + failed + cancelled);
    let eta_secs = if completed > 0 && remaining > 0 {
        Some(elapsed_secs * remaining as u64 / completed as u64)
    } else {
        None
    };

    BatchProgress {
        batch_id: batch.batch_id,
        total,
        completed,
        failed,
        cancelled,
        in_progress,
        pending,
        by_stage,
        percent_complete,
        elapsed_secs,
        eta_secs,
        failures,
    }
}

/// Structured error text is stored as `kind: message`.
fn split_error(error: Option<&str>) -> (Option<String>, Option<String>) {
    match error {
        None => (None, None),
        Some(text) => match text.split_once(": ") {
            Some((kind, message)) if crate::error::ErrorKind::from_str(kind).is_some() => {
                (Some(kind.to_string()), Some(message.to_string()))
            }
            _ => (None, Some(text.to_string())),
        },
    }
}

/// Pure recovery strategy decision.
fn plan_recovery(
    batch_id: Uuid,
    total: usize,
    failed_documents: Vec<Uuid>,
    retry_count: u32,
    max_retries: u32,
    delay_secs: u64,
) -> RecoveryPlan {
    let failure_rate = if total == 0 {
        0.0
    } else {
        failed_documents.len() as f64 / total as f64
    };

    let retry_strategy = if retry_count >= max_retries {
        RetryStrategy::Manual
    } else if failure_rate > 0.5 {
        RetryStrategy::Delayed
    } else {
        RetryStrategy::Immediate
    };

    RecoveryPlan {
        batch_id,
        retry_strategy,
        failed_documents,
        failure_rate,
        retry_count: retry_count + 1,
        delay_secs: match retry_strategy {
            RetryStrategy::Delayed => delay_secs.max(600),
            _ => 0,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch_of(total: usize) -> Batch {
        Batch {
            batch_id: Uuid::new_v4(),
            project_uuid: Uuid::new_v4(),
            priority: BatchPriority::Normal,
            document_uuids: (0..total).map(|_| Uuid::new_v4()).collect(),
            options: BatchOptions::default(),
            submitted_at: Utc::now(),
        }
    }

    fn doc_with_status(uuid: Uuid, status: DocumentStatus) -> DocView {
        DocView {
            uuid,
            status,
            stage: None,
            error: None,
        }
    }

    #[test]
    fn test_recovery_strategy_rules() {
        let failed: Vec<Uuid> = (0..6).map(|_| Uuid::new_v4()).collect();

        // 6/10 failed -> delayed with at least ten minutes.
        let plan = plan_recovery(Uuid::new_v4(), 10, failed.clone(), 0, 3, 600);
        assert_eq!(plan.retry_strategy, RetryStrategy::Delayed);
        assert!(plan.delay_secs >= 600);
        assert_eq!(plan.retry_count, 1);

        // 3/10 failed -> immediate.
        let plan = plan_recovery(Uuid::new_v4(), 10, failed[..3].to_vec(), 0, 3, 600);
        assert_eq!(plan.retry_strategy, RetryStrategy::Immediate);
        assert_eq!(plan.delay_secs, 0);

        // Exactly 50% -> immediate (delayed requires strictly more).
        let plan = plan_recovery(Uuid::new_v4(), 10, failed[..5].to_vec(), 0, 3, 600);
        assert_eq!(plan.retry_strategy, RetryStrategy::Immediate);

        // Retry budget exhausted -> manual.
        let plan = plan_recovery(Uuid::new_v4(), 10, failed, 3, 3, 600);
        assert_eq!(plan.retry_strategy, RetryStrategy::Manual);
    }

    #[test]
    fn test_progress_aggregation() {
        let batch = batch_of(4);
        let docs = vec![
            doc_with_status(batch.document_uuids[0], DocumentStatus::Completed),
            doc_with_status(batch.document_uuids[1], DocumentStatus::Completed),
            {
                let mut d = doc_with_status(batch.document_uuids[2], DocumentStatus::Failed);
                d.error = Some("transient: network blip".to_string());
                d.stage = Some("ocr".to_string());
                d
            },
            doc_with_status(batch.document_uuids[3], DocumentStatus::InProgress),
        ];

        let progress = aggregate_progress(&batch, &docs, 100);
        assert_eq!(progress.total, 4);
        assert_eq!(progress.completed, 2);
        assert_eq!(progress.failed, 1);
        assert_eq!(progress.in_progress, 1);
        assert!((progress.percent_complete - 50.0).abs() < 1e-9);

        // ETA: 100s elapsed / 2 completed * 1 remaining (the in-progress doc).
        assert_eq!(progress.eta_secs, Some(50));

        assert_eq!(progress.failures.len(), 1);
        assert_eq!(progress.failures[0].error_kind.as_deref(), Some("transient"));
        assert_eq!(
            progress.failures[0].error_message.as_deref(),
            Some("network blip")
        );
        assert_eq!(progress.failures[0].failed_stage.as_deref(), Some("ocr"));
        assert_eq!(progress.overall_status(), "in_progress");
    }

    #[test]
    fn test_progress_counts_missing_docs_as_pending() {
        let batch = batch_of(3);
        let docs = vec![doc_with_status(
            batch.document_uuids[0],
            DocumentStatus::Completed,
        )];

        let progress = aggregate_progress(&batch, &docs, 10);
        assert_eq!(progress.pending, 2);
        assert_eq!(progress.completed, 1);
    }

    #[test]
    fn test_split_error() {
        assert_eq!(
            split_error(Some("rate_limit: provider throttled")),
            (
                Some("rate_limit".to_string()),
                Some("provider throttled".to_string())
            )
        );
        assert_eq!(
            split_error(Some("unstructured failure text")),
            (None, Some("unstructured failure text".to_string()))
        );
        assert_eq!(split_error(None), (None, None));
    }
}
