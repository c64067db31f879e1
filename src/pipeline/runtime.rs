//! Task runtime: the worker pool.
//!
//! Workers pull from their configured queues, verify the per-(document,
//! stage) lock, run the stage under soft/hard time limits, and route the
//! outcome back to the coordinator. A worker that grows past the memory
//! ceiling finishes its task, exits, and is respawned by its supervisor.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::StageError;

use super::outcome::TaskDisposition;
use super::{stages, PipelineCoordinator, QueueName, QueuedTask};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Worker tasks per runtime.
    pub workers: usize,
    /// Queues this pool consumes, in pop order.
    pub queues: Vec<QueueName>,
    /// Soft limit: logged when exceeded, the task keeps running.
    pub soft_time_limit_secs: u64,
    /// Hard limit: the task is abandoned and the stage fails with
    /// `timeout`.
    pub hard_time_limit_secs: u64,
    /// RSS ceiling per worker; exceeded workers exit for respawn.
    pub memory_ceiling_bytes: u64,
    /// Blocking-pop timeout, which doubles as the idle promotion tick.
    pub pop_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queues: QueueName::all_queues(),
            soft_time_limit_secs: 55 * 60,
            hard_time_limit_secs: 65 * 60,
            memory_ceiling_bytes: 512 * 1024 * 1024,
            pop_timeout_secs: 5,
        }
    }
}

pub struct TaskRuntime {
    coordinator: PipelineCoordinator,
    config: RuntimeConfig,
}

impl TaskRuntime {
    pub fn new(coordinator: PipelineCoordinator, config: RuntimeConfig) -> Self {
        Self {
            coordinator,
            config,
        }
    }

    /// Run the worker pool until shutdown is signalled.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        let mut set = tokio::task::JoinSet::new();

        for index in 0..self.config.workers.max(1) {
            let coordinator = self.coordinator.clone();
            let config = self.config.clone();
            let shutdown = shutdown.clone();
            set.spawn(async move {
                Self::supervise(index, coordinator, config, shutdown).await;
            });
        }

        while set.join_next().await.is_some() {}
    }

    /// Respawn loop for one worker slot.
    async fn supervise(
        index: usize,
        coordinator: PipelineCoordinator,
        config: RuntimeConfig,
        shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let worker = Worker {
                id: format!("worker-{}-{}", index, Uuid::new_v4().simple()),
                coordinator: coordinator.clone(),
                config: config.clone(),
            };
            worker.run(shutdown.clone()).await;

            if *shutdown.borrow() {
                break;
            }
            tracing::info!(slot = index, "respawning worker");
        }
    }
}

struct Worker {
    id: String,
    coordinator: PipelineCoordinator,
    config: RuntimeConfig,
}

impl Worker {
    async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let queue = self.coordinator.queue().clone();
        tracing::debug!(worker = %self.id, queues = ?self.config.queues, "worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            for name in &self.config.queues {
                if let Err(e) = queue.promote_due(*name).await {
                    tracing::warn!(worker = %self.id, error = %e, "scheduled-task promotion failed");
                }
            }

            let popped = tokio::select! {
                popped = queue.pop(&self.config.queues, Duration::from_secs(self.config.pop_timeout_secs)) => popped,
                _ = shutdown.changed() => break,
            };

            match popped {
                Ok(Some((from_queue, task))) => self.execute(from_queue, task).await,
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(worker = %self.id, error = %e, "queue pop failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }

            if let Some(rss) = rss_bytes() {
                if rss > self.config.memory_ceiling_bytes {
                    tracing::warn!(
                        worker = %self.id,
                        rss,
                        ceiling = self.config.memory_ceiling_bytes,
                        "memory ceiling exceeded, worker exiting for respawn"
                    );
                    break;
                }
            }
        }
    }

    async fn execute(&self, from_queue: QueueName, task: QueuedTask) {
        let ctx = self.coordinator.context();
        let stage = task.kind.stage();

        // At-most-one-in-flight: the scoped lock decides who works.
        let lock = match ctx
            .state
            .acquire_stage_lock(task.document_uuid, stage, &self.id, stage.lock_ttl())
            .await
        {
            Ok(Some(lock)) => lock,
            Ok(None) => {
                tracing::debug!(
                    worker = %self.id,
                    document = %task.document_uuid,
                    stage = stage.as_str(),
                    "stage lock held elsewhere, refusing duplicate work"
                );
                if let Err(e) = ctx.metrics.record(stage, "lock_contention").await {
                    tracing::warn!(error = %e, "metrics write failed");
                }
                return;
            }
            Err(e) => {
                tracing::warn!(worker = %self.id, error = %e, "lock acquisition failed, requeueing task");
                let _ = self
                    .coordinator
                    .queue()
                    .push_delayed(from_queue, &task, Duration::from_secs(5))
                    .await;
                return;
            }
        };

        if let Err(e) = ctx.tasks.mark_started(task.task_id).await {
            tracing::warn!(task = %task.task_id, error = %e, "failed to mark task started");
        }
        if let Err(e) = ctx
            .state
            .record_stage_state(task.document_uuid, stage, "in_progress", None)
            .await
        {
            tracing::warn!(error = %e, "doc state write failed");
        }

        let disposition = self.run_with_limits(&task).await;

        match disposition {
            TaskDisposition::Completed(report) => {
                if let Err(e) = self.coordinator.on_stage_completed(&task, &report).await {
                    tracing::error!(task = %task.task_id, error = %e, "completion handling failed");
                }
            }
            TaskDisposition::Reschedule { task: next, delay } => {
                let queue_name = QueueName::for_stage(stage);
                if let Err(e) = self
                    .coordinator
                    .queue()
                    .push_delayed(queue_name, &next, delay)
                    .await
                {
                    tracing::error!(task = %next.task_id, error = %e, "reschedule failed");
                }
            }
            TaskDisposition::Failed(error) => {
                if let Err(e) = self.coordinator.on_stage_failed(&task, &error).await {
                    tracing::error!(task = %task.task_id, error = %e, "failure handling failed");
                }
            }
            TaskDisposition::Cancelled => {
                if let Err(e) = self.coordinator.on_stage_cancelled(&task).await {
                    tracing::error!(task = %task.task_id, error = %e, "cancellation handling failed");
                }
            }
        }

        // Lock release on every exit path; the TTL covers worker death.
        if let Err(e) = lock.release().await {
            tracing::warn!(error = %e, "lock release failed, TTL will reclaim");
        }
    }

    async fn run_with_limits(&self, task: &QueuedTask) -> TaskDisposition {
        let ctx = self.coordinator.context();
        let soft = Duration::from_secs(self.config.soft_time_limit_secs);
        let hard = Duration::from_secs(self.config.hard_time_limit_secs);

        let fut = stages::run_task(task, ctx);
        tokio::pin!(fut);

        tokio::select! {
            disposition = &mut fut => disposition,
            _ = tokio::time::sleep(soft) => {
                tracing::warn!(
                    task = %task.task_id,
                    soft_secs = soft.as_secs(),
                    "soft time limit exceeded"
                );
                match tokio::time::timeout(hard.saturating_sub(soft), &mut fut).await {
                    Ok(disposition) => disposition,
                    Err(_) => TaskDisposition::Failed(StageError::transient(format!(
                        "timeout: hard limit of {}s exceeded",
                        hard.as_secs()
                    ))),
                }
            }
        }
    }
}

/// Resident set size of this process, where the platform exposes it.
fn rss_bytes() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        Some(resident_pages * 4096)
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}
