//! Pipeline core: the six-stage state machine, task queues, and the
//! worker runtime that drives them.

pub mod coordinator;
pub mod outcome;
pub mod queue;
pub mod runtime;
pub mod stages;

pub use coordinator::{IntakeRequest, PipelineCoordinator, SubmitOptions};
pub use outcome::{StageOutcome, StageReport, TaskDisposition};
pub use queue::TaskQueue;
pub use runtime::{RuntimeConfig, TaskRuntime};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::StageError;
use crate::models::{BatchPriority, Stage};
use crate::repository::DieselError;
use crate::state::StateError;

/// Errors raised by coordination and orchestration paths.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("database error: {0}")]
    Database(#[from] DieselError),
    #[error("state store error: {0}")]
    State(#[from] StateError),
    #[error("{0}")]
    Stage(#[from] StageError),
    #[error("unknown batch: {0}")]
    UnknownBatch(Uuid),
    #[error("unknown document: {0}")]
    UnknownDocument(Uuid),
}

/// Named task queues consumed by the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    Default,
    Ocr,
    Text,
    Entity,
    Graph,
    Cleanup,
    #[serde(rename = "batch.high")]
    BatchHigh,
    #[serde(rename = "batch.normal")]
    BatchNormal,
    #[serde(rename = "batch.low")]
    BatchLow,
}

impl QueueName {
    pub const ALL: [QueueName; 9] = [
        QueueName::Default,
        QueueName::Ocr,
        QueueName::Text,
        QueueName::Entity,
        QueueName::Graph,
        QueueName::Cleanup,
        QueueName::BatchHigh,
        QueueName::BatchNormal,
        QueueName::BatchLow,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Ocr => "ocr",
            Self::Text => "text",
            Self::Entity => "entity",
            Self::Graph => "graph",
            Self::Cleanup => "cleanup",
            Self::BatchHigh => "batch.high",
            Self::BatchNormal => "batch.normal",
            Self::BatchLow => "batch.low",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|q| q.as_str() == s)
    }

    /// Queue that fields a stage's chained tasks.
    pub fn for_stage(stage: Stage) -> Self {
        match stage {
            Stage::Ocr => Self::Ocr,
            Stage::Chunking => Self::Text,
            Stage::EntityExtraction | Stage::EntityResolution => Self::Entity,
            Stage::RelationshipBuilding => Self::Graph,
            Stage::Finalization => Self::Cleanup,
        }
    }

    /// Queue that fields a batch's initial fan-out.
    pub fn for_priority(priority: BatchPriority) -> Self {
        match priority {
            BatchPriority::High => Self::BatchHigh,
            BatchPriority::Normal => Self::BatchNormal,
            BatchPriority::Low => Self::BatchLow,
        }
    }

    /// Queues a priority-dedicated worker consumes, in pop order: high
    /// workers pull only high, normal workers drain low when idle, low
    /// workers pull only low.
    pub fn for_priority_worker(priority: BatchPriority) -> Vec<QueueName> {
        match priority {
            BatchPriority::High => vec![Self::BatchHigh],
            BatchPriority::Normal => vec![Self::BatchNormal, Self::BatchLow],
            BatchPriority::Low => vec![Self::BatchLow],
        }
    }

    /// Every stage queue plus the batch intake queues, the default worker
    /// profile.
    pub fn all_queues() -> Vec<QueueName> {
        Self::ALL.to_vec()
    }
}

/// What a queued task executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Stage 1a: start the provider job.
    OcrSubmit,
    /// Stage 1b: check the provider job; reschedules itself.
    OcrPoll,
    Chunking,
    EntityExtraction,
    EntityResolution,
    RelationshipBuilding,
    Finalization,
}

impl TaskKind {
    pub fn stage(&self) -> Stage {
        match self {
            Self::OcrSubmit | Self::OcrPoll => Stage::Ocr,
            Self::Chunking => Stage::Chunking,
            Self::EntityExtraction => Stage::EntityExtraction,
            Self::EntityResolution => Stage::EntityResolution,
            Self::RelationshipBuilding => Stage::RelationshipBuilding,
            Self::Finalization => Stage::Finalization,
        }
    }

    /// Task kind that runs a given stage from scratch.
    pub fn for_stage(stage: Stage) -> Self {
        match stage {
            Stage::Ocr => Self::OcrSubmit,
            Stage::Chunking => Self::Chunking,
            Stage::EntityExtraction => Self::EntityExtraction,
            Stage::EntityResolution => Self::EntityResolution,
            Stage::RelationshipBuilding => Self::RelationshipBuilding,
            Stage::Finalization => Self::Finalization,
        }
    }
}

/// One schedulable unit: a stage attempt for a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedTask {
    /// Matches the `processing_tasks` row for this attempt.
    pub task_id: Uuid,
    pub document_uuid: Uuid,
    pub kind: TaskKind,
    /// Higher preempts queue ordering within a queue.
    pub priority: u8,
    pub retry_count: u32,
    pub max_retries: u32,
    pub batch_id: Option<Uuid>,
    /// Whether stage 4 runs for this document's chain.
    pub entity_resolution: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_names() {
        assert_eq!(QueueName::BatchHigh.as_str(), "batch.high");
        assert_eq!(QueueName::from_str("batch.low"), Some(QueueName::BatchLow));
        assert_eq!(QueueName::from_str("nope"), None);
    }

    #[test]
    fn test_stage_to_queue_mapping() {
        assert_eq!(QueueName::for_stage(Stage::Ocr), QueueName::Ocr);
        assert_eq!(QueueName::for_stage(Stage::Chunking), QueueName::Text);
        assert_eq!(QueueName::for_stage(Stage::EntityResolution), QueueName::Entity);
        assert_eq!(QueueName::for_stage(Stage::RelationshipBuilding), QueueName::Graph);
        assert_eq!(QueueName::for_stage(Stage::Finalization), QueueName::Cleanup);
    }

    #[test]
    fn test_priority_worker_profiles() {
        assert_eq!(
            QueueName::for_priority_worker(BatchPriority::High),
            vec![QueueName::BatchHigh]
        );
        assert_eq!(
            QueueName::for_priority_worker(BatchPriority::Normal),
            vec![QueueName::BatchNormal, QueueName::BatchLow]
        );
        assert_eq!(
            QueueName::for_priority_worker(BatchPriority::Low),
            vec![QueueName::BatchLow]
        );
    }

    #[test]
    fn test_task_kind_stage() {
        assert_eq!(TaskKind::OcrSubmit.stage(), Stage::Ocr);
        assert_eq!(TaskKind::OcrPoll.stage(), Stage::Ocr);
        assert_eq!(TaskKind::for_stage(Stage::Ocr), TaskKind::OcrSubmit);
        for stage in Stage::ALL {
            assert_eq!(TaskKind::for_stage(stage).stage(), stage);
        }
    }
}
