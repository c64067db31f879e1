//! Batch models: manifests, progress aggregates, and recovery plans.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Priority of a submitted batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchPriority {
    High,
    Normal,
    Low,
}

impl BatchPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "high" => Some(Self::High),
            "normal" => Some(Self::Normal),
            "low" => Some(Self::Low),
            _ => None,
        }
    }

    /// Numeric task priority; higher preempts queue ordering.
    pub fn task_priority(&self) -> u8 {
        match self {
            Self::High => 10,
            Self::Normal => 5,
            Self::Low => 1,
        }
    }
}

/// Per-batch processing options supplied at submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchOptions {
    /// Pre-warm the state store before processing begins.
    pub warm_cache: bool,
    /// Per-stage retry budget for this batch's documents.
    pub max_retries: u32,
    /// Whether stage 4 runs; when false mentions stay unresolved and
    /// relationship building is skipped for lack of canonical endpoints.
    pub entity_resolution: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            warm_cache: false,
            max_retries: 3,
            entity_resolution: true,
        }
    }
}

/// A submitted group of documents, processed independently.
///
/// Batch state is a pure function of its documents' states.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: Uuid,
    pub project_uuid: Uuid,
    pub priority: BatchPriority,
    pub document_uuids: Vec<Uuid>,
    pub options: BatchOptions,
    pub submitted_at: DateTime<Utc>,
}

/// Returned by batch submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSubmission {
    pub batch_id: Uuid,
    /// The submission task id (the fan-out itself).
    pub task_id: Uuid,
    /// Per-document first-stage task ids, in manifest order.
    pub document_task_ids: Vec<Uuid>,
}

/// One failed document inside a batch progress report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentFailure {
    pub document_uuid: Uuid,
    /// Classified error kind, e.g. `transient`.
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    /// Stage where the failure occurred.
    pub failed_stage: Option<String>,
}

/// Aggregated progress for a batch, recomputed from per-document state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchProgress {
    pub batch_id: Uuid,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub in_progress: usize,
    pub pending: usize,
    /// Document counts keyed by `{stage}:{status}`.
    pub by_stage: BTreeMap<String, usize>,
    pub percent_complete: f64,
    pub elapsed_secs: u64,
    /// `avg_time_per_completed × remaining`, when any document completed.
    pub eta_secs: Option<u64>,
    pub failures: Vec<DocumentFailure>,
}

impl BatchProgress {
    /// Overall batch status derived from document terminal states.
    pub fn overall_status(&self) -> &'static str {
        let terminal = self.completed + self.failed + self.cancelled;
        if terminal < self.total {
            "in_progress"
        } else if self.failed == 0 && self.cancelled == 0 {
            "completed"
        } else if self.completed > 0 {
            "partial_success"
        } else {
            "failed"
        }
    }
}

/// How a recovery run should re-enqueue failed documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Failure rate ≤ 50% and retries remain: re-enqueue now.
    Immediate,
    /// Failure rate > 50%: wait at least ten minutes first.
    Delayed,
    /// Retry budget exhausted: operator intervention required.
    Manual,
}

impl RetryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Immediate => "immediate",
            Self::Delayed => "delayed",
            Self::Manual => "manual",
        }
    }
}

/// A plan for recovering the failed documents of a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryPlan {
    pub batch_id: Uuid,
    pub retry_strategy: RetryStrategy,
    pub failed_documents: Vec<Uuid>,
    /// Failure rate over the whole batch at planning time, in [0, 1].
    pub failure_rate: f64,
    /// Batch retry counter value the execution will record.
    pub retry_count: u32,
    /// Delay before re-enqueueing, for the delayed strategy.
    pub delay_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(total: usize, completed: usize, failed: usize) -> BatchProgress {
        BatchProgress {
            batch_id: Uuid::new_v4(),
            total,
            completed,
            failed,
            cancelled: 0,
            in_progress: 0,
            pending: total - completed - failed,
            by_stage: BTreeMap::new(),
            percent_complete: 0.0,
            elapsed_secs: 0,
            eta_secs: None,
            failures: Vec::new(),
        }
    }

    #[test]
    fn test_overall_status() {
        assert_eq!(progress(10, 3, 0).overall_status(), "in_progress");
        assert_eq!(progress(10, 10, 0).overall_status(), "completed");
        let mut p = progress(10, 6, 4);
        p.pending = 0;
        assert_eq!(p.overall_status(), "partial_success");
        let mut p = progress(10, 0, 10);
        p.pending = 0;
        assert_eq!(p.overall_status(), "failed");
    }

    #[test]
    fn test_priority_ordering() {
        assert!(BatchPriority::High.task_priority() > BatchPriority::Normal.task_priority());
        assert!(BatchPriority::Normal.task_priority() > BatchPriority::Low.task_priority());
    }
}
