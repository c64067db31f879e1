//! Closed stage outcomes interpreted uniformly by the runtime.

use std::time::Duration;

use crate::error::StageError;
use crate::models::Stage;

use super::QueuedTask;

/// What a successful stage run produced.
#[derive(Debug, Clone)]
pub struct StageReport {
    pub stage: Stage,
    /// Rows written by the stage (chunks, mentions, edges...).
    pub items_written: u64,
    pub note: Option<String>,
}

impl StageReport {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            items_written: 0,
            note: None,
        }
    }

    pub fn with_items(stage: Stage, items_written: u64) -> Self {
        Self {
            stage,
            items_written,
            note: None,
        }
    }

    pub fn noted(stage: Stage, note: impl Into<String>) -> Self {
        Self {
            stage,
            items_written: 0,
            note: Some(note.into()),
        }
    }
}

/// A stage either completes with a report or fails with a classified
/// error; the runtime never inspects anything else.
pub type StageOutcome = Result<StageReport, StageError>;

/// Control result of executing one queued task.
#[derive(Debug)]
pub enum TaskDisposition {
    Completed(StageReport),
    /// Re-enqueue a (possibly rewritten) task after a delay; used by the
    /// polling sub-tasks which return rather than spin.
    Reschedule { task: QueuedTask, delay: Duration },
    Failed(StageError),
    Cancelled,
}
