//! Processing task and OCR job records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Stage;

/// Status of one stage attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// One attempt of one stage on one document.
///
/// Created on enqueue; completed or failed exactly once. A failed task may
/// have successor retry tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingTask {
    pub id: Uuid,
    pub document_uuid: Uuid,
    pub stage: Stage,
    pub status: TaskStatus,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ProcessingTask {
    pub fn new(document_uuid: Uuid, stage: Stage, retry_count: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            document_uuid,
            stage,
            status: TaskStatus::Pending,
            error_message: None,
            retry_count,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

/// Provider-side status of an outstanding OCR job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OcrJobStatus {
    InProgress,
    Completed,
    Failed,
}

impl OcrJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Metadata for an outstanding async OCR job. Created at stage-1 submit;
/// transitions are driven by polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrJob {
    /// Provider job id. For per-page scanned submissions this is the
    /// representative first-page id; page jobs ride along in the handle.
    pub job_id: String,
    pub document_uuid: Uuid,
    pub status: OcrJobStatus,
    pub page_count: Option<i32>,
    pub error: Option<String>,
    /// Where the concatenated result text was cached.
    pub result_location: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OcrJob {
    pub fn new(job_id: String, document_uuid: Uuid) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            document_uuid,
            status: OcrJobStatus::InProgress,
            page_count: None,
            error: None,
            result_location: None,
            submitted_at: now,
            updated_at: now,
        }
    }
}
