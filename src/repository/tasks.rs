//! Task and OCR job repositories over `processing_tasks` and
//! `textract_jobs`.

use chrono::Utc;
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use uuid::Uuid;

use crate::models::{OcrJob, OcrJobStatus, ProcessingTask, Stage, TaskStatus};
use crate::schema::{processing_tasks, textract_jobs};

use super::pool::{AsyncSqlitePool, DieselError};
use super::records::{NewOcrJob, NewTask, OcrJobRecord, TaskRecord};
use super::{parse_datetime, parse_datetime_opt, parse_uuid};

#[derive(Clone)]
pub struct TaskRepository {
    pool: AsyncSqlitePool,
}

impl TaskRepository {
    pub fn new(pool: AsyncSqlitePool) -> Self {
        Self { pool }
    }

    /// Record a new stage attempt.
    pub async fn create(&self, task: &ProcessingTask) -> Result<(), DieselError> {
        let mut conn = self.pool.get().await?;

        let id = task.id.to_string();
        let document_id = task.document_uuid.to_string();
        let created_at = task.created_at.to_rfc3339();

        let record = NewTask {
            id: &id,
            document_id: &document_id,
            task_type: task.stage.as_str(),
            status: task.status.as_str(),
            retry_count: task.retry_count as i32,
            created_at: &created_at,
        };

        diesel::insert_into(processing_tasks::table)
            .values(&record)
            .execute(&mut conn)
            .await?;

        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<ProcessingTask>, DieselError> {
        let mut conn = self.pool.get().await?;

        let record: Option<TaskRecord> = processing_tasks::table
            .find(id.to_string())
            .first(&mut conn)
            .await
            .optional()?;

        Ok(record.map(Self::record_to_task))
    }

    pub async fn mark_started(&self, id: Uuid) -> Result<(), DieselError> {
        let mut conn = self.pool.get().await?;

        diesel::update(processing_tasks::table.find(id.to_string()))
            .set((
                processing_tasks::status.eq(TaskStatus::InProgress.as_str()),
                processing_tasks::started_at.eq(Utc::now().to_rfc3339()),
            ))
            .execute(&mut conn)
            .await?;

        Ok(())
    }

    /// Complete, fail, or cancel a task. Failed tasks keep the structured
    /// error text for the batch monitor.
    pub async fn mark_finished(
        &self,
        id: Uuid,
        status: TaskStatus,
        error_message: Option<&str>,
    ) -> Result<(), DieselError> {
        let mut conn = self.pool.get().await?;

        diesel::update(processing_tasks::table.find(id.to_string()))
            .set((
                processing_tasks::status.eq(status.as_str()),
                processing_tasks::error_message.eq(error_message),
                processing_tasks::completed_at.eq(Utc::now().to_rfc3339()),
            ))
            .execute(&mut conn)
            .await?;

        Ok(())
    }

    /// Attempts recorded for one (document, stage), oldest first.
    pub async fn get_for_stage(
        &self,
        document_uuid: Uuid,
        stage: Stage,
    ) -> Result<Vec<ProcessingTask>, DieselError> {
        let mut conn = self.pool.get().await?;

        let records: Vec<TaskRecord> = processing_tasks::table
            .filter(processing_tasks::document_id.eq(document_uuid.to_string()))
            .filter(processing_tasks::task_type.eq(stage.as_str()))
            .order(processing_tasks::created_at.asc())
            .load(&mut conn)
            .await?;

        Ok(records.into_iter().map(Self::record_to_task).collect())
    }

    /// Most recent non-terminal task for a document, if any. Intake uses
    /// this for idempotent re-submission.
    pub async fn get_open_for_document(
        &self,
        document_uuid: Uuid,
    ) -> Result<Option<ProcessingTask>, DieselError> {
        let mut conn = self.pool.get().await?;

        let record: Option<TaskRecord> = processing_tasks::table
            .filter(processing_tasks::document_id.eq(document_uuid.to_string()))
            .filter(processing_tasks::status.eq_any(vec!["pending", "in_progress"]))
            .order(processing_tasks::created_at.desc())
            .first(&mut conn)
            .await
            .optional()?;

        Ok(record.map(Self::record_to_task))
    }

    fn record_to_task(record: TaskRecord) -> ProcessingTask {
        ProcessingTask {
            id: parse_uuid(&record.id),
            document_uuid: parse_uuid(&record.document_id),
            stage: Stage::from_str(&record.task_type).unwrap_or(Stage::Ocr),
            status: TaskStatus::from_str(&record.status).unwrap_or(TaskStatus::Pending),
            error_message: record.error_message,
            retry_count: record.retry_count.max(0) as u32,
            created_at: parse_datetime(&record.created_at),
            started_at: parse_datetime_opt(record.started_at),
            completed_at: parse_datetime_opt(record.completed_at),
        }
    }

    // ========================================================================
    // OCR job records
    // ========================================================================

    /// Record a submitted OCR job, idempotent on the provider job id.
    pub async fn upsert_ocr_job(&self, job: &OcrJob) -> Result<(), DieselError> {
        let mut conn = self.pool.get().await?;

        let job_id = job.job_id.clone();
        let document_uuid = job.document_uuid.to_string();
        let submitted_at = job.submitted_at.to_rfc3339();
        let updated_at = job.updated_at.to_rfc3339();

        let record = NewOcrJob {
            job_id: &job_id,
            document_uuid: &document_uuid,
            status: job.status.as_str(),
            page_count: job.page_count,
            submitted_at: &submitted_at,
            updated_at: &updated_at,
        };

        diesel::insert_into(textract_jobs::table)
            .values(&record)
            .on_conflict(textract_jobs::job_id)
            .do_nothing()
            .execute(&mut conn)
            .await?;

        Ok(())
    }

    pub async fn get_ocr_job(&self, job_id: &str) -> Result<Option<OcrJob>, DieselError> {
        let mut conn = self.pool.get().await?;

        let record: Option<OcrJobRecord> = textract_jobs::table
            .find(job_id)
            .first(&mut conn)
            .await
            .optional()?;

        Ok(record.map(Self::record_to_ocr_job))
    }

    /// Latest OCR job submitted for a document, if any.
    pub async fn get_ocr_job_for_document(
        &self,
        document_uuid: Uuid,
    ) -> Result<Option<OcrJob>, DieselError> {
        let mut conn = self.pool.get().await?;

        let record: Option<OcrJobRecord> = textract_jobs::table
            .filter(textract_jobs::document_uuid.eq(document_uuid.to_string()))
            .order(textract_jobs::submitted_at.desc())
            .first(&mut conn)
            .await
            .optional()?;

        Ok(record.map(Self::record_to_ocr_job))
    }

    pub async fn update_ocr_job(
        &self,
        job_id: &str,
        status: OcrJobStatus,
        page_count: Option<i32>,
        error: Option<&str>,
        result_location: Option<&str>,
    ) -> Result<(), DieselError> {
        let mut conn = self.pool.get().await?;

        diesel::update(textract_jobs::table.find(job_id))
            .set((
                textract_jobs::status.eq(status.as_str()),
                textract_jobs::page_count.eq(page_count),
                textract_jobs::error.eq(error),
                textract_jobs::result_location.eq(result_location),
                textract_jobs::updated_at.eq(Utc::now().to_rfc3339()),
            ))
            .execute(&mut conn)
            .await?;

        Ok(())
    }

    fn record_to_ocr_job(record: OcrJobRecord) -> OcrJob {
        OcrJob {
            job_id: record.job_id,
            document_uuid: parse_uuid(&record.document_uuid),
            status: OcrJobStatus::from_str(&record.status).unwrap_or(OcrJobStatus::InProgress),
            page_count: record.page_count,
            error: record.error,
            result_location: record.result_location,
            submitted_at: parse_datetime(&record.submitted_at),
            updated_at: parse_datetime(&record.updated_at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::test_support::setup_test_db;

    #[tokio::test]
    async fn test_task_lifecycle() {
        let (pool, _dir) = setup_test_db().await;
        let repo = TaskRepository::new(pool);
        let doc = Uuid::new_v4();

        let task = ProcessingTask::new(doc, Stage::Chunking, 0);
        repo.create(&task).await.unwrap();

        let open = repo.get_open_for_document(doc).await.unwrap().unwrap();
        assert_eq!(open.id, task.id);
        assert_eq!(open.status, TaskStatus::Pending);

        repo.mark_started(task.id).await.unwrap();
        repo.mark_finished(task.id, TaskStatus::Completed, None).await.unwrap();

        let loaded = repo.get(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Completed);
        assert!(loaded.completed_at.is_some());
        assert!(repo.get_open_for_document(doc).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_task_keeps_error() {
        let (pool, _dir) = setup_test_db().await;
        let repo = TaskRepository::new(pool);
        let doc = Uuid::new_v4();

        let task = ProcessingTask::new(doc, Stage::Ocr, 2);
        repo.create(&task).await.unwrap();
        repo.mark_started(task.id).await.unwrap();
        repo.mark_finished(
            task.id,
            TaskStatus::Failed,
            Some("ocr_timeout: provider did not complete after 30 polls"),
        )
        .await
        .unwrap();

        let loaded = repo.get(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Failed);
        assert!(loaded
            .error_message
            .as_deref()
            .unwrap()
            .starts_with("ocr_timeout"));
        assert_eq!(loaded.retry_count, 2);
    }

    #[tokio::test]
    async fn test_ocr_job_roundtrip() {
        let (pool, _dir) = setup_test_db().await;
        let repo = TaskRepository::new(pool);
        let doc = Uuid::new_v4();

        let job = OcrJob::new("job-123".to_string(), doc);
        repo.upsert_ocr_job(&job).await.unwrap();
        // Second submit attempt is a no-op.
        repo.upsert_ocr_job(&job).await.unwrap();

        repo.update_ocr_job("job-123", OcrJobStatus::Completed, Some(3), None, Some("doc:ocr"))
            .await
            .unwrap();

        let loaded = repo.get_ocr_job_for_document(doc).await.unwrap().unwrap();
        assert_eq!(loaded.job_id, "job-123");
        assert_eq!(loaded.status, OcrJobStatus::Completed);
        assert_eq!(loaded.page_count, Some(3));
    }
}
