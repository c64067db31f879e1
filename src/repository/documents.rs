//! Document repository over `source_documents`.

use chrono::Utc;
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use uuid::Uuid;

use crate::models::{Document, DocumentStatus, Stage};
use crate::schema::source_documents;

use super::pool::{AsyncSqlitePool, DieselError};
use super::records::{DocumentRecord, NewDocument};
use super::{parse_datetime, parse_uuid};

#[derive(Clone)]
pub struct DocumentRepository {
    pool: AsyncSqlitePool,
}

impl DocumentRepository {
    pub fn new(pool: AsyncSqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a document if it does not exist yet.
    ///
    /// Intake is idempotent on the document UUID: an existing row wins and
    /// `false` is returned.
    pub async fn create_if_absent(&self, doc: &Document) -> Result<bool, DieselError> {
        let mut conn = self.pool.get().await?;

        let created_at = doc.created_at.to_rfc3339();
        let updated_at = doc.updated_at.to_rfc3339();
        let uuid = doc.uuid.to_string();
        let project_uuid = doc.project_uuid.to_string();
        let metadata = doc.metadata.to_string();

        let record = NewDocument {
            uuid: &uuid,
            project_uuid: &project_uuid,
            blob_location: &doc.blob_location,
            original_filename: doc.original_filename.as_deref(),
            content_hash: doc.content_hash.as_deref(),
            file_size: doc.file_size.map(|s| s as i64),
            mime_type: doc.mime_type.as_deref(),
            status: doc.status.as_str(),
            current_stage: doc.current_stage.map(|s| s.as_str()),
            metadata: &metadata,
            created_at: &created_at,
            updated_at: &updated_at,
        };

        let rows = diesel::insert_into(source_documents::table)
            .values(&record)
            .on_conflict(source_documents::uuid)
            .do_nothing()
            .execute(&mut conn)
            .await?;

        Ok(rows > 0)
    }

    pub async fn get(&self, uuid: Uuid) -> Result<Option<Document>, DieselError> {
        let mut conn = self.pool.get().await?;

        let record: Option<DocumentRecord> = source_documents::table
            .find(uuid.to_string())
            .first(&mut conn)
            .await
            .optional()?;

        Ok(record.map(Self::record_to_document))
    }

    pub async fn get_many(&self, uuids: &[Uuid]) -> Result<Vec<Document>, DieselError> {
        let mut conn = self.pool.get().await?;

        let ids: Vec<String> = uuids.iter().map(|u| u.to_string()).collect();
        let records: Vec<DocumentRecord> = source_documents::table
            .filter(source_documents::uuid.eq_any(&ids))
            .load(&mut conn)
            .await?;

        Ok(records.into_iter().map(Self::record_to_document).collect())
    }

    /// Update overall status, clearing or recording the error column.
    pub async fn update_status(
        &self,
        uuid: Uuid,
        status: DocumentStatus,
        error: Option<&str>,
    ) -> Result<(), DieselError> {
        let mut conn = self.pool.get().await?;

        diesel::update(source_documents::table.find(uuid.to_string()))
            .set((
                source_documents::status.eq(status.as_str()),
                source_documents::error.eq(error),
                source_documents::updated_at.eq(Utc::now().to_rfc3339()),
            ))
            .execute(&mut conn)
            .await?;

        Ok(())
    }

    /// Record the stage a document is currently executing.
    pub async fn set_current_stage(&self, uuid: Uuid, stage: Stage) -> Result<(), DieselError> {
        let mut conn = self.pool.get().await?;

        diesel::update(source_documents::table.find(uuid.to_string()))
            .set((
                source_documents::current_stage.eq(stage.as_str()),
                source_documents::status.eq(DocumentStatus::InProgress.as_str()),
                source_documents::updated_at.eq(Utc::now().to_rfc3339()),
            ))
            .execute(&mut conn)
            .await?;

        Ok(())
    }

    /// Store the OCR result text and page count produced by stage 1.
    pub async fn set_raw_text(
        &self,
        uuid: Uuid,
        text: &str,
        page_count: u32,
    ) -> Result<(), DieselError> {
        let mut conn = self.pool.get().await?;

        diesel::update(source_documents::table.find(uuid.to_string()))
            .set((
                source_documents::raw_text.eq(text),
                source_documents::page_count.eq(page_count as i32),
                source_documents::updated_at.eq(Utc::now().to_rfc3339()),
            ))
            .execute(&mut conn)
            .await?;

        Ok(())
    }

    pub async fn set_ocr_job_id(&self, uuid: Uuid, job_id: &str) -> Result<(), DieselError> {
        let mut conn = self.pool.get().await?;

        diesel::update(source_documents::table.find(uuid.to_string()))
            .set((
                source_documents::ocr_job_id.eq(job_id),
                source_documents::updated_at.eq(Utc::now().to_rfc3339()),
            ))
            .execute(&mut conn)
            .await?;

        Ok(())
    }

    /// Update intake metadata discovered from the source bytes.
    pub async fn set_content_info(
        &self,
        uuid: Uuid,
        content_hash: &str,
        file_size: u64,
        mime_type: Option<&str>,
    ) -> Result<(), DieselError> {
        let mut conn = self.pool.get().await?;

        diesel::update(source_documents::table.find(uuid.to_string()))
            .set((
                source_documents::content_hash.eq(content_hash),
                source_documents::file_size.eq(file_size as i64),
                source_documents::mime_type.eq(mime_type),
                source_documents::updated_at.eq(Utc::now().to_rfc3339()),
            ))
            .execute(&mut conn)
            .await?;

        Ok(())
    }

    pub async fn set_chunk_count(&self, uuid: Uuid, count: u32) -> Result<(), DieselError> {
        let mut conn = self.pool.get().await?;

        diesel::update(source_documents::table.find(uuid.to_string()))
            .set((
                source_documents::chunk_count.eq(count as i32),
                source_documents::updated_at.eq(Utc::now().to_rfc3339()),
            ))
            .execute(&mut conn)
            .await?;

        Ok(())
    }

    pub async fn set_entity_count(&self, uuid: Uuid, count: u32) -> Result<(), DieselError> {
        let mut conn = self.pool.get().await?;

        diesel::update(source_documents::table.find(uuid.to_string()))
            .set((
                source_documents::entity_count.eq(count as i32),
                source_documents::updated_at.eq(Utc::now().to_rfc3339()),
            ))
            .execute(&mut conn)
            .await?;

        Ok(())
    }

    fn record_to_document(record: DocumentRecord) -> Document {
        Document {
            uuid: parse_uuid(&record.uuid),
            project_uuid: parse_uuid(&record.project_uuid),
            blob_location: record.blob_location,
            original_filename: record.original_filename,
            content_hash: record.content_hash,
            file_size: record.file_size.map(|s| s as u64),
            mime_type: record.mime_type,
            status: DocumentStatus::from_str(&record.status).unwrap_or(DocumentStatus::Pending),
            current_stage: record.current_stage.as_deref().and_then(Stage::from_str),
            ocr_job_id: record.ocr_job_id,
            raw_text: record.raw_text,
            error: record.error,
            page_count: record.page_count.max(0) as u32,
            chunk_count: record.chunk_count.max(0) as u32,
            entity_count: record.entity_count.max(0) as u32,
            metadata: serde_json::from_str(&record.metadata).unwrap_or(serde_json::json!({})),
            created_at: parse_datetime(&record.created_at),
            updated_at: parse_datetime(&record.updated_at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::test_support::setup_test_db;

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let (pool, _dir) = setup_test_db().await;
        let repo = DocumentRepository::new(pool);

        let doc = Document::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "s3://legal-docs/briefs/a.pdf".to_string(),
        );

        assert!(repo.create_if_absent(&doc).await.unwrap());
        assert!(!repo.create_if_absent(&doc).await.unwrap());

        let loaded = repo.get(doc.uuid).await.unwrap().unwrap();
        assert_eq!(loaded.uuid, doc.uuid);
        assert_eq!(loaded.status, DocumentStatus::Pending);
        assert_eq!(loaded.blob_location, doc.blob_location);
    }

    #[tokio::test]
    async fn test_status_and_stage_updates() {
        let (pool, _dir) = setup_test_db().await;
        let repo = DocumentRepository::new(pool);

        let doc = Document::new(Uuid::new_v4(), Uuid::new_v4(), "s3://b/k.pdf".to_string());
        repo.create_if_absent(&doc).await.unwrap();

        repo.set_current_stage(doc.uuid, Stage::Chunking).await.unwrap();
        let loaded = repo.get(doc.uuid).await.unwrap().unwrap();
        assert_eq!(loaded.current_stage, Some(Stage::Chunking));
        assert_eq!(loaded.status, DocumentStatus::InProgress);

        repo.update_status(doc.uuid, DocumentStatus::Failed, Some("data: empty_ocr"))
            .await
            .unwrap();
        let loaded = repo.get(doc.uuid).await.unwrap().unwrap();
        assert_eq!(loaded.status, DocumentStatus::Failed);
        assert_eq!(loaded.error.as_deref(), Some("data: empty_ocr"));
    }

    #[tokio::test]
    async fn test_raw_text_and_counters() {
        let (pool, _dir) = setup_test_db().await;
        let repo = DocumentRepository::new(pool);

        let doc = Document::new(Uuid::new_v4(), Uuid::new_v4(), "s3://b/k.pdf".to_string());
        repo.create_if_absent(&doc).await.unwrap();

        repo.set_raw_text(doc.uuid, "IN THE CIRCUIT COURT", 3).await.unwrap();
        repo.set_chunk_count(doc.uuid, 27).await.unwrap();
        repo.set_entity_count(doc.uuid, 11).await.unwrap();

        let loaded = repo.get(doc.uuid).await.unwrap().unwrap();
        assert_eq!(loaded.raw_text.as_deref(), Some("IN THE CIRCUIT COURT"));
        assert_eq!(loaded.page_count, 3);
        assert_eq!(loaded.chunk_count, 27);
        assert_eq!(loaded.entity_count, 11);
    }
}
