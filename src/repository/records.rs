//! Diesel ORM records for the persistent store tables.
//!
//! These provide compile-time type checking for database operations.
//! Conversions to domain models live next to each repository.

use diesel::prelude::*;

use crate::schema;

/// Document row from `source_documents`.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = schema::source_documents)]
#[diesel(primary_key(uuid))]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct DocumentRecord {
    pub uuid: String,
    pub project_uuid: String,
    pub blob_location: String,
    pub original_filename: Option<String>,
    pub content_hash: Option<String>,
    pub file_size: Option<i64>,
    pub mime_type: Option<String>,
    pub status: String,
    pub current_stage: Option<String>,
    pub ocr_job_id: Option<String>,
    pub raw_text: Option<String>,
    pub error: Option<String>,
    pub page_count: i32,
    pub chunk_count: i32,
    pub entity_count: i32,
    pub metadata: String,
    pub created_at: String,
    pub updated_at: String,
}

/// New document row for insertion.
#[derive(Insertable, Debug)]
#[diesel(table_name = schema::source_documents)]
pub struct NewDocument<'a> {
    pub uuid: &'a str,
    pub project_uuid: &'a str,
    pub blob_location: &'a str,
    pub original_filename: Option<&'a str>,
    pub content_hash: Option<&'a str>,
    pub file_size: Option<i64>,
    pub mime_type: Option<&'a str>,
    pub status: &'a str,
    pub current_stage: Option<&'a str>,
    pub metadata: &'a str,
    pub created_at: &'a str,
    pub updated_at: &'a str,
}

/// Chunk row from `document_chunks`.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = schema::document_chunks)]
#[diesel(primary_key(uuid))]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct ChunkRecord {
    pub uuid: String,
    pub document_uuid: String,
    pub chunk_index: i32,
    pub text: String,
    pub char_start: i64,
    pub char_end: i64,
    pub page_start: Option<i32>,
    pub page_end: Option<i32>,
    pub metadata: String,
    pub created_at: String,
}

/// New chunk row for insertion.
#[derive(Insertable, Debug)]
#[diesel(table_name = schema::document_chunks)]
pub struct NewChunk<'a> {
    pub uuid: &'a str,
    pub document_uuid: &'a str,
    pub chunk_index: i32,
    pub text: &'a str,
    pub char_start: i64,
    pub char_end: i64,
    pub page_start: Option<i32>,
    pub page_end: Option<i32>,
    pub metadata: &'a str,
    pub created_at: &'a str,
}

/// Mention row from `entity_mentions`.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = schema::entity_mentions)]
#[diesel(primary_key(uuid))]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct MentionRecord {
    pub uuid: String,
    pub document_uuid: String,
    pub chunk_uuid: String,
    pub chunk_index: i32,
    pub text: String,
    pub entity_type: String,
    pub confidence: f32,
    pub start_offset: i32,
    pub end_offset: i32,
    pub canonical_entity_uuid: Option<String>,
    pub unresolved_reason: Option<String>,
    pub extraction_method: String,
    pub created_at: String,
}

/// New mention row for insertion.
#[derive(Insertable, Debug)]
#[diesel(table_name = schema::entity_mentions)]
pub struct NewMention<'a> {
    pub uuid: &'a str,
    pub document_uuid: &'a str,
    pub chunk_uuid: &'a str,
    pub chunk_index: i32,
    pub text: &'a str,
    pub entity_type: &'a str,
    pub confidence: f32,
    pub start_offset: i32,
    pub end_offset: i32,
    pub canonical_entity_uuid: Option<&'a str>,
    pub unresolved_reason: Option<&'a str>,
    pub extraction_method: &'a str,
    pub created_at: &'a str,
}

/// Canonical entity row from `canonical_entities`.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = schema::canonical_entities)]
#[diesel(primary_key(uuid))]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct CanonicalEntityRecord {
    pub uuid: String,
    pub document_uuid: String,
    pub entity_type: String,
    pub canonical_name: String,
    pub aliases: String,
    pub mention_count: i32,
    pub confidence: f32,
    pub created_at: String,
}

/// New canonical entity row for insertion.
#[derive(Insertable, Debug)]
#[diesel(table_name = schema::canonical_entities)]
pub struct NewCanonicalEntity<'a> {
    pub uuid: &'a str,
    pub document_uuid: &'a str,
    pub entity_type: &'a str,
    pub canonical_name: &'a str,
    pub aliases: &'a str,
    pub mention_count: i32,
    pub confidence: f32,
    pub created_at: &'a str,
}

/// Staged relationship row from `relationship_staging`.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = schema::relationship_staging)]
#[diesel(primary_key(uuid))]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct RelationshipRecord {
    pub uuid: String,
    pub document_uuid: String,
    pub from_entity_uuid: String,
    pub to_entity_uuid: String,
    pub rel_type: String,
    pub confidence: f32,
    pub evidence_chunk_uuid: Option<String>,
    pub evidence_text: Option<String>,
    pub created_at: String,
}

/// New staged relationship row for insertion.
#[derive(Insertable, Debug)]
#[diesel(table_name = schema::relationship_staging)]
pub struct NewRelationship<'a> {
    pub uuid: &'a str,
    pub document_uuid: &'a str,
    pub from_entity_uuid: &'a str,
    pub to_entity_uuid: &'a str,
    pub rel_type: &'a str,
    pub confidence: f32,
    pub evidence_chunk_uuid: Option<&'a str>,
    pub evidence_text: Option<&'a str>,
    pub created_at: &'a str,
}

/// Task row from `processing_tasks`. The `document_id` column stores the
/// document UUID string.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = schema::processing_tasks)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct TaskRecord {
    pub id: String,
    pub document_id: String,
    pub task_type: String,
    pub status: String,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

/// New task row for insertion.
#[derive(Insertable, Debug)]
#[diesel(table_name = schema::processing_tasks)]
pub struct NewTask<'a> {
    pub id: &'a str,
    pub document_id: &'a str,
    pub task_type: &'a str,
    pub status: &'a str,
    pub retry_count: i32,
    pub created_at: &'a str,
}

/// OCR job row from `textract_jobs`.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = schema::textract_jobs)]
#[diesel(primary_key(job_id))]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct OcrJobRecord {
    pub job_id: String,
    pub document_uuid: String,
    pub status: String,
    pub page_count: Option<i32>,
    pub error: Option<String>,
    pub result_location: Option<String>,
    pub submitted_at: String,
    pub updated_at: String,
}

/// New OCR job row for insertion.
#[derive(Insertable, Debug)]
#[diesel(table_name = schema::textract_jobs)]
pub struct NewOcrJob<'a> {
    pub job_id: &'a str,
    pub document_uuid: &'a str,
    pub status: &'a str,
    pub page_count: Option<i32>,
    pub submitted_at: &'a str,
    pub updated_at: &'a str,
}
