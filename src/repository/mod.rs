//! Repository layer for the persistent store.
//!
//! One repository struct per aggregate, all cloneable over a shared
//! connection factory. Stage outputs are written bulk-atomically per
//! document so re-running a stage replaces rather than duplicates.

mod chunks;
mod documents;
mod entities;
mod pool;
mod records;
mod relationships;
mod tasks;

pub use chunks::ChunkRepository;
pub use documents::DocumentRepository;
pub use entities::EntityRepository;
pub use pool::{to_diesel_error, AsyncSqliteConnection, AsyncSqlitePool, DieselError};
pub use relationships::RelationshipRepository;
pub use tasks::TaskRepository;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Parse a datetime string from the database, defaulting to Unix epoch on
/// error.
pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::UNIX_EPOCH)
}

/// Parse an optional datetime string from the database.
pub(crate) fn parse_datetime_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    })
}

/// Parse a UUID column, defaulting to the nil UUID on malformed data.
pub(crate) fn parse_uuid(s: &str) -> Uuid {
    Uuid::parse_str(s).unwrap_or(Uuid::nil())
}

#[cfg(test)]
pub(crate) mod test_support {
    use diesel_async::SimpleAsyncConnection;
    use tempfile::TempDir;

    use super::AsyncSqlitePool;

    /// Create a throwaway database with the full table set.
    pub async fn setup_test_db() -> (AsyncSqlitePool, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let pool = AsyncSqlitePool::from_path(&db_path);
        let mut conn = pool.get().await.unwrap();

        conn.batch_execute(
            r#"
            CREATE TABLE IF NOT EXISTS source_documents (
                uuid TEXT PRIMARY KEY,
                project_uuid TEXT NOT NULL,
                blob_location TEXT NOT NULL,
                original_filename TEXT,
                content_hash TEXT,
                file_size BIGINT,
                mime_type TEXT,
                status TEXT NOT NULL,
                current_stage TEXT,
                ocr_job_id TEXT,
                raw_text TEXT,
                error TEXT,
                page_count INTEGER NOT NULL DEFAULT 0,
                chunk_count INTEGER NOT NULL DEFAULT 0,
                entity_count INTEGER NOT NULL DEFAULT 0,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS document_chunks (
                uuid TEXT PRIMARY KEY,
                document_uuid TEXT NOT NULL REFERENCES source_documents(uuid),
                chunk_index INTEGER NOT NULL,
                text TEXT NOT NULL,
                char_start BIGINT NOT NULL,
                char_end BIGINT NOT NULL,
                page_start INTEGER,
                page_end INTEGER,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                UNIQUE (document_uuid, chunk_index)
            );
            CREATE TABLE IF NOT EXISTS entity_mentions (
                uuid TEXT PRIMARY KEY,
                document_uuid TEXT NOT NULL REFERENCES source_documents(uuid),
                chunk_uuid TEXT NOT NULL REFERENCES document_chunks(uuid),
                chunk_index INTEGER NOT NULL,
                text TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                confidence REAL NOT NULL,
                start_offset INTEGER NOT NULL,
                end_offset INTEGER NOT NULL,
                canonical_entity_uuid TEXT,
                unresolved_reason TEXT,
                extraction_method TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS canonical_entities (
                uuid TEXT PRIMARY KEY,
                document_uuid TEXT NOT NULL REFERENCES source_documents(uuid),
                entity_type TEXT NOT NULL,
                canonical_name TEXT NOT NULL,
                aliases TEXT NOT NULL DEFAULT '[]',
                mention_count INTEGER NOT NULL DEFAULT 0,
                confidence REAL NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS relationship_staging (
                uuid TEXT PRIMARY KEY,
                document_uuid TEXT NOT NULL REFERENCES source_documents(uuid),
                from_entity_uuid TEXT NOT NULL,
                to_entity_uuid TEXT NOT NULL,
                rel_type TEXT NOT NULL,
                confidence REAL NOT NULL,
                evidence_chunk_uuid TEXT,
                evidence_text TEXT,
                created_at TEXT NOT NULL,
                UNIQUE (document_uuid, from_entity_uuid, to_entity_uuid, rel_type)
            );
            CREATE TABLE IF NOT EXISTS processing_tasks (
                id TEXT PRIMARY KEY,
                document_id TEXT NOT NULL,
                task_type TEXT NOT NULL,
                status TEXT NOT NULL,
                error_message TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT
            );
            CREATE TABLE IF NOT EXISTS textract_jobs (
                job_id TEXT PRIMARY KEY,
                document_uuid TEXT NOT NULL,
                status TEXT NOT NULL,
                page_count INTEGER,
                error TEXT,
                result_location TEXT,
                submitted_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .await
        .unwrap();

        (pool, dir)
    }
}
