//! Chunk repository over `document_chunks`.

use diesel::prelude::*;
use diesel_async::{AsyncConnection, RunQueryDsl};
use uuid::Uuid;

use crate::models::Chunk;
use crate::schema::document_chunks;

use super::pool::{AsyncSqlitePool, DieselError};
use super::records::{ChunkRecord, NewChunk};
use super::{parse_datetime, parse_uuid};

#[derive(Clone)]
pub struct ChunkRepository {
    pool: AsyncSqlitePool,
}

impl ChunkRepository {
    pub fn new(pool: AsyncSqlitePool) -> Self {
        Self { pool }
    }

    pub async fn count_for_document(&self, document_uuid: Uuid) -> Result<u64, DieselError> {
        let mut conn = self.pool.get().await?;

        let count: i64 = document_chunks::table
            .filter(document_chunks::document_uuid.eq(document_uuid.to_string()))
            .count()
            .get_result(&mut conn)
            .await?;

        Ok(count as u64)
    }

    /// Load a document's chunks ordered by chunk index.
    pub async fn get_for_document(&self, document_uuid: Uuid) -> Result<Vec<Chunk>, DieselError> {
        let mut conn = self.pool.get().await?;

        let records: Vec<ChunkRecord> = document_chunks::table
            .filter(document_chunks::document_uuid.eq(document_uuid.to_string()))
            .order(document_chunks::chunk_index.asc())
            .load(&mut conn)
            .await?;

        Ok(records.into_iter().map(Self::record_to_chunk).collect())
    }

    /// Replace a document's chunk set atomically.
    ///
    /// Re-running the chunking stage yields byte-identical chunks, so the
    /// delete-and-insert keeps the set closed and duplicate-free.
    pub async fn replace_for_document(
        &self,
        document_uuid: Uuid,
        chunks: &[Chunk],
    ) -> Result<(), DieselError> {
        let mut conn = self.pool.get().await?;
        let doc_id = document_uuid.to_string();
        let doc_filter = doc_id.clone();

        let uuids: Vec<String> = chunks.iter().map(|c| c.uuid.to_string()).collect();
        let metadatas: Vec<String> = chunks.iter().map(|c| c.metadata.to_string()).collect();
        let created: Vec<String> = chunks.iter().map(|c| c.created_at.to_rfc3339()).collect();

        let rows: Vec<NewChunk<'_>> = chunks
            .iter()
            .enumerate()
            .map(|(i, c)| NewChunk {
                uuid: &uuids[i],
                document_uuid: &doc_id,
                chunk_index: c.chunk_index,
                text: &c.text,
                char_start: c.char_start,
                char_end: c.char_end,
                page_start: c.page_start,
                page_end: c.page_end,
                metadata: &metadatas[i],
                created_at: &created[i],
            })
            .collect();

        conn.transaction(|conn| {
            Box::pin(async move {
                diesel::delete(
                    document_chunks::table.filter(document_chunks::document_uuid.eq(&doc_filter)),
                )
                .execute(conn)
                .await?;

                for row in &rows {
                    diesel::insert_into(document_chunks::table)
                        .values(row)
                        .execute(conn)
                        .await?;
                }

                Ok(())
            })
        })
        .await
    }

    fn record_to_chunk(record: ChunkRecord) -> Chunk {
        Chunk {
            uuid: parse_uuid(&record.uuid),
            document_uuid: parse_uuid(&record.document_uuid),
            chunk_index: record.chunk_index,
            text: record.text,
            char_start: record.char_start,
            char_end: record.char_end,
            page_start: record.page_start,
            page_end: record.page_end,
            metadata: serde_json::from_str(&record.metadata).unwrap_or(serde_json::json!({})),
            created_at: parse_datetime(&record.created_at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Document;
    use crate::repository::test_support::setup_test_db;
    use crate::repository::DocumentRepository;

    async fn seed_document(pool: &AsyncSqlitePool) -> Uuid {
        let docs = DocumentRepository::new(pool.clone());
        let doc = Document::new(Uuid::new_v4(), Uuid::new_v4(), "s3://b/k.pdf".to_string());
        docs.create_if_absent(&doc).await.unwrap();
        doc.uuid
    }

    #[tokio::test]
    async fn test_replace_is_idempotent() {
        let (pool, _dir) = setup_test_db().await;
        let repo = ChunkRepository::new(pool.clone());
        let doc_uuid = seed_document(&pool).await;

        let chunks: Vec<Chunk> = (0..3)
            .map(|i| {
                Chunk::new(
                    doc_uuid,
                    i,
                    format!("chunk {}", i),
                    (i as i64) * 450,
                    (i as i64) * 450 + 500,
                )
            })
            .collect();

        repo.replace_for_document(doc_uuid, &chunks).await.unwrap();
        repo.replace_for_document(doc_uuid, &chunks).await.unwrap();

        let loaded = repo.get_for_document(doc_uuid).await.unwrap();
        assert_eq!(loaded.len(), 3);
        for (i, chunk) in loaded.iter().enumerate() {
            assert_eq!(chunk.chunk_index, i as i32);
        }
    }

    #[tokio::test]
    async fn test_ordering_is_by_index() {
        let (pool, _dir) = setup_test_db().await;
        let repo = ChunkRepository::new(pool.clone());
        let doc_uuid = seed_document(&pool).await;

        let mut chunks: Vec<Chunk> = (0..5)
            .map(|i| Chunk::new(doc_uuid, i, format!("c{}", i), 0, 10))
            .collect();
        chunks.reverse();

        repo.replace_for_document(doc_uuid, &chunks).await.unwrap();
        let loaded = repo.get_for_document(doc_uuid).await.unwrap();
        let indices: Vec<i32> = loaded.iter().map(|c| c.chunk_index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
        assert_eq!(repo.count_for_document(doc_uuid).await.unwrap(), 5);
    }
}
