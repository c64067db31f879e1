//! Entity repository over `entity_mentions` and `canonical_entities`.

use diesel::prelude::*;
use diesel_async::{AsyncConnection, RunQueryDsl};
use uuid::Uuid;

use crate::models::{CanonicalEntity, EntityMention, EntityType, ExtractionMethod};
use crate::schema::{canonical_entities, entity_mentions};

use super::pool::{AsyncSqlitePool, DieselError};
use super::records::{CanonicalEntityRecord, MentionRecord, NewCanonicalEntity, NewMention};
use super::{parse_datetime, parse_uuid};

#[derive(Clone)]
pub struct EntityRepository {
    pool: AsyncSqlitePool,
}

impl EntityRepository {
    pub fn new(pool: AsyncSqlitePool) -> Self {
        Self { pool }
    }

    pub async fn count_mentions(&self, document_uuid: Uuid) -> Result<u64, DieselError> {
        let mut conn = self.pool.get().await?;

        let count: i64 = entity_mentions::table
            .filter(entity_mentions::document_uuid.eq(document_uuid.to_string()))
            .count()
            .get_result(&mut conn)
            .await?;

        Ok(count as u64)
    }

    pub async fn count_canonical(&self, document_uuid: Uuid) -> Result<u64, DieselError> {
        let mut conn = self.pool.get().await?;

        let count: i64 = canonical_entities::table
            .filter(canonical_entities::document_uuid.eq(document_uuid.to_string()))
            .count()
            .get_result(&mut conn)
            .await?;

        Ok(count as u64)
    }

    /// Load a document's mentions in (chunk_index, start_offset) order.
    pub async fn get_mentions(
        &self,
        document_uuid: Uuid,
    ) -> Result<Vec<EntityMention>, DieselError> {
        let mut conn = self.pool.get().await?;

        let records: Vec<MentionRecord> = entity_mentions::table
            .filter(entity_mentions::document_uuid.eq(document_uuid.to_string()))
            .order((
                entity_mentions::chunk_index.asc(),
                entity_mentions::start_offset.asc(),
            ))
            .load(&mut conn)
            .await?;

        Ok(records.into_iter().map(Self::record_to_mention).collect())
    }

    pub async fn get_canonical(
        &self,
        document_uuid: Uuid,
    ) -> Result<Vec<CanonicalEntity>, DieselError> {
        let mut conn = self.pool.get().await?;

        let records: Vec<CanonicalEntityRecord> = canonical_entities::table
            .filter(canonical_entities::document_uuid.eq(document_uuid.to_string()))
            .order(canonical_entities::uuid.asc())
            .load(&mut conn)
            .await?;

        Ok(records.into_iter().map(Self::record_to_canonical).collect())
    }

    /// Replace a document's mention set atomically (extraction stage
    /// output; re-running replaces rather than duplicates).
    pub async fn replace_mentions(
        &self,
        document_uuid: Uuid,
        mentions: &[EntityMention],
    ) -> Result<(), DieselError> {
        let mut conn = self.pool.get().await?;
        let doc_id = document_uuid.to_string();
        let doc_filter = doc_id.clone();

        let uuids: Vec<String> = mentions.iter().map(|m| m.uuid.to_string()).collect();
        let chunk_uuids: Vec<String> = mentions.iter().map(|m| m.chunk_uuid.to_string()).collect();
        let canonicals: Vec<Option<String>> = mentions
            .iter()
            .map(|m| m.canonical_entity_uuid.map(|u| u.to_string()))
            .collect();
        let created: Vec<String> = mentions.iter().map(|m| m.created_at.to_rfc3339()).collect();

        let rows: Vec<NewMention<'_>> = mentions
            .iter()
            .enumerate()
            .map(|(i, m)| NewMention {
                uuid: &uuids[i],
                document_uuid: &doc_id,
                chunk_uuid: &chunk_uuids[i],
                chunk_index: m.chunk_index,
                text: &m.text,
                entity_type: m.entity_type.as_str(),
                confidence: m.confidence,
                start_offset: m.start_offset,
                end_offset: m.end_offset,
                canonical_entity_uuid: canonicals[i].as_deref(),
                unresolved_reason: m.unresolved_reason.as_deref(),
                extraction_method: m.extraction_method.as_str(),
                created_at: &created[i],
            })
            .collect();

        conn.transaction(|conn| {
            Box::pin(async move {
                diesel::delete(
                    entity_mentions::table.filter(entity_mentions::document_uuid.eq(&doc_filter)),
                )
                .execute(conn)
                .await?;

                for row in &rows {
                    diesel::insert_into(entity_mentions::table)
                        .values(row)
                        .execute(conn)
                        .await?;
                }

                Ok(())
            })
        })
        .await
    }

    /// Write resolution output in a single logical transaction: replace
    /// the canonical set and backfill mention pointers.
    ///
    /// Canonical UUIDs are deterministic, so a partial write followed by a
    /// stage retry converges to the same rows.
    pub async fn write_resolution(
        &self,
        document_uuid: Uuid,
        canonical: &[CanonicalEntity],
        assignments: &[(Uuid, Option<Uuid>, Option<String>)],
    ) -> Result<(), DieselError> {
        let mut conn = self.pool.get().await?;
        let doc_id = document_uuid.to_string();
        let doc_filter = doc_id.clone();

        let uuids: Vec<String> = canonical.iter().map(|c| c.uuid.to_string()).collect();
        let aliases: Vec<String> = canonical
            .iter()
            .map(|c| serde_json::to_string(&c.aliases).unwrap_or_else(|_| "[]".to_string()))
            .collect();
        let created: Vec<String> = canonical.iter().map(|c| c.created_at.to_rfc3339()).collect();

        let canonical_rows: Vec<NewCanonicalEntity<'_>> = canonical
            .iter()
            .enumerate()
            .map(|(i, c)| NewCanonicalEntity {
                uuid: &uuids[i],
                document_uuid: &doc_id,
                entity_type: c.entity_type.as_str(),
                canonical_name: &c.canonical_name,
                aliases: &aliases[i],
                mention_count: c.mention_count as i32,
                confidence: c.confidence,
                created_at: &created[i],
            })
            .collect();

        let assignments: Vec<(String, Option<String>, Option<String>)> = assignments
            .iter()
            .map(|(m, c, reason)| {
                (
                    m.to_string(),
                    c.map(|u| u.to_string()),
                    reason.clone(),
                )
            })
            .collect();

        conn.transaction(|conn| {
            Box::pin(async move {
                diesel::delete(
                    canonical_entities::table
                        .filter(canonical_entities::document_uuid.eq(&doc_filter)),
                )
                .execute(conn)
                .await?;

                for row in &canonical_rows {
                    diesel::insert_into(canonical_entities::table)
                        .values(row)
                        .execute(conn)
                        .await?;
                }

                for (mention_uuid, canonical_uuid, reason) in &assignments {
                    diesel::update(entity_mentions::table.find(mention_uuid.as_str()))
                        .set((
                            entity_mentions::canonical_entity_uuid.eq(canonical_uuid.as_deref()),
                            entity_mentions::unresolved_reason.eq(reason.as_deref()),
                        ))
                        .execute(conn)
                        .await?;
                }

                Ok(())
            })
        })
        .await
    }

    fn record_to_mention(record: MentionRecord) -> EntityMention {
        EntityMention {
            uuid: parse_uuid(&record.uuid),
            document_uuid: parse_uuid(&record.document_uuid),
            chunk_uuid: parse_uuid(&record.chunk_uuid),
            chunk_index: record.chunk_index,
            text: record.text,
            entity_type: EntityType::from_str(&record.entity_type).unwrap_or(EntityType::Other),
            confidence: record.confidence,
            start_offset: record.start_offset,
            end_offset: record.end_offset,
            canonical_entity_uuid: record
                .canonical_entity_uuid
                .as_deref()
                .and_then(|s| Uuid::parse_str(s).ok()),
            unresolved_reason: record.unresolved_reason,
            extraction_method: ExtractionMethod::from_str(&record.extraction_method)
                .unwrap_or(ExtractionMethod::Llm),
            created_at: parse_datetime(&record.created_at),
        }
    }

    fn record_to_canonical(record: CanonicalEntityRecord) -> CanonicalEntity {
        CanonicalEntity {
            uuid: parse_uuid(&record.uuid),
            document_uuid: parse_uuid(&record.document_uuid),
            entity_type: EntityType::from_str(&record.entity_type).unwrap_or(EntityType::Other),
            canonical_name: record.canonical_name,
            aliases: serde_json::from_str(&record.aliases).unwrap_or_default(),
            mention_count: record.mention_count.max(0) as u32,
            confidence: record.confidence,
            created_at: parse_datetime(&record.created_at),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::models::{Chunk, Document};
    use crate::repository::test_support::setup_test_db;
    use crate::repository::{ChunkRepository, DocumentRepository};

    async fn seed_doc_with_chunk(pool: &AsyncSqlitePool) -> (Uuid, Uuid) {
        let docs = DocumentRepository::new(pool.clone());
        let doc = Document::new(Uuid::new_v4(), Uuid::new_v4(), "s3://b/k.pdf".to_string());
        docs.create_if_absent(&doc).await.unwrap();

        let chunk = Chunk::new(doc.uuid, 0, "Mr. John Doe v. Acme Corp.".to_string(), 0, 26);
        let chunk_uuid = chunk.uuid;
        ChunkRepository::new(pool.clone())
            .replace_for_document(doc.uuid, &[chunk])
            .await
            .unwrap();

        (doc.uuid, chunk_uuid)
    }

    fn mention(doc: Uuid, chunk: Uuid, text: &str, start: i32) -> EntityMention {
        EntityMention {
            uuid: Uuid::new_v4(),
            document_uuid: doc,
            chunk_uuid: chunk,
            chunk_index: 0,
            text: text.to_string(),
            entity_type: EntityType::Person,
            confidence: 0.9,
            start_offset: start,
            end_offset: start + text.chars().count() as i32,
            canonical_entity_uuid: None,
            unresolved_reason: None,
            extraction_method: ExtractionMethod::Llm,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_mentions_ordered_by_position() {
        let (pool, _dir) = setup_test_db().await;
        let repo = EntityRepository::new(pool.clone());
        let (doc, chunk) = seed_doc_with_chunk(&pool).await;

        let mentions = vec![
            mention(doc, chunk, "Acme Corp", 18),
            mention(doc, chunk, "John Doe", 4),
        ];
        repo.replace_mentions(doc, &mentions).await.unwrap();

        let loaded = repo.get_mentions(doc).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].text, "John Doe");
        assert_eq!(loaded[1].text, "Acme Corp");
    }

    #[tokio::test]
    async fn test_write_resolution_backfills_pointers() {
        let (pool, _dir) = setup_test_db().await;
        let repo = EntityRepository::new(pool.clone());
        let (doc, chunk) = seed_doc_with_chunk(&pool).await;

        let m1 = mention(doc, chunk, "John Doe", 4);
        let m2 = mention(doc, chunk, "Mr. John Doe", 0);
        repo.replace_mentions(doc, &[m1.clone(), m2.clone()]).await.unwrap();

        let canonical = CanonicalEntity {
            uuid: Uuid::new_v5(&doc, b"PERSON:0:0"),
            document_uuid: doc,
            entity_type: EntityType::Person,
            canonical_name: "Mr. John Doe".to_string(),
            aliases: vec!["John Doe".to_string()],
            mention_count: 2,
            confidence: 0.9,
            created_at: Utc::now(),
        };

        let assignments = vec![
            (m1.uuid, Some(canonical.uuid), None),
            (m2.uuid, Some(canonical.uuid), None),
        ];
        repo.write_resolution(doc, &[canonical.clone()], &assignments)
            .await
            .unwrap();

        // Running resolution twice converges to the same rows.
        repo.write_resolution(doc, &[canonical.clone()], &assignments)
            .await
            .unwrap();

        assert_eq!(repo.count_canonical(doc).await.unwrap(), 1);
        let loaded = repo.get_mentions(doc).await.unwrap();
        assert!(loaded
            .iter()
            .all(|m| m.canonical_entity_uuid == Some(canonical.uuid)));

        let canon = repo.get_canonical(doc).await.unwrap();
        assert_eq!(canon.len(), 1);
        assert_eq!(canon[0].canonical_name, "Mr. John Doe");
        assert_eq!(canon[0].aliases, vec!["John Doe".to_string()]);
    }
}
