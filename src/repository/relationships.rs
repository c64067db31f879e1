//! Staged relationship repository over `relationship_staging`.

use diesel::prelude::*;
use diesel_async::{AsyncConnection, RunQueryDsl};
use uuid::Uuid;

use crate::models::Relationship;
use crate::schema::relationship_staging;

use super::pool::{AsyncSqlitePool, DieselError};
use super::records::{NewRelationship, RelationshipRecord};
use super::{parse_datetime, parse_uuid};

#[derive(Clone)]
pub struct RelationshipRepository {
    pool: AsyncSqlitePool,
}

impl RelationshipRepository {
    pub fn new(pool: AsyncSqlitePool) -> Self {
        Self { pool }
    }

    pub async fn count_for_document(&self, document_uuid: Uuid) -> Result<u64, DieselError> {
        let mut conn = self.pool.get().await?;

        let count: i64 = relationship_staging::table
            .filter(relationship_staging::document_uuid.eq(document_uuid.to_string()))
            .count()
            .get_result(&mut conn)
            .await?;

        Ok(count as u64)
    }

    pub async fn get_for_document(
        &self,
        document_uuid: Uuid,
    ) -> Result<Vec<Relationship>, DieselError> {
        let mut conn = self.pool.get().await?;

        let records: Vec<RelationshipRecord> = relationship_staging::table
            .filter(relationship_staging::document_uuid.eq(document_uuid.to_string()))
            .order(relationship_staging::uuid.asc())
            .load(&mut conn)
            .await?;

        Ok(records.into_iter().map(Self::record_to_relationship).collect())
    }

    /// Replace a document's staged relationships atomically.
    pub async fn replace_for_document(
        &self,
        document_uuid: Uuid,
        relationships: &[Relationship],
    ) -> Result<(), DieselError> {
        let mut conn = self.pool.get().await?;
        let doc_id = document_uuid.to_string();
        let doc_filter = doc_id.clone();

        let uuids: Vec<String> = relationships.iter().map(|r| r.uuid.to_string()).collect();
        let froms: Vec<String> = relationships
            .iter()
            .map(|r| r.from_entity_uuid.to_string())
            .collect();
        let tos: Vec<String> = relationships
            .iter()
            .map(|r| r.to_entity_uuid.to_string())
            .collect();
        let evidence: Vec<Option<String>> = relationships
            .iter()
            .map(|r| r.evidence_chunk_uuid.map(|u| u.to_string()))
            .collect();
        let created: Vec<String> = relationships
            .iter()
            .map(|r| r.created_at.to_rfc3339())
            .collect();

        let rows: Vec<NewRelationship<'_>> = relationships
            .iter()
            .enumerate()
            .map(|(i, r)| NewRelationship {
                uuid: &uuids[i],
                document_uuid: &doc_id,
                from_entity_uuid: &froms[i],
                to_entity_uuid: &tos[i],
                rel_type: &r.rel_type,
                confidence: r.confidence,
                evidence_chunk_uuid: evidence[i].as_deref(),
                evidence_text: r.evidence_text.as_deref(),
                created_at: &created[i],
            })
            .collect();

        conn.transaction(|conn| {
            Box::pin(async move {
                diesel::delete(
                    relationship_staging::table
                        .filter(relationship_staging::document_uuid.eq(&doc_filter)),
                )
                .execute(conn)
                .await?;

                for row in &rows {
                    diesel::insert_into(relationship_staging::table)
                        .values(row)
                        .execute(conn)
                        .await?;
                }

                Ok(())
            })
        })
        .await
    }

    fn record_to_relationship(record: RelationshipRecord) -> Relationship {
        Relationship {
            uuid: parse_uuid(&record.uuid),
            document_uuid: parse_uuid(&record.document_uuid),
            from_entity_uuid: parse_uuid(&record.from_entity_uuid),
            to_entity_uuid: parse_uuid(&record.to_entity_uuid),
            rel_type: record.rel_type,
            confidence: record.confidence,
            evidence_chunk_uuid: record
                .evidence_chunk_uuid
                .as_deref()
                .and_then(|s| Uuid::parse_str(s).ok()),
            evidence_text: record.evidence_text,
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

    #[tokio::test]
    async fn test_replace_and_load() {
        let (pool, _dir) = setup_test_db().await;
        let repo = RelationshipRepository::new(pool.clone());

        let docs = DocumentRepository::new(pool);
        let doc = Document::new(Uuid::new_v4(), Uuid::new_v4(), "s3://b/k.pdf".to_string());
        docs.create_if_absent(&doc).await.unwrap();

        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut rel = Relationship::new(doc.uuid, a, b, "REPRESENTS".to_string(), 0.8);
        rel.evidence_text = Some("counsel for the plaintiff".to_string());

        repo.replace_for_document(doc.uuid, &[rel.clone()]).await.unwrap();
        repo.replace_for_document(doc.uuid, &[rel]).await.unwrap();

        let loaded = repo.get_for_document(doc.uuid).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].from_entity_uuid, a);
        assert_eq!(loaded[0].to_entity_uuid, b);
        assert_eq!(loaded[0].rel_type, "REPRESENTS");
        assert_eq!(
            loaded[0].evidence_text.as_deref(),
            Some("counsel for the plaintiff")
        );
        assert_eq!(repo.count_for_document(doc.uuid).await.unwrap(), 1);
    }
}
