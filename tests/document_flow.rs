//! End-to-end data flow over the persistent store: chunk a document,
//! extract mentions, resolve entities, build relationships, and check
//! the cross-stage invariants hold (and keep holding on replay).

use std::sync::Arc;

use async_trait::async_trait;
use diesel_async::SimpleAsyncConnection;
use uuid::Uuid;

use lexpipe::chunking::Chunker;
use lexpipe::extraction::{EntityBackend, EntityExtractor, ExtractionConfig};
use lexpipe::llm::{LlmError, MentionRef, RawEdge, RawMention};
use lexpipe::models::Document;
use lexpipe::relationships::{RelationshipBackend, RelationshipBuilder, RelationshipConfig};
use lexpipe::repository::{
    AsyncSqlitePool, ChunkRepository, DocumentRepository, EntityRepository,
    RelationshipRepository,
};
use lexpipe::resolution::EntityResolver;

async fn setup_db() -> (AsyncSqlitePool, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let pool = AsyncSqlitePool::from_path(&dir.path().join("flow.db"));
    let mut conn = pool.get().await.unwrap();

    conn.batch_execute(
        r#"
        CREATE TABLE source_documents (
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
        CREATE TABLE document_chunks (
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
        CREATE TABLE entity_mentions (
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
        CREATE TABLE canonical_entities (
            uuid TEXT PRIMARY KEY,
            document_uuid TEXT NOT NULL REFERENCES source_documents(uuid),
            entity_type TEXT NOT NULL,
            canonical_name TEXT NOT NULL,
            aliases TEXT NOT NULL DEFAULT '[]',
            mention_count INTEGER NOT NULL DEFAULT 0,
            confidence REAL NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE TABLE relationship_staging (
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
        "#,
    )
    .await
    .unwrap();

    (pool, dir)
}

/// Raw text shaped like an OCR'd filing: sentences with recurring
/// parties, repeated across pages.
fn sample_filing(target_chars: usize) -> String {
    let paragraph = "Mr. John Doe, counsel for Acme Widgets LLC, moved to dismiss. \
Judge Sarah Connor denied the motion on March 5, 2021. \
Acme Widgets Inc. shall pay $1,250,000.00 to Mr. John Doe. ";

    let mut text = String::with_capacity(target_chars + paragraph.len());
    while text.chars().count() < target_chars {
        text.push_str(paragraph);
    }
    text.chars().take(target_chars).collect()
}

/// Entity source that always fails, forcing the pattern fallback.
struct DownBackend;

#[async_trait]
impl EntityBackend for DownBackend {
    async fn extract(&self, _text: &str) -> Result<Vec<RawMention>, LlmError> {
        Err(LlmError::Server("endpoint offline".to_string()))
    }
}

/// Edge source relating every person to every org it shares a chunk with.
struct PairwiseBackend;

#[async_trait]
impl RelationshipBackend for PairwiseBackend {
    async fn extract(
        &self,
        _text: &str,
        mentions: &[MentionRef<'_>],
    ) -> Result<Vec<RawEdge>, LlmError> {
        let mut edges = Vec::new();
        for a in mentions {
            for b in mentions {
                if a.entity_type == "PERSON" && b.entity_type == "ORG" {
                    edges.push(RawEdge {
                        from: a.index,
                        to: b.index,
                        rel_type: "REPRESENTS".to_string(),
                        confidence: 0.8,
                    });
                }
            }
        }
        Ok(edges)
    }
}

#[tokio::test]
async fn test_full_document_flow_holds_invariants() {
    let (pool, _dir) = setup_db().await;
    let docs = DocumentRepository::new(pool.clone());
    let chunks_repo = ChunkRepository::new(pool.clone());
    let entities = EntityRepository::new(pool.clone());
    let relationships = RelationshipRepository::new(pool.clone());

    let doc = Document::new(
        Uuid::new_v4(),
        Uuid::new_v4(),
        "s3://legal-docs/filings/motion.pdf".to_string(),
    );
    docs.create_if_absent(&doc).await.unwrap();

    // Stage 1 output: raw text of the expected size.
    let text = sample_filing(12_345);
    docs.set_raw_text(doc.uuid, &text, 3).await.unwrap();

    // Stage 2: chunking. Default config over 12,345 chars gives 27 chunks.
    let chunker = Chunker::default();
    let chunks = chunker.chunk(doc.uuid, &text).unwrap();
    assert_eq!(chunks.len(), 27);
    chunks_repo.replace_for_document(doc.uuid, &chunks).await.unwrap();
    docs.set_chunk_count(doc.uuid, chunks.len() as u32).await.unwrap();

    // Chunk contiguity: exactly one chunk per index in [0, count).
    let stored_chunks = chunks_repo.get_for_document(doc.uuid).await.unwrap();
    assert_eq!(stored_chunks.len(), 27);
    for (i, chunk) in stored_chunks.iter().enumerate() {
        assert_eq!(chunk.chunk_index, i as i32);
    }

    // Stage 3: extraction via the fallback path (endpoint down).
    let extractor = EntityExtractor::new(Arc::new(DownBackend), ExtractionConfig::default());
    let mentions = extractor
        .extract_document(doc.uuid, &stored_chunks)
        .await
        .unwrap();
    assert!(!mentions.is_empty());
    entities.replace_mentions(doc.uuid, &mentions).await.unwrap();

    // Mention locality: every mention points at a stored chunk of this
    // document and its offsets fit inside the chunk text.
    let stored_mentions = entities.get_mentions(doc.uuid).await.unwrap();
    for mention in &stored_mentions {
        let chunk = stored_chunks
            .iter()
            .find(|c| c.uuid == mention.chunk_uuid)
            .expect("mention chunk exists");
        assert_eq!(chunk.document_uuid, doc.uuid);
        assert!(mention.start_offset >= 0);
        assert!((mention.end_offset as usize) <= chunk.char_len());
        assert!(mention.start_offset < mention.end_offset);
    }

    // Stage 4: resolution.
    let resolver = EntityResolver::default();
    let outcome = resolver.resolve(doc.uuid, &stored_mentions);
    assert!(!outcome.canonical.is_empty());
    entities
        .write_resolution(doc.uuid, &outcome.canonical, &outcome.assignments)
        .await
        .unwrap();

    // Resolution closure: every mention carries a canonical pointer or an
    // explicit unresolved reason, and pointers land in this document's
    // canonical set.
    let resolved_mentions = entities.get_mentions(doc.uuid).await.unwrap();
    let canonical = entities.get_canonical(doc.uuid).await.unwrap();
    let canonical_ids: Vec<Uuid> = canonical.iter().map(|c| c.uuid).collect();
    assert_eq!(resolved_mentions.len(), stored_mentions.len());
    for mention in &resolved_mentions {
        match mention.canonical_entity_uuid {
            Some(canonical_uuid) => assert!(canonical_ids.contains(&canonical_uuid)),
            None => assert!(mention.unresolved_reason.is_some()),
        }
    }

    // Stage 4 idempotence: resolving again changes nothing.
    let counts_before = (
        entities.count_canonical(doc.uuid).await.unwrap(),
        entities.count_mentions(doc.uuid).await.unwrap(),
    );
    let replay = resolver.resolve(doc.uuid, &resolved_mentions);
    entities
        .write_resolution(doc.uuid, &replay.canonical, &replay.assignments)
        .await
        .unwrap();
    let counts_after = (
        entities.count_canonical(doc.uuid).await.unwrap(),
        entities.count_mentions(doc.uuid).await.unwrap(),
    );
    assert_eq!(counts_before, counts_after);

    let replay_ids: Vec<Uuid> = entities
        .get_canonical(doc.uuid)
        .await
        .unwrap()
        .iter()
        .map(|c| c.uuid)
        .collect();
    assert_eq!(canonical_ids, replay_ids);

    // Stage 5: relationships, from chunks + mentions + canonicals.
    let builder = RelationshipBuilder::new(Arc::new(PairwiseBackend), RelationshipConfig::default());
    let edges = builder
        .build(doc.uuid, &stored_chunks, &resolved_mentions, &canonical)
        .await
        .unwrap();
    assert!(!edges.is_empty());
    relationships.replace_for_document(doc.uuid, &edges).await.unwrap();

    // Relationship validity: no self-loops, endpoints in the canonical
    // set, (from, to, type) unique.
    let staged = relationships.get_for_document(doc.uuid).await.unwrap();
    let mut seen = std::collections::HashSet::new();
    for edge in &staged {
        assert_ne!(edge.from_entity_uuid, edge.to_entity_uuid);
        assert!(canonical_ids.contains(&edge.from_entity_uuid));
        assert!(canonical_ids.contains(&edge.to_entity_uuid));
        assert!(seen.insert((edge.from_entity_uuid, edge.to_entity_uuid, edge.rel_type.clone())));
    }

    // Stage 5 idempotence: rebuilding yields the identical edge set.
    let rebuilt = builder
        .build(doc.uuid, &stored_chunks, &resolved_mentions, &canonical)
        .await
        .unwrap();
    let mut rebuilt_ids: Vec<Uuid> = rebuilt.iter().map(|r| r.uuid).collect();
    rebuilt_ids.sort();
    let mut staged_ids: Vec<Uuid> = staged.iter().map(|r| r.uuid).collect();
    staged_ids.sort();
    assert_eq!(rebuilt_ids, staged_ids);
}
