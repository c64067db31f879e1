//! Core context: every handle a stage needs, created once at startup and
//! passed explicitly. No import-time side effects, no globals.

use std::sync::Arc;

use crate::blob::BlobStore;
use crate::chunking::Chunker;
use crate::config::PipelineSettings;
use crate::extraction::{EntityExtractor, LlmEntityBackend};
use crate::llm::LlmClient;
use crate::ocr::{OcrAdapter, OcrProvider};
use crate::rate_limit::RedisTokenBucket;
use crate::relationships::{LlmRelationshipBackend, RelationshipBuilder};
use crate::repository::{
    AsyncSqlitePool, ChunkRepository, DocumentRepository, EntityRepository,
    RelationshipRepository, TaskRepository,
};
use crate::resolution::EntityResolver;
use crate::state::{MetricsCollector, StateStore};

/// Shared handles injected into all stage functions.
///
/// Side effects flow exclusively through this context: the state store,
/// the repositories, the blob store, and the external adapters.
pub struct CoreContext {
    pub settings: PipelineSettings,
    pub state: StateStore,
    pub metrics: MetricsCollector,
    pub docs: DocumentRepository,
    pub chunks: ChunkRepository,
    pub entities: EntityRepository,
    pub relationships: RelationshipRepository,
    pub tasks: TaskRepository,
    pub blobs: Arc<dyn BlobStore>,
    pub ocr: OcrAdapter,
    pub chunker: Chunker,
    pub extractor: EntityExtractor,
    pub resolver: EntityResolver,
    pub relationship_builder: RelationshipBuilder,
}

impl CoreContext {
    /// Bootstrap from connection strings, for embedders that do not need
    /// custom wiring.
    pub async fn connect(
        settings: PipelineSettings,
        redis_url: &str,
        database_url: &str,
        blobs: Arc<dyn BlobStore>,
        ocr_provider: Arc<dyn OcrProvider>,
    ) -> anyhow::Result<Arc<Self>> {
        let state = StateStore::connect(redis_url).await?;
        let pool = AsyncSqlitePool::new(database_url);
        let llm = Arc::new(LlmClient::new(settings.llm.clone())?);
        Ok(Arc::new(Self::new(
            settings,
            state,
            pool,
            blobs,
            ocr_provider,
            llm,
        )))
    }

    /// Wire up the full context from its external collaborators.
    pub fn new(
        settings: PipelineSettings,
        state: StateStore,
        pool: AsyncSqlitePool,
        blobs: Arc<dyn BlobStore>,
        ocr_provider: Arc<dyn OcrProvider>,
        llm: Arc<LlmClient>,
    ) -> Self {
        let metrics = MetricsCollector::new(&state);
        let limiter = RedisTokenBucket::new(&state, settings.rate_limit.clone());

        let ocr = OcrAdapter::new(ocr_provider, blobs.clone(), settings.ocr.clone());
        let chunker = Chunker::new(settings.chunking.clone());

        let entity_backend = Arc::new(LlmEntityBackend::new(
            llm.clone(),
            limiter.clone(),
            &settings.extraction,
        ));
        let extractor = EntityExtractor::new(entity_backend, settings.extraction.clone());

        let resolver = EntityResolver::new(settings.resolution.clone());

        let relationship_backend = Arc::new(LlmRelationshipBackend::new(
            llm,
            limiter,
            &settings.relationships,
        ));
        let relationship_builder =
            RelationshipBuilder::new(relationship_backend, settings.relationships.clone());

        Self {
            settings,
            metrics,
            docs: DocumentRepository::new(pool.clone()),
            chunks: ChunkRepository::new(pool.clone()),
            entities: EntityRepository::new(pool.clone()),
            relationships: RelationshipRepository::new(pool.clone()),
            tasks: TaskRepository::new(pool),
            blobs,
            ocr,
            chunker,
            extractor,
            resolver,
            relationship_builder,
            state,
        }
    }
}
