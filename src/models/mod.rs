//! Domain model types for the document processing pipeline.

mod batch;
mod chunk;
mod document;
mod entity;
mod relationship;
mod task;

pub use batch::{
    Batch, BatchOptions, BatchPriority, BatchProgress, BatchSubmission, DocumentFailure,
    RecoveryPlan, RetryStrategy,
};
pub use chunk::Chunk;
pub use document::{Document, DocumentStatus, Stage};
pub use entity::{CanonicalEntity, EntityMention, EntityType, ExtractionMethod};
pub use relationship::Relationship;
pub use task::{OcrJob, OcrJobStatus, ProcessingTask, TaskStatus};
