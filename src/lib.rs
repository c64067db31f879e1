//! lexpipe - legal document processing pipeline core.
//!
//! Ingests legal PDFs from object storage and produces, per document,
//! text chunks, resolved canonical entities, and staged entity
//! relationships for downstream graph loading. The pipeline is a strict
//! six-stage state machine (OCR, chunking, entity extraction, entity
//! resolution, relationship building, finalization) driven by a
//! Redis-backed task runtime with priority queues, scoped stage locks,
//! classified retries, batch orchestration, and cache warming.
//!
//! Embedders wire the external collaborators (blob store, OCR provider,
//! extraction endpoint, SQLite path, Redis URL) into a [`CoreContext`],
//! submit work through [`pipeline::PipelineCoordinator`] or
//! [`batch::BatchOrchestrator`], and run workers via
//! [`pipeline::TaskRuntime`].

// Model types use `from_str` methods that return Option<Self>, not
// Result<Self, Error> as std::str::FromStr requires.
#![allow(clippy::should_implement_trait)]

pub mod batch;
pub mod blob;
pub mod chunking;
pub mod config;
pub mod context;
pub mod error;
pub mod extraction;
pub mod llm;
pub mod models;
pub mod ocr;
pub mod pipeline;
pub mod rate_limit;
pub mod relationships;
pub mod repository;
pub mod resolution;
pub mod schema;
pub mod state;

pub use config::PipelineSettings;
pub use context::CoreContext;
pub use error::{ErrorKind, StageError};
