//! Pipeline configuration.
//!
//! Each subsystem owns its config struct next to its code; this module
//! aggregates them into one deserializable settings tree with working
//! defaults. Loading (files, environment) is the embedder's concern.

use serde::{Deserialize, Serialize};

use crate::chunking::ChunkerConfig;
use crate::extraction::ExtractionConfig;
use crate::llm::LlmConfig;
use crate::ocr::{OcrProviderConfig, OcrSettings};
use crate::pipeline::RuntimeConfig;
use crate::rate_limit::RateLimitConfig;
use crate::relationships::RelationshipConfig;
use crate::resolution::ResolverConfig;

/// Batch orchestration knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Cache warming only kicks in at this batch size.
    pub warm_cache_min_documents: usize,
    /// Queue depth above which new batch enqueues are delayed.
    pub backpressure_depth: u64,
    /// Delay applied by the `delayed` recovery strategy.
    pub recovery_delay_secs: u64,
    /// Bound on how long a backpressured submission waits before
    /// proceeding anyway.
    pub backpressure_max_wait_secs: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            warm_cache_min_documents: 5,
            backpressure_depth: 100,
            recovery_delay_secs: 600,
            backpressure_max_wait_secs: 60,
        }
    }
}

/// Full settings tree for the pipeline core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub ocr: OcrSettings,
    pub ocr_provider: OcrProviderConfig,
    pub llm: LlmConfig,
    pub chunking: ChunkerConfig,
    pub extraction: ExtractionConfig,
    pub resolution: ResolverConfig,
    pub relationships: RelationshipConfig,
    pub rate_limit: RateLimitConfig,
    pub runtime: RuntimeConfig,
    pub batch: BatchConfig,
    pub retry: RetryConfig,
}

/// Default retry budget for stage attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_retries: 3 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_contract() {
        let settings = PipelineSettings::default();
        assert_eq!(settings.ocr.poll_interval_secs, 5);
        assert_eq!(settings.ocr.max_polls, 30);
        assert_eq!(settings.ocr.dpi, 300);
        assert_eq!(settings.chunking.max_tokens, 500);
        assert_eq!(settings.chunking.overlap_tokens, 50);
        assert!((settings.resolution.similarity_threshold - 0.85).abs() < 1e-9);
        assert!((settings.relationships.min_confidence - 0.5).abs() < f32::EPSILON);
        assert_eq!(settings.batch.warm_cache_min_documents, 5);
        assert_eq!(settings.batch.backpressure_depth, 100);
        assert_eq!(settings.batch.recovery_delay_secs, 600);
        assert_eq!(settings.retry.max_retries, 3);
    }

    #[test]
    fn test_partial_toml_overlay() {
        let settings: PipelineSettings = toml::from_str(
            r#"
            [chunking]
            max_tokens = 800
            overlap_tokens = 80
            min_chunk_chars = 200

            [retry]
            max_retries = 5
            "#,
        )
        .unwrap();

        assert_eq!(settings.chunking.max_tokens, 800);
        assert_eq!(settings.retry.max_retries, 5);
        // Untouched sections keep their defaults.
        assert_eq!(settings.ocr.max_polls, 30);
    }
}
