//! Extraction endpoint configuration.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Endpoint base URL.
    pub endpoint: String,
    pub model: String,
    pub temperature: f32,
    /// Generation budget per call.
    pub max_tokens: u32,
    /// Chunk text beyond this is truncated before prompting.
    pub max_content_chars: usize,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:11434".to_string(),
            model: "llama3.1:8b".to_string(),
            temperature: 0.1,
            max_tokens: 2048,
            max_content_chars: 12_000,
            timeout_secs: 300,
        }
    }
}
