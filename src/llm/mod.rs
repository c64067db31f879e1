//! Client for the external extraction endpoint.
//!
//! The endpoint is a black-box text-to-structure function: given a prompt
//! it returns JSON. Two prompt contracts are used — entity extraction
//! (chunk text to typed mentions) and relationship extraction (chunk text
//! plus mentions to candidate edges). Error signals are surfaced as a
//! closed enum so callers can map them onto the retry taxonomy.

mod config;
mod prompts;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub use config::LlmConfig;

use crate::error::{ErrorKind, StageError};

/// One extracted mention, as returned by the endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMention {
    pub text: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    /// Char offsets within the submitted chunk text, `[start, end)`.
    pub start: usize,
    pub end: usize,
    pub confidence: f32,
}

/// A mention reference submitted with a relationship request.
#[derive(Debug, Clone, Serialize)]
pub struct MentionRef<'a> {
    pub index: usize,
    pub text: &'a str,
    #[serde(rename = "type")]
    pub entity_type: &'a str,
}

/// One candidate edge, endpoints referencing submitted mention indices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEdge {
    pub from: usize,
    pub to: usize,
    #[serde(rename = "type")]
    pub rel_type: String,
    pub confidence: f32,
}

/// Errors signalled by the extraction endpoint.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("rate limited")]
    RateLimited,
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("server error: {0}")]
    Server(String),
    #[error("timeout")]
    Timeout,
    #[error("connection error: {0}")]
    Connection(String),
    #[error("parse error: {0}")]
    Parse(String),
}

impl LlmError {
    /// Map the endpoint signal onto the retry taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RateLimited => ErrorKind::RateLimit,
            Self::InvalidInput(_) => ErrorKind::Data,
            Self::Server(_) | Self::Timeout | Self::Connection(_) | Self::Parse(_) => {
                ErrorKind::Transient
            }
        }
    }
}

impl From<LlmError> for StageError {
    fn from(e: LlmError) -> Self {
        StageError::new(e.kind(), e.to_string())
    }
}

/// Request format for the generation endpoint.
#[derive(Debug, Serialize)]
struct GenerateRequest {
    model: String,
    prompt: String,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
    num_predict: u32,
}

/// Response format for the generation endpoint.
#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

/// Extraction endpoint client.
pub struct LlmClient {
    config: LlmConfig,
    client: Client,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| LlmError::Connection(e.to_string()))?;

        Ok(Self { config, client })
    }

    pub fn config(&self) -> &LlmConfig {
        &self.config
    }

    /// Check if the endpoint is reachable.
    pub async fn is_available(&self) -> bool {
        let url = format!("{}/api/tags", self.config.endpoint);
        match self.client.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    /// Extract typed mentions from one chunk of text.
    pub async fn extract_entities(&self, text: &str) -> Result<Vec<RawMention>, LlmError> {
        let truncated = self.truncate_content(text);
        let prompt = prompts::entity_prompt(truncated);

        debug!(chars = truncated.len(), "extracting entities");
        let response = self.call(&prompt).await?;
        parse_json_payload(&response)
    }

    /// Extract candidate relationship edges from a chunk and its mentions.
    pub async fn extract_relationships(
        &self,
        text: &str,
        mentions: &[MentionRef<'_>],
    ) -> Result<Vec<RawEdge>, LlmError> {
        if mentions.len() < 2 {
            return Ok(Vec::new());
        }

        let truncated = self.truncate_content(text);
        let mention_json =
            serde_json::to_string(mentions).map_err(|e| LlmError::Parse(e.to_string()))?;
        let prompt = prompts::relationship_prompt(truncated, &mention_json);

        debug!(chars = truncated.len(), mentions = mentions.len(), "extracting relationships");
        let response = self.call(&prompt).await?;
        parse_json_payload(&response)
    }

    /// Truncate content to the configured maximum (UTF-8 safe).
    fn truncate_content<'a>(&self, text: &'a str) -> &'a str {
        if text.len() <= self.config.max_content_chars {
            return text;
        }
        let mut end = self.config.max_content_chars;
        while end > 0 && !text.is_char_boundary(end) {
            end -= 1;
        }
        &text[..end]
    }

    /// Call the generation endpoint with a prompt.
    async fn call(&self, prompt: &str) -> Result<String, LlmError> {
        let request = GenerateRequest {
            model: self.config.model.clone(),
            prompt: prompt.to_string(),
            stream: false,
            options: GenerateOptions {
                temperature: self.config.temperature,
                num_predict: self.config.max_tokens,
            },
        };

        let url = format!("{}/api/generate", self.config.endpoint);
        let resp = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout
                } else {
                    LlmError::Connection(e.to_string())
                }
            })?;

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(LlmError::RateLimited);
        }
        if status == StatusCode::BAD_REQUEST || status == StatusCode::UNPROCESSABLE_ENTITY {
            let body = resp.text().await.unwrap_or_default();
            return Err(LlmError::InvalidInput(body));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(LlmError::Server(format!("HTTP {}: {}", status, body)));
        }

        let generated: GenerateResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::Parse(e.to_string()))?;

        Ok(generated.response)
    }
}

/// Parse a JSON array out of a model response, tolerating code fences and
/// surrounding prose.
fn parse_json_payload<T: serde::de::DeserializeOwned>(response: &str) -> Result<Vec<T>, LlmError> {
    let cleaned = strip_code_fences(response);

    // Fast path: the whole payload is the array.
    if let Ok(parsed) = serde_json::from_str::<Vec<T>>(cleaned) {
        return Ok(parsed);
    }

    // Fall back to the outermost bracketed span.
    let start = cleaned.find('[');
    let end = cleaned.rfind(']');
    if let (Some(start), Some(end)) = (start, end) {
        if start < end {
            return serde_json::from_str(&cleaned[start..=end])
                .map_err(|e| LlmError::Parse(e.to_string()));
        }
    }

    Err(LlmError::Parse(format!(
        "no JSON array in response: {}",
        response.chars().take(120).collect::<String>()
    )))
}

fn strip_code_fences(response: &str) -> &str {
    let trimmed = response.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open.strip_suffix("```").unwrap_or(without_open).trim()
}
