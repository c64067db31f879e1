//! HTTP implementation of the OCR provider interface.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::blob::BlobRef;

use super::{OcrError, OcrPage, OcrProvider, ProviderStatus};

/// Connection settings for the OCR service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrProviderConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for OcrProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9998".to_string(),
            api_key: None,
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Serialize)]
struct StartRequest<'a> {
    source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content_type: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct StartResponse {
    job_id: String,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: String,
    #[serde(default)]
    pages: Vec<PageBlock>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PageBlock {
    page: u32,
    text: String,
}

/// Client for an HTTP submit-and-poll OCR service.
pub struct HttpOcrProvider {
    config: OcrProviderConfig,
    client: Client,
}

impl HttpOcrProvider {
    pub fn new(config: OcrProviderConfig) -> Result<Self, OcrError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| OcrError::Transport(e.to_string()))?;

        Ok(Self { config, client })
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }
}

#[async_trait]
impl OcrProvider for HttpOcrProvider {
    async fn start(&self, blob: &BlobRef) -> Result<String, OcrError> {
        let url = format!("{}/v1/jobs", self.config.base_url);
        let body = StartRequest {
            source: blob.to_string(),
            content_type: None,
        };

        let resp = self
            .request(self.client.post(&url).json(&body))
            .send()
            .await
            .map_err(|e| OcrError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(OcrError::Submission(format!("HTTP {}: {}", status, text)));
        }

        let started: StartResponse = resp
            .json()
            .await
            .map_err(|e| OcrError::Transport(format!("start response: {}", e)))?;

        Ok(started.job_id)
    }

    async fn status(&self, job_id: &str) -> Result<ProviderStatus, OcrError> {
        let url = format!("{}/v1/jobs/{}", self.config.base_url, job_id);

        let resp = self
            .request(self.client.get(&url))
            .send()
            .await
            .map_err(|e| OcrError::Transport(e.to_string()))?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Err(OcrError::UnknownJob(job_id.to_string()));
        }
        if !resp.status().is_success() {
            return Err(OcrError::Transport(format!("HTTP {}", resp.status())));
        }

        let status: StatusResponse = resp
            .json()
            .await
            .map_err(|e| OcrError::Transport(format!("status response: {}", e)))?;

        match status.status.as_str() {
            "in_progress" | "queued" => Ok(ProviderStatus::InProgress),
            "completed" => Ok(ProviderStatus::Completed {
                pages: status
                    .pages
                    .into_iter()
                    .map(|p| OcrPage {
                        number: p.page,
                        text: p.text,
                    })
                    .collect(),
            }),
            "failed" => Ok(ProviderStatus::Failed {
                reason: status.error.unwrap_or_else(|| "unspecified provider failure".to_string()),
            }),
            other => Err(OcrError::Provider(format!("unexpected status: {}", other))),
        }
    }

    async fn cancel(&self, job_id: &str) -> Result<(), OcrError> {
        let url = format!("{}/v1/jobs/{}", self.config.base_url, job_id);

        let resp = self
            .request(self.client.delete(&url))
            .send()
            .await
            .map_err(|e| OcrError::Transport(e.to_string()))?;

        if resp.status().is_success() || resp.status() == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(OcrError::Provider(format!("cancel: HTTP {}", resp.status())))
        }
    }
}
