//! OCR adapter: submit-and-poll over an external async OCR provider.
//!
//! Stage 1 never blocks on the provider. `submit` starts the job (after a
//! scanned-PDF preflight that may fan out per-page image jobs) and the
//! polling task re-checks status on an interval until completion or the
//! poll budget runs out.

pub mod http;
pub mod pdf;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::blob::{BlobError, BlobRef, BlobStore};
use crate::error::StageError;
use crate::models::Document;

pub use http::{HttpOcrProvider, OcrProviderConfig};
pub use pdf::{PdfTools, Preflight};

/// Text for one OCR'd page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrPage {
    /// 1-based page number.
    pub number: u32,
    pub text: String,
}

/// Provider-side job status.
#[derive(Debug, Clone)]
pub enum ProviderStatus {
    InProgress,
    Completed { pages: Vec<OcrPage> },
    Failed { reason: String },
}

#[derive(Debug, Error)]
pub enum OcrError {
    #[error("submission failed: {0}")]
    Submission(String),
    #[error("provider error: {0}")]
    Provider(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unknown job: {0}")]
    UnknownJob(String),
}

/// The black-box async OCR service.
#[async_trait]
pub trait OcrProvider: Send + Sync {
    /// Start a job over a blob and return the provider job id.
    async fn start(&self, blob: &BlobRef) -> Result<String, OcrError>;
    /// Check job status.
    async fn status(&self, job_id: &str) -> Result<ProviderStatus, OcrError>;
    /// Best-effort cancellation.
    async fn cancel(&self, job_id: &str) -> Result<(), OcrError>;
}

/// Handle for an outstanding OCR job.
///
/// Whole-PDF submissions carry a single provider job. Scanned documents
/// fan out one job per converted page image; the first page's id doubles
/// as the representative id recorded in the persistent store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobHandle {
    pub job_id: String,
    /// (page number, provider job id) pairs for per-page submissions.
    pub page_jobs: Vec<(u32, String)>,
}

impl JobHandle {
    pub fn whole(job_id: String) -> Self {
        Self {
            job_id,
            page_jobs: Vec::new(),
        }
    }

    pub fn is_per_page(&self) -> bool {
        !self.page_jobs.is_empty()
    }
}

/// Result of submitting a document for OCR.
#[derive(Debug, Clone)]
pub struct OcrSubmission {
    pub handle: JobHandle,
    pub page_count: u32,
    pub scanned: bool,
}

/// Aggregated poll result across a handle's jobs.
#[derive(Debug, Clone)]
pub enum PollOutcome {
    InProgress,
    /// Pages in ascending page order.
    Completed { pages: Vec<OcrPage> },
    Failed { reason: String },
}

/// OCR scheduling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrSettings {
    /// Render resolution for scanned-page conversion.
    pub dpi: u32,
    /// Readable-block count at or below which a PDF is scanned.
    pub scanned_block_threshold: u32,
    /// Delay before the first poll.
    pub initial_poll_delay_secs: u64,
    /// Interval between polls while the provider reports in-progress.
    pub poll_interval_secs: u64,
    /// Poll budget; exhaustion fails the stage with `ocr_timeout`.
    pub max_polls: u32,
    /// Submission retry budget.
    pub submit_retries: u32,
}

impl Default for OcrSettings {
    fn default() -> Self {
        Self {
            dpi: 300,
            scanned_block_threshold: 0,
            initial_poll_delay_secs: 5,
            poll_interval_secs: 5,
            max_polls: 30,
            submit_retries: 3,
        }
    }
}

/// Submit-and-poll interface over the provider, with scanned-PDF
/// detection and image conversion fallback.
#[derive(Clone)]
pub struct OcrAdapter {
    provider: Arc<dyn OcrProvider>,
    blobs: Arc<dyn BlobStore>,
    settings: OcrSettings,
}

impl OcrAdapter {
    pub fn new(
        provider: Arc<dyn OcrProvider>,
        blobs: Arc<dyn BlobStore>,
        settings: OcrSettings,
    ) -> Self {
        Self {
            provider,
            blobs,
            settings,
        }
    }

    pub fn settings(&self) -> &OcrSettings {
        &self.settings
    }

    /// Submit a document for OCR.
    ///
    /// Text-extractable PDFs are submitted whole. Scanned PDFs are
    /// rasterized per page at the configured DPI, the images stored under
    /// `converted-images/{doc}/page-{n}.png` in the document's bucket, and
    /// one provider job issued per page.
    pub async fn submit(&self, doc: &Document) -> Result<OcrSubmission, StageError> {
        let source = BlobRef::parse(&doc.blob_location)
            .map_err(|e| StageError::configuration(e.to_string()))?;

        let bytes = self.blobs.get(&source).await.map_err(|e| match e {
            BlobError::NotFound(r) => StageError::data(format!("source blob missing: {}", r)),
            other => StageError::transient(other.to_string()),
        })?;

        let workdir = tempfile::tempdir()
            .map_err(|e| StageError::resource(format!("tempdir: {}", e)))?;
        let pdf_path = workdir.path().join("source.pdf");
        tokio::fs::write(&pdf_path, &bytes)
            .await
            .map_err(|e| StageError::resource(format!("write source pdf: {}", e)))?;

        let tools = PdfTools::new(self.settings.dpi, self.settings.scanned_block_threshold);
        let preflight = {
            let tools = tools.clone();
            let path = pdf_path.clone();
            tokio::task::spawn_blocking(move || tools.preflight(&path))
                .await
                .map_err(|e| StageError::resource(format!("preflight task: {}", e)))?
        };

        tracing::info!(
            document = %doc.uuid,
            scanned = preflight.scanned,
            pages = preflight.page_count,
            blocks = preflight.readable_blocks,
            "ocr preflight"
        );

        if !preflight.scanned {
            let job_id = self.start_with_retry(&source).await?;
            return Ok(OcrSubmission {
                handle: JobHandle::whole(job_id),
                page_count: preflight.page_count,
                scanned: false,
            });
        }

        // Scanned path: rasterize and submit each page.
        let mut page_jobs = Vec::with_capacity(preflight.page_count as usize);
        for page in 1..=preflight.page_count {
            let image_path = {
                let tools = tools.clone();
                let path = pdf_path.clone();
                let out = workdir.path().to_path_buf();
                tokio::task::spawn_blocking(move || tools.rasterize_page(&path, page, &out))
                    .await
                    .map_err(|e| StageError::resource(format!("rasterize task: {}", e)))?
                    .map_err(|e| match e {
                        pdf::PdfError::ToolNotFound(t) => {
                            StageError::configuration(format!("missing binary: {}", t))
                        }
                        other => StageError::data(format!("page {} conversion: {}", page, other)),
                    })?
            };

            let image_bytes = tokio::fs::read(&image_path)
                .await
                .map_err(|e| StageError::resource(format!("read page image: {}", e)))?;

            let mut image_ref = BlobRef::converted_image(&source.bucket, doc.uuid, page);
            image_ref.scheme = source.scheme.clone();
            self.blobs
                .put(&image_ref, &image_bytes)
                .await
                .map_err(|e| StageError::transient(format!("store page image: {}", e)))?;

            let job_id = self.start_with_retry(&image_ref).await?;
            page_jobs.push((page, job_id));
        }

        let job_id = page_jobs
            .first()
            .map(|(_, id)| id.clone())
            .ok_or_else(|| StageError::data("scanned pdf produced no pages"))?;

        Ok(OcrSubmission {
            handle: JobHandle { job_id, page_jobs },
            page_count: preflight.page_count,
            scanned: true,
        })
    }

    /// Poll every job behind a handle once.
    pub async fn poll(&self, handle: &JobHandle) -> Result<PollOutcome, StageError> {
        if !handle.is_per_page() {
            return match self.provider.status(&handle.job_id).await {
                Ok(ProviderStatus::InProgress) => Ok(PollOutcome::InProgress),
                Ok(ProviderStatus::Completed { mut pages }) => {
                    pages.sort_by_key(|p| p.number);
                    Ok(PollOutcome::Completed { pages })
                }
                Ok(ProviderStatus::Failed { reason }) => Ok(PollOutcome::Failed { reason }),
                Err(e) => Err(StageError::transient(e.to_string())),
            };
        }

        let mut pages = Vec::with_capacity(handle.page_jobs.len());
        for (page, job_id) in &handle.page_jobs {
            match self.provider.status(job_id).await {
                Ok(ProviderStatus::InProgress) => return Ok(PollOutcome::InProgress),
                Ok(ProviderStatus::Completed { pages: job_pages }) => {
                    let text = job_pages
                        .into_iter()
                        .map(|p| p.text)
                        .collect::<Vec<_>>()
                        .join("\n");
                    pages.push(OcrPage { number: *page, text });
                }
                Ok(ProviderStatus::Failed { reason }) => {
                    return Ok(PollOutcome::Failed {
                        reason: format!("page {}: {}", page, reason),
                    })
                }
                Err(e) => return Err(StageError::transient(e.to_string())),
            }
        }

        pages.sort_by_key(|p| p.number);
        Ok(PollOutcome::Completed { pages })
    }

    /// Forward cancellation to the provider for every in-flight job.
    pub async fn cancel(&self, handle: &JobHandle) {
        if handle.is_per_page() {
            for (page, job_id) in &handle.page_jobs {
                if let Err(e) = self.provider.cancel(job_id).await {
                    tracing::warn!(job = %job_id, page, error = %e, "ocr cancel failed");
                }
            }
        } else if let Err(e) = self.provider.cancel(&handle.job_id).await {
            tracing::warn!(job = %handle.job_id, error = %e, "ocr cancel failed");
        }
    }

    /// Start a provider job with exponential backoff on submission failure.
    async fn start_with_retry(&self, blob: &BlobRef) -> Result<String, StageError> {
        let mut attempt = 0u32;
        loop {
            match self.provider.start(blob).await {
                Ok(job_id) => return Ok(job_id),
                Err(e) if attempt < self.settings.submit_retries => {
                    let delay = std::time::Duration::from_secs(2u64.saturating_pow(attempt));
                    tracing::warn!(blob = %blob, attempt, error = %e, "ocr submit failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(StageError::transient(format!(
                        "ocr submission failed after {} attempts: {}",
                        attempt + 1,
                        e
                    )))
                }
            }
        }
    }

    /// Concatenate page text deterministically in ascending page order.
    pub fn concatenate_pages(pages: &[OcrPage]) -> String {
        let mut ordered: Vec<&OcrPage> = pages.iter().collect();
        ordered.sort_by_key(|p| p.number);
        ordered
            .iter()
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join("\u{c}\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concatenate_pages_sorts_ascending() {
        let pages = vec![
            OcrPage {
                number: 3,
                text: "third".to_string(),
            },
            OcrPage {
                number: 1,
                text: "first".to_string(),
            },
            OcrPage {
                number: 2,
                text: "second".to_string(),
            },
        ];
        let text = OcrAdapter::concatenate_pages(&pages);
        assert_eq!(text, "first\u{c}\nsecond\u{c}\nthird");
    }

    #[test]
    fn test_handle_shape() {
        let whole = JobHandle::whole("j1".to_string());
        assert!(!whole.is_per_page());

        let per_page = JobHandle {
            job_id: "p1".to_string(),
            page_jobs: vec![(1, "p1".to_string()), (2, "p2".to_string())],
        };
        assert!(per_page.is_per_page());
    }
}
