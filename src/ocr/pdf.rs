//! PDF preflight: scanned-document detection and page rasterization.
//!
//! Uses the poppler command line tools. `pdftotext` counts machine-readable
//! text blocks per page; `pdftoppm` renders pages to PNG for per-page OCR
//! of scanned documents.

use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PdfError {
    #[error("External tool not found: {0}")]
    ToolNotFound(String),
    #[error("PDF inspection failed: {0}")]
    InspectionFailed(String),
    #[error("Page conversion failed: {0}")]
    ConversionFailed(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Handle command output, extracting stdout on success or returning the
/// stderr tail as the error.
fn handle_cmd_output(
    result: std::io::Result<std::process::Output>,
    tool_name: &str,
    error_prefix: &str,
) -> Result<String, PdfError> {
    match result {
        Ok(output) => {
            if output.status.success() {
                Ok(String::from_utf8_lossy(&output.stdout).to_string())
            } else {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(PdfError::InspectionFailed(format!(
                    "{}: {}",
                    error_prefix, stderr
                )))
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(PdfError::ToolNotFound(tool_name.to_string()))
        }
        Err(e) => Err(PdfError::Io(e)),
    }
}

/// Check whether a binary is available on PATH.
pub fn check_binary(name: &str) -> bool {
    which::which(name).is_ok()
}

/// Result of the scanned-document heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preflight {
    pub scanned: bool,
    pub page_count: u32,
    pub readable_blocks: u32,
}

/// Shell-out PDF inspector and rasterizer.
#[derive(Debug, Clone)]
pub struct PdfTools {
    /// Render resolution for page images.
    pub dpi: u32,
    /// A document is scanned when readable text blocks do not exceed this.
    pub scanned_block_threshold: u32,
}

impl Default for PdfTools {
    fn default() -> Self {
        Self {
            dpi: 300,
            scanned_block_threshold: 0,
        }
    }
}

impl PdfTools {
    pub fn new(dpi: u32, scanned_block_threshold: u32) -> Self {
        Self {
            dpi,
            scanned_block_threshold,
        }
    }

    /// Classify a PDF as scanned or text-extractable.
    ///
    /// Counts non-empty text blocks across pages via `pdftotext`. Any
    /// detection error conservatively classifies the document as scanned
    /// so it still gets OCR'd.
    pub fn preflight(&self, pdf_path: &Path) -> Preflight {
        if !check_binary("pdftotext") {
            tracing::warn!("pdftotext not on PATH, treating document as scanned");
            return Preflight {
                scanned: true,
                page_count: 1,
                readable_blocks: 0,
            };
        }

        let page_count = self.page_count(pdf_path).unwrap_or(1);

        match self.readable_blocks(pdf_path) {
            Ok(blocks) => Preflight {
                scanned: blocks <= self.scanned_block_threshold,
                page_count,
                readable_blocks: blocks,
            },
            Err(e) => {
                tracing::warn!(path = %pdf_path.display(), error = %e, "preflight detection failed, treating as scanned");
                Preflight {
                    scanned: true,
                    page_count,
                    readable_blocks: 0,
                }
            }
        }
    }

    /// Count machine-readable text blocks (paragraph-sized spans separated
    /// by blank lines, with form feeds as page separators).
    fn readable_blocks(&self, pdf_path: &Path) -> Result<u32, PdfError> {
        let output = Command::new("pdftotext")
            .arg("-layout")
            .arg(pdf_path)
            .arg("-")
            .output();

        let text = handle_cmd_output(output, "pdftotext", "text extraction failed")?;
        Ok(count_text_blocks(&text))
    }

    /// Page count via `pdfinfo`.
    fn page_count(&self, pdf_path: &Path) -> Result<u32, PdfError> {
        let output = Command::new("pdfinfo").arg(pdf_path).output();
        let info = handle_cmd_output(output, "pdfinfo", "pdfinfo failed")?;

        for line in info.lines() {
            if let Some(rest) = line.strip_prefix("Pages:") {
                if let Ok(pages) = rest.trim().parse::<u32>() {
                    return Ok(pages);
                }
            }
        }

        Err(PdfError::InspectionFailed("no page count in pdfinfo output".to_string()))
    }

    /// Render one page to a PNG under `output_dir`, returning the image
    /// path. Pages are 1-based.
    pub fn rasterize_page(
        &self,
        pdf_path: &Path,
        page: u32,
        output_dir: &Path,
    ) -> Result<PathBuf, PdfError> {
        let page_str = page.to_string();
        let output_prefix = output_dir.join("page");

        let status = Command::new("pdftoppm")
            .args(["-png", "-r", &self.dpi.to_string(), "-f", &page_str, "-l", &page_str])
            .arg(pdf_path)
            .arg(&output_prefix)
            .status();

        match status {
            Ok(s) if s.success() => self.find_page_image(output_dir, page).ok_or_else(|| {
                PdfError::ConversionFailed(format!("no image produced for page {}", page))
            }),
            Ok(_) => Err(PdfError::ConversionFailed(format!(
                "pdftoppm failed for page {}",
                page
            ))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(PdfError::ToolNotFound("pdftoppm".to_string()))
            }
            Err(e) => Err(PdfError::Io(e)),
        }
    }

    /// Locate the image pdftoppm produced; it zero-pads page numbers
    /// depending on the document's total page count.
    fn find_page_image(&self, output_dir: &Path, page: u32) -> Option<PathBuf> {
        let candidates = [
            output_dir.join(format!("page-{}.png", page)),
            output_dir.join(format!("page-{:02}.png", page)),
            output_dir.join(format!("page-{:03}.png", page)),
        ];
        candidates.into_iter().find(|p| p.exists())
    }
}

/// Count non-empty text blocks separated by blank lines or page breaks.
fn count_text_blocks(text: &str) -> u32 {
    let mut blocks = 0u32;
    let mut in_block = false;

    for line in text.lines() {
        let meaningful = line.chars().any(|c| c.is_alphanumeric());
        if meaningful && !in_block {
            blocks += 1;
            in_block = true;
        } else if !meaningful {
            in_block = false;
        }
        if line.contains('\u{c}') {
            in_block = false;
        }
    }

    blocks
}
