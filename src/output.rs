//! Output types returned by the conversion entry points.

use crate::error::{PageError, Pdf2MdError};
use crate::model::{Asset, DocumentId, PageClass, StructuredBlock};
use crate::pipeline::assemble::render_blocks;
use serde::{Deserialize, Serialize};

/// The finished document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionOutput {
    /// Prefix of every asset id in this document.
    pub document_id: DocumentId,
    /// Final assembled Markdown.
    pub markdown: String,
    /// URIs of every asset the Markdown references, in order of first use.
    pub asset_uris: Vec<String>,
    /// Every asset persisted for this document.
    pub assets: Vec<Asset>,
    /// Per-page results, ordered by page number.
    pub pages: Vec<PageResult>,
    pub metadata: DocumentMetadata,
    pub stats: ConversionStats,
}

impl ConversionOutput {
    /// Turn page diagnostics into an error.
    ///
    /// The Markdown is still complete when this fails; use it when any
    /// degraded page should be treated as a failed run.
    pub fn into_result(self) -> Result<Self, Pdf2MdError> {
        let failed = self.pages.iter().filter(|p| p.has_failures()).count();
        if failed > 0 {
            Err(Pdf2MdError::PartialFailure {
                failed,
                total: self.pages.len(),
            })
        } else {
            Ok(self)
        }
    }
}

/// Result for one page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageResult {
    /// 1-indexed page number.
    pub page_num: usize,
    pub class: PageClass,
    /// Fragments extracted before structuring.
    pub fragment_count: usize,
    /// Structured blocks after refinement, header/footer suppression excluded.
    pub blocks: Vec<StructuredBlock>,
    /// Non-fatal errors, in the order they occurred.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<PageError>,
    pub duration_ms: u64,
}

impl PageResult {
    /// True when the page lost content (soft fallbacks excluded).
    pub fn has_failures(&self) -> bool {
        self.errors.iter().any(|e| !e.is_soft())
    }

    /// Markdown of this page alone, rendered like a page of the document.
    pub fn markdown(&self) -> String {
        render_blocks(&self.blocks)
    }
}

/// Aggregate statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversionStats {
    pub total_pages: usize,
    pub processed_pages: usize,
    /// Pages with at least one non-soft error.
    pub failed_pages: usize,
    pub skipped_pages: usize,
    pub native_pages: usize,
    pub scanned_pages: usize,
    pub mixed_pages: usize,
    pub ocr_spans: usize,
    pub low_confidence_spans: usize,
    pub image_assets: usize,
    pub equation_assets: usize,
    /// Blocks removed as repeated headers/footers.
    pub suppressed_blocks: usize,
    pub total_duration_ms: u64,
    /// Wall-clock time of the per-page fan-out.
    pub extract_duration_ms: u64,
    /// Structuring, refinement and assembly.
    pub assemble_duration_ms: u64,
}

/// Document metadata extracted from the PDF info dictionary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub title: Option<String>,
    pub author: Option<String>,
    pub subject: Option<String>,
    pub creator: Option<String>,
    pub producer: Option<String>,
    pub creation_date: Option<String>,
    pub modification_date: Option<String>,
    pub page_count: usize,
    pub pdf_version: String,
}
