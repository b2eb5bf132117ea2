//! Error types for the hybrid-pdf2md library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`Pdf2MdError`] — **Fatal**: the conversion cannot produce a document
//!   at all (bad input file, wrong password, assembly failure, cancellation).
//!   Returned as `Err(Pdf2MdError)` from the top-level `convert*` functions.
//!
//! * [`PageError`] — **Non-fatal**: one page lost part of its content (OCR
//!   backend crashed, an asset could not be written) but the document is
//!   still produced. Stored on [`crate::output::PageResult`] and rendered as
//!   an inline diagnostic block at the page's position.
//!
//! Ambiguous classification never surfaces as an error: it resolves to
//! [`crate::model::PageClass::Mixed`].

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the hybrid-pdf2md library.
#[derive(Debug, Error)]
pub enum Pdf2MdError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("PDF file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The input string is not a valid file path or URL.
    #[error("Invalid input '{input}': not a file path or a valid HTTP/HTTPS URL")]
    InvalidInput { input: String },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'\nIncrease --download-timeout.")]
    DownloadTimeout { url: String, secs: u64 },

    /// The file exists and was read, but is not a PDF.
    #[error("File is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    // ── PDF errors ────────────────────────────────────────────────────────
    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("PDF '{path}' is corrupt: {detail}")]
    CorruptPdf { path: PathBuf, detail: String },

    /// PDF requires a password but none was provided.
    #[error("PDF '{path}' is encrypted and requires a password.\nProvide it with --password <PASSWORD>.")]
    PasswordRequired { path: PathBuf },

    /// A password was provided but it is wrong.
    #[error("Wrong password for PDF '{path}'")]
    WrongPassword { path: PathBuf },

    /// The page selection matched no page of the document.
    #[error("Page {page} is out of range (document has {total} pages)")]
    PageOutOfRange { page: usize, total: usize },

    // ── Pipeline errors ───────────────────────────────────────────────────
    /// The per-page results could not be combined into one document.
    /// No partial Markdown is emitted.
    #[error("Document assembly failed at page {page}: {reason}")]
    DocumentAssemblyFailure { page: usize, reason: String },

    /// The conversion was cancelled; completed pages were discarded.
    #[error("Conversion cancelled")]
    Cancelled,

    /// Some pages carry diagnostics.
    ///
    /// Returned by [`crate::output::ConversionOutput::into_result`] when
    /// the caller wants to treat any page failure as an error.
    #[error("{failed}/{total} pages reported extraction failures")]
    PartialFailure { failed: usize, total: usize },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write the output Markdown file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Refinement errors ─────────────────────────────────────────────────
    /// LLM refinement was requested but no provider could be created.
    #[error("LLM provider '{provider}' is not configured: {hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── Pdfium binding errors ─────────────────────────────────────────────
    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\n\
Set PDFIUM_LIB_PATH=/path/to/libpdfium, place the library next to the \
binary, or install it system-wide."
    )]
    PdfiumBindingFailed(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal error for a single page. `page` is 1-based.
#[derive(Debug, Clone, PartialEq, Error, serde::Serialize, serde::Deserialize)]
pub enum PageError {
    /// The page could not be read from the source document.
    #[error("Page {page}: could not be loaded: {detail}")]
    LoadFailed { page: usize, detail: String },

    /// The text layer yielded nothing; the page fell back to OCR.
    #[error("Page {page}: text layer is empty")]
    ExtractionEmpty { page: usize },

    /// Page rasterisation failed.
    #[error("Page {page}: rasterisation failed: {detail}")]
    RenderFailed { page: usize, detail: String },

    /// The OCR backend failed or timed out.
    #[error("Page {page}: OCR failed: {detail}")]
    RecognitionFailure { page: usize, detail: String },

    /// Assets could not be persisted; every asset of the page is omitted.
    #[error("Page {page}: assets omitted: {detail}")]
    AssetPersistFailure { page: usize, detail: String },
}

impl PageError {
    /// 1-based page number the error belongs to.
    pub fn page(&self) -> usize {
        match self {
            PageError::LoadFailed { page, .. }
            | PageError::ExtractionEmpty { page }
            | PageError::RenderFailed { page, .. }
            | PageError::RecognitionFailure { page, .. }
            | PageError::AssetPersistFailure { page, .. } => *page,
        }
    }

    /// Soft errors only steer the pipeline and never reach the output.
    pub fn is_soft(&self) -> bool {
        matches!(self, PageError::ExtractionEmpty { .. })
    }
}
