//! Eager (full-document) conversion entry points.
//!
//! This module provides the simpler API: wait for all pages, then return.
//! Pages are extracted as bounded parallel tasks, then structured, refined
//! and assembled in page order. Use [`crate::stream::convert_stream`] to
//! receive pages as they finish instead.

use crate::cancel::CancelToken;
use crate::config::ConversionConfig;
use crate::error::{PageError, Pdf2MdError};
use crate::model::{Asset, DocumentId, PageClass};
use crate::output::{ConversionOutput, ConversionStats, DocumentMetadata, PageResult};
use crate::pipeline::assemble::assemble;
use crate::pipeline::assets::{AssetStore, DirectoryAssetStore, InlineAssetStore};
use crate::pipeline::input::{self, ResolvedInput};
use crate::pipeline::ocr::{OcrBackend, TesseractBackend};
use crate::pipeline::page::{finish_page, ExtractedPage, PageWorker};
use crate::pipeline::pdfium::{self, PdfiumDocument};
use crate::pipeline::refine::{LlmRefiner, NoopRefiner, StructureRefiner};
use crate::pipeline::source::{PageSource, Rasterizer};
use futures::stream::{self, StreamExt};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Convert a PDF file or URL to Markdown.
///
/// This is the primary entry point for the library.
///
/// # Arguments
/// * `input` — Local file path or HTTP/HTTPS URL to a PDF
/// * `config` — Conversion configuration
///
/// # Returns
/// `Ok(ConversionOutput)` even when some pages degraded; their problems
/// appear as inline diagnostics and in `output.pages[i].errors`.
///
/// # Errors
/// Returns `Err(Pdf2MdError)` only for fatal errors:
/// - File not found / permission denied / not a PDF
/// - Encrypted PDF without the right password
/// - Assembly failure (missing page result, dangling asset reference)
pub async fn convert(
    input_str: impl AsRef<str>,
    config: &ConversionConfig,
) -> Result<ConversionOutput, Pdf2MdError> {
    convert_cancellable(input_str, config, &CancelToken::new()).await
}

/// [`convert`] with a cancellation handle.
///
/// Cancelling stops pages that have not started, abandons in-flight pages
/// (killing their OCR processes) and returns [`Pdf2MdError::Cancelled`].
pub async fn convert_cancellable(
    input_str: impl AsRef<str>,
    config: &ConversionConfig,
    cancel: &CancelToken,
) -> Result<ConversionOutput, Pdf2MdError> {
    let input_str = input_str.as_ref();
    info!("Starting conversion: {}", input_str);

    let resolved = input::resolve_input(input_str, config.download_timeout_secs).await?;
    convert_resolved(&resolved, config, cancel).await
}

async fn convert_resolved(
    resolved: &ResolvedInput,
    config: &ConversionConfig,
    cancel: &CancelToken,
) -> Result<ConversionOutput, Pdf2MdError> {
    let (doc, document) = open_document(resolved, config).await?;
    let metadata = doc.metadata().clone();
    convert_with(doc.clone(), doc, document, metadata, config, cancel).await
}

/// Open a resolved PDF and derive its document id.
pub(crate) async fn open_document(
    resolved: &ResolvedInput,
    config: &ConversionConfig,
) -> Result<(Arc<PdfiumDocument>, DocumentId), Pdf2MdError> {
    let path = resolved.path();
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| Pdf2MdError::Internal(format!("Failed to read '{}': {}", path.display(), e)))?;
    let document = document_id(config, &resolved.stem(), &bytes);
    debug!("Document id: {}", document);

    let doc =
        PdfiumDocument::open(path, config.password.as_deref(), config.max_rendered_pixels).await?;
    Ok((Arc::new(doc), document))
}

/// Configured id, or one derived from the file stem and content.
pub(crate) fn document_id(config: &ConversionConfig, stem: &str, bytes: &[u8]) -> DocumentId {
    match config.document_id.as_deref() {
        Some(id) => DocumentId::new(id),
        None => DocumentId::derive(stem, bytes),
    }
}

/// Default collaborators, each overridable through the config.
///
/// An LLM refiner whose provider cannot be resolved degrades to
/// [`NoopRefiner`]; refinement never decides whether a conversion succeeds.
pub(crate) fn collaborators(
    config: &ConversionConfig,
) -> (Arc<dyn OcrBackend>, Arc<dyn AssetStore>, Arc<dyn StructureRefiner>) {
    let ocr: Arc<dyn OcrBackend> = match config.ocr_backend {
        Some(ref backend) => Arc::clone(backend),
        None => Arc::new(
            TesseractBackend::new(&config.tesseract_path, &config.ocr_language)
                .with_column_gap_factor(config.column_gap_factor),
        ),
    };

    let store: Arc<dyn AssetStore> = match (&config.asset_store, &config.asset_dir) {
        (Some(store), _) => Arc::clone(store),
        (None, Some(dir)) => Arc::new(DirectoryAssetStore::new(dir, &config.asset_url_prefix)),
        (None, None) => Arc::new(InlineAssetStore::new()),
    };

    let refiner: Arc<dyn StructureRefiner> = match config.refiner {
        Some(ref refiner) => Arc::clone(refiner),
        None if config.refine_with_llm => match LlmRefiner::from_config(config) {
            Ok(refiner) => Arc::new(refiner),
            Err(e) => {
                warn!("LLM refinement disabled, keeping layout blocks: {}", e);
                Arc::new(NoopRefiner)
            }
        },
        None => Arc::new(NoopRefiner),
    };

    (ocr, store, refiner)
}

/// Selected 0-based page indices, or an error when none remain.
pub(crate) fn selected_pages(
    config: &ConversionConfig,
    total_pages: usize,
) -> Result<Vec<usize>, Pdf2MdError> {
    let indices = config.pages.to_indices(total_pages);
    if indices.is_empty() {
        return Err(Pdf2MdError::PageOutOfRange {
            page: 0,
            total: total_pages,
        });
    }
    Ok(indices)
}

/// Aborts a spawned page task when its driver future is dropped.
struct AbortOnDrop(tokio::task::AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Run one page task, abandoning it when `cancel` fires or the returned
/// future is dropped.
pub(crate) async fn run_page(
    worker: PageWorker,
    index: usize,
    total: usize,
    cancel: CancelToken,
) -> Option<ExtractedPage> {
    if cancel.is_cancelled() {
        return None;
    }
    let handle = tokio::spawn(async move { worker.extract(index, total).await });
    let _guard = AbortOnDrop(handle.abort_handle());
    tokio::select! {
        _ = cancel.cancelled() => {
            debug!("Page {}: abandoned after cancellation", index + 1);
            None
        }
        joined = handle => Some(joined.unwrap_or_else(|e| {
            warn!("Page {}: task failed: {}", index + 1, e);
            ExtractedPage::failed_with(
                index,
                PageError::LoadFailed {
                    page: index + 1,
                    detail: format!("page task failed: {e}"),
                },
            )
        })),
    }
}

/// Convert with explicit collaborators.
///
/// `source` supplies the pages and `rasterizer` renders them for OCR and
/// equation crops; every other collaborator comes from `config`. This is
/// what the file-based entry points call after opening the PDF, and what
/// tests call with in-memory fakes.
pub async fn convert_with(
    source: Arc<dyn PageSource>,
    rasterizer: Arc<dyn Rasterizer>,
    document: DocumentId,
    metadata: DocumentMetadata,
    config: &ConversionConfig,
    cancel: &CancelToken,
) -> Result<ConversionOutput, Pdf2MdError> {
    let total_start = Instant::now();
    let total_pages = source.page_count();
    let indices = selected_pages(config, total_pages)?;
    info!(
        "Converting {} of {} pages (document {})",
        indices.len(),
        total_pages,
        document
    );

    let (ocr, store, refiner) = collaborators(config);
    if let Some(ref cb) = config.progress_callback {
        cb.on_conversion_start(indices.len());
    }

    // ── Per-page extraction (bounded fan-out) ────────────────────────────
    let extract_start = Instant::now();
    let worker = PageWorker {
        source,
        rasterizer,
        ocr,
        store,
        document: document.clone(),
        config: Arc::new(config.clone()),
    };
    let selected = indices.len();
    let extracted: Vec<Option<ExtractedPage>> = stream::iter(indices.iter().copied().map(|index| {
        run_page(worker.clone(), index, selected, cancel.clone())
    }))
    .buffer_unordered(config.concurrency)
    .collect()
    .await;
    if cancel.is_cancelled() {
        info!("Conversion cancelled");
        return Err(Pdf2MdError::Cancelled);
    }
    let mut extracted: Vec<ExtractedPage> = extracted.into_iter().flatten().collect();
    extracted.sort_by_key(|p| p.page.index);
    let extract_duration_ms = extract_start.elapsed().as_millis() as u64;

    let mut stats = ConversionStats {
        total_pages,
        skipped_pages: total_pages - selected,
        extract_duration_ms,
        ..ConversionStats::default()
    };
    for page in &extracted {
        match page.page.class {
            PageClass::NativeText => stats.native_pages += 1,
            PageClass::Scanned => stats.scanned_pages += 1,
            PageClass::Mixed => stats.mixed_pages += 1,
        }
        stats.ocr_spans += page.ocr_spans;
        stats.low_confidence_spans += page.low_confidence_spans;
    }

    // ── Structuring, refinement, assembly ────────────────────────────────
    let assemble_start = Instant::now();
    let finished: Vec<(PageResult, Vec<Asset>)> = stream::iter(extracted)
        .map(|page| {
            let refiner = Arc::clone(&refiner);
            async move { finish_page(page, config, refiner.as_ref()).await }
        })
        .buffered(config.concurrency)
        .collect()
        .await;
    if cancel.is_cancelled() {
        return Err(Pdf2MdError::Cancelled);
    }

    let mut pages = Vec::with_capacity(finished.len());
    let mut assets = Vec::new();
    for (page, page_assets) in finished {
        pages.push(page);
        assets.extend(page_assets);
    }
    for asset in &assets {
        match asset.kind {
            crate::model::AssetKind::Image => stats.image_assets += 1,
            crate::model::AssetKind::Equation => stats.equation_assets += 1,
        }
    }

    let expected: Vec<usize> = indices.iter().map(|i| i + 1).collect();
    let assembled = assemble(&mut pages, &expected, &assets, &metadata, config)?;

    stats.failed_pages = pages.iter().filter(|p| p.has_failures()).count();
    stats.processed_pages = pages.len() - stats.failed_pages;
    stats.suppressed_blocks = assembled.suppressed;
    stats.assemble_duration_ms = assemble_start.elapsed().as_millis() as u64;
    stats.total_duration_ms = total_start.elapsed().as_millis() as u64;

    info!(
        "Conversion complete: {}/{} pages clean, {} assets, {}ms total",
        stats.processed_pages,
        pages.len(),
        assets.len(),
        stats.total_duration_ms
    );
    if let Some(ref cb) = config.progress_callback {
        cb.on_conversion_complete(selected, stats.processed_pages);
    }

    Ok(ConversionOutput {
        document_id: document,
        markdown: assembled.markdown,
        asset_uris: assembled.asset_uris,
        assets,
        pages,
        metadata,
        stats,
    })
}

/// Convert a PDF and write output directly to a file.
///
/// Uses atomic write (temp file + rename) to prevent partial files.
pub async fn convert_to_file(
    input_str: impl AsRef<str>,
    output_path: impl AsRef<Path>,
    config: &ConversionConfig,
) -> Result<ConversionStats, Pdf2MdError> {
    let output = convert(input_str, config).await?;
    write_atomic(output_path.as_ref(), &output.markdown).await?;
    Ok(output.stats)
}

/// Write `contents` to `path` via a sibling temp file and rename.
pub async fn write_atomic(path: &Path, contents: &str) -> Result<(), Pdf2MdError> {
    let fail = |e| Pdf2MdError::OutputWriteFailed {
        path: path.to_path_buf(),
        source: e,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(fail)?;
    }
    let tmp_path = path.with_extension("md.tmp");
    tokio::fs::write(&tmp_path, contents).await.map_err(fail)?;
    tokio::fs::rename(&tmp_path, path).await.map_err(fail)?;
    Ok(())
}

/// Synchronous wrapper around [`convert`].
///
/// Creates a temporary tokio runtime internally.
pub fn convert_sync(
    input_str: impl AsRef<str>,
    config: &ConversionConfig,
) -> Result<ConversionOutput, Pdf2MdError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| Pdf2MdError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(convert(input_str, config))
}

/// Extract PDF metadata without converting content.
///
/// Needs neither an OCR backend nor an LLM provider.
pub async fn inspect(input_str: impl AsRef<str>) -> Result<DocumentMetadata, Pdf2MdError> {
    let resolved = input::resolve_input(input_str.as_ref(), 120).await?;
    pdfium::extract_metadata(resolved.path(), None).await
}

/// Convert PDF bytes in memory to Markdown.
///
/// The bytes are written to a managed [`tempfile`] that is removed on
/// return. The document id is derived from the content alone unless
/// `config.document_id` is set.
///
/// # Example
/// ```rust,no_run
/// use hybrid_pdf2md::{convert_from_bytes, ConversionConfig};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let bytes: Vec<u8> = std::fs::read("document.pdf")?;
/// let config = ConversionConfig::default();
/// let output = convert_from_bytes(&bytes, &config).await?;
/// println!("{}", output.markdown);
/// # Ok(())
/// # }
/// ```
pub async fn convert_from_bytes(
    bytes: &[u8],
    config: &ConversionConfig,
) -> Result<ConversionOutput, Pdf2MdError> {
    let tmp = write_temp_pdf(bytes)?;
    let resolved =
        input::resolve_input(&tmp.path().to_string_lossy(), config.download_timeout_secs).await?;
    let document = document_id(config, "document", bytes);
    let doc = Arc::new(
        PdfiumDocument::open(
            resolved.path(),
            config.password.as_deref(),
            config.max_rendered_pixels,
        )
        .await?,
    );
    let metadata = doc.metadata().clone();
    // `tmp` is dropped (and the file deleted) after conversion
    convert_with(doc.clone(), doc, document, metadata, config, &CancelToken::new()).await
}

pub(crate) fn write_temp_pdf(bytes: &[u8]) -> Result<tempfile::NamedTempFile, Pdf2MdError> {
    let mut tmp = tempfile::Builder::new()
        .suffix(".pdf")
        .tempfile()
        .map_err(|e| Pdf2MdError::Internal(format!("tempfile: {e}")))?;
    tmp.write_all(bytes)
        .map_err(|e| Pdf2MdError::Internal(format!("tempfile write: {e}")))?;
    Ok(tmp)
}
