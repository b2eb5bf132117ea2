//! Streaming conversion API: emit pages as they complete.
//!
//! Large documents take minutes. A stream lets callers display partial
//! results immediately, wire up progress bars, or write pages to disk
//! incrementally instead of waiting for the whole document.
//!
//! Unlike the eager [`crate::convert::convert`], pages arrive in completion
//! order (sort by `page_num` if order matters) and no document-level
//! assembly runs: running headers/footers are not suppressed and the GFM
//! cleanup is left to the caller. Dropping the stream abandons every
//! in-flight page.

use crate::cancel::CancelToken;
use crate::config::ConversionConfig;
use crate::convert::{
    collaborators, document_id, open_document, run_page, selected_pages, write_temp_pdf,
};
use crate::error::Pdf2MdError;
use crate::model::DocumentId;
use crate::output::PageResult;
use crate::pipeline::input;
use crate::pipeline::page::{finish_page, PageWorker};
use crate::pipeline::pdfium::PdfiumDocument;
use crate::pipeline::source::PageSource;
use futures::stream::{self, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use tokio_stream::Stream;
use tracing::info;

/// A boxed stream of page results. Page failures are carried inside each
/// [`PageResult`] as `errors` plus inline diagnostic blocks.
pub type PageStream = Pin<Box<dyn Stream<Item = PageResult> + Send>>;

/// Convert a PDF to Markdown, streaming pages as they are ready.
///
/// # Returns
/// - `Ok(PageStream)` — one `PageResult` per selected page
/// - `Err(Pdf2MdError)` — fatal error (file not found, not a PDF, etc.)
pub async fn convert_stream(
    input_str: impl AsRef<str>,
    config: &ConversionConfig,
) -> Result<PageStream, Pdf2MdError> {
    let input_str = input_str.as_ref();
    info!("Starting streaming conversion: {}", input_str);

    let resolved = input::resolve_input(input_str, config.download_timeout_secs).await?;
    let (doc, document) = open_document(&resolved, config).await?;
    stream_pages(doc, document, config, resolved)
}

/// Convert PDF bytes in memory to Markdown, streaming pages as they complete.
///
/// This is the streaming equivalent of [`crate::convert::convert_from_bytes`].
/// The bytes are written to a temporary file that lives as long as the
/// returned stream.
///
/// # Example
/// ```rust,no_run
/// use hybrid_pdf2md::{convert_stream_from_bytes, ConversionConfig};
/// use futures::StreamExt;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let bytes: Vec<u8> = std::fs::read("document.pdf")?;
/// let config = ConversionConfig::default();
/// let mut stream = convert_stream_from_bytes(&bytes, &config).await?;
/// while let Some(page) = stream.next().await {
///     println!("Page {} ({}): {} blocks", page.page_num, page.class, page.blocks.len());
/// }
/// # Ok(())
/// # }
/// ```
pub async fn convert_stream_from_bytes(
    bytes: &[u8],
    config: &ConversionConfig,
) -> Result<PageStream, Pdf2MdError> {
    let tmp = write_temp_pdf(bytes)?;
    let resolved =
        input::resolve_input(&tmp.path().to_string_lossy(), config.download_timeout_secs).await?;
    let document = document_id(config, "document", bytes);
    let doc = PdfiumDocument::open(
        resolved.path(),
        config.password.as_deref(),
        config.max_rendered_pixels,
    )
    .await?;
    stream_pages(Arc::new(doc), document, config, (tmp, resolved))
}

/// Build the page stream. `keep_alive` is held until the stream is dropped.
fn stream_pages<K: Send + Sync + 'static>(
    doc: Arc<PdfiumDocument>,
    document: DocumentId,
    config: &ConversionConfig,
    keep_alive: K,
) -> Result<PageStream, Pdf2MdError> {
    let indices = selected_pages(config, doc.page_count())?;
    let (ocr, store, refiner) = collaborators(config);
    if let Some(ref cb) = config.progress_callback {
        cb.on_conversion_start(indices.len());
    }

    let config = Arc::new(config.clone());
    let worker = PageWorker {
        source: doc.clone(),
        rasterizer: doc,
        ocr,
        store,
        document,
        config: Arc::clone(&config),
    };
    let total = indices.len();
    let concurrency = config.concurrency;
    let cancel = CancelToken::new();
    let keep_alive = Arc::new(keep_alive);

    let s = stream::iter(indices)
        .map(move |index| {
            let worker = worker.clone();
            let cancel = cancel.clone();
            let keep_alive = Arc::clone(&keep_alive);
            async move {
                let page = run_page(worker, index, total, cancel).await;
                drop(keep_alive);
                page
            }
        })
        .buffer_unordered(concurrency)
        .filter_map(futures::future::ready)
        .then(move |page| {
            let config = Arc::clone(&config);
            let refiner = Arc::clone(&refiner);
            async move { finish_page(page, &config, refiner.as_ref()).await.0 }
        });

    Ok(Box::pin(s))
}
