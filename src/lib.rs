//! # hybrid-pdf2md
//!
//! Convert PDF documents to Markdown by reading the text layer where one
//! exists and falling back to OCR where it does not.
//!
//! ## Why this crate?
//!
//! Most PDFs carry a usable text layer, and reading it directly is fast and
//! exact. Scanned pages have none, and some born-digital pages mix both.
//! This crate classifies every page first and only rasterises and
//! recognises what the text layer cannot provide. Embedded figures and
//! equations become PNG assets referenced from the Markdown, so the output
//! stays lossless where the text cannot be.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF
//!  │
//!  ├─ 1. Input      resolve local file or download from URL
//!  ├─ 2. Classify   native-text | scanned | mixed, per page
//!  ├─ 3. Extract    glyph runs → positioned spans (pdfium)
//!  ├─ 4. OCR        rasterise + tesseract for scanned/mixed pages
//!  ├─ 5. Assets     embedded images and equation crops → PNG
//!  ├─ 6. Structure  reading order, headings, lists, tables
//!  ├─ 7. Refine     optional LLM pass over the blocks
//!  └─ 8. Assemble   header/footer suppression + GFM cleanup
//! ```
//!
//! Pages 2–5 run concurrently; assembly waits for every page.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hybrid_pdf2md::{convert, ConversionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ConversionConfig::builder()
//!         .asset_dir("out/assets")
//!         .build()?;
//!     let output = convert("document.pdf", &config).await?;
//!     println!("{}", output.markdown);
//!     eprintln!(
//!         "{} native / {} scanned / {} mixed pages",
//!         output.stats.native_pages, output.stats.scanned_pages, output.stats.mixed_pages
//!     );
//!     Ok(())
//! }
//! ```
//!
//! ## Degradation
//!
//! A page that fails to extract, recognise or persist an asset never aborts
//! the document. The failure is recorded in [`PageResult::errors`] and shown
//! inline as a `> [!WARNING]` block. Call [`ConversionOutput::into_result`]
//! to treat any such page as an error.
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdf2md` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! hybrid-pdf2md = { version = "0.1", default-features = false }
//! ```
//!
//! ## External tools
//!
//! | Tool | Needed for | Located via |
//! |------|------------|-------------|
//! | libpdfium | every conversion | `PDFIUM_LIB_PATH`, then system paths |
//! | tesseract | scanned and mixed pages | [`ConversionConfig::tesseract_path`] |
//! | LLM API key | `refine_with_llm` only | provider env vars (`OPENAI_API_KEY`, …) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod cancel;
pub mod config;
pub mod convert;
pub mod error;
pub mod model;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod stream;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use cancel::CancelToken;
pub use config::{ConversionConfig, ConversionConfigBuilder, PageSelection, PageSeparator};
pub use convert::{
    convert, convert_cancellable, convert_from_bytes, convert_sync, convert_to_file,
    convert_with, inspect, write_atomic,
};
pub use error::{PageError, Pdf2MdError};
pub use model::{
    Asset, AssetId, AssetKind, AssetRef, BBox, BlockKind, DocumentId, Fragment, OcrSpan, Page,
    PageClass, StructuredBlock, TextSpan,
};
pub use output::{ConversionOutput, ConversionStats, DocumentMetadata, PageResult};
pub use pipeline::assets::{AssetStore, AssetStoreError, DirectoryAssetStore, InlineAssetStore};
pub use pipeline::ocr::{OcrBackend, RecognitionFailure, TesseractBackend};
pub use pipeline::refine::{LlmRefiner, NoopRefiner, RefineError, StructureRefiner};
pub use pipeline::source::{EmbeddedImage, GlyphRun, PageMetrics, PageSource, Rasterizer, RawPage};
pub use progress::{ConversionProgressCallback, NoopProgressCallback, ProgressCallback};
pub use stream::{convert_stream, convert_stream_from_bytes, PageStream};
