//! Configuration types for hybrid PDF-to-Markdown conversion.
//!
//! All conversion behaviour is controlled through [`ConversionConfig`], built
//! via its [`ConversionConfigBuilder`]. Thresholds for classification,
//! structuring and header/footer suppression are plain fields with defaults;
//! collaborators (OCR backend, asset store, refiner, progress callback) are
//! injected as trait objects so no stage reaches for global state.

use crate::error::Pdf2MdError;
use crate::pipeline::assets::AssetStore;
use crate::pipeline::ocr::OcrBackend;
use crate::pipeline::refine::StructureRefiner;
use crate::progress::ProgressCallback;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Configuration for a PDF-to-Markdown conversion.
///
/// Built via [`ConversionConfig::builder()`] or using
/// [`ConversionConfig::default()`].
///
/// # Example
/// ```rust
/// use hybrid_pdf2md::ConversionConfig;
///
/// let config = ConversionConfig::builder()
///     .dpi(200)
///     .concurrency(4)
///     .ocr_language("eng+deu")
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct ConversionConfig {
    // ── Rendering ────────────────────────────────────────────────────────
    /// DPI at which pages are rasterised before recognition. Range: 72–600.
    /// Default: 300.
    pub dpi: u32,

    /// Cap on either rendered dimension in pixels. Default: 5000.
    ///
    /// Applied after DPI scaling; the other dimension shrinks proportionally.
    pub max_rendered_pixels: u32,

    /// Maximum number of pages processed at once. Default: available CPUs.
    pub concurrency: usize,

    /// PDF user password for encrypted documents.
    pub password: Option<String>,

    /// Page selection. Default: All pages.
    pub pages: PageSelection,

    // ── Classification ───────────────────────────────────────────────────
    /// A page whose text boxes cover more than this fraction of its area is
    /// `native-text`. Default: 0.05.
    pub native_text_coverage: f32,

    /// Text coverage below which a page may be `scanned`. Default: 0.005.
    pub scanned_text_coverage: f32,

    /// Image coverage at or above which a low-text page is `scanned`.
    /// Default: 0.5.
    pub scanned_image_coverage: f32,

    /// Pages with fewer extractable characters are never `native-text`.
    /// Default: 50.
    pub min_native_chars: usize,

    /// Run OCR on every page regardless of classification. Default: false.
    pub force_ocr: bool,

    /// 1-based pages on which OCR is forced.
    pub force_ocr_pages: Vec<usize>,

    // ── Text extraction ──────────────────────────────────────────────────
    /// A horizontal gap wider than `column_gap_factor × font size` splits a
    /// line into separate spans. Default: 2.0.
    pub column_gap_factor: f32,

    // ── OCR ──────────────────────────────────────────────────────────────
    /// Spans below this confidence are kept but flagged. Default: 0.5.
    pub ocr_confidence_floor: f32,

    /// Per-page OCR timeout in seconds. Default: 120.
    pub ocr_timeout_secs: u64,

    /// Tesseract language string, e.g. `"eng"` or `"eng+fra"`. Default: `"eng"`.
    pub ocr_language: String,

    /// Path to the tesseract executable. Default: `"tesseract"` on `PATH`.
    pub tesseract_path: PathBuf,

    /// Custom OCR backend. Takes precedence over the tesseract settings.
    pub ocr_backend: Option<Arc<dyn OcrBackend>>,

    // ── Assets ───────────────────────────────────────────────────────────
    /// Minimum share of non-whitespace characters that must be math symbols
    /// for a span to be treated as an equation. Default: 0.35.
    pub equation_symbol_density: f32,

    /// OCR spans only count as equations below this confidence. Default: 0.7.
    pub equation_max_ocr_confidence: f32,

    /// Directory assets are written to. When unset, assets are embedded as
    /// `data:` URIs.
    pub asset_dir: Option<PathBuf>,

    /// Prefix for asset URIs when `asset_dir` is set. Default: `"assets"`.
    pub asset_url_prefix: String,

    /// Custom asset store. Takes precedence over `asset_dir`.
    pub asset_store: Option<Arc<dyn AssetStore>>,

    /// Explicit document id. When unset it is derived from the file stem and
    /// the content hash.
    pub document_id: Option<String>,

    // ── Structuring ──────────────────────────────────────────────────────
    /// Font size / page median ratio at which a line becomes a heading.
    /// Default: 1.2.
    pub heading_size_ratio: f32,

    /// Deepest heading level emitted. Range: 1–6. Default: 4.
    pub max_heading_level: u8,

    /// Vertical gap, in multiples of the median line height, that starts a
    /// new paragraph. Default: 0.8.
    pub paragraph_gap_factor: f32,

    // ── Assembly ─────────────────────────────────────────────────────────
    /// A single-line block appearing on at least this fraction of pages is
    /// treated as a running header/footer. Default: 0.8.
    pub header_footer_fraction: f32,

    /// Page separator in assembled output. Default: None.
    pub page_separator: PageSeparator,

    /// Include YAML front-matter with document metadata. Default: false.
    pub include_metadata: bool,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,

    // ── Refinement ───────────────────────────────────────────────────────
    /// Custom structure refiner. Takes precedence over `refine_with_llm`.
    pub refiner: Option<Arc<dyn StructureRefiner>>,

    /// Run the LLM refinement pass over each page's blocks. Default: false.
    pub refine_with_llm: bool,

    /// LLM model identifier, e.g. "gpt-4.1-nano". If None, uses provider default.
    pub model: Option<String>,

    /// LLM provider name (e.g. "openai", "anthropic", "ollama").
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature for refinement. Default: 0.0.
    pub temperature: f32,

    /// Maximum tokens the refiner may generate per page. Default: 4096.
    pub max_tokens: usize,

    /// Retries on a transient refiner failure. Default: 2.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds, doubled per attempt. Default: 500.
    pub retry_backoff_ms: u64,

    /// Per-call refiner timeout in seconds. Default: 60.
    pub api_timeout_secs: u64,

    /// Custom refinement system prompt.
    pub refine_prompt: Option<String>,

    /// Per-page progress events.
    pub progress_callback: Option<ProgressCallback>,
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            dpi: 300,
            max_rendered_pixels: 5000,
            concurrency: default_concurrency(),
            password: None,
            pages: PageSelection::default(),
            native_text_coverage: 0.05,
            scanned_text_coverage: 0.005,
            scanned_image_coverage: 0.5,
            min_native_chars: 50,
            force_ocr: false,
            force_ocr_pages: Vec::new(),
            column_gap_factor: 2.0,
            ocr_confidence_floor: 0.5,
            ocr_timeout_secs: 120,
            ocr_language: "eng".to_string(),
            tesseract_path: PathBuf::from("tesseract"),
            ocr_backend: None,
            equation_symbol_density: 0.35,
            equation_max_ocr_confidence: 0.7,
            asset_dir: None,
            asset_url_prefix: "assets".to_string(),
            asset_store: None,
            document_id: None,
            heading_size_ratio: 1.2,
            max_heading_level: 4,
            paragraph_gap_factor: 0.8,
            header_footer_fraction: 0.8,
            page_separator: PageSeparator::default(),
            include_metadata: false,
            download_timeout_secs: 120,
            refiner: None,
            refine_with_llm: false,
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.0,
            max_tokens: 4096,
            max_retries: 2,
            retry_backoff_ms: 500,
            api_timeout_secs: 60,
            refine_prompt: None,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for ConversionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversionConfig")
            .field("dpi", &self.dpi)
            .field("max_rendered_pixels", &self.max_rendered_pixels)
            .field("concurrency", &self.concurrency)
            .field("pages", &self.pages)
            .field("native_text_coverage", &self.native_text_coverage)
            .field("scanned_text_coverage", &self.scanned_text_coverage)
            .field("scanned_image_coverage", &self.scanned_image_coverage)
            .field("force_ocr", &self.force_ocr)
            .field("force_ocr_pages", &self.force_ocr_pages)
            .field("ocr_confidence_floor", &self.ocr_confidence_floor)
            .field("ocr_language", &self.ocr_language)
            .field("ocr_backend", &self.ocr_backend.as_ref().map(|_| "<dyn OcrBackend>"))
            .field("asset_dir", &self.asset_dir)
            .field("asset_store", &self.asset_store.as_ref().map(|_| "<dyn AssetStore>"))
            .field("heading_size_ratio", &self.heading_size_ratio)
            .field("max_heading_level", &self.max_heading_level)
            .field("header_footer_fraction", &self.header_footer_fraction)
            .field("page_separator", &self.page_separator)
            .field("refiner", &self.refiner.as_ref().map(|_| "<dyn StructureRefiner>"))
            .field("refine_with_llm", &self.refine_with_llm)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .finish()
    }
}

impl ConversionConfig {
    /// Create a new builder for `ConversionConfig`.
    pub fn builder() -> ConversionConfigBuilder {
        ConversionConfigBuilder {
            config: Self::default(),
        }
    }

    /// True when OCR is forced for the given 0-based page index.
    pub fn is_ocr_forced(&self, page_index: usize) -> bool {
        self.force_ocr || self.force_ocr_pages.contains(&(page_index + 1))
    }
}

/// Builder for [`ConversionConfig`].
#[derive(Debug)]
pub struct ConversionConfigBuilder {
    config: ConversionConfig,
}

impl ConversionConfigBuilder {
    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 600);
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn pages(mut self, selection: PageSelection) -> Self {
        self.config.pages = selection;
        self
    }

    pub fn native_text_coverage(mut self, v: f32) -> Self {
        self.config.native_text_coverage = v.clamp(0.0, 1.0);
        self
    }

    pub fn scanned_text_coverage(mut self, v: f32) -> Self {
        self.config.scanned_text_coverage = v.clamp(0.0, 1.0);
        self
    }

    pub fn scanned_image_coverage(mut self, v: f32) -> Self {
        self.config.scanned_image_coverage = v.clamp(0.0, 1.0);
        self
    }

    pub fn min_native_chars(mut self, n: usize) -> Self {
        self.config.min_native_chars = n;
        self
    }

    pub fn force_ocr(mut self, v: bool) -> Self {
        self.config.force_ocr = v;
        self
    }

    pub fn force_ocr_pages(mut self, pages: Vec<usize>) -> Self {
        self.config.force_ocr_pages = pages;
        self
    }

    pub fn column_gap_factor(mut self, v: f32) -> Self {
        self.config.column_gap_factor = v.max(0.5);
        self
    }

    pub fn ocr_confidence_floor(mut self, v: f32) -> Self {
        self.config.ocr_confidence_floor = v.clamp(0.0, 1.0);
        self
    }

    pub fn ocr_timeout_secs(mut self, secs: u64) -> Self {
        self.config.ocr_timeout_secs = secs.max(1);
        self
    }

    pub fn ocr_language(mut self, lang: impl Into<String>) -> Self {
        self.config.ocr_language = lang.into();
        self
    }

    pub fn tesseract_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.tesseract_path = path.into();
        self
    }

    pub fn ocr_backend(mut self, backend: Arc<dyn OcrBackend>) -> Self {
        self.config.ocr_backend = Some(backend);
        self
    }

    pub fn equation_symbol_density(mut self, v: f32) -> Self {
        self.config.equation_symbol_density = v.clamp(0.0, 1.0);
        self
    }

    pub fn equation_max_ocr_confidence(mut self, v: f32) -> Self {
        self.config.equation_max_ocr_confidence = v.clamp(0.0, 1.0);
        self
    }

    pub fn asset_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.asset_dir = Some(dir.into());
        self
    }

    pub fn asset_url_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.asset_url_prefix = prefix.into();
        self
    }

    pub fn asset_store(mut self, store: Arc<dyn AssetStore>) -> Self {
        self.config.asset_store = Some(store);
        self
    }

    pub fn document_id(mut self, id: impl Into<String>) -> Self {
        self.config.document_id = Some(id.into());
        self
    }

    pub fn heading_size_ratio(mut self, v: f32) -> Self {
        self.config.heading_size_ratio = v.max(1.0);
        self
    }

    pub fn max_heading_level(mut self, level: u8) -> Self {
        self.config.max_heading_level = level.clamp(1, 6);
        self
    }

    pub fn paragraph_gap_factor(mut self, v: f32) -> Self {
        self.config.paragraph_gap_factor = v.max(0.0);
        self
    }

    pub fn header_footer_fraction(mut self, v: f32) -> Self {
        self.config.header_footer_fraction = v;
        self
    }

    pub fn page_separator(mut self, sep: PageSeparator) -> Self {
        self.config.page_separator = sep;
        self
    }

    pub fn include_metadata(mut self, v: bool) -> Self {
        self.config.include_metadata = v;
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn refiner(mut self, refiner: Arc<dyn StructureRefiner>) -> Self {
        self.config.refiner = Some(refiner);
        self
    }

    pub fn refine_with_llm(mut self, v: bool) -> Self {
        self.config.refine_with_llm = v;
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn refine_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.refine_prompt = Some(prompt.into());
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ConversionConfig, Pdf2MdError> {
        let c = &self.config;
        if c.dpi < 72 || c.dpi > 600 {
            return Err(Pdf2MdError::InvalidConfig(format!(
                "DPI must be 72–600, got {}",
                c.dpi
            )));
        }
        if c.concurrency == 0 {
            return Err(Pdf2MdError::InvalidConfig(
                "Concurrency must be ≥ 1".into(),
            ));
        }
        if c.scanned_text_coverage > c.native_text_coverage {
            return Err(Pdf2MdError::InvalidConfig(format!(
                "scanned_text_coverage ({}) must not exceed native_text_coverage ({})",
                c.scanned_text_coverage, c.native_text_coverage
            )));
        }
        if !(c.header_footer_fraction > 0.0 && c.header_footer_fraction <= 1.0) {
            return Err(Pdf2MdError::InvalidConfig(format!(
                "header_footer_fraction must be in (0, 1], got {}",
                c.header_footer_fraction
            )));
        }
        if let Some(p) = c.force_ocr_pages.iter().find(|&&p| p == 0) {
            return Err(Pdf2MdError::InvalidConfig(format!(
                "force_ocr_pages are 1-based, got {p}"
            )));
        }
        if c.ocr_language.trim().is_empty() {
            return Err(Pdf2MdError::InvalidConfig("ocr_language is empty".into()));
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Specifies which pages of the PDF to convert.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub enum PageSelection {
    /// Convert all pages (default).
    #[default]
    All,
    /// Convert a single page (1-indexed).
    Single(usize),
    /// Convert a contiguous range of pages (1-indexed, inclusive).
    Range(usize, usize),
    /// Convert specific pages (1-indexed, deduplicated).
    Set(Vec<usize>),
}

impl PageSelection {
    /// Expand the selection into a sorted, deduplicated list of 0-indexed page numbers.
    pub fn to_indices(&self, total_pages: usize) -> Vec<usize> {
        let mut indices: Vec<usize> = match self {
            PageSelection::All => (0..total_pages).collect(),
            PageSelection::Single(p) => {
                if *p >= 1 && *p <= total_pages {
                    vec![p - 1]
                } else {
                    vec![]
                }
            }
            PageSelection::Range(start, end) => {
                let s = (*start).max(1) - 1;
                let e = (*end).min(total_pages);
                (s..e).collect()
            }
            PageSelection::Set(pages) => pages
                .iter()
                .filter(|&&p| p >= 1 && p <= total_pages)
                .map(|p| p - 1)
                .collect(),
        };
        indices.sort_unstable();
        indices.dedup();
        indices
    }
}

/// How to separate pages in the assembled Markdown output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub enum PageSeparator {
    /// No separator; pages joined with a blank line. (default)
    #[default]
    None,
    /// Horizontal rule between pages.
    HorizontalRule,
    /// HTML comment with page number: `<!-- page N -->`.
    Comment,
    /// Custom string inserted between pages.
    Custom(String),
}

impl PageSeparator {
    /// Render the separator string placed before the given page (1-indexed).
    pub fn render(&self, page_num: usize) -> String {
        match self {
            PageSeparator::None => "\n\n".to_string(),
            PageSeparator::HorizontalRule => "\n\n---\n\n".to_string(),
            PageSeparator::Comment => format!("\n\n<!-- page {} -->\n\n", page_num),
            PageSeparator::Custom(s) => format!("\n\n{}\n\n", s),
        }
    }
}
