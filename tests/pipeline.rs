//! Whole-pipeline tests over in-memory pages.
//!
//! Pages come from a fake [`PageSource`], rendering returns a blank canvas
//! and OCR returns canned lines, so these run without pdfium or tesseract.

use async_trait::async_trait;
use hybrid_pdf2md::{
    convert_with, BBox, BlockKind, CancelToken, ConversionConfig, ConversionConfigBuilder,
    ConversionOutput, ConversionProgressCallback, DocumentId, DocumentMetadata, GlyphRun,
    OcrBackend, OcrSpan, PageClass, PageError, PageSource, Pdf2MdError, Rasterizer, RawPage,
    RecognitionFailure,
};
use image::DynamicImage;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const WIDTH: f32 = 612.0;
const HEIGHT: f32 = 792.0;

// ── Fakes ────────────────────────────────────────────────────────────────────

struct MemoryPdf(Vec<RawPage>);

#[async_trait]
impl PageSource for MemoryPdf {
    fn page_count(&self) -> usize {
        self.0.len()
    }

    async fn load_page(&self, index: usize) -> Result<RawPage, PageError> {
        self.0.get(index).cloned().ok_or(PageError::LoadFailed {
            page: index + 1,
            detail: "no such page".into(),
        })
    }
}

/// Renders every page as a white canvas at 72 dpi, so pixel and point
/// coordinates coincide.
struct Canvas;

#[async_trait]
impl Rasterizer for Canvas {
    async fn render(&self, _index: usize, _dpi: u32) -> Result<DynamicImage, PageError> {
        Ok(DynamicImage::new_rgb8(WIDTH as u32, HEIGHT as u32))
    }
}

struct CannedOcr(Vec<OcrSpan>);

#[async_trait]
impl OcrBackend for CannedOcr {
    async fn recognize(&self, _image: &DynamicImage) -> Result<Vec<OcrSpan>, RecognitionFailure> {
        Ok(self.0.clone())
    }
}

/// Never answers; counts how many calls started and how many were dropped.
#[derive(Default)]
struct StalledOcr {
    entered: Arc<AtomicUsize>,
    released: Arc<AtomicUsize>,
}

struct Release(Arc<AtomicUsize>);

impl Drop for Release {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl OcrBackend for StalledOcr {
    async fn recognize(&self, _image: &DynamicImage) -> Result<Vec<OcrSpan>, RecognitionFailure> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        let _release = Release(Arc::clone(&self.released));
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(Vec::new())
    }
}

fn ocr_line(text: &str, y: f32, confidence: f32) -> OcrSpan {
    OcrSpan {
        text: text.into(),
        bbox: BBox::new(72.0, y, 400.0, 12.0),
        confidence,
        low_confidence: false,
    }
}

fn body_line(text: &str, y: f32) -> GlyphRun {
    GlyphRun::new(text, BBox::new(72.0, y, 400.0, 12.0), 11.0).with_font("Times")
}

/// Six wrapped lines of body text, dense enough to classify as native.
fn body(page: usize) -> Vec<GlyphRun> {
    (0..6)
        .map(|i| {
            body_line(
                &format!("Page {page} line {i} carries ordinary running text about the study"),
                100.0 + 14.0 * i as f32,
            )
        })
        .collect()
}

fn native_page(index: usize, mut runs: Vec<GlyphRun>) -> RawPage {
    runs.extend(body(index + 1));
    RawPage::new(index, WIDTH, HEIGHT, runs, vec![])
}

fn empty_page(index: usize) -> RawPage {
    RawPage::new(index, WIDTH, HEIGHT, vec![], vec![])
}

fn config() -> ConversionConfigBuilder {
    ConversionConfig::builder().concurrency(4)
}

/// Route library logs to the test harness; `RUST_LOG=debug` to see them.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn run(
    pages: Vec<RawPage>,
    config: &ConversionConfig,
) -> Result<ConversionOutput, Pdf2MdError> {
    init_tracing();
    let pdf = Arc::new(MemoryPdf(pages));
    convert_with(
        pdf,
        Arc::new(Canvas),
        DocumentId::new("paper"),
        DocumentMetadata::default(),
        config,
        &CancelToken::new(),
    )
    .await
}

// ── End to end ───────────────────────────────────────────────────────────────

fn introduction_page() -> RawPage {
    let runs = vec![
        GlyphRun::new("Introduction", BBox::new(72.0, 60.0, 200.0, 28.0), 24.0)
            .with_font("Helvetica-Bold"),
        body_line("Measurements were taken across four independent sites in total.", 100.0),
        body_line("Each site reported its values to the coordinating lab every week.", 114.0),
        body_line("The aggregate below summarises the collected values over all sites.", 128.0),
        body_line("Individual results are listed in the appendix for closer reading.", 142.0),
        GlyphRun::new("∑ xᵢ = ∫ f(x) dx", BBox::new(200.0, 200.0, 120.0, 14.0), 11.0)
            .with_font("Symbol"),
    ];
    RawPage::new(0, WIDTH, HEIGHT, runs, vec![])
}

#[tokio::test]
async fn native_and_scanned_pages_end_to_end() {
    let tmp = tempfile::tempdir().unwrap();
    let ocr = CannedOcr(vec![
        ocr_line("Results were recorded by hand on the night shift.", 100.0, 0.6),
        ocr_line("Every sample was checked twice before filing.", 114.0, 0.6),
    ]);
    let cfg = config()
        .force_ocr_pages(vec![2])
        .ocr_backend(Arc::new(ocr))
        .asset_dir(tmp.path())
        .asset_url_prefix("assets")
        .build()
        .unwrap();

    let out = run(vec![introduction_page(), empty_page(1)], &cfg).await.unwrap();

    assert_eq!(out.pages.len(), 2);
    assert_eq!(out.pages[0].class, PageClass::NativeText);
    assert_eq!(out.pages[1].class, PageClass::Scanned);
    assert!(out.pages.iter().all(|p| !p.has_failures()), "{:?}", out.pages);

    let md = &out.markdown;
    assert_eq!(md.matches("# Introduction").count(), 1, "{md}");
    assert!(md.starts_with("# Introduction\n"), "{md}");
    assert!(md.contains("Measurements were taken across four independent sites"));
    assert!(!md.contains('∑'), "equation text must not leak into prose:\n{md}");

    let equations: Vec<_> = out.pages[0]
        .blocks
        .iter()
        .filter(|b| b.kind == BlockKind::Equation)
        .collect();
    assert_eq!(equations.len(), 1);
    let uri = "assets/paper_page1_eq1.png";
    assert!(equations[0].markdown.contains(uri));
    assert_eq!(out.asset_uris, vec![uri.to_string()]);
    assert!(tmp.path().join("paper_page1_eq1.png").exists());

    assert!(md.contains(
        "Results were recorded by hand on the night shift. Every sample was checked twice"
    ));
    assert!(!md.contains("<mark"), "0.6 is above the default floor");
    assert_eq!(out.stats.native_pages, 1);
    assert_eq!(out.stats.scanned_pages, 1);
    assert_eq!(out.stats.ocr_spans, 2);
    assert_eq!(out.stats.equation_assets, 1);
}

#[tokio::test]
async fn every_fragment_lands_in_a_block() {
    let cfg = config()
        .ocr_backend(Arc::new(CannedOcr(vec![])))
        .build()
        .unwrap();
    let out = run(vec![introduction_page()], &cfg).await.unwrap();

    let page = &out.pages[0];
    let placed: usize = page.blocks.iter().map(|b| b.fragment_count).sum();
    assert_eq!(placed, page.fragment_count);
    // heading + four body lines + equation reference
    assert_eq!(page.fragment_count, 6);
}

// ── Running headers and footers ──────────────────────────────────────────────

fn with_footer(pages: usize, footer_on: &[usize]) -> Vec<RawPage> {
    (0..pages)
        .map(|i| {
            let extra = if footer_on.contains(&i) {
                vec![body_line("Confidential draft", 760.0)]
            } else {
                vec![]
            };
            native_page(i, extra)
        })
        .collect()
}

#[tokio::test]
async fn footer_on_most_pages_is_kept_once() {
    let cfg = config()
        .ocr_backend(Arc::new(CannedOcr(vec![])))
        .build()
        .unwrap();
    let out = run(with_footer(5, &[0, 1, 2, 3]), &cfg).await.unwrap();

    assert_eq!(out.markdown.matches("Confidential draft").count(), 1);
    assert_eq!(out.stats.suppressed_blocks, 3);
    for page in 1..=5 {
        assert!(out.markdown.contains(&format!("Page {page} line 0")));
    }
}

#[tokio::test]
async fn footer_below_threshold_is_kept_everywhere() {
    let cfg = config()
        .ocr_backend(Arc::new(CannedOcr(vec![])))
        .build()
        .unwrap();
    let out = run(with_footer(5, &[1, 3]), &cfg).await.unwrap();

    assert_eq!(out.markdown.matches("Confidential draft").count(), 2);
    assert_eq!(out.stats.suppressed_blocks, 0);
}

// ── OCR confidence ───────────────────────────────────────────────────────────

#[tokio::test]
async fn low_confidence_ocr_is_annotated_not_dropped() {
    let ocr = CannedOcr(vec![
        ocr_line("faint smudged words", 100.0, 0.10),
        ocr_line("crisp printed words", 300.0, 0.95),
    ]);
    let cfg = config()
        .force_ocr(true)
        .ocr_backend(Arc::new(ocr))
        .build()
        .unwrap();
    let out = run(vec![empty_page(0)], &cfg).await.unwrap();

    let md = &out.markdown;
    assert!(
        md.contains("<mark data-ocr-confidence=\"0.10\">faint smudged words</mark>"),
        "{md}"
    );
    assert!(md.contains("crisp printed words"));
    assert!(!md.contains("0.95"));
    assert_eq!(out.stats.low_confidence_spans, 1);
}

// ── Failure handling ─────────────────────────────────────────────────────────

struct FailingOcr;

#[async_trait]
impl OcrBackend for FailingOcr {
    async fn recognize(&self, _image: &DynamicImage) -> Result<Vec<OcrSpan>, RecognitionFailure> {
        Err(RecognitionFailure::Exit {
            status: "exit status: 1".into(),
            stderr: "Error opening data file eng.traineddata".into(),
        })
    }
}

#[tokio::test]
async fn failed_page_does_not_abort_the_document() {
    let cfg = config()
        .force_ocr_pages(vec![2])
        .ocr_backend(Arc::new(FailingOcr))
        .build()
        .unwrap();
    let out = run(vec![native_page(0, vec![]), empty_page(1), native_page(2, vec![])], &cfg)
        .await
        .unwrap();

    assert_eq!(out.pages.len(), 3);
    assert!(!out.pages[0].has_failures());
    assert!(out.pages[1].has_failures());
    assert_eq!(out.pages[1].blocks[0].kind, BlockKind::Diagnostic);
    assert!(out.markdown.contains("> [!WARNING]"));
    assert!(out.markdown.contains("Page 3 line 5"));
    assert_eq!(out.stats.failed_pages, 1);

    match out.into_result() {
        Err(Pdf2MdError::PartialFailure { failed: 1, total: 3 }) => {}
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test]
async fn empty_page_yields_no_blocks() {
    let cfg = config()
        .ocr_backend(Arc::new(CannedOcr(vec![])))
        .build()
        .unwrap();
    let out = run(vec![empty_page(0)], &cfg).await.unwrap();

    assert!(out.pages[0].blocks.is_empty());
    assert!(!out.pages[0].has_failures());
    assert!(out.markdown.trim().is_empty());
    assert!(out.asset_uris.is_empty());
}

#[tokio::test]
async fn cancelled_conversion_returns_cancelled() {
    let cfg = config()
        .ocr_backend(Arc::new(CannedOcr(vec![])))
        .build()
        .unwrap();
    let cancel = CancelToken::new();
    cancel.cancel();

    let result = convert_with(
        Arc::new(MemoryPdf(vec![native_page(0, vec![]), native_page(1, vec![])])),
        Arc::new(Canvas),
        DocumentId::new("paper"),
        DocumentMetadata::default(),
        &cfg,
        &cancel,
    )
    .await;
    assert!(matches!(result, Err(Pdf2MdError::Cancelled)));
}

#[tokio::test]
async fn cancelling_during_ocr_abandons_the_stalled_pages() {
    let ocr = Arc::new(StalledOcr::default());
    let counter = Arc::new(Counter::default());
    let cfg = config()
        .force_ocr_pages(vec![2, 3])
        .ocr_timeout_secs(3600)
        .ocr_backend(ocr.clone())
        .progress_callback(counter.clone())
        .build()
        .unwrap();
    let cancel = CancelToken::new();

    let entered = Arc::clone(&ocr.entered);
    let canceller = cancel.clone();
    tokio::spawn(async move {
        while entered.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });

    let pages = vec![native_page(0, vec![]), empty_page(1), empty_page(2)];
    let result = tokio::time::timeout(
        Duration::from_secs(10),
        convert_with(
            Arc::new(MemoryPdf(pages)),
            Arc::new(Canvas),
            DocumentId::new("paper"),
            DocumentMetadata::default(),
            &cfg,
            &cancel,
        ),
    )
    .await
    .expect("cancellation must not wait for the stalled OCR calls");
    assert!(matches!(result, Err(Pdf2MdError::Cancelled)));

    // Aborted page tasks drop their in-flight OCR futures.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(ocr.entered.load(Ordering::SeqCst), 2);
    assert_eq!(ocr.released.load(Ordering::SeqCst), 2);
    assert!(counter.completed.load(Ordering::SeqCst) <= 1);
    assert!(counter.totals.lock().unwrap().is_none());
}

// ── Determinism and progress ─────────────────────────────────────────────────

#[tokio::test]
async fn repeated_runs_are_identical() {
    let pages = || {
        let mut pages = with_footer(6, &[0, 1, 2, 3, 4, 5]);
        pages.push(introduction_page_at(6));
        pages
    };
    let cfg = config()
        .concurrency(8)
        .ocr_backend(Arc::new(CannedOcr(vec![])))
        .build()
        .unwrap();

    let first = run(pages(), &cfg).await.unwrap();
    for _ in 0..3 {
        let again = run(pages(), &cfg).await.unwrap();
        assert_eq!(again.markdown, first.markdown);
        assert_eq!(again.asset_uris, first.asset_uris);
    }
}

fn introduction_page_at(index: usize) -> RawPage {
    let mut page = introduction_page();
    page.index = index;
    page
}

#[derive(Default)]
struct Counter {
    started: AtomicUsize,
    classified: Mutex<Vec<(usize, PageClass)>>,
    completed: AtomicUsize,
    errors: AtomicUsize,
    totals: Mutex<Option<(usize, usize)>>,
}

impl ConversionProgressCallback for Counter {
    fn on_page_start(&self, _page_num: usize, _total_pages: usize) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn on_page_classified(&self, page_num: usize, class: PageClass) {
        self.classified.lock().unwrap().push((page_num, class));
    }

    fn on_page_complete(&self, _page_num: usize, _total_pages: usize, _fragment_count: usize) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    fn on_page_error(&self, _page_num: usize, _total_pages: usize, _error: &str) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }

    fn on_conversion_complete(&self, total_pages: usize, success_count: usize) {
        *self.totals.lock().unwrap() = Some((total_pages, success_count));
    }
}

#[tokio::test]
async fn progress_callback_sees_every_page() {
    let counter = Arc::new(Counter::default());
    let cfg = config()
        .force_ocr_pages(vec![3])
        .ocr_backend(Arc::new(CannedOcr(vec![ocr_line("Scanned text", 100.0, 0.9)])))
        .progress_callback(counter.clone())
        .build()
        .unwrap();

    run(vec![native_page(0, vec![]), native_page(1, vec![]), empty_page(2)], &cfg)
        .await
        .unwrap();

    assert_eq!(counter.started.load(Ordering::SeqCst), 3);
    assert_eq!(counter.completed.load(Ordering::SeqCst), 3);
    assert_eq!(counter.errors.load(Ordering::SeqCst), 0);
    let mut classified = counter.classified.lock().unwrap().clone();
    classified.sort_by_key(|(n, _)| *n);
    assert_eq!(
        classified,
        vec![
            (1, PageClass::NativeText),
            (2, PageClass::NativeText),
            (3, PageClass::Scanned)
        ]
    );
    assert_eq!(*counter.totals.lock().unwrap(), Some((3, 3)));
}

#[tokio::test]
async fn page_selection_limits_the_output() {
    let cfg = config()
        .pages(hybrid_pdf2md::PageSelection::Range(2, 3))
        .ocr_backend(Arc::new(CannedOcr(vec![])))
        .build()
        .unwrap();
    let out = run((0..4).map(|i| native_page(i, vec![])).collect(), &cfg)
        .await
        .unwrap();

    let nums: Vec<usize> = out.pages.iter().map(|p| p.page_num).collect();
    assert_eq!(nums, vec![2, 3]);
    assert_eq!(out.stats.skipped_pages, 2);
    assert!(!out.markdown.contains("Page 1 line"));
    assert!(out.markdown.contains("Page 2 line"));
}
