//! Per-page work: load, classify, extract, recognise, persist assets.
//!
//! A [`PageWorker`] is cloned into every page task. It owns shared handles
//! to the collaborators and never touches another page's state; the only
//! shared mutable resource is the asset store, and ids are disjoint per
//! page.
//!
//! [`finish_page`] turns an [`ExtractedPage`] into a [`PageResult`]
//! (structuring, refinement, inline diagnostics). It is pure apart from
//! the refiner call.

use crate::config::ConversionConfig;
use crate::error::PageError;
use crate::model::{Asset, DocumentId, Fragment, OcrSpan, Page, PageClass, TextSpan};
use crate::output::PageResult;
use crate::pipeline::assets::{detect_equations, persist_page_assets, AssetStore, PageAssetInput};
use crate::pipeline::classify::classify;
use crate::pipeline::extract::text_spans;
use crate::pipeline::ocr::{drop_overlapping, recognize_page, OcrBackend};
use crate::pipeline::refine::{apply_refiner, StructureRefiner};
use crate::pipeline::source::{PageSource, Rasterizer};
use crate::pipeline::structure::{diagnostic_blocks, reading_order, structure_page};
use image::DynamicImage;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Collaborators and settings shared by all page tasks of one document.
#[derive(Clone)]
pub struct PageWorker {
    pub source: Arc<dyn PageSource>,
    pub rasterizer: Arc<dyn Rasterizer>,
    pub ocr: Arc<dyn OcrBackend>,
    pub store: Arc<dyn AssetStore>,
    pub document: DocumentId,
    pub config: Arc<ConversionConfig>,
}

/// A page after extraction, before structuring.
#[derive(Debug, Clone)]
pub struct ExtractedPage {
    pub page: Page,
    pub assets: Vec<Asset>,
    pub errors: Vec<PageError>,
    pub ocr_spans: usize,
    pub low_confidence_spans: usize,
    pub duration_ms: u64,
}

impl ExtractedPage {
    fn failed(index: usize, error: PageError, start: Instant) -> Self {
        Self {
            page: Page {
                index,
                class: PageClass::Mixed,
                fragments: Vec::new(),
            },
            assets: Vec::new(),
            errors: vec![error],
            ocr_spans: 0,
            low_confidence_spans: 0,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    /// A page whose task died before producing anything.
    pub(crate) fn failed_with(index: usize, error: PageError) -> Self {
        Self::failed(index, error, Instant::now())
    }

    fn has_failures(&self) -> bool {
        self.errors.iter().any(|e| !e.is_soft())
    }
}

impl PageWorker {
    /// Extract page `index` (0-based). Never fails: every problem is
    /// recorded on the returned page.
    pub async fn extract(&self, index: usize, total_pages: usize) -> ExtractedPage {
        let start = Instant::now();
        let page_num = index + 1;
        let config = self.config.as_ref();
        if let Some(ref cb) = config.progress_callback {
            cb.on_page_start(page_num, total_pages);
        }

        let raw = match self.source.load_page(index).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Page {}: {}", page_num, e);
                let page = ExtractedPage::failed(index, e, start);
                self.report(&page, total_pages);
                return page;
            }
        };

        let class = classify(&raw.metrics, config.is_ocr_forced(index), config);
        if let Some(ref cb) = config.progress_callback {
            cb.on_page_classified(page_num, class);
        }
        let plan = class.plan();
        let mut errors: Vec<PageError> = Vec::new();

        let text = if plan.native_text {
            text_spans(&raw.runs, config)
        } else {
            Vec::new()
        };
        let mut run_ocr = plan.ocr;
        if plan.native_text && text.is_empty() {
            debug!("Page {}: text layer empty, falling back to OCR", page_num);
            errors.push(PageError::ExtractionEmpty { page: page_num });
            run_ocr = true;
        }

        let mut raster: Option<DynamicImage> = None;
        let mut render_attempted = false;
        let mut ocr: Vec<OcrSpan> = Vec::new();
        if run_ocr {
            render_attempted = true;
            raster = self.render(index, &mut errors).await;
            if let Some(ref image) = raster {
                match recognize_page(
                    self.ocr.as_ref(),
                    image,
                    raw.metrics.width,
                    config.ocr_timeout_secs,
                    config.ocr_confidence_floor,
                )
                .await
                {
                    Ok(spans) if class == PageClass::Mixed => ocr = drop_overlapping(spans, &text),
                    Ok(spans) => ocr = spans,
                    Err(e) => {
                        warn!("Page {}: OCR failed: {}", page_num, e);
                        errors.push(PageError::RecognitionFailure {
                            page: page_num,
                            detail: e.to_string(),
                        });
                    }
                }
            }
        }

        let equations = detect_equations(
            &text,
            &ocr,
            config.equation_symbol_density,
            config.equation_max_ocr_confidence,
        );
        if !equations.is_empty() && !render_attempted {
            raster = self.render(index, &mut errors).await;
        }

        let persisted = persist_page_assets(
            PageAssetInput {
                document: &self.document,
                page_index: index,
                class,
                page_width: raw.metrics.width,
                page_height: raw.metrics.height,
                images: &raw.images,
                equations: &equations,
                raster: raster.as_ref(),
            },
            self.store.as_ref(),
        )
        .await;
        let (assets, refs) = match persisted {
            Ok(p) => (p.assets, p.refs),
            Err(e) => {
                warn!("Page {}: assets omitted: {}", page_num, e);
                errors.push(PageError::AssetPersistFailure {
                    page: page_num,
                    detail: e.to_string(),
                });
                (Vec::new(), Vec::new())
            }
        };

        // Equation spans never render as text, even when their crop failed.
        let eq_text: HashSet<usize> = equations
            .iter()
            .flat_map(|r| r.text_members.iter().copied())
            .collect();
        let eq_ocr: HashSet<usize> = equations
            .iter()
            .flat_map(|r| r.ocr_members.iter().copied())
            .collect();

        let ocr_spans = ocr.len();
        let low_confidence_spans = ocr.iter().filter(|s| s.low_confidence).count();
        let fragments = build_fragments(text, ocr, &eq_text, &eq_ocr, refs);

        let extracted = ExtractedPage {
            page: Page {
                index,
                class,
                fragments: reading_order(fragments),
            },
            assets,
            errors,
            ocr_spans,
            low_confidence_spans,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        info!(
            "Page {}: {} → {} fragments, {} assets in {}ms",
            page_num,
            class,
            extracted.page.fragments.len(),
            extracted.assets.len(),
            extracted.duration_ms
        );
        self.report(&extracted, total_pages);
        extracted
    }

    async fn render(&self, index: usize, errors: &mut Vec<PageError>) -> Option<DynamicImage> {
        match self.rasterizer.render(index, self.config.dpi).await {
            Ok(image) => Some(image),
            Err(e) => {
                warn!("Page {}: {}", index + 1, e);
                errors.push(e);
                None
            }
        }
    }

    fn report(&self, page: &ExtractedPage, total_pages: usize) {
        let Some(ref cb) = self.config.progress_callback else {
            return;
        };
        let page_num = page.page.number();
        if page.has_failures() {
            let message = page
                .errors
                .iter()
                .filter(|e| !e.is_soft())
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            cb.on_page_error(page_num, total_pages, &message);
        } else {
            cb.on_page_complete(page_num, total_pages, page.page.fragments.len());
        }
    }
}

fn build_fragments(
    text: Vec<TextSpan>,
    ocr: Vec<OcrSpan>,
    eq_text: &HashSet<usize>,
    eq_ocr: &HashSet<usize>,
    refs: Vec<crate::model::AssetRef>,
) -> Vec<Fragment> {
    let text = text
        .into_iter()
        .enumerate()
        .filter(|(i, _)| !eq_text.contains(i))
        .map(|(_, s)| Fragment::Text(s));
    let ocr = ocr
        .into_iter()
        .enumerate()
        .filter(|(i, _)| !eq_ocr.contains(i))
        .map(|(_, s)| Fragment::Ocr(s));
    text.chain(ocr).chain(refs.into_iter().map(Fragment::Asset)).collect()
}

/// Structure, refine and annotate an extracted page.
///
/// Diagnostics for hard errors lead the page's blocks so a reader sees
/// them where the content is missing.
pub async fn finish_page(
    extracted: ExtractedPage,
    config: &ConversionConfig,
    refiner: &dyn StructureRefiner,
) -> (PageResult, Vec<Asset>) {
    let page_num = extracted.page.number();
    let blocks = structure_page(&extracted.page, config);
    let blocks = apply_refiner(refiner, page_num, blocks).await;

    let mut all = diagnostic_blocks(
        page_num,
        &extracted.errors,
        extracted.page.fragments.is_empty(),
    );
    all.extend(blocks);

    (
        PageResult {
            page_num,
            class: extracted.page.class,
            fragment_count: extracted.page.fragments.len(),
            blocks: all,
            errors: extracted.errors,
            duration_ms: extracted.duration_ms,
        },
        extracted.assets,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AssetId, AssetKind, BBox, BlockKind};
    use crate::pipeline::assets::{AssetStoreError, InlineAssetStore};
    use crate::pipeline::ocr::RecognitionFailure;
    use crate::pipeline::refine::NoopRefiner;
    use crate::pipeline::source::{GlyphRun, RawPage};
    use async_trait::async_trait;

    struct OnePage(RawPage);

    #[async_trait]
    impl PageSource for OnePage {
        fn page_count(&self) -> usize {
            1
        }
        async fn load_page(&self, _index: usize) -> Result<RawPage, PageError> {
            Ok(self.0.clone())
        }
    }

    struct Blank;

    #[async_trait]
    impl Rasterizer for Blank {
        async fn render(&self, _index: usize, _dpi: u32) -> Result<DynamicImage, PageError> {
            Ok(DynamicImage::new_rgb8(612, 792))
        }
    }

    struct FixedOcr(Vec<OcrSpan>);

    #[async_trait]
    impl OcrBackend for FixedOcr {
        async fn recognize(
            &self,
            _image: &DynamicImage,
        ) -> Result<Vec<OcrSpan>, RecognitionFailure> {
            Ok(self.0.clone())
        }
    }

    struct BrokenOcr;

    #[async_trait]
    impl OcrBackend for BrokenOcr {
        async fn recognize(
            &self,
            _image: &DynamicImage,
        ) -> Result<Vec<OcrSpan>, RecognitionFailure> {
            Err(RecognitionFailure::Parse("garbage".into()))
        }
    }

    struct FullDisk;

    #[async_trait]
    impl AssetStore for FullDisk {
        async fn put(
            &self,
            id: &AssetId,
            _bytes: Vec<u8>,
            _kind: AssetKind,
        ) -> Result<AssetId, AssetStoreError> {
            Err(AssetStoreError::Io {
                path: format!("{id}.png").into(),
                source: std::io::Error::other("no space left on device"),
            })
        }
        fn resolve(&self, id: &AssetId) -> Result<String, AssetStoreError> {
            Err(AssetStoreError::Unknown(id.clone()))
        }
    }

    fn worker(raw: RawPage, ocr: Arc<dyn OcrBackend>, store: Arc<dyn AssetStore>) -> PageWorker {
        PageWorker {
            source: Arc::new(OnePage(raw)),
            rasterizer: Arc::new(Blank),
            ocr,
            store,
            document: DocumentId::new("doc"),
            config: Arc::new(ConversionConfig::default()),
        }
    }

    fn native_page() -> RawPage {
        let mut runs: Vec<GlyphRun> = (0..6)
            .map(|i| {
                GlyphRun::new(
                    "The quick brown fox jumps over the lazy dog again",
                    BBox::new(72.0, 100.0 + 14.0 * i as f32, 400.0, 12.0),
                    11.0,
                )
            })
            .collect();
        runs.push(GlyphRun::new("∑ xᵢ = ∫ f(x) dx", BBox::new(200.0, 300.0, 120.0, 14.0), 11.0));
        RawPage::new(0, 612.0, 792.0, runs, vec![])
    }

    fn ocr_line(text: &str, confidence: f32) -> OcrSpan {
        OcrSpan {
            text: text.into(),
            bbox: BBox::new(100.0, 100.0, 300.0, 30.0),
            confidence,
            low_confidence: false,
        }
    }

    #[tokio::test]
    async fn native_page_skips_ocr_and_extracts_equation() {
        let ocr = Arc::new(FixedOcr(vec![ocr_line("should not appear", 0.9)]));
        let w = worker(native_page(), ocr, Arc::new(InlineAssetStore::new()));
        let page = w.extract(0, 1).await;

        assert_eq!(page.page.class, PageClass::NativeText);
        assert_eq!(page.ocr_spans, 0);
        assert_eq!(page.assets.len(), 1);
        assert_eq!(page.assets[0].kind, AssetKind::Equation);
        assert!(page.errors.is_empty());
        assert!(page
            .page
            .fragments
            .iter()
            .all(|f| f.text().map_or(true, |t| !t.contains('∑'))));
    }

    #[tokio::test]
    async fn scanned_page_runs_ocr() {
        let raw = RawPage::new(0, 612.0, 792.0, vec![], vec![]);
        let ocr = Arc::new(FixedOcr(vec![ocr_line("Scanned words", 0.6)]));
        let w = worker(raw, ocr, Arc::new(InlineAssetStore::new()));
        let page = w.extract(0, 1).await;

        assert_eq!(page.page.class, PageClass::Mixed);
        assert_eq!(page.ocr_spans, 1);
        assert_eq!(page.page.fragments.len(), 1);
    }

    #[tokio::test]
    async fn ocr_failure_becomes_diagnostic() {
        let raw = RawPage::new(0, 612.0, 792.0, vec![], vec![]);
        let w = worker(raw, Arc::new(BrokenOcr), Arc::new(InlineAssetStore::new()));
        let extracted = w.extract(0, 1).await;
        assert!(extracted
            .errors
            .iter()
            .any(|e| matches!(e, PageError::RecognitionFailure { page: 1, .. })));

        let (result, _) = finish_page(extracted, &ConversionConfig::default(), &NoopRefiner).await;
        assert_eq!(result.blocks.len(), 1);
        assert_eq!(result.blocks[0].kind, BlockKind::Diagnostic);
        assert!(result.has_failures());
    }

    #[tokio::test]
    async fn asset_failure_keeps_text_and_hides_equation() {
        let w = worker(native_page(), Arc::new(BrokenOcr), Arc::new(FullDisk));
        let extracted = w.extract(0, 1).await;
        assert!(extracted.assets.is_empty());
        assert!(extracted
            .errors
            .iter()
            .any(|e| matches!(e, PageError::AssetPersistFailure { .. })));

        let (result, assets) =
            finish_page(extracted, &ConversionConfig::default(), &NoopRefiner).await;
        assert!(assets.is_empty());
        assert_eq!(result.blocks[0].kind, BlockKind::Diagnostic);
        assert!(!result.markdown().contains('∑'));
        assert!(result.markdown().contains("quick brown fox"));
    }
}
