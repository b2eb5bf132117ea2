//! Raw page access.
//!
//! [`PageSource`] yields the positioned glyph runs and embedded images of a
//! page; [`Rasterizer`] renders it to pixels for OCR and equation crops.
//! [`crate::pipeline::pdfium::PdfiumDocument`] implements both. Tests supply
//! in-memory fakes.

use crate::error::PageError;
use crate::model::BBox;
use async_trait::async_trait;
use image::DynamicImage;
use std::collections::HashSet;

/// A run of characters sharing a font and baseline, as reported by the
/// text layer. Bounding box in page points, top-left origin.
#[derive(Debug, Clone, PartialEq)]
pub struct GlyphRun {
    pub text: String,
    pub bbox: BBox,
    pub font_size: f32,
    pub font_name: Option<String>,
}

impl GlyphRun {
    pub fn new(text: impl Into<String>, bbox: BBox, font_size: f32) -> Self {
        Self {
            text: text.into(),
            bbox,
            font_size,
            font_name: None,
        }
    }

    pub fn with_font(mut self, name: impl Into<String>) -> Self {
        self.font_name = Some(name.into());
        self
    }
}

/// A raster image object placed on the page.
#[derive(Debug, Clone)]
pub struct EmbeddedImage {
    pub bbox: BBox,
    pub image: DynamicImage,
}

/// Page-level measurements the classifier works from.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PageMetrics {
    pub width: f32,
    pub height: f32,
    /// Fraction of the page area covered by text boxes, in `[0, 1]`.
    pub text_coverage: f32,
    /// Fraction of the page area covered by images, in `[0, 1]`.
    pub image_coverage: f32,
    pub font_count: usize,
    /// Non-whitespace characters in the text layer.
    pub char_count: usize,
}

impl PageMetrics {
    pub fn has_text_layer(&self) -> bool {
        self.char_count > 0
    }
}

/// Everything extracted from one page before classification.
#[derive(Debug, Clone)]
pub struct RawPage {
    /// 0-based.
    pub index: usize,
    pub metrics: PageMetrics,
    pub runs: Vec<GlyphRun>,
    pub images: Vec<EmbeddedImage>,
}

impl RawPage {
    /// Build a page and derive its metrics from the runs and images.
    ///
    /// Coverage sums box areas clipped to the page, so overlapping boxes
    /// can over-count; the result is capped at 1.
    pub fn new(
        index: usize,
        width: f32,
        height: f32,
        runs: Vec<GlyphRun>,
        images: Vec<EmbeddedImage>,
    ) -> Self {
        let page_box = BBox::new(0.0, 0.0, width, height);
        let page_area = page_box.area();
        let coverage = |boxes: &mut dyn Iterator<Item = &BBox>| -> f32 {
            if page_area <= 0.0 {
                return 0.0;
            }
            let covered: f32 = boxes.map(|b| b.intersection_area(&page_box)).sum();
            (covered / page_area).min(1.0)
        };

        let text_coverage = coverage(
            &mut runs
                .iter()
                .filter(|r| !r.text.trim().is_empty())
                .map(|r| &r.bbox),
        );
        let image_coverage = coverage(&mut images.iter().map(|i| &i.bbox));
        let font_count = runs
            .iter()
            .filter_map(|r| r.font_name.as_deref())
            .collect::<HashSet<_>>()
            .len();
        let char_count = runs
            .iter()
            .map(|r| r.text.chars().filter(|c| !c.is_whitespace()).count())
            .sum();

        Self {
            index,
            metrics: PageMetrics {
                width,
                height,
                text_coverage,
                image_coverage,
                font_count,
                char_count,
            },
            runs,
            images,
        }
    }
}

/// Source of raw pages.
#[async_trait]
pub trait PageSource: Send + Sync {
    fn page_count(&self) -> usize;

    /// Load page `index` (0-based).
    async fn load_page(&self, index: usize) -> Result<RawPage, PageError>;
}

/// Renders a page to pixels.
#[async_trait]
pub trait Rasterizer: Send + Sync {
    /// Render page `index` (0-based) at `dpi`. The returned image may be
    /// smaller than the nominal size when a pixel cap applies.
    async fn render(&self, index: usize, dpi: u32) -> Result<DynamicImage, PageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_from_runs_and_images() {
        let runs = vec![
            GlyphRun::new("Hello", BBox::new(0.0, 0.0, 50.0, 10.0), 10.0).with_font("Times"),
            GlyphRun::new("   ", BBox::new(0.0, 20.0, 50.0, 10.0), 10.0).with_font("Times"),
            GlyphRun::new("x", BBox::new(0.0, 40.0, 10.0, 10.0), 10.0).with_font("Symbol"),
        ];
        let images = vec![EmbeddedImage {
            bbox: BBox::new(50.0, 50.0, 100.0, 100.0),
            image: DynamicImage::new_rgb8(1, 1),
        }];
        let page = RawPage::new(0, 100.0, 100.0, runs, images);
        let m = page.metrics;
        // whitespace run ignored: (500 + 100) / 10000
        assert!((m.text_coverage - 0.06).abs() < 1e-6);
        // image clipped to the page: 50×50
        assert!((m.image_coverage - 0.25).abs() < 1e-6);
        assert_eq!(m.font_count, 2);
        assert_eq!(m.char_count, 6);
        assert!(m.has_text_layer());
    }

    #[test]
    fn zero_sized_page_has_no_coverage() {
        let page = RawPage::new(0, 0.0, 0.0, vec![], vec![]);
        assert_eq!(page.metrics.text_coverage, 0.0);
        assert!(!page.metrics.has_text_layer());
    }
}
