//! Asset extraction and storage.
//!
//! Two kinds of region become assets: embedded raster images and equation
//! regions. Equation regions are spans whose characters are dominated by
//! math symbols (for OCR spans, only when recognition was also unsure).
//! Both are encoded as PNG and handed to an [`AssetStore`].
//!
//! Ids are `{document}_page{N}_{img|eq}{k}` with one counter per kind per
//! page, so concurrent page workers never write the same key.

use crate::model::{
    Asset, AssetId, AssetKind, AssetRef, BBox, DocumentId, OcrSpan, PageClass, TextSpan,
};
use crate::pipeline::encode;
use crate::pipeline::source::EmbeddedImage;
use async_trait::async_trait;
use image::DynamicImage;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info};

// ── Store ────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum AssetStoreError {
    #[error("failed to write asset '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("asset '{0}' was never stored")]
    Unknown(AssetId),

    #[error("failed to encode asset: {0}")]
    Encode(String),

    #[error("no page raster available to crop {0}")]
    MissingRaster(AssetId),
}

/// Persists asset bytes and maps ids to URIs.
///
/// Implementations must accept concurrent `put`s with distinct ids.
#[async_trait]
pub trait AssetStore: Send + Sync {
    /// Store PNG `bytes` under `id`, returning the id stored.
    async fn put(
        &self,
        id: &AssetId,
        bytes: Vec<u8>,
        kind: AssetKind,
    ) -> Result<AssetId, AssetStoreError>;

    /// URI under which a stored asset is reachable.
    fn resolve(&self, id: &AssetId) -> Result<String, AssetStoreError>;
}

/// Writes `{id}.png` files under a root directory.
#[derive(Debug)]
pub struct DirectoryAssetStore {
    root: PathBuf,
    url_prefix: String,
    written: Mutex<HashSet<AssetId>>,
}

impl DirectoryAssetStore {
    /// `url_prefix` is prepended to file names in URIs; empty for bare names.
    pub fn new(root: impl Into<PathBuf>, url_prefix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            url_prefix: url_prefix.into().trim_end_matches('/').to_string(),
            written: Mutex::new(HashSet::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file_name(id: &AssetId) -> String {
        format!("{}.png", id.as_str())
    }
}

#[async_trait]
impl AssetStore for DirectoryAssetStore {
    async fn put(
        &self,
        id: &AssetId,
        bytes: Vec<u8>,
        _kind: AssetKind,
    ) -> Result<AssetId, AssetStoreError> {
        let path = self.root.join(Self::file_name(id));
        let io_err = |source| AssetStoreError::Io {
            path: path.clone(),
            source,
        };

        tokio::fs::create_dir_all(&self.root).await.map_err(io_err)?;
        // Write then rename so readers never see a partial file.
        let tmp = path.with_extension("png.tmp");
        tokio::fs::write(&tmp, &bytes).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &path).await.map_err(io_err)?;

        debug!("Stored asset {} ({} bytes)", path.display(), bytes.len());
        self.written
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone());
        Ok(id.clone())
    }

    fn resolve(&self, id: &AssetId) -> Result<String, AssetStoreError> {
        let known = self
            .written
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(id);
        if !known {
            return Err(AssetStoreError::Unknown(id.clone()));
        }
        let name = Self::file_name(id);
        Ok(if self.url_prefix.is_empty() {
            name
        } else {
            format!("{}/{}", self.url_prefix, name)
        })
    }
}

/// Keeps assets in memory and resolves them to `data:` URIs.
#[derive(Debug, Default)]
pub struct InlineAssetStore {
    uris: Mutex<HashMap<AssetId, String>>,
}

impl InlineAssetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.uris.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AssetStore for InlineAssetStore {
    async fn put(
        &self,
        id: &AssetId,
        bytes: Vec<u8>,
        _kind: AssetKind,
    ) -> Result<AssetId, AssetStoreError> {
        let uri = encode::png_data_uri(&bytes);
        self.uris
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), uri);
        Ok(id.clone())
    }

    fn resolve(&self, id: &AssetId) -> Result<String, AssetStoreError> {
        self.uris
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| AssetStoreError::Unknown(id.clone()))
    }
}

// ── Equation detection ───────────────────────────────────────────────────

/// Characters that only appear in mathematical notation.
fn is_strong_math(c: char) -> bool {
    matches!(c as u32,
        0x2200..=0x22FF   // Mathematical Operators
        | 0x2A00..=0x2AFF // Supplemental Mathematical Operators
        | 0x27C0..=0x27EF // Misc Mathematical Symbols-A
        | 0x1D400..=0x1D7FF // Mathematical Alphanumeric Symbols
    )
}

fn is_math_char(c: char) -> bool {
    is_strong_math(c)
        || "=+-−×÷±∓<>^_{}()[]|/′″".contains(c)
        || matches!(c as u32,
            0x0391..=0x03C9   // Greek
            | 0x2070..=0x209F // super/subscripts
            | 0x1D62..=0x1D6A // subscript letters
            | 0x2100..=0x214F // Letterlike Symbols
            | 0x2190..=0x21FF // Arrows
        )
}

/// Share of non-whitespace characters that are math symbols, or `None` when
/// the text is too short or lacks any operator-only character.
pub fn math_density(text: &str) -> Option<f32> {
    let chars: Vec<char> = text.chars().filter(|c| !c.is_whitespace()).collect();
    if chars.len() < 4 || !chars.iter().any(|&c| is_strong_math(c)) {
        return None;
    }
    let math = chars.iter().filter(|&&c| is_math_char(c)).count();
    Some(math as f32 / chars.len() as f32)
}

pub fn is_equation_text(text: &str, min_density: f32) -> bool {
    math_density(text).is_some_and(|d| d >= min_density)
}

/// A group of spans forming one equation.
#[derive(Debug, Clone, PartialEq)]
pub struct EquationRegion {
    pub bbox: BBox,
    /// Indices into the page's text spans.
    pub text_members: Vec<usize>,
    /// Indices into the page's OCR spans.
    pub ocr_members: Vec<usize>,
}

/// Find equation regions among a page's spans.
///
/// Vertically adjacent candidates (gap under half a line) merge into one
/// region so multi-line displays become a single asset.
pub fn detect_equations(
    text: &[TextSpan],
    ocr: &[OcrSpan],
    min_density: f32,
    max_ocr_confidence: f32,
) -> Vec<EquationRegion> {
    let mut candidates: Vec<EquationRegion> = text
        .iter()
        .enumerate()
        .filter(|(_, s)| is_equation_text(&s.text, min_density))
        .map(|(i, s)| EquationRegion {
            bbox: s.bbox,
            text_members: vec![i],
            ocr_members: vec![],
        })
        .chain(
            ocr.iter()
                .enumerate()
                .filter(|(_, s)| {
                    s.confidence < max_ocr_confidence && is_equation_text(&s.text, min_density)
                })
                .map(|(i, s)| EquationRegion {
                    bbox: s.bbox,
                    text_members: vec![],
                    ocr_members: vec![i],
                }),
        )
        .collect();
    candidates.sort_by(|a, b| a.bbox.y.total_cmp(&b.bbox.y).then(a.bbox.x.total_cmp(&b.bbox.x)));

    let mut regions: Vec<EquationRegion> = Vec::new();
    for cand in candidates {
        if let Some(last) = regions.last_mut() {
            let line = last.bbox.height.min(cand.bbox.height).max(1.0);
            let vertical_gap = cand.bbox.y - last.bbox.bottom();
            let overlaps_x = cand.bbox.x < last.bbox.right() && cand.bbox.right() > last.bbox.x;
            if vertical_gap < 0.5 * line && overlaps_x {
                last.bbox = last.bbox.union(&cand.bbox);
                last.text_members.extend(cand.text_members);
                last.ocr_members.extend(cand.ocr_members);
                continue;
            }
        }
        regions.push(cand);
    }
    regions
}

// ── Persisting ───────────────────────────────────────────────────────────

/// Where a page's assets come from.
pub struct PageAssetInput<'a> {
    pub document: &'a DocumentId,
    pub page_index: usize,
    pub class: PageClass,
    /// Page size in points.
    pub page_width: f32,
    pub page_height: f32,
    pub images: &'a [EmbeddedImage],
    pub equations: &'a [EquationRegion],
    /// Page raster used for equation crops.
    pub raster: Option<&'a DynamicImage>,
}

/// Persisted assets with the references that point at them.
#[derive(Debug, Default)]
pub struct PageAssets {
    pub assets: Vec<Asset>,
    pub refs: Vec<AssetRef>,
}

/// Padding around equation crops, in points.
const CROP_PADDING: f32 = 2.0;
/// Images covering this much of an OCR'd page are the scan itself.
const SCAN_BACKDROP_COVERAGE: f32 = 0.5;

/// Encode and store every image and equation of a page.
///
/// All-or-nothing: the first failure aborts the page and nothing stored so
/// far is referenced.
pub async fn persist_page_assets(
    input: PageAssetInput<'_>,
    store: &dyn AssetStore,
) -> Result<PageAssets, AssetStoreError> {
    let page_area = input.page_width * input.page_height;
    let mut out = PageAssets::default();

    let images = input.images.iter().filter(|img| {
        let backdrop = input.class.plan().ocr
            && page_area > 0.0
            && img.bbox.area() / page_area >= SCAN_BACKDROP_COVERAGE;
        !backdrop && img.image.width() > 0 && img.image.height() > 0
    });

    for (k, img) in images.enumerate() {
        let ordinal = k + 1;
        let id = AssetId::derive(input.document, input.page_index, AssetKind::Image, ordinal);
        let bytes = encode_blocking(img.image.clone()).await?;
        store_one(store, id, bytes, AssetKind::Image, ordinal, img.bbox, &input, &mut out).await?;
    }

    for (k, region) in input.equations.iter().enumerate() {
        let ordinal = k + 1;
        let id = AssetId::derive(input.document, input.page_index, AssetKind::Equation, ordinal);
        let raster = input
            .raster
            .ok_or_else(|| AssetStoreError::MissingRaster(id.clone()))?;
        let crop = crop_region(raster, &region.bbox.padded(CROP_PADDING), input.page_width);
        let bytes = encode_blocking(crop).await?;
        store_one(
            store,
            id,
            bytes,
            AssetKind::Equation,
            ordinal,
            region.bbox,
            &input,
            &mut out,
        )
        .await?;
    }

    if !out.assets.is_empty() {
        info!(
            "Page {}: stored {} assets",
            input.page_index + 1,
            out.assets.len()
        );
    }
    Ok(out)
}

#[allow(clippy::too_many_arguments)]
async fn store_one(
    store: &dyn AssetStore,
    id: AssetId,
    bytes: Vec<u8>,
    kind: AssetKind,
    ordinal: usize,
    bbox: BBox,
    input: &PageAssetInput<'_>,
    out: &mut PageAssets,
) -> Result<(), AssetStoreError> {
    let byte_len = bytes.len();
    let id = store.put(&id, bytes, kind).await?;
    let uri = store.resolve(&id)?;
    out.refs.push(AssetRef {
        id: id.clone(),
        kind,
        ordinal,
        uri: uri.clone(),
        bbox,
    });
    out.assets.push(Asset {
        id,
        kind,
        page_index: input.page_index,
        bbox,
        uri,
        byte_len,
    });
    Ok(())
}

async fn encode_blocking(image: DynamicImage) -> Result<Vec<u8>, AssetStoreError> {
    tokio::task::spawn_blocking(move || encode::png_bytes(&image))
        .await
        .map_err(|e| AssetStoreError::Encode(format!("encode task panicked: {e}")))?
        .map_err(|e| AssetStoreError::Encode(e.to_string()))
}

/// Crop a point-space box out of a page raster, clamped to the image.
fn crop_region(raster: &DynamicImage, bbox: &BBox, page_width: f32) -> DynamicImage {
    let scale = if page_width > 0.0 {
        raster.width() as f32 / page_width
    } else {
        1.0
    };
    let px = bbox.scaled(scale);
    let x = px.x.max(0.0).floor() as u32;
    let y = px.y.max(0.0).floor() as u32;
    let x = x.min(raster.width().saturating_sub(1));
    let y = y.min(raster.height().saturating_sub(1));
    let w = (px.right().ceil() as u32).min(raster.width()).saturating_sub(x).max(1);
    let h = (px.bottom().ceil() as u32).min(raster.height()).saturating_sub(y).max(1);
    raster.crop_imm(x, y, w, h)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_span(text: &str, y: f32) -> TextSpan {
        TextSpan {
            text: text.into(),
            bbox: BBox::new(72.0, y, 200.0, 14.0),
            font_size: 11.0,
        }
    }

    #[test]
    fn math_density_needs_a_strong_symbol() {
        assert!(is_equation_text("∑ xᵢ = ∫ f(x) dx", 0.35));
        assert!(!is_equation_text("(see section 2)", 0.35));
        assert!(!is_equation_text("The integral ∫ is used here in prose.", 0.35));
        assert!(!is_equation_text("∑", 0.35));
    }

    #[test]
    fn adjacent_equation_lines_merge() {
        let text = vec![
            text_span("Plain sentence of body text.", 100.0),
            text_span("∑ xᵢ = ∫ f(x) dx", 120.0),
            text_span("∂y/∂x = ∇φ", 136.0),
            text_span("∫ g = ∑ h", 300.0),
        ];
        let regions = detect_equations(&text, &[], 0.35, 0.7);
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].text_members, vec![1, 2]);
        assert_eq!(regions[1].text_members, vec![3]);
    }

    #[test]
    fn confident_ocr_is_not_an_equation() {
        let ocr = vec![
            OcrSpan {
                text: "∑ a = ∫ b".into(),
                bbox: BBox::new(0.0, 0.0, 50.0, 10.0),
                confidence: 0.95,
                low_confidence: false,
            },
            OcrSpan {
                text: "∑ a = ∫ b".into(),
                bbox: BBox::new(0.0, 100.0, 50.0, 10.0),
                confidence: 0.4,
                low_confidence: true,
            },
        ];
        let regions = detect_equations(&[], &ocr, 0.35, 0.7);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].ocr_members, vec![1]);
    }

    #[tokio::test]
    async fn inline_store_resolves_only_known_ids() {
        let store = InlineAssetStore::new();
        let doc = DocumentId::new("doc");
        let id = AssetId::derive(&doc, 0, AssetKind::Image, 1);
        assert!(matches!(store.resolve(&id), Err(AssetStoreError::Unknown(_))));
        store.put(&id, vec![1, 2, 3], AssetKind::Image).await.unwrap();
        assert!(store.resolve(&id).unwrap().starts_with("data:image/png;base64,"));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn directory_store_writes_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryAssetStore::new(dir.path().join("assets"), "static/images/");
        let id = AssetId::derive(&DocumentId::new("doc"), 1, AssetKind::Equation, 1);
        store.put(&id, b"png".to_vec(), AssetKind::Equation).await.unwrap();
        assert_eq!(store.resolve(&id).unwrap(), "static/images/doc_page2_eq1.png");
        let written = std::fs::read(dir.path().join("assets/doc_page2_eq1.png")).unwrap();
        assert_eq!(written, b"png");
        assert!(!dir.path().join("assets/doc_page2_eq1.png.tmp").exists());
    }

    fn scan_with_logo() -> Vec<EmbeddedImage> {
        vec![
            EmbeddedImage {
                bbox: BBox::new(0.0, 0.0, 612.0, 792.0),
                image: DynamicImage::new_rgb8(8, 8),
            },
            EmbeddedImage {
                bbox: BBox::new(100.0, 100.0, 50.0, 50.0),
                image: DynamicImage::new_rgb8(4, 4),
            },
        ]
    }

    async fn persist_images(class: PageClass, images: &[EmbeddedImage]) -> PageAssets {
        let doc = DocumentId::new("doc");
        persist_page_assets(
            PageAssetInput {
                document: &doc,
                page_index: 0,
                class,
                page_width: 612.0,
                page_height: 792.0,
                images,
                equations: &[],
                raster: None,
            },
            &InlineAssetStore::new(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn scan_backdrop_is_not_an_asset() {
        let images = scan_with_logo();
        let assets = persist_images(PageClass::Scanned, &images).await;
        assert_eq!(assets.refs.len(), 1);
        assert_eq!(assets.refs[0].id.as_str(), "doc_page1_img1");
        assert_eq!(assets.refs[0].bbox, images[1].bbox);
    }

    #[tokio::test]
    async fn scan_backdrop_on_mixed_page_is_not_an_asset() {
        let images = scan_with_logo();
        let assets = persist_images(PageClass::Mixed, &images).await;
        assert_eq!(assets.refs.len(), 1);
        assert_eq!(assets.refs[0].bbox, images[1].bbox);
    }

    #[tokio::test]
    async fn full_page_figure_on_native_page_is_kept() {
        let images = scan_with_logo();
        let assets = persist_images(PageClass::NativeText, &images).await;
        assert_eq!(assets.refs.len(), 2);
        assert_eq!(assets.refs[0].id.as_str(), "doc_page1_img1");
        assert_eq!(assets.refs[0].bbox, images[0].bbox);
    }

    #[tokio::test]
    async fn equation_without_raster_fails() {
        let doc = DocumentId::new("doc");
        let region = EquationRegion {
            bbox: BBox::new(10.0, 10.0, 50.0, 10.0),
            text_members: vec![0],
            ocr_members: vec![],
        };
        let err = persist_page_assets(
            PageAssetInput {
                document: &doc,
                page_index: 0,
                class: PageClass::NativeText,
                page_width: 612.0,
                page_height: 792.0,
                images: &[],
                equations: std::slice::from_ref(&region),
                raster: None,
            },
            &InlineAssetStore::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AssetStoreError::MissingRaster(_)));
    }

    #[test]
    fn crop_is_clamped_to_raster() {
        let raster = DynamicImage::new_rgb8(100, 100);
        let crop = crop_region(&raster, &BBox::new(-5.0, 90.0, 40.0, 40.0), 50.0);
        // 2 px per point: x 0..70, y 180 clamped to 99
        assert_eq!(crop.width(), 70);
        assert_eq!(crop.height(), 1);
    }
}
