//! Core data model shared by every pipeline stage.
//!
//! Geometry is expressed in PDF points with a **top-left** origin: `y` grows
//! downward, matching the way a reader scans a page. pdfium reports
//! bottom-left coordinates and OCR engines report pixels; both are converted
//! into this frame before a [`Fragment`] is built.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

// ── Geometry ─────────────────────────────────────────────────────────────

/// Axis-aligned rectangle in page points (top-left origin).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width: width.max(0.0),
            height: height.max(0.0),
        }
    }

    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    pub fn center_y(&self) -> f32 {
        self.y + self.height / 2.0
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    /// Area shared with `other`; zero when the boxes do not overlap.
    pub fn intersection_area(&self, other: &BBox) -> f32 {
        let w = self.right().min(other.right()) - self.x.max(other.x);
        let h = self.bottom().min(other.bottom()) - self.y.max(other.y);
        if w <= 0.0 || h <= 0.0 {
            0.0
        } else {
            w * h
        }
    }

    /// Smallest box containing both.
    pub fn union(&self, other: &BBox) -> BBox {
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        BBox::new(
            x,
            y,
            self.right().max(other.right()) - x,
            self.bottom().max(other.bottom()) - y,
        )
    }

    /// Multiply every coordinate by `factor` (pixel ↔ point conversion).
    pub fn scaled(&self, factor: f32) -> BBox {
        BBox::new(
            self.x * factor,
            self.y * factor,
            self.width * factor,
            self.height * factor,
        )
    }

    /// Grow the box by `margin` on every side.
    pub fn padded(&self, margin: f32) -> BBox {
        BBox::new(
            self.x - margin,
            self.y - margin,
            self.width + 2.0 * margin,
            self.height + 2.0 * margin,
        )
    }
}

// ── Page classification ──────────────────────────────────────────────────

/// How a page's content must be extracted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PageClass {
    /// The text layer covers the page; no OCR needed.
    NativeText,
    /// Little or no text layer, mostly raster content.
    Scanned,
    /// Anything in between. Both extraction paths run.
    Mixed,
}

/// Which extraction paths a [`PageClass`] runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractionPlan {
    pub native_text: bool,
    pub ocr: bool,
}

impl PageClass {
    /// The fixed extraction plan for this class.
    pub const fn plan(self) -> ExtractionPlan {
        match self {
            PageClass::NativeText => ExtractionPlan {
                native_text: true,
                ocr: false,
            },
            PageClass::Scanned => ExtractionPlan {
                native_text: false,
                ocr: true,
            },
            PageClass::Mixed => ExtractionPlan {
                native_text: true,
                ocr: true,
            },
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PageClass::NativeText => "native-text",
            PageClass::Scanned => "scanned",
            PageClass::Mixed => "mixed",
        }
    }
}

impl fmt::Display for PageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Fragments ────────────────────────────────────────────────────────────

/// Text taken from the PDF text layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextSpan {
    pub text: String,
    pub bbox: BBox,
    /// Font size in points; drives heading inference.
    pub font_size: f32,
}

/// Text recognised by the OCR backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrSpan {
    pub text: String,
    pub bbox: BBox,
    /// Recognition confidence in `[0, 1]`.
    pub confidence: f32,
    /// Set when `confidence` is below the configured floor. Such spans are
    /// kept and annotated in the output, never dropped.
    #[serde(default)]
    pub low_confidence: bool,
}

/// Pointer to a persisted [`Asset`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetRef {
    pub id: AssetId,
    pub kind: AssetKind,
    /// 1-based position of the asset on its page.
    pub ordinal: usize,
    pub uri: String,
    pub bbox: BBox,
}

/// A positioned unit of page content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Fragment {
    Text(TextSpan),
    Ocr(OcrSpan),
    Asset(AssetRef),
}

impl Fragment {
    pub fn bbox(&self) -> &BBox {
        match self {
            Fragment::Text(s) => &s.bbox,
            Fragment::Ocr(s) => &s.bbox,
            Fragment::Asset(a) => &a.bbox,
        }
    }

    /// Textual content, `None` for asset references.
    pub fn text(&self) -> Option<&str> {
        match self {
            Fragment::Text(s) => Some(&s.text),
            Fragment::Ocr(s) => Some(&s.text),
            Fragment::Asset(_) => None,
        }
    }

    /// Font size hint; only native text carries one.
    pub fn font_size(&self) -> Option<f32> {
        match self {
            Fragment::Text(s) => Some(s.font_size),
            _ => None,
        }
    }
}

/// One page after extraction: fragments in reading order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    /// 0-based index in the source document.
    pub index: usize,
    pub class: PageClass,
    pub fragments: Vec<Fragment>,
}

impl Page {
    /// 1-based page number, as shown to users.
    pub fn number(&self) -> usize {
        self.index + 1
    }
}

// ── Assets ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    Image,
    Equation,
}

impl AssetKind {
    /// Short tag used inside asset ids.
    pub fn slug(self) -> &'static str {
        match self {
            AssetKind::Image => "img",
            AssetKind::Equation => "eq",
        }
    }
}

/// Stable asset identifier: `{document}_page{N}_{img|eq}{k}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetId(String);

impl AssetId {
    /// Derive the id of the `counter`-th asset (1-based) on a page.
    pub fn derive(
        document: &DocumentId,
        page_index: usize,
        kind: AssetKind,
        counter: usize,
    ) -> Self {
        Self(format!(
            "{}_page{}_{}{}",
            document.as_str(),
            page_index + 1,
            kind.slug(),
            counter
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A persisted image or equation crop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub id: AssetId,
    pub kind: AssetKind,
    pub page_index: usize,
    pub bbox: BBox,
    pub uri: String,
    pub byte_len: usize,
}

// ── Document identity ────────────────────────────────────────────────────

static RE_UNSAFE_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w.-]").unwrap());

/// Identifier of one source document; prefixes every asset id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    /// Use `raw` as-is after replacing characters unsafe in file names.
    pub fn new(raw: &str) -> Self {
        let cleaned = RE_UNSAFE_NAME.replace_all(raw.trim(), "_").to_string();
        if cleaned.is_empty() {
            Self("document".to_string())
        } else {
            Self(cleaned)
        }
    }

    /// `{sanitised stem}-{first 8 hex digits of sha256(bytes)}`.
    ///
    /// Two different documents never share a prefix even when their file
    /// names match; the same document always maps to the same id.
    pub fn derive(stem: &str, bytes: &[u8]) -> Self {
        let digest = format!("{:x}", Sha256::digest(bytes));
        let base = Self::new(stem);
        Self(format!("{}-{}", base.0, &digest[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Structured output ────────────────────────────────────────────────────

/// Semantic type of a [`StructuredBlock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlockKind {
    /// Heading with level 1 (largest) and up.
    Heading(u8),
    Paragraph,
    ListItem,
    TableRow,
    Equation,
    /// Inline failure marker (OCR failed, assets omitted, …).
    Diagnostic,
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockKind::Heading(level) => write!(f, "heading:{level}"),
            BlockKind::Paragraph => f.write_str("paragraph"),
            BlockKind::ListItem => f.write_str("list-item"),
            BlockKind::TableRow => f.write_str("table-row"),
            BlockKind::Equation => f.write_str("equation"),
            BlockKind::Diagnostic => f.write_str("diagnostic"),
        }
    }
}

/// A typed unit of rendered Markdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredBlock {
    pub kind: BlockKind,
    pub markdown: String,
    #[serde(default)]
    pub assets: Vec<AssetId>,
    /// Number of page fragments folded into this block.
    #[serde(default)]
    pub fragment_count: usize,
}

impl StructuredBlock {
    pub fn new(kind: BlockKind, markdown: impl Into<String>, fragment_count: usize) -> Self {
        Self {
            kind,
            markdown: markdown.into(),
            assets: Vec::new(),
            fragment_count,
        }
    }

    pub fn with_asset(mut self, id: AssetId) -> Self {
        self.assets.push(id);
        self
    }

    pub fn diagnostic(message: impl Into<String>) -> Self {
        Self::new(BlockKind::Diagnostic, message, 0)
    }

    /// True for blocks that render on one line (header/footer candidates).
    pub fn is_single_line(&self) -> bool {
        !self.markdown.trim().is_empty() && !self.markdown.trim().contains('\n')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bbox_intersection_and_union() {
        let a = BBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BBox::new(5.0, 5.0, 10.0, 10.0);
        assert_eq!(a.intersection_area(&b), 25.0);
        assert_eq!(a.union(&b), BBox::new(0.0, 0.0, 15.0, 15.0));
        let far = BBox::new(50.0, 50.0, 1.0, 1.0);
        assert_eq!(a.intersection_area(&far), 0.0);
    }

    #[test]
    fn class_plans_are_fixed() {
        assert!(PageClass::NativeText.plan().native_text);
        assert!(!PageClass::NativeText.plan().ocr);
        assert!(!PageClass::Scanned.plan().native_text);
        assert!(PageClass::Mixed.plan().native_text && PageClass::Mixed.plan().ocr);
    }

    #[test]
    fn document_id_is_sanitised_and_content_keyed() {
        let a = DocumentId::derive("my report (final)", b"%PDF-1.7 a");
        let b = DocumentId::derive("my report (final)", b"%PDF-1.7 b");
        assert!(a.as_str().starts_with("my_report__final_-"));
        assert_ne!(a, b);
        assert_eq!(a, DocumentId::derive("my report (final)", b"%PDF-1.7 a"));
    }

    #[test]
    fn asset_id_format() {
        let doc = DocumentId::new("paper");
        let id = AssetId::derive(&doc, 0, AssetKind::Equation, 2);
        assert_eq!(id.as_str(), "paper_page1_eq2");
    }

    #[test]
    fn block_kind_display() {
        assert_eq!(BlockKind::Heading(2).to_string(), "heading:2");
        assert_eq!(BlockKind::ListItem.to_string(), "list-item");
    }
}
