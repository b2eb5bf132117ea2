//! pdfium-backed [`PageSource`] and [`Rasterizer`].
//!
//! pdfium is not async-safe, so every call runs inside
//! `tokio::task::spawn_blocking` and opens its own document handle. The
//! `thread_safe` feature of `pdfium-render` serialises access to the library
//! across those blocking threads.
//!
//! pdfium reports coordinates in points with a bottom-left origin; they are
//! flipped to top-left here so nothing downstream has to care.

use crate::error::{PageError, Pdf2MdError};
use crate::model::BBox;
use crate::output::DocumentMetadata;
use crate::pipeline::source::{EmbeddedImage, GlyphRun, PageSource, RawPage, Rasterizer};
use async_trait::async_trait;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Bind to pdfium: `PDFIUM_LIB_PATH`, then the working directory, then the
/// system library.
pub fn bind_pdfium() -> Result<Pdfium, Pdf2MdError> {
    let bindings = match std::env::var("PDFIUM_LIB_PATH") {
        Ok(path) if !path.is_empty() => Pdfium::bind_to_library(&path),
        _ => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./")),
    }
    .or_else(|_| Pdfium::bind_to_system_library())
    .map_err(|e| Pdf2MdError::PdfiumBindingFailed(format!("{e:?}")))?;
    Ok(Pdfium::new(bindings))
}

fn map_load_error(path: &Path, password: Option<&str>, e: PdfiumError) -> Pdf2MdError {
    let err_str = format!("{:?}", e);
    if err_str.contains("Password") || err_str.contains("password") {
        if password.is_some() {
            Pdf2MdError::WrongPassword {
                path: path.to_path_buf(),
            }
        } else {
            Pdf2MdError::PasswordRequired {
                path: path.to_path_buf(),
            }
        }
    } else {
        Pdf2MdError::CorruptPdf {
            path: path.to_path_buf(),
            detail: err_str,
        }
    }
}

/// An opened PDF on disk.
#[derive(Debug, Clone)]
pub struct PdfiumDocument {
    path: PathBuf,
    password: Option<String>,
    page_count: usize,
    metadata: DocumentMetadata,
    max_rendered_pixels: u32,
}

impl PdfiumDocument {
    /// Open `path`, reading page count and metadata.
    ///
    /// Fails with a fatal error for corrupt or password-protected files.
    pub async fn open(
        path: &Path,
        password: Option<&str>,
        max_rendered_pixels: u32,
    ) -> Result<Self, Pdf2MdError> {
        let owned = path.to_path_buf();
        let pwd = password.map(str::to_string);
        let metadata = tokio::task::spawn_blocking(move || {
            extract_metadata_blocking(&owned, pwd.as_deref())
        })
        .await
        .map_err(|e| Pdf2MdError::Internal(format!("Metadata task panicked: {}", e)))??;

        info!("PDF loaded: {} pages", metadata.page_count);
        Ok(Self {
            path: path.to_path_buf(),
            password: password.map(str::to_string),
            page_count: metadata.page_count,
            metadata,
            max_rendered_pixels,
        })
    }

    pub fn metadata(&self) -> &DocumentMetadata {
        &self.metadata
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl PageSource for PdfiumDocument {
    fn page_count(&self) -> usize {
        self.page_count
    }

    async fn load_page(&self, index: usize) -> Result<RawPage, PageError> {
        let path = self.path.clone();
        let password = self.password.clone();
        tokio::task::spawn_blocking(move || load_page_blocking(&path, password.as_deref(), index))
            .await
            .map_err(|e| PageError::LoadFailed {
                page: index + 1,
                detail: format!("load task panicked: {e}"),
            })?
    }
}

#[async_trait]
impl Rasterizer for PdfiumDocument {
    async fn render(&self, index: usize, dpi: u32) -> Result<DynamicImage, PageError> {
        let path = self.path.clone();
        let password = self.password.clone();
        let max_pixels = self.max_rendered_pixels;
        tokio::task::spawn_blocking(move || {
            render_blocking(&path, password.as_deref(), index, dpi, max_pixels)
        })
        .await
        .map_err(|e| PageError::RenderFailed {
            page: index + 1,
            detail: format!("render task panicked: {e}"),
        })?
    }
}

/// Extract document metadata from a PDF without touching page content.
pub async fn extract_metadata(
    pdf_path: &Path,
    password: Option<&str>,
) -> Result<DocumentMetadata, Pdf2MdError> {
    let path = pdf_path.to_path_buf();
    let pwd = password.map(|s| s.to_string());

    tokio::task::spawn_blocking(move || extract_metadata_blocking(&path, pwd.as_deref()))
        .await
        .map_err(|e| Pdf2MdError::Internal(format!("Metadata task panicked: {}", e)))?
}

fn extract_metadata_blocking(
    pdf_path: &Path,
    password: Option<&str>,
) -> Result<DocumentMetadata, Pdf2MdError> {
    let pdfium = bind_pdfium()?;
    let document = pdfium
        .load_pdf_from_file(pdf_path, password)
        .map_err(|e| map_load_error(pdf_path, password, e))?;

    let metadata = document.metadata();
    let get_meta = |tag: PdfDocumentMetadataTagType| -> Option<String> {
        metadata.get(tag).and_then(|t| {
            let v = t.value().trim().to_string();
            if v.is_empty() {
                None
            } else {
                Some(v)
            }
        })
    };

    Ok(DocumentMetadata {
        title: get_meta(PdfDocumentMetadataTagType::Title),
        author: get_meta(PdfDocumentMetadataTagType::Author),
        subject: get_meta(PdfDocumentMetadataTagType::Subject),
        creator: get_meta(PdfDocumentMetadataTagType::Creator),
        producer: get_meta(PdfDocumentMetadataTagType::Producer),
        creation_date: get_meta(PdfDocumentMetadataTagType::CreationDate),
        modification_date: get_meta(PdfDocumentMetadataTagType::ModificationDate),
        page_count: document.pages().len() as usize,
        pdf_version: format!("{:?}", document.version()),
    })
}

/// Convert a pdfium rect (bottom-left origin) into a top-left [`BBox`].
fn to_bbox(rect: &PdfRect, page_height: f32) -> BBox {
    let left = rect.left().value;
    let right = rect.right().value;
    let top = rect.top().value;
    let bottom = rect.bottom().value;
    BBox::new(left, page_height - top, right - left, top - bottom)
}

fn load_page_blocking(
    pdf_path: &Path,
    password: Option<&str>,
    index: usize,
) -> Result<RawPage, PageError> {
    let page_num = index + 1;
    let load_failed = |detail: String| PageError::LoadFailed {
        page: page_num,
        detail,
    };

    let pdfium = bind_pdfium().map_err(|e| load_failed(e.to_string()))?;
    let document = pdfium
        .load_pdf_from_file(pdf_path, password)
        .map_err(|e| load_failed(format!("{e:?}")))?;
    let page = document
        .pages()
        .get(index as u16)
        .map_err(|e| load_failed(format!("{e:?}")))?;

    let width = page.width().value;
    let height = page.height().value;

    let runs = match page.text() {
        Ok(text) => glyph_runs(&text, height),
        Err(e) => {
            debug!("Page {}: no text layer ({:?})", page_num, e);
            Vec::new()
        }
    };

    let mut images = Vec::new();
    for object in page.objects().iter() {
        let Some(image_object) = object.as_image_object() else {
            continue;
        };
        let bbox = match object.bounds() {
            Ok(bounds) => to_bbox(&bounds.to_rect(), height),
            Err(e) => {
                debug!("Page {}: image without bounds ({:?})", page_num, e);
                continue;
            }
        };
        match image_object.get_raw_image() {
            Ok(image) => images.push(EmbeddedImage { bbox, image }),
            Err(e) => debug!("Page {}: unreadable image object ({:?})", page_num, e),
        }
    }

    debug!(
        "Page {}: {} glyph runs, {} images",
        page_num,
        runs.len(),
        images.len()
    );
    Ok(RawPage::new(index, width, height, runs, images))
}

/// Group characters into runs sharing font, size and baseline.
fn glyph_runs(text: &PdfPageText, page_height: f32) -> Vec<GlyphRun> {
    let mut runs: Vec<GlyphRun> = Vec::new();
    let mut current: Option<GlyphRun> = None;

    for ch in text.chars().iter() {
        let Some(c) = ch.unicode_char() else {
            continue;
        };
        if c == '\r' || c == '\n' {
            runs.extend(current.take());
            continue;
        }
        let Ok(rect) = ch.loose_bounds() else {
            continue;
        };
        let bbox = to_bbox(&rect, page_height);
        let size = ch.scaled_font_size().value;
        let font = ch.font_name();

        if let Some(run) = current.as_mut() {
            let same_font = run.font_name.as_deref() == Some(font.as_str());
            let same_size = (run.font_size - size).abs() < 0.1;
            let same_line = (run.bbox.center_y() - bbox.center_y()).abs() < size.max(1.0) * 0.5;
            let adjacent = bbox.x >= run.bbox.x && bbox.x - run.bbox.right() < size * 0.3;
            if same_font && same_size && same_line && adjacent {
                run.text.push(c);
                run.bbox = run.bbox.union(&bbox);
                continue;
            }
        }
        runs.extend(current.take());
        current = Some(GlyphRun::new(c.to_string(), bbox, size).with_font(font));
    }
    runs.extend(current);
    runs
}

fn render_blocking(
    pdf_path: &Path,
    password: Option<&str>,
    index: usize,
    dpi: u32,
    max_pixels: u32,
) -> Result<DynamicImage, PageError> {
    let render_failed = |detail: String| PageError::RenderFailed {
        page: index + 1,
        detail,
    };

    let pdfium = bind_pdfium().map_err(|e| render_failed(e.to_string()))?;
    let document = pdfium
        .load_pdf_from_file(pdf_path, password)
        .map_err(|e| render_failed(format!("{e:?}")))?;
    let page = document
        .pages()
        .get(index as u16)
        .map_err(|e| render_failed(format!("{e:?}")))?;

    let render_config = PdfRenderConfig::new()
        .scale_page_by_factor(dpi as f32 / 72.0)
        .set_maximum_width(max_pixels as i32)
        .set_maximum_height(max_pixels as i32);

    let bitmap = page
        .render_with_config(&render_config)
        .map_err(|e| render_failed(format!("{e:?}")))?;
    let image = bitmap.as_image();
    debug!(
        "Rendered page {} → {}x{} px",
        index + 1,
        image.width(),
        image.height()
    );
    Ok(image)
}
