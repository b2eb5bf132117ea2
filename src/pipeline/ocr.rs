//! OCR fallback.
//!
//! Recognition is delegated to an [`OcrBackend`]. The default backend runs
//! the `tesseract` CLI in TSV mode, which reports one row per word with a
//! pixel box and a 0–100 confidence; words are grouped back into line spans.
//!
//! Backends work in pixels. [`recognize_page`] applies the timeout, converts
//! boxes to page points and flags spans below the confidence floor.

use crate::model::{BBox, OcrSpan};
use crate::pipeline::encode;
use async_trait::async_trait;
use image::DynamicImage;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Why an OCR call produced nothing.
#[derive(Debug, Error)]
pub enum RecognitionFailure {
    #[error("failed to start OCR backend '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("OCR backend exited with {status}: {stderr}")]
    Exit { status: String, stderr: String },

    #[error("OCR timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("unreadable OCR output: {0}")]
    Parse(String),

    #[error("could not prepare page image: {0}")]
    Image(String),
}

/// Text recognition over a rendered page.
#[async_trait]
pub trait OcrBackend: Send + Sync {
    /// Recognise `image`. Spans are in pixel coordinates of `image`,
    /// confidence in `[0, 1]`.
    async fn recognize(&self, image: &DynamicImage) -> Result<Vec<OcrSpan>, RecognitionFailure>;
}

/// [`OcrBackend`] backed by the `tesseract` executable.
#[derive(Debug, Clone)]
pub struct TesseractBackend {
    binary: PathBuf,
    language: String,
    column_gap_factor: f32,
}

impl TesseractBackend {
    pub fn new(binary: impl Into<PathBuf>, language: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            language: language.into(),
            column_gap_factor: 2.0,
        }
    }

    /// Word gap, in multiples of the word height, that splits a line.
    pub fn with_column_gap_factor(mut self, factor: f32) -> Self {
        self.column_gap_factor = factor;
        self
    }
}

#[async_trait]
impl OcrBackend for TesseractBackend {
    async fn recognize(&self, image: &DynamicImage) -> Result<Vec<OcrSpan>, RecognitionFailure> {
        let owned = image.clone();
        let png = tokio::task::spawn_blocking(move || {
            let bytes =
                encode::png_bytes(&owned).map_err(|e| RecognitionFailure::Image(e.to_string()))?;
            let mut file = tempfile::Builder::new()
                .prefix("pdf2md-ocr-")
                .suffix(".png")
                .tempfile()
                .map_err(|e| RecognitionFailure::Image(e.to_string()))?;
            std::io::Write::write_all(&mut file, &bytes)
                .map_err(|e| RecognitionFailure::Image(e.to_string()))?;
            Ok::<_, RecognitionFailure>(file)
        })
        .await
        .map_err(|e| RecognitionFailure::Image(format!("encode task panicked: {e}")))??;

        let output = tokio::process::Command::new(&self.binary)
            .arg(png.path())
            .arg("stdout")
            .arg("-l")
            .arg(&self.language)
            .arg("tsv")
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| RecognitionFailure::Spawn {
                program: self.binary.display().to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(RecognitionFailure::Exit {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        parse_tsv(&String::from_utf8_lossy(&output.stdout), self.column_gap_factor)
    }
}

struct TsvWord {
    text: String,
    bbox: BBox,
    confidence: f32,
}

/// Parse tesseract TSV output into line spans (pixel coordinates).
///
/// Only word rows (level 5) with a non-negative confidence count. Words
/// of one line are split where the gap exceeds `column_gap_factor` times
/// the word height. Span confidence is the mean word confidence.
pub fn parse_tsv(tsv: &str, column_gap_factor: f32) -> Result<Vec<OcrSpan>, RecognitionFailure> {
    let mut lines: BTreeMap<(u32, u32, u32, u32), Vec<TsvWord>> = BTreeMap::new();

    for (n, row) in tsv.lines().enumerate() {
        if n == 0 && row.starts_with("level") {
            continue;
        }
        if row.trim().is_empty() {
            continue;
        }
        let cols: Vec<&str> = row.splitn(12, '\t').collect();
        if cols.len() < 11 {
            return Err(RecognitionFailure::Parse(format!(
                "row {} has {} columns",
                n + 1,
                cols.len()
            )));
        }
        let int = |i: usize| -> Result<u32, RecognitionFailure> {
            cols[i].trim().parse::<u32>().map_err(|_| {
                RecognitionFailure::Parse(format!("row {}: bad integer '{}'", n + 1, cols[i]))
            })
        };
        if int(0)? != 5 {
            continue;
        }
        let confidence: f32 = cols[10].trim().parse().map_err(|_| {
            RecognitionFailure::Parse(format!("row {}: bad confidence '{}'", n + 1, cols[10]))
        })?;
        let text = cols.get(11).map(|t| t.trim()).unwrap_or_default();
        if confidence < 0.0 || text.is_empty() {
            continue;
        }
        let key = (int(1)?, int(2)?, int(3)?, int(4)?);
        lines.entry(key).or_default().push(TsvWord {
            text: text.to_string(),
            bbox: BBox::new(
                int(6)? as f32,
                int(7)? as f32,
                int(8)? as f32,
                int(9)? as f32,
            ),
            confidence: confidence / 100.0,
        });
    }

    let mut spans = Vec::new();
    for (_, mut words) in lines {
        words.sort_by(|a, b| a.bbox.x.total_cmp(&b.bbox.x));
        let mut group: Vec<TsvWord> = Vec::new();
        for word in words {
            if let Some(last) = group.last() {
                let height = last.bbox.height.max(word.bbox.height).max(1.0);
                if word.bbox.x - last.bbox.right() > column_gap_factor * height {
                    spans.push(join_words(std::mem::take(&mut group)));
                }
            }
            group.push(word);
        }
        if !group.is_empty() {
            spans.push(join_words(group));
        }
    }
    Ok(spans)
}

fn join_words(words: Vec<TsvWord>) -> OcrSpan {
    let mut bbox = words[0].bbox;
    for w in &words[1..] {
        bbox = bbox.union(&w.bbox);
    }
    let confidence = words.iter().map(|w| w.confidence).sum::<f32>() / words.len() as f32;
    OcrSpan {
        text: words
            .iter()
            .map(|w| w.text.as_str())
            .collect::<Vec<_>>()
            .join(" "),
        bbox,
        confidence,
        low_confidence: false,
    }
}

/// Run `backend` on a page raster and return spans in page points.
///
/// `page_width` is the page width in points; the pixel → point factor is
/// derived from it so pixel caps applied during rendering are honoured.
pub async fn recognize_page(
    backend: &dyn OcrBackend,
    image: &DynamicImage,
    page_width: f32,
    timeout_secs: u64,
    confidence_floor: f32,
) -> Result<Vec<OcrSpan>, RecognitionFailure> {
    let spans = tokio::time::timeout(Duration::from_secs(timeout_secs), backend.recognize(image))
        .await
        .map_err(|_| RecognitionFailure::Timeout { secs: timeout_secs })??;

    let factor = if image.width() > 0 {
        page_width / image.width() as f32
    } else {
        1.0
    };

    let spans: Vec<OcrSpan> = spans
        .into_iter()
        .filter(|s| !s.text.trim().is_empty())
        .map(|s| {
            let confidence = if s.confidence.is_finite() {
                s.confidence.clamp(0.0, 1.0)
            } else {
                0.0
            };
            OcrSpan {
                text: s.text.trim().to_string(),
                bbox: s.bbox.scaled(factor),
                confidence,
                low_confidence: confidence < confidence_floor,
            }
        })
        .collect();

    let low = spans.iter().filter(|s| s.low_confidence).count();
    if low > 0 {
        warn!("{} of {} OCR spans below confidence floor", low, spans.len());
    }
    debug!("OCR produced {} spans", spans.len());
    Ok(spans)
}

/// Drop OCR spans that mostly overlap native text (native text wins).
pub fn drop_overlapping(ocr: Vec<OcrSpan>, text: &[crate::model::TextSpan]) -> Vec<OcrSpan> {
    ocr.into_iter()
        .filter(|span| {
            let area = span.bbox.area();
            if area <= 0.0 {
                return true;
            }
            let covered: f32 = text.iter().map(|t| t.bbox.intersection_area(&span.bbox)).sum();
            covered < 0.5 * area
        })
        .collect()
}
