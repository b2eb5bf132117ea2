//! Content structuring: positioned fragments → typed Markdown blocks.
//!
//! The page is linearised into line bands (see [`line_bands`]), then each
//! band is classified in order:
//!
//! 1. asset references become equation or image blocks
//! 2. runs of ≥2 bands with the same number of column-aligned cells become
//!    table rows, as long as one column holds only compact cells (short or
//!    numeric), which keeps two-column prose out of tables
//! 3. lines whose font size stands out from the page median become headings
//! 4. bullet or numbered lines start list items
//! 5. everything else is folded into paragraphs, split on vertical gaps
//!
//! Every fragment lands in exactly one block; `fragment_count` on each
//! block records how many.

use crate::config::ConversionConfig;
use crate::error::PageError;
use crate::model::{AssetKind, BBox, BlockKind, Fragment, Page, StructuredBlock};
use once_cell::sync::Lazy;
use regex::Regex;
use std::cmp::Ordering;
use tracing::debug;

/// Longest text still considered for a heading.
const MAX_HEADING_CHARS: usize = 200;
/// Most words a table cell may have and still count as compact.
const MAX_COMPACT_CELL_WORDS: usize = 3;

static RE_BULLET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[•◦▪▫‣⁃●○■□·∙\-–—*]\s+(.+)$").unwrap());
static RE_NUMBERED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\(?(\d{1,3}|[a-z])[.)]\s+(.+)$").unwrap());

// ── Reading order ────────────────────────────────────────────────────────

fn cmp_f32(a: f32, b: f32) -> Ordering {
    a.total_cmp(&b)
}

/// Group fragments into line bands, in reading order.
///
/// Fragments are visited top to bottom. A text fragment joins the open
/// band when its vertical centre lies within the extent of the band's
/// first fragment; otherwise it opens a new band. Asset references always
/// form a band of their own. Inside a band fragments run left to right.
/// Ties fall back to the input index, so the result is deterministic.
pub fn line_bands(fragments: &[Fragment]) -> Vec<Vec<usize>> {
    let mut order: Vec<usize> = (0..fragments.len()).collect();
    order.sort_by(|&a, &b| {
        let (ba, bb) = (fragments[a].bbox(), fragments[b].bbox());
        cmp_f32(ba.y, bb.y)
            .then(cmp_f32(ba.x, bb.x))
            .then(a.cmp(&b))
    });

    let mut bands: Vec<Vec<usize>> = Vec::new();
    let mut open: Option<usize> = None;
    for idx in order {
        let frag = &fragments[idx];
        if matches!(frag, Fragment::Asset(_)) {
            bands.push(vec![idx]);
            continue;
        }
        let joins = open.is_some_and(|b| {
            let first = fragments[bands[b][0]].bbox();
            let c = frag.bbox().center_y();
            c >= first.y && c <= first.bottom()
        });
        match open {
            Some(b) if joins => bands[b].push(idx),
            _ => {
                bands.push(vec![idx]);
                open = Some(bands.len() - 1);
            }
        }
    }

    for band in &mut bands {
        band.sort_by(|&a, &b| {
            let (ba, bb) = (fragments[a].bbox(), fragments[b].bbox());
            cmp_f32(ba.x, bb.x)
                .then(cmp_f32(ba.y, bb.y))
                .then(a.cmp(&b))
        });
    }
    bands
}

/// Reorder fragments into reading order.
pub fn reading_order(fragments: Vec<Fragment>) -> Vec<Fragment> {
    let bands = line_bands(&fragments);
    let mut slots: Vec<Option<Fragment>> = fragments.into_iter().map(Some).collect();
    bands
        .into_iter()
        .flatten()
        .filter_map(|i| slots[i].take())
        .collect()
}

// ── Lines ────────────────────────────────────────────────────────────────

struct Cell {
    markdown: String,
    bbox: BBox,
    compact: bool,
}

struct Line {
    cells: Vec<Cell>,
    bbox: BBox,
    /// Largest native font size on the line; `None` for OCR-only lines.
    font_size: Option<f32>,
    fragment_count: usize,
}

impl Line {
    fn text(&self) -> String {
        self.cells
            .iter()
            .map(|c| c.markdown.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

enum Band<'a> {
    Text(Line),
    Asset(&'a crate::model::AssetRef),
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn render_cell(frag: &Fragment) -> String {
    match frag {
        Fragment::Text(s) => s.text.trim().to_string(),
        Fragment::Ocr(s) if s.low_confidence => format!(
            "<mark data-ocr-confidence=\"{:.2}\">{}</mark>",
            s.confidence,
            escape_html(s.text.trim())
        ),
        Fragment::Ocr(s) => s.text.trim().to_string(),
        Fragment::Asset(_) => String::new(),
    }
}

/// Short or mostly digits: shaped like a table cell, not a line of prose.
fn is_compact(text: &str) -> bool {
    let visible = text.chars().filter(|c| !c.is_whitespace()).count();
    let digits = text.chars().filter(|c| c.is_ascii_digit()).count();
    text.split_whitespace().count() <= MAX_COMPACT_CELL_WORDS || digits * 2 >= visible
}

fn build_bands<'a>(page: &'a Page) -> Vec<Band<'a>> {
    line_bands(&page.fragments)
        .into_iter()
        .map(|band| {
            if let [single] = band.as_slice() {
                if let Fragment::Asset(a) = &page.fragments[*single] {
                    return Band::Asset(a);
                }
            }
            let frags: Vec<&Fragment> = band.iter().map(|&i| &page.fragments[i]).collect();
            let mut bbox = *frags[0].bbox();
            for f in &frags[1..] {
                bbox = bbox.union(f.bbox());
            }
            let font_size = frags
                .iter()
                .filter_map(|f| f.font_size())
                .max_by(|a, b| a.total_cmp(b));
            Band::Text(Line {
                cells: frags
                    .iter()
                    .map(|f| Cell {
                        markdown: render_cell(f),
                        bbox: *f.bbox(),
                        compact: f.text().is_some_and(is_compact),
                    })
                    .collect(),
                bbox,
                font_size,
                fragment_count: frags.len(),
            })
        })
        .collect()
}

fn median(values: &mut [f32]) -> Option<f32> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    Some(if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    })
}

// ── Blocks ───────────────────────────────────────────────────────────────

/// Escape Markdown that a line would otherwise trigger by accident.
fn escape_line_start(text: &str) -> String {
    match text.chars().next() {
        Some('#') | Some('>') | Some('=') | Some('+') | Some('|') => format!("\\{text}"),
        _ => text.to_string(),
    }
}

/// Escape pipes, and cells that would read as a GFM delimiter row.
fn table_cell(markdown: &str) -> String {
    let cell = markdown.replace('|', "\\|");
    let delimiter_like = cell.contains('-') && cell.chars().all(|c| matches!(c, '-' | ':' | ' '));
    if delimiter_like {
        format!("\\{cell}")
    } else {
        cell
    }
}

fn table_row(line: &Line) -> String {
    let cells: Vec<String> = line.cells.iter().map(|c| table_cell(&c.markdown)).collect();
    format!("| {} |", cells.join(" | "))
}

/// Join two wrapped lines, healing words hyphenated at the break.
fn join_wrapped(acc: &mut String, next: &str) {
    if acc.is_empty() {
        acc.push_str(next);
        return;
    }
    let hyphenated = acc.ends_with('-')
        && acc
            .chars()
            .rev()
            .nth(1)
            .is_some_and(|c| c.is_alphabetic())
        && next.chars().next().is_some_and(|c| c.is_lowercase());
    if hyphenated {
        acc.pop();
    } else {
        acc.push(' ');
    }
    acc.push_str(next);
}

fn list_item(text: &str) -> Option<String> {
    if let Some(caps) = RE_BULLET.captures(text) {
        return Some(format!("- {}", &caps[1]));
    }
    if let Some(caps) = RE_NUMBERED.captures(text) {
        let marker = &caps[1];
        return Some(if marker.chars().all(|c| c.is_ascii_digit()) {
            format!("{}. {}", marker, &caps[2])
        } else {
            format!("- {}) {}", marker, &caps[2])
        });
    }
    None
}

/// Whether `rows` form a table: same cell count ≥ 2 and each column's
/// cells overlap horizontally with the row above.
fn aligned(prev: &Line, next: &Line) -> bool {
    prev.cells.len() >= 2
        && prev.cells.len() == next.cells.len()
        && prev
            .cells
            .iter()
            .zip(&next.cells)
            .all(|(a, b)| a.bbox.x < b.bbox.right() && b.bbox.x < a.bbox.right())
}

/// Whether an aligned run reads as a table: some column is compact in every
/// row. Columns of running prose never are.
fn tabular(rows: &[&Line]) -> bool {
    let columns = rows.first().map_or(0, |r| r.cells.len());
    (0..columns).any(|c| rows.iter().all(|r| r.cells.get(c).is_some_and(|cell| cell.compact)))
}

/// Heading levels keyed by font size: largest distinct size → level 1.
fn heading_levels(lines: &[&Line], median_size: f32, config: &ConversionConfig) -> Vec<f32> {
    let mut sizes: Vec<f32> = lines
        .iter()
        .filter_map(|l| l.font_size)
        .filter(|&s| s >= median_size * config.heading_size_ratio)
        .map(|s| (s * 2.0).round() / 2.0)
        .collect();
    sizes.sort_by(|a, b| b.total_cmp(a));
    sizes.dedup();
    sizes
}

/// Structure one page. Pure and deterministic; an empty page yields an
/// empty block list.
pub fn structure_page(page: &Page, config: &ConversionConfig) -> Vec<StructuredBlock> {
    if page.fragments.is_empty() {
        return Vec::new();
    }
    let bands = build_bands(page);

    let text_lines: Vec<&Line> = bands
        .iter()
        .filter_map(|b| match b {
            Band::Text(l) => Some(l),
            Band::Asset(_) => None,
        })
        .collect();
    let mut sizes: Vec<f32> = page.fragments.iter().filter_map(|f| f.font_size()).collect();
    let median_size = median(&mut sizes);
    let mut heights: Vec<f32> = text_lines.iter().map(|l| l.bbox.height).collect();
    let median_height = median(&mut heights).unwrap_or(0.0);
    let levels = median_size
        .map(|m| heading_levels(&text_lines, m, config))
        .unwrap_or_default();

    // Mark table rows first so the other passes skip them.
    let mut in_table = vec![false; bands.len()];
    let mut i = 0;
    while i < bands.len() {
        let mut j = i;
        while j + 1 < bands.len() {
            match (&bands[j], &bands[j + 1]) {
                (Band::Text(a), Band::Text(b)) if aligned(a, b) => j += 1,
                _ => break,
            }
        }
        let rows: Vec<&Line> = bands[i..=j]
            .iter()
            .filter_map(|b| match b {
                Band::Text(l) => Some(l),
                Band::Asset(_) => None,
            })
            .collect();
        if j > i && tabular(&rows) {
            in_table[i..=j].iter_mut().for_each(|t| *t = true);
        }
        i = j + 1;
    }

    let mut blocks: Vec<StructuredBlock> = Vec::new();
    let mut open: Option<StructuredBlock> = None;
    let mut prev_bottom: Option<f32> = None;

    let flush = |open: &mut Option<StructuredBlock>, blocks: &mut Vec<StructuredBlock>| {
        if let Some(b) = open.take() {
            blocks.push(b);
        }
    };

    for (idx, band) in bands.iter().enumerate() {
        let line = match band {
            Band::Asset(a) => {
                flush(&mut open, &mut blocks);
                prev_bottom = None;
                let block = match a.kind {
                    AssetKind::Equation => StructuredBlock::new(
                        BlockKind::Equation,
                        format!("![Equation {}]({})", a.ordinal, a.uri),
                        1,
                    ),
                    AssetKind::Image => StructuredBlock::new(
                        BlockKind::Paragraph,
                        format!("![Page {} Image {}]({})", page.number(), a.ordinal, a.uri),
                        1,
                    ),
                };
                blocks.push(block.with_asset(a.id.clone()));
                continue;
            }
            Band::Text(line) => line,
        };

        let gap_break = prev_bottom
            .is_some_and(|b| line.bbox.y - b > config.paragraph_gap_factor * median_height);
        prev_bottom = Some(line.bbox.bottom());

        if in_table[idx] {
            flush(&mut open, &mut blocks);
            blocks.push(StructuredBlock::new(
                BlockKind::TableRow,
                table_row(line),
                line.fragment_count,
            ));
            continue;
        }

        let text = line.text();

        let heading_level = match (line.font_size, median_size) {
            (Some(size), Some(m))
                if size >= m * config.heading_size_ratio
                    && text.chars().count() <= MAX_HEADING_CHARS =>
            {
                let rounded = (size * 2.0).round() / 2.0;
                levels
                    .iter()
                    .position(|&s| s == rounded)
                    .map(|p| (p + 1).min(config.max_heading_level as usize) as u8)
            }
            _ => None,
        };
        if let Some(level) = heading_level {
            flush(&mut open, &mut blocks);
            blocks.push(StructuredBlock::new(
                BlockKind::Heading(level),
                format!("{} {}", "#".repeat(level as usize), text),
                line.fragment_count,
            ));
            continue;
        }

        if let Some(item) = list_item(&text) {
            flush(&mut open, &mut blocks);
            open = Some(StructuredBlock::new(BlockKind::ListItem, item, line.fragment_count));
            continue;
        }

        let continues = !gap_break
            && open
                .as_ref()
                .is_some_and(|b| matches!(b.kind, BlockKind::Paragraph | BlockKind::ListItem));
        if continues {
            if let Some(block) = open.as_mut() {
                join_wrapped(&mut block.markdown, &text);
                block.fragment_count += line.fragment_count;
            }
        } else {
            flush(&mut open, &mut blocks);
            open = Some(StructuredBlock::new(
                BlockKind::Paragraph,
                escape_line_start(&text),
                line.fragment_count,
            ));
        }
    }
    flush(&mut open, &mut blocks);

    debug!(
        "Page {}: {} fragments → {} blocks",
        page.number(),
        page.fragments.len(),
        blocks.len()
    );
    blocks
}

/// Inline markers for the hard errors of a page.
///
/// A page that produced no fragments at all gets a single marker naming
/// every cause; otherwise each error gets its own.
pub fn diagnostic_blocks(
    page_num: usize,
    errors: &[PageError],
    page_is_empty: bool,
) -> Vec<StructuredBlock> {
    let hard: Vec<&PageError> = errors.iter().filter(|e| !e.is_soft()).collect();
    if hard.is_empty() {
        return Vec::new();
    }
    let flat = |s: &str| s.split_whitespace().collect::<Vec<_>>().join(" ");

    if page_is_empty {
        let reasons = hard
            .iter()
            .map(|e| flat(&detail(e)))
            .collect::<Vec<_>>()
            .join("; ");
        return vec![StructuredBlock::diagnostic(format!(
            "> [!WARNING]\n> Page {page_num} could not be extracted: {reasons}"
        ))];
    }

    hard.into_iter()
        .map(|e| {
            let what = match e {
                PageError::RecognitionFailure { .. } => "OCR failed",
                PageError::AssetPersistFailure { .. } => "Images and equations omitted",
                PageError::RenderFailed { .. } => "Page could not be rendered",
                PageError::LoadFailed { .. } => "Page could not be loaded",
                PageError::ExtractionEmpty { .. } => "Text layer empty",
            };
            StructuredBlock::diagnostic(format!(
                "> [!WARNING]\n> {what} on page {page_num}: {}",
                flat(&detail(e))
            ))
        })
        .collect()
}

fn detail(e: &PageError) -> String {
    match e {
        PageError::LoadFailed { detail, .. }
        | PageError::RenderFailed { detail, .. }
        | PageError::RecognitionFailure { detail, .. }
        | PageError::AssetPersistFailure { detail, .. } => detail.clone(),
        PageError::ExtractionEmpty { .. } => "text layer is empty".to_string(),
    }
}
