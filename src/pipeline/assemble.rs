//! Document assembly: ordered page results → one Markdown document.
//!
//! Steps:
//! 1. Check the page results: every expected page exactly once, in order,
//!    and every referenced asset persisted. Any violation is fatal.
//! 2. Suppress running headers and footers.
//! 3. Render blocks (each run of table rows becomes one GFM table), join
//!    pages with the configured separator, prepend optional YAML front matter.
//! 4. Run [`clean_markdown`] and collect the asset URIs still referenced.

use crate::config::ConversionConfig;
use crate::error::Pdf2MdError;
use crate::model::{Asset, AssetId, BlockKind, StructuredBlock};
use crate::output::{DocumentMetadata, PageResult};
use crate::pipeline::postprocess::{clean_markdown, image_targets};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

/// The assembled document.
#[derive(Debug, Clone, PartialEq)]
pub struct Assembled {
    pub markdown: String,
    /// Asset URIs referenced by `markdown`, in order of first use.
    pub asset_uris: Vec<String>,
    /// Number of blocks removed as repeated headers/footers.
    pub suppressed: usize,
}

/// Assemble `pages` (sorted by page number) into the final document.
///
/// `expected` lists the 1-based page numbers that were scheduled.
pub fn assemble(
    pages: &mut [PageResult],
    expected: &[usize],
    assets: &[Asset],
    metadata: &DocumentMetadata,
    config: &ConversionConfig,
) -> Result<Assembled, Pdf2MdError> {
    check_pages(pages, expected)?;

    let by_id: HashMap<&AssetId, &Asset> = assets.iter().map(|a| (&a.id, a)).collect();
    for page in pages.iter() {
        for id in page.blocks.iter().flat_map(|b| b.assets.iter()) {
            if !by_id.contains_key(id) {
                return Err(Pdf2MdError::DocumentAssemblyFailure {
                    page: page.page_num,
                    reason: format!("block references asset '{id}' which was never persisted"),
                });
            }
        }
    }

    let suppressed = suppress_running_lines(pages, config.header_footer_fraction);

    let mut parts: Vec<String> = Vec::new();
    if config.include_metadata {
        parts.push(format_yaml_front_matter(metadata));
    }
    let mut first = true;
    for page in pages.iter() {
        let body = render_blocks(&page.blocks);
        if body.is_empty() {
            continue;
        }
        if !first {
            parts.push(config.page_separator.render(page.page_num));
        }
        first = false;
        parts.push(body);
    }

    let known: HashSet<&str> = assets.iter().map(|a| a.uri.as_str()).collect();
    let markdown = clean_markdown(&parts.join(""), &known);
    let asset_uris = image_targets(&markdown)
        .into_iter()
        .filter(|u| known.contains(u.as_str()))
        .collect::<Vec<_>>();

    info!(
        "Assembled {} pages: {} bytes, {} assets referenced, {} header/footer blocks suppressed",
        pages.len(),
        markdown.len(),
        asset_uris.len(),
        suppressed
    );
    Ok(Assembled {
        markdown,
        asset_uris,
        suppressed,
    })
}

fn check_pages(pages: &[PageResult], expected: &[usize]) -> Result<(), Pdf2MdError> {
    let mut seen = HashSet::new();
    let mut last = 0usize;
    for page in pages {
        if !seen.insert(page.page_num) {
            return Err(Pdf2MdError::DocumentAssemblyFailure {
                page: page.page_num,
                reason: "duplicate page result".into(),
            });
        }
        if page.page_num < last {
            return Err(Pdf2MdError::DocumentAssemblyFailure {
                page: page.page_num,
                reason: "page results out of order".into(),
            });
        }
        last = page.page_num;
    }
    if let Some(&missing) = expected.iter().find(|p| !seen.contains(*p)) {
        return Err(Pdf2MdError::DocumentAssemblyFailure {
            page: missing,
            reason: "missing page result".into(),
        });
    }
    if let Some(extra) = pages.iter().find(|p| !expected.contains(&p.page_num)) {
        return Err(Pdf2MdError::DocumentAssemblyFailure {
            page: extra.page_num,
            reason: "page was not scheduled".into(),
        });
    }
    Ok(())
}

fn is_running_candidate(block: &StructuredBlock) -> bool {
    block.kind != BlockKind::Diagnostic && block.assets.is_empty() && block.is_single_line()
}

/// Remove single-line blocks repeated on at least `fraction` of the pages,
/// keeping the first occurrence. Returns the number removed.
fn suppress_running_lines(pages: &mut [PageResult], fraction: f32) -> usize {
    if pages.len() < 2 {
        return 0;
    }
    let mut page_counts: HashMap<String, usize> = HashMap::new();
    for page in pages.iter() {
        let distinct: HashSet<String> = page
            .blocks
            .iter()
            .filter(|b| is_running_candidate(b))
            .map(|b| b.markdown.trim().to_string())
            .collect();
        for key in distinct {
            *page_counts.entry(key).or_default() += 1;
        }
    }

    let needed = fraction as f64 * pages.len() as f64;
    let running: HashSet<String> = page_counts
        .into_iter()
        .filter(|(_, n)| *n as f64 + 1e-6 >= needed)
        .map(|(k, _)| k)
        .collect();
    if running.is_empty() {
        return 0;
    }
    debug!("Running headers/footers: {:?}", running);

    let mut kept_once: HashSet<String> = HashSet::new();
    let mut removed = 0;
    for page in pages.iter_mut() {
        page.blocks.retain(|b| {
            if !is_running_candidate(b) {
                return true;
            }
            let key = b.markdown.trim();
            if !running.contains(key) || kept_once.insert(key.to_string()) {
                return true;
            }
            removed += 1;
            false
        });
    }
    removed
}

/// Cells in a table row, ignoring escaped pipes.
fn cell_count(row: &str) -> usize {
    let mut pipes = 0usize;
    let mut escaped = false;
    for c in row.trim().chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '|' => pipes += 1,
            _ => {}
        }
    }
    pipes.saturating_sub(1).max(1)
}

/// Join blocks with blank lines.
///
/// A run of table rows renders as one GFM table: rows on adjacent lines and
/// the delimiter row after the first. The delimiter comes from the block
/// kinds, so a data row that happens to look like one stays a data row.
pub(crate) fn render_blocks(blocks: &[StructuredBlock]) -> String {
    let mut out = String::new();
    let mut prev: Option<BlockKind> = None;
    for block in blocks {
        let md = block.markdown.trim();
        if md.is_empty() {
            continue;
        }
        let row = block.kind == BlockKind::TableRow;
        let continues_table = row && prev == Some(BlockKind::TableRow);
        match prev {
            Some(_) if continues_table => out.push('\n'),
            Some(_) => out.push_str("\n\n"),
            None => {}
        }
        out.push_str(md);
        if row && !continues_table {
            out.push_str(&format!("\n|{}", " --- |".repeat(cell_count(md))));
        }
        prev = Some(block.kind);
    }
    out
}

fn yaml_quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Format document metadata as YAML front matter.
fn format_yaml_front_matter(meta: &DocumentMetadata) -> String {
    let mut yaml = String::from("---\n");

    if let Some(ref t) = meta.title {
        yaml.push_str(&format!("title: {}\n", yaml_quote(t)));
    }
    if let Some(ref a) = meta.author {
        yaml.push_str(&format!("author: {}\n", yaml_quote(a)));
    }
    if let Some(ref s) = meta.subject {
        yaml.push_str(&format!("subject: {}\n", yaml_quote(s)));
    }
    if let Some(ref c) = meta.creator {
        yaml.push_str(&format!("creator: {}\n", yaml_quote(c)));
    }
    if let Some(ref p) = meta.producer {
        yaml.push_str(&format!("producer: {}\n", yaml_quote(p)));
    }
    yaml.push_str(&format!("pages: {}\n", meta.page_count));
    if !meta.pdf_version.is_empty() {
        yaml.push_str(&format!("pdf_version: {}\n", yaml_quote(&meta.pdf_version)));
    }

    yaml.push_str("---\n\n");
    yaml
}
