//! CLI binary for hybrid-pdf2md.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `ConversionConfig` and prints results.

use anyhow::{Context, Result};
use clap::Parser;
use hybrid_pdf2md::{
    convert, inspect, write_atomic, ConversionConfig, ConversionOutput, ConversionProgressCallback,
    DocumentMetadata, PageClass, PageSelection, PageSeparator, ProgressCallback,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const SPINNER: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Live progress bar plus one log line per page. Pages finish out of
/// order, so per-page state is keyed by page number.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<usize, Instant>>,
    classes: Mutex<HashMap<usize, PageClass>>,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    /// Spinner until `on_conversion_start` reports the page count.
    fn new_dynamic() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(SPINNER);

        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Opening PDF…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
            classes: Mutex::new(HashMap::new()),
            errors: AtomicUsize::new(0),
        })
    }

    fn activate_bar(&self, total: usize) {
        let progress_style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} pages  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(SPINNER);

        self.bar.set_length(total as u64);
        self.bar.set_style(progress_style);
        self.bar.set_prefix("Converting");
        self.bar.reset_eta();
    }

    fn elapsed_secs(&self, page_num: usize) -> f64 {
        self.start_times
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&page_num)
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }

    fn class_label(&self, page_num: usize) -> String {
        self.classes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&page_num)
            .map(|c| c.to_string())
            .unwrap_or_default()
    }
}

impl ConversionProgressCallback for CliProgressCallback {
    fn on_conversion_start(&self, total_pages: usize) {
        self.activate_bar(total_pages);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Starting conversion of {total_pages} pages…"))
        ));
    }

    fn on_page_start(&self, page_num: usize, _total: usize) {
        self.start_times
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(page_num, Instant::now());
        self.bar.set_message(format!("page {page_num}"));
    }

    fn on_page_classified(&self, page_num: usize, class: PageClass) {
        self.classes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(page_num, class);
    }

    fn on_page_complete(&self, page_num: usize, total: usize, fragment_count: usize) {
        let secs = self.elapsed_secs(page_num);
        let class = self.class_label(page_num);
        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {:<11}  {:<14}  {}",
            green("✓"),
            page_num,
            total,
            dim(&class),
            dim(&format!("{fragment_count:>5} fragments")),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_page_error(&self, page_num: usize, total: usize, error: &str) {
        let secs = self.elapsed_secs(page_num);
        let class = self.class_label(page_num);
        self.errors.fetch_add(1, Ordering::SeqCst);

        let msg: String = if error.chars().count() > 80 {
            format!("{}\u{2026}", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };

        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {:<11}  {}  {}",
            yellow("⚠"),
            page_num,
            total,
            dim(&class),
            yellow(&msg),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_conversion_complete(&self, total_pages: usize, success_count: usize) {
        let degraded = total_pages.saturating_sub(success_count);
        self.bar.finish_and_clear();

        if degraded == 0 {
            eprintln!(
                "{} {} pages converted cleanly",
                green("✔"),
                bold(&success_count.to_string())
            );
        } else {
            eprintln!(
                "{} {}/{} pages clean  ({} with diagnostics)",
                if degraded == total_pages {
                    red("✘")
                } else {
                    cyan("⚠")
                },
                bold(&success_count.to_string()),
                total_pages,
                yellow(&degraded.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Basic conversion (stdout, assets inlined as data URIs)
  pdf2md document.pdf

  # Convert to file; assets land in ./paper_assets/
  pdf2md paper.pdf -o paper.md

  # Explicit asset directory and URL prefix
  pdf2md paper.pdf -o site/paper.md --asset-dir site/img --asset-url-prefix /img

  # Scanned book in German, OCR every page
  pdf2md --force-ocr --ocr-lang deu book.pdf -o book.md

  # OCR only pages 3 and 7
  pdf2md --force-ocr-pages 3,7 report.pdf

  # Clean up structure with an LLM pass
  pdf2md --refine --provider openai --model gpt-4.1-mini report.pdf

  # Inspect PDF metadata
  pdf2md --inspect-only document.pdf

  # JSON output (blocks, assets, per-page diagnostics)
  pdf2md --json --metadata document.pdf > output.json

HOW PAGES ARE READ:
  native-text  text layer only
  scanned      OCR only (tesseract)
  mixed        text layer + OCR, native text wins where both overlap

ENVIRONMENT VARIABLES:
  PDFIUM_LIB_PATH         Path to an existing libpdfium
  PDF2MD_TESSERACT        Path to the tesseract executable
  OPENAI_API_KEY          OpenAI API key (only with --refine)
  ANTHROPIC_API_KEY       Anthropic API key (only with --refine)
  EDGEQUAKE_LLM_PROVIDER  Provider override for --refine
  EDGEQUAKE_MODEL         Model override for --refine
  RUST_LOG                Log filter, overrides --verbose/--quiet
"#;

/// Convert PDF files and URLs to Markdown with native text extraction and OCR fallback.
#[derive(Parser, Debug)]
#[command(
    name = "pdf2md",
    version,
    about = "Convert PDF files and URLs to Markdown (native text + OCR fallback)",
    long_about = "Convert PDF documents (local files or URLs) to structured Markdown. \
Pages with a text layer are read directly; scanned pages are recognised with tesseract. \
Embedded images and equations are extracted as PNG assets and referenced from the Markdown.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local PDF file path or HTTP/HTTPS URL.
    input: String,

    /// Write Markdown to this file instead of stdout.
    #[arg(short, long, env = "PDF2MD_OUTPUT")]
    output: Option<PathBuf>,

    /// Directory for image and equation PNGs.
    ///
    /// Defaults to `<output stem>_assets/` next to `--output`; without
    /// either, assets are inlined as data URIs.
    #[arg(long, env = "PDF2MD_ASSET_DIR")]
    asset_dir: Option<PathBuf>,

    /// URL prefix used in image links (defaults to the asset directory name).
    #[arg(long, env = "PDF2MD_ASSET_URL_PREFIX")]
    asset_url_prefix: Option<String>,

    /// Override the document id that prefixes asset names.
    #[arg(long, env = "PDF2MD_DOCUMENT_ID")]
    document_id: Option<String>,

    /// Run OCR on every page.
    #[arg(long, env = "PDF2MD_FORCE_OCR")]
    force_ocr: bool,

    /// Run OCR on these pages only (1-based, comma separated).
    #[arg(long, env = "PDF2MD_FORCE_OCR_PAGES", value_delimiter = ',')]
    force_ocr_pages: Vec<usize>,

    /// Tesseract language(s), e.g. eng or eng+deu.
    #[arg(long, env = "PDF2MD_OCR_LANG", default_value = "eng")]
    ocr_lang: String,

    /// Tesseract executable.
    #[arg(long, env = "PDF2MD_TESSERACT", default_value = "tesseract")]
    tesseract: PathBuf,

    /// Per-page OCR timeout in seconds.
    #[arg(long, env = "PDF2MD_OCR_TIMEOUT", default_value_t = 120)]
    ocr_timeout: u64,

    /// OCR words below this confidence (0–1) are kept but annotated.
    #[arg(long, env = "PDF2MD_OCR_CONFIDENCE_FLOOR", default_value_t = 0.5)]
    ocr_confidence_floor: f32,

    /// Rendering DPI for OCR and equation crops (72–600).
    #[arg(long, env = "PDF2MD_DPI", default_value_t = 300,
          value_parser = clap::value_parser!(u32).range(72..=600))]
    dpi: u32,

    /// Pages processed in parallel (default: available CPUs).
    #[arg(short, long, env = "PDF2MD_CONCURRENCY")]
    concurrency: Option<usize>,

    /// Page selection: all, 5, 3-15, or 1-3,7.
    #[arg(long, env = "PDF2MD_PAGES", default_value = "all")]
    pages: String,

    /// Page separator: none, hr, comment, or custom string.
    #[arg(long, env = "PDF2MD_SEPARATOR", default_value = "none")]
    separator: String,

    /// Share of pages (0–1] a line must repeat on to count as header/footer.
    #[arg(long, env = "PDF2MD_HEADER_FOOTER_FRACTION", default_value_t = 0.8)]
    header_footer_fraction: f32,

    /// PDF user password for encrypted documents.
    #[arg(long, env = "PDF2MD_PASSWORD")]
    password: Option<String>,

    /// Refine structure with an LLM after layout analysis.
    #[arg(long, env = "PDF2MD_REFINE")]
    refine: bool,

    /// LLM model ID for --refine.
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider for --refine: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Path to a text file replacing the refinement system prompt.
    #[arg(long, env = "PDF2MD_REFINE_PROMPT")]
    refine_prompt: Option<PathBuf>,

    /// Retries per page on LLM failure.
    #[arg(long, env = "PDF2MD_MAX_RETRIES", default_value_t = 2)]
    max_retries: u32,

    /// Per-call LLM timeout in seconds.
    #[arg(long, env = "PDF2MD_API_TIMEOUT", default_value_t = 60)]
    api_timeout: u64,

    /// Prepend YAML front-matter with document metadata.
    #[arg(long, env = "PDF2MD_METADATA")]
    metadata: bool,

    /// Output structured JSON (ConversionOutput) instead of Markdown.
    #[arg(long, env = "PDF2MD_JSON")]
    json: bool,

    /// Exit non-zero when any page carries a diagnostic.
    #[arg(long, env = "PDF2MD_STRICT")]
    strict: bool,

    /// Disable progress bar.
    #[arg(long, env = "PDF2MD_NO_PROGRESS")]
    no_progress: bool,

    /// Print PDF metadata only, no conversion.
    #[arg(long)]
    inspect_only: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "PDF2MD_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "PDF2MD_QUIET")]
    quiet: bool,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "PDF2MD_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO logs; --verbose always wins.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Inspect-only mode ────────────────────────────────────────────────
    if cli.inspect_only {
        let meta = inspect(&cli.input).await.context("Failed to inspect PDF")?;

        if cli.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&meta).context("Failed to serialize metadata")?
            );
        } else {
            print_metadata(&cli.input, &meta);
        }
        return Ok(());
    }

    // ── Build config ─────────────────────────────────────────────────────
    let progress_cb: Option<ProgressCallback> = if show_progress {
        let cb = CliProgressCallback::new_dynamic();
        Some(cb as Arc<dyn ConversionProgressCallback>)
    } else {
        None
    };

    let config = build_config(&cli, progress_cb).await?;

    // ── Run conversion ───────────────────────────────────────────────────
    let output = convert(&cli.input, &config)
        .await
        .context("Conversion failed")?;

    if let Some(ref output_path) = cli.output {
        let body = if cli.json {
            serde_json::to_string_pretty(&output).context("Failed to serialise output")?
        } else {
            output.markdown.clone()
        };
        write_atomic(output_path, &body)
            .await
            .with_context(|| format!("Failed to write {}", output_path.display()))?;
    } else if cli.json {
        let json = serde_json::to_string_pretty(&output).context("Failed to serialise output")?;
        println!("{json}");
    } else {
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        handle
            .write_all(output.markdown.as_bytes())
            .context("Failed to write to stdout")?;
    }

    if !cli.quiet && !cli.json {
        print_summary(&output, cli.output.as_deref());
    }

    if cli.strict {
        output
            .into_result()
            .context("Some pages were converted with diagnostics")?;
    }
    Ok(())
}

fn print_summary(output: &ConversionOutput, path: Option<&Path>) {
    let s = &output.stats;
    let target = path
        .map(|p| format!("  →  {}", bold(&p.display().to_string())))
        .unwrap_or_default();
    eprintln!(
        "{}  {}/{} pages  {}ms{}",
        if s.failed_pages == 0 { green("✔") } else { cyan("⚠") },
        s.processed_pages,
        s.processed_pages + s.failed_pages,
        s.total_duration_ms,
        target,
    );
    eprintln!(
        "   {}",
        dim(&format!(
            "{} native / {} scanned / {} mixed  ·  {} OCR lines ({} low confidence)  ·  {} images, {} equations  ·  {} header/footer lines removed",
            s.native_pages,
            s.scanned_pages,
            s.mixed_pages,
            s.ocr_spans,
            s.low_confidence_spans,
            s.image_assets,
            s.equation_assets,
            s.suppressed_blocks,
        ))
    );
}

/// Asset directory and URL prefix: explicit flags first, then a sibling
/// `<stem>_assets/` directory of `--output`.
fn asset_location(cli: &Cli) -> Option<(PathBuf, String)> {
    if let Some(ref dir) = cli.asset_dir {
        let prefix = cli.asset_url_prefix.clone().unwrap_or_else(|| {
            dir.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "assets".to_string())
        });
        return Some((dir.clone(), prefix));
    }
    let output = cli.output.as_ref()?;
    let stem = output.file_stem()?.to_string_lossy().into_owned();
    let name = format!("{stem}_assets");
    let dir = output
        .parent()
        .map(|p| p.join(&name))
        .unwrap_or_else(|| PathBuf::from(&name));
    Some((dir, cli.asset_url_prefix.clone().unwrap_or(name)))
}

/// Map CLI args to `ConversionConfig`.
async fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<ConversionConfig> {
    let refine_prompt = if let Some(ref path) = cli.refine_prompt {
        Some(
            tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read refinement prompt from {:?}", path))?,
        )
    } else {
        None
    };

    let pages = parse_pages(&cli.pages)?;
    let separator = parse_separator(&cli.separator);

    let mut builder = ConversionConfig::builder()
        .dpi(cli.dpi)
        .pages(pages)
        .force_ocr(cli.force_ocr)
        .force_ocr_pages(cli.force_ocr_pages.clone())
        .ocr_language(&cli.ocr_lang)
        .tesseract_path(&cli.tesseract)
        .ocr_timeout_secs(cli.ocr_timeout)
        .ocr_confidence_floor(cli.ocr_confidence_floor)
        .header_footer_fraction(cli.header_footer_fraction)
        .page_separator(separator)
        .include_metadata(cli.metadata)
        .download_timeout_secs(cli.download_timeout)
        .refine_with_llm(cli.refine)
        .max_retries(cli.max_retries)
        .api_timeout_secs(cli.api_timeout);

    if let Some(n) = cli.concurrency {
        builder = builder.concurrency(n);
    }
    if let Some((dir, prefix)) = asset_location(cli) {
        builder = builder.asset_dir(dir).asset_url_prefix(prefix);
    }
    if let Some(ref id) = cli.document_id {
        builder = builder.document_id(id);
    }
    if let Some(ref pwd) = cli.password {
        builder = builder.password(pwd);
    }
    if let Some(ref model) = cli.model {
        builder = builder.model(model);
    }
    if let Some(ref provider) = cli.provider {
        builder = builder.provider_name(provider);
    }
    if let Some(prompt) = refine_prompt {
        builder = builder.refine_prompt(prompt);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

fn print_metadata(input: &str, meta: &DocumentMetadata) {
    let pages = meta.page_count.to_string();
    let rows: [(&str, Option<&str>); 9] = [
        ("File", Some(input)),
        ("Title", meta.title.as_deref()),
        ("Author", meta.author.as_deref()),
        ("Subject", meta.subject.as_deref()),
        ("Pages", Some(pages.as_str())),
        ("PDF Version", Some(meta.pdf_version.as_str())),
        ("Producer", meta.producer.as_deref()),
        ("Creator", meta.creator.as_deref()),
        ("Created", meta.creation_date.as_deref()),
    ];
    for (label, value) in rows {
        if let Some(v) = value {
            println!("{:<13}{}", format!("{label}:"), v);
        }
    }
}

/// Parse `--pages`: `all`, a page, a range, or a comma list mixing both
/// (`1-3,7`). Pages are 1-based.
fn parse_pages(s: &str) -> Result<PageSelection> {
    let s = s.trim().to_lowercase();
    if s == "all" {
        return Ok(PageSelection::All);
    }

    let page = |raw: &str| -> Result<usize> {
        let n: usize = raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid page number: '{}'", raw.trim()))?;
        if n == 0 {
            anyhow::bail!("Pages are 1-indexed, minimum is 1 (got 0)");
        }
        Ok(n)
    };
    let range = |part: &str| -> Result<Option<(usize, usize)>> {
        let Some((a, b)) = part.split_once('-') else {
            return Ok(None);
        };
        let (a, b) = (page(a)?, page(b)?);
        if a > b {
            anyhow::bail!("Invalid page range '{a}-{b}': start must be <= end");
        }
        Ok(Some((a, b)))
    };

    if !s.contains(',') {
        return Ok(match range(&s)? {
            Some((a, b)) => PageSelection::Range(a, b),
            None => PageSelection::Single(page(&s)?),
        });
    }

    let mut pages = Vec::new();
    for part in s.split(',').filter(|p| !p.trim().is_empty()) {
        match range(part)? {
            Some((a, b)) => pages.extend(a..=b),
            None => pages.push(page(part)?),
        }
    }
    Ok(PageSelection::Set(pages))
}

/// Parse `--separator` string into `PageSeparator`.
fn parse_separator(s: &str) -> PageSeparator {
    match s.to_lowercase().as_str() {
        "none" => PageSeparator::None,
        "hr" | "---" => PageSeparator::HorizontalRule,
        "comment" => PageSeparator::Comment,
        _ => PageSeparator::Custom(s.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_specs_parse() {
        assert!(matches!(parse_pages("all").unwrap(), PageSelection::All));
        assert!(matches!(parse_pages("4").unwrap(), PageSelection::Single(4)));
        assert!(matches!(parse_pages("2-5").unwrap(), PageSelection::Range(2, 5)));
        assert!(matches!(
            parse_pages("1,3").unwrap(),
            PageSelection::Set(ref v) if v == &vec![1, 3]
        ));
        assert!(matches!(
            parse_pages("1-3, 7").unwrap(),
            PageSelection::Set(ref v) if v == &vec![1, 2, 3, 7]
        ));
        assert!(parse_pages("5-2").is_err());
        assert!(parse_pages("0").is_err());
    }

    #[test]
    fn assets_default_next_to_output() {
        let cli = Cli::parse_from(["pdf2md", "in.pdf", "-o", "out/paper.md"]);
        let (dir, prefix) = asset_location(&cli).unwrap();
        assert_eq!(dir, PathBuf::from("out/paper_assets"));
        assert_eq!(prefix, "paper_assets");

        let stdout = Cli::parse_from(["pdf2md", "in.pdf"]);
        assert!(asset_location(&stdout).is_none());
    }

    #[test]
    fn custom_separator_keeps_case() {
        assert!(matches!(parse_separator("HR"), PageSeparator::HorizontalRule));
        assert!(matches!(parse_separator("* * *"), PageSeparator::Custom(ref s) if s == "* * *"));
    }
}
