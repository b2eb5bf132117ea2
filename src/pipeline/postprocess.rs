//! Post-processing: deterministic cleanup of assembled Markdown.
//!
//! Rules (applied in order):
//! 1. Normalise line endings (CRLF → LF)
//! 2. Trim trailing whitespace per line
//! 3. Collapse runs of blank lines to one
//! 4. Ensure heading lines have a blank line before them
//! 5. Demote image links whose target was never persisted to `*alt*`
//! 6. Strip invisible Unicode (zero-width spaces, BOM, soft hyphens)
//! 7. Ensure the text ends with exactly one newline
//!
//! Every rule is a pure `&str → String` function. Table rows pass through
//! untouched; their delimiter rows are written during assembly.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

/// Apply all cleanup rules. Image links are kept only when their target is
/// in `known_uris`.
pub fn clean_markdown(input: &str, known_uris: &HashSet<&str>) -> String {
    let s = normalise_line_endings(input);
    let s = trim_trailing_whitespace(&s);
    let s = collapse_blank_lines(&s);
    let s = normalise_heading_spacing(&s);
    let s = remove_unknown_images(&s, known_uris);
    let s = remove_invisible_chars(&s);
    ensure_final_newline(&s)
}

// ── Fences (refiner output) ──────────────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```(?:[a-z]+)?\n(.*)\n```\s*$").unwrap());

/// Remove a code fence wrapped around the whole of `input`.
pub fn strip_markdown_fences(input: &str) -> String {
    if let Some(caps) = RE_OUTER_FENCES.captures(input.trim()) {
        caps[1].to_string()
    } else {
        input.trim().to_string()
    }
}

// ── Rule 1 ───────────────────────────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule 2 ───────────────────────────────────────────────────────────────

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Rule 3 ───────────────────────────────────────────────────────────────

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n").to_string()
}

// ── Rule 4 ───────────────────────────────────────────────────────────────

static RE_HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"^#{1,6} ").unwrap());

fn normalise_heading_spacing(input: &str) -> String {
    let mut result = String::with_capacity(input.len() + 64);
    for (i, line) in input.lines().enumerate() {
        if RE_HEADING.is_match(line) && i > 0 {
            let trimmed = result.trim_end_matches('\n');
            result.truncate(trimmed.len());
            result.push_str("\n\n");
        }
        result.push_str(line);
        result.push('\n');
    }
    result
}

// ── Rule 5: dangling image links ─────────────────────────────────────────

static RE_IMAGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"!\[([^\]]*)\]\(([^)]*)\)").unwrap());

fn remove_unknown_images(input: &str, known_uris: &HashSet<&str>) -> String {
    RE_IMAGE
        .replace_all(input, |caps: &regex::Captures<'_>| {
            if known_uris.contains(caps[2].trim()) {
                caps[0].to_string()
            } else {
                let alt = caps[1].trim();
                if alt.is_empty() {
                    String::new()
                } else {
                    format!("*{}*", alt)
                }
            }
        })
        .to_string()
}

/// Image targets referenced by `markdown`, in order of first appearance.
pub fn image_targets(markdown: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    RE_IMAGE
        .captures_iter(markdown)
        .map(|c| c[2].trim().to_string())
        .filter(|u| seen.insert(u.clone()))
        .collect()
}

// ── Rule 6 ───────────────────────────────────────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
        ],
        "",
    )
}

// ── Rule 7 ───────────────────────────────────────────────────────────────

fn ensure_final_newline(input: &str) -> String {
    let trimmed = input.trim_end();
    if trimmed.is_empty() {
        String::from("\n")
    } else {
        format!("{}\n", trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_fences() {
        assert_eq!(strip_markdown_fences("```json\n[1]\n```"), "[1]");
        assert_eq!(strip_markdown_fences("```\n# Hello\n```"), "# Hello");
        assert_eq!(strip_markdown_fences("  plain  "), "plain");
    }

    #[test]
    fn collapse_and_trim() {
        assert_eq!(collapse_blank_lines("a\n\n\n\n\nb"), "a\n\nb");
        assert_eq!(trim_trailing_whitespace("  x   \ny  "), "  x\ny");
        assert_eq!(normalise_line_endings("a\r\nb\rc"), "a\nb\nc");
    }

    #[test]
    fn heading_gets_blank_line() {
        let result = normalise_heading_spacing("text\n## Heading\nmore");
        assert!(result.contains("text\n\n## Heading\n"));
        assert!(!normalise_heading_spacing("a\n#hashtag").contains("\n\n"));
    }

    #[test]
    fn table_rows_pass_through() {
        let input = "| A | B |\n| --- | --- |\n| - | - |\n| --- | --- |\n| 1 | 2 |";
        assert_eq!(clean_markdown(input, &HashSet::new()), format!("{input}\n"));
    }

    #[test]
    fn unknown_images_demoted() {
        let known: HashSet<&str> = ["assets/a.png"].into_iter().collect();
        let result = remove_unknown_images("![Kept](assets/a.png) ![Gone](assets/b.png)", &known);
        assert_eq!(result, "![Kept](assets/a.png) *Gone*");
    }

    #[test]
    fn image_targets_are_deduplicated() {
        let md = "![a](x.png)\n![b](y.png)\n![c](x.png)";
        assert_eq!(image_targets(md), vec!["x.png", "y.png"]);
    }

    #[test]
    fn invisible_and_final_newline() {
        assert_eq!(remove_invisible_chars("a\u{200B}b\u{FEFF}"), "ab");
        assert_eq!(ensure_final_newline("x\n\n"), "x\n");
        assert_eq!(ensure_final_newline(""), "\n");
    }

    #[test]
    fn full_pipeline() {
        let known = HashSet::new();
        let input = "# Title\r\n\r\nSome\u{200B} text   \n\n\n\n## Section\n![Lost](gone.png)";
        let result = clean_markdown(input, &known);
        assert_eq!(result, "# Title\n\nSome text\n\n## Section\n*Lost*\n");
    }
}
