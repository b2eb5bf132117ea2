//! Native text extraction: glyph runs → [`TextSpan`]s.
//!
//! Runs are grouped into lines by vertical overlap and merged left to
//! right. A horizontal gap wider than `column_gap_factor × font size`, or a
//! change in font size, starts a new span so that table cells and columns
//! stay apart.

use crate::config::ConversionConfig;
use crate::model::TextSpan;
use crate::pipeline::source::GlyphRun;

/// Gap, in multiples of the font size, above which a space is inserted.
const WORD_GAP: f32 = 0.15;
/// Font size change that always starts a new span.
const SIZE_STEP: f32 = 1.0;

/// Merge glyph runs into text spans in reading order.
///
/// Returns an empty vector when the runs carry no visible text.
pub fn text_spans(runs: &[GlyphRun], config: &ConversionConfig) -> Vec<TextSpan> {
    let mut order: Vec<&GlyphRun> = runs.iter().collect();
    order.sort_by(|a, b| {
        a.bbox
            .center_y()
            .total_cmp(&b.bbox.center_y())
            .then(a.bbox.x.total_cmp(&b.bbox.x))
    });

    let mut lines: Vec<Vec<&GlyphRun>> = Vec::new();
    for run in order {
        match lines.last_mut() {
            Some(line)
                if run.bbox.center_y() >= line[0].bbox.y
                    && run.bbox.center_y() <= line[0].bbox.bottom() =>
            {
                line.push(run)
            }
            _ => lines.push(vec![run]),
        }
    }

    let mut spans = Vec::new();
    for mut line in lines {
        line.sort_by(|a, b| a.bbox.x.total_cmp(&b.bbox.x));
        merge_line(&line, config.column_gap_factor, &mut spans);
    }
    spans
}

fn merge_line(line: &[&GlyphRun], column_gap_factor: f32, out: &mut Vec<TextSpan>) {
    let mut current: Option<TextSpan> = None;
    let mut pending_space = false;

    for run in line {
        if run.text.trim().is_empty() {
            pending_space = current.is_some();
            continue;
        }

        if let Some(span) = current.as_mut() {
            let size = span.font_size.max(run.font_size).max(1.0);
            let gap = run.bbox.x - span.bbox.right();
            let column_break = gap > column_gap_factor * size;
            let size_change = (span.font_size - run.font_size).abs() >= SIZE_STEP;
            if !column_break && !size_change {
                if (pending_space || gap > WORD_GAP * size)
                    && !span.text.ends_with(char::is_whitespace)
                    && !run.text.starts_with(char::is_whitespace)
                {
                    span.text.push(' ');
                }
                span.text.push_str(&run.text);
                span.bbox = span.bbox.union(&run.bbox);
                pending_space = false;
                continue;
            }
        }

        flush(current.take(), out);
        current = Some(TextSpan {
            text: run.text.clone(),
            bbox: run.bbox,
            font_size: run.font_size,
        });
        pending_space = false;
    }
    flush(current, out);
}

fn flush(span: Option<TextSpan>, out: &mut Vec<TextSpan>) {
    if let Some(mut span) = span {
        let trimmed = span.text.split_whitespace().collect::<Vec<_>>().join(" ");
        if !trimmed.is_empty() {
            span.text = trimmed;
            out.push(span);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BBox;

    fn run(text: &str, x: f32, y: f32, w: f32, size: f32) -> GlyphRun {
        GlyphRun::new(text, BBox::new(x, y, w, size * 1.2), size)
    }

    #[test]
    fn words_on_a_line_merge_with_spaces() {
        let runs = vec![
            run("world", 52.0, 100.0, 25.0, 10.0),
            run("Hello", 20.0, 100.0, 30.0, 10.0),
        ];
        let spans = text_spans(&runs, &ConversionConfig::default());
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].text, "Hello world");
        assert_eq!(spans[0].bbox, BBox::new(20.0, 100.0, 57.0, 12.0));
    }

    #[test]
    fn wide_gap_splits_cells() {
        let runs = vec![
            run("Name", 20.0, 100.0, 30.0, 10.0),
            run("Value", 120.0, 100.0, 30.0, 10.0),
        ];
        let spans = text_spans(&runs, &ConversionConfig::default());
        let texts: Vec<_> = spans.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(texts, vec!["Name", "Value"]);
    }

    #[test]
    fn font_size_change_splits() {
        let runs = vec![
            run("Title", 20.0, 100.0, 60.0, 24.0),
            run("note", 82.0, 105.0, 20.0, 10.0),
        ];
        let spans = text_spans(&runs, &ConversionConfig::default());
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].font_size, 24.0);
    }

    #[test]
    fn lines_are_ordered_top_to_bottom() {
        let runs = vec![
            run("second", 20.0, 130.0, 40.0, 10.0),
            run("first", 20.0, 100.0, 40.0, 10.0),
        ];
        let spans = text_spans(&runs, &ConversionConfig::default());
        assert_eq!(spans[0].text, "first");
        assert_eq!(spans[1].text, "second");
    }

    #[test]
    fn whitespace_only_runs_yield_nothing() {
        let runs = vec![run("   ", 20.0, 100.0, 40.0, 10.0)];
        assert!(text_spans(&runs, &ConversionConfig::default()).is_empty());
        assert!(text_spans(&[], &ConversionConfig::default()).is_empty());
    }
}
