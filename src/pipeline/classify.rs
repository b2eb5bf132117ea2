//! Page classification: decide which extraction paths a page needs.

use crate::config::ConversionConfig;
use crate::model::PageClass;
use crate::pipeline::source::PageMetrics;
use tracing::debug;

/// Classify a page from its metrics. Pure function.
///
/// * `native-text`: text coverage strictly above `native_text_coverage` and
///   at least `min_native_chars` characters.
/// * `scanned`: text coverage strictly below `scanned_text_coverage` and
///   image coverage strictly above `scanned_image_coverage`.
/// * `mixed`: everything else, including exact ties on a threshold.
///
/// `forced` overrides the decision so that OCR always runs.
pub fn classify(metrics: &PageMetrics, forced: bool, config: &ConversionConfig) -> PageClass {
    if forced {
        return if metrics.has_text_layer() {
            PageClass::Mixed
        } else {
            PageClass::Scanned
        };
    }

    if metrics.text_coverage > config.native_text_coverage
        && metrics.char_count >= config.min_native_chars
    {
        return PageClass::NativeText;
    }
    if metrics.text_coverage < config.scanned_text_coverage
        && metrics.image_coverage > config.scanned_image_coverage
    {
        return PageClass::Scanned;
    }

    debug!(
        "ambiguous page (text {:.3}, image {:.3}, {} fonts, {} chars) → mixed",
        metrics.text_coverage, metrics.image_coverage, metrics.font_count, metrics.char_count
    );
    PageClass::Mixed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(text: f32, image: f32, chars: usize) -> PageMetrics {
        PageMetrics {
            width: 612.0,
            height: 792.0,
            text_coverage: text,
            image_coverage: image,
            font_count: 1,
            char_count: chars,
        }
    }

    #[test]
    fn dense_text_is_native() {
        let c = ConversionConfig::default();
        assert_eq!(classify(&metrics(0.3, 0.0, 2000), false, &c), PageClass::NativeText);
    }

    #[test]
    fn image_only_page_is_scanned() {
        let c = ConversionConfig::default();
        assert_eq!(classify(&metrics(0.0, 1.0, 0), false, &c), PageClass::Scanned);
    }

    #[test]
    fn ties_resolve_to_mixed() {
        let c = ConversionConfig::default();
        let at_native = metrics(c.native_text_coverage, 0.0, 500);
        assert_eq!(classify(&at_native, false, &c), PageClass::Mixed);
        let at_scanned = metrics(c.scanned_text_coverage, 0.9, 3);
        assert_eq!(classify(&at_scanned, false, &c), PageClass::Mixed);
        let at_image = metrics(0.0, c.scanned_image_coverage, 0);
        assert_eq!(classify(&at_image, false, &c), PageClass::Mixed);
    }

    #[test]
    fn sparse_text_is_never_native() {
        let c = ConversionConfig::default();
        assert_eq!(classify(&metrics(0.4, 0.0, 10), false, &c), PageClass::Mixed);
    }

    #[test]
    fn low_text_without_images_is_mixed() {
        let c = ConversionConfig::default();
        assert_eq!(classify(&metrics(0.001, 0.1, 2), false, &c), PageClass::Mixed);
    }

    #[test]
    fn forcing_ocr_overrides() {
        let c = ConversionConfig::default();
        assert_eq!(classify(&metrics(0.3, 0.0, 2000), true, &c), PageClass::Mixed);
        assert_eq!(classify(&metrics(0.0, 0.0, 0), true, &c), PageClass::Scanned);
    }
}
