//! Progress-callback trait for per-page conversion events.
//!
//! Inject an [`Arc<dyn ConversionProgressCallback>`] via
//! [`crate::config::ConversionConfigBuilder::progress_callback`] to receive
//! events as the pipeline processes each page.
//!
//! # Example
//!
//! ```rust
//! use hybrid_pdf2md::{ConversionProgressCallback, ConversionConfig, PageClass};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct ScanCounter {
//!     scanned: AtomicUsize,
//! }
//!
//! impl ConversionProgressCallback for ScanCounter {
//!     fn on_page_classified(&self, _page_num: usize, class: PageClass) {
//!         if class == PageClass::Scanned {
//!             self.scanned.fetch_add(1, Ordering::SeqCst);
//!         }
//!     }
//! }
//!
//! let config = ConversionConfig::builder()
//!     .progress_callback(Arc::new(ScanCounter { scanned: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use crate::model::PageClass;
use std::sync::Arc;

/// Called by the conversion pipeline as it processes each page.
///
/// Pages run concurrently, so every method may be called from several
/// threads at once. All methods default to no-ops.
pub trait ConversionProgressCallback: Send + Sync {
    /// Called once before any page is loaded.
    fn on_conversion_start(&self, total_pages: usize) {
        let _ = total_pages;
    }

    /// Called when a page task starts.
    fn on_page_start(&self, page_num: usize, total_pages: usize) {
        let _ = (page_num, total_pages);
    }

    /// Called once the page class is known, before extraction.
    fn on_page_classified(&self, page_num: usize, class: PageClass) {
        let _ = (page_num, class);
    }

    /// Called when a page finished extraction without hard errors.
    ///
    /// `fragment_count` is the number of fragments extracted.
    fn on_page_complete(&self, page_num: usize, total_pages: usize, fragment_count: usize) {
        let _ = (page_num, total_pages, fragment_count);
    }

    /// Called when a page finished with at least one hard error.
    fn on_page_error(&self, page_num: usize, total_pages: usize, error: &str) {
        let _ = (page_num, total_pages, error);
    }

    /// Called once after all pages have been attempted.
    fn on_conversion_complete(&self, total_pages: usize, success_count: usize) {
        let _ = (total_pages, success_count);
    }
}

/// A no-op implementation, the default when no callback is configured.
pub struct NoopProgressCallback;

impl ConversionProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::ConversionConfig`].
pub type ProgressCallback = Arc<dyn ConversionProgressCallback>;
