//! Pipeline stages for hybrid PDF-to-Markdown conversion.
//!
//! Each submodule implements one transformation step and talks to its
//! neighbours through the types in [`crate::model`].
//!
//! ## Data Flow
//!
//! ```text
//!                 ┌──────────── per page, concurrent ────────────┐
//! input ──▶ pdfium ──▶ classify ──▶ extract ─┬─▶ assets ──▶ structure ──▶ refine ──▶ assemble ──▶ postprocess
//!                                   ocr ─────┘
//! ```
//!
//! 1. [`input`]    — canonicalise the user-supplied path or URL to a local file
//! 2. [`pdfium`]   — open the document and implement [`source::PageSource`]
//!    and [`source::Rasterizer`] on top of pdfium
//! 3. [`classify`] — decide native-text, scanned or mixed from page metrics
//! 4. [`extract`]  — group glyph runs into positioned text spans
//! 5. [`ocr`]      — rasterised page → confidence-scored spans (tesseract)
//! 6. [`assets`]   — embedded images and equation crops → persisted PNGs
//! 7. [`structure`] — reading order, headings, lists, tables, diagnostics
//! 8. [`refine`]   — optional LLM pass with content-preservation checks
//! 9. [`assemble`] — page ordering, header/footer suppression, front matter
//! 10. [`postprocess`] — deterministic GFM cleanup of the assembled text
//!
//! [`page`] drives steps 3–8 for a single page.

pub mod assemble;
pub mod assets;
pub mod classify;
pub mod encode;
pub mod extract;
pub mod input;
pub mod ocr;
pub mod page;
pub mod pdfium;
pub mod postprocess;
pub mod refine;
pub mod source;
pub mod structure;
