//! Split-rendering cache for scanned exam PDFs.
//!
//! A page is rendered once per scale into a pooled bitmap; many overlapping
//! question sections are then served from it, either directly or as cropped
//! copies. See [`pdf::PdfCache`].

pub mod panic_handler;
pub mod pdf;
pub mod settings;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
