//! Section request, result and error types

use super::canvas::CanvasObject;
use super::reference::Reference;

/// A vertical slice of one page at one scale.
///
/// `start` and `end` are fractions of the page height in `[0, 1]`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SectionRequest {
    /// Page number as understood by the document backend
    pub page: u32,
    /// Render scale (1.0 = page units)
    pub scale: f64,
    pub start: f64,
    pub end: f64,
}

impl SectionRequest {
    #[must_use]
    pub const fn new(page: u32, scale: f64, start: f64, end: f64) -> Self {
        Self {
            page,
            scale,
            start,
            end,
        }
    }

    /// Request covering the whole page
    #[must_use]
    pub const fn full_page(page: u32, scale: f64) -> Self {
        Self::new(page, scale, 0.0, 1.0)
    }

    /// Fraction of the page height covered by this section
    #[must_use]
    pub fn span(&self) -> f64 {
        self.end - self.start
    }
}

/// Rendered section handed back to a caller.
///
/// The caller keeps the bitmap alive by holding `reference`; releasing it
/// (or dropping it) lets the cache recycle the buffer.
#[derive(Debug)]
pub struct SectionRender {
    pub canvas: CanvasObject,
    /// True when `canvas` is the full-page main canvas rather than a cropped copy
    pub is_main_canvas: bool,
    pub reference: Reference,
}

/// Errors from the canvas pool
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CanvasError {
    #[error("canvas dimensions must be positive, got {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("cannot allocate a {width}x{height} canvas")]
    Allocation { width: u32, height: u32 },
}

/// Errors from the document backend.
///
/// Cloneable so a single failed load or render can be observed by every
/// consumer awaiting it.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PdfError {
    #[error("page {page} is out of range (document has {page_count} pages)")]
    PageOutOfRange { page: u32, page_count: u32 },

    #[error("PDF engine: {detail}")]
    Backend { detail: String },
}

impl PdfError {
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend { detail: msg.into() }
    }
}

/// Errors from section rendering
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum RenderError {
    #[error("section end {end} must be greater than start {start}")]
    InvalidRange { start: f64, end: f64 },

    #[error("invalid scale {scale}")]
    InvalidScale { scale: f64 },

    #[error(transparent)]
    Canvas(#[from] CanvasError),

    #[error(transparent)]
    Pdf(#[from] PdfError),
}
