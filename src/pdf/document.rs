//! Capabilities required from a PDF engine
//!
//! The cache does not parse or rasterize PDFs itself. A backend exposes
//! documents and pages through these traits; see `mupdf_backend` for the
//! MuPDF implementation. Page numbers are 1-based.

use std::rc::Rc;

use futures::future::{LocalBoxFuture, Shared};

use super::canvas::{CanvasObject, CanvasPool};
use super::request::PdfError;

/// Result of an asynchronous load or render, observable by many awaiting consumers
pub type SharedResult<T, E = PdfError> = Shared<LocalBoxFuture<'static, Result<T, E>>>;

/// Page dimensions at a given scale, in pixels
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Viewport {
    pub width: f64,
    pub height: f64,
    pub scale: f64,
}

impl Viewport {
    /// Whole-pixel canvas size for this viewport
    #[must_use]
    pub fn pixel_size(&self) -> (u32, u32) {
        (to_pixels(self.width), to_pixels(self.height))
    }
}

/// Round a pixel measure to a canvas dimension; negative and NaN map to 0
#[must_use]
pub fn to_pixels(value: f64) -> u32 {
    if value.is_nan() || value <= 0.0 {
        0
    } else {
        value.round().min(f64::from(u32::MAX)) as u32
    }
}

/// A run of text with its bounding box in unscaled page units
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct TextItem {
    pub text: String,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Clone, Debug, Default, PartialEq, serde::Serialize)]
pub struct TextContent {
    pub items: Vec<TextItem>,
}

/// Everything a page needs to draw itself
pub struct RenderContext<'a> {
    /// Target surface, already sized to `viewport`
    pub canvas: &'a CanvasObject,
    pub viewport: Viewport,
    /// Pool for any scratch surfaces the engine needs while drawing
    pub canvas_factory: &'a CanvasPool,
}

pub trait PdfDocument {
    fn page_count(&self) -> u32;

    /// Load a page. The cache calls this at most once per page number.
    fn page(&self, page_number: u32) -> LocalBoxFuture<'static, Result<Rc<dyn PdfPage>, PdfError>>;
}

pub trait PdfPage {
    fn viewport(&self, scale: f64) -> Viewport;

    /// Draw the page into `ctx.canvas`
    fn render<'a>(&'a self, ctx: RenderContext<'a>) -> LocalBoxFuture<'a, Result<(), PdfError>>;

    fn text_content(&self) -> LocalBoxFuture<'_, Result<TextContent, PdfError>>;

    /// The page as an SVG document at scale 1. With `embed_fonts` the text
    /// must not depend on fonts installed on the viewer's system.
    fn to_svg(&self, embed_fonts: bool) -> LocalBoxFuture<'_, Result<String, PdfError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_size_rounds_fractional_viewports() {
        let viewport = Viewport {
            width: 612.0 * 1.5,
            height: 792.4,
            scale: 1.5,
        };
        assert_eq!(viewport.pixel_size(), (918, 792));
    }

    #[test]
    fn to_pixels_clamps_invalid_values() {
        assert_eq!(to_pixels(-3.0), 0);
        assert_eq!(to_pixels(f64::NAN), 0);
        assert_eq!(to_pixels(0.4), 0);
        assert_eq!(to_pixels(299.999_999_9), 300);
    }
}
