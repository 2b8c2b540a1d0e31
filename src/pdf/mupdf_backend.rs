//! MuPDF implementation of the document capabilities

use std::path::Path;
use std::rc::Rc;

use futures::FutureExt;
use futures::future::{self, LocalBoxFuture};
use image::Rgba;
use log::{debug, info};
use mupdf::text_page::TextBlockType;
use mupdf::{Colorspace, Document, Matrix, Page, Pixmap, TextPageFlags};

use super::document::{PdfDocument, PdfPage, RenderContext, TextContent, TextItem, Viewport};
use super::request::PdfError;

impl From<mupdf::error::Error> for PdfError {
    fn from(e: mupdf::error::Error) -> Self {
        PdfError::backend(e.to_string())
    }
}

/// A PDF opened with MuPDF
pub struct MupdfDocument {
    doc: Document,
    page_count: u32,
}

impl MupdfDocument {
    pub fn open(path: &Path) -> Result<Self, PdfError> {
        let doc = Document::open(path.to_string_lossy().as_ref())?;
        let page_count = u32::try_from(doc.page_count()?).unwrap_or(0);
        info!("opened {} ({page_count} pages)", path.display());
        Ok(Self { doc, page_count })
    }

    fn load(&self, page_number: u32) -> Result<Rc<dyn PdfPage>, PdfError> {
        if page_number == 0 || page_number > self.page_count {
            return Err(PdfError::PageOutOfRange {
                page: page_number,
                page_count: self.page_count,
            });
        }
        let page = self.doc.load_page((page_number - 1) as i32)?;
        let bounds = page.bounds()?;
        debug!("page {page_number} loaded");
        Ok(Rc::new(MupdfPage {
            page,
            width: f64::from(bounds.x1 - bounds.x0),
            height: f64::from(bounds.y1 - bounds.y0),
        }))
    }
}

impl PdfDocument for MupdfDocument {
    fn page_count(&self) -> u32 {
        self.page_count
    }

    fn page(&self, page_number: u32) -> LocalBoxFuture<'static, Result<Rc<dyn PdfPage>, PdfError>> {
        future::ready(self.load(page_number)).boxed_local()
    }
}

struct MupdfPage {
    page: Page,
    width: f64,
    height: f64,
}

impl MupdfPage {
    fn rasterize(&self, ctx: &RenderContext<'_>) -> Result<(), PdfError> {
        let scale = ctx.viewport.scale as f32;
        let pixmap = self.page.to_pixmap(
            &Matrix::new_scale(scale, scale),
            &Colorspace::device_rgb(),
            false,
            false,
        )?;
        copy_pixmap(&pixmap, ctx)
    }

    fn extract_text(&self) -> Result<TextContent, PdfError> {
        let text_page = self.page.to_text_page(TextPageFlags::empty())?;
        let mut items = Vec::new();
        for block in text_page.blocks() {
            if block.r#type() != TextBlockType::Text {
                continue;
            }
            for line in block.lines() {
                let text: String = line.chars().filter_map(|ch| ch.char()).collect();
                if text.trim().is_empty() {
                    continue;
                }
                let bbox = line.bounds();
                items.push(TextItem {
                    text,
                    x: f64::from(bbox.x0),
                    y: f64::from(bbox.y0),
                    width: f64::from(bbox.x1 - bbox.x0),
                    height: f64::from(bbox.y1 - bbox.y0),
                });
            }
        }
        Ok(TextContent { items })
    }

    fn vector(&self) -> Result<String, PdfError> {
        Ok(self.page.to_svg(&Matrix::new_scale(1.0, 1.0))?)
    }
}

impl PdfPage for MupdfPage {
    fn viewport(&self, scale: f64) -> Viewport {
        Viewport {
            width: self.width * scale,
            height: self.height * scale,
            scale,
        }
    }

    fn render<'a>(&'a self, ctx: RenderContext<'a>) -> LocalBoxFuture<'a, Result<(), PdfError>> {
        future::ready(self.rasterize(&ctx)).boxed_local()
    }

    fn text_content(&self) -> LocalBoxFuture<'_, Result<TextContent, PdfError>> {
        future::ready(self.extract_text()).boxed_local()
    }

    // MuPDF's SVG device draws glyphs as outlines, so the output never
    // depends on system fonts and both variants are the same document.
    fn to_svg(&self, _embed_fonts: bool) -> LocalBoxFuture<'_, Result<String, PdfError>> {
        future::ready(self.vector()).boxed_local()
    }
}

/// Copy RGB(A) pixmap samples into the target canvas, clipped to both
fn copy_pixmap(pixmap: &Pixmap, ctx: &RenderContext<'_>) -> Result<(), PdfError> {
    let n = pixmap.n() as usize;
    if n < 3 {
        return Err(PdfError::backend(format!(
            "Unsupported pixmap format: {n} channels"
        )));
    }

    let width = pixmap.width() as usize;
    let height = pixmap.height() as usize;
    let stride = pixmap.stride() as usize;
    let samples = pixmap.samples();
    if samples.len() < stride.saturating_mul(height) || width * n > stride {
        return Err(PdfError::backend("Pixmap buffer size mismatch"));
    }

    let mut target = ctx.canvas.pixels_mut();
    let rows = height.min(target.height() as usize);
    let cols = width.min(target.width() as usize);
    for y in 0..rows {
        let row = &samples[y * stride..y * stride + width * n];
        for (x, px) in row.chunks_exact(n).take(cols).enumerate() {
            target.put_pixel(x as u32, y as u32, Rgba([px[0], px[1], px[2], 255]));
        }
    }
    Ok(())
}
