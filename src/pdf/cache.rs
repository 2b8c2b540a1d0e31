//! Per-document render cache
//!
//! Each page is rendered once per scale into a pooled main canvas. Section
//! requests are served from that bitmap: the first consumer draws the main
//! canvas itself, later ones get cropped copies. Main canvases nobody
//! references are evicted after a grace period.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{self, LocalBoxFuture};
use futures::task::{LocalSpawn, LocalSpawnExt};
use image::Rgba;
use log::{debug, info, warn};

use super::canvas::{CanvasObject, CanvasPool, PixelRect};
use super::cut_points::{SnapRegion, determine_optimal_cut_positions};
use super::document::{
    PdfDocument, PdfPage, RenderContext, SharedResult, TextContent, Viewport, to_pixels,
};
use super::main_canvas::{EvictFn, MainCanvas, find_main_canvas};
use super::reference::{Reference, ReferenceManager};
use super::request::{PdfError, RenderError, SectionRender, SectionRequest};
use super::scheduler::Scheduler;

/// How long an unreferenced main canvas survives before its buffer is recycled
pub const DEFAULT_EVICTION_GRACE: Duration = Duration::from_secs(10);

/// A cached main canvas may serve requests up to this much above its own scale
pub const DEFAULT_SCALE_TOLERANCE: f64 = 0.001;

/// Center of the marker drawn on cropped copies
pub const MARKER_CENTER: (u32, u32) = (20, 20);
pub const MARKER_RADIUS: u32 = 5;
pub const MARKER_COLOR: Rgba<u8> = Rgba([0x66, 0x99, 0xCC, 0xFF]);

/// Tunables for a [`PdfCache`]
#[derive(Clone, Debug, PartialEq)]
pub struct CacheConfig {
    pub eviction_grace: Duration,
    pub scale_tolerance: f64,
    /// Draw the marker on cropped copies
    pub render_marker: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            eviction_grace: DEFAULT_EVICTION_GRACE,
            scale_tolerance: DEFAULT_SCALE_TOLERANCE,
            render_marker: true,
        }
    }
}

/// Render cache for one open document.
///
/// Loaded pages, text content and vector renders are kept for the lifetime
/// of the cache; only main canvases are evicted.
pub struct PdfCache {
    document: Rc<dyn PdfDocument>,
    pool: Rc<CanvasPool>,
    scheduler: Rc<dyn Scheduler>,
    spawner: Rc<dyn LocalSpawn>,
    config: CacheConfig,
    pages: RefCell<HashMap<u32, SharedResult<Rc<dyn PdfPage>>>>,
    text: RefCell<HashMap<u32, SharedResult<Rc<TextContent>>>>,
    vectors: RefCell<HashMap<(u32, bool), SharedResult<Rc<str>>>>,
    main_canvases: RefCell<HashMap<u32, Vec<Rc<MainCanvas>>>>,
    this: Weak<PdfCache>,
}

impl PdfCache {
    /// Create a cache with its own canvas pool
    pub fn new(
        document: Rc<dyn PdfDocument>,
        scheduler: Rc<dyn Scheduler>,
        spawner: Rc<dyn LocalSpawn>,
        config: CacheConfig,
    ) -> Rc<Self> {
        Self::with_pool(
            document,
            Rc::new(CanvasPool::new()),
            scheduler,
            spawner,
            config,
        )
    }

    /// Create a cache drawing its buffers from `pool`
    pub fn with_pool(
        document: Rc<dyn PdfDocument>,
        pool: Rc<CanvasPool>,
        scheduler: Rc<dyn Scheduler>,
        spawner: Rc<dyn LocalSpawn>,
        config: CacheConfig,
    ) -> Rc<Self> {
        info!(
            "pdf cache: {} pages, grace={:?}, tolerance={}",
            document.page_count(),
            config.eviction_grace,
            config.scale_tolerance
        );
        Rc::new_cyclic(|this| Self {
            document,
            pool,
            scheduler,
            spawner,
            config,
            pages: RefCell::new(HashMap::new()),
            text: RefCell::new(HashMap::new()),
            vectors: RefCell::new(HashMap::new()),
            main_canvases: RefCell::new(HashMap::new()),
            this: Weak::clone(this),
        })
    }

    #[must_use]
    pub fn pool(&self) -> &Rc<CanvasPool> {
        &self.pool
    }

    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    #[must_use]
    pub fn page_count(&self) -> u32 {
        self.document.page_count()
    }

    /// Load a page, reusing an earlier load of the same page
    pub fn page(&self, page_number: u32) -> SharedResult<Rc<dyn PdfPage>> {
        self.pages
            .borrow_mut()
            .entry(page_number)
            .or_insert_with(|| self.document.page(page_number).shared())
            .clone()
    }

    /// Text content of a page, extracted at most once
    pub fn text_content(&self, page_number: u32) -> SharedResult<Rc<TextContent>> {
        if let Some(text) = self.text.borrow().get(&page_number) {
            return text.clone();
        }

        let page = self.page(page_number);
        let text = async move {
            let page = page.await?;
            page.text_content().await.map(Rc::new)
        }
        .boxed_local()
        .shared();
        self.text.borrow_mut().insert(page_number, text.clone());
        text
    }

    /// SVG rendering of a page, produced at most once per font variant
    pub fn vector_render(&self, page_number: u32, embed_fonts: bool) -> SharedResult<Rc<str>> {
        let key = (page_number, embed_fonts);
        if let Some(svg) = self.vectors.borrow().get(&key) {
            return svg.clone();
        }

        let page = self.page(page_number);
        let svg = async move {
            let page = page.await?;
            let svg = page.to_svg(embed_fonts).await?;
            debug!("page {page_number}: vector render, {} bytes", svg.len());
            Ok::<Rc<str>, PdfError>(Rc::from(svg))
        }
        .boxed_local()
        .shared();
        self.vectors.borrow_mut().insert(key, svg.clone());
        svg
    }

    /// Live main canvases of a page
    #[must_use]
    pub fn main_canvases(&self, page_number: u32) -> Vec<Rc<MainCanvas>> {
        self.main_canvases
            .borrow()
            .get(&page_number)
            .cloned()
            .unwrap_or_default()
    }

    #[must_use]
    pub fn main_canvas_count(&self, page_number: u32) -> usize {
        self.main_canvases
            .borrow()
            .get(&page_number)
            .map_or(0, Vec::len)
    }

    /// Cached main canvas able to serve `scale`, preferring unclaimed entries
    #[must_use]
    pub fn find_main_canvas(&self, page_number: u32, scale: f64) -> Option<Rc<MainCanvas>> {
        let canvases = self.main_canvases.borrow();
        let entries = canvases.get(&page_number)?;
        find_main_canvas(entries, scale, self.config.scale_tolerance)
    }

    /// Start rendering a page at `scale` into a fresh main canvas.
    ///
    /// Returns the registered entry together with its seed reference, which
    /// keeps the entry alive until the caller releases it.
    pub fn create_main_canvas(
        &self,
        page_number: u32,
        scale: f64,
    ) -> Result<(Rc<MainCanvas>, Reference), RenderError> {
        check_scale(scale)?;
        let canvas = self.pool.create(None)?;
        let references = ReferenceManager::new();
        let seed = references.create_retained_ref();
        let (size, rendered) = self.render_canvas(&references, canvas.clone(), page_number, scale);

        let entry = Rc::new(MainCanvas::new(
            page_number,
            scale,
            canvas,
            references,
            size,
            rendered,
        ));
        let cache = Weak::clone(&self.this);
        let on_evict: EvictFn = Rc::new(move |entry: &Rc<MainCanvas>| {
            if let Some(cache) = cache.upgrade() {
                cache.evict(entry);
            }
        });
        entry.watch_eviction(
            Rc::clone(&self.scheduler),
            self.config.eviction_grace,
            on_evict,
        );

        self.main_canvases
            .borrow_mut()
            .entry(page_number)
            .or_default()
            .push(Rc::clone(&entry));
        debug!(
            "main canvas created: page={page_number} scale={scale} slot={}",
            entry.canvas().slot()
        );
        Ok((entry, seed))
    }

    /// Load `page_number` and draw it at `scale` into `canvas`.
    ///
    /// A reference on `references` is held for the whole render. The first
    /// future resolves with the page size as soon as the page is loaded; the
    /// second once the pixels are drawn. Rendering starts immediately on the
    /// cache's spawner.
    pub fn render_canvas(
        &self,
        references: &ReferenceManager,
        canvas: CanvasObject,
        page_number: u32,
        scale: f64,
    ) -> (SharedResult<Viewport>, SharedResult<(), RenderError>) {
        let hold = references.create_retained_ref();
        let page = self.page(page_number);

        let size = {
            let page = page.clone();
            async move { Ok::<_, PdfError>(page.await?.viewport(scale)) }
                .boxed_local()
                .shared()
        };

        let pool = Rc::clone(&self.pool);
        let rendered = async move {
            let page = page.await?;
            let viewport = page.viewport(scale);
            let (width, height) = viewport.pixel_size();
            pool.reset(&canvas, width, height)?;
            page.render(RenderContext {
                canvas: &canvas,
                viewport,
                canvas_factory: &pool,
            })
            .await?;
            debug!("page {page_number} rendered at scale {scale} ({width}x{height})");
            hold.release();
            Ok::<_, RenderError>(())
        }
        .boxed_local()
        .shared();

        if let Err(e) = self.spawner.spawn_local(rendered.clone().map(|_| ())) {
            warn!("page {page_number}: cannot start render eagerly: {e}");
        }
        (size, rendered)
    }

    /// Bitmap for the vertical slice `request.start..request.end` of a page.
    ///
    /// Lookup, creation and claiming happen before this returns, so
    /// overlapping requests never both become the primary consumer. The
    /// primary consumer receives the main canvas itself; everyone else gets
    /// a cropped copy which is recycled as soon as its reference is released.
    pub fn render_section(
        &self,
        request: SectionRequest,
    ) -> LocalBoxFuture<'static, Result<SectionRender, RenderError>> {
        match self.start_section(request) {
            Ok(section) => section,
            Err(e) => future::ready(Err(e)).boxed_local(),
        }
    }

    fn start_section(
        &self,
        request: SectionRequest,
    ) -> Result<LocalBoxFuture<'static, Result<SectionRender, RenderError>>, RenderError> {
        if request.end <= request.start || request.start.is_nan() || request.end.is_nan() {
            return Err(RenderError::InvalidRange {
                start: request.start,
                end: request.end,
            });
        }
        check_scale(request.scale)?;

        let (entry, seed) = match self.find_main_canvas(request.page, request.scale) {
            Some(entry) => (entry, None),
            None => {
                let (entry, seed) = self.create_main_canvas(request.page, request.scale)?;
                (entry, Some(seed))
            }
        };

        if !entry.is_claimed() {
            let reference = seed.unwrap_or_else(|| entry.references().create_retained_ref());
            entry.claim(&reference);
            let rendered = entry.rendered();
            let canvas = entry.canvas().clone();
            debug!(
                "section page={} [{}, {}]: primary on main canvas slot {}",
                request.page,
                request.start,
                request.end,
                canvas.slot()
            );
            return Ok(async move {
                rendered.await?;
                Ok::<_, RenderError>(SectionRender {
                    canvas,
                    is_main_canvas: true,
                    reference,
                })
            }
            .boxed_local());
        }

        let secondary = entry.references().create_retained_ref();
        let pool = Rc::clone(&self.pool);
        let render_marker = self.config.render_marker;
        Ok(async move {
            let viewport = entry.size().await?;
            entry.rendered().await?;
            let crop = crop_section(&pool, entry.canvas(), viewport, &request, render_marker)?;
            debug!(
                "section page={} [{}, {}]: cropped into slot {}",
                request.page,
                request.start,
                request.end,
                crop.slot()
            );
            let reference = retain_crop(pool, crop.clone(), secondary);
            Ok::<_, RenderError>(SectionRender {
                canvas: crop,
                is_main_canvas: false,
                reference,
            })
        }
        .boxed_local())
    }

    /// Suggested cut positions inside a rendered section
    #[must_use]
    pub fn cut_points(&self, section: &SectionRender, request: &SectionRequest) -> Vec<SnapRegion> {
        determine_optimal_cut_positions(
            &section.canvas.pixels(),
            request.start,
            request.end,
            section.is_main_canvas,
        )
    }

    fn evict(&self, entry: &Rc<MainCanvas>) {
        self.pool.destroy(entry.canvas());
        entry.mark_evicted();

        let mut canvases = self.main_canvases.borrow_mut();
        if let Some(entries) = canvases.get_mut(&entry.page()) {
            entries.retain(|e| !Rc::ptr_eq(e, entry));
            if entries.is_empty() {
                canvases.remove(&entry.page());
            }
        }
        info!(
            "main canvas evicted: page={} scale={} slot={}",
            entry.page(),
            entry.scale(),
            entry.canvas().slot()
        );
    }
}

fn check_scale(scale: f64) -> Result<(), RenderError> {
    if scale.is_finite() && scale > 0.0 {
        Ok(())
    } else {
        Err(RenderError::InvalidScale { scale })
    }
}

/// Copy the requested slice of `main` into a freshly pooled canvas
fn crop_section(
    pool: &CanvasPool,
    main: &CanvasObject,
    viewport: Viewport,
    request: &SectionRequest,
    render_marker: bool,
) -> Result<CanvasObject, RenderError> {
    let (width, height) = viewport.pixel_size();
    let page_height = f64::from(height);
    // Both edges are rounded so that adjacent sections tile the page exactly
    let src_y = to_pixels(page_height * request.start).min(height);
    let bottom = to_pixels(page_height * request.end).min(height);
    let crop_height = bottom.saturating_sub(src_y);

    let crop = pool.create(Some((width, crop_height)))?;
    crop.draw_image(main, PixelRect::new(0, src_y, width, crop_height), 0, 0);
    if render_marker {
        let (x, y) = MARKER_CENTER;
        crop.fill_circle(x, y, MARKER_RADIUS, MARKER_COLOR);
    }
    Ok(crop)
}

/// Reference to a cropped copy. Once it is released the copy goes back to
/// the pool and the hold on the main canvas is dropped.
fn retain_crop(pool: Rc<CanvasPool>, crop: CanvasObject, secondary: Reference) -> Reference {
    let references = ReferenceManager::new();
    let reference = references.create_retained_ref();
    let secondary = RefCell::new(Some(secondary));
    references.subscribe(move |count| {
        if count > 0 {
            return;
        }
        let held = secondary.borrow_mut().take();
        if let Some(held) = held {
            pool.destroy(&crop);
            held.release();
        }
    });
    reference
}
