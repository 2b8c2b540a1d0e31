pub mod test_helpers {
    use std::cell::Cell;
    use std::collections::HashSet;
    use std::ops::Range;
    use std::rc::Rc;
    use std::time::Duration;

    use futures::FutureExt;
    use futures::executor::LocalPool;
    use futures::future::{self, LocalBoxFuture};
    use image::Rgba;

    use crate::pdf::{
        CacheConfig, PdfCache, PdfDocument, PdfError, PdfPage, RenderContext, RenderError,
        SectionRender, SectionRequest, TextContent, TextItem, TimerQueue, Viewport,
    };

    /// Pixel drawn by [`FakeDocument`] pages at `(x, y)`; unique per row
    pub fn pattern_pixel(x: u32, y: u32) -> Rgba<u8> {
        Rgba([(y % 256) as u8, (y / 256) as u8, (x % 256) as u8, 255])
    }

    pub const BLANK: Rgba<u8> = Rgba([255, 255, 255, 255]);

    /// In-memory document whose pages paint [`pattern_pixel`]
    pub struct FakeDocument {
        page_count: u32,
        width: f64,
        height: f64,
        failing_renders: HashSet<u32>,
        blank_rows: Vec<Range<u32>>,
        loads: Rc<Cell<u32>>,
        renders: Rc<Cell<u32>>,
        vector_renders: Rc<Cell<u32>>,
    }

    impl FakeDocument {
        /// Document of `page_count` pages measuring `width`x`height` at scale 1
        pub fn new(page_count: u32, width: f64, height: f64) -> Self {
            Self {
                page_count,
                width,
                height,
                failing_renders: HashSet::new(),
                blank_rows: Vec::new(),
                loads: Rc::new(Cell::new(0)),
                renders: Rc::new(Cell::new(0)),
                vector_renders: Rc::new(Cell::new(0)),
            }
        }

        /// Make rendering of `page` fail
        pub fn failing_render(mut self, page: u32) -> Self {
            self.failing_renders.insert(page);
            self
        }

        /// Paint these rendered rows [`BLANK`] on every page
        pub fn blank_rows(mut self, rows: Range<u32>) -> Self {
            self.blank_rows.push(rows);
            self
        }

        /// Number of page loads requested so far
        pub fn loads(&self) -> u32 {
            self.loads.get()
        }

        /// Number of completed or failed renders so far
        pub fn renders(&self) -> u32 {
            self.renders.get()
        }

        /// Number of SVG renders so far
        pub fn vector_renders(&self) -> u32 {
            self.vector_renders.get()
        }
    }

    impl PdfDocument for FakeDocument {
        fn page_count(&self) -> u32 {
            self.page_count
        }

        fn page(
            &self,
            page_number: u32,
        ) -> LocalBoxFuture<'static, Result<Rc<dyn PdfPage>, PdfError>> {
            self.loads.set(self.loads.get() + 1);
            if page_number == 0 || page_number > self.page_count {
                return future::ready(Err(PdfError::PageOutOfRange {
                    page: page_number,
                    page_count: self.page_count,
                }))
                .boxed_local();
            }

            let page: Rc<dyn PdfPage> = Rc::new(FakePage {
                number: page_number,
                width: self.width,
                height: self.height,
                fails: self.failing_renders.contains(&page_number),
                blank_rows: self.blank_rows.clone(),
                renders: Rc::clone(&self.renders),
                vector_renders: Rc::clone(&self.vector_renders),
            });
            future::ready(Ok(page)).boxed_local()
        }
    }

    struct FakePage {
        number: u32,
        width: f64,
        height: f64,
        fails: bool,
        blank_rows: Vec<Range<u32>>,
        renders: Rc<Cell<u32>>,
        vector_renders: Rc<Cell<u32>>,
    }

    impl PdfPage for FakePage {
        fn viewport(&self, scale: f64) -> Viewport {
            Viewport {
                width: self.width * scale,
                height: self.height * scale,
                scale,
            }
        }

        fn render<'a>(
            &'a self,
            ctx: RenderContext<'a>,
        ) -> LocalBoxFuture<'a, Result<(), PdfError>> {
            self.renders.set(self.renders.get() + 1);
            if self.fails {
                return future::ready(Err(PdfError::backend(format!(
                    "page {} is corrupt",
                    self.number
                ))))
                .boxed_local();
            }

            let mut pixels = ctx.canvas.pixels_mut();
            for (x, y, px) in pixels.enumerate_pixels_mut() {
                *px = if self.blank_rows.iter().any(|rows| rows.contains(&y)) {
                    BLANK
                } else {
                    pattern_pixel(x, y)
                };
            }
            future::ready(Ok(())).boxed_local()
        }

        fn text_content(&self) -> LocalBoxFuture<'_, Result<TextContent, PdfError>> {
            future::ready(Ok(TextContent {
                items: vec![TextItem {
                    text: format!("Page {}", self.number),
                    x: 0.0,
                    y: 0.0,
                    width: self.width,
                    height: 12.0,
                }],
            }))
            .boxed_local()
        }

        fn to_svg(&self, embed_fonts: bool) -> LocalBoxFuture<'_, Result<String, PdfError>> {
            self.vector_renders.set(self.vector_renders.get() + 1);
            let fonts = if embed_fonts { "embedded" } else { "system" };
            future::ready(Ok(format!(
                r#"<svg xmlns="http://www.w3.org/2000/svg" width="{}" height="{}" data-page="{}" data-fonts="{fonts}"/>"#,
                self.width, self.height, self.number
            )))
            .boxed_local()
        }
    }

    /// A cache over a [`FakeDocument`] with a local executor and a virtual clock
    pub struct TestHarness {
        pub cache: Rc<PdfCache>,
        pub document: Rc<FakeDocument>,
        pub timers: Rc<TimerQueue>,
        pub executor: LocalPool,
    }

    impl TestHarness {
        pub fn new(document: FakeDocument) -> Self {
            Self::with_config(document, CacheConfig::default())
        }

        pub fn with_config(document: FakeDocument, config: CacheConfig) -> Self {
            let document = Rc::new(document);
            let timers = Rc::new(TimerQueue::new());
            let executor = LocalPool::new();
            let cache = PdfCache::new(
                document.clone(),
                timers.clone(),
                Rc::new(executor.spawner()),
                config,
            );
            Self {
                cache,
                document,
                timers,
                executor,
            }
        }

        /// Request a section and drive the executor until it resolves
        pub fn render(&mut self, request: SectionRequest) -> Result<SectionRender, RenderError> {
            let section = self.cache.render_section(request);
            self.executor.run_until(section)
        }

        /// Run spawned work until nothing can make progress
        pub fn settle(&mut self) {
            self.executor.run_until_stalled();
        }

        /// Settle, then move the virtual clock forward
        pub fn advance(&mut self, elapsed: Duration) {
            self.settle();
            self.timers.advance(elapsed);
        }
    }
}
