//! PDF split-rendering infrastructure

mod cache;
mod canvas;
mod cut_points;
mod document;
mod main_canvas;
#[cfg(feature = "mupdf")]
mod mupdf_backend;
mod reference;
mod request;
mod scheduler;

pub use cache::{
    CacheConfig, DEFAULT_EVICTION_GRACE, DEFAULT_SCALE_TOLERANCE, MARKER_CENTER, MARKER_COLOR,
    MARKER_RADIUS, PdfCache,
};
pub use canvas::{CanvasObject, CanvasPool, PixelRect};
pub use cut_points::{
    MIN_BAND_SIZE, SNAP_INSET, SnapRegion, WIDE_BAND_SIZE, determine_optimal_cut_positions,
};
pub use document::{
    PdfDocument, PdfPage, RenderContext, SharedResult, TextContent, TextItem, Viewport, to_pixels,
};
pub use main_canvas::{MainCanvas, MainClaim, find_main_canvas};
#[cfg(feature = "mupdf")]
pub use mupdf_backend::MupdfDocument;
pub use reference::{Reference, ReferenceId, ReferenceManager, Subscription};
pub use request::{CanvasError, PdfError, RenderError, SectionRender, SectionRequest};
pub use scheduler::{Scheduler, Task, TimerId, TimerQueue};
