//! Pooled off-screen drawing surfaces

use std::cell::{Ref, RefCell, RefMut};
use std::collections::BTreeSet;
use std::fmt;
use std::rc::Rc;

use image::{Rgba, RgbaImage, imageops};
use log::{debug, info};

use super::request::CanvasError;

/// Bytes per RGBA pixel
const BYTES_PER_PIXEL: u64 = 4;

/// Pixel rectangle in canvas coordinates
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl PixelRect {
    #[must_use]
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// A drawable RGBA surface handed out by a [`CanvasPool`].
///
/// Cloning the handle does not copy pixels: all clones draw into the same
/// pooled buffer. Two handles refer to the same buffer iff
/// [`CanvasObject::same_buffer`] holds.
#[derive(Clone)]
pub struct CanvasObject {
    slot: usize,
    surface: Rc<RefCell<RgbaImage>>,
}

impl CanvasObject {
    /// Index of the pool slot backing this canvas
    #[must_use]
    pub fn slot(&self) -> usize {
        self.slot
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.surface.borrow().width()
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.surface.borrow().height()
    }

    /// Current `(width, height)` in pixels
    #[must_use]
    pub fn size(&self) -> (u32, u32) {
        self.surface.borrow().dimensions()
    }

    /// True when both handles draw into the same pooled buffer
    #[must_use]
    pub fn same_buffer(&self, other: &CanvasObject) -> bool {
        Rc::ptr_eq(&self.surface, &other.surface)
    }

    /// Borrow the pixel data for reading.
    ///
    /// # Panics
    /// If the surface is currently borrowed for drawing.
    pub fn pixels(&self) -> Ref<'_, RgbaImage> {
        self.surface.borrow()
    }

    /// Borrow the pixel data for drawing.
    ///
    /// # Panics
    /// If the surface is currently borrowed elsewhere.
    pub fn pixels_mut(&self) -> RefMut<'_, RgbaImage> {
        self.surface.borrow_mut()
    }

    /// Copy of the current pixel data
    #[must_use]
    pub fn to_image(&self) -> RgbaImage {
        self.surface.borrow().clone()
    }

    /// Clear the full surface to transparent black
    pub fn clear(&self) {
        self.clear_rect(PixelRect::new(0, 0, self.width(), self.height()));
    }

    /// Clear a rectangle to transparent black, clipped to the surface
    pub fn clear_rect(&self, rect: PixelRect) {
        let mut image = self.surface.borrow_mut();
        let x_end = rect.x.saturating_add(rect.width).min(image.width());
        let y_end = rect.y.saturating_add(rect.height).min(image.height());
        for y in rect.y..y_end {
            for x in rect.x..x_end {
                image.put_pixel(x, y, Rgba([0, 0, 0, 0]));
            }
        }
    }

    /// Copy `src_rect` of `source` onto this canvas with its top-left at `(dest_x, dest_y)`.
    ///
    /// The source rectangle is clipped to the source surface; pixels falling
    /// outside this canvas are dropped.
    pub fn draw_image(&self, source: &CanvasObject, src_rect: PixelRect, dest_x: u32, dest_y: u32) {
        let region = {
            let src = source.surface.borrow();
            imageops::crop_imm(&*src, src_rect.x, src_rect.y, src_rect.width, src_rect.height)
                .to_image()
        };
        let mut dest = self.surface.borrow_mut();
        imageops::replace(&mut *dest, &region, i64::from(dest_x), i64::from(dest_y));
    }

    /// Fill a circle centered at `(cx, cy)`, clipped to the surface
    pub fn fill_circle(&self, cx: u32, cy: u32, radius: u32, color: Rgba<u8>) {
        let mut image = self.surface.borrow_mut();
        let (width, height) = image.dimensions();
        let r = i64::from(radius);
        let (cx, cy) = (i64::from(cx), i64::from(cy));
        for y in (cy - r).max(0)..(cy + r + 1).min(i64::from(height)) {
            for x in (cx - r).max(0)..(cx + r + 1).min(i64::from(width)) {
                let (dx, dy) = (x - cx, y - cy);
                if dx * dx + dy * dy <= r * r {
                    image.put_pixel(x as u32, y as u32, color);
                }
            }
        }
    }

    /// Replace the backing surface with a cleared one of the given size
    fn resize(&self, width: u32, height: u32) -> Result<(), CanvasError> {
        *self.surface.borrow_mut() = allocate(width, height)?;
        Ok(())
    }
}

impl fmt::Debug for CanvasObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (width, height) = self.size();
        f.debug_struct("CanvasObject")
            .field("slot", &self.slot)
            .field("width", &width)
            .field("height", &height)
            .finish()
    }
}

/// Zeroed surface, or `CanvasError::Allocation` if the memory cannot be had
fn allocate(width: u32, height: u32) -> Result<RgbaImage, CanvasError> {
    let failed = || CanvasError::Allocation { width, height };
    let len = u64::from(width)
        .checked_mul(u64::from(height))
        .and_then(|pixels| pixels.checked_mul(BYTES_PER_PIXEL))
        .and_then(|bytes| usize::try_from(bytes).ok())
        .ok_or_else(failed)?;

    let mut buf = Vec::new();
    buf.try_reserve_exact(len).map_err(|_| failed())?;
    buf.resize(len, 0);
    RgbaImage::from_raw(width, height, buf).ok_or_else(failed)
}

fn check_dimensions(width: u32, height: u32) -> Result<(), CanvasError> {
    if width == 0 || height == 0 {
        return Err(CanvasError::InvalidDimensions { width, height });
    }
    Ok(())
}

struct PoolState {
    canvases: Vec<CanvasObject>,
    free: BTreeSet<usize>,
}

/// Free-list allocator for [`CanvasObject`]s.
///
/// Every canvas ever created stays recorded in the pool; destroyed canvases
/// shrink to 0x0 and their slot becomes available to the next `create`. The
/// pool has no eviction policy of its own. One pool is scoped to one open
/// document and shared by `Rc`.
pub struct CanvasPool {
    state: RefCell<PoolState>,
}

impl CanvasPool {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RefCell::new(PoolState {
                canvases: Vec::new(),
                free: BTreeSet::new(),
            }),
        }
    }

    /// Hand out a canvas, reusing the lowest free slot when one exists.
    ///
    /// A reused canvas whose size already matches (or when no size is
    /// requested) is cleared in place; otherwise it is resized, which also
    /// clears it. Requested dimensions must be positive.
    pub fn create(&self, size: Option<(u32, u32)>) -> Result<CanvasObject, CanvasError> {
        if let Some((width, height)) = size {
            check_dimensions(width, height)?;
        }

        let mut state = self.state.borrow_mut();
        if let Some(slot) = state.free.first().copied() {
            let canvas = state.canvases[slot].clone();
            match size {
                Some((width, height)) if canvas.size() != (width, height) => {
                    canvas.resize(width, height)?;
                }
                _ => canvas.clear(),
            }
            state.free.remove(&slot);
            debug!("canvas pool: reused slot {slot} as {:?}", canvas.size());
            return Ok(canvas);
        }

        let (width, height) = size.unwrap_or((0, 0));
        let canvas = CanvasObject {
            slot: state.canvases.len(),
            surface: Rc::new(RefCell::new(allocate(width, height)?)),
        };
        state.canvases.push(canvas.clone());
        debug!("canvas pool: allocated slot {} ({width}x{height})", canvas.slot);
        Ok(canvas)
    }

    /// Resize a canvas in place. Dimensions must be positive.
    pub fn reset(&self, canvas: &CanvasObject, width: u32, height: u32) -> Result<(), CanvasError> {
        check_dimensions(width, height)?;
        canvas.resize(width, height)
    }

    /// Release a canvas's pixel storage and mark its slot free.
    ///
    /// Canvases this pool does not track, and canvases already destroyed,
    /// are left alone.
    pub fn destroy(&self, canvas: &CanvasObject) {
        let mut state = self.state.borrow_mut();
        let tracked = state
            .canvases
            .get(canvas.slot)
            .is_some_and(|own| own.same_buffer(canvas));
        if !tracked || state.free.contains(&canvas.slot) {
            return;
        }

        *canvas.surface.borrow_mut() = RgbaImage::new(0, 0);
        state.free.insert(canvas.slot);
        debug!("canvas pool: freed slot {}", canvas.slot);
    }

    /// Number of canvases ever created
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.borrow().canvases.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.borrow().canvases.is_empty()
    }

    /// Number of slots available for reuse
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.state.borrow().free.len()
    }

    /// Number of canvases currently handed out
    #[must_use]
    pub fn in_use(&self) -> usize {
        let state = self.state.borrow();
        state.canvases.len() - state.free.len()
    }

    /// Log pool occupancy and retained pixel memory
    pub fn log_stats(&self) {
        let state = self.state.borrow();
        let bytes: u64 = state
            .canvases
            .iter()
            .map(|c| {
                let (w, h) = c.size();
                u64::from(w) * u64::from(h) * BYTES_PER_PIXEL
            })
            .sum();
        let size_mb = bytes as f64 / (1024.0 * 1024.0);
        info!(
            "canvas pool: {} canvases ({} free), {size_mb:.2} MB",
            state.canvases.len(),
            state.free.len()
        );
    }
}

impl Default for CanvasPool {
    fn default() -> Self {
        Self::new()
    }
}
