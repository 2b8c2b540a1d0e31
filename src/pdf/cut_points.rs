//! Whitespace detection for splitting exam pages into questions
//!
//! Scans rendered pixels for horizontal bands of uniform color and proposes
//! positions inside them where a page can be cut without slicing through
//! content.

use image::RgbaImage;
use serde::Serialize;

/// Bands covering less than this fraction of the page are ignored
pub const MIN_BAND_SIZE: f64 = 0.005;

/// Bands covering more than this fraction get a snap point near each edge
pub const WIDE_BAND_SIZE: f64 = 0.1;

/// Distance of edge snap points from the band boundary, as a fraction of the scanned range
pub const SNAP_INSET: f64 = 0.01;

/// A uniform band and the cut positions proposed inside it.
///
/// All positions are fractions of the scanned range in `[0, 1]`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SnapRegion {
    pub start: f64,
    pub end: f64,
    pub snap_points: Vec<f64>,
}

/// Propose cut positions for the section `start..end` of a page.
///
/// With `is_main` the image is the full page and only the rows of the
/// section are scanned; otherwise the image already is the cropped section.
/// A band touching the top of the scanned range is never reported. When the
/// section reaches the bottom of the page (`end == 1`), a trailing band
/// always offers the exact bottom edge `1.0`.
#[must_use]
pub fn determine_optimal_cut_positions(
    image: &RgbaImage,
    start: f64,
    end: f64,
    is_main: bool,
) -> Vec<SnapRegion> {
    let (width, height) = image.dimensions();
    let (first_row, last_row) = if is_main {
        let h = f64::from(height);
        let first = (start * h).floor().clamp(0.0, h) as u32;
        let last = (end * h).floor().clamp(0.0, h) as u32;
        (first, last)
    } else {
        (0, height)
    };
    if width == 0 || last_row <= first_row {
        return Vec::new();
    }

    let rows = f64::from(last_row - first_row);
    let scan = Scan {
        span: end - start,
        reaches_bottom: (end - 1.0).abs() < f64::EPSILON,
    };
    let mut regions = Vec::new();
    let mut band_start: Option<f64> = None;

    for y in first_row..last_row {
        let position = f64::from(y - first_row) / rows;
        if row_is_uniform(image, y) {
            band_start.get_or_insert(position);
        } else if let Some(band) = band_start.take() {
            scan.close_band(&mut regions, band, position, false);
        }
    }
    if let Some(band) = band_start {
        scan.close_band(&mut regions, band, 1.0, true);
    }

    regions
}

struct Scan {
    /// Fraction of the page covered by the scanned range
    span: f64,
    reaches_bottom: bool,
}

impl Scan {
    fn close_band(&self, regions: &mut Vec<SnapRegion>, start: f64, end: f64, is_last: bool) {
        let size = (end - start) * self.span;
        if size <= MIN_BAND_SIZE || start <= 0.0 {
            return;
        }

        let at_bottom = is_last && self.reaches_bottom;
        let mut snap_points = Vec::new();
        if size > WIDE_BAND_SIZE {
            snap_points.push(start + SNAP_INSET);
            if !at_bottom {
                snap_points.push(end - SNAP_INSET);
            }
        } else if !is_last {
            snap_points.push((start + end) / 2.0);
        }
        if at_bottom {
            snap_points.push(1.0);
        }

        regions.push(SnapRegion {
            start,
            end,
            snap_points,
        });
    }
}

/// True when every pixel of row `y` equals its first pixel
fn row_is_uniform(image: &RgbaImage, y: u32) -> bool {
    let row_len = image.width() as usize * 4;
    let offset = y as usize * row_len;
    let row = &image.as_raw()[offset..offset + row_len];
    let (first, rest) = row.split_at(4);
    rest.chunks_exact(4).all(|px| px == first)
}

#[cfg(test)]
mod tests {
    use image::Rgba;

    use super::*;

    const WHITE: Rgba<u8> = Rgba([255, 255, 255, 255]);

    /// Page of `height` rows: uniform where `blank(y)`, a checkerboard elsewhere
    fn page(height: u32, blank: impl Fn(u32) -> bool) -> RgbaImage {
        RgbaImage::from_fn(40, height, |x, y| {
            if blank(y) || (x + y) % 2 == 0 {
                WHITE
            } else {
                Rgba([0, 0, 0, 255])
            }
        })
    }

    fn assert_close(actual: &[f64], expected: &[f64]) {
        assert_eq!(actual.len(), expected.len(), "{actual:?} vs {expected:?}");
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() < 1e-9, "{actual:?} vs {expected:?}");
        }
    }

    #[test]
    fn trailing_band_snaps_to_page_bottom() {
        let image = page(100, |y| y < 10 || y >= 90);
        let regions = determine_optimal_cut_positions(&image, 0.0, 1.0, false);

        assert_eq!(regions.len(), 1);
        assert!((regions[0].start - 0.9).abs() < 1e-9);
        assert_eq!(regions[0].end, 1.0);
        assert_close(&regions[0].snap_points, &[1.0]);
    }

    #[test]
    fn wide_band_gets_two_inset_points() {
        let image = page(100, |y| (10..40).contains(&y));
        let regions = determine_optimal_cut_positions(&image, 0.0, 1.0, false);

        assert_eq!(regions.len(), 1);
        assert_close(&[regions[0].start, regions[0].end], &[0.1, 0.4]);
        assert_close(&regions[0].snap_points, &[0.11, 0.39]);
    }

    #[test]
    fn narrow_band_gets_midpoint() {
        let image = page(100, |y| (50..53).contains(&y));
        let regions = determine_optimal_cut_positions(&image, 0.0, 1.0, false);

        assert_eq!(regions.len(), 1);
        assert_close(&regions[0].snap_points, &[0.515]);
    }

    #[test]
    fn tiny_bands_are_ignored() {
        let image = page(1000, |y| y == 500 || y == 501);
        assert!(determine_optimal_cut_positions(&image, 0.0, 1.0, false).is_empty());
    }

    #[test]
    fn trailing_band_above_page_bottom_has_no_points() {
        let image = page(100, |y| y >= 95);
        let regions = determine_optimal_cut_positions(&image, 0.0, 0.5, false);

        assert_eq!(regions.len(), 1);
        assert!(regions[0].snap_points.is_empty());
    }

    #[test]
    fn wide_trailing_band_at_bottom_keeps_leading_inset() {
        let image = page(100, |y| y >= 50);
        let regions = determine_optimal_cut_positions(&image, 0.0, 1.0, false);

        assert_eq!(regions.len(), 1);
        assert_close(&regions[0].snap_points, &[0.51, 1.0]);
    }

    #[test]
    fn main_canvas_scans_only_the_section() {
        // Blank rows 60..70 fall in the middle of section 0.5..1.0
        let image = page(100, |y| (60..70).contains(&y));
        let regions = determine_optimal_cut_positions(&image, 0.5, 1.0, true);

        assert_eq!(regions.len(), 1);
        assert_close(&[regions[0].start, regions[0].end], &[0.2, 0.4]);
        assert_close(&regions[0].snap_points, &[0.3]);
    }

    #[test]
    fn section_band_size_is_scaled_by_span() {
        // 4% of a section spanning 10% of the page is below the minimum
        let image = page(100, |y| (50..54).contains(&y));
        assert!(determine_optimal_cut_positions(&image, 0.0, 0.1, false).is_empty());
    }

    #[test]
    fn empty_input_yields_no_regions() {
        let image = RgbaImage::new(0, 0);
        assert!(determine_optimal_cut_positions(&image, 0.0, 1.0, false).is_empty());
        let image = page(10, |_| true);
        assert!(determine_optimal_cut_positions(&image, 0.5, 0.5, true).is_empty());
    }

    #[test]
    fn detection_is_deterministic() {
        let image = page(200, |y| y % 37 < 5);
        let first = determine_optimal_cut_positions(&image, 0.0, 1.0, false);
        let second = determine_optimal_cut_positions(&image, 0.0, 1.0, false);
        assert_eq!(first, second);
    }
}
