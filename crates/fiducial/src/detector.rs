//! Compact square-marker detector.
//!
//! Finds dark connected components, fits their extreme corners to a
//! quadrilateral, samples the 6x6 cell grid (black border + 4x4 payload)
//! and matches the payload against the dictionary codebook under rotation.
//!
//! Markers must be roughly upright in the image (roll under ~45 degrees);
//! 90-degree payload rotations are handled by the codebook match. This
//! covers a ceiling-mounted forward camera; it is not a general-pose
//! detector.

use crate::dict;
use image::GrayImage;
use types::MarkerObservation;

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Smallest dark component considered a marker candidate, in pixels
    pub min_component_px: usize,
    /// Smallest candidate bounding box side, in pixels
    pub min_side_px: u32,
    /// Border cells (out of 20) that must sample dark
    pub min_border_cells: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            min_component_px: 80,
            min_side_px: 12,
            min_border_cells: 18,
        }
    }
}

/// Detector over an embedded codebook.
pub struct ArucoDetector {
    codebook: &'static [u16],
    config: DetectorConfig,
}

impl ArucoDetector {
    pub fn dict_4x4_50() -> Self {
        Self {
            codebook: &dict::DICT_4X4_50,
            config: DetectorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: DetectorConfig) -> Self {
        self.config = config;
        self
    }

    /// Detect markers in a grayscale frame.
    pub fn detect(&self, gray: &GrayImage, timestamp_ms: u64) -> Vec<MarkerObservation> {
        let (width, height) = gray.dimensions();
        if width < self.config.min_side_px || height < self.config.min_side_px {
            return Vec::new();
        }
        let threshold = luma_threshold(gray);
        let mut observations = Vec::new();

        for component in dark_components(gray, threshold, self.config.min_component_px) {
            let Some(corners) = quad_corners(&component) else {
                continue;
            };
            let (min, max) = bounds(&corners);
            if (max[0] - min[0]) < self.config.min_side_px as f64
                || (max[1] - min[1]) < self.config.min_side_px as f64
            {
                continue;
            }
            let Some(bits) = sample_payload(gray, threshold, &corners, self.config.min_border_cells)
            else {
                continue;
            };
            let Some(id) = dict::match_code(self.codebook, bits) else {
                continue;
            };

            let center = [
                corners.iter().map(|c| c[0]).sum::<f64>() / 4.0,
                corners.iter().map(|c| c[1]).sum::<f64>() / 4.0,
            ];
            observations.push(MarkerObservation {
                id,
                corners,
                center,
                area_px: quad_area(&corners),
                frame_width: width,
                frame_height: height,
                timestamp_ms,
            });
        }

        observations
    }
}

/// Global threshold: a little below the mean so gray noise counts as light.
fn luma_threshold(gray: &GrayImage) -> u8 {
    let sum: u64 = gray.pixels().map(|p| p.0[0] as u64).sum();
    let mean = (sum / (gray.width() as u64 * gray.height() as u64).max(1)) as i32;
    (mean - 10).clamp(1, 255) as u8
}

/// Dark connected components (4-connectivity) of at least `min_px` pixels.
fn dark_components(gray: &GrayImage, threshold: u8, min_px: usize) -> Vec<Vec<(u32, u32)>> {
    let (width, height) = gray.dimensions();
    let idx = |x: u32, y: u32| (y * width + x) as usize;
    let mut visited = vec![false; (width * height) as usize];
    let mut components = Vec::new();

    for y in 0..height {
        for x in 0..width {
            if visited[idx(x, y)] || gray.get_pixel(x, y).0[0] >= threshold {
                continue;
            }
            let mut stack = vec![(x, y)];
            let mut pixels = Vec::new();
            visited[idx(x, y)] = true;
            while let Some((px, py)) = stack.pop() {
                pixels.push((px, py));
                let push = |nx: u32, ny: u32, visited: &mut Vec<bool>, stack: &mut Vec<(u32, u32)>| {
                    if !visited[idx(nx, ny)] && gray.get_pixel(nx, ny).0[0] < threshold {
                        visited[idx(nx, ny)] = true;
                        stack.push((nx, ny));
                    }
                };
                if px > 0 {
                    push(px - 1, py, &mut visited, &mut stack);
                }
                if px + 1 < width {
                    push(px + 1, py, &mut visited, &mut stack);
                }
                if py > 0 {
                    push(px, py - 1, &mut visited, &mut stack);
                }
                if py + 1 < height {
                    push(px, py + 1, &mut visited, &mut stack);
                }
            }
            if pixels.len() >= min_px {
                components.push(pixels);
            }
        }
    }
    components
}

/// Extreme-projection corners: top-left, top-right, bottom-right,
/// bottom-left (image coordinates, y down). Degenerate fits are rejected.
fn quad_corners(pixels: &[(u32, u32)]) -> Option<[[f64; 2]; 4]> {
    let mut tl = pixels[0];
    let mut tr = pixels[0];
    let mut br = pixels[0];
    let mut bl = pixels[0];
    for &(x, y) in pixels {
        let (xi, yi) = (x as i64, y as i64);
        if xi + yi < tl.0 as i64 + tl.1 as i64 {
            tl = (x, y);
        }
        if xi - yi > tr.0 as i64 - tr.1 as i64 {
            tr = (x, y);
        }
        if xi + yi > br.0 as i64 + br.1 as i64 {
            br = (x, y);
        }
        if xi - yi < bl.0 as i64 - bl.1 as i64 {
            bl = (x, y);
        }
    }
    let corners = [
        [tl.0 as f64, tl.1 as f64],
        [tr.0 as f64, tr.1 as f64],
        [br.0 as f64, br.1 as f64],
        [bl.0 as f64, bl.1 as f64],
    ];
    // All four corners must be distinct
    for i in 0..4 {
        for j in i + 1..4 {
            let dx = corners[i][0] - corners[j][0];
            let dy = corners[i][1] - corners[j][1];
            if dx * dx + dy * dy < 4.0 {
                return None;
            }
        }
    }
    Some(corners)
}

fn bounds(corners: &[[f64; 2]; 4]) -> ([f64; 2], [f64; 2]) {
    let mut min = [f64::INFINITY; 2];
    let mut max = [f64::NEG_INFINITY; 2];
    for c in corners {
        for k in 0..2 {
            min[k] = min[k].min(c[k]);
            max[k] = max[k].max(c[k]);
        }
    }
    (min, max)
}

/// Bilinear point inside the corner quad; (u, v) in [0, 1]^2.
fn quad_point(corners: &[[f64; 2]; 4], u: f64, v: f64) -> (f64, f64) {
    let [tl, tr, br, bl] = corners;
    let x = tl[0] * (1.0 - u) * (1.0 - v) + tr[0] * u * (1.0 - v) + br[0] * u * v + bl[0] * (1.0 - u) * v;
    let y = tl[1] * (1.0 - u) * (1.0 - v) + tr[1] * u * (1.0 - v) + br[1] * u * v + bl[1] * (1.0 - u) * v;
    (x, y)
}

fn sample_dark(gray: &GrayImage, threshold: u8, x: f64, y: f64) -> bool {
    let xi = (x.round().max(0.0) as u32).min(gray.width() - 1);
    let yi = (y.round().max(0.0) as u32).min(gray.height() - 1);
    gray.get_pixel(xi, yi).0[0] < threshold
}

/// Sample the 6x6 cell grid. Requires a mostly-dark border; returns the
/// inner 4x4 payload bits, white cell = 1, row-major from the top-left.
fn sample_payload(
    gray: &GrayImage,
    threshold: u8,
    corners: &[[f64; 2]; 4],
    min_border_cells: usize,
) -> Option<u16> {
    let mut border_dark = 0usize;
    let mut bits = 0u16;
    for row in 0..6u32 {
        for col in 0..6u32 {
            let u = (col as f64 + 0.5) / 6.0;
            let v = (row as f64 + 0.5) / 6.0;
            let (x, y) = quad_point(corners, u, v);
            let dark = sample_dark(gray, threshold, x, y);
            let is_border = row == 0 || row == 5 || col == 0 || col == 5;
            if is_border {
                if dark {
                    border_dark += 1;
                }
            } else if !dark {
                let (r, c) = (row - 1, col - 1);
                bits |= 1 << (15 - (r * 4 + c));
            }
        }
    }
    (border_dark >= min_border_cells).then_some(bits)
}

/// Shoelace area of the corner quad.
fn quad_area(corners: &[[f64; 2]; 4]) -> f64 {
    let mut sum = 0.0;
    for i in 0..4 {
        let a = corners[i];
        let b = corners[(i + 1) % 4];
        sum += a[0] * b[1] - b[0] * a[1];
    }
    (sum / 2.0).abs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    /// Paint a marker as a 6x6 cell grid, `cell` pixels per cell, with the
    /// top-left border cell at (x0, y0).
    fn paint_marker(img: &mut GrayImage, code: u16, x0: u32, y0: u32, cell: u32) {
        for row in 0..6u32 {
            for col in 0..6u32 {
                let is_border = row == 0 || row == 5 || col == 0 || col == 5;
                let white = if is_border {
                    false
                } else {
                    let (r, c) = (row - 1, col - 1);
                    (code >> (15 - (r * 4 + c))) & 1 == 1
                };
                let value = if white { 255 } else { 0 };
                for dy in 0..cell {
                    for dx in 0..cell {
                        img.put_pixel(x0 + col * cell + dx, y0 + row * cell + dy, Luma([value]));
                    }
                }
            }
        }
    }

    fn white_frame(w: u32, h: u32) -> GrayImage {
        GrayImage::from_pixel(w, h, Luma([255]))
    }

    #[test]
    fn test_detects_single_marker() {
        let mut img = white_frame(320, 240);
        paint_marker(&mut img, dict::DICT_4X4_50[7], 100, 80, 10);
        let detector = ArucoDetector::dict_4x4_50();
        let obs = detector.detect(&img, 123);
        assert_eq!(obs.len(), 1);
        let m = &obs[0];
        assert_eq!(m.id, 7);
        assert_eq!(m.timestamp_ms, 123);
        assert_eq!(m.frame_width, 320);
        // Marker spans 60x60 px from (100, 80)
        assert!((m.center[0] - 129.5).abs() < 2.0);
        assert!((m.center[1] - 109.5).abs() < 2.0);
        assert!((m.area_px - 3481.0).abs() < 400.0);
    }

    #[test]
    fn test_detects_rotated_payload() {
        let mut img = white_frame(320, 240);
        paint_marker(&mut img, dict::rotate(dict::DICT_4X4_50[3]), 40, 40, 8);
        let obs = ArucoDetector::dict_4x4_50().detect(&img, 0);
        assert_eq!(obs.len(), 1);
        assert_eq!(obs[0].id, 3);
    }

    #[test]
    fn test_detects_two_markers() {
        let mut img = white_frame(400, 240);
        paint_marker(&mut img, dict::DICT_4X4_50[2], 30, 60, 9);
        paint_marker(&mut img, dict::DICT_4X4_50[5], 250, 100, 9);
        let mut obs = ArucoDetector::dict_4x4_50().detect(&img, 0);
        obs.sort_by_key(|m| m.id);
        assert_eq!(obs.len(), 2);
        assert_eq!(obs[0].id, 2);
        assert_eq!(obs[1].id, 5);
    }

    #[test]
    fn test_plain_black_square_rejected() {
        let mut img = white_frame(320, 240);
        // Solid block: payload samples all dark -> code 0x0000, not in
        // the codebook.
        for y in 80..140 {
            for x in 100..160 {
                img.put_pixel(x, y, Luma([0]));
            }
        }
        let obs = ArucoDetector::dict_4x4_50().detect(&img, 0);
        assert!(obs.is_empty());
    }

    #[test]
    fn test_tiny_blob_rejected() {
        let mut img = white_frame(320, 240);
        for y in 10..16 {
            for x in 10..16 {
                img.put_pixel(x, y, Luma([0]));
            }
        }
        let obs = ArucoDetector::dict_4x4_50().detect(&img, 0);
        assert!(obs.is_empty());
    }

    #[test]
    fn test_blank_frame_has_no_detections() {
        let img = white_frame(64, 64);
        assert!(ArucoDetector::dict_4x4_50().detect(&img, 0).is_empty());
    }
}
