//! Model-free classic detector: skin-chrominance segmentation + region filtering.
//!
//! Pixels are classified as skin in YCbCr space (Chai & Ngan bounds), pooled
//! into a coarse cell grid, and 4-connected skin regions whose size, aspect
//! ratio and fill look like a face are reported. No model file is needed, so
//! construction cannot fail.

use super::{clip_boxes, Detector, DetectorError, DetectorKind};
use crate::types::BoundingBox;
use image::RgbImage;

const CELL_SIZE: u32 = 4;
/// Minimum fraction of skin pixels for a cell to count as skin.
const CELL_SKIN_FRACTION: f32 = 0.5;
/// Minimum face side at upsample level 0, in pixels.
const BASE_MIN_FACE: f32 = 24.0;
const MIN_FACE_FLOOR: f32 = 8.0;
/// Accepted height / width ratio range for a face region.
const ASPECT_RANGE: (f32, f32) = (0.8, 2.2);
/// Minimum fraction of a region's bounding cells that must be skin.
const MIN_FILL: f32 = 0.4;

const CB_RANGE: (f32, f32) = (77.0, 127.0);
const CR_RANGE: (f32, f32) = (133.0, 173.0);

/// Fast classic detector with no external dependencies.
pub struct ClassicDetector {
    min_face: f32,
}

impl ClassicDetector {
    /// `upsample` levels halve the minimum detectable face size each.
    pub fn new(upsample: u32) -> Self {
        let min_face = (BASE_MIN_FACE / 2f32.powi(upsample.min(4) as i32)).max(MIN_FACE_FLOOR);
        Self { min_face }
    }
}

impl Detector for ClassicDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Fast
    }

    fn locate_faces(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        let (width, height) = image.dimensions();
        let grid_w = width.div_ceil(CELL_SIZE) as usize;
        let grid_h = height.div_ceil(CELL_SIZE) as usize;
        if grid_w == 0 || grid_h == 0 {
            return Ok(Vec::new());
        }

        let cells = skin_cells(image, grid_w, grid_h);
        let regions = connected_regions(&cells, grid_w, grid_h);

        let boxes = regions.into_iter().filter_map(|region| {
            let bbox = BoundingBox::new(
                (region.min_y * CELL_SIZE as usize) as f32,
                ((region.max_x + 1) * CELL_SIZE as usize) as f32,
                ((region.max_y + 1) * CELL_SIZE as usize) as f32,
                (region.min_x * CELL_SIZE as usize) as f32,
            )
            .clipped(width, height);

            let (w, h) = (bbox.width(), bbox.height());
            let aspect = h / w.max(1.0);
            let span = (region.max_x - region.min_x + 1) * (region.max_y - region.min_y + 1);
            let fill = region.cells as f32 / span as f32;

            (w >= self.min_face
                && h >= self.min_face
                && (ASPECT_RANGE.0..=ASPECT_RANGE.1).contains(&aspect)
                && fill >= MIN_FILL)
                .then_some(bbox)
        });

        Ok(clip_boxes(boxes, width, height))
    }
}

fn is_skin(r: u8, g: u8, b: u8) -> bool {
    let (r, g, b) = (r as f32, g as f32, b as f32);
    let cb = 128.0 - 0.168_736 * r - 0.331_264 * g + 0.5 * b;
    let cr = 128.0 + 0.5 * r - 0.418_688 * g - 0.081_312 * b;
    (CB_RANGE.0..=CB_RANGE.1).contains(&cb) && (CR_RANGE.0..=CR_RANGE.1).contains(&cr)
}

/// Pool per-pixel skin classification into a `grid_w × grid_h` boolean grid.
fn skin_cells(image: &RgbImage, grid_w: usize, grid_h: usize) -> Vec<bool> {
    let mut skin = vec![0u32; grid_w * grid_h];
    let mut total = vec![0u32; grid_w * grid_h];

    for (x, y, p) in image.enumerate_pixels() {
        let cell = (y / CELL_SIZE) as usize * grid_w + (x / CELL_SIZE) as usize;
        total[cell] += 1;
        if is_skin(p[0], p[1], p[2]) {
            skin[cell] += 1;
        }
    }

    skin.iter()
        .zip(total.iter())
        .map(|(&s, &t)| t > 0 && s as f32 / t as f32 >= CELL_SKIN_FRACTION)
        .collect()
}

#[derive(Debug)]
struct Region {
    min_x: usize,
    min_y: usize,
    max_x: usize,
    max_y: usize,
    cells: usize,
}

/// 4-connected component labelling over the cell grid, in raster order.
fn connected_regions(cells: &[bool], grid_w: usize, grid_h: usize) -> Vec<Region> {
    let mut visited = vec![false; cells.len()];
    let mut regions = Vec::new();
    let mut stack = Vec::new();

    for start in 0..cells.len() {
        if !cells[start] || visited[start] {
            continue;
        }
        visited[start] = true;
        stack.push(start);

        let mut region = Region {
            min_x: usize::MAX,
            min_y: usize::MAX,
            max_x: 0,
            max_y: 0,
            cells: 0,
        };

        while let Some(idx) = stack.pop() {
            let (x, y) = (idx % grid_w, idx / grid_w);
            region.min_x = region.min_x.min(x);
            region.min_y = region.min_y.min(y);
            region.max_x = region.max_x.max(x);
            region.max_y = region.max_y.max(y);
            region.cells += 1;

            let neighbours = [
                (x > 0).then(|| idx - 1),
                (x + 1 < grid_w).then(|| idx + 1),
                (y > 0).then(|| idx - grid_w),
                (y + 1 < grid_h).then(|| idx + grid_w),
            ];
            for n in neighbours.into_iter().flatten() {
                if cells[n] && !visited[n] {
                    visited[n] = true;
                    stack.push(n);
                }
            }
        }

        regions.push(region);
    }

    regions
}
