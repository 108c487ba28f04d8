// Luma grid reduction and the rolling baseline built from it.
//
// Every frame is reduced to a fixed number of cells (area average of BT.601
// luma), so a score computed on the grid does not depend on the camera
// resolution.

use crate::frame::RasterImage;

/// Area-averaged luma values on a fixed grid
#[derive(Debug, Clone, PartialEq)]
pub struct LumaGrid {
    width: u32,
    height: u32,
    cells: Vec<f32>,
}

impl LumaGrid {
    /// Reduce `image` to `grid_width x grid_height` cells.
    ///
    /// The grid is clamped to the image size so every cell covers at least
    /// one pixel.
    pub fn from_image(image: &RasterImage, grid_width: u32, grid_height: u32) -> Self {
        let gw = grid_width.clamp(1, image.width());
        let gh = grid_height.clamp(1, image.height());
        let mut sums = vec![0u64; (gw * gh) as usize];
        let mut counts = vec![0u32; (gw * gh) as usize];

        for y in 0..image.height() {
            let cy = (y as u64 * gh as u64 / image.height() as u64) as u32;
            for x in 0..image.width() {
                let cx = (x as u64 * gw as u64 / image.width() as u64) as u32;
                let idx = (cy * gw + cx) as usize;
                sums[idx] += image.luma_at(x, y) as u64;
                counts[idx] += 1;
            }
        }

        let cells = sums
            .iter()
            .zip(&counts)
            .map(|(&sum, &count)| sum as f32 / count.max(1) as f32)
            .collect();

        Self {
            width: gw,
            height: gh,
            cells,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn cells(&self) -> &[f32] {
        &self.cells
    }

    pub fn same_shape(&self, other: &LumaGrid) -> bool {
        self.width == other.width && self.height == other.height
    }

    /// Fraction of cells whose absolute difference exceeds `delta`, in [0, 1]
    pub fn changed_fraction(&self, other: &LumaGrid, delta: f32) -> f32 {
        if !self.same_shape(other) || self.cells.is_empty() {
            return 1.0;
        }
        let changed = self
            .cells
            .iter()
            .zip(&other.cells)
            .filter(|(a, b)| (**a - **b).abs() > delta)
            .count();
        changed as f32 / self.cells.len() as f32
    }
}

/// The detector's reference scene
#[derive(Debug, Clone)]
pub struct Baseline {
    grid: LumaGrid,
    samples: u32,
}

impl Baseline {
    pub fn seed(grid: LumaGrid) -> Self {
        Self { grid, samples: 1 }
    }

    /// Number of frames folded in so far
    pub fn samples(&self) -> u32 {
        self.samples
    }

    pub fn grid(&self) -> &LumaGrid {
        &self.grid
    }

    pub fn matches(&self, grid: &LumaGrid) -> bool {
        self.grid.same_shape(grid)
    }

    /// Cumulative average, used while warming up
    pub fn accumulate(&mut self, grid: &LumaGrid) {
        self.samples += 1;
        let weight = 1.0 / self.samples as f32;
        self.blend_cells(grid, weight);
    }

    /// Exponential refresh toward a quiet frame
    pub fn refresh(&mut self, grid: &LumaGrid, rate: f32) {
        self.samples = self.samples.saturating_add(1);
        self.blend_cells(grid, rate.clamp(0.0, 1.0));
    }

    pub fn score(&self, grid: &LumaGrid, pixel_delta: f32) -> f32 {
        self.grid.changed_fraction(grid, pixel_delta)
    }

    fn blend_cells(&mut self, grid: &LumaGrid, weight: f32) {
        for (base, &value) in self.grid.cells.iter_mut().zip(&grid.cells) {
            *base += (value - *base) * weight;
        }
    }
}
