//! Quantized elevation grid

use std::path::Path;

use crate::core::error::Error;
use crate::core::types::{Result, Vec3};
use crate::math::{Rect, Size};

/// Lowest storable sample value
pub const MIN_HEIGHT: i16 = -32767;
/// Highest storable sample value
pub const MAX_HEIGHT: i16 = 32767;

/// Colour used when the field carries no colour grid (opaque white, ARGB)
pub const DEFAULT_COLOR: u32 = 0xFFFF_FFFF;

/// Mapping between sample space and world space.
///
/// Sample `(x, y)` with value `h` sits at
/// `offset + (x * scale.x, h * scale.y, y * scale.z)`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TerrainTransform {
    pub scale: Vec3,
    pub offset: Vec3,
}

impl TerrainTransform {
    pub fn new(scale: Vec3, offset: Vec3) -> Self {
        Self { scale, offset }
    }

    pub fn sample_to_world(&self, x: f32, y: f32, height: f32) -> Vec3 {
        self.offset + Vec3::new(x, height, y) * self.scale
    }

    /// World XZ to fractional sample coordinates
    pub fn world_to_sample(&self, x: f32, z: f32) -> (f32, f32) {
        ((x - self.offset.x) / self.scale.x, (z - self.offset.z) / self.scale.z)
    }

    pub fn height_to_world(&self, height: f32) -> f32 {
        self.offset.y + height * self.scale.y
    }

    pub fn world_to_height(&self, y: f32) -> f32 {
        (y - self.offset.y) / self.scale.y
    }
}

/// 2D grid of signed 16-bit elevation samples with an optional colour grid
#[derive(Clone, Debug, PartialEq)]
pub struct HeightField {
    size: Size,
    heights: Vec<i16>,
    colors: Option<Vec<u32>>,
}

impl HeightField {
    /// Create a flat field at height zero
    pub fn new(size: Size) -> Result<Self> {
        Self::from_samples(size, vec![0; size.area()])
    }

    /// Wrap existing samples (row-major, `width * height` entries)
    pub fn from_samples(size: Size, heights: Vec<i16>) -> Result<Self> {
        if size.width < 2 || size.height < 2 {
            return Err(Error::Degenerate(format!(
                "height field must be at least 2x2 samples, got {}x{}",
                size.width, size.height
            )));
        }
        if heights.len() != size.area() {
            return Err(Error::Degenerate(format!(
                "height field expects {} samples, got {}",
                size.area(),
                heights.len()
            )));
        }
        Ok(Self { size, heights, colors: None })
    }

    /// Attach a per-sample colour grid (ARGB)
    pub fn with_colors(mut self, colors: Vec<u32>) -> Result<Self> {
        if colors.len() != self.size.area() {
            return Err(Error::Degenerate(format!(
                "colour grid expects {} entries, got {}",
                self.size.area(),
                colors.len()
            )));
        }
        self.colors = Some(colors);
        Ok(self)
    }

    /// Load a 16-bit grayscale image; 0..65535 maps onto the signed sample range.
    pub fn from_png16(path: &Path) -> Result<Self> {
        let image = image::open(path)?.into_luma16();
        let size = Size::new(image.width(), image.height());
        let heights = image
            .pixels()
            .map(|p| (p.0[0] as i32 - 32768).max(MIN_HEIGHT as i32) as i16)
            .collect();
        log::info!("Loaded {}x{} heightmap from {}", size.width, size.height, path.display());
        Self::from_samples(size, heights)
    }

    pub fn size(&self) -> Size {
        self.size
    }

    pub fn width(&self) -> u32 {
        self.size.width
    }

    pub fn height(&self) -> u32 {
        self.size.height
    }

    pub fn samples(&self) -> &[i16] {
        &self.heights
    }

    pub fn colors(&self) -> Option<&[u32]> {
        self.colors.as_deref()
    }

    fn index(&self, x: u32, y: u32) -> usize {
        x as usize + y as usize * self.size.width as usize
    }

    /// Sample at integer coordinates, clamped to the grid
    pub fn cell(&self, x: i32, y: i32) -> i16 {
        let x = x.clamp(0, self.size.width as i32 - 1) as u32;
        let y = y.clamp(0, self.size.height as i32 - 1) as u32;
        self.heights[self.index(x, y)]
    }

    /// Sample at integer coordinates, `None` outside the grid
    pub fn get(&self, x: i32, y: i32) -> Option<i16> {
        if x < 0 || y < 0 || x >= self.size.width as i32 || y >= self.size.height as i32 {
            return None;
        }
        Some(self.heights[self.index(x as u32, y as u32)])
    }

    pub fn set_cell(&mut self, x: u32, y: u32, value: i16) {
        if x < self.size.width && y < self.size.height {
            let i = self.index(x, y);
            self.heights[i] = value.max(MIN_HEIGHT);
        }
    }

    /// Add `delta` to a sample, saturating at the storable range
    pub fn offset_cell(&mut self, x: u32, y: u32, delta: i32) {
        if x < self.size.width && y < self.size.height {
            let i = self.index(x, y);
            let value = (self.heights[i] as i32 + delta).clamp(MIN_HEIGHT as i32, MAX_HEIGHT as i32);
            self.heights[i] = value as i16;
        }
    }

    pub fn color(&self, x: i32, y: i32) -> u32 {
        match &self.colors {
            Some(colors) => {
                let x = x.clamp(0, self.size.width as i32 - 1) as u32;
                let y = y.clamp(0, self.size.height as i32 - 1) as u32;
                colors[self.index(x, y)]
            }
            None => DEFAULT_COLOR,
        }
    }

    /// Bilinear-on-triangles height at fractional sample coordinates.
    ///
    /// Each cell is split along its `(0,0)-(1,1)` diagonal, matching the
    /// rendered triangulation. Returns `None` outside the grid.
    pub fn interpolated(&self, x: f32, y: f32) -> Option<f32> {
        let max_x = (self.size.width - 1) as f32;
        let max_y = (self.size.height - 1) as f32;
        if !(0.0..=max_x).contains(&x) || !(0.0..=max_y).contains(&y) {
            return None;
        }

        let x0 = (x.floor() as i32).min(self.size.width as i32 - 2);
        let y0 = (y.floor() as i32).min(self.size.height as i32 - 2);
        let fx = x - x0 as f32;
        let fy = y - y0 as f32;

        let h00 = self.cell(x0, y0) as f32;
        let h10 = self.cell(x0 + 1, y0) as f32;
        let h01 = self.cell(x0, y0 + 1) as f32;
        let h11 = self.cell(x0 + 1, y0 + 1) as f32;

        Some(if fx < fy {
            h00 + fy * (h01 - h00) + fx * (h11 - h01)
        } else {
            h00 + fx * (h10 - h00) + fy * (h11 - h10)
        })
    }

    pub fn min_max(&self) -> (i16, i16) {
        self.heights
            .iter()
            .fold((i16::MAX, i16::MIN), |(lo, hi), &h| (lo.min(h), hi.max(h)))
    }

    /// Linearly remap every sample into `[min, max]`. A flat field is left untouched.
    pub fn normalize(&mut self, min: i16, max: i16) {
        let (lo, hi) = self.min_max();
        if lo == hi {
            return;
        }
        let (lo, hi) = (lo as f32, hi as f32);
        let range = (max as f32 - min as f32) / (hi - lo);
        for h in &mut self.heights {
            let value = min as f32 + (*h as f32 - lo) * range;
            *h = value.round().clamp(MIN_HEIGHT as f32, MAX_HEIGHT as f32) as i16;
        }
    }

    /// Multiply every sample, saturating at the storable range
    pub fn scale(&mut self, factor: f32) {
        for h in &mut self.heights {
            *h = (*h as f32 * factor).round().clamp(MIN_HEIGHT as f32, MAX_HEIGHT as f32) as i16;
        }
    }

    fn check_rect(&self, rect: &Rect) -> Result<()> {
        if rect.is_empty() || rect.intersect(&Rect::from_size(self.size)) != Some(*rect) {
            return Err(Error::Degenerate(format!("rectangle {:?} outside height field", rect)));
        }
        Ok(())
    }

    /// Copy a sub-rectangle of samples out, row-major
    pub fn read_rect(&self, rect: Rect) -> Result<Vec<i16>> {
        self.check_rect(&rect)?;
        Ok(rect.cells().map(|(x, y)| self.cell(x, y)).collect())
    }

    /// Copy a sub-rectangle of colours out, row-major
    pub fn read_color_rect(&self, rect: Rect) -> Result<Option<Vec<u32>>> {
        self.check_rect(&rect)?;
        Ok(self.colors.as_ref().map(|_| rect.cells().map(|(x, y)| self.color(x, y)).collect()))
    }

    /// Overwrite a sub-rectangle of samples, row-major
    pub fn write_rect(&mut self, rect: Rect, samples: &[i16]) -> Result<()> {
        self.check_rect(&rect)?;
        if samples.len() != rect.size().area() {
            return Err(Error::Degenerate(format!(
                "rectangle {:?} needs {} samples, got {}",
                rect,
                rect.size().area(),
                samples.len()
            )));
        }
        for ((x, y), &h) in rect.cells().zip(samples) {
            self.set_cell(x as u32, y as u32, h);
        }
        Ok(())
    }

    /// Overwrite a sub-rectangle of colours, creating the colour grid on demand
    pub fn write_color_rect(&mut self, rect: Rect, colors: &[u32]) -> Result<()> {
        self.check_rect(&rect)?;
        if colors.len() != rect.size().area() {
            return Err(Error::Degenerate(format!("rectangle {:?} colour count mismatch", rect)));
        }
        let width = self.size.width as usize;
        let area = self.size.area();
        let grid = self.colors.get_or_insert_with(|| vec![DEFAULT_COLOR; area]);
        for ((x, y), &c) in rect.cells().zip(colors) {
            grid[x as usize + y as usize * width] = c;
        }
        Ok(())
    }

    /// Vertex normal averaged over the up-to-4 quadrants around a sample.
    ///
    /// `spacing` is the world size of one sample step on each axis. Samples
    /// with no complete quadrant get `(0, 1, 0)`.
    pub fn normal_at(&self, x: i32, y: i32, spacing: Vec3) -> Vec3 {
        let Some(center) = self.get(x, y) else {
            return Vec3::Y;
        };
        let position = |dx: i32, dy: i32, h: i16| {
            Vec3::new(dx as f32 * spacing.x, h as f32 * spacing.y, dy as f32 * spacing.z)
        };
        let origin = position(0, 0, center);

        let mut sum = Vec3::ZERO;
        for (sx, sy) in [(1, 1), (-1, 1), (-1, -1), (1, -1)] {
            let (Some(hx), Some(hy)) = (self.get(x + sx, y), self.get(x, y + sy)) else {
                continue;
            };
            let along_x = position(sx, 0, hx) - origin;
            let along_y = position(0, sy, hy) - origin;
            // Flip mirrored quadrants so every contribution points up
            let normal = along_y.cross(along_x) * (sx * sy) as f32;
            sum += normal.normalize_or_zero();
        }

        let normal = sum.normalize_or_zero();
        if normal == Vec3::ZERO { Vec3::Y } else { normal }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(size: Size) -> HeightField {
        let samples = (0..size.area())
            .map(|i| (i as u32 % size.width) as i16 * 10)
            .collect();
        HeightField::from_samples(size, samples).unwrap()
    }

    #[test]
    fn test_rejects_degenerate() {
        assert!(HeightField::new(Size::new(1, 5)).is_err());
        assert!(HeightField::from_samples(Size::new(2, 2), vec![0; 3]).is_err());
    }

    #[test]
    fn test_cell_clamps() {
        let field = ramp(Size::new(4, 4));
        assert_eq!(field.cell(-3, 0), 0);
        assert_eq!(field.cell(10, 2), 30);
        assert_eq!(field.get(4, 0), None);
    }

    #[test]
    fn test_offset_cell_saturates() {
        let mut field = HeightField::new(Size::new(2, 2)).unwrap();
        field.offset_cell(0, 0, 100_000);
        field.offset_cell(1, 1, -100_000);
        assert_eq!(field.cell(0, 0), MAX_HEIGHT);
        assert_eq!(field.cell(1, 1), MIN_HEIGHT);
    }

    #[test]
    fn test_interpolated_matches_corners_and_triangles() {
        let samples = vec![0, 10, 20, 40];
        let field = HeightField::from_samples(Size::new(2, 2), samples).unwrap();
        assert_eq!(field.interpolated(0.0, 0.0), Some(0.0));
        assert_eq!(field.interpolated(1.0, 1.0), Some(40.0));
        // Upper-right triangle uses h10
        assert!((field.interpolated(0.75, 0.25).unwrap() - (7.5 + 0.25 * 30.0)).abs() < 0.001);
        // Lower-left triangle uses h01
        assert!((field.interpolated(0.25, 0.75).unwrap() - (15.0 + 0.25 * 20.0)).abs() < 0.001);
        assert_eq!(field.interpolated(-0.1, 0.5), None);
        assert_eq!(field.interpolated(0.5, 1.1), None);
    }

    #[test]
    fn test_normalize_skips_flat() {
        let mut flat = HeightField::new(Size::new(3, 3)).unwrap();
        flat.normalize(-100, 100);
        assert!(flat.samples().iter().all(|h| *h == 0));

        let mut field = ramp(Size::new(3, 2));
        field.normalize(-100, 100);
        assert_eq!(field.min_max(), (-100, 100));
        assert_eq!(field.cell(1, 0), 0);
    }

    #[test]
    fn test_scale_clamps() {
        let mut field = ramp(Size::new(4, 2));
        field.scale(2000.0);
        assert_eq!(field.cell(3, 0), MAX_HEIGHT);
        assert_eq!(field.cell(0, 0), 0);
    }

    #[test]
    fn test_rect_roundtrip() {
        let mut field = HeightField::new(Size::new(5, 5)).unwrap();
        let rect = Rect::new(1, 2, 4, 4);
        field.write_rect(rect, &[1, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(field.read_rect(rect).unwrap(), vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(field.cell(3, 3), 6);
        assert!(field.read_rect(Rect::new(3, 3, 6, 4)).is_err());
        assert!(field.write_rect(rect, &[1]).is_err());
    }

    #[test]
    fn test_color_rect_creates_grid() {
        let mut field = HeightField::new(Size::new(3, 3)).unwrap();
        assert_eq!(field.color(1, 1), DEFAULT_COLOR);
        field.write_color_rect(Rect::new(1, 1, 2, 2), &[0xFF00_00FF]).unwrap();
        assert_eq!(field.color(1, 1), 0xFF00_00FF);
        assert_eq!(field.color(0, 0), DEFAULT_COLOR);
    }

    #[test]
    fn test_normal_flat_and_sloped() {
        let flat = HeightField::new(Size::new(3, 3)).unwrap();
        assert!((flat.normal_at(1, 1, Vec3::ONE) - Vec3::Y).length() < 0.001);
        assert!((flat.normal_at(0, 0, Vec3::ONE) - Vec3::Y).length() < 0.001);

        // Height rises by 1 per sample along +x: normal tilts towards -x
        let slope = ramp(Size::new(3, 3));
        let n = slope.normal_at(1, 1, Vec3::new(1.0, 0.1, 1.0));
        let expected = Vec3::new(-1.0, 1.0, 0.0).normalize();
        assert!((n - expected).length() < 0.001);
    }

    #[test]
    fn test_transform_roundtrip() {
        let transform = TerrainTransform::new(Vec3::new(2.0, 0.5, 4.0), Vec3::new(-10.0, 1.0, 20.0));
        let world = transform.sample_to_world(3.0, 2.0, 8.0);
        assert_eq!(world, Vec3::new(-4.0, 5.0, 28.0));
        assert_eq!(transform.world_to_sample(world.x, world.z), (3.0, 2.0));
        assert_eq!(transform.world_to_height(world.y), 8.0);
    }
}
