//! Brush falloff filtering and attenuation

use crate::core::types::{Vec2, Vec3};
use crate::math::Rect;
use super::params::PaintParams;

/// Height and normal queries used to attenuate paint
pub trait SurfaceSampler {
    /// World-space terrain height at world XZ
    fn height(&self, x: f32, z: f32) -> Option<f32>;
    /// Bilinearly interpolated unit normal at world XZ
    fn normal(&self, x: f32, z: f32) -> Vec3;
}

/// Copy of accumulated paint over a rectangle of global blend-map texels
#[derive(Clone, Debug, PartialEq)]
pub struct PaintSnapshot {
    rect: Rect,
    data: Vec<u8>,
}

impl PaintSnapshot {
    pub fn new(rect: Rect, data: Vec<u8>) -> Self {
        debug_assert_eq!(data.len(), rect.size().area());
        Self { rect, data }
    }

    pub fn rect(&self) -> Rect {
        self.rect
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Texel at global coordinates, zero outside the snapshot
    pub fn value(&self, x: i32, y: i32) -> u8 {
        if !self.rect.contains(x, y) {
            return 0;
        }
        let i = (x - self.rect.left) as usize + (y - self.rect.top) as usize * self.rect.width() as usize;
        self.data[i]
    }
}

/// Box filter half-width in texels for a brush, 0 when filtering is skipped.
///
/// The falloff band is `outer - inner` wide; the kernel spans half of it on
/// each side. Kernels narrower than 3 texels are not worth filtering.
pub fn kernel_half_width(params: &PaintParams, texel_size: Vec2) -> usize {
    let band = (params.outer_radius - params.inner_radius).max(0.0) * 0.5;
    let texel = texel_size.x.min(texel_size.y).max(f32::EPSILON);
    let half = (band / texel).round() as usize;
    if 2 * half + 1 < 3 { 0 } else { half }
}

/// Separable box filter of `snapshot` evaluated over `region` (global texels).
///
/// Texels outside the snapshot count as zero, so the kernel is always divided
/// by its full size. Output is row-major over `region`.
pub fn box_filter(snapshot: &PaintSnapshot, region: Rect, half: usize) -> Vec<u8> {
    if half == 0 {
        return region.cells().map(|(x, y)| snapshot.value(x, y)).collect();
    }

    let h = half as i32;
    let kernel = (2 * half + 1) as u32;
    let width = region.width() as usize;

    // Horizontal pass over the rows the vertical pass will need
    let rows = region.height() as usize + 2 * half;
    let mut horizontal = vec![0u32; rows * width];
    for (row, y) in (region.top - h..region.bottom + h).enumerate() {
        for (col, x) in (region.left..region.right).enumerate() {
            horizontal[row * width + col] =
                (x - h..=x + h).map(|sx| snapshot.value(sx, y) as u32).sum();
        }
    }

    let mut out = Vec::with_capacity(region.size().area());
    for row in 0..region.height() as usize {
        for col in 0..width {
            let sum: u32 = (row..row + 2 * half + 1).map(|r| horizontal[r * width + col]).sum();
            out.push(((sum + kernel * kernel / 2) / (kernel * kernel)) as u8);
        }
    }
    out
}

/// Soft-edged height band: 1 inside `[min, max]`, fading to 0 over `softness`
pub fn height_attenuation(height: f32, min: f32, max: f32, softness: f32) -> f32 {
    let outside = if height < min {
        min - height
    } else if height > max {
        height - max
    } else {
        return 1.0;
    };
    if softness <= 0.0 {
        return 0.0;
    }
    (1.0 - outside / softness).clamp(0.0, 1.0)
}

/// Slope response of a surface normal against an axis
pub fn slope_attenuation(normal: Vec3, axis: Vec3, scale: f32, bias: f32, invert: bool) -> f32 {
    let weight = (normal.dot(axis.normalize_or_zero()) * scale + bias).clamp(0.0, 1.0);
    if invert { 1.0 - weight } else { weight }
}

/// Combined height/slope attenuation for one world position
pub fn attenuation(params: &PaintParams, surface: &dyn SurfaceSampler, x: f32, z: f32) -> f32 {
    let mut weight = 1.0;
    if params.enable_height_limits {
        // No height under the texel: leave the texel alone
        let Some(h) = surface.height(x, z) else {
            return 0.0;
        };
        weight *= height_attenuation(h, params.min_height, params.max_height, params.height_softness);
    }
    if params.enable_slope_limits && weight > 0.0 {
        weight *= slope_attenuation(
            surface.normal(x, z),
            params.slope_axis,
            params.slope_scale,
            params.slope_bias,
            params.invert_slope,
        );
    }
    weight
}
