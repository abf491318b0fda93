//! Screen-space horizon buffer for terrain occlusion
//!
//! One height per screen column, measured in pixels up from the bottom of the
//! viewport. Occluders raise the stored horizon; an occludee edge is hidden
//! when it stays at or below the horizon in every column it covers.
//!
//! Only edges running left to right on screen are drawn or tested, so a quad
//! contributes its upper outline when its corners wind clockwise on screen.
//! Callers reverse quads seen from below (see [`flipped`]).

use crate::core::types::{Mat4, Vec3, Vec4};

/// Outcome of rasterizing or testing one edge
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrawResult {
    /// Tested and entirely at or below the horizon
    Occluded = 0,
    /// Rasterized, or tested with at least one column above the horizon
    Visible = 1,
    /// Behind the near plane or entirely off screen
    Clipped = 2,
    /// Projects right to left, or to a vertical or zero-width line
    Invalid = 3,
}

/// Combined result of testing the four edges of a quad
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuadVisibility {
    Visible,
    Occluded,
    /// No edge could be tested
    Untested,
}

/// Per-column horizon heights for one frame
#[derive(Clone, Debug)]
pub struct HorizonBuffer {
    heights: Vec<f32>,
    width: u32,
    height: u32,
    view_projection: Mat4,
}

impl HorizonBuffer {
    pub fn new(width: u32, height: u32) -> Self {
        let width = width.max(1);
        Self {
            heights: vec![0.0; width as usize],
            width,
            height: height.max(1),
            view_projection: Mat4::IDENTITY,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Clear the horizon and project with a new view-projection matrix
    pub fn reset(&mut self, view_projection: Mat4) {
        self.view_projection = view_projection;
        self.heights.fill(0.0);
    }

    /// Resize to a new viewport, clearing the horizon
    pub fn resize(&mut self, width: u32, height: u32) {
        self.width = width.max(1);
        self.height = height.max(1);
        self.heights = vec![0.0; self.width as usize];
    }

    pub fn column(&self, x: usize) -> Option<f32> {
        self.heights.get(x).copied()
    }

    /// Raise the horizon to cover the edge `a`-`b`
    pub fn draw_edge(&mut self, a: Vec3, b: Vec3) -> DrawResult {
        match self.project_edge(a, b) {
            Ok(edge) => {
                let limit = self.height as f32;
                for (column, y) in edge.columns() {
                    let slot = &mut self.heights[column];
                    *slot = slot.max(y.min(limit));
                }
                DrawResult::Visible
            }
            Err(result) => result,
        }
    }

    /// Check whether any part of the edge `a`-`b` rises above the horizon
    pub fn test_edge(&self, a: Vec3, b: Vec3) -> DrawResult {
        match self.project_edge(a, b) {
            Ok(edge) => {
                let visible = edge.columns().any(|(column, y)| y > self.heights[column]);
                if visible { DrawResult::Visible } else { DrawResult::Occluded }
            }
            Err(result) => result,
        }
    }

    /// Rasterize the closed outline of a quad
    pub fn draw_quad(&mut self, points: &[Vec3; 4]) {
        for i in 0..4 {
            self.draw_edge(points[i], points[(i + 1) % 4]);
        }
    }

    /// Test the closed outline of a quad.
    ///
    /// The quad is occluded only if no edge is visible and at least one edge
    /// could actually be tested.
    pub fn test_quad(&self, points: &[Vec3; 4]) -> QuadVisibility {
        let mut tested = false;
        for i in 0..4 {
            match self.test_edge(points[i], points[(i + 1) % 4]) {
                DrawResult::Visible => return QuadVisibility::Visible,
                DrawResult::Occluded => tested = true,
                DrawResult::Clipped | DrawResult::Invalid => {}
            }
        }
        if tested { QuadVisibility::Occluded } else { QuadVisibility::Untested }
    }

    /// Clip against the near plane and project to screen space
    fn project_edge(&self, a: Vec3, b: Vec3) -> Result<ScreenEdge, DrawResult> {
        let mut ca = self.view_projection * Vec4::new(a.x, a.y, a.z, 1.0);
        let mut cb = self.view_projection * Vec4::new(b.x, b.y, b.z, 1.0);

        if ca.z < 0.0 && cb.z < 0.0 {
            return Err(DrawResult::Clipped);
        }
        if ca.z < 0.0 {
            ca = ca + (cb - ca) * (ca.z / (ca.z - cb.z));
        } else if cb.z < 0.0 {
            cb = cb + (ca - cb) * (cb.z / (cb.z - ca.z));
        }
        if ca.w <= f32::EPSILON || cb.w <= f32::EPSILON {
            return Err(DrawResult::Clipped);
        }

        let half_w = self.width as f32 * 0.5;
        let half_h = self.height as f32 * 0.5;
        let to_screen = |c: Vec4| ((c.x / c.w + 1.0) * half_w, (c.y / c.w + 1.0) * half_h);
        let (x1, y1) = to_screen(ca);
        let (x2, y2) = to_screen(cb);

        if !(x2 - x1 > f32::EPSILON) {
            return Err(DrawResult::Invalid);
        }
        if x2 < 0.0 || x1 >= self.width as f32 {
            return Err(DrawResult::Clipped);
        }

        // Columns whose centers lie on the edge
        let first = (x1 - 0.5).ceil().max(0.0);
        let last = (x2 - 0.5).floor().min(self.width as f32 - 1.0);
        if first > last {
            return Err(DrawResult::Clipped);
        }

        Ok(ScreenEdge {
            first: first as usize,
            last: last as usize,
            x1,
            y1,
            slope: (y2 - y1) / (x2 - x1),
        })
    }
}

/// Reverse the winding of a quad outline
pub fn flipped(points: &[Vec3; 4]) -> [Vec3; 4] {
    [points[0], points[3], points[2], points[1]]
}

struct ScreenEdge {
    first: usize,
    last: usize,
    x1: f32,
    y1: f32,
    slope: f32,
}

impl ScreenEdge {
    fn columns(&self) -> impl Iterator<Item = (usize, f32)> + '_ {
        (self.first..=self.last).map(|c| (c, self.y1 + (c as f32 + 0.5 - self.x1) * self.slope))
    }
}
