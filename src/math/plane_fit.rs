//! Least-squares height plane fitting for horizon occlusion geometry

use crate::core::types::Vec3;

/// Plane expressed as a height function `y = slope_x * x + slope_z * z + offset`
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct HeightPlane {
    pub slope_x: f32,
    pub slope_z: f32,
    pub offset: f32,
}

impl HeightPlane {
    pub fn flat(height: f32) -> Self {
        Self { slope_x: 0.0, slope_z: 0.0, offset: height }
    }

    pub fn height_at(&self, x: f32, z: f32) -> f32 {
        self.slope_x * x + self.slope_z * z + self.offset
    }

    /// Upward-facing unit normal
    pub fn normal(&self) -> Vec3 {
        Vec3::new(-self.slope_x, 1.0, -self.slope_z).normalize()
    }

    /// Angle between two planes' normals in radians
    pub fn angle_to(&self, other: &HeightPlane) -> f32 {
        self.normal().dot(other.normal()).clamp(-1.0, 1.0).acos()
    }

    /// Same orientation, shifted so it passes through the lowest point
    pub fn supporting_below(&self, points: &[Vec3]) -> HeightPlane {
        let shift = points
            .iter()
            .map(|p| p.y - self.height_at(p.x, p.z))
            .fold(f32::INFINITY, f32::min);
        self.shifted(if shift.is_finite() { shift } else { 0.0 })
    }

    /// Same orientation, shifted so it passes through the highest point
    pub fn supporting_above(&self, points: &[Vec3]) -> HeightPlane {
        let shift = points
            .iter()
            .map(|p| p.y - self.height_at(p.x, p.z))
            .fold(f32::NEG_INFINITY, f32::max);
        self.shifted(if shift.is_finite() { shift } else { 0.0 })
    }

    fn shifted(&self, amount: f32) -> HeightPlane {
        HeightPlane { offset: self.offset + amount, ..*self }
    }
}

/// Running sums for a least-squares fit of `y = a x + b z + c`
#[derive(Clone, Copy, Debug, Default)]
pub struct PlaneFit {
    count: f64,
    sx: f64,
    sz: f64,
    sy: f64,
    sxx: f64,
    sxz: f64,
    szz: f64,
    sxy: f64,
    szy: f64,
}

impl PlaneFit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, p: Vec3) {
        let (x, y, z) = (p.x as f64, p.y as f64, p.z as f64);
        self.count += 1.0;
        self.sx += x;
        self.sz += z;
        self.sy += y;
        self.sxx += x * x;
        self.sxz += x * z;
        self.szz += z * z;
        self.sxy += x * y;
        self.szy += z * y;
    }

    pub fn extend(&mut self, points: &[Vec3]) {
        for p in points {
            self.add(*p);
        }
    }

    /// Solve the normal equations.
    ///
    /// Collinear or single-point inputs fall back to a flat plane at the mean
    /// height; an empty fit yields a flat plane at zero.
    pub fn solve(&self) -> HeightPlane {
        if self.count == 0.0 {
            return HeightPlane::flat(0.0);
        }
        let mean_y = (self.sy / self.count) as f32;

        // | sxx sxz sx | |a|   |sxy|
        // | sxz szz sz | |b| = |szy|
        // | sx  sz  n  | |c|   |sy |
        let m = [
            [self.sxx, self.sxz, self.sx],
            [self.sxz, self.szz, self.sz],
            [self.sx, self.sz, self.count],
        ];
        let rhs = [self.sxy, self.szy, self.sy];
        let det = det3(&m);
        if det.abs() < 1e-9 {
            return HeightPlane::flat(mean_y);
        }

        let mut solution = [0.0f64; 3];
        for (col, value) in solution.iter_mut().enumerate() {
            let mut replaced = m;
            for row in 0..3 {
                replaced[row][col] = rhs[row];
            }
            *value = det3(&replaced) / det;
        }

        HeightPlane {
            slope_x: solution[0] as f32,
            slope_z: solution[1] as f32,
            offset: solution[2] as f32,
        }
    }
}

fn det3(m: &[[f64; 3]; 3]) -> f64 {
    m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
}
